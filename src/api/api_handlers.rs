use actix_web::{HttpResponse, web};
use tracing::debug;

use crate::api::api_objects::{HealthStatus, JobId, JobStatusResponse, ReadinessResponse, SubmitJobRequest, SubmitJobResponse};
use crate::error::ApiError;
use crate::scheduler::WorkerPool;

pub async fn handle_submit_job(
    request: web::Json<SubmitJobRequest>,
    pool: web::Data<WorkerPool>,
) -> Result<HttpResponse, ApiError> {
    // Admission only; execution happens in the background
    let submission = pool.submit(request.into_inner().messages)?;
    debug!(job_id = %submission.job.id, position = submission.position, "Job accepted");
    Ok(HttpResponse::Accepted().json(SubmitJobResponse {
        job_id: submission.job.id,
        status: submission.job.status,
        position: submission.position,
    }))
}

pub async fn handle_get_job(path: web::Path<JobId>, pool: web::Data<WorkerPool>) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let job = pool.status(&id).ok_or(ApiError::NotFound(id))?;
    Ok(HttpResponse::Ok().json(JobStatusResponse::from(job)))
}

pub async fn handle_health(pool: web::Data<WorkerPool>) -> HttpResponse {
    let health = pool.health();
    match health.status {
        HealthStatus::Error => HttpResponse::ServiceUnavailable().json(health),
        HealthStatus::Ok | HealthStatus::Degraded => HttpResponse::Ok().json(health),
    }
}

pub async fn handle_ready(pool: web::Data<WorkerPool>) -> HttpResponse {
    let ready = pool.is_ready();
    if ready {
        HttpResponse::Ok().json(ReadinessResponse { ready })
    } else {
        HttpResponse::ServiceUnavailable().json(ReadinessResponse { ready })
    }
}
