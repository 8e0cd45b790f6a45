use actix_web::{HttpResponse, error, web};
use serde_json::json;

use crate::api::api_handlers::{handle_get_job, handle_health, handle_ready, handle_submit_job};

/// Largest JSON request body accepted.
pub const MAX_JSON_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Route table. Expects a `web::Data<WorkerPool>` registered on the app.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .route("/jobs", web::post().to(handle_submit_job))
        .route("/jobs/{id}", web::get().to(handle_get_job))
        .route("/health", web::get().to(handle_health))
        .route("/ready", web::get().to(handle_ready));
}

fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(MAX_JSON_BODY_BYTES)
        .error_handler(|err, _req| {
            let body = json!({ "error": format!("malformed submission: {err}") });
            error::InternalError::from_response(err, HttpResponse::BadRequest().json(body)).into()
        })
}
