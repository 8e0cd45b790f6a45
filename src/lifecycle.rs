//! Process lifecycle: serve HTTP until a termination signal, then shut down
//! in order under a force-exit timer.

use std::sync::Arc;
use std::time::Duration;

use actix_web::dev::ServerHandle;
use actix_web::{App, HttpServer, web};
use anyhow::Context;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::api::api_functions::configure;
use crate::scheduler::WorkerPool;
use crate::utils::Config;

/// Extra time the force-exit timer allows beyond the grace period.
pub const FORCE_EXIT_MARGIN: Duration = Duration::from_secs(5);

/// Serve until Ctrl+C or SIGTERM. Returns `Ok(false)` when shutdown did not
/// finish cleanly within the grace period.
pub async fn run(config: &Config, pool: Arc<WorkerPool>) -> anyhow::Result<bool> {
    let grace = config.shutdown_grace();
    let data = web::Data::from(Arc::clone(&pool));
    let server = HttpServer::new(move || App::new().app_data(data.clone()).configure(configure))
        .disable_signals()
        .shutdown_timeout(grace.as_secs())
        .bind(config.bind_addr())
        .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?
        .run();
    info!(host = %config.host, port = config.port, "HTTP server listening");

    let handle = server.handle();
    let mut server_task = tokio::spawn(server);

    tokio::select! {
        result = &mut server_task => {
            // the server stopped on its own
            match result {
                Ok(Ok(())) => warn!("HTTP server exited"),
                Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
                Err(e) => error!(error = %e, "HTTP server task panicked"),
            }
            Ok(shutdown(&pool, None, grace).await)
        }
        _ = shutdown_signal() => {
            let clean = shutdown(&pool, Some(handle), grace).await;
            let _ = server_task.await;
            Ok(clean)
        }
    }
}

/// Ordered shutdown, all steps sharing one `grace` budget. Queued jobs are
/// not started; only jobs already running are waited for. Returns whether
/// they all finished and every slot stopped in time.
pub async fn shutdown(pool: &WorkerPool, server: Option<ServerHandle>, grace: Duration) -> bool {
    let force_exit = arm_force_exit(grace + FORCE_EXIT_MARGIN);
    let deadline = Instant::now() + grace;
    let remaining = || deadline.saturating_duration_since(Instant::now());

    info!(grace_secs = grace.as_secs(), "Shutting down");
    pool.registry().close_admissions();
    pool.stop_dispatch().await;
    if let Some(server) = server {
        if tokio::time::timeout(remaining(), server.stop(true)).await.is_ok() {
            info!("HTTP server stopped");
        } else {
            warn!("HTTP server did not stop in time");
        }
    }

    let drained = pool.wait_for_idle(remaining()).await;
    if drained {
        info!("All running jobs finished");
    }
    let terminated = pool.terminate_within(remaining()).await;

    force_exit.abort();
    let clean = drained && terminated;
    if clean {
        info!(left_queued = pool.stats().queue.queued, "Shutdown complete");
    } else {
        warn!(drained, terminated, "Shutdown finished with work still in flight");
    }
    clean
}

fn arm_force_exit(after: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        error!(after_secs = after.as_secs(), "Graceful shutdown stalled, forcing exit");
        std::process::exit(1);
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::api_objects::{JobResult, JobStatus, Message};
    use crate::engine::FnEngine;
    use crate::error::AdmissionError;
    use crate::scheduler::PoolConfig;

    fn slow_pool(delay: Duration) -> WorkerPool {
        let factory = Arc::new(FnEngine::new(move |_: &[Message]| {
            std::thread::sleep(delay);
            Ok(JobResult::success("done", vec![]))
        }));
        let config = PoolConfig { workers: 1, shutdown_grace: Duration::from_secs(2), ..Default::default() };
        WorkerPool::new(factory, config).unwrap()
    }

    #[tokio::test]
    async fn shutdown_lets_running_jobs_finish() {
        let pool = slow_pool(Duration::from_millis(100));
        let id = pool.submit(vec![Message::user("work")]).unwrap().job.id;
        while pool.status(&id).unwrap().status == JobStatus::Queued {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(shutdown(&pool, None, Duration::from_secs(2)).await);
        assert_eq!(pool.status(&id).unwrap().status, JobStatus::Completed);
        assert_eq!(pool.submit(vec![Message::user("late")]), Err(AdmissionError::ShuttingDown));
    }

    #[tokio::test]
    async fn shutdown_does_not_start_the_backlog() {
        let pool = slow_pool(Duration::from_millis(100));
        let ids: Vec<_> = (0..6).map(|_| pool.submit(vec![Message::user("work")]).unwrap().job.id).collect();
        while pool.status(&ids[0]).unwrap().status == JobStatus::Queued {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(shutdown(&pool, None, Duration::from_millis(500)).await);
        assert_eq!(pool.status(&ids[0]).unwrap().status, JobStatus::Completed);
        for id in &ids[1..] {
            let job = pool.status(id).unwrap();
            assert_eq!(job.status, JobStatus::Queued);
            assert!(job.started_at.is_none());
        }
    }

    #[tokio::test]
    async fn shutdown_steps_share_one_grace_period() {
        let pool = slow_pool(Duration::from_millis(800));
        let id = pool.submit(vec![Message::user("work")]).unwrap().job.id;
        while pool.status(&id).unwrap().status == JobStatus::Queued {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // the pool's own grace is 2s; the whole sequence must still respect 100ms
        let started = std::time::Instant::now();
        assert!(!shutdown(&pool, None, Duration::from_millis(100)).await);
        assert!(started.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn shutdown_reports_jobs_left_running() {
        let pool = slow_pool(Duration::from_millis(500));
        let id = pool.submit(vec![Message::user("work")]).unwrap().job.id;
        while pool.status(&id).unwrap().status == JobStatus::Queued {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(!shutdown(&pool, None, Duration::from_millis(50)).await);
    }
}
