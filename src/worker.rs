use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use core_affinity::CoreId;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::api::api_objects::{JobId, JobResult, Message};
use crate::channel_objects::{TaskStatusMessage, ToWorkerMessage, WorkerReport};
use crate::engine::{EngineFactory, ExecutionEngine};

/// One execution slot: a dedicated OS thread with its own single-threaded
/// runtime and its own engine instance. A panic in the engine is caught
/// here and only fails the job being run.
pub struct Worker {
    pub worker_id: usize,
    tx: mpsc::UnboundedSender<ToWorkerMessage>,
}

impl Worker {
    pub fn spawn(
        worker_id: usize,
        core_id: Option<CoreId>,
        factory: Arc<dyn EngineFactory>,
        report_tx: mpsc::UnboundedSender<WorkerReport>,
    ) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name(format!("job-slot-{worker_id}"))
            .spawn(move || {
                let _exit = ExitGuard { worker_id, report_tx: report_tx.clone() };
                if let Some(core_id) = core_id {
                    if core_affinity::set_for_current(core_id) {
                        debug!(worker_id, core = core_id.id, "Slot pinned to core");
                    } else {
                        warn!(worker_id, core = core_id.id, "Failed to pin slot to core");
                    }
                }

                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(worker_id, error = %e, "Failed to build slot runtime");
                        return;
                    }
                };
                rt.block_on(run_slot(worker_id, factory, rx, report_tx));
            })?;

        Ok(Worker { worker_id, tx })
    }

    /// Hand a job to the slot. `false` if the slot's thread is gone.
    pub fn dispatch(&self, job_id: JobId, messages: Vec<Message>) -> bool {
        self.tx.send(ToWorkerMessage::Execute { job_id, messages }).is_ok()
    }

    /// Ask the slot to exit once its current job, if any, is finished.
    pub fn terminate(&self) {
        let _ = self.tx.send(ToWorkerMessage::Terminate);
    }
}

/// Reports the slot as exited however the thread ends, including unwinding.
struct ExitGuard {
    worker_id: usize,
    report_tx: mpsc::UnboundedSender<WorkerReport>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.report_tx.send(WorkerReport::Exited { slot_id: self.worker_id });
    }
}

async fn run_slot(
    worker_id: usize,
    factory: Arc<dyn EngineFactory>,
    mut rx: mpsc::UnboundedReceiver<ToWorkerMessage>,
    report_tx: mpsc::UnboundedSender<WorkerReport>,
) {
    let mut engine = match factory.create(worker_id) {
        Ok(engine) => engine,
        Err(e) => {
            error!(worker_id, error = %format!("{e:#}"), "Failed to create execution engine");
            return;
        }
    };
    info!(worker_id, "Slot started");

    while let Some(message) = rx.recv().await {
        match message {
            ToWorkerMessage::Execute { job_id, messages } => {
                debug!(worker_id, job_id = %job_id, "Executing job");
                let (result, panicked) = execute(engine.as_mut(), &messages).await;
                let report = TaskStatusMessage { slot_id: worker_id, job_id, result };
                if report_tx.send(WorkerReport::Finished(report)).is_err() {
                    break;
                }
                if panicked {
                    // the engine may hold broken state after unwinding
                    match factory.create(worker_id) {
                        Ok(fresh) => engine = fresh,
                        Err(e) => {
                            error!(worker_id, error = %format!("{e:#}"), "Failed to rebuild engine");
                            return;
                        }
                    }
                }
            }
            ToWorkerMessage::Terminate => break,
        }
    }
    info!(worker_id, "Slot stopped");
}

async fn execute(engine: &mut dyn ExecutionEngine, messages: &[Message]) -> (JobResult, bool) {
    // the call itself may panic before returning a future, so defer it
    match AssertUnwindSafe(async { engine.execute(messages).await }).catch_unwind().await {
        Ok(Ok(result)) => (result, false),
        Ok(Err(e)) => (JobResult::failure(format!("{e:#}")), false),
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            error!(reason = %reason, "Execution panicked");
            (JobResult::failure(format!("execution panicked: {reason}")), true)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
