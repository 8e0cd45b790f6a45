use serde::Serialize;

use crate::api::api_objects::{JobId, JobResult, JobStatus, Message};

/// Lifecycle notifications broadcast by the registry to any observer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum JobEvent {
    #[serde(rename_all = "camelCase")]
    Queued { job_id: JobId, position: usize },
    #[serde(rename_all = "camelCase")]
    Started { job_id: JobId },
    #[serde(rename_all = "camelCase")]
    Completed {
        job_id: JobId,
        status: JobStatus,
        error: Option<String>,
    },
    Cleanup { evicted: usize, remaining: usize },
}

/// Pool to slot.
#[derive(Debug, Clone)]
pub enum ToWorkerMessage {
    Execute { job_id: JobId, messages: Vec<Message> },
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Failed,
}

/// Slot to pool: the outcome of one execution.
#[derive(Debug, Clone)]
pub struct TaskStatusMessage {
    pub slot_id: usize,
    pub job_id: JobId,
    pub result: JobResult,
}

impl TaskStatusMessage {
    pub fn status(&self) -> Status {
        if self.result.success { Status::Success } else { Status::Failed }
    }
}

#[derive(Debug, Clone)]
pub enum WorkerReport {
    Finished(TaskStatusMessage),
    /// The slot's thread is gone, on request or because it died.
    Exited { slot_id: usize },
}
