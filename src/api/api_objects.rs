use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of messages accepted in a single job.
pub const MAX_MESSAGES_PER_JOB: usize = 100;
/// Maximum size in bytes of one message's content (10 KiB).
pub const MAX_MESSAGE_CONTENT_BYTES: usize = 10 * 1024;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Completed and failed jobs never change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Output of one engine run, consumed once by the completion transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub content: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResult {
    pub fn success(content: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            content: Some(content.into()),
            messages,
            success: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            content: None,
            messages: Vec::new(),
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Lifecycle record of a submitted unit of work. Owned by the registry,
/// callers only ever see clones.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub messages: Vec<Message>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<JobResult>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(messages: Vec<Message>, created_at: DateTime<Utc>) -> Self {
        Job {
            id: Uuid::new_v4(),
            messages,
            status: JobStatus::Queued,
            created_at,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    #[serde(flatten)]
    pub queue: QueueStats,
    pub workers: usize,
    pub available_workers: usize,
    pub busy_workers: usize,
}

// ---------- transport objects ----------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubmitJobRequest {
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub position: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        JobStatusResponse {
            job_id: job.id,
            status: job.status,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            result: job.result,
            error: job.error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Error,
}

/// What the pool can currently do with a new job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionCapacity {
    /// Zero workers configured on purpose; jobs wait to be drained elsewhere.
    Disabled,
    Available,
    /// Every live slot is busy.
    Saturated,
    /// Slots are configured but dead and not yet replaced.
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub execution: ExecutionCapacity,
    #[serde(flatten)]
    pub stats: PoolStats,
}

impl HealthResponse {
    pub fn from_stats(stats: PoolStats) -> Self {
        HealthResponse {
            status: health_status(&stats),
            execution: execution_capacity(&stats),
            stats,
        }
    }
}

pub fn execution_capacity(stats: &PoolStats) -> ExecutionCapacity {
    if stats.workers == 0 {
        ExecutionCapacity::Disabled
    } else if stats.available_workers > 0 {
        ExecutionCapacity::Available
    } else if stats.busy_workers > 0 {
        ExecutionCapacity::Saturated
    } else {
        ExecutionCapacity::Unavailable
    }
}

/// error: workers configured but none free. degraded: fewer than half free,
/// or the queue is deeper than five jobs per worker.
pub fn health_status(stats: &PoolStats) -> HealthStatus {
    if stats.workers == 0 {
        return HealthStatus::Ok;
    }
    if stats.available_workers == 0 {
        return HealthStatus::Error;
    }
    if stats.available_workers * 2 < stats.workers || stats.queue.queued > stats.workers * 5 {
        return HealthStatus::Degraded;
    }
    HealthStatus::Ok
}

/// Readiness is lost only when slots are configured and none is free.
pub fn is_ready(stats: &PoolStats) -> bool {
    !(stats.workers > 0 && stats.available_workers == 0)
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
}
