//! Job registry and FIFO admission queue.
//!
//! The registry is the only owner of job records. Every mutation runs under a
//! single mutex so that `add`, `start_job`, `complete_job`, `process_queue`
//! and the cleanup sweep observe one consistent view of the job map, the
//! queue and the running set.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use indexmap::{IndexMap, IndexSet};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::api::api_objects::{
    Job, JobId, JobResult, JobStatus, MAX_MESSAGE_CONTENT_BYTES, MAX_MESSAGES_PER_JOB, Message,
    QueueStats,
};
use crate::channel_objects::JobEvent;
use crate::clock::{Clock, SystemClock, to_delta};
use crate::error::AdmissionError;

/// Failure recorded on jobs force-completed by the cleanup sweep.
pub const WATCHDOG_ERROR: &str = "Job exceeded maximum execution time";

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Jobs allowed in `running` at once; normally the number of worker slots.
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    /// How long a finished job stays retrievable.
    pub job_ttl: Duration,
    pub max_execution_time: Duration,
    pub cleanup_interval: Duration,
    pub max_messages: usize,
    pub max_content_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_queue_size: 100,
            job_ttl: Duration::from_secs(3600),
            max_execution_time: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            max_messages: MAX_MESSAGES_PER_JOB,
            max_content_bytes: MAX_MESSAGE_CONTENT_BYTES,
        }
    }
}

/// An admitted job and the queue index it was given.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub job: Job,
    pub position: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub evicted: usize,
    pub timed_out: usize,
    pub remaining: usize,
}

struct RegistryState {
    jobs: IndexMap<JobId, Job>,
    queue: IndexSet<JobId>,
    running: HashSet<JobId>,
    dispatch_tx: Option<mpsc::UnboundedSender<JobId>>,
    accepting: bool,
}

pub struct JobRegistry {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<RegistryState>,
    events_tx: broadcast::Sender<JobEvent>,
}

impl JobRegistry {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        JobRegistry {
            config,
            clock,
            state: Mutex::new(RegistryState {
                jobs: IndexMap::new(),
                queue: IndexSet::new(),
                running: HashSet::new(),
                dispatch_tx: None,
                accepting: true,
            }),
            events_tx,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events_tx.subscribe()
    }

    /// Route "job available" notices to the returned receiver. Replaces any
    /// previously attached dispatcher.
    pub fn attach_dispatcher(&self) -> mpsc::UnboundedReceiver<JobId> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().dispatch_tx = Some(tx);
        rx
    }

    /// Validate and enqueue a job. Never waits for execution.
    pub fn add(&self, messages: Vec<Message>) -> Result<Submission, AdmissionError> {
        self.validate(&messages)
            .inspect_err(|e| warn!(error = %e, "Submission rejected"))?;

        let mut state = self.lock();
        if !state.accepting {
            return Err(AdmissionError::ShuttingDown);
        }
        if state.queue.len() >= self.config.max_queue_size {
            warn!(queued = state.queue.len(), "Submission rejected: queue full");
            return Err(AdmissionError::QueueFull { max: self.config.max_queue_size });
        }

        let job = Job::new(messages, self.clock.now());
        let position = state.queue.len();
        state.queue.insert(job.id);
        state.jobs.insert(job.id, job.clone());
        debug!(job_id = %job.id, position, "Job queued");
        self.emit(JobEvent::Queued { job_id: job.id, position });

        self.process_queue_locked(&state);
        Ok(Submission { job, position })
    }

    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.lock().jobs.get(id).cloned()
    }

    /// Claim a queued job. `None` when the job is unknown or not queued.
    pub fn start_job(&self, id: &JobId) -> Option<Job> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let job = state.jobs.get_mut(id).filter(|job| job.status == JobStatus::Queued)?;

        job.status = JobStatus::Running;
        job.started_at = Some(self.clock.now());
        state.queue.shift_remove(id);
        state.running.insert(*id);
        debug!(job_id = %id, running = state.running.len(), "Job started");
        self.emit(JobEvent::Started { job_id: *id });
        Some(job.clone())
    }

    /// Finish a running job. `None` when the job is unknown or not running,
    /// which is what a late or duplicate completion sees.
    pub fn complete_job(&self, id: &JobId, result: JobResult) -> Option<Job> {
        let mut state = self.lock();
        self.complete_locked(&mut state, id, result)
    }

    /// Offer the head of the queue to the dispatcher if a concurrency unit is
    /// free. Peeks only; the job stays queued until `start_job` claims it.
    pub fn process_queue(&self) {
        let state = self.lock();
        self.process_queue_locked(&state);
    }

    pub fn queue_position(&self, id: &JobId) -> Option<usize> {
        self.lock().queue.get_index_of(id)
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        let mut stats = QueueStats {
            queued: state.queue.len(),
            running: state.running.len(),
            total: state.jobs.len(),
            ..Default::default()
        };
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Queued | JobStatus::Running => {}
            }
        }
        stats
    }

    pub fn running_ids(&self) -> Vec<JobId> {
        self.lock().running.iter().copied().collect()
    }

    /// Queued ids in FIFO order.
    pub fn queued_ids(&self) -> Vec<JobId> {
        self.lock().queue.iter().copied().collect()
    }

    /// Refuse all further submissions.
    pub fn close_admissions(&self) {
        self.lock().accepting = false;
        info!("Job admissions closed");
    }

    pub fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    /// One sweep: fail jobs that ran too long, evict finished jobs past TTL.
    pub fn cleanup(&self) -> CleanupReport {
        let mut state = self.lock();
        let now = self.clock.now();
        let ttl = to_delta(self.config.job_ttl);
        let max_execution = to_delta(self.config.max_execution_time);

        let mut expired = HashSet::new();
        let mut stuck = Vec::new();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Completed | JobStatus::Failed => {
                    if job.completed_at.is_some_and(|at| now - at > ttl) {
                        expired.insert(job.id);
                    }
                }
                JobStatus::Running => {
                    if job.started_at.is_some_and(|at| now - at > max_execution) {
                        stuck.push(job.id);
                    }
                }
                JobStatus::Queued => {}
            }
        }

        for id in &stuck {
            warn!(job_id = %id, "Job exceeded maximum execution time, marking failed");
            self.complete_locked(&mut state, id, JobResult::failure(WATCHDOG_ERROR));
        }

        if !expired.is_empty() {
            state.jobs.retain(|id, _| !expired.contains(id));
        }

        let report = CleanupReport {
            evicted: expired.len(),
            timed_out: stuck.len(),
            remaining: state.jobs.len(),
        };
        if report.evicted > 0 {
            info!(evicted = report.evicted, remaining = report.remaining, "Cleaned up expired jobs");
            self.emit(JobEvent::Cleanup { evicted: report.evicted, remaining: report.remaining });
        }
        report
    }

    /// Run `cleanup` every `cleanup_interval` until the task is stopped.
    pub fn spawn_cleanup(self: &Arc<Self>) -> CleanupTask {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let registry = Arc::clone(self);
        let period = self.config.cleanup_interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.cleanup();
                    }
                }
            }
            debug!("Cleanup task stopped");
        });

        CleanupTask { cancel, handle }
    }

    fn validate(&self, messages: &[Message]) -> Result<(), AdmissionError> {
        if messages.is_empty() {
            return Err(AdmissionError::EmptyMessages);
        }
        if messages.len() > self.config.max_messages {
            return Err(AdmissionError::TooManyMessages {
                count: messages.len(),
                max: self.config.max_messages,
            });
        }
        if let Some((index, msg)) = messages
            .iter()
            .enumerate()
            .find(|(_, msg)| msg.content.len() > self.config.max_content_bytes)
        {
            return Err(AdmissionError::ContentTooLarge {
                index,
                size: msg.content.len(),
                max: self.config.max_content_bytes,
            });
        }
        Ok(())
    }

    fn complete_locked(&self, state: &mut RegistryState, id: &JobId, result: JobResult) -> Option<Job> {
        let job = state.jobs.get_mut(id).filter(|job| job.status == JobStatus::Running)?;

        if result.success {
            job.status = JobStatus::Completed;
            job.error = None;
        } else {
            job.status = JobStatus::Failed;
            job.error = Some(result.error.clone().unwrap_or_else(|| "Job failed".to_string()));
        }
        job.completed_at = Some(self.clock.now());
        job.result = Some(result);
        let job = job.clone();

        state.running.remove(id);
        debug!(job_id = %id, status = job.status.as_str(), "Job completed");
        self.emit(JobEvent::Completed {
            job_id: *id,
            status: job.status,
            error: job.error.clone(),
        });

        self.process_queue_locked(state);
        Some(job)
    }

    fn process_queue_locked(&self, state: &RegistryState) {
        if state.running.len() >= self.config.max_concurrent {
            return;
        }
        let Some(head) = state.queue.first() else {
            return;
        };
        if let Some(tx) = &state.dispatch_tx {
            if tx.send(*head).is_err() {
                trace!(job_id = %head, "No dispatcher listening");
            }
        }
    }

    fn emit(&self, event: JobEvent) {
        // no subscribers is fine
        let _ = self.events_tx.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            warn!("Registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// Handle to the background cleanup sweep.
pub struct CleanupTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl CleanupTask {
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.handle).await {
            warn!(error = %e, "Cleanup task ended abnormally");
        }
    }
}

/// A dropped handle still ends the sweep, releasing the registry.
impl Drop for CleanupTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
