//! Worker pool: bridges "job available" notices from the registry to a fixed
//! set of execution slots and reports outcomes back.
//!
//! All slot bookkeeping lives in one task ([`SchedulerEngine`]) fed by three
//! channels: offers from the registry, reports from slots, and commands from
//! the [`WorkerPool`] handle. Nothing here holds the registry lock while a
//! job executes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use core_affinity::CoreId;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::api::api_objects::{HealthResponse, Job, JobId, JobResult, Message, PoolStats, is_ready};
use crate::channel_objects::{Status, TaskStatusMessage, WorkerReport};
use crate::engine::EngineFactory;
use crate::error::AdmissionError;
use crate::requests_queue::{CleanupTask, JobRegistry, QueueConfig, Submission};
use crate::worker::Worker;

/// Failure recorded when a slot dies while running a job.
pub const SLOT_EXITED_ERROR: &str = "Execution slot exited while running the job";

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Zero is valid: jobs are admitted but never executed here.
    pub workers: usize,
    pub pin_cores: bool,
    pub shutdown_grace: Duration,
    /// Delay before a dead slot is replaced.
    pub respawn_delay: Duration,
    pub queue: QueueConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            pin_cores: false,
            shutdown_grace: Duration::from_secs(30),
            respawn_delay: Duration::from_secs(1),
            queue: QueueConfig::default(),
        }
    }
}

enum PoolCommand {
    /// Stop starting jobs; running ones finish normally.
    StopDispatch(oneshot::Sender<()>),
    Terminate(oneshot::Sender<()>),
}

#[derive(Default)]
struct SlotCounters {
    available: AtomicUsize,
    busy: AtomicUsize,
    /// Set once every slot has exited after a terminate request.
    stopped: AtomicBool,
}

pub struct WorkerPool {
    registry: Arc<JobRegistry>,
    workers: usize,
    shutdown_grace: Duration,
    counters: Arc<SlotCounters>,
    commands: mpsc::UnboundedSender<PoolCommand>,
    cleanup: Mutex<Option<CleanupTask>>,
}

impl WorkerPool {
    /// Build a pool with its own registry, limited to one running job per slot.
    /// Must be called from within a tokio runtime.
    pub fn new(factory: Arc<dyn EngineFactory>, config: PoolConfig) -> anyhow::Result<Self> {
        let mut queue = config.queue.clone();
        queue.max_concurrent = config.workers;
        let registry = Arc::new(JobRegistry::new(queue));
        Self::with_registry(factory, config, registry)
    }

    /// Build a pool around an existing registry, whose limits are kept as-is.
    pub fn with_registry(
        factory: Arc<dyn EngineFactory>,
        config: PoolConfig,
        registry: Arc<JobRegistry>,
    ) -> anyhow::Result<Self> {
        let core_ids = if config.pin_cores {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let (respawn_tx, respawn_rx) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();

        let mut slots = Vec::with_capacity(config.workers);
        for slot_id in 0..config.workers {
            let core_id = pick_core(&core_ids, slot_id);
            let worker = Worker::spawn(slot_id, core_id, Arc::clone(&factory), report_tx.clone())
                .with_context(|| format!("failed to spawn execution slot {slot_id}"))?;
            slots.push(Slot { worker: Some(worker), busy: None });
        }

        let counters = Arc::new(SlotCounters::default());
        let offers = registry.attach_dispatcher();
        let engine = SchedulerEngine {
            registry: Arc::clone(&registry),
            factory,
            slots,
            core_ids,
            report_tx,
            respawn_tx,
            respawn_delay: config.respawn_delay,
            counters: Arc::clone(&counters),
            dispatching: true,
            stopping: false,
            terminate_acks: Vec::new(),
        };
        engine.publish_counts();
        tokio::spawn(engine.run(offers, report_rx, respawn_rx, command_rx));

        let cleanup = registry.spawn_cleanup();
        info!(workers = config.workers, "Worker pool started");
        // pick up anything queued before the dispatcher was attached
        registry.process_queue();

        Ok(WorkerPool {
            registry,
            workers: config.workers,
            shutdown_grace: config.shutdown_grace,
            counters,
            commands,
            cleanup: Mutex::new(Some(cleanup)),
        })
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn submit(&self, messages: Vec<Message>) -> Result<Submission, AdmissionError> {
        self.registry.add(messages)
    }

    pub fn status(&self, id: &JobId) -> Option<Job> {
        self.registry.get(id)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            queue: self.registry.stats(),
            workers: self.workers,
            available_workers: self.counters.available.load(Ordering::Acquire),
            busy_workers: self.counters.busy.load(Ordering::Acquire),
        }
    }

    pub fn health(&self) -> HealthResponse {
        HealthResponse::from_stats(self.stats())
    }

    pub fn is_ready(&self) -> bool {
        is_ready(&self.stats())
    }

    /// Wait until no job is running, or `timeout` elapses. Returns whether
    /// the running set drained.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let running = self.registry.running_ids().len();
            if running == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(running, "Timed out waiting for running jobs");
                return false;
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }

    /// Stop handing queued jobs to slots. Jobs already running are left to
    /// finish; queued ones stay queued. Once this returns no further job
    /// will be started.
    pub async fn stop_dispatch(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(PoolCommand::StopDispatch(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        info!(queued = self.registry.stats().queued, "Dispatch stopped");
    }

    /// Stop dispatching, stop the cleanup sweep and ask every slot to exit.
    /// Resolves once all slots acknowledged or the grace period elapsed;
    /// returns `false` on timeout.
    pub async fn terminate(&self) -> bool {
        self.terminate_within(self.shutdown_grace).await
    }

    /// [`terminate`](Self::terminate) bounded by `timeout` instead of the
    /// configured grace period.
    pub async fn terminate_within(&self, timeout: Duration) -> bool {
        let cleanup = self.cleanup.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = cleanup {
            task.stop().await;
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(PoolCommand::Terminate(ack_tx)).is_err() {
            return true;
        }
        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(())) => {
                info!("Worker pool terminated");
                true
            }
            // the loop finished before reading this request
            Ok(Err(_)) if self.counters.stopped.load(Ordering::Acquire) => true,
            Ok(Err(_)) => {
                warn!("Scheduler stopped without acknowledging termination");
                false
            }
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Execution slots did not stop in time"
                );
                false
            }
        }
    }
}

struct Slot {
    worker: Option<Worker>,
    busy: Option<JobId>,
}

impl Slot {
    fn is_free(&self) -> bool {
        self.worker.is_some() && self.busy.is_none()
    }
}

pub struct SchedulerEngine {
    registry: Arc<JobRegistry>,
    factory: Arc<dyn EngineFactory>,
    slots: Vec<Slot>,
    core_ids: Vec<CoreId>,
    report_tx: mpsc::UnboundedSender<WorkerReport>,
    respawn_tx: mpsc::UnboundedSender<usize>,
    respawn_delay: Duration,
    counters: Arc<SlotCounters>,
    dispatching: bool,
    stopping: bool,
    terminate_acks: Vec<oneshot::Sender<()>>,
}

impl SchedulerEngine {
    async fn run(
        mut self,
        mut offers: mpsc::UnboundedReceiver<JobId>,
        mut reports: mpsc::UnboundedReceiver<WorkerReport>,
        mut respawns: mpsc::UnboundedReceiver<usize>,
        mut commands: mpsc::UnboundedReceiver<PoolCommand>,
    ) {
        let mut commands_open = true;
        loop {
            tokio::select! {
                Some(job_id) = offers.recv() => self.handle_offer(job_id),
                Some(report) = reports.recv() => {
                    if self.handle_report(report) {
                        break;
                    }
                }
                Some(slot_id) = respawns.recv() => self.respawn(slot_id),
                command = commands.recv(), if commands_open => {
                    let ack = match command {
                        Some(PoolCommand::StopDispatch(ack)) => {
                            self.dispatching = false;
                            let _ = ack.send(());
                            continue;
                        }
                        Some(PoolCommand::Terminate(ack)) => Some(ack),
                        None => {
                            // the pool handle was dropped
                            commands_open = false;
                            None
                        }
                    };
                    if self.begin_shutdown(ack) {
                        break;
                    }
                }
                else => break,
            }
        }
        debug!("Scheduler loop exited");
    }

    fn handle_offer(&mut self, job_id: JobId) {
        if self.stopping || !self.dispatching {
            return;
        }
        let Some(slot_id) = self.slots.iter().position(Slot::is_free) else {
            trace!(job_id = %job_id, "No free slot, job stays queued");
            return;
        };
        // whoever wins start_job owns the job; a stale offer just misses
        let Some(job) = self.registry.start_job(&job_id) else {
            return;
        };

        let slot = &mut self.slots[slot_id];
        let dispatched = slot.worker.as_ref().is_some_and(|w| w.dispatch(job.id, job.messages));
        if dispatched {
            debug!(job_id = %job.id, slot_id, "Job dispatched");
            slot.busy = Some(job.id);
        } else {
            // the thread is gone; its exit report will schedule a replacement
            warn!(job_id = %job.id, slot_id, "Slot unreachable at dispatch");
            slot.worker = None;
            self.registry.complete_job(&job.id, JobResult::failure(SLOT_EXITED_ERROR));
        }
        self.publish_counts();
        self.registry.process_queue();
    }

    /// Returns `true` once shutdown is complete.
    fn handle_report(&mut self, report: WorkerReport) -> bool {
        match report {
            WorkerReport::Finished(msg) => {
                self.finish(msg);
                false
            }
            WorkerReport::Exited { slot_id } => self.slot_exited(slot_id),
        }
    }

    fn finish(&mut self, msg: TaskStatusMessage) {
        let status = msg.status();
        let TaskStatusMessage { slot_id, job_id, result } = msg;
        match status {
            Status::Success => info!(job_id = %job_id, slot_id, "Job succeeded"),
            Status::Failed => info!(job_id = %job_id, slot_id, error = ?result.error, "Job failed"),
        }
        if self.registry.complete_job(&job_id, result).is_none() {
            debug!(job_id = %job_id, "Job was no longer running, outcome discarded");
        }
        if let Some(slot) = self.slots.get_mut(slot_id) {
            if slot.busy == Some(job_id) {
                slot.busy = None;
            }
        }
        self.publish_counts();
        if self.dispatching {
            self.registry.process_queue();
        }
    }

    fn slot_exited(&mut self, slot_id: usize) -> bool {
        let Some(slot) = self.slots.get_mut(slot_id) else {
            return false;
        };
        slot.worker = None;
        if let Some(job_id) = slot.busy.take() {
            self.registry.complete_job(&job_id, JobResult::failure(SLOT_EXITED_ERROR));
        }
        self.publish_counts();

        if self.stopping {
            debug!(slot_id, "Slot acknowledged shutdown");
            return self.all_slots_stopped();
        }
        error!(slot_id, "Execution slot exited unexpectedly, scheduling replacement");
        self.schedule_respawn(slot_id);
        false
    }

    fn respawn(&mut self, slot_id: usize) {
        if self.stopping || self.slots.get(slot_id).is_none_or(|slot| slot.worker.is_some()) {
            return;
        }
        let core_id = pick_core(&self.core_ids, slot_id);
        match Worker::spawn(slot_id, core_id, Arc::clone(&self.factory), self.report_tx.clone()) {
            Ok(worker) => {
                info!(slot_id, "Execution slot replaced");
                self.slots[slot_id].worker = Some(worker);
                self.publish_counts();
                self.registry.process_queue();
            }
            Err(e) => {
                error!(slot_id, error = %e, "Failed to respawn execution slot");
                self.schedule_respawn(slot_id);
            }
        }
    }

    fn schedule_respawn(&self, slot_id: usize) {
        let tx = self.respawn_tx.clone();
        let delay = self.respawn_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(slot_id);
        });
    }

    fn begin_shutdown(&mut self, ack: Option<oneshot::Sender<()>>) -> bool {
        self.stopping = true;
        self.dispatching = false;
        self.terminate_acks.extend(ack);
        for slot in &self.slots {
            if let Some(worker) = &slot.worker {
                worker.terminate();
            }
        }
        self.all_slots_stopped()
    }

    fn all_slots_stopped(&mut self) -> bool {
        if self.slots.iter().any(|slot| slot.worker.is_some()) {
            return false;
        }
        self.counters.stopped.store(true, Ordering::Release);
        for ack in self.terminate_acks.drain(..) {
            let _ = ack.send(());
        }
        true
    }

    fn publish_counts(&self) {
        let available = self.slots.iter().filter(|slot| slot.is_free()).count();
        let busy = self
            .slots
            .iter()
            .filter(|slot| slot.worker.is_some() && slot.busy.is_some())
            .count();
        self.counters.available.store(available, Ordering::Release);
        self.counters.busy.store(busy, Ordering::Release);
    }
}

fn pick_core(core_ids: &[CoreId], slot_id: usize) -> Option<CoreId> {
    if core_ids.is_empty() {
        None
    } else {
        Some(core_ids[slot_id % core_ids.len()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::api_objects::{ExecutionCapacity, HealthStatus, JobStatus};
    use crate::clock::ManualClock;
    use crate::engine::{ExecutionEngine, FnEngine};
    use crate::requests_queue::WATCHDOG_ERROR;

    fn config(workers: usize) -> PoolConfig {
        PoolConfig {
            workers,
            shutdown_grace: Duration::from_secs(5),
            respawn_delay: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn echo() -> Arc<dyn EngineFactory> {
        Arc::new(FnEngine::new(|m: &[Message]| Ok(JobResult::success(m[0].content.clone(), m.to_vec()))))
    }

    /// Engine that blocks until the returned flag is raised.
    fn gated() -> (Arc<dyn EngineFactory>, Arc<AtomicBool>) {
        let release = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&release);
        let factory = FnEngine::new(move |_: &[Message]| {
            while !flag.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(JobResult::success("released", vec![]))
        });
        (Arc::new(factory), release)
    }

    async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn status_of(pool: &WorkerPool, id: &JobId) -> JobStatus {
        pool.status(id).unwrap().status
    }

    #[tokio::test]
    async fn submitted_jobs_run_to_completion() {
        let pool = WorkerPool::new(echo(), config(2)).unwrap();
        let ids: Vec<_> = (0..6)
            .map(|i| pool.submit(vec![Message::user(format!("job {i}"))]).unwrap().job.id)
            .collect();

        wait_until("all jobs to complete", || pool.stats().queue.completed == 6).await;
        for (i, id) in ids.iter().enumerate() {
            let job = pool.status(id).unwrap();
            assert_eq!(job.status, JobStatus::Completed);
            assert_eq!(job.result.unwrap().content, Some(format!("job {i}")));
        }
        assert_eq!(pool.stats().available_workers, 2);
        assert!(pool.terminate().await);
    }

    #[tokio::test]
    async fn running_jobs_never_exceed_slot_count() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let factory = Arc::new(FnEngine::new(move |_: &[Message]| {
            let now = a.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            a.fetch_sub(1, Ordering::SeqCst);
            Ok(JobResult::success("ok", vec![]))
        }));
        let pool = WorkerPool::new(factory, config(3)).unwrap();
        for _ in 0..12 {
            pool.submit(vec![Message::user("work")]).unwrap();
        }

        wait_until("all jobs to complete", || pool.stats().queue.completed == 12).await;
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(pool.terminate().await);
    }

    #[tokio::test]
    async fn single_slot_runs_jobs_in_submission_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let factory = Arc::new(FnEngine::new(move |m: &[Message]| {
            seen.lock().unwrap().push(m[0].content.clone());
            Ok(JobResult::success("ok", vec![]))
        }));
        let pool = WorkerPool::new(factory, config(1)).unwrap();
        for i in 0..5 {
            pool.submit(vec![Message::user(i.to_string())]).unwrap();
        }

        wait_until("all jobs to complete", || pool.stats().queue.completed == 5).await;
        assert_eq!(*order.lock().unwrap(), vec!["0", "1", "2", "3", "4"]);
        assert!(pool.terminate().await);
    }

    #[tokio::test]
    async fn failures_are_recorded_and_do_not_stop_the_pool() {
        let factory = Arc::new(FnEngine::new(|m: &[Message]| match m[0].content.as_str() {
            "panic" => panic!("slot crash"),
            "fail" => Ok(JobResult::failure("engine refused")),
            _ => Ok(JobResult::success("ok", vec![])),
        }));
        let pool = WorkerPool::new(factory, config(1)).unwrap();
        let crashed = pool.submit(vec![Message::user("panic")]).unwrap().job.id;
        let refused = pool.submit(vec![Message::user("fail")]).unwrap().job.id;
        let fine = pool.submit(vec![Message::user("fine")]).unwrap().job.id;

        wait_until("the last job", || status_of(&pool, &fine) == JobStatus::Completed).await;
        let crashed = pool.status(&crashed).unwrap();
        assert_eq!(crashed.status, JobStatus::Failed);
        assert!(crashed.error.unwrap().contains("slot crash"));
        assert_eq!(pool.status(&refused).unwrap().error.as_deref(), Some("engine refused"));
        assert!(pool.terminate().await);
    }

    #[tokio::test]
    async fn zero_workers_keeps_jobs_queued_and_stays_ready() {
        let pool = WorkerPool::new(echo(), config(0)).unwrap();
        let id = pool.submit(vec![Message::user("hello")]).unwrap().job.id;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(status_of(&pool, &id), JobStatus::Queued);
        let stats = pool.stats();
        assert_eq!((stats.workers, stats.available_workers), (0, 0));
        assert!(pool.is_ready());
        let health = pool.health();
        assert_eq!(health.status, HealthStatus::Ok);
        assert_eq!(health.execution, ExecutionCapacity::Disabled);
        assert!(pool.terminate().await);
    }

    #[tokio::test]
    async fn saturated_pool_is_not_ready() {
        let (factory, release) = gated();
        let pool = WorkerPool::new(factory, config(1)).unwrap();
        let id = pool.submit(vec![Message::user("block")]).unwrap().job.id;

        wait_until("the job to start", || status_of(&pool, &id) == JobStatus::Running).await;
        wait_until("the slot to be busy", || pool.stats().busy_workers == 1).await;
        assert!(!pool.is_ready());
        assert_eq!(pool.health().execution, ExecutionCapacity::Saturated);

        let queued = pool.submit(vec![Message::user("next")]).unwrap();
        assert_eq!(queued.position, 0);

        release.store(true, Ordering::Release);
        wait_until("both jobs", || pool.stats().queue.completed == 2).await;
        assert!(pool.is_ready());
        assert!(pool.terminate().await);
    }

    #[tokio::test]
    async fn watchdog_fails_the_job_but_not_the_slot() {
        let (factory, release) = gated();
        let clock = ManualClock::default();
        let queue = QueueConfig {
            max_concurrent: 1,
            max_execution_time: Duration::from_secs(10),
            ..Default::default()
        };
        let registry = Arc::new(JobRegistry::with_clock(queue, Arc::new(clock.clone())));
        let pool = WorkerPool::with_registry(factory, config(1), Arc::clone(&registry)).unwrap();

        let stuck = pool.submit(vec![Message::user("hang")]).unwrap().job.id;
        wait_until("the job to start", || status_of(&pool, &stuck) == JobStatus::Running).await;

        clock.advance(Duration::from_secs(11));
        assert_eq!(registry.cleanup().timed_out, 1);
        let job = pool.status(&stuck).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(WATCHDOG_ERROR));
        assert!(registry.running_ids().is_empty());

        // the watchdog cannot kill the slot; it stays occupied until the engine returns
        let waiting = pool.submit(vec![Message::user("after")]).unwrap().job.id;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.stats().available_workers, 0);
        assert_eq!(status_of(&pool, &waiting), JobStatus::Queued);

        release.store(true, Ordering::Release);
        wait_until("the queued job", || status_of(&pool, &waiting) == JobStatus::Completed).await;
        assert_eq!(job.error.as_deref(), pool.status(&stuck).unwrap().error.as_deref());
        assert!(pool.terminate().await);
    }

    #[tokio::test]
    async fn terminate_waits_for_the_running_job() {
        let factory = Arc::new(FnEngine::new(|_: &[Message]| {
            std::thread::sleep(Duration::from_millis(150));
            Ok(JobResult::success("slow", vec![]))
        }));
        let pool = WorkerPool::new(factory, config(1)).unwrap();
        let id = pool.submit(vec![Message::user("slow")]).unwrap().job.id;
        wait_until("the job to start", || status_of(&pool, &id) == JobStatus::Running).await;

        assert!(pool.terminate().await);
        assert_eq!(status_of(&pool, &id), JobStatus::Completed);
        assert_eq!(pool.stats().available_workers, 0);
    }

    #[tokio::test]
    async fn terminate_gives_up_after_the_grace_period() {
        let (factory, release) = gated();
        let pool = WorkerPool::new(
            factory,
            PoolConfig { shutdown_grace: Duration::from_millis(100), ..config(1) },
        )
        .unwrap();
        let id = pool.submit(vec![Message::user("hang")]).unwrap().job.id;
        wait_until("the job to start", || status_of(&pool, &id) == JobStatus::Running).await;

        let started = std::time::Instant::now();
        assert!(!pool.terminate().await);
        assert!(started.elapsed() < Duration::from_secs(2));
        release.store(true, Ordering::Release);
    }

    #[tokio::test]
    async fn stopped_pool_dispatches_nothing() {
        let pool = WorkerPool::new(echo(), config(1)).unwrap();
        assert!(pool.terminate().await);
        let id = pool.submit(vec![Message::user("late")]).unwrap().job.id;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(status_of(&pool, &id), JobStatus::Queued);
    }

    #[tokio::test]
    async fn wait_for_idle_reports_drain() {
        let (factory, release) = gated();
        let pool = WorkerPool::new(factory, config(1)).unwrap();
        assert!(pool.wait_for_idle(Duration::from_millis(10)).await);

        let id = pool.submit(vec![Message::user("x")]).unwrap().job.id;
        wait_until("the job to start", || status_of(&pool, &id) == JobStatus::Running).await;
        assert!(!pool.wait_for_idle(Duration::from_millis(60)).await);

        release.store(true, Ordering::Release);
        assert!(pool.wait_for_idle(Duration::from_secs(5)).await);
        assert!(pool.terminate().await);
    }

    /// Fails the first `failures` engine creations.
    struct FlakyFactory {
        failures: AtomicUsize,
        created: AtomicUsize,
    }

    impl EngineFactory for FlakyFactory {
        fn create(&self, slot_id: usize) -> anyhow::Result<Box<dyn ExecutionEngine>> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                anyhow::bail!("engine not ready");
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            FnEngine::new(|_: &[Message]| Ok(JobResult::success("recovered", vec![]))).create(slot_id)
        }
    }

    #[tokio::test]
    async fn dead_slot_degrades_then_gets_replaced() {
        let factory = Arc::new(FlakyFactory { failures: AtomicUsize::new(1), created: AtomicUsize::new(0) });
        let pool = WorkerPool::new(
            Arc::clone(&factory) as Arc<dyn EngineFactory>,
            PoolConfig { respawn_delay: Duration::from_millis(500), ..config(1) },
        )
        .unwrap();

        // the only slot died at startup and is not replaced yet
        wait_until("the slot to be marked dead", || pool.stats().available_workers == 0).await;
        let stats = pool.stats();
        assert_eq!((stats.workers, stats.busy_workers), (1, 0));
        assert!(!pool.is_ready());
        let health = pool.health();
        assert_eq!(health.execution, ExecutionCapacity::Unavailable);
        assert_eq!(health.status, HealthStatus::Error);

        wait_until("the replacement slot", || factory.created.load(Ordering::SeqCst) == 1).await;
        wait_until("readiness to return", || pool.is_ready()).await;
        assert_eq!(pool.health().execution, ExecutionCapacity::Available);

        let id = pool.submit(vec![Message::user("x")]).unwrap().job.id;
        wait_until("the job to complete", || status_of(&pool, &id) == JobStatus::Completed).await;
        assert_eq!(pool.status(&id).unwrap().result.unwrap().content.as_deref(), Some("recovered"));
        assert!(pool.terminate().await);
    }

    #[tokio::test]
    async fn stopped_dispatch_leaves_backlog_queued() {
        let (factory, release) = gated();
        let pool = WorkerPool::new(factory, config(1)).unwrap();
        let running = pool.submit(vec![Message::user("first")]).unwrap().job.id;
        wait_until("the job to start", || status_of(&pool, &running) == JobStatus::Running).await;
        let waiting: Vec<_> = (0..3).map(|_| pool.submit(vec![Message::user("later")]).unwrap().job.id).collect();

        pool.stop_dispatch().await;
        release.store(true, Ordering::Release);
        assert!(pool.wait_for_idle(Duration::from_secs(5)).await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(status_of(&pool, &running), JobStatus::Completed);
        assert!(waiting.iter().all(|id| status_of(&pool, id) == JobStatus::Queued));
        assert_eq!(pool.stats().available_workers, 1);
        assert!(pool.terminate().await);
    }

    #[tokio::test]
    async fn concurrent_terminate_calls_all_see_the_acknowledgement() {
        let (factory, release) = gated();
        let pool = WorkerPool::new(factory, config(1)).unwrap();
        let id = pool.submit(vec![Message::user("hold")]).unwrap().job.id;
        wait_until("the job to start", || status_of(&pool, &id) == JobStatus::Running).await;

        let (first, second, ()) = tokio::join!(pool.terminate(), pool.terminate(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            release.store(true, Ordering::Release);
        });
        assert!(first && second);
    }

    #[tokio::test]
    async fn terminate_within_uses_the_given_bound() {
        let (factory, release) = gated();
        let pool = WorkerPool::new(factory, config(1)).unwrap();
        let id = pool.submit(vec![Message::user("hold")]).unwrap().job.id;
        wait_until("the job to start", || status_of(&pool, &id) == JobStatus::Running).await;

        let started = std::time::Instant::now();
        assert!(!pool.terminate_within(Duration::from_millis(50)).await);
        assert!(started.elapsed() < Duration::from_secs(2));
        release.store(true, Ordering::Release);
    }
}
