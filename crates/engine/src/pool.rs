//! Fixed-size worker pool for CPU-bound chain work
//!
//! Bulk chain building, batch updates, pool-dispatched generation, and
//! stats gathering run here so the request path never blocks on them.
//! Tasks are a closed sum type with typed payloads; submission returns a
//! single-shot [`JobHandle`] that can be blocked on from synchronous
//! contexts or polled from an event loop.
//!
//! # Queue discipline
//!
//! Higher priority first; FIFO within a priority via a monotone sequence
//! number. The queue is unbounded by design — callers needing
//! backpressure inspect [`WorkerPool::stats`].
//!
//! # Supervision
//!
//! A task failure resolves its handle with a `Worker` error and leaves
//! the worker alive. A worker thread that dies for any other reason is
//! respawned by the supervisor after a one-second backoff; its in-flight
//! task resolves as a failure. Routing uses a dedicated task id — worker
//! slot indices appear only in thread names and logs.

use crate::registry::StoreRegistry;
use markgen_core::{EngineConfig, Error, Result, StoreStats, TenantId, TrainingRecord};
use parking_lot::{Condvar, Mutex};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Priority levels for pool tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    /// Background maintenance.
    Low = 0,
    /// Training batches.
    Normal = 1,
    /// User-facing requests and serially applied batches.
    High = 2,
}

/// Mutation flavor for [`Task::BatchUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    /// Merge the records in.
    Add,
    /// Remove the records' prefixes (suffix and weight are ignored).
    Remove,
}

/// Work dispatched to the pool.
#[derive(Debug)]
pub enum Task {
    /// Bulk-insert records, optionally clearing the store first.
    BuildChains {
        /// Target tenant.
        tenant: TenantId,
        /// Records to apply.
        records: Vec<TrainingRecord>,
        /// Clear the store before inserting.
        clear_existing: bool,
    },
    /// Produce one generation.
    GenerateResponse {
        /// Target tenant.
        tenant: TenantId,
        /// Seed prefix tokens.
        seed: Vec<String>,
        /// Upper bound on total output tokens.
        max_len: usize,
        /// Reserved; the weight-proportional sampler ignores it.
        temperature: Option<f64>,
    },
    /// Apply a mutation batch.
    BatchUpdate {
        /// Target tenant.
        tenant: TenantId,
        /// Records to apply or prefixes to remove.
        updates: Vec<TrainingRecord>,
        /// Mutation flavor.
        op: UpdateOp,
    },
    /// Gather store statistics.
    Stats {
        /// Target tenant.
        tenant: TenantId,
    },
}

impl Task {
    fn kind(&self) -> &'static str {
        match self {
            Task::BuildChains { .. } => "build-chains",
            Task::GenerateResponse { .. } => "generate-response",
            Task::BatchUpdate { .. } => "batch-update",
            Task::Stats { .. } => "stats",
        }
    }
}

/// Typed result of a completed task.
#[derive(Debug)]
pub enum TaskOutput {
    /// Result of `BuildChains`.
    Built {
        /// Records applied.
        processed_count: usize,
    },
    /// Result of `GenerateResponse`.
    Generated {
        /// The generated sequence, seed included.
        tokens: Vec<String>,
    },
    /// Result of `BatchUpdate`.
    Updated {
        /// Mutations applied.
        update_count: usize,
    },
    /// Result of `Stats`.
    Stats(StoreStats),
}

/// Pool metrics snapshot.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Tasks waiting in the queue.
    pub queue_depth: usize,
    /// Tasks currently executing.
    pub active_tasks: usize,
    /// Tasks finished (successfully or not) since pool creation.
    pub tasks_completed: u64,
    /// Worker thread count.
    pub worker_count: usize,
}

const PHASE_QUEUED: u8 = 0;
const PHASE_RUNNING: u8 = 1;
const PHASE_CANCELLED: u8 = 2;

struct DispatchState {
    phase: AtomicU8,
}

enum SlotState {
    Pending,
    Done(Result<TaskOutput>),
    Taken,
}

struct ResultSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl ResultSlot {
    fn new() -> Arc<Self> {
        Arc::new(ResultSlot {
            state: Mutex::new(SlotState::Pending),
            ready: Condvar::new(),
        })
    }

    /// First resolution wins; later calls are ignored.
    fn resolve(&self, result: Result<TaskOutput>) {
        let mut state = self.state.lock();
        if matches!(*state, SlotState::Pending) {
            *state = SlotState::Done(result);
            self.ready.notify_all();
        }
    }
}

/// Single-shot handle to a submitted task.
///
/// The result can be claimed exactly once, by whichever of `wait`,
/// `wait_timeout`, or `try_take` gets there first.
pub struct JobHandle {
    id: u64,
    dispatch: Arc<DispatchState>,
    slot: Arc<ResultSlot>,
}

impl JobHandle {
    /// The task id used for routing; distinct from any worker slot.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until the task resolves.
    pub fn wait(self) -> Result<TaskOutput> {
        let mut state = self.slot.state.lock();
        loop {
            match std::mem::replace(&mut *state, SlotState::Taken) {
                SlotState::Done(result) => return result,
                SlotState::Taken => {
                    return Err(Error::worker("task result was already taken"))
                }
                SlotState::Pending => {
                    *state = SlotState::Pending;
                    self.slot.ready.wait(&mut state);
                }
            }
        }
    }

    /// Block up to `timeout`; `None` means the task is still running (or
    /// its result was already taken).
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<TaskOutput>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.slot.state.lock();
        loop {
            if let SlotState::Done(_) = *state {
                if let SlotState::Done(result) = std::mem::replace(&mut *state, SlotState::Taken) {
                    return Some(result);
                }
            }
            if matches!(*state, SlotState::Taken) {
                return None;
            }
            if self.slot.ready.wait_until(&mut state, deadline).timed_out() {
                if let SlotState::Done(_) = *state {
                    continue;
                }
                return None;
            }
        }
    }

    /// Claim the result if already resolved, without blocking.
    pub fn try_take(&self) -> Option<Result<TaskOutput>> {
        let mut state = self.slot.state.lock();
        if let SlotState::Done(_) = *state {
            if let SlotState::Done(result) = std::mem::replace(&mut *state, SlotState::Taken) {
                return Some(result);
            }
        }
        None
    }

    /// Whether the task has resolved.
    pub fn is_finished(&self) -> bool {
        !matches!(*self.slot.state.lock(), SlotState::Pending)
    }

    /// Cancel the task if it is still queued.
    ///
    /// Returns `true` and resolves the handle with `Cancelled` on
    /// success. Once a worker has started the task, cancellation fails
    /// and side effects will apply.
    pub fn cancel(&self) -> bool {
        if self
            .dispatch
            .phase
            .compare_exchange(
                PHASE_QUEUED,
                PHASE_CANCELLED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            self.slot.resolve(Err(Error::Cancelled));
            true
        } else {
            false
        }
    }
}

struct TaskEnvelope {
    priority: TaskPriority,
    sequence: u64,
    id: u64,
    task: Task,
    dispatch: Arc<DispatchState>,
    slot: Arc<ResultSlot>,
}

impl Eq for TaskEnvelope {}

impl PartialEq for TaskEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

// Higher priority first, then lower sequence (older) first
impl Ord for TaskEnvelope {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for TaskEnvelope {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct PoolShared {
    queue: Mutex<BinaryHeap<TaskEnvelope>>,
    work_ready: Condvar,
    shutdown: AtomicBool,
    sequence: AtomicU64,
    next_task_id: AtomicU64,
    queue_depth: AtomicUsize,
    active_tasks: AtomicUsize,
    tasks_completed: AtomicU64,
    registry: Arc<StoreRegistry>,
}

struct WorkerSlot {
    index: usize,
    handle: Option<JoinHandle<()>>,
}

/// Fixed-size pool executing [`Task`]s against the store registry.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Arc<Mutex<Vec<WorkerSlot>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    worker_count: usize,
    grace: Duration,
}

impl WorkerPool {
    /// Spawn `config.worker_pool_size` workers plus the supervisor.
    pub fn new(config: &EngineConfig, registry: Arc<StoreRegistry>) -> WorkerPool {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(BinaryHeap::new()),
            work_ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            next_task_id: AtomicU64::new(1),
            queue_depth: AtomicUsize::new(0),
            active_tasks: AtomicUsize::new(0),
            tasks_completed: AtomicU64::new(0),
            registry,
        });

        let worker_count = config.worker_pool_size;
        let mut slots = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            slots.push(WorkerSlot {
                index,
                handle: Some(spawn_worker(index, Arc::clone(&shared))),
            });
        }
        let workers = Arc::new(Mutex::new(slots));

        let supervisor = {
            let shared = Arc::clone(&shared);
            let workers = Arc::clone(&workers);
            std::thread::Builder::new()
                .name("markgen-supervisor".to_string())
                .spawn(move || supervisor_loop(&shared, &workers))
                .expect("failed to spawn pool supervisor thread")
        };

        info!(workers = worker_count, "worker pool started");
        WorkerPool {
            shared,
            workers,
            supervisor: Mutex::new(Some(supervisor)),
            worker_count,
            grace: Duration::from_millis(config.graceful_shutdown_ms),
        }
    }

    /// Queue a task; the handle resolves when a worker finishes it.
    ///
    /// After shutdown, the handle is returned already resolved as
    /// `Cancelled`.
    pub fn submit(&self, priority: TaskPriority, task: Task) -> JobHandle {
        let id = self.shared.next_task_id.fetch_add(1, Ordering::Relaxed);
        let dispatch = Arc::new(DispatchState {
            phase: AtomicU8::new(PHASE_QUEUED),
        });
        let slot = ResultSlot::new();
        let handle = JobHandle {
            id,
            dispatch: Arc::clone(&dispatch),
            slot: Arc::clone(&slot),
        };

        if self.shared.shutdown.load(Ordering::Acquire) {
            dispatch.phase.store(PHASE_CANCELLED, Ordering::SeqCst);
            slot.resolve(Err(Error::Cancelled));
            return handle;
        }

        let envelope = TaskEnvelope {
            priority,
            sequence: self.shared.sequence.fetch_add(1, Ordering::Relaxed),
            id,
            task,
            dispatch,
            slot,
        };
        {
            let mut queue = self.shared.queue.lock();
            queue.push(envelope);
            self.shared.queue_depth.fetch_add(1, Ordering::Release);
        }
        self.shared.work_ready.notify_one();
        handle
    }

    /// Pool metrics snapshot for caller-side backpressure.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            queue_depth: self.shared.queue_depth.load(Ordering::Relaxed),
            active_tasks: self.shared.active_tasks.load(Ordering::Relaxed),
            tasks_completed: self.shared.tasks_completed.load(Ordering::Relaxed),
            worker_count: self.worker_count,
        }
    }

    /// Stop the pool: queued-but-undispatched tasks resolve `Cancelled`,
    /// in-flight tasks get up to the configured grace to finish, and
    /// stragglers are abandoned with a warning.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        // Drain the queue under the lock so no worker pops a task we are
        // about to cancel; then wake everyone.
        let drained: Vec<TaskEnvelope> = {
            let mut queue = self.shared.queue.lock();
            let drained = std::mem::take(&mut *queue).into_vec();
            self.shared.queue_depth.store(0, Ordering::Release);
            self.shared.work_ready.notify_all();
            drained
        };
        let cancelled = drained.len();
        for envelope in drained {
            if envelope
                .dispatch
                .phase
                .compare_exchange(
                    PHASE_QUEUED,
                    PHASE_CANCELLED,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                envelope.slot.resolve(Err(Error::Cancelled));
            }
        }

        if let Some(supervisor) = self.supervisor.lock().take() {
            let _ = supervisor.join();
        }

        let deadline = Instant::now() + self.grace;
        let mut abandoned = 0usize;
        {
            let mut workers = self.workers.lock();
            for slot in workers.iter_mut() {
                let Some(handle) = slot.handle.take() else {
                    continue;
                };
                while !handle.is_finished() && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(10));
                }
                if handle.is_finished() {
                    let _ = handle.join();
                } else {
                    warn!(worker = slot.index, "abandoning straggler worker at shutdown");
                    abandoned += 1;
                }
            }
        }
        info!(cancelled, abandoned, "worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("WorkerPool")
            .field("workers", &stats.worker_count)
            .field("queue_depth", &stats.queue_depth)
            .field("active_tasks", &stats.active_tasks)
            .finish()
    }
}

fn spawn_worker(index: usize, shared: Arc<PoolShared>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("markgen-worker-{}", index))
        .spawn(move || worker_loop(&shared))
        .expect("failed to spawn pool worker thread")
}

/// Resolves the slot with a `Worker` error on drop if nothing resolved
/// it first. Keeps a waiter from hanging if the worker dies between
/// popping a task and resolving its result.
struct ResolveGuard {
    slot: Arc<ResultSlot>,
}

impl Drop for ResolveGuard {
    fn drop(&mut self) {
        self.slot
            .resolve(Err(Error::worker("worker terminated before resolving task")));
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let envelope = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(envelope) = queue.pop() {
                    shared.queue_depth.fetch_sub(1, Ordering::Release);
                    break envelope;
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                shared.work_ready.wait(&mut queue);
            }
        };

        // A cancelled envelope was already resolved by its handle.
        if envelope
            .dispatch
            .phase
            .compare_exchange(
                PHASE_QUEUED,
                PHASE_RUNNING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            continue;
        }

        shared.active_tasks.fetch_add(1, Ordering::Release);
        let guard = ResolveGuard {
            slot: Arc::clone(&envelope.slot),
        };

        let kind = envelope.task.kind();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            execute_task(&shared.registry, &envelope.task)
        }));
        let resolved = match result {
            Ok(task_result) => task_result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(task = kind, id = envelope.id, panic = %message, "task panicked in worker");
                Err(Error::worker(format!("{} task panicked: {}", kind, message)))
            }
        };
        envelope.slot.resolve(resolved);
        drop(guard);

        shared.active_tasks.fetch_sub(1, Ordering::Release);
        shared.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "(non-string panic)".to_string()
    }
}

fn execute_task(registry: &StoreRegistry, task: &Task) -> Result<TaskOutput> {
    match task {
        Task::BuildChains {
            tenant,
            records,
            clear_existing,
        } => {
            let store = registry.get(tenant)?;
            if *clear_existing {
                store.clear();
            }
            let outcome = store.add_batch(records);
            if !outcome.errors.is_empty() {
                warn!(
                    tenant = %tenant,
                    rejected = outcome.errors.len(),
                    "build-chains batch had invalid records"
                );
            }
            Ok(TaskOutput::Built {
                processed_count: outcome.inserted,
            })
        }
        Task::GenerateResponse {
            tenant,
            seed,
            max_len,
            temperature,
        } => {
            if let Some(t) = temperature {
                debug!(temperature = t, "temperature is reserved and ignored");
            }
            let store = registry.get(tenant)?;
            Ok(TaskOutput::Generated {
                tokens: store.generate(seed, *max_len),
            })
        }
        Task::BatchUpdate {
            tenant,
            updates,
            op,
        } => {
            let store = registry.get(tenant)?;
            let update_count = match op {
                UpdateOp::Add => store.add_batch(updates).inserted,
                UpdateOp::Remove => updates
                    .iter()
                    .filter(|u| store.remove_prefix(&u.prefix))
                    .count(),
            };
            Ok(TaskOutput::Updated { update_count })
        }
        Task::Stats { tenant } => Ok(TaskOutput::Stats(registry.get(tenant)?.stats())),
    }
}

fn supervisor_loop(shared: &Arc<PoolShared>, workers: &Arc<Mutex<Vec<WorkerSlot>>>) {
    while !shared.shutdown.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(250));

        // Find one dead worker at a time; joining and backoff happen
        // outside the lock.
        let dead = {
            let mut workers = workers.lock();
            workers
                .iter_mut()
                .find(|slot| {
                    slot.handle
                        .as_ref()
                        .map(|h| h.is_finished())
                        .unwrap_or(false)
                })
                .map(|slot| (slot.index, slot.handle.take().expect("handle present")))
        };

        let Some((index, handle)) = dead else {
            continue;
        };
        if shared.shutdown.load(Ordering::Acquire) {
            let _ = handle.join();
            return;
        }
        let _ = handle.join();
        warn!(worker = index, "worker thread died; respawning after backoff");

        std::thread::sleep(Duration::from_secs(1));
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }

        let replacement = spawn_worker(index, Arc::clone(shared));
        let mut workers = workers.lock();
        if let Some(slot) = workers.iter_mut().find(|slot| slot.index == index) {
            slot.handle = Some(replacement);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use markgen_core::TrainingRecord;
    use std::path::Path;

    fn pool_fixture(dir: &Path, workers: usize) -> (WorkerPool, Arc<StoreRegistry>) {
        let mut config = EngineConfig::for_testing(dir, dir);
        config.worker_pool_size = workers;
        let config = Arc::new(config);
        let registry = Arc::new(StoreRegistry::new(Arc::clone(&config)));
        let pool = WorkerPool::new(&config, Arc::clone(&registry));
        (pool, registry)
    }

    fn build_task(tenant: &str, prefix: &str, clear: bool) -> Task {
        Task::BuildChains {
            tenant: TenantId::new(tenant),
            records: vec![TrainingRecord::new(prefix, "x", 1)],
            clear_existing: clear,
        }
    }

    fn heavy_build(tenant: &str, count: usize) -> Task {
        Task::BuildChains {
            tenant: TenantId::new(tenant),
            records: (0..count)
                .map(|i| TrainingRecord::new(format!("p{} q{}", i, i), "x", 1))
                .collect(),
            clear_existing: false,
        }
    }

    #[test]
    fn test_build_chains_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, registry) = pool_fixture(dir.path(), 2);

        let handle = pool.submit(
            TaskPriority::Normal,
            Task::BuildChains {
                tenant: TenantId::new("g1"),
                records: vec![
                    TrainingRecord::new("a b", "c", 1),
                    TrainingRecord::new("a b", "d", 3),
                ],
                clear_existing: false,
            },
        );
        match handle.wait().unwrap() {
            TaskOutput::Built { processed_count } => assert_eq!(processed_count, 2),
            other => panic!("unexpected output {:?}", other),
        }

        let store = registry.get(&TenantId::new("g1")).unwrap();
        assert_eq!(store.stats().prefix_count, 1);
        pool.shutdown();
    }

    #[test]
    fn test_generate_task() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, registry) = pool_fixture(dir.path(), 2);
        let store = registry.get(&TenantId::new("g1")).unwrap();
        store.add_record("a b", "c", 1).unwrap();

        let handle = pool.submit(
            TaskPriority::High,
            Task::GenerateResponse {
                tenant: TenantId::new("g1"),
                seed: vec!["a".to_string(), "b".to_string()],
                max_len: 10,
                temperature: Some(0.7),
            },
        );
        match handle.wait().unwrap() {
            TaskOutput::Generated { tokens } => assert_eq!(tokens, vec!["a", "b", "c"]),
            other => panic!("unexpected output {:?}", other),
        }
        pool.shutdown();
    }

    #[test]
    fn test_batch_update_remove() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, registry) = pool_fixture(dir.path(), 1);
        let store = registry.get(&TenantId::new("g1")).unwrap();
        store.add_record("a b", "c", 1).unwrap();
        store.add_record("b c", "d", 1).unwrap();

        let handle = pool.submit(
            TaskPriority::Normal,
            Task::BatchUpdate {
                tenant: TenantId::new("g1"),
                updates: vec![
                    TrainingRecord::new("a b", "", 1),
                    TrainingRecord::new("x y", "", 1), // not present
                ],
                op: UpdateOp::Remove,
            },
        );
        match handle.wait().unwrap() {
            TaskOutput::Updated { update_count } => assert_eq!(update_count, 1),
            other => panic!("unexpected output {:?}", other),
        }
        assert_eq!(store.stats().prefix_count, 1);
        pool.shutdown();
    }

    #[test]
    fn test_stats_task() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, registry) = pool_fixture(dir.path(), 1);
        let store = registry.get(&TenantId::new("g1")).unwrap();
        store.add_record("a b", "c", 1).unwrap();

        let handle = pool.submit(
            TaskPriority::Low,
            Task::Stats {
                tenant: TenantId::new("g1"),
            },
        );
        match handle.wait().unwrap() {
            TaskOutput::Stats(stats) => {
                assert_eq!(stats.prefix_count, 1);
                assert_eq!(stats.total_suffixes, 1);
            }
            other => panic!("unexpected output {:?}", other),
        }
        pool.shutdown();
    }

    #[test]
    fn test_priority_order_with_single_worker() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, registry) = pool_fixture(dir.path(), 1);

        // Occupy the single worker, then queue clear-rebuilds at each
        // priority. Whatever runs last leaves its marker as the only
        // content; priority order means Low runs last.
        let blocker = pool.submit(TaskPriority::High, heavy_build("g1", 20_000));
        let high = pool.submit(TaskPriority::High, build_task("g1", "h1 h2", true));
        let normal = pool.submit(TaskPriority::Normal, build_task("g1", "n1 n2", true));
        let low = pool.submit(TaskPriority::Low, build_task("g1", "l1 l2", true));

        blocker.wait().unwrap();
        high.wait().unwrap();
        normal.wait().unwrap();
        low.wait().unwrap();

        let store = registry.get(&TenantId::new("g1")).unwrap();
        assert_eq!(store.stats().prefix_count, 1);
        assert!(store.get_next("l1 l2").is_some());
        assert!(store.get_next("h1 h2").is_none());
        pool.shutdown();
    }

    #[test]
    fn test_fifo_within_priority() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, registry) = pool_fixture(dir.path(), 1);

        let blocker = pool.submit(TaskPriority::High, heavy_build("g1", 20_000));
        let first = pool.submit(TaskPriority::Normal, build_task("g1", "f1 f2", true));
        let second = pool.submit(TaskPriority::Normal, build_task("g1", "s1 s2", true));

        blocker.wait().unwrap();
        first.wait().unwrap();
        second.wait().unwrap();

        let store = registry.get(&TenantId::new("g1")).unwrap();
        assert!(store.get_next("s1 s2").is_some());
        assert!(store.get_next("f1 f2").is_none());
        pool.shutdown();
    }

    #[test]
    fn test_cancel_queued_task() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, registry) = pool_fixture(dir.path(), 1);

        let blocker = pool.submit(TaskPriority::High, heavy_build("g1", 20_000));
        let victim = pool.submit(TaskPriority::Low, build_task("g2", "v1 v2", false));

        assert!(victim.cancel());
        assert!(victim.wait().unwrap_err().is_cancelled());
        blocker.wait().unwrap();
        pool.shutdown();

        // The cancelled task never touched its tenant
        let store = registry.get(&TenantId::new("g2")).unwrap();
        assert_eq!(store.stats().prefix_count, 0);
    }

    #[test]
    fn test_cancel_after_completion_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _registry) = pool_fixture(dir.path(), 1);

        let handle = pool.submit(TaskPriority::Normal, build_task("g1", "a b", false));
        // Wait for resolution without taking the result
        while !handle.is_finished() {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!handle.cancel());
        assert!(handle.wait().is_ok());
        pool.shutdown();
    }

    #[test]
    fn test_submit_after_shutdown_resolves_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _registry) = pool_fixture(dir.path(), 1);
        pool.shutdown();

        let handle = pool.submit(TaskPriority::Normal, build_task("g1", "a b", false));
        assert!(handle.wait().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_shutdown_resolves_every_handle() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _registry) = pool_fixture(dir.path(), 2);

        let handles: Vec<JobHandle> = (0..1000)
            .map(|i| {
                pool.submit(
                    TaskPriority::Normal,
                    build_task("g1", &format!("p{} q{}", i, i), false),
                )
            })
            .collect();

        std::thread::sleep(Duration::from_millis(10));
        pool.shutdown();

        let mut completed = 0usize;
        let mut cancelled = 0usize;
        for handle in handles {
            match handle.wait() {
                Ok(_) => completed += 1,
                Err(e) if e.is_cancelled() => cancelled += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(completed + cancelled, 1000);

        let stats = pool.stats();
        assert_eq!(stats.active_tasks, 0);
        assert_eq!(stats.queue_depth, 0);
    }

    #[test]
    fn test_task_error_resolves_handle_and_keeps_worker() {
        let dir = tempfile::tempdir().unwrap();
        // data_dir pointing at a regular file makes store creation fail
        let bogus = dir.path().join("not-a-dir");
        std::fs::write(&bogus, b"file").unwrap();
        let mut config = EngineConfig::for_testing(&bogus, dir.path());
        config.worker_pool_size = 1;
        let config = Arc::new(config);
        let registry = Arc::new(StoreRegistry::new(Arc::clone(&config)));
        let pool = WorkerPool::new(&config, registry);

        let failed = pool.submit(TaskPriority::Normal, build_task("g1", "a b", false));
        assert!(failed.wait().unwrap_err().is_io());

        // Worker is still alive and processes further tasks
        let next = pool.submit(TaskPriority::Normal, build_task("g1", "a b", false));
        assert!(next.wait().is_err());
        assert_eq!(pool.stats().tasks_completed, 2);
        pool.shutdown();
    }

    #[test]
    fn test_try_take_and_wait_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _registry) = pool_fixture(dir.path(), 1);

        let handle = pool.submit(TaskPriority::Normal, build_task("g1", "a b", false));
        let result = handle
            .wait_timeout(Duration::from_secs(5))
            .expect("task should resolve within 5s");
        assert!(result.is_ok());

        // Single-shot: the result is gone now
        assert!(handle.try_take().is_none());
        pool.shutdown();
    }
}
