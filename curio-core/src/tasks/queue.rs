//! Priority-ordered background task queue with adaptive pacing.
//!
//! The queue executes at most one task per scheduling tick, adapts the
//! inter-tick delay to observed execution cost, and sheds the least urgent
//! work when a configured soft cap is exceeded. Individual task failures are
//! logged and widen the pacing delay; they never stop the driver loop.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{Duration, sleep};
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::error::{EngineError, Result};

use super::order::{EvictOrder, ExecOrder, ScheduledTask, TaskFn, TaskFuture};

/// Floor for the inter-task delay in milliseconds.
pub const MIN_TIMEOUT_MS: u64 = 10;
/// Ceiling for the inter-task delay in milliseconds.
pub const MAX_TIMEOUT_MS: u64 = 10_000;

/// Fire-and-forget liveness signal emitted once per scheduling tick.
pub trait QueueHeartbeat: Send + Sync {
    fn beat(&self);
}

/// No-op heartbeat used when no watchdog is wired up.
#[derive(Debug)]
pub struct NoopQueueHeartbeat;

impl QueueHeartbeat for NoopQueueHeartbeat {
    fn beat(&self) {}
}

/// Public view of the queue's adaptive timing state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Monotonic count of tasks popped for execution (including skipped
    /// evicted tasks).
    pub index: u64,
    /// Current adaptive inter-task delay in milliseconds.
    pub timeout_ms: u64,
    /// Snapshot of the delay taken when an explicit zero timeout was passed
    /// to `start`.
    pub last_timeout_ms: u64,
}

struct StatsInner {
    index: u64,
    timeout_ms: u64,
    last_timeout_ms: u64,
    logs: Vec<String>,
}

struct HeapState {
    main: BinaryHeap<ExecOrder>,
    aux: BinaryHeap<EvictOrder>,
    next_seq: u64,
}

struct QueueInner {
    config: QueueConfig,
    heartbeat: Arc<dyn QueueHeartbeat>,
    heaps: Mutex<HeapState>,
    stats: Mutex<StatsInner>,
    paused: AtomicBool,
    started: AtomicBool,
    closed: AtomicBool,
    wake: Notify,
}

/// Handle to the background task queue. Cheap to clone; all clones share the
/// same scheduler.
///
/// At most one task executes at a time. Cancellation is cooperative: an
/// evicted task is skipped when popped, and a task that never resolves
/// stalls the queue (no per-task timeout is imposed).
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("pending", &self.pending())
            .field("paused", &self.inner.paused.load(Ordering::Relaxed))
            .field("started", &self.inner.started.load(Ordering::Relaxed))
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl TaskQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_heartbeat(config, Arc::new(NoopQueueHeartbeat))
    }

    pub fn with_heartbeat(config: QueueConfig, heartbeat: Arc<dyn QueueHeartbeat>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                heartbeat,
                heaps: Mutex::new(HeapState {
                    main: BinaryHeap::new(),
                    aux: BinaryHeap::new(),
                    next_seq: 0,
                }),
                stats: Mutex::new(StatsInner {
                    index: 0,
                    timeout_ms: 0,
                    last_timeout_ms: 0,
                    logs: Vec::new(),
                }),
                paused: AtomicBool::new(false),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                wake: Notify::new(),
            }),
        }
    }

    /// Queue a task with no explicit priority (runs after every task that
    /// has one).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::QueueClosed`] after `shutdown`.
    pub fn push<F, Fut>(&self, task: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.push_scheduled(None, box_task(task))
    }

    /// Queue a task with an explicit priority; lower values run sooner, and
    /// negative values mark background work that is evicted first under
    /// load.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::QueueClosed`] after `shutdown`.
    pub fn push_with_priority<F, Fut>(&self, priority: i64, task: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.push_scheduled(Some(priority), box_task(task))
    }

    /// Queue background work ordered newest-first: the priority is the
    /// negated wall-clock timestamp, so later pushes sort more negative and
    /// run before earlier ones, while any non-background task preempts all
    /// of them.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::QueueClosed`] after `shutdown`.
    pub fn push_background<F, Fut>(&self, task: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let priority = -chrono::Utc::now().timestamp_millis();
        self.push_scheduled(Some(priority), box_task(task))
    }

    fn push_scheduled(&self, priority: Option<i64>, job: TaskFn) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(EngineError::QueueClosed);
        }

        let mut heaps = inner.heaps.lock();
        let seq = heaps.next_seq;
        heaps.next_seq += 1;
        let task = Arc::new(ScheduledTask::new(seq, priority, job));
        heaps.main.push(ExecOrder(Arc::clone(&task)));
        heaps.aux.push(EvictOrder(task));

        if heaps.main.len() > inner.config.max_tasks {
            evict_lowest(&mut heaps);
        }
        drop(heaps);

        // Wake the driver loop if it idled on an empty queue. A wake while
        // paused parks again without executing anything.
        inner.wake.notify_one();
        Ok(())
    }

    /// Stop executing tasks until the queue is resumed. Pushes are still
    /// accepted while paused.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        debug!("task queue paused");
    }

    /// Start or resume the driver loop.
    ///
    /// A positive `timeout_ms` overrides the current pacing delay; an
    /// explicit zero snapshots the current delay and forces immediate
    /// attempts. Calling `start` on a queue that is already running and not
    /// paused is a no-op unless `force` is set.
    pub fn start(&self, timeout_ms: u64, force: bool) {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        if inner.started.load(Ordering::SeqCst) && !inner.paused.load(Ordering::SeqCst) && !force {
            debug!("task queue already running; start ignored");
            return;
        }

        inner.paused.store(false, Ordering::SeqCst);
        {
            let mut stats = inner.stats.lock();
            if timeout_ms > 0 {
                stats.timeout_ms = timeout_ms;
            } else {
                stats.last_timeout_ms = stats.timeout_ms;
                stats.timeout_ms = 0;
            }
        }

        if inner.started.swap(true, Ordering::SeqCst) {
            inner.wake.notify_one();
        } else {
            tokio::spawn(run_loop(Arc::clone(&self.inner)));
        }
    }

    /// Force-resume the driver loop with unchanged pacing.
    pub fn resume(&self) {
        self.start(0, true);
    }

    /// Permanently stop the queue; subsequent pushes fail.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    /// Number of tasks currently held by the main heap (including evicted
    /// tasks not yet skipped at dispatch).
    pub fn pending(&self) -> usize {
        self.inner.heaps.lock().main.len()
    }

    pub fn stats(&self) -> QueueStats {
        let stats = self.inner.stats.lock();
        QueueStats {
            index: stats.index,
            timeout_ms: stats.timeout_ms,
            last_timeout_ms: stats.last_timeout_ms,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }
}

fn box_task<F, Fut>(task: F) -> TaskFn
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move || Box::pin(task()) as TaskFuture)
}

/// Mark the lowest-priority live task canceled. The entry stays in the main
/// heap and is skipped when eventually popped (eviction-at-dispatch policy).
fn evict_lowest(heaps: &mut HeapState) {
    while let Some(EvictOrder(victim)) = heaps.aux.pop() {
        // Entries whose job already ran (or was already evicted) are stale
        // leftovers of the dual-heap layout; keep popping until the eviction
        // lands on a task that would otherwise still execute.
        if victim.canceled.load(Ordering::SeqCst) || victim.job.lock().is_none() {
            continue;
        }
        victim.canceled.store(true, Ordering::SeqCst);
        debug!(
            seq = victim.seq,
            priority = ?victim.priority,
            "task backlog over capacity; evicted lowest-priority task"
        );
        return;
    }
}

fn empty_backoff(timeout_ms: u64) -> u64 {
    (timeout_ms.saturating_mul(2))
        .max(timeout_ms + 100)
        .min(MAX_TIMEOUT_MS)
}

fn update_timeout(stats: &mut StatsInner, execution_ms: u64) {
    stats.timeout_ms = (stats.timeout_ms / 10)
        .max(execution_ms)
        .max(stats.last_timeout_ms / 10);
}

enum TaskOutcome {
    Completed(Duration),
    Skipped,
    Failed(EngineError),
}

async fn execute_task(task: &ScheduledTask) -> TaskOutcome {
    if task.canceled.load(Ordering::SeqCst) {
        debug!(seq = task.seq, "skipping evicted task");
        return TaskOutcome::Skipped;
    }
    let Some(job) = task.job.lock().take() else {
        return TaskOutcome::Skipped;
    };

    let started_at = Instant::now();
    match job().await {
        Ok(()) => TaskOutcome::Completed(started_at.elapsed()),
        Err(error) => TaskOutcome::Failed(error),
    }
}

fn log_progress(inner: &QueueInner, index: u64, task: &ScheduledTask) {
    let mut stats = inner.stats.lock();
    stats.logs.push(format!(
        "task #{index} seq={} priority={:?}",
        task.seq, task.priority
    ));
    if stats.logs.len() >= inner.config.log_flush_threshold {
        flush_logs_locked(&mut stats);
    }
}

fn flush_logs_locked(stats: &mut StatsInner) {
    if stats.logs.is_empty() {
        return;
    }
    let lines = std::mem::take(&mut stats.logs);
    debug!(processed = lines.len(), "queue progress:\n{}", lines.join("\n"));
}

async fn run_loop(inner: Arc<QueueInner>) {
    debug!("task queue driver loop started");
    loop {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        inner.heartbeat.beat();

        if inner.paused.load(Ordering::SeqCst) {
            inner.wake.notified().await;
            continue;
        }

        let popped = inner.heaps.lock().main.pop();
        let Some(ExecOrder(task)) = popped else {
            handle_empty_queue(&inner).await;
            continue;
        };

        let index = {
            let mut stats = inner.stats.lock();
            stats.index += 1;
            stats.index
        };
        log_progress(&inner, index, &task);

        // Optimistically shrink toward the floor; the measured cost below
        // corrects the estimate once the task completes.
        {
            let mut stats = inner.stats.lock();
            stats.timeout_ms = (stats.timeout_ms / 10).max(MIN_TIMEOUT_MS);
        }

        let outcome = execute_task(&task).await;

        match outcome {
            TaskOutcome::Completed(elapsed) => {
                let mut stats = inner.stats.lock();
                update_timeout(&mut stats, elapsed.as_millis() as u64);
            }
            TaskOutcome::Skipped => {}
            TaskOutcome::Failed(error) => {
                warn!(%error, index, "task failed; widening inter-task delay");
                let mut stats = inner.stats.lock();
                stats.timeout_ms = stats.timeout_ms.saturating_mul(2).min(MAX_TIMEOUT_MS);
            }
        }

        let delay = inner
            .stats
            .lock()
            .timeout_ms
            .clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS);
        sleep(Duration::from_millis(delay)).await;
    }
    debug!("task queue driver loop stopped");
}

async fn handle_empty_queue(inner: &Arc<QueueInner>) {
    // Race tolerance: a push may have landed between the empty pop and this
    // check. Back off and retry instead of parking.
    let pending = inner.heaps.lock().main.len();
    if pending > 0 && !inner.paused.load(Ordering::SeqCst) {
        let backoff = {
            let mut stats = inner.stats.lock();
            stats.timeout_ms = empty_backoff(stats.timeout_ms);
            stats.timeout_ms
        };
        debug!(backoff_ms = backoff, pending, "tasks arrived during drain; backing off");
        sleep(Duration::from_millis(backoff)).await;
        return;
    }

    {
        let mut stats = inner.stats.lock();
        flush_logs_locked(&mut stats);
    }
    debug!("task queue drained; parking until next push");
    inner.wake.notified().await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use super::*;

    fn test_config() -> QueueConfig {
        QueueConfig::default()
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 5s");
    }

    #[tokio::test]
    async fn executes_in_priority_order() {
        let queue = TaskQueue::new(test_config());
        let order = Arc::new(Mutex::new(Vec::new()));
        for priority in [5i64, -1, 2] {
            let order = Arc::clone(&order);
            queue
                .push_with_priority(priority, move || async move {
                    order.lock().push(priority);
                    Ok(())
                })
                .unwrap();
        }

        queue.start(0, false);
        wait_until(|| order.lock().len() == 3).await;
        assert_eq!(*order.lock(), vec![2, 5, -1]);
    }

    #[tokio::test]
    async fn missing_priority_runs_after_tagged_tasks() {
        let queue = TaskQueue::new(test_config());
        let order = Arc::new(Mutex::new(Vec::new()));

        let untagged_order = Arc::clone(&order);
        queue
            .push(move || async move {
                untagged_order.lock().push("untagged");
                Ok(())
            })
            .unwrap();
        let tagged_order = Arc::clone(&order);
        queue
            .push_with_priority(10, move || async move {
                tagged_order.lock().push("tagged");
                Ok(())
            })
            .unwrap();

        queue.start(0, false);
        wait_until(|| order.lock().len() == 2).await;
        assert_eq!(*order.lock(), vec!["tagged", "untagged"]);
    }

    #[tokio::test]
    async fn at_most_one_task_executes_at_a_time() {
        let queue = TaskQueue::new(test_config());
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            let done = Arc::clone(&done);
            queue
                .push(move || async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(30)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }

        queue.start(0, false);
        wait_until(|| done.load(Ordering::SeqCst) == 4).await;
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeated_start_calls_spawn_a_single_driver_loop() {
        let queue = TaskQueue::new(test_config());
        queue.start(0, false);
        queue.start(0, false);
        queue.start(0, true);

        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            let done = Arc::clone(&done);
            queue
                .push(move || async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }
        queue.start(0, true);

        wait_until(|| done.load(Ordering::SeqCst) == 3).await;
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().index, 3);
    }

    #[tokio::test]
    async fn failed_task_does_not_stop_the_queue() {
        let queue = TaskQueue::new(test_config());
        let done = Arc::new(AtomicUsize::new(0));

        queue
            .push(|| async { Err(EngineError::Task("boom".into())) })
            .unwrap();
        queue.start(0, false);
        wait_until(|| queue.stats().index >= 1).await;

        let after_failure = Arc::clone(&done);
        queue
            .push(move || async move {
                after_failure.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        wait_until(|| done.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn pause_gates_execution_until_forced_start() {
        let queue = TaskQueue::new(test_config());
        queue.start(0, false);
        queue.pause();

        let executed = Arc::new(AtomicUsize::new(0));
        let task_counter = Arc::clone(&executed);
        queue
            .push(move || async move {
                task_counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        sleep(Duration::from_millis(200)).await;
        assert_eq!(executed.load(Ordering::SeqCst), 0);

        queue.start(0, true);
        wait_until(|| executed.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn push_wakes_an_idle_queue() {
        let queue = TaskQueue::new(test_config());
        queue.start(0, false);
        // Let the driver loop drain and park.
        sleep(Duration::from_millis(100)).await;

        let executed = Arc::new(AtomicUsize::new(0));
        let task_counter = Arc::clone(&executed);
        queue
            .push(move || async move {
                task_counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        wait_until(|| executed.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn evicted_task_is_skipped_not_executed() {
        let queue = TaskQueue::new(QueueConfig {
            max_tasks: 2,
            ..QueueConfig::default()
        });
        let executed = Arc::new(Mutex::new(Vec::new()));

        for priority in [1i64, 2, 3] {
            let executed = Arc::clone(&executed);
            queue
                .push_with_priority(priority, move || async move {
                    executed.lock().push(priority);
                    Ok(())
                })
                .unwrap();
        }
        // Third push breached the cap; priority 3 is the eviction candidate.
        assert_eq!(queue.pending(), 3);

        queue.start(0, false);
        wait_until(|| queue.stats().index == 3).await;
        assert_eq!(*executed.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn background_tasks_run_newest_first_and_yield_to_foreground() {
        let queue = TaskQueue::new(test_config());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&order);
        queue
            .push_background(move || async move {
                first.lock().push("older-background");
                Ok(())
            })
            .unwrap();
        sleep(Duration::from_millis(5)).await;
        let second = Arc::clone(&order);
        queue
            .push_background(move || async move {
                second.lock().push("newer-background");
                Ok(())
            })
            .unwrap();
        let foreground = Arc::clone(&order);
        queue
            .push_with_priority(100, move || async move {
                foreground.lock().push("foreground");
                Ok(())
            })
            .unwrap();

        queue.start(0, false);
        wait_until(|| order.lock().len() == 3).await;
        assert_eq!(
            *order.lock(),
            vec!["foreground", "newer-background", "older-background"]
        );
    }

    #[tokio::test]
    async fn push_after_shutdown_is_rejected() {
        let queue = TaskQueue::new(test_config());
        queue.shutdown();
        let result = queue.push(|| async { Ok(()) });
        assert!(matches!(result, Err(EngineError::QueueClosed)));
    }

    #[tokio::test]
    async fn heartbeat_fires_while_processing() {
        struct CountingHeartbeat(AtomicU64);
        impl QueueHeartbeat for CountingHeartbeat {
            fn beat(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let heartbeat = Arc::new(CountingHeartbeat(AtomicU64::new(0)));
        let queue = TaskQueue::with_heartbeat(test_config(), Arc::clone(&heartbeat) as _);
        queue.push(|| async { Ok(()) }).unwrap();
        queue.start(0, false);
        wait_until(|| queue.stats().index >= 1).await;
        assert!(heartbeat.0.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn empty_backoff_grows_and_caps() {
        assert_eq!(empty_backoff(0), 100);
        assert_eq!(empty_backoff(100), 200);
        assert_eq!(empty_backoff(40), 140);
        assert_eq!(empty_backoff(MAX_TIMEOUT_MS), MAX_TIMEOUT_MS);
        let mut delay = 0;
        for _ in 0..20 {
            let next = empty_backoff(delay);
            assert!(next > delay || next == MAX_TIMEOUT_MS);
            delay = next;
        }
        assert_eq!(delay, MAX_TIMEOUT_MS);
    }

    #[test]
    fn update_timeout_tracks_execution_cost() {
        let mut stats = StatsInner {
            index: 0,
            timeout_ms: 1_000,
            last_timeout_ms: 400,
            logs: Vec::new(),
        };
        // Slow task dominates.
        update_timeout(&mut stats, 5_000);
        assert_eq!(stats.timeout_ms, 5_000);
        // Fast task decays toward timeout/10, floored by last_timeout/10.
        update_timeout(&mut stats, 1);
        assert_eq!(stats.timeout_ms, 500);
        stats.last_timeout_ms = 0;
        update_timeout(&mut stats, 1);
        assert_eq!(stats.timeout_ms, 50);
    }

    #[test]
    fn explicit_zero_timeout_snapshots_pacing() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();
        let queue = TaskQueue::new(test_config());
        queue.start(250, false);
        assert_eq!(queue.stats().timeout_ms, 250);
        queue.start(0, true);
        let stats = queue.stats();
        assert_eq!(stats.timeout_ms, 0);
        assert_eq!(stats.last_timeout_ms, 250);
    }
}
