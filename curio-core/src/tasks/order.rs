//! Task representation and the two heap orderings.
//!
//! Every queued task lives in two binary heaps at once: the main heap picks
//! the next task to execute, the auxiliary heap picks the next task to evict
//! under overload. The orderings are mirror images of each other, with one
//! shared rule: a non-negative priority always beats a negative one, so
//! negative priorities mark background work that is shed first.

use std::cmp::Ordering;
use std::sync::atomic::AtomicBool;

use parking_lot::Mutex;

use futures::future::BoxFuture;

use crate::error::Result;

/// Type-erased task body: a one-shot closure producing the task future.
pub type TaskFuture = BoxFuture<'static, Result<()>>;
pub type TaskFn = Box<dyn FnOnce() -> TaskFuture + Send + 'static>;

/// A task as held by the queue's heaps.
///
/// Shared via `Arc` between the main and auxiliary heaps; eviction flips
/// `canceled` and execution takes `job` exactly once.
pub(crate) struct ScheduledTask {
    /// Monotonic insertion counter, used as a deterministic tie-break.
    pub(crate) seq: u64,
    /// Lower runs sooner; `None` behaves as positive infinity.
    pub(crate) priority: Option<i64>,
    /// Set by eviction; checked (not enforced) at dispatch.
    pub(crate) canceled: AtomicBool,
    pub(crate) job: Mutex<Option<TaskFn>>,
}

impl ScheduledTask {
    pub(crate) fn new(seq: u64, priority: Option<i64>, job: TaskFn) -> Self {
        Self {
            seq,
            priority,
            canceled: AtomicBool::new(false),
            job: Mutex::new(Some(job)),
        }
    }

    fn is_negative(&self) -> bool {
        self.priority.is_some_and(|priority| priority < 0)
    }

    fn effective_priority(&self) -> i64 {
        self.priority.unwrap_or(i64::MAX)
    }
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("seq", &self.seq)
            .field("priority", &self.priority)
            .field(
                "canceled",
                &self.canceled.load(std::sync::atomic::Ordering::Relaxed),
            )
            .finish()
    }
}

/// Execution order: smaller sorts first.
///
/// Missing priority runs last; when exactly one side is negative the
/// non-negative side wins; otherwise ascending numeric priority, ties broken
/// by insertion order.
pub(crate) fn execution_cmp(a: &ScheduledTask, b: &ScheduledTask) -> Ordering {
    match (a.is_negative(), b.is_negative()) {
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        _ => a
            .effective_priority()
            .cmp(&b.effective_priority())
            .then_with(|| a.seq.cmp(&b.seq)),
    }
}

/// Eviction order: smaller sorts first, i.e. is evicted first.
///
/// The mirror image of [`execution_cmp`]: negatives straddling zero are the
/// first eviction candidates, and among same-sign priorities the numerically
/// largest (least urgent) goes first. Ties evict the oldest insertion.
pub(crate) fn eviction_cmp(a: &ScheduledTask, b: &ScheduledTask) -> Ordering {
    match (a.is_negative(), b.is_negative()) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => b
            .effective_priority()
            .cmp(&a.effective_priority())
            .then_with(|| a.seq.cmp(&b.seq)),
    }
}

/// `BinaryHeap` wrapper whose maximum is the next task to execute.
#[derive(Debug)]
pub(crate) struct ExecOrder(pub(crate) std::sync::Arc<ScheduledTask>);

impl PartialEq for ExecOrder {
    fn eq(&self, other: &Self) -> bool {
        self.0.seq == other.0.seq
    }
}

impl Eq for ExecOrder {}

impl PartialOrd for ExecOrder {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ExecOrder {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: std's BinaryHeap is a max-heap, we want the smallest
        // execution order on top.
        execution_cmp(&other.0, &self.0)
    }
}

/// `BinaryHeap` wrapper whose maximum is the next task to evict.
#[derive(Debug)]
pub(crate) struct EvictOrder(pub(crate) std::sync::Arc<ScheduledTask>);

impl PartialEq for EvictOrder {
    fn eq(&self, other: &Self) -> bool {
        self.0.seq == other.0.seq
    }
}

impl Eq for EvictOrder {}

impl PartialOrd for EvictOrder {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictOrder {
    fn cmp(&self, other: &Self) -> Ordering {
        eviction_cmp(&other.0, &self.0)
    }
}
