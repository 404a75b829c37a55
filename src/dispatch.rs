//! The deferred-dispatch loop every cross-boundary notification rides on.
//!
//! [`Dispatch`] is a single-threaded callback queue with a virtual clock:
//! - [`Dispatch::schedule`] runs a callback on a *later* turn of the loop,
//!   never synchronously and never re-entrantly into the scheduling call.
//! - [`Dispatch::schedule_after`] arms a timer against the virtual clock; when
//!   the ready queue drains, the loop advances time to the earliest deadline.
//!
//! The loop is deterministic: callbacks run in FIFO order, timers in deadline
//! order with insertion-sequence tie-breaking. Tests drive it with
//! [`Dispatch::run_until_quiescent`].
//!
//! Standard wakers must be `Send + Sync`, so future-driven tasks wake through
//! an `Arc<Mutex<_>>` list of raw task ids that the loop drains each step and
//! resolves against a registry of weak [`Wakeable`] targets.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};
use std::task::{Wake, Waker};
use std::time::Duration;

/// A point on the dispatch loop's virtual clock, in nanoseconds from start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(u64);

impl Time {
    /// The zero time.
    pub const ZERO: Self = Self(0);

    /// A time `millis` milliseconds from zero.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Nanoseconds from zero.
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// This time advanced by `delta`, saturating.
    #[must_use]
    pub fn saturating_add(self, delta: Duration) -> Self {
        let nanos = u64::try_from(delta.as_nanos()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(nanos))
    }

    /// Elapsed duration since `earlier`, zero if `earlier` is in the future.
    #[must_use]
    pub fn duration_since(self, earlier: Self) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

/// Something a standard waker can ask to be resumed.
pub(crate) trait Wakeable {
    /// Schedules a bare resumption of the target.
    fn wake_resume(&self);
}

/// Configuration for a dispatch loop.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Step limit for [`Dispatch::run_until_quiescent`]; `None` is unbounded.
    pub max_steps: Option<u64>,
    /// Initial virtual time.
    pub start_time: Time,
}

impl DispatchConfig {
    /// The default configuration: unbounded, starting at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_steps: None,
            start_time: Time::ZERO,
        }
    }

    /// Sets the step limit.
    #[must_use]
    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    /// Sets the initial virtual time.
    #[must_use]
    pub fn with_start_time(mut self, start_time: Time) -> Self {
        self.start_time = start_time;
        self
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct TimerEntry {
    deadline: Time,
    seq: u64,
    callback: Box<dyn FnOnce()>,
}

struct DispatchInner {
    queue: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    timers: RefCell<Vec<TimerEntry>>,
    now: Cell<Time>,
    steps: Cell<u64>,
    timer_seq: Cell<u64>,
    max_steps: Option<u64>,
    wakes: Arc<Mutex<Vec<u64>>>,
    wakeables: RefCell<HashMap<u64, Weak<dyn Wakeable>>>,
}

/// Handle to a single-threaded deferred-dispatch loop.
///
/// Cloning is cheap; all clones drive the same loop.
#[derive(Clone)]
pub struct Dispatch {
    inner: Rc<DispatchInner>,
}

impl Dispatch {
    /// Creates a loop with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(DispatchConfig::new())
    }

    /// Creates a loop with the given configuration.
    #[must_use]
    pub fn with_config(config: DispatchConfig) -> Self {
        Self {
            inner: Rc::new(DispatchInner {
                queue: RefCell::new(VecDeque::new()),
                timers: RefCell::new(Vec::new()),
                now: Cell::new(config.start_time),
                steps: Cell::new(0),
                timer_seq: Cell::new(0),
                max_steps: config.max_steps,
                wakes: Arc::new(Mutex::new(Vec::new())),
                wakeables: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// Enqueues `callback` for a later turn of the loop.
    ///
    /// The callback never runs inside this call and runs at most once.
    pub fn schedule(&self, callback: impl FnOnce() + 'static) {
        self.inner.queue.borrow_mut().push_back(Box::new(callback));
    }

    /// Arms `callback` to run once the virtual clock reaches `now + delay`.
    pub fn schedule_after(&self, delay: Duration, callback: impl FnOnce() + 'static) {
        let seq = self.inner.timer_seq.get();
        self.inner.timer_seq.set(seq + 1);
        self.inner.timers.borrow_mut().push(TimerEntry {
            deadline: self.now().saturating_add(delay),
            seq,
            callback: Box::new(callback),
        });
    }

    /// The current virtual time.
    #[must_use]
    pub fn now(&self) -> Time {
        self.inner.now.get()
    }

    /// The number of callbacks executed so far.
    #[must_use]
    pub fn steps(&self) -> u64 {
        self.inner.steps.get()
    }

    /// True if nothing is queued, armed, or waiting to be woken.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.inner.queue.borrow().is_empty()
            && self.inner.timers.borrow().is_empty()
            && self.inner.wakes.lock().expect("lock poisoned").is_empty()
    }

    /// Runs one callback. Drains pending wakes first; when the ready queue is
    /// empty, advances the clock to the earliest timer deadline.
    ///
    /// Returns false if there was nothing to run.
    pub fn step(&self) -> bool {
        self.drain_wakes();

        let job = self.inner.queue.borrow_mut().pop_front();
        if let Some(job) = job {
            self.inner.steps.set(self.inner.steps.get() + 1);
            job();
            return true;
        }

        let entry = {
            let mut timers = self.inner.timers.borrow_mut();
            let next = timers
                .iter()
                .enumerate()
                .min_by_key(|(_, t)| (t.deadline, t.seq))
                .map(|(i, _)| i);
            next.map(|i| timers.remove(i))
        };
        let Some(entry) = entry else {
            return false;
        };
        if entry.deadline > self.now() {
            tracing::trace!(nanos = entry.deadline.as_nanos(), "advancing virtual clock");
            self.inner.now.set(entry.deadline);
        }
        self.inner.steps.set(self.inner.steps.get() + 1);
        (entry.callback)();
        true
    }

    /// Runs until quiescent or the configured step limit is reached.
    ///
    /// Returns the number of steps executed by this call.
    pub fn run_until_quiescent(&self) -> u64 {
        let start = self.steps();
        while !self.is_quiescent() {
            if let Some(max) = self.inner.max_steps {
                if self.steps() >= max {
                    tracing::debug!(max, "dispatch step limit reached");
                    break;
                }
            }
            if !self.step() {
                break;
            }
        }
        self.steps() - start
    }

    /// Builds a standard waker that requests a resumption of task `id`.
    pub(crate) fn waker_for(&self, id: u64) -> Waker {
        Waker::from(Arc::new(TaskWaker {
            id,
            wakes: Arc::clone(&self.inner.wakes),
        }))
    }

    pub(crate) fn register_wakeable(&self, id: u64, target: Weak<dyn Wakeable>) {
        self.inner.wakeables.borrow_mut().insert(id, target);
    }

    pub(crate) fn unregister_wakeable(&self, id: u64) {
        self.inner.wakeables.borrow_mut().remove(&id);
    }

    fn drain_wakes(&self) {
        let ids = {
            let mut wakes = self.inner.wakes.lock().expect("lock poisoned");
            std::mem::take(&mut *wakes)
        };
        for id in ids {
            let target = self.inner.wakeables.borrow().get(&id).cloned();
            if let Some(target) = target.and_then(|t| t.upgrade()) {
                target.wake_resume();
            }
        }
    }
}

impl Default for Dispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatch")
            .field("now", &self.now())
            .field("steps", &self.steps())
            .field("queued", &self.inner.queue.borrow().len())
            .field("timers", &self.inner.timers.borrow().len())
            .finish()
    }
}

struct TaskWaker {
    id: u64,
    wakes: Arc<Mutex<Vec<u64>>>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wakes.lock().expect("lock poisoned").push(self.id);
    }
}
