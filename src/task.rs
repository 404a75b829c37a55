//! Tasks, the resumption protocol, and the driver loop.
//!
//! A task is a body of work that runs in slices. Each slice is one call to
//! [`StepSource::resume`]: the driver delivers an input (a resumption payload
//! or an error), the body runs until it either suspends again or finishes.
//! Between slices the task owns no stack; everything it needs lives in its
//! [`StepSource`] state.
//!
//! Resumptions are one-shot and generation-guarded. A [`ResumeHandle`] minted
//! during slice `N` can resume the task at most once, and only while the task
//! is still suspended at slice `N`: when several handles race, the first
//! delivery wins and every sibling is silently dropped as stale.
//!
//! Cancellation is cooperative and latched. [`TaskHandle::cancel`] records a
//! request once, permanently: the driver converts *every* later resumption
//! into the cancellation error, a running body can observe the request early
//! through [`TaskCx::checkpoint`], and further `cancel` calls are no-ops. A
//! body may trap the error to clean up, but suspending again just re-raises
//! it; the only exits from a canceled task are `Done` outcomes. The very
//! first slice always runs uncancelled, so a plain function body is never
//! silently skipped.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker};

use smallvec::SmallVec;

use crate::awaiter::{Awaitable, Callback, SubscriptionId};
use crate::dispatch::{Dispatch, Time, Wakeable};
use crate::error::{Error, Result, UsageError};
use crate::value::Value;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of a task within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn raw(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for TaskId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// What a body reports at the end of a slice.
pub enum Step {
    /// The body arranged to be resumed later and yields the thread.
    Suspended,
    /// The body finished with this outcome.
    Done(Result<Value>),
}

/// A resumable body of work.
///
/// The driver calls [`StepSource::resume`] once per slice. `input` is the
/// payload the resumption carried: `Ok` with the resume value, or `Err` when
/// the awaited thing failed or the task was canceled. A body that returns
/// [`Step::Suspended`] must have arranged a future resumption first (via a
/// [`ResumeHandle`] or [`TaskCx::wait_on`]), or it will never run again.
pub trait StepSource {
    /// Runs one slice of the body.
    fn resume(&mut self, cx: &TaskCx, input: Result<Value>) -> Step;
}

impl<F> StepSource for F
where
    F: FnMut(&TaskCx, Result<Value>) -> Step,
{
    fn resume(&mut self, cx: &TaskCx, input: Result<Value>) -> Step {
        self(cx, input)
    }
}

struct Listener {
    f: Rc<dyn Fn(&[Value])>,
    once: bool,
}

struct TaskState {
    completed: bool,
    running: bool,
    outcome: Option<Result<Value>>,
    cancel_requested: bool,
    cancel_message: Option<String>,
    cancel_hook: Option<Box<dyn FnOnce(&str)>>,
    generation: u64,
    resumed_at: Time,
    body: Option<Box<dyn StepSource>>,
    subs: SmallVec<[(SubscriptionId, Callback); 2]>,
    next_sub: u64,
    wakers: Vec<Waker>,
    listeners: HashMap<String, Vec<Listener>>,
}

pub(crate) struct TaskInner {
    id: TaskId,
    dispatch: Dispatch,
    weak: Weak<TaskInner>,
    state: RefCell<TaskState>,
}

impl TaskInner {
    fn new(dispatch: &Dispatch, body: Box<dyn StepSource>) -> Rc<Self> {
        let id = TaskId::next();
        let now = dispatch.now();
        Rc::new_cyclic(|weak| Self {
            id,
            dispatch: dispatch.clone(),
            weak: weak.clone(),
            state: RefCell::new(TaskState {
                completed: false,
                running: false,
                outcome: None,
                cancel_requested: false,
                cancel_message: None,
                cancel_hook: None,
                generation: 0,
                resumed_at: now,
                body: Some(body),
                subs: SmallVec::new(),
                next_sub: 0,
                wakers: Vec::new(),
                listeners: HashMap::new(),
            }),
        })
    }

    /// Runs one slice. `guard`, when present, is the generation the caller
    /// observed at suspension; a mismatch means another resumption won the
    /// race and this one is stale.
    fn deliver(self: Rc<Self>, event: Result<Value>, guard: Option<u64>) {
        let (input, hook, msg, mut body) = {
            let mut st = self.state.borrow_mut();
            if st.completed {
                return;
            }
            if let Some(g) = guard {
                if g != st.generation {
                    tracing::trace!(task = %self.id, "stale resumption dropped");
                    return;
                }
            }
            let first = st.generation == 0;
            st.generation += 1;
            st.running = true;
            st.resumed_at = self.dispatch.now();

            let mut hook = None;
            let mut msg = String::new();
            let input = if !first && st.cancel_requested {
                // The latch never resets; only the hook is one-shot.
                hook = st.cancel_hook.take();
                msg = st.cancel_message.clone().unwrap_or_default();
                Err(Error::canceled(msg.clone()))
            } else {
                event.map_err(|e| e.with_context(format!("resumed {}", self.id)))
            };
            let Some(body) = st.body.take() else {
                return;
            };
            (input, hook, msg, body)
        };

        if let Some(hook) = hook {
            hook(&msg);
        }

        let cx = TaskCx {
            task: Rc::clone(&self),
        };
        let step = body.resume(&cx, input);

        let mut st = self.state.borrow_mut();
        st.running = false;
        match step {
            Step::Suspended => {
                st.body = Some(body);
                if st.cancel_requested {
                    let gen = st.generation;
                    drop(st);
                    let this = Rc::clone(&self);
                    self.dispatch
                        .schedule(move || this.deliver(Ok(Value::null()), Some(gen)));
                }
            }
            Step::Done(outcome) => {
                st.completed = true;
                st.outcome = Some(outcome);
                let subs = std::mem::take(&mut st.subs);
                let wakers = std::mem::take(&mut st.wakers);
                drop(st);
                tracing::debug!(task = %self.id, "task completed");
                self.dispatch.unregister_wakeable(self.id.raw());
                for (_, cb) in subs {
                    let this = Rc::clone(&self);
                    self.dispatch.schedule(move || {
                        let outcome = this
                            .state
                            .borrow()
                            .outcome
                            .clone()
                            .unwrap_or_else(|| Ok(Value::null()));
                        cb.invoke(outcome);
                    });
                }
                for w in wakers {
                    w.wake();
                }
            }
        }
    }

    fn schedule_deliver(this: &Rc<Self>, event: Result<Value>, guard: Option<u64>) {
        let target = Rc::clone(this);
        this.dispatch.schedule(move || target.deliver(event, guard));
    }
}

impl Wakeable for TaskInner {
    fn wake_resume(&self) {
        if let Some(this) = self.weak.upgrade() {
            TaskInner::schedule_deliver(&this, Ok(Value::null()), None);
        }
    }
}

struct ResumeShared {
    task: Rc<TaskInner>,
    generation: u64,
    fired: Cell<bool>,
}

/// A one-shot handle that resumes a suspended task.
///
/// Minted by [`TaskCx::resume_handle`] before the body suspends. The handle
/// fires at most once, and only while the suspension it was minted for is
/// still current: stale or duplicate firings are dropped silently.
#[derive(Clone)]
pub struct ResumeHandle {
    shared: Rc<ResumeShared>,
}

impl ResumeHandle {
    /// Resumes the task with `outcome`.
    pub fn resume(&self, outcome: Result<Value>) {
        if self.shared.fired.replace(true) {
            tracing::trace!(task = %self.shared.task.id, "resume handle already fired");
            return;
        }
        TaskInner::schedule_deliver(&self.shared.task, outcome, Some(self.shared.generation));
    }

    /// Resumes the task with a successful payload.
    pub fn resolve(&self, value: Value) {
        self.resume(Ok(value));
    }

    /// Resumes the task with an error.
    pub fn reject(&self, error: Error) {
        self.resume(Err(error));
    }

    /// Converts the handle into a settlement callback carrying the task's
    /// identity, suitable for [`Awaitable::subscribe`].
    #[must_use]
    pub fn into_callback(self) -> Callback {
        let origin = self.shared.task.id;
        Callback::with_origin(move |outcome| self.resume(outcome), origin)
    }
}

impl core::fmt::Debug for ResumeHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResumeHandle")
            .field("task", &self.shared.task.id)
            .field("generation", &self.shared.generation)
            .field("fired", &self.shared.fired.get())
            .finish()
    }
}

/// The body's view of its own task, passed into every slice.
pub struct TaskCx {
    task: Rc<TaskInner>,
}

impl TaskCx {
    /// This task's identity.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.task.id
    }

    /// A completion handle for this task.
    #[must_use]
    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            inner: Rc::clone(&self.task),
        }
    }

    /// The dispatch loop this task runs on.
    #[must_use]
    pub fn dispatch(&self) -> &Dispatch {
        &self.task.dispatch
    }

    /// Mints a one-shot resume handle for the upcoming suspension.
    #[must_use]
    pub fn resume_handle(&self) -> ResumeHandle {
        let generation = self.task.state.borrow().generation;
        ResumeHandle {
            shared: Rc::new(ResumeShared {
                task: Rc::clone(&self.task),
                generation,
                fired: Cell::new(false),
            }),
        }
    }

    /// Surfaces a pending cancellation request mid-slice.
    ///
    /// A no-op until the task is canceled; from then on every call returns
    /// the cancellation error. The hook runs on the first observation only.
    ///
    /// # Errors
    ///
    /// Returns the cancellation error when cancellation was requested.
    pub fn checkpoint(&self) -> Result<()> {
        let (hook, msg) = {
            let mut st = self.task.state.borrow_mut();
            if !st.cancel_requested {
                return Ok(());
            }
            (
                st.cancel_hook.take(),
                st.cancel_message.clone().unwrap_or_default(),
            )
        };
        if let Some(hook) = hook {
            hook(&msg);
        }
        Err(Error::canceled(msg))
    }

    /// Installs a hook that runs once when cancellation is delivered.
    /// Replaces any previously installed hook.
    pub fn on_cancel(&self, hook: impl FnOnce(&str) + 'static) {
        self.task.state.borrow_mut().cancel_hook = Some(Box::new(hook));
    }

    /// Subscribes this task's resume handle to `target`, so the target's
    /// settlement becomes the next slice's input.
    ///
    /// # Errors
    ///
    /// Returns a usage error if the target is this task itself.
    pub fn wait_on(&self, target: &dyn Awaitable) -> Result<()> {
        target.subscribe(self.resume_handle().into_callback())?;
        Ok(())
    }

    pub(crate) fn waker(&self) -> Waker {
        self.task.dispatch.waker_for(self.task.id.raw())
    }
}

impl core::fmt::Debug for TaskCx {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskCx").field("task", &self.task.id).finish()
    }
}

/// External handle to a task: await it, cancel it, talk to it over channels.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Rc<TaskInner>,
}

impl TaskHandle {
    /// The task's identity.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// The completed result value, if the task finished successfully.
    #[must_use]
    pub fn result(&self) -> Option<Value> {
        match &self.inner.state.borrow().outcome {
            Some(Ok(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// The completion error, if the task failed or was canceled.
    #[must_use]
    pub fn error(&self) -> Option<Error> {
        match &self.inner.state.borrow().outcome {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// Virtual time of the task's most recent slice start.
    #[must_use]
    pub fn last_resumed_at(&self) -> Time {
        self.inner.state.borrow().resumed_at
    }

    /// Requests cooperative cancellation with a reason.
    ///
    /// Only the first call has effect; later calls and calls on completed
    /// tasks are ignored. A suspended task gets a prompt cancellation
    /// delivery; a running one observes the request at its next suspension
    /// or [`TaskCx::checkpoint`] call.
    pub fn cancel(&self, message: &str) {
        let mut st = self.inner.state.borrow_mut();
        if st.completed || st.cancel_requested {
            return;
        }
        st.cancel_requested = true;
        st.cancel_message = Some(message.to_string());
        tracing::debug!(task = %self.inner.id, message, "cancellation requested");
        if !st.running {
            let gen = st.generation;
            drop(st);
            TaskInner::schedule_deliver(&self.inner, Ok(Value::null()), Some(gen));
        }
    }

    /// Registers a listener on a named channel.
    ///
    /// Adding the same listener (by pointer identity) twice on one channel is
    /// a no-op.
    pub fn on(&self, channel: &str, listener: Rc<dyn Fn(&[Value])>) {
        self.add_listener(channel, listener, false);
    }

    /// Registers a listener that is removed after its first delivery.
    pub fn once(&self, channel: &str, listener: Rc<dyn Fn(&[Value])>) {
        self.add_listener(channel, listener, true);
    }

    fn add_listener(&self, channel: &str, listener: Rc<dyn Fn(&[Value])>, once: bool) {
        let mut st = self.inner.state.borrow_mut();
        let listeners = st.listeners.entry(channel.to_string()).or_default();
        if listeners.iter().any(|l| Rc::ptr_eq(&l.f, &listener)) {
            return;
        }
        listeners.push(Listener { f: listener, once });
    }

    /// Removes one listener from a channel, matched by pointer identity.
    pub fn remove_listener(&self, channel: &str, listener: &Rc<dyn Fn(&[Value])>) {
        let mut st = self.inner.state.borrow_mut();
        if let Some(listeners) = st.listeners.get_mut(channel) {
            listeners.retain(|l| !Rc::ptr_eq(&l.f, listener));
        }
    }

    /// Removes every listener from a channel.
    pub fn remove_all_listeners(&self, channel: &str) {
        self.inner.state.borrow_mut().listeners.remove(channel);
    }

    /// Emits `args` to every listener on `channel`.
    ///
    /// Each listener runs on its own later dispatch turn; one-shot listeners
    /// are removed before delivery begins.
    pub fn emit(&self, channel: &str, args: Vec<Value>) {
        let targets: Vec<Rc<dyn Fn(&[Value])>> = {
            let mut st = self.inner.state.borrow_mut();
            let Some(listeners) = st.listeners.get_mut(channel) else {
                return;
            };
            let targets = listeners.iter().map(|l| Rc::clone(&l.f)).collect();
            listeners.retain(|l| !l.once);
            targets
        };
        let args = Rc::new(args);
        for target in targets {
            let args = Rc::clone(&args);
            self.inner.dispatch.schedule(move || target(&args));
        }
    }
}

impl Awaitable for TaskHandle {
    fn subscribe(&self, callback: Callback) -> Result<SubscriptionId> {
        if callback.origin() == Some(self.inner.id) {
            return Err(Error::usage(UsageError::SelfAwait));
        }
        let mut st = self.inner.state.borrow_mut();
        let id = SubscriptionId(st.next_sub);
        st.next_sub += 1;
        if let Some(outcome) = st.outcome.clone() {
            drop(st);
            self.inner
                .dispatch
                .schedule(move || callback.invoke(outcome));
        } else {
            st.subs.push((id, callback));
        }
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.inner
            .state
            .borrow_mut()
            .subs
            .retain(|(sub, _)| *sub != id);
    }

    fn is_done(&self) -> bool {
        self.inner.state.borrow().completed
    }

    fn cancel(&self, message: &str) {
        TaskHandle::cancel(self, message);
    }
}

impl Future for TaskHandle {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut st = self.inner.state.borrow_mut();
        if let Some(outcome) = st.outcome.clone() {
            return Poll::Ready(outcome);
        }
        st.wakers.push(cx.waker().clone());
        Poll::Pending
    }
}

impl core::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let st = self.inner.state.borrow();
        f.debug_struct("TaskHandle")
            .field("id", &self.inner.id)
            .field("completed", &st.completed)
            .field("generation", &st.generation)
            .finish()
    }
}

fn launch(dispatch: &Dispatch, body: Box<dyn StepSource>) -> TaskHandle {
    let inner = TaskInner::new(dispatch, body);
    let wakeable = Rc::downgrade(&inner) as Weak<dyn Wakeable>;
    dispatch.register_wakeable(inner.id.raw(), wakeable);
    tracing::debug!(task = %inner.id, "task started");
    TaskInner::schedule_deliver(&inner, Ok(Value::null()), None);
    TaskHandle { inner }
}

/// Starts a sliced task from a step source. The first slice runs on a later
/// dispatch turn with a null input.
pub fn start(dispatch: &Dispatch, source: impl StepSource + 'static) -> TaskHandle {
    launch(dispatch, Box::new(source))
}

struct FnSource<F>(Option<F>);

impl<F> StepSource for FnSource<F>
where
    F: FnOnce(&TaskCx) -> Result<Value>,
{
    fn resume(&mut self, cx: &TaskCx, input: Result<Value>) -> Step {
        match self.0.take() {
            Some(f) => match input {
                Ok(_) => Step::Done(f(cx)),
                Err(e) => Step::Done(Err(e)),
            },
            None => Step::Done(input),
        }
    }
}

/// Starts a task whose whole body is a single function slice.
pub fn start_fn(
    dispatch: &Dispatch,
    f: impl FnOnce(&TaskCx) -> Result<Value> + 'static,
) -> TaskHandle {
    launch(dispatch, Box::new(FnSource(Some(f))))
}

/// Starts a task running a method on a shared receiver.
pub fn start_method<O: 'static>(
    dispatch: &Dispatch,
    receiver: Rc<O>,
    f: impl FnOnce(Rc<O>, &TaskCx) -> Result<Value> + 'static,
) -> TaskHandle {
    start_fn(dispatch, move |cx| f(receiver, cx))
}

struct FutureSource {
    fut: Option<Pin<Box<dyn Future<Output = Result<Value>>>>>,
}

impl StepSource for FutureSource {
    fn resume(&mut self, cx: &TaskCx, input: Result<Value>) -> Step {
        if let Err(e) = input {
            self.fut = None;
            return Step::Done(Err(e));
        }
        let Some(fut) = self.fut.as_mut() else {
            return Step::Done(Ok(Value::null()));
        };
        let waker = cx.waker();
        let mut fcx = Context::from_waker(&waker);
        match fut.as_mut().poll(&mut fcx) {
            Poll::Ready(outcome) => {
                self.fut = None;
                Step::Done(outcome)
            }
            Poll::Pending => Step::Suspended,
        }
    }
}

/// Starts a task that drives a standard future to completion.
///
/// The future is polled once per slice and woken through the dispatch loop.
/// Cancellation drops the future and completes the task with the
/// cancellation error.
pub fn start_future(
    dispatch: &Dispatch,
    fut: impl Future<Output = Result<Value>> + 'static,
) -> TaskHandle {
    launch(
        dispatch,
        Box::new(FutureSource {
            fut: Some(Box::pin(fut)),
        }),
    )
}

struct AwaitableSource {
    target: Option<Rc<dyn Awaitable>>,
}

impl StepSource for AwaitableSource {
    fn resume(&mut self, cx: &TaskCx, input: Result<Value>) -> Step {
        match self.target.take() {
            Some(target) => {
                if let Err(e) = input {
                    return Step::Done(Err(e));
                }
                match cx.wait_on(target.as_ref()) {
                    Ok(()) => Step::Suspended,
                    Err(e) => Step::Done(Err(e)),
                }
            }
            None => Step::Done(input),
        }
    }
}

/// Starts a proxy task that completes with the settlement of `target`.
pub fn start_awaitable(dispatch: &Dispatch, target: Rc<dyn Awaitable>) -> TaskHandle {
    launch(
        dispatch,
        Box::new(AwaitableSource {
            target: Some(target),
        }),
    )
}
