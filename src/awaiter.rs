//! One-shot settleable events and the subscription contract.
//!
//! [`Awaiter`] is the smallest settleable thing in the runtime: it settles
//! exactly once, remembers its outcome forever, and delivers that outcome to
//! every subscriber through the dispatch loop. Tasks and checkpoints both
//! implement the same [`Awaitable`] contract, so anything that can settle can
//! be waited on uniformly.
//!
//! Subscriptions are token-based: [`Awaitable::subscribe`] hands back a
//! [`SubscriptionId`] that [`Awaitable::unsubscribe`] retracts. A callback
//! retracted before the event settles is dropped without ever running.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use smallvec::SmallVec;

use crate::dispatch::Dispatch;
use crate::error::{Error, Result};
use crate::task::TaskId;
use crate::value::Value;

/// Token identifying one subscription on one awaitable.
///
/// Only meaningful to the awaitable that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

/// A one-shot settlement callback.
///
/// Carries the identity of the task that created it (when one did) so an
/// awaitable can reject a task subscribing to itself.
pub struct Callback {
    f: Box<dyn FnOnce(Result<Value>)>,
    origin: Option<TaskId>,
}

impl Callback {
    /// Wraps a plain closure with no task identity.
    #[must_use]
    pub fn new(f: impl FnOnce(Result<Value>) + 'static) -> Self {
        Self {
            f: Box::new(f),
            origin: None,
        }
    }

    pub(crate) fn with_origin(f: impl FnOnce(Result<Value>) + 'static, origin: TaskId) -> Self {
        Self {
            f: Box::new(f),
            origin: Some(origin),
        }
    }

    /// The task this callback would resume, if it came from one.
    #[must_use]
    pub fn origin(&self) -> Option<TaskId> {
        self.origin
    }

    pub(crate) fn invoke(self, outcome: Result<Value>) {
        (self.f)(outcome);
    }
}

impl core::fmt::Debug for Callback {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Callback").field("origin", &self.origin).finish()
    }
}

/// The contract shared by everything that settles exactly once.
///
/// Implemented by [`Awaiter`], task handles, and checkpoints. Settlement
/// callbacks always run on a later dispatch turn, including subscriptions
/// made after the event has already settled.
pub trait Awaitable {
    /// Registers `callback` to receive the settlement outcome.
    ///
    /// # Errors
    ///
    /// Implementations may reject contract-violating subscriptions, such as a
    /// task awaiting its own completion.
    fn subscribe(&self, callback: Callback) -> Result<SubscriptionId>;

    /// Retracts a subscription. Unknown or already-delivered tokens are
    /// ignored.
    fn unsubscribe(&self, id: SubscriptionId);

    /// True once the event has settled.
    fn is_done(&self) -> bool;

    /// Requests cooperative cancellation. Settled or non-cancelable targets
    /// ignore the request.
    fn cancel(&self, message: &str) {
        let _ = message;
    }
}

struct AwaiterState {
    outcome: Option<Result<Value>>,
    subs: SmallVec<[(SubscriptionId, Callback); 2]>,
    next_sub: u64,
    wakers: Vec<Waker>,
}

struct AwaiterInner {
    dispatch: Dispatch,
    state: RefCell<AwaiterState>,
}

/// A one-shot event: settle once, deliver to everyone, remember forever.
#[derive(Clone)]
pub struct Awaiter {
    inner: Rc<AwaiterInner>,
}

impl Awaiter {
    /// Creates an unsettled awaiter bound to `dispatch`.
    #[must_use]
    pub fn new(dispatch: &Dispatch) -> Self {
        Self {
            inner: Rc::new(AwaiterInner {
                dispatch: dispatch.clone(),
                state: RefCell::new(AwaiterState {
                    outcome: None,
                    subs: SmallVec::new(),
                    next_sub: 0,
                    wakers: Vec::new(),
                }),
            }),
        }
    }

    /// Settles with `outcome`. The first settlement wins; later calls are
    /// ignored. Every subscriber is notified on a later dispatch turn.
    pub fn settle(&self, outcome: Result<Value>) {
        let (subs, wakers) = {
            let mut st = self.inner.state.borrow_mut();
            if st.outcome.is_some() {
                tracing::trace!("late settlement ignored");
                return;
            }
            st.outcome = Some(outcome);
            (std::mem::take(&mut st.subs), std::mem::take(&mut st.wakers))
        };
        for (_, cb) in subs {
            let inner = Rc::clone(&self.inner);
            self.inner.dispatch.schedule(move || {
                let outcome = inner
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

    /// Settles successfully with `value`.
    pub fn resolve(&self, value: Value) {
        self.settle(Ok(value));
    }

    /// Settles with `error`.
    pub fn reject(&self, error: Error) {
        self.settle(Err(error));
    }

    /// The settled result value, if resolved.
    #[must_use]
    pub fn result(&self) -> Option<Value> {
        match &self.inner.state.borrow().outcome {
            Some(Ok(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// The settled error, if rejected.
    #[must_use]
    pub fn error(&self) -> Option<Error> {
        match &self.inner.state.borrow().outcome {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// The number of callbacks still waiting for settlement.
    #[must_use]
    pub fn pending_subscribers(&self) -> usize {
        self.inner.state.borrow().subs.len()
    }
}

impl Awaitable for Awaiter {
    fn subscribe(&self, callback: Callback) -> Result<SubscriptionId> {
        let mut st = self.inner.state.borrow_mut();
        let id = SubscriptionId(st.next_sub);
        st.next_sub += 1;
        if let Some(outcome) = st.outcome.clone() {
            drop(st);
            self.inner.dispatch.schedule(move || callback.invoke(outcome));
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
        self.inner.state.borrow().outcome.is_some()
    }
}

impl Future for Awaiter {
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

impl core::fmt::Debug for Awaiter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let st = self.inner.state.borrow();
        f.debug_struct("Awaiter")
            .field("done", &st.outcome.is_some())
            .field("pending_subscribers", &st.subs.len())
            .finish()
    }
}
