//! Checkpoints: waiting on many settleable things at once.
//!
//! A [`Checkpoint`] subscribes to a set of [`Awaitable`] inputs and itself
//! settles once enough of them have settled. The two families differ only in
//! the threshold: [`Checkpoint::all_of`] waits for every input,
//! [`Checkpoint::any_of`] for the first, and [`Checkpoint::first_of`] for an
//! arbitrary count.
//!
//! Inputs come in two shapes. The `_of` constructors take a nestable
//! [`Input`] tree, flatten it, and record outcomes in settlement order. The
//! `_in` and `_keyed` constructors keep positional or named slots so the
//! caller can attribute each outcome to the input that produced it.
//!
//! On settlement the checkpoint unsubscribes from every still-pending input,
//! so abandoned inputs never retain dead callbacks. With
//! [`Checkpoint::cancel_abandoned`] they are additionally canceled.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use crate::awaiter::{Awaitable, Awaiter, Callback, SubscriptionId};
use crate::dispatch::Dispatch;
use crate::error::{Error, Result, UsageError};
use crate::task::TaskHandle;
use crate::value::Value;

/// Settled outcomes of a checkpoint, in the shape its constructor chose.
#[derive(Debug, Clone)]
pub enum Slots<T> {
    /// Outcomes in settlement order. Used by the `_of` constructors.
    Appended(Vec<T>),
    /// One slot per input position; `None` where the input did not settle
    /// that way (or at all). Used by the `_in` constructors.
    Indexed(Vec<Option<T>>),
    /// One slot per input name. Used by the `_keyed` constructors.
    Keyed(BTreeMap<String, T>),
}

impl<T> Slots<T> {
    /// The number of outcomes present.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Appended(v) => v.len(),
            Self::Indexed(v) => v.iter().filter(|s| s.is_some()).count(),
            Self::Keyed(m) => m.len(),
        }
    }

    /// True if no outcome is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The outcome at `index`: settlement order for appended slots, input
    /// position for indexed ones, key order for keyed ones.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        match self {
            Self::Appended(v) => v.get(index),
            Self::Indexed(v) => v.get(index)?.as_ref(),
            Self::Keyed(m) => m.values().nth(index),
        }
    }

    /// The outcome recorded under `key`, for keyed slots.
    #[must_use]
    pub fn get_key(&self, key: &str) -> Option<&T> {
        match self {
            Self::Keyed(m) => m.get(key),
            _ => None,
        }
    }

    /// Every present outcome, in slot order.
    #[must_use]
    pub fn values(&self) -> Vec<&T> {
        match self {
            Self::Appended(v) => v.iter().collect(),
            Self::Indexed(v) => v.iter().filter_map(Option::as_ref).collect(),
            Self::Keyed(m) => m.values().collect(),
        }
    }

    fn record(&mut self, index: usize, key: Option<&str>, item: T) {
        match self {
            Self::Appended(v) => v.push(item),
            Self::Indexed(v) => v[index] = Some(item),
            Self::Keyed(m) => {
                m.insert(key.unwrap_or_default().to_string(), item);
            }
        }
    }
}

/// Everything a checkpoint collected by the time it settled.
#[derive(Debug, Clone)]
pub struct CheckpointOutcome {
    errors: Slots<Error>,
    results: Slots<Value>,
}

impl CheckpointOutcome {
    /// The errors inputs settled with.
    #[must_use]
    pub fn errors(&self) -> &Slots<Error> {
        &self.errors
    }

    /// The values inputs settled with.
    #[must_use]
    pub fn results(&self) -> &Slots<Value> {
        &self.results
    }

    /// True if no input failed.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl core::fmt::Display for CheckpointOutcome {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "checkpoint outcome: {} error(s), {} result(s)",
            self.errors.len(),
            self.results.len()
        )
    }
}

/// A nestable tree of checkpoint inputs, flattened depth-first.
pub enum Input {
    /// A single awaitable.
    One(Rc<dyn Awaitable>),
    /// A group of inputs, spliced in place.
    Many(Vec<Input>),
}

impl Input {
    fn flatten(self, out: &mut Vec<Rc<dyn Awaitable>>) {
        match self {
            Self::One(a) => out.push(a),
            Self::Many(group) => {
                for input in group {
                    input.flatten(out);
                }
            }
        }
    }
}

impl From<Awaiter> for Input {
    fn from(a: Awaiter) -> Self {
        Self::One(Rc::new(a))
    }
}

impl From<TaskHandle> for Input {
    fn from(t: TaskHandle) -> Self {
        Self::One(Rc::new(t))
    }
}

impl From<Checkpoint> for Input {
    fn from(c: Checkpoint) -> Self {
        Self::One(Rc::new(c))
    }
}

impl From<Rc<dyn Awaitable>> for Input {
    fn from(a: Rc<dyn Awaitable>) -> Self {
        Self::One(a)
    }
}

impl From<Vec<Input>> for Input {
    fn from(group: Vec<Input>) -> Self {
        Self::Many(group)
    }
}

struct Entry {
    target: Rc<dyn Awaitable>,
    key: Option<String>,
    sub: Option<SubscriptionId>,
}

struct EngineState {
    entries: Vec<Entry>,
    threshold: usize,
    completed: usize,
    stop_on_first_error: bool,
    cancel_abandoned: Option<String>,
    settled: bool,
    errors: Slots<Error>,
    results: Slots<Value>,
    outcome: Option<Rc<CheckpointOutcome>>,
}

struct CheckpointInner {
    final_awaiter: Awaiter,
    state: RefCell<EngineState>,
}

impl CheckpointInner {
    fn input_settled(&self, index: usize, outcome: Result<Value>) {
        let should_settle = {
            let mut st = self.state.borrow_mut();
            if st.settled {
                return;
            }
            st.entries[index].sub = None;
            let key = st.entries[index].key.clone();
            let errored = outcome.is_err();
            match outcome {
                Ok(v) => st.results.record(index, key.as_deref(), v),
                Err(e) => st.errors.record(index, key.as_deref(), e),
            }
            st.completed += 1;
            st.completed >= st.threshold || (errored && st.stop_on_first_error)
        };
        if should_settle {
            self.settle();
        }
    }

    fn settle(&self) {
        let (outcome, pending, abandon) = {
            let mut st = self.state.borrow_mut();
            if st.settled {
                return;
            }
            st.settled = true;
            let outcome = Rc::new(CheckpointOutcome {
                errors: std::mem::replace(&mut st.errors, Slots::Appended(Vec::new())),
                results: std::mem::replace(&mut st.results, Slots::Appended(Vec::new())),
            });
            st.outcome = Some(Rc::clone(&outcome));
            let pending: Vec<(Rc<dyn Awaitable>, SubscriptionId)> = st
                .entries
                .iter_mut()
                .filter_map(|e| e.sub.take().map(|sub| (Rc::clone(&e.target), sub)))
                .collect();
            (outcome, pending, st.cancel_abandoned.clone())
        };
        tracing::debug!(
            errors = outcome.errors().len(),
            results = outcome.results().len(),
            "checkpoint settled"
        );
        if outcome.is_ok() {
            self.final_awaiter.resolve(Value::from_rc(Rc::clone(&outcome)));
        } else {
            self.final_awaiter.reject(Error::aggregate(Rc::clone(&outcome)));
        }
        for (target, sub) in &pending {
            target.unsubscribe(*sub);
        }
        if let Some(message) = abandon {
            for (target, _) in &pending {
                if !target.is_done() {
                    target.cancel(&message);
                }
            }
        }
    }
}

/// A combinator over many awaitables, itself awaitable.
#[derive(Clone)]
pub struct Checkpoint {
    inner: Rc<CheckpointInner>,
}

impl Checkpoint {
    fn build(
        dispatch: &Dispatch,
        targets: Vec<(Option<String>, Rc<dyn Awaitable>)>,
        threshold: usize,
        errors: Slots<Error>,
        results: Slots<Value>,
    ) -> Self {
        let entries = targets
            .into_iter()
            .map(|(key, target)| Entry {
                target,
                key,
                sub: None,
            })
            .collect::<Vec<_>>();
        let inner = Rc::new(CheckpointInner {
            final_awaiter: Awaiter::new(dispatch),
            state: RefCell::new(EngineState {
                entries,
                threshold,
                completed: 0,
                stop_on_first_error: false,
                cancel_abandoned: None,
                settled: false,
                errors,
                results,
                outcome: None,
            }),
        });

        let count = inner.state.borrow().entries.len();
        for index in 0..count {
            let weak: Weak<CheckpointInner> = Rc::downgrade(&inner);
            let callback = Callback::new(move |outcome| {
                if let Some(inner) = weak.upgrade() {
                    inner.input_settled(index, outcome);
                }
            });
            let target = Rc::clone(&inner.state.borrow().entries[index].target);
            match target.subscribe(callback) {
                Ok(sub) => {
                    let mut st = inner.state.borrow_mut();
                    if !st.settled && st.entries[index].sub.is_none() {
                        st.entries[index].sub = Some(sub);
                    }
                }
                Err(e) => inner.input_settled(index, Err(e)),
            }
        }

        if threshold == 0 {
            inner.settle();
        }
        Self { inner }
    }

    fn flatten_inputs(inputs: Vec<Input>) -> Vec<(Option<String>, Rc<dyn Awaitable>)> {
        let mut flat = Vec::new();
        for input in inputs {
            input.flatten(&mut flat);
        }
        flat.into_iter().map(|a| (None, a)).collect()
    }

    /// Waits for every input to settle.
    #[must_use]
    pub fn all_of(dispatch: &Dispatch, inputs: Vec<Input>) -> Self {
        let targets = Self::flatten_inputs(inputs);
        let threshold = targets.len();
        Self::build(
            dispatch,
            targets,
            threshold,
            Slots::Appended(Vec::new()),
            Slots::Appended(Vec::new()),
        )
    }

    /// Settles with the first input to settle.
    #[must_use]
    pub fn any_of(dispatch: &Dispatch, inputs: Vec<Input>) -> Self {
        let targets = Self::flatten_inputs(inputs);
        let threshold = targets.len().min(1);
        Self::build(
            dispatch,
            targets,
            threshold,
            Slots::Appended(Vec::new()),
            Slots::Appended(Vec::new()),
        )
    }

    /// Settles once `count` inputs have settled.
    ///
    /// # Errors
    ///
    /// Returns a usage error if `count` exceeds the number of inputs.
    pub fn first_of(dispatch: &Dispatch, count: usize, inputs: Vec<Input>) -> Result<Self> {
        let targets = Self::flatten_inputs(inputs);
        if count > targets.len() {
            return Err(Error::usage(UsageError::ThresholdTooLarge {
                requested: count,
                available: targets.len(),
            }));
        }
        Ok(Self::build(
            dispatch,
            targets,
            count,
            Slots::Appended(Vec::new()),
            Slots::Appended(Vec::new()),
        ))
    }

    /// Waits for every input, attributing outcomes to input positions.
    #[must_use]
    pub fn all_in(dispatch: &Dispatch, inputs: Vec<Rc<dyn Awaitable>>) -> Self {
        let n = inputs.len();
        Self::build(
            dispatch,
            inputs.into_iter().map(|a| (None, a)).collect(),
            n,
            Slots::Indexed(vec![None; n]),
            Slots::Indexed(vec![None; n]),
        )
    }

    /// Settles with the first input, attributing outcomes to positions.
    #[must_use]
    pub fn any_in(dispatch: &Dispatch, inputs: Vec<Rc<dyn Awaitable>>) -> Self {
        let n = inputs.len();
        Self::build(
            dispatch,
            inputs.into_iter().map(|a| (None, a)).collect(),
            n.min(1),
            Slots::Indexed(vec![None; n]),
            Slots::Indexed(vec![None; n]),
        )
    }

    /// Waits for every input, attributing outcomes to input names.
    #[must_use]
    pub fn all_keyed(dispatch: &Dispatch, inputs: Vec<(String, Rc<dyn Awaitable>)>) -> Self {
        let n = inputs.len();
        Self::build(
            dispatch,
            inputs.into_iter().map(|(k, a)| (Some(k), a)).collect(),
            n,
            Slots::Keyed(BTreeMap::new()),
            Slots::Keyed(BTreeMap::new()),
        )
    }

    /// Settles with the first input, attributing outcomes to input names.
    #[must_use]
    pub fn any_keyed(dispatch: &Dispatch, inputs: Vec<(String, Rc<dyn Awaitable>)>) -> Self {
        let n = inputs.len();
        Self::build(
            dispatch,
            inputs.into_iter().map(|(k, a)| (Some(k), a)).collect(),
            n.min(1),
            Slots::Keyed(BTreeMap::new()),
            Slots::Keyed(BTreeMap::new()),
        )
    }

    /// Makes any input error settle the checkpoint immediately.
    ///
    /// Configure before the dispatch loop next runs; inputs settling earlier
    /// would use the previous policy.
    #[must_use]
    pub fn stop_on_first_error(self, enabled: bool) -> Self {
        self.inner.state.borrow_mut().stop_on_first_error = enabled;
        self
    }

    /// Cancels still-pending inputs (with `message`) when the checkpoint
    /// settles before they do.
    #[must_use]
    pub fn cancel_abandoned(self, enabled: bool, message: &str) -> Self {
        self.inner.state.borrow_mut().cancel_abandoned =
            enabled.then(|| message.to_string());
        self
    }

    /// The collected outcome, once settled.
    #[must_use]
    pub fn outcome(&self) -> Option<Rc<CheckpointOutcome>> {
        self.inner.state.borrow().outcome.clone()
    }
}

impl Awaitable for Checkpoint {
    fn subscribe(&self, callback: Callback) -> Result<SubscriptionId> {
        self.inner.final_awaiter.subscribe(callback)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.final_awaiter.unsubscribe(id);
    }

    fn is_done(&self) -> bool {
        self.inner.final_awaiter.is_done()
    }

    /// Forwards the cancellation to every still-pending input. The checkpoint
    /// then settles through normal accounting as those inputs fail.
    fn cancel(&self, message: &str) {
        let pending: Vec<Rc<dyn Awaitable>> = {
            let st = self.inner.state.borrow();
            if st.settled {
                return;
            }
            st.entries
                .iter()
                .filter(|e| e.sub.is_some())
                .map(|e| Rc::clone(&e.target))
                .collect()
        };
        for target in pending {
            target.cancel(message);
        }
    }
}

impl Future for Checkpoint {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut awaiter = self.inner.final_awaiter.clone();
        Pin::new(&mut awaiter).poll(cx)
    }
}

impl core::fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let st = self.inner.state.borrow();
        f.debug_struct("Checkpoint")
            .field("inputs", &st.entries.len())
            .field("threshold", &st.threshold)
            .field("completed", &st.completed)
            .field("settled", &st.settled)
            .finish()
    }
}
