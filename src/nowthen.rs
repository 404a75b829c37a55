//! Scoped cleanup stacks and cooperative time-slicing.
//!
//! [`NowThen`] pairs "do it now" work with "undo it then" cleanup. Each
//! [`NowThen::enter`] opens a scope; [`NowThen::defer`] registers cleanup
//! actions on the innermost scope; [`NowThen::leave`] closes it and runs the
//! actions in reverse registration order. Every action runs even when an
//! earlier one fails; the first error is reported after the scope is drained.
//!
//! Scopes also hold resume tokens. [`NowThen::token`] mints an unsettled
//! [`Awaiter`] tied to the innermost scope; [`NowThen::take_token`] retrieves
//! the most recently minted pending token, so producer and consumer halves of
//! a handshake can find each other without passing handles around.
//!
//! For long computations, [`NowThen::timeslice_used_up`] checks the virtual
//! clock against a budget measured from the current slice's start, and
//! [`NowThen::timeslice_yield`] hands back an awaiter that settles on the
//! next dispatch turn, releasing the thread without losing the task's place.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::awaiter::Awaiter;
use crate::dispatch::{Dispatch, Time};
use crate::error::{Error, Result, UsageError};
use crate::task::{TaskCx, TaskHandle};
use crate::value::Value;

struct Frame {
    cleanups: Vec<Box<dyn FnOnce() -> Result<()>>>,
    tokens: Vec<Awaiter>,
}

impl Frame {
    fn new() -> Self {
        Self {
            cleanups: Vec::new(),
            tokens: Vec::new(),
        }
    }

    /// Runs cleanups newest-first. Every action runs; the first error wins.
    fn drain(&mut self) -> Result<()> {
        let mut first_error = None;
        while let Some(cleanup) = self.cleanups.pop() {
            if let Err(e) = cleanup() {
                tracing::warn!(error = %e, "cleanup action failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct NowThenInner {
    dispatch: Dispatch,
    task: Option<TaskHandle>,
    created_at: Time,
    frames: RefCell<Vec<Frame>>,
}

/// A cleanup scope stack with time-slicing support.
#[derive(Clone)]
pub struct NowThen {
    inner: Rc<NowThenInner>,
}

impl NowThen {
    /// Creates a scope stack bound to the running task, with the root scope
    /// already open. Slice timing anchors to the task's resumptions.
    #[must_use]
    pub fn new(cx: &TaskCx) -> Self {
        Self::create(cx.dispatch().clone(), Some(cx.handle()))
    }

    /// Creates a scope stack bound to no task. Slice timing anchors to the
    /// creation time.
    #[must_use]
    pub fn detached(dispatch: &Dispatch) -> Self {
        Self::create(dispatch.clone(), None)
    }

    fn create(dispatch: Dispatch, task: Option<TaskHandle>) -> Self {
        let created_at = dispatch.now();
        Self {
            inner: Rc::new(NowThenInner {
                dispatch,
                task,
                created_at,
                frames: RefCell::new(vec![Frame::new()]),
            }),
        }
    }

    /// Opens a nested scope.
    pub fn enter(&self) {
        self.inner.frames.borrow_mut().push(Frame::new());
    }

    /// Closes the innermost scope, running its cleanup actions newest-first.
    ///
    /// # Errors
    ///
    /// Returns a usage error when no scope is open, or the first cleanup
    /// error after every action has run.
    pub fn leave(&self) -> Result<()> {
        let frame = self.inner.frames.borrow_mut().pop();
        match frame {
            Some(mut frame) => frame.drain(),
            None => Err(Error::usage(UsageError::NoOpenScope)),
        }
    }

    /// Runs and clears the innermost scope's cleanup actions without closing
    /// the scope.
    ///
    /// # Errors
    ///
    /// Returns a usage error when no scope is open, or the first cleanup
    /// error after every action has run.
    pub fn recover(&self) -> Result<()> {
        let mut drained = {
            let mut frames = self.inner.frames.borrow_mut();
            let frame = frames
                .last_mut()
                .ok_or_else(|| Error::usage(UsageError::NoOpenScope))?;
            std::mem::replace(frame, Frame::new())
        };
        let outcome = drained.drain();
        // Tokens survive a recover; only cleanups are consumed.
        if let Some(frame) = self.inner.frames.borrow_mut().last_mut() {
            frame.tokens.splice(0..0, drained.tokens);
        }
        outcome
    }

    /// Registers a cleanup action on the innermost scope.
    ///
    /// # Errors
    ///
    /// Returns a usage error when no scope is open.
    pub fn defer(&self, cleanup: impl FnOnce() -> Result<()> + 'static) -> Result<()> {
        let mut frames = self.inner.frames.borrow_mut();
        let frame = frames
            .last_mut()
            .ok_or_else(|| Error::usage(UsageError::NoOpenScope))?;
        frame.cleanups.push(Box::new(cleanup));
        Ok(())
    }

    /// Mints a pending resume token on the innermost scope.
    ///
    /// # Errors
    ///
    /// Returns a usage error when no scope is open.
    pub fn token(&self) -> Result<Awaiter> {
        let mut frames = self.inner.frames.borrow_mut();
        let frame = frames
            .last_mut()
            .ok_or_else(|| Error::usage(UsageError::NoOpenScope))?;
        let token = Awaiter::new(&self.inner.dispatch);
        frame.tokens.push(token.clone());
        Ok(token)
    }

    /// Takes the most recently minted pending token, searching the innermost
    /// scope outward.
    ///
    /// # Errors
    ///
    /// Returns a usage error when no pending token exists.
    pub fn take_token(&self) -> Result<Awaiter> {
        let mut frames = self.inner.frames.borrow_mut();
        for frame in frames.iter_mut().rev() {
            if let Some(token) = frame.tokens.pop() {
                return Ok(token);
            }
        }
        Err(Error::usage(UsageError::NoPendingToken))
    }

    /// The number of open scopes.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.inner.frames.borrow().len()
    }

    /// True once the current slice has run longer than `budget`.
    ///
    /// The slice starts at the bound task's latest resumption, or at this
    /// stack's creation when detached.
    #[must_use]
    pub fn timeslice_used_up(&self, budget: Duration) -> bool {
        let anchor = match &self.inner.task {
            Some(task) => self.inner.created_at.max(task.last_resumed_at()),
            None => self.inner.created_at,
        };
        self.inner.dispatch.now().duration_since(anchor) > budget
    }

    /// An awaiter that settles on the next dispatch turn. Waiting on it
    /// yields the thread and starts a fresh slice.
    #[must_use]
    pub fn timeslice_yield(&self) -> Awaiter {
        let awaiter = Awaiter::new(&self.inner.dispatch);
        let settle = awaiter.clone();
        self.inner
            .dispatch
            .schedule(move || settle.resolve(Value::null()));
        awaiter
    }
}

impl core::fmt::Debug for NowThen {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NowThen")
            .field("depth", &self.depth())
            .field("created_at", &self.inner.created_at)
            .finish()
    }
}
