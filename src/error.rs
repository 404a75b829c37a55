//! Error types and error handling strategy for the runtime.
//!
//! Errors fall into four categories:
//!
//! - **Usage**: contract violations at the call site (self-await, bad wait
//!   threshold, scope misuse). Raised synchronously from the violating call.
//! - **Body**: anything a task's own logic reports. Captured, stored on the
//!   handle, delivered to completion subscribers; never crosses into another
//!   task's stack synchronously.
//! - **Cancellation**: an internal signal requesting cooperative early
//!   termination. Not constructible outside the crate; consumers test for it
//!   with [`Error::is_canceled`] to tell "canceled" apart from "failed".
//! - **Aggregate**: a checkpoint's own completion error, bundling every
//!   underlying error alongside the successful results.

use core::fmt;
use std::rc::Rc;

use crate::checkpoint::CheckpointOutcome;
use crate::value::Value;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Cooperative cancellation was delivered to the task.
    Canceled,
    /// A call-site contract violation.
    Usage,
    /// A checkpoint settled with one or more input errors.
    Aggregate,
    /// An error reported by task logic.
    User,
}

/// Contract violations raised synchronously at the offending call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UsageError {
    /// A task subscribed its own resume handle to its own completion.
    #[error("a task may not await its own completion")]
    SelfAwait,

    /// A first-N checkpoint asked for more settlements than it has inputs.
    #[error("wait threshold {requested} exceeds input count {available}")]
    ThresholdTooLarge {
        /// The requested number of settlements.
        requested: usize,
        /// The number of inputs actually provided.
        available: usize,
    },

    /// A cleanup action or token was registered with no open scope.
    #[error("no open cleanup scope")]
    NoOpenScope,

    /// A token was requested from a scope holding none.
    #[error("no pending resume token in the current scope")]
    NoPendingToken,
}

/// The error type flowing through awaiters, tasks, and checkpoints.
///
/// Fields are private: cancellation errors can only be minted by the runtime,
/// which is what makes [`Error::is_canceled`] a trustworthy signal.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    usage: Option<UsageError>,
    payload: Option<Value>,
    aggregate: Option<Rc<CheckpointOutcome>>,
    context: Vec<String>,
}

impl Error {
    fn new(kind: ErrorKind, message: String) -> Self {
        Self {
            kind,
            message,
            usage: None,
            payload: None,
            aggregate: None,
            context: Vec::new(),
        }
    }

    /// An error reported by task logic, described by a message.
    #[must_use]
    pub fn user(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::User, message.into())
    }

    /// An error carrying an arbitrary payload value.
    #[must_use]
    pub fn from_value(payload: Value) -> Self {
        let mut e = Self::new(ErrorKind::User, String::from("task error value"));
        e.payload = Some(payload);
        e
    }

    /// A synchronous contract violation.
    #[must_use]
    pub fn usage(violation: UsageError) -> Self {
        let mut e = Self::new(ErrorKind::Usage, violation.to_string());
        e.usage = Some(violation);
        e
    }

    /// The cancellation signal. Crate-internal: user code observes
    /// cancellations, it does not fabricate them.
    pub(crate) fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, message.into())
    }

    /// A checkpoint's aggregate completion error.
    pub(crate) fn aggregate(outcome: Rc<CheckpointOutcome>) -> Self {
        let mut e = Self::new(ErrorKind::Aggregate, outcome.to_string());
        e.aggregate = Some(outcome);
        e
    }

    /// The error's category.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The primary message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The usage violation, for usage errors.
    #[must_use]
    pub fn usage_violation(&self) -> Option<UsageError> {
        self.usage
    }

    /// The payload value, for errors built from one.
    #[must_use]
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// The bundled checkpoint outcome, for aggregate errors.
    #[must_use]
    pub fn checkpoint_outcome(&self) -> Option<&Rc<CheckpointOutcome>> {
        self.aggregate.as_ref()
    }

    /// True if this error is a delivered cancellation.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.kind == ErrorKind::Canceled
    }

    /// The cancellation message, if this error is a cancellation.
    #[must_use]
    pub fn cancel_message(&self) -> Option<&str> {
        self.is_canceled().then_some(self.message.as_str())
    }

    /// Appends a junction line recording where the error crossed a task
    /// boundary. Aggregate errors carry their own diagnostics and pass
    /// through untouched.
    #[must_use]
    pub(crate) fn with_context(mut self, line: String) -> Self {
        if self.kind != ErrorKind::Aggregate {
            self.context.push(line);
        }
        self
    }

    /// Junction lines accumulated while the error traveled between tasks.
    #[must_use]
    pub fn context(&self) -> &[String] {
        &self.context
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::Canceled => write!(f, "task canceled: {}", self.message)?,
            ErrorKind::Usage => write!(f, "usage error: {}", self.message)?,
            ErrorKind::Aggregate | ErrorKind::User => f.write_str(&self.message)?,
        }
        for line in &self.context {
            write!(f, "\n  via {line}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}
