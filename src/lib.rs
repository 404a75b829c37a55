//! Cooperative single-threaded task runtime.
//!
//! Everything runs on one thread over a deferred-dispatch loop: callbacks
//! never run synchronously inside the call that arranged them, so no user
//! code ever observes another task mid-slice. On top of that loop the crate
//! layers:
//!
//! - [`Awaiter`]: a one-shot settleable event with token-based subscriptions.
//! - Tasks ([`start`] and friends): sliced bodies resumed through one-shot,
//!   generation-guarded [`ResumeHandle`]s, with cooperative cancellation and
//!   a per-task event bus.
//! - [`Checkpoint`]: all-of / any-of / first-N combinators over anything
//!   [`Awaitable`], with error aggregation and abandoned-input cleanup.
//! - [`NowThen`]: scoped cleanup stacks and time-slicing helpers.
//!
//! Tasks, awaiters, and checkpoints all implement [`Awaitable`] and
//! [`std::future::Future`], so the runtime composes with ordinary async code
//! in both directions.
//!
//! # Example
//!
//! ```
//! use cooptask::{start_fn, Dispatch, Value};
//!
//! let dispatch = Dispatch::new();
//! let task = start_fn(&dispatch, |_cx| Ok(Value::new(40 + 2)));
//! dispatch.run_until_quiescent();
//! assert_eq!(task.result().unwrap().downcast_ref::<i32>(), Some(&42));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod awaiter;
pub mod checkpoint;
pub mod dispatch;
pub mod error;
pub mod nowthen;
pub mod task;
pub mod value;

pub use awaiter::{Awaitable, Awaiter, Callback, SubscriptionId};
pub use checkpoint::{Checkpoint, CheckpointOutcome, Input, Slots};
pub use dispatch::{Dispatch, DispatchConfig, Time};
pub use error::{Error, ErrorKind, Result, UsageError};
pub use nowthen::NowThen;
pub use task::{
    start, start_awaitable, start_fn, start_future, start_method, ResumeHandle, Step, StepSource,
    TaskCx, TaskHandle, TaskId,
};
pub use value::Value;
