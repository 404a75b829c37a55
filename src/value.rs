//! Dynamic payload values carried through the task protocol.
//!
//! The runtime moves results and resumption payloads between tasks whose
//! concrete types it cannot know. [`Value`] is a cheap, clonable wrapper over
//! `Rc<dyn Any>` with an explicit null state, so a resumption carrying "no
//! value" is distinguishable from one carrying a unit-like payload.

use core::fmt;
use std::any::Any;
use std::rc::Rc;

/// A dynamically typed, reference-counted payload.
///
/// Cloning a `Value` clones the handle, never the payload. The null value is
/// used for resumptions that carry no data (timer ticks, bare wake-ups).
#[derive(Clone, Default)]
pub struct Value(Option<Rc<dyn Any>>);

impl Value {
    /// Wraps an owned payload.
    #[must_use]
    pub fn new<T: 'static>(payload: T) -> Self {
        Self(Some(Rc::new(payload)))
    }

    /// Wraps an already reference-counted payload without re-boxing it.
    #[must_use]
    pub fn from_rc<T: 'static>(payload: Rc<T>) -> Self {
        Self(Some(payload))
    }

    /// The null value.
    #[must_use]
    pub fn null() -> Self {
        Self(None)
    }

    /// Returns true if this is the null value.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    /// Borrows the payload as `T`, if this value holds a `T`.
    #[must_use]
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_ref()?.downcast_ref()
    }

    /// Returns a shared handle to the payload as `Rc<T>`, if it holds a `T`.
    #[must_use]
    pub fn downcast<T: 'static>(&self) -> Option<Rc<T>> {
        Rc::clone(self.0.as_ref()?).downcast::<T>().ok()
    }

    /// Returns true if both values share one payload allocation (or are both
    /// null). This is the identity comparison the runtime itself never needs
    /// but tests and listener bookkeeping do.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        match (&a.0, &b.0) {
            (Some(x), Some(y)) => Rc::ptr_eq(x, y),
            (None, None) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(_) => f.write_str("Value(..)"),
            None => f.write_str("Value(null)"),
        }
    }
}

impl<T: 'static> From<Rc<T>> for Value {
    fn from(payload: Rc<T>) -> Self {
        Self::from_rc(payload)
    }
}
