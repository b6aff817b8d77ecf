//! Fiber outcomes
//!
//! Every fiber terminates in exactly one of three ways: success, failure
//! through the typed error channel, or interruption via `abort`.
//! Interruption is out-of-band: it is not an `E` and `catch` never sees it.

use thiserror::Error;

use crate::effect::{peek, Dyn};

/// The result of a completed fiber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit<A, E> {
    /// The fiber produced a value.
    Success(A),
    /// The fiber failed through the error channel.
    Failure(E),
    /// The fiber was aborted before completing.
    Interrupted,
}

impl<A, E> Exit<A, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Exit::Failure(_))
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Exit::Interrupted)
    }

    /// The success value, if any.
    pub fn success(self) -> Option<A> {
        match self {
            Exit::Success(a) => Some(a),
            _ => None,
        }
    }

    /// The failure value, if any.
    pub fn failure(self) -> Option<E> {
        match self {
            Exit::Failure(e) => Some(e),
            _ => None,
        }
    }

    /// `Some(Ok)` on success, `Some(Err)` on failure, `None` if interrupted.
    pub fn into_result(self) -> Option<Result<A, E>> {
        match self {
            Exit::Success(a) => Some(Ok(a)),
            Exit::Failure(e) => Some(Err(e)),
            Exit::Interrupted => None,
        }
    }
}

impl<A, E> From<Result<A, E>> for Exit<A, E> {
    fn from(r: Result<A, E>) -> Self {
        match r {
            Ok(a) => Exit::Success(a),
            Err(e) => Exit::Failure(e),
        }
    }
}

/// A panic reified onto the error channel by `Eff::attempt`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("panic: {0}")]
pub struct Panicked(pub String);

impl Panicked {
    /// Extract a printable message from a panic payload.
    pub(crate) fn from_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        if let Some(s) = payload.downcast_ref::<&str>() {
            Panicked((*s).to_string())
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Panicked(s.clone())
        } else {
            Panicked("opaque panic payload".to_string())
        }
    }
}

// ============================================================================
// Erased outcome used inside the interpreter
// ============================================================================

/// The untyped outcome flowing through fiber state and waiter callbacks.
#[derive(Clone)]
pub(crate) enum RawExit {
    Success(Dyn),
    Failure(Dyn),
    Interrupted,
}

impl RawExit {
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            RawExit::Success(_) => "success",
            RawExit::Failure(_) => "failure",
            RawExit::Interrupted => "interrupted",
        }
    }
}

impl<A, E> Exit<A, E>
where
    A: Clone + 'static,
    E: Clone + 'static,
{
    /// Recover the typed outcome from an erased one.
    pub(crate) fn from_raw(raw: &RawExit) -> Self {
        match raw {
            RawExit::Success(v) => Exit::Success(peek::<A>(v)),
            RawExit::Failure(e) => Exit::Failure(peek::<E>(e)),
            RawExit::Interrupted => Exit::Interrupted,
        }
    }
}
