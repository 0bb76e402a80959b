//! Support for results that aren't immediately available.
//!
//! A [`Deferred`] is a single-fire cell for a value that will show up
//! later. Instead of blocking, code hands back a `Deferred` and the caller
//! attaches callback/errback pairs that run when the result arrives. The
//! chain transforms the result step by step; a callback that returns
//! another `Deferred` suspends the chain until the inner one fires.
//!
//! Results are explicit sum values, never unwound panics:
//! [`Outcome::Success`] carries a boxed [`Value`], [`Outcome::Failure`]
//! carries a [`FailureValue`]. Callbacks return a [`CallbackReturn`]
//! selecting the branch the chain continues on.

mod deferred;
mod list;

pub use deferred::{CallbackReturn, Deferred, Outcome, Value, downcast_value};
pub use list::{DeferredList, ListOutcome, gather_results};

use crate::failure::FailureValue;
use std::any::Any;

/// Return a `Deferred` that has already fired with `value`.
pub fn succeed<T: Any>(value: T) -> Deferred {
    let d = Deferred::new();
    d.callback(value);
    d
}

/// Return a `Deferred` that has already fired with `reason` on the
/// failure branch.
pub fn fail(reason: FailureValue) -> Deferred {
    let d = Deferred::new();
    d.errback(reason);
    d
}

/// Call `f` and wrap its `Result` into an already-fired `Deferred`.
pub fn execute<T: Any>(f: impl FnOnce() -> Result<T, FailureValue>) -> Deferred {
    match f() {
        Ok(value) => succeed(value),
        Err(reason) => fail(reason),
    }
}

/// Invoke a function that may or may not produce a deferred result.
///
/// Whatever `f` returns is normalized into a `Deferred`: plain values and
/// failures become already-fired deferreds, and a returned `Deferred` is
/// handed back as-is.
pub fn maybe_deferred(f: impl FnOnce() -> CallbackReturn) -> Deferred {
    match f() {
        CallbackReturn::Success(value) => {
            let d = Deferred::new();
            d.callback_boxed(value);
            d
        }
        CallbackReturn::Failure(reason) => fail(reason),
        CallbackReturn::Deferred(d) => d,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, KairoError};

    #[test]
    fn maybe_deferred_normalizes_values() {
        let d = maybe_deferred(|| CallbackReturn::ok(21i32));
        assert_eq!(d.extract::<i32>(), Some(21));
    }

    #[test]
    fn maybe_deferred_normalizes_failures() {
        let d = maybe_deferred(|| {
            CallbackReturn::err(FailureValue::from_error(KairoError::Timeout))
        });
        let f = d.failure_result().unwrap();
        assert_eq!(f.kind(), ErrorKind::Timeout);
        d.add_errback(|_| CallbackReturn::ok(()));
    }

    #[test]
    fn maybe_deferred_passes_deferreds_through() {
        let inner = Deferred::new();
        let d = maybe_deferred({
            let inner = inner.clone();
            move || CallbackReturn::Deferred(inner)
        });
        assert!(!d.called());
        inner.callback(5i32);
        assert_eq!(d.extract::<i32>(), Some(5));
    }

    #[test]
    fn execute_captures_errors() {
        let d = execute(|| -> Result<i32, FailureValue> {
            Err(FailureValue::from_error(KairoError::ConnectionRefused))
        });
        assert_eq!(
            d.failure_result().unwrap().kind(),
            ErrorKind::ConnectionRefused
        );
        d.add_errback(|_| CallbackReturn::ok(()));
    }
}
