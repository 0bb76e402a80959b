use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use crate::debug_warn;
use crate::error::KairoError;
use crate::failure::FailureValue;
use crate::reactor::{DelayedCall, Reactor};

/// The dynamically-typed success payload carried through a chain.
pub type Value = Box<dyn Any>;

/// The two states a fired `Deferred` can settle in.
pub enum Outcome {
    Success(Value),
    Failure(FailureValue),
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }
}

/// What a callback hands back to the chain.
///
/// Returning `Deferred` suspends the chain until the inner deferred
/// fires; its result then becomes the chain's current result.
pub enum CallbackReturn {
    Success(Value),
    Failure(FailureValue),
    Deferred(Deferred),
}

impl CallbackReturn {
    /// Box a plain value onto the success branch.
    pub fn ok<T: Any>(value: T) -> CallbackReturn {
        CallbackReturn::Success(Box::new(value))
    }

    /// Continue on the failure branch.
    pub fn err(reason: FailureValue) -> CallbackReturn {
        CallbackReturn::Failure(reason)
    }
}

impl From<FailureValue> for CallbackReturn {
    fn from(reason: FailureValue) -> Self {
        CallbackReturn::Failure(reason)
    }
}

impl From<Deferred> for CallbackReturn {
    fn from(d: Deferred) -> Self {
        CallbackReturn::Deferred(d)
    }
}

impl From<Outcome> for CallbackReturn {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success(v) => CallbackReturn::Success(v),
            Outcome::Failure(f) => CallbackReturn::Failure(f),
        }
    }
}

/// Downcast a chain [`Value`] to a concrete type, turning a mismatch into
/// a failure instead of a panic.
pub fn downcast_value<T: Any>(value: Value) -> Result<Box<T>, FailureValue> {
    value.downcast::<T>().map_err(|_| {
        FailureValue::from_error(KairoError::Other(format!(
            "callback chain value was not a {}",
            std::any::type_name::<T>()
        )))
    })
}

type SuccessFn = Box<dyn FnOnce(Value) -> CallbackReturn>;
type FailureFn = Box<dyn FnOnce(FailureValue) -> CallbackReturn>;

struct CallbackPair {
    on_success: SuccessFn,
    on_failure: FailureFn,
}

fn passthru_success() -> SuccessFn {
    Box::new(CallbackReturn::Success)
}

fn passthru_failure() -> FailureFn {
    Box::new(CallbackReturn::Failure)
}

struct DeferredState {
    callbacks: VecDeque<CallbackPair>,
    called: bool,
    paused: u32,
    running: bool,
    result: Option<Outcome>,
    timeout_call: Option<DelayedCall>,
}

/// A single-fire asynchronous value with a callback chain.
///
/// Cloning is cheap and shares the underlying cell. A `Deferred` is owned
/// by the reactor thread and is not `Send`; results computed on worker
/// threads rejoin through the reactor's thread-call queue.
///
/// Firing a `Deferred` twice is a programmer error: the panicking
/// [`callback`](Deferred::callback)/[`errback`](Deferred::errback) forms
/// treat it as fatal, the `try_` forms report it as
/// [`KairoError::AlreadyCalled`].
#[derive(Clone)]
pub struct Deferred {
    inner: Rc<RefCell<DeferredState>>,
}

impl Default for Deferred {
    fn default() -> Self {
        Self::new()
    }
}

impl Deferred {
    pub fn new() -> Deferred {
        Deferred {
            inner: Rc::new(RefCell::new(DeferredState {
                callbacks: VecDeque::new(),
                called: false,
                paused: 0,
                running: false,
                result: None,
                timeout_call: None,
            })),
        }
    }

    /// Append a success/failure pair to the chain.
    ///
    /// If the deferred has already fired, the chain resumes immediately.
    pub fn add_callbacks(
        &self,
        on_success: impl FnOnce(Value) -> CallbackReturn + 'static,
        on_failure: impl FnOnce(FailureValue) -> CallbackReturn + 'static,
    ) -> &Self {
        {
            let mut state = self.inner.borrow_mut();
            state.callbacks.push_back(CallbackPair {
                on_success: Box::new(on_success),
                on_failure: Box::new(on_failure),
            });
        }
        if self.called() {
            self.run_callbacks();
        }
        self
    }

    /// Append just a success callback; failures pass through.
    pub fn add_callback(&self, on_success: impl FnOnce(Value) -> CallbackReturn + 'static) -> &Self {
        {
            let mut state = self.inner.borrow_mut();
            state.callbacks.push_back(CallbackPair {
                on_success: Box::new(on_success),
                on_failure: passthru_failure(),
            });
        }
        if self.called() {
            self.run_callbacks();
        }
        self
    }

    /// Append just an errback; successes pass through.
    pub fn add_errback(
        &self,
        on_failure: impl FnOnce(FailureValue) -> CallbackReturn + 'static,
    ) -> &Self {
        {
            let mut state = self.inner.borrow_mut();
            state.callbacks.push_back(CallbackPair {
                on_success: passthru_success(),
                on_failure: Box::new(on_failure),
            });
        }
        if self.called() {
            self.run_callbacks();
        }
        self
    }

    /// Append one function used for both branches.
    pub fn add_both(&self, f: impl FnOnce(Outcome) -> CallbackReturn + 'static) -> &Self {
        // Only one branch ever runs, so the FnOnce is shared through a
        // take-once slot.
        let slot = Rc::new(RefCell::new(Some(f)));
        let slot2 = Rc::clone(&slot);
        self.add_callbacks(
            move |value| match slot.borrow_mut().take() {
                Some(f) => f(Outcome::Success(value)),
                None => CallbackReturn::Success(value),
            },
            move |reason| match slot2.borrow_mut().take() {
                Some(f) => f(Outcome::Failure(reason)),
                None => CallbackReturn::Failure(reason),
            },
        )
    }

    /// Chain another deferred to this one: when this chain reaches the
    /// link, `other` is fired with the current result. The result is
    /// handed over entirely; this chain continues with `()` on the
    /// success branch.
    pub fn chain_deferred(&self, other: &Deferred) -> &Self {
        let ok = other.clone();
        let err = other.clone();
        self.add_callbacks(
            move |value| {
                ok.callback_boxed(value);
                CallbackReturn::ok(())
            },
            move |reason| {
                err.errback(reason);
                CallbackReturn::ok(())
            },
        )
    }

    /// Fire the success branch with `value`.
    ///
    /// # Panics
    ///
    /// Panics if the deferred has already been fired.
    pub fn callback<T: Any>(&self, value: T) {
        self.callback_boxed(Box::new(value));
    }

    /// Like [`callback`](Deferred::callback) for an already-boxed value.
    pub fn callback_boxed(&self, value: Value) {
        if let Err(e) = self.try_callback(value) {
            panic!("Deferred fired twice: {}", e);
        }
    }

    /// Fire the failure branch with `reason`.
    ///
    /// # Panics
    ///
    /// Panics if the deferred has already been fired.
    pub fn errback(&self, reason: FailureValue) {
        if let Err(e) = self.try_errback(reason) {
            panic!("Deferred fired twice: {}", e);
        }
    }

    /// Non-panicking fire; reports `AlreadyCalled` on a second fire.
    pub fn try_callback(&self, value: Value) -> Result<(), KairoError> {
        self.fire(Outcome::Success(value))
    }

    /// Non-panicking errback; reports `AlreadyCalled` on a second fire.
    pub fn try_errback(&self, reason: FailureValue) -> Result<(), KairoError> {
        self.fire(Outcome::Failure(reason))
    }

    fn fire(&self, outcome: Outcome) -> Result<(), KairoError> {
        {
            let mut state = self.inner.borrow_mut();
            if state.called {
                return Err(KairoError::AlreadyCalled);
            }
            state.called = true;
            state.result = Some(outcome);
            if let Some(timeout) = state.timeout_call.take() {
                let _ = timeout.cancel();
            }
        }
        self.run_callbacks();
        Ok(())
    }

    /// Stop processing until [`unpause`](Deferred::unpause).
    pub fn pause(&self) {
        self.inner.borrow_mut().paused += 1;
    }

    /// Undo one [`pause`](Deferred::pause); the chain resumes once the
    /// pause count reaches zero.
    pub fn unpause(&self) {
        {
            let mut state = self.inner.borrow_mut();
            state.paused = state.paused.saturating_sub(1);
            if state.paused > 0 || !state.called {
                return;
            }
        }
        self.run_callbacks();
    }

    /// Arrange for the deferred to errback with a timeout failure if it
    /// has not fired within `seconds`.
    ///
    /// At most one timeout may be registered per deferred; firing first
    /// cancels the timer.
    pub fn set_timeout(&self, reactor: &Reactor, seconds: f64) -> DelayedCall {
        self.set_timeout_with(reactor, seconds, |d| {
            d.errback(FailureValue::from_error(KairoError::Timeout));
        })
    }

    /// Like [`set_timeout`](Deferred::set_timeout) with a custom policy
    /// invoked with the deferred when the deadline passes first.
    pub fn set_timeout_with(
        &self,
        reactor: &Reactor,
        seconds: f64,
        on_timeout: impl FnOnce(&Deferred) + 'static,
    ) -> DelayedCall {
        assert!(
            self.inner.borrow().timeout_call.is_none(),
            "Don't call set_timeout twice on the same Deferred"
        );
        let me = self.clone();
        let call = reactor.call_later(seconds, move || {
            if !me.called() {
                on_timeout(&me);
            }
        });
        self.inner.borrow_mut().timeout_call = Some(call.clone());
        call
    }

    pub fn called(&self) -> bool {
        self.inner.borrow().called
    }

    pub fn is_paused(&self) -> bool {
        self.inner.borrow().paused > 0
    }

    /// Peek at the settled success value, cloning it out.
    ///
    /// Returns `None` while unfired, suspended, settled on the failure
    /// branch, or holding a different type.
    pub fn extract<T: Any + Clone>(&self) -> Option<T> {
        let state = self.inner.borrow();
        match state.result.as_ref() {
            Some(Outcome::Success(v)) => v.downcast_ref::<T>().cloned(),
            _ => None,
        }
    }

    /// Peek at the settled failure, if any.
    pub fn failure_result(&self) -> Option<FailureValue> {
        let state = self.inner.borrow();
        match state.result.as_ref() {
            Some(Outcome::Failure(f)) => Some(f.clone()),
            _ => None,
        }
    }

    fn continue_with(&self, outcome: Outcome) {
        self.inner.borrow_mut().result = Some(outcome);
        self.unpause();
    }

    fn run_callbacks(&self) {
        loop {
            let (pair, outcome) = {
                let mut state = self.inner.borrow_mut();
                if state.paused > 0 || state.running {
                    return;
                }
                if state.callbacks.is_empty() {
                    break;
                }
                let Some(outcome) = state.result.take() else {
                    return;
                };
                let Some(pair) = state.callbacks.pop_front() else {
                    state.result = Some(outcome);
                    break;
                };
                state.running = true;
                (pair, outcome)
            };

            // User code runs with no borrow held, so callbacks are free to
            // add more callbacks or fire other deferreds.
            let returned = match outcome {
                Outcome::Success(value) => (pair.on_success)(value),
                Outcome::Failure(reason) => (pair.on_failure)(reason),
            };

            let mut state = self.inner.borrow_mut();
            state.running = false;
            match returned {
                CallbackReturn::Success(value) => {
                    state.result = Some(Outcome::Success(value));
                }
                CallbackReturn::Failure(reason) => {
                    state.result = Some(Outcome::Failure(reason));
                }
                CallbackReturn::Deferred(nested) => {
                    // Suspend until the nested deferred fires, then resume
                    // with its result.
                    state.paused += 1;
                    drop(state);
                    let me = self.clone();
                    nested.add_both(move |outcome| {
                        me.continue_with(outcome);
                        CallbackReturn::ok(())
                    });
                    return;
                }
            }
        }

        // A failure settling at the end of the chain gets its frames
        // cleaned so it can outlive the scope that captured it.
        let state = self.inner.borrow();
        if let Some(Outcome::Failure(reason)) = state.result.as_ref() {
            reason.clean();
        }
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.borrow();
        write!(
            f,
            "<Deferred called={} paused={} pending_callbacks={}>",
            state.called,
            state.paused,
            state.callbacks.len()
        )
    }
}

impl Drop for DeferredState {
    fn drop(&mut self) {
        if self.called {
            if let Some(Outcome::Failure(reason)) = self.result.as_ref() {
                eprintln!("Unhandled error in Deferred:");
                eprintln!("{}", reason.get_brief_traceback());
            }
        } else if let Some(timeout) = self.timeout_call.take() {
            let _ = timeout.cancel();
            debug_warn!("Deferred destroyed before firing; cancelled its timeout");
        }
    }
}
