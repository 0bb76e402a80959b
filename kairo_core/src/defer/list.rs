use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use super::deferred::{CallbackReturn, Deferred, Value, downcast_value};
use crate::failure::FailureValue;

/// The recorded result of one input to a [`DeferredList`].
///
/// Success payloads are shared (`Rc`) because the same value keeps
/// flowing down the input's own chain: a `DeferredList` observes its
/// inputs without consuming them.
#[derive(Clone)]
pub enum ListOutcome {
    Success(Rc<dyn Any>),
    Failure(FailureValue),
}

impl ListOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, ListOutcome::Success(_))
    }

    pub fn success<T: Any + Clone>(&self) -> Option<T> {
        match self {
            ListOutcome::Success(v) => v.downcast_ref::<T>().cloned(),
            ListOutcome::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<FailureValue> {
        match self {
            ListOutcome::Success(_) => None,
            ListOutcome::Failure(f) => Some(f.clone()),
        }
    }
}

enum FireAction {
    One(Rc<dyn Any>, usize),
    Fail(FailureValue),
    All(Vec<ListOutcome>),
}

struct ListState {
    slots: Vec<Option<ListOutcome>>,
    fire_on_one_callback: bool,
    fire_on_one_errback: bool,
    out: Deferred,
}

impl ListState {
    // Records the slot and decides how to fire; the actual fire happens
    // with no borrow of this state held.
    fn record(&mut self, index: usize, outcome: ListOutcome) -> Option<FireAction> {
        self.slots[index] = Some(outcome);
        if self.out.called() {
            return None;
        }
        match self.slots[index].as_ref() {
            Some(ListOutcome::Success(value)) if self.fire_on_one_callback => {
                Some(FireAction::One(Rc::clone(value), index))
            }
            Some(ListOutcome::Failure(reason)) if self.fire_on_one_errback => {
                Some(FireAction::Fail(reason.clone()))
            }
            _ => {
                if self.slots.iter().all(Option::is_some) {
                    let results: Vec<ListOutcome> = self
                        .slots
                        .iter_mut()
                        .map(|s| s.take())
                        .collect::<Option<Vec<_>>>()
                        .unwrap_or_default();
                    Some(FireAction::All(results))
                } else {
                    None
                }
            }
        }
    }
}

/// Combines a group of deferreds into one.
///
/// The aggregate fires with a `Vec<ListOutcome>` in input order once
/// every input has fired, unless one of the fire-on-first policies is
/// set (`fire_on_one_callback` fires with `(value, index)` on the first
/// success, `fire_on_one_errback` errbacks on the first failure).
/// Inputs are never swallowed: each one continues down its own chain,
/// with success values re-emitted as `Rc<dyn Any>` handles.
///
/// An empty input list fires immediately with an empty vec.
pub struct DeferredList {
    state: Rc<RefCell<ListState>>,
}

impl DeferredList {
    pub fn new(
        inputs: Vec<Deferred>,
        fire_on_one_callback: bool,
        fire_on_one_errback: bool,
    ) -> DeferredList {
        let state = Rc::new(RefCell::new(ListState {
            slots: vec![None; inputs.len()],
            fire_on_one_callback,
            fire_on_one_errback,
            out: Deferred::new(),
        }));
        if inputs.is_empty() {
            state.borrow().out.callback(Vec::<ListOutcome>::new());
        }
        let list = DeferredList { state };
        for (index, input) in inputs.into_iter().enumerate() {
            list.watch(index, &input);
        }
        list
    }

    /// Track one more deferred after construction.
    pub fn add_deferred(&self, input: &Deferred) {
        let index = {
            let mut state = self.state.borrow_mut();
            state.slots.push(None);
            state.slots.len() - 1
        };
        self.watch(index, input);
    }

    fn watch(&self, index: usize, input: &Deferred) {
        let on_success = Rc::clone(&self.state);
        let on_failure = Rc::clone(&self.state);
        input.add_callbacks(
            move |value: Value| {
                let shared: Rc<dyn Any> = Rc::from(value);
                let action = on_success
                    .borrow_mut()
                    .record(index, ListOutcome::Success(Rc::clone(&shared)));
                fire(&on_success, action);
                CallbackReturn::Success(Box::new(shared))
            },
            move |reason: FailureValue| {
                let action = on_failure
                    .borrow_mut()
                    .record(index, ListOutcome::Failure(reason.clone()));
                fire(&on_failure, action);
                CallbackReturn::Failure(reason)
            },
        );
    }

    /// The aggregate deferred; attach callbacks here.
    pub fn deferred(&self) -> Deferred {
        self.state.borrow().out.clone()
    }
}

fn fire(state: &Rc<RefCell<ListState>>, action: Option<FireAction>) {
    let Some(action) = action else { return };
    let out = state.borrow().out.clone();
    match action {
        FireAction::One(value, index) => out.callback((value, index)),
        FireAction::Fail(reason) => out.errback(reason),
        FireAction::All(results) => out.callback(results),
    }
}

/// Fire with just the success values of the given deferreds, or errback
/// on the first input failure.
pub fn gather_results(inputs: Vec<Deferred>) -> Deferred {
    let list = DeferredList::new(inputs, false, true);
    let d = list.deferred();
    d.add_callback(|value| match downcast_value::<Vec<ListOutcome>>(value) {
        Ok(results) => {
            let values: Vec<Rc<dyn Any>> = results
                .into_iter()
                .filter_map(|r| match r {
                    ListOutcome::Success(v) => Some(v),
                    // fire_on_one_errback means a failure never reaches here
                    ListOutcome::Failure(_) => None,
                })
                .collect();
            CallbackReturn::ok(values)
        }
        Err(reason) => CallbackReturn::err(reason),
    });
    d
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defer::succeed;
    use crate::error::{ErrorKind, KairoError};

    #[test]
    fn fires_when_all_inputs_fire() {
        let a = Deferred::new();
        let b = Deferred::new();
        let list = DeferredList::new(vec![a.clone(), b.clone()], false, false);
        let out = list.deferred();
        a.callback(1i32);
        assert!(!out.called());
        b.callback(2i32);
        let results = out.extract::<Vec<ListOutcome>>().expect("list fired");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].success::<i32>(), Some(1));
        assert_eq!(results[1].success::<i32>(), Some(2));
    }

    #[test]
    fn records_failures_without_swallowing() {
        let a = Deferred::new();
        let list = DeferredList::new(vec![a.clone()], false, false);
        let out = list.deferred();
        a.add_errback(|_| CallbackReturn::ok(()));
        a.errback(FailureValue::from_error(KairoError::Timeout));
        let results = out.extract::<Vec<ListOutcome>>().expect("list fired");
        assert_eq!(results[0].failure().unwrap().kind(), ErrorKind::Timeout);
        assert!(!results[0].succeeded());
    }

    #[test]
    fn fire_on_one_callback_reports_value_and_index() {
        let a = Deferred::new();
        let b = Deferred::new();
        let list = DeferredList::new(vec![a.clone(), b.clone()], true, false);
        let out = list.deferred();
        b.callback(7i32);
        let (value, index) = out.extract::<(Rc<dyn Any>, usize)>().expect("fired early");
        assert_eq!(index, 1);
        assert_eq!(*value.downcast_ref::<i32>().unwrap(), 7);
        // the aggregate must not fire twice when the other input lands
        a.callback(1i32);
        assert!(out.extract::<(Rc<dyn Any>, usize)>().is_some());
    }

    #[test]
    fn fire_on_one_errback_fails_fast() {
        let a = Deferred::new();
        let b = Deferred::new();
        let list = DeferredList::new(vec![a.clone(), b.clone()], false, true);
        let out = list.deferred();
        out.add_errback(|f| {
            assert_eq!(f.kind(), ErrorKind::ConnectionRefused);
            CallbackReturn::ok(())
        });
        b.add_errback(|_| CallbackReturn::ok(()));
        b.errback(FailureValue::from_error(KairoError::ConnectionRefused));
        assert!(out.called());
    }

    #[test]
    fn empty_list_fires_immediately() {
        let list = DeferredList::new(Vec::new(), false, false);
        let results = list.deferred().extract::<Vec<ListOutcome>>();
        assert_eq!(results.expect("fired").len(), 0);
    }

    #[test]
    fn inputs_keep_their_values_downstream() {
        let a = succeed(5i32);
        let _list = DeferredList::new(vec![a.clone()], false, false);
        // After being watched, the input's chain carries the shared handle.
        let shared = a.extract::<Rc<dyn Any>>().expect("shared value");
        assert_eq!(*shared.downcast_ref::<i32>().unwrap(), 5);
    }

    #[test]
    fn add_deferred_extends_the_slot_list() {
        let a = Deferred::new();
        let list = DeferredList::new(vec![a.clone()], false, false);
        let b = Deferred::new();
        list.add_deferred(&b);
        let out = list.deferred();
        a.callback(1i32);
        assert!(!out.called());
        b.callback(2i32);
        let results = out.extract::<Vec<ListOutcome>>().expect("fired");
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn gather_results_strips_outcomes() {
        let a = succeed(1i32);
        let b = succeed(2i32);
        let d = gather_results(vec![a, b]);
        let values = d.extract::<Vec<Rc<dyn Any>>>().expect("fired");
        let total: i32 = values.iter().map(|v| *v.downcast_ref::<i32>().unwrap()).sum();
        assert_eq!(total, 3);
    }
}
