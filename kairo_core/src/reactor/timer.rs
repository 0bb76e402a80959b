use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::{KairoError, Result};

/// Converts the float seconds used throughout the public API into a
/// `Duration`, clamping negatives to zero.
pub(crate) fn secs_to_duration(seconds: f64) -> Duration {
    if seconds <= 0.0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(seconds)
    }
}

struct DelayedCallState {
    deadline: Instant,
    func: Option<Box<dyn FnOnce()>>,
    called: bool,
    cancelled: bool,
    seq: u64,
}

/// Handle to a call scheduled with `Reactor::call_later`.
///
/// Cancelling or delaying a call that has already run reports
/// `AlreadyCalled`; touching one that was cancelled reports
/// `AlreadyCancelled`.
#[derive(Clone)]
pub struct DelayedCall {
    state: Rc<RefCell<DelayedCallState>>,
}

impl DelayedCall {
    /// Cancel the scheduled call.
    pub fn cancel(&self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.called {
            return Err(KairoError::AlreadyCalled);
        }
        if state.cancelled {
            return Err(KairoError::AlreadyCancelled);
        }
        state.cancelled = true;
        state.func = None;
        Ok(())
    }

    /// Push the deadline `seconds` further out from where it is now.
    pub fn delay(&self, seconds: f64) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.called {
            return Err(KairoError::AlreadyCalled);
        }
        if state.cancelled {
            return Err(KairoError::AlreadyCancelled);
        }
        state.deadline += secs_to_duration(seconds);
        Ok(())
    }

    /// Re-schedule to fire `seconds` from now.
    pub fn reset(&self, seconds: f64) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.called {
            return Err(KairoError::AlreadyCalled);
        }
        if state.cancelled {
            return Err(KairoError::AlreadyCancelled);
        }
        state.deadline = Instant::now() + secs_to_duration(seconds);
        Ok(())
    }

    /// Whether the call is still pending.
    pub fn active(&self) -> bool {
        let state = self.state.borrow();
        !state.called && !state.cancelled
    }

    /// The instant the call is scheduled to run at.
    pub fn get_time(&self) -> Instant {
        self.state.borrow().deadline
    }
}

impl fmt::Debug for DelayedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        write!(
            f,
            "<DelayedCall seq={} called={} cancelled={}>",
            state.seq, state.called, state.cancelled
        )
    }
}

// Heap entry; stale entries (left behind by reset/delay) are detected by
// comparing the recorded deadline against the live state on pop.
struct HeapEntry {
    deadline: Instant,
    seq: u64,
    state: Rc<RefCell<DelayedCallState>>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so the BinaryHeap becomes a min-heap over (deadline, seq);
// the seq tie-break preserves insertion order for equal deadlines.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

pub(crate) struct TimerQueue {
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> TimerQueue {
        TimerQueue { heap: BinaryHeap::new(), next_seq: 0 }
    }

    pub(crate) fn schedule(&mut self, delay: f64, func: Box<dyn FnOnce()>) -> DelayedCall {
        let seq = self.next_seq;
        self.next_seq += 1;
        let deadline = Instant::now() + secs_to_duration(delay);
        let state = Rc::new(RefCell::new(DelayedCallState {
            deadline,
            func: Some(func),
            called: false,
            cancelled: false,
            seq,
        }));
        self.heap.push(HeapEntry { deadline, seq, state: Rc::clone(&state) });
        DelayedCall { state }
    }

    /// Time until the earliest pending call, `None` when the queue holds
    /// nothing runnable.
    pub(crate) fn time_to_next(&mut self, now: Instant) -> Option<Duration> {
        while let Some(top) = self.heap.peek() {
            let state = top.state.borrow();
            if state.called || state.cancelled {
                drop(state);
                self.heap.pop();
                continue;
            }
            if state.deadline != top.deadline {
                // stale entry: re-queue at the live deadline
                let entry = HeapEntry {
                    deadline: state.deadline,
                    seq: state.seq,
                    state: Rc::clone(&top.state),
                };
                drop(state);
                self.heap.pop();
                self.heap.push(entry);
                continue;
            }
            return Some(state.deadline.saturating_duration_since(now));
        }
        None
    }

    /// Pop every call due at `now`, in (deadline, insertion) order. The
    /// returned closures have been detached, so calls scheduled while the
    /// batch runs always wait for the next iteration.
    pub(crate) fn due_batch(&mut self, now: Instant) -> Vec<Box<dyn FnOnce()>> {
        let mut batch = Vec::new();
        loop {
            match self.time_to_next(now) {
                Some(wait) if wait == Duration::ZERO => {}
                _ => break,
            }
            let Some(entry) = self.heap.pop() else { break };
            let mut state = entry.state.borrow_mut();
            state.called = true;
            if let Some(func) = state.func.take() {
                batch.push(func);
            }
        }
        batch
    }

    /// Live handles for every pending call.
    pub(crate) fn pending(&self) -> Vec<DelayedCall> {
        let mut seen = std::collections::HashSet::new();
        let mut calls: Vec<(Instant, u64, DelayedCall)> = self
            .heap
            .iter()
            .filter_map(|e| {
                let s = e.state.borrow();
                if s.called || s.cancelled || !seen.insert(s.seq) {
                    return None;
                }
                Some((s.deadline, s.seq, DelayedCall { state: Rc::clone(&e.state) }))
            })
            .collect();
        calls.sort_by_key(|(deadline, seq, _)| (*deadline, *seq));
        calls.into_iter().map(|(_, _, call)| call).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn noop() -> Box<dyn FnOnce()> {
        Box::new(|| {})
    }

    #[test]
    fn cancel_then_cancel_again_errors() {
        let mut q = TimerQueue::new();
        let call = q.schedule(10.0, noop());
        assert!(call.active());
        call.cancel().unwrap();
        assert!(!call.active());
        assert!(matches!(call.cancel(), Err(KairoError::AlreadyCancelled)));
        assert!(matches!(call.delay(1.0), Err(KairoError::AlreadyCancelled)));
    }

    #[test]
    fn due_batch_runs_in_deadline_then_insertion_order() {
        let mut q = TimerQueue::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for (delay, tag) in [(0.010, 10u32), (0.020, 20), (0.005, 5)] {
            let order = Rc::clone(&order);
            q.schedule(delay, Box::new(move || order.borrow_mut().push(tag)));
        }
        std::thread::sleep(Duration::from_millis(40));
        for func in q.due_batch(Instant::now()) {
            func();
        }
        assert_eq!(*order.borrow(), vec![5, 10, 20]);
    }

    #[test]
    fn equal_deadlines_preserve_insertion_order() {
        let mut q = TimerQueue::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in 0..4u32 {
            let order = Rc::clone(&order);
            q.schedule(0.0, Box::new(move || order.borrow_mut().push(tag)));
        }
        for func in q.due_batch(Instant::now() + Duration::from_millis(1)) {
            func();
        }
        assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn cancelled_calls_never_run() {
        let mut q = TimerQueue::new();
        let ran = Rc::new(Cell::new(false));
        let ran2 = Rc::clone(&ran);
        let call = q.schedule(0.0, Box::new(move || ran2.set(true)));
        call.cancel().unwrap();
        for func in q.due_batch(Instant::now() + Duration::from_millis(1)) {
            func();
        }
        assert!(!ran.get());
    }

    #[test]
    fn reset_moves_the_deadline() {
        let mut q = TimerQueue::new();
        let call = q.schedule(0.0, noop());
        call.reset(30.0).unwrap();
        assert!(q.due_batch(Instant::now() + Duration::from_millis(1)).is_empty());
        assert!(call.active());
        let wait = q.time_to_next(Instant::now()).expect("still queued");
        assert!(wait > Duration::from_secs(20));
    }

    #[test]
    fn run_marks_called() {
        let mut q = TimerQueue::new();
        let call = q.schedule(0.0, noop());
        let batch = q.due_batch(Instant::now() + Duration::from_millis(1));
        assert_eq!(batch.len(), 1);
        assert!(!call.active());
        assert!(matches!(call.cancel(), Err(KairoError::AlreadyCalled)));
        assert!(matches!(call.reset(1.0), Err(KairoError::AlreadyCalled)));
    }
}
