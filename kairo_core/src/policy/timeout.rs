use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Instant;

use super::{WrapperEvents, WrapperTransport, WrappingFactory};
use crate::debug_log;
use crate::protocol::Factory;
use crate::reactor::{DelayedCall, Reactor};
use crate::transport::Transport;

/// Disconnects wrapped connections that sit idle too long.
///
/// Every `write`/`write_sequence`/`data_received` resets the clock. On
/// expiry the policy hook runs; the default closes the connection.
pub struct TimeoutPolicy {
    reactor: Reactor,
    period: f64,
    on_timeout: Box<dyn Fn(&Rc<WrapperTransport>)>,
    self_weak: Weak<TimeoutPolicy>,
}

impl TimeoutPolicy {
    pub fn new(reactor: Reactor, period: f64) -> Rc<TimeoutPolicy> {
        TimeoutPolicy::with_hook(reactor, period, |wrapper| {
            debug_log!("Idle timeout; closing connection to {}", wrapper.get_peer());
            wrapper.lose_connection();
        })
    }

    /// Like [`new`](TimeoutPolicy::new) with a custom expiry action.
    pub fn with_hook(
        reactor: Reactor,
        period: f64,
        on_timeout: impl Fn(&Rc<WrapperTransport>) + 'static,
    ) -> Rc<TimeoutPolicy> {
        Rc::new_cyclic(|weak| TimeoutPolicy {
            reactor,
            period,
            on_timeout: Box::new(on_timeout),
            self_weak: weak.clone(),
        })
    }

    /// Wrap `factory` with this policy.
    pub fn wrap<F: Factory + 'static>(
        self: &Rc<Self>,
        factory: Rc<RefCell<F>>,
    ) -> WrappingFactory {
        WrappingFactory::new(factory, Rc::clone(self) as Rc<dyn WrapperEvents>)
    }

    fn reset(&self, wrapper: &Rc<WrapperTransport>) {
        wrapper.with_extra(|extra| {
            if let Some(call) = extra.and_then(|e| e.downcast_ref::<DelayedCall>()) {
                let _ = call.reset(self.period);
            }
        });
    }
}

impl WrapperEvents for TimeoutPolicy {
    fn connection_made(&self, wrapper: &Rc<WrapperTransport>) {
        let weak = Rc::downgrade(wrapper);
        let policy = self.self_weak.clone();
        let call = self.reactor.call_later(self.period, move || {
            if let (Some(wrapper), Some(policy)) = (weak.upgrade(), policy.upgrade()) {
                (policy.on_timeout)(&wrapper);
            }
        });
        wrapper.set_extra(Box::new(call));
    }

    fn data_received(&self, wrapper: &Rc<WrapperTransport>, _data: &[u8]) {
        self.reset(wrapper);
    }

    fn wrote(&self, wrapper: &Rc<WrapperTransport>, _len: usize) {
        self.reset(wrapper);
    }

    fn connection_lost(&self, wrapper: &Rc<WrapperTransport>) {
        wrapper.with_extra(|extra| {
            if let Some(call) = extra.and_then(|e| e.downcast_ref::<DelayedCall>()) {
                let _ = call.cancel();
            }
        });
    }
}

/// A reusable inactivity timer for protocols that want their own
/// timeout handling instead of a wrapper.
///
/// The timer is lazy about activity: `reset_timeout` just records the
/// time, and the scheduled check re-arms itself for the remainder when
/// activity happened since it was scheduled.
pub struct IdleTimer {
    reactor: Reactor,
    period: Cell<Option<f64>>,
    last_activity: Cell<Instant>,
    call: RefCell<Option<DelayedCall>>,
    on_timeout: Box<dyn Fn()>,
    self_weak: Weak<IdleTimer>,
}

impl IdleTimer {
    pub fn new(reactor: Reactor, on_timeout: impl Fn() + 'static) -> Rc<IdleTimer> {
        Rc::new_cyclic(|weak| IdleTimer {
            reactor,
            period: Cell::new(None),
            last_activity: Cell::new(Instant::now()),
            call: RefCell::new(None),
            on_timeout: Box::new(on_timeout),
            self_weak: weak.clone(),
        })
    }

    /// Change (or with `None`, disable) the timeout period. Returns the
    /// previous period.
    pub fn set_timeout(&self, period: Option<f64>) -> Option<f64> {
        let previous = self.period.replace(period);
        self.last_activity.set(Instant::now());
        self.cancel_timeout();
        if let Some(seconds) = period {
            self.schedule(seconds);
        }
        previous
    }

    /// Note activity, pushing the deadline out.
    pub fn reset_timeout(&self) {
        self.last_activity.set(Instant::now());
    }

    /// Stop any pending timer without clearing the period.
    pub fn cancel_timeout(&self) {
        if let Some(call) = self.call.borrow_mut().take() {
            let _ = call.cancel();
        }
    }

    fn schedule(&self, seconds: f64) {
        let weak = self.self_weak.clone();
        let call = self.reactor.call_later(seconds, move || {
            if let Some(timer) = weak.upgrade() {
                timer.check();
            }
        });
        *self.call.borrow_mut() = Some(call);
    }

    fn check(&self) {
        self.call.borrow_mut().take();
        let Some(period) = self.period.get() else { return };
        let idle = self.last_activity.get().elapsed().as_secs_f64();
        if idle >= period {
            (self.on_timeout)();
        } else {
            self.schedule(period - idle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::policy::tests::{connect_wrapper, inner_factory, InnerLog};
    use crate::protocol::Protocol;
    use std::time::Duration;

    fn addr() -> Address {
        Address::Inet("198.51.100.4:4000".parse().unwrap())
    }

    #[test]
    fn idle_connection_is_closed() {
        let reactor = Reactor::new().unwrap();
        let policy = TimeoutPolicy::new(reactor.clone(), 0.05);
        let log = Rc::new(RefCell::new(InnerLog::default()));
        let mut factory = policy.wrap(inner_factory(Rc::clone(&log), false));
        let (_proto, st) = connect_wrapper(&mut factory, &addr()).unwrap();

        assert!(!st.disconnecting());
        let deadline = Instant::now() + Duration::from_millis(1000);
        while Instant::now() < deadline && !st.disconnecting() {
            reactor.iterate(0.01).unwrap();
        }
        assert!(st.disconnecting(), "idle connection was not closed");
    }

    #[test]
    fn activity_defers_the_timeout() {
        let reactor = Reactor::new().unwrap();
        let policy = TimeoutPolicy::new(reactor.clone(), 0.08);
        let log = Rc::new(RefCell::new(InnerLog::default()));
        let mut factory = policy.wrap(inner_factory(Rc::clone(&log), false));
        let (mut proto, st) = connect_wrapper(&mut factory, &addr()).unwrap();

        // keep feeding data for a while; the reset must keep it open
        let feeding_until = Instant::now() + Duration::from_millis(200);
        while Instant::now() < feeding_until {
            proto.data_received(b"tick");
            reactor.iterate(0.01).unwrap();
        }
        assert!(!st.disconnecting(), "active connection was closed");

        // now go quiet and let it expire
        let deadline = Instant::now() + Duration::from_millis(1000);
        while Instant::now() < deadline && !st.disconnecting() {
            reactor.iterate(0.01).unwrap();
        }
        assert!(st.disconnecting());
    }

    #[test]
    fn custom_hook_replaces_the_close() {
        let reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(0u32));
        let fired2 = Rc::clone(&fired);
        let policy = TimeoutPolicy::with_hook(reactor.clone(), 0.03, move |_wrapper| {
            fired2.set(fired2.get() + 1);
        });
        let log = Rc::new(RefCell::new(InnerLog::default()));
        let mut factory = policy.wrap(inner_factory(Rc::clone(&log), false));
        let (_proto, st) = connect_wrapper(&mut factory, &addr()).unwrap();

        let deadline = Instant::now() + Duration::from_millis(1000);
        while Instant::now() < deadline && fired.get() == 0 {
            reactor.iterate(0.01).unwrap();
        }
        assert_eq!(fired.get(), 1);
        assert!(!st.disconnecting());
    }

    #[test]
    fn idle_timer_set_and_cancel() {
        let reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(0u32));
        let fired2 = Rc::clone(&fired);
        let timer = IdleTimer::new(reactor.clone(), move || fired2.set(fired2.get() + 1));

        assert_eq!(timer.set_timeout(Some(0.03)), None);
        let deadline = Instant::now() + Duration::from_millis(1000);
        while Instant::now() < deadline && fired.get() == 0 {
            reactor.iterate(0.01).unwrap();
        }
        assert_eq!(fired.get(), 1);

        // re-arm, then disable before expiry
        assert_eq!(timer.set_timeout(Some(10.0)), Some(0.03));
        assert_eq!(timer.set_timeout(None), Some(10.0));
        reactor.iterate(0.01).unwrap();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn idle_timer_reset_delays_expiry() {
        let reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(0u32));
        let fired2 = Rc::clone(&fired);
        let timer = IdleTimer::new(reactor.clone(), move || fired2.set(fired2.get() + 1));
        timer.set_timeout(Some(0.08));

        let feeding_until = Instant::now() + Duration::from_millis(200);
        while Instant::now() < feeding_until {
            timer.reset_timeout();
            reactor.iterate(0.01).unwrap();
        }
        assert_eq!(fired.get(), 0, "activity should defer expiry");

        let deadline = Instant::now() + Duration::from_millis(1000);
        while Instant::now() < deadline && fired.get() == 0 {
            reactor.iterate(0.01).unwrap();
        }
        assert_eq!(fired.get(), 1);
    }
}
