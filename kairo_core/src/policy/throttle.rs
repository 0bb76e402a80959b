use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use super::{WrapperEvents, WrapperTransport, WrappingFactory};
use crate::address::Address;
use crate::debug_log;
use crate::protocol::Factory;
use crate::reactor::{DelayedCall, Reactor};
use crate::transport::{Producer, Transport};

/// Limits for a [`ThrottlingPolicy`].
#[derive(Debug, Clone)]
pub struct ThrottleOptions {
    /// Refuse connections beyond this many at once.
    pub max_connection_count: usize,
    /// Max bytes to read per second across all wrapped connections.
    pub read_limit: Option<usize>,
    /// Max bytes to write per second across all wrapped connections.
    pub write_limit: Option<usize>,
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        ThrottleOptions { max_connection_count: usize::MAX, read_limit: None, write_limit: None }
    }
}

/// Throttles bandwidth and connection count.
///
/// Bytes are counted per second; blowing through a cap pauses the
/// offending direction for proportional slack time
/// (`total/limit - 1` seconds). Reads are paused at the transport,
/// writes through each connection's registered producer, so write
/// throttling only bites where a producer is registered.
pub struct ThrottlingPolicy {
    reactor: Reactor,
    options: ThrottleOptions,
    connection_count: Cell<usize>,
    read_this_second: Cell<usize>,
    written_this_second: Cell<usize>,
    wrappers: RefCell<Vec<Weak<WrapperTransport>>>,
    check_read_timer: RefCell<Option<DelayedCall>>,
    check_write_timer: RefCell<Option<DelayedCall>>,
    unthrottle_read_timer: RefCell<Option<DelayedCall>>,
    unthrottle_write_timer: RefCell<Option<DelayedCall>>,
    self_weak: Weak<ThrottlingPolicy>,
}

impl ThrottlingPolicy {
    pub fn new(reactor: Reactor, options: ThrottleOptions) -> Rc<ThrottlingPolicy> {
        Rc::new_cyclic(|weak| ThrottlingPolicy {
            reactor,
            options,
            connection_count: Cell::new(0),
            read_this_second: Cell::new(0),
            written_this_second: Cell::new(0),
            wrappers: RefCell::new(Vec::new()),
            check_read_timer: RefCell::new(None),
            check_write_timer: RefCell::new(None),
            unthrottle_read_timer: RefCell::new(None),
            unthrottle_write_timer: RefCell::new(None),
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

    pub fn connection_count(&self) -> usize {
        self.connection_count.get()
    }

    fn live_wrappers(&self) -> Vec<Rc<WrapperTransport>> {
        self.wrappers.borrow().iter().filter_map(Weak::upgrade).collect()
    }

    fn throttle_reads(&self) {
        debug_log!("Throttling reads");
        for wrapper in self.live_wrappers() {
            wrapper.stop_reading();
        }
    }

    fn unthrottle_reads(&self) {
        self.unthrottle_read_timer.borrow_mut().take();
        debug_log!("Stopped throttling reads");
        for wrapper in self.live_wrappers() {
            wrapper.start_reading();
        }
    }

    fn throttle_writes(&self) {
        debug_log!("Throttling writes");
        for wrapper in self.live_wrappers() {
            if let Some(producer) = wrapper.registered_producer() {
                producer.pause_producing();
            }
        }
    }

    fn unthrottle_writes(&self) {
        self.unthrottle_write_timer.borrow_mut().take();
        debug_log!("Stopped throttling writes");
        for wrapper in self.live_wrappers() {
            if let Some(producer) = wrapper.registered_producer() {
                producer.resume_producing();
            }
        }
    }

    // Periodic cap check for the read direction; reschedules itself
    // every second while connections exist.
    fn check_read_bandwidth(&self) {
        let Some(limit) = self.options.read_limit else { return };
        let read = self.read_this_second.replace(0);
        if read > limit {
            self.throttle_reads();
            let slack = (read as f64 / limit as f64) - 1.0;
            let weak = self.self_weak.clone();
            let timer = self.reactor.call_later(slack, move || {
                if let Some(policy) = weak.upgrade() {
                    policy.unthrottle_reads();
                }
            });
            *self.unthrottle_read_timer.borrow_mut() = Some(timer);
        }
        let weak = self.self_weak.clone();
        let timer = self.reactor.call_later(1.0, move || {
            if let Some(policy) = weak.upgrade() {
                policy.check_read_bandwidth();
            }
        });
        *self.check_read_timer.borrow_mut() = Some(timer);
    }

    fn check_write_bandwidth(&self) {
        let Some(limit) = self.options.write_limit else { return };
        let written = self.written_this_second.replace(0);
        if written > limit {
            self.throttle_writes();
            let slack = (written as f64 / limit as f64) - 1.0;
            let weak = self.self_weak.clone();
            let timer = self.reactor.call_later(slack, move || {
                if let Some(policy) = weak.upgrade() {
                    policy.unthrottle_writes();
                }
            });
            *self.unthrottle_write_timer.borrow_mut() = Some(timer);
        }
        let weak = self.self_weak.clone();
        let timer = self.reactor.call_later(1.0, move || {
            if let Some(policy) = weak.upgrade() {
                policy.check_write_bandwidth();
            }
        });
        *self.check_write_timer.borrow_mut() = Some(timer);
    }

    fn cancel_timers(&self) {
        for slot in [
            &self.check_read_timer,
            &self.check_write_timer,
            &self.unthrottle_read_timer,
            &self.unthrottle_write_timer,
        ] {
            if let Some(timer) = slot.borrow_mut().take() {
                let _ = timer.cancel();
            }
        }
    }
}

impl WrapperEvents for ThrottlingPolicy {
    fn build_allowed(&self, _addr: &Address) -> bool {
        if self.connection_count.get() >= self.options.max_connection_count {
            debug_log!("Max connection count reached!");
            return false;
        }
        true
    }

    fn connection_made(&self, wrapper: &Rc<WrapperTransport>) {
        let count = self.connection_count.get() + 1;
        self.connection_count.set(count);
        self.wrappers.borrow_mut().push(Rc::downgrade(wrapper));
        if count == 1 {
            // first connection arms the per-second checks
            self.check_read_bandwidth();
            self.check_write_bandwidth();
        }
    }

    fn data_received(&self, _wrapper: &Rc<WrapperTransport>, data: &[u8]) {
        self.read_this_second.set(self.read_this_second.get() + data.len());
    }

    fn wrote(&self, _wrapper: &Rc<WrapperTransport>, len: usize) {
        self.written_this_second.set(self.written_this_second.get() + len);
    }

    fn connection_lost(&self, wrapper: &Rc<WrapperTransport>) {
        let count = self.connection_count.get().saturating_sub(1);
        self.connection_count.set(count);
        let key = Rc::as_ptr(wrapper);
        self.wrappers
            .borrow_mut()
            .retain(|w| w.upgrade().map(|rc| Rc::as_ptr(&rc) != key).unwrap_or(false));
        if count == 0 {
            self.cancel_timers();
        }
    }
}
