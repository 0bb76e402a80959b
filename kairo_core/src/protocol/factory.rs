use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use kairo_lib::random::normal_variate;

use super::connector::{Connector, TcpConnectOptions};
use super::Protocol;
use crate::address::Address;
use crate::debug_log;
use crate::defer::Deferred;
use crate::error::ErrorKind;
use crate::failure::FailureValue;
use crate::reactor::{DelayedCall, Reactor};

/// Shared reference count of ports/connectors attached to a factory.
///
/// Embed one in every factory so that `do_start`/`do_stop` can invoke
/// the user hooks exactly once across multiple attachments.
#[derive(Default)]
pub struct PortCount(Cell<usize>);

impl PortCount {
    pub fn new() -> PortCount {
        PortCount(Cell::new(0))
    }

    fn increment(&self) -> usize {
        let n = self.0.get() + 1;
        self.0.set(n);
        n
    }

    fn decrement(&self) -> usize {
        let n = self.0.get().saturating_sub(1);
        self.0.set(n);
        n
    }

    pub fn get(&self) -> usize {
        self.0.get()
    }
}

/// Builder of protocol instances, one per connection.
pub trait Factory {
    /// The embedded attachment counter; see [`PortCount`].
    fn port_count(&self) -> &PortCount;

    /// Create a protocol for a connection from/to `addr`. Returning
    /// `None` refuses the connection.
    fn build_protocol(&mut self, addr: &Address) -> Option<Box<dyn Protocol>>;

    /// Called exactly once when the first port or connector attaches.
    fn start_factory(&mut self) {}

    /// Called exactly once when the last port or connector detaches.
    fn stop_factory(&mut self) {}

    /// Make sure `start_factory` is called. Invoked by ports and
    /// connectors; not meant to be overridden.
    fn do_start(&mut self) {
        if self.port_count().increment() == 1 {
            debug_log!("Starting factory");
            self.start_factory();
        }
    }

    /// Make sure `stop_factory` is called once nothing is attached.
    fn do_stop(&mut self) {
        if self.port_count().decrement() == 0 {
            debug_log!("Stopping factory");
            self.stop_factory();
        }
    }
}

/// A factory for clients: hears about the lifecycle of its connection
/// attempts in addition to building protocols.
pub trait ClientFactory: Factory {
    /// A connection attempt has started; `connector.stop_connecting()`
    /// cancels it.
    fn started_connecting(&mut self, _connector: &Rc<Connector>) {}

    /// The attempt failed before a connection was established.
    fn client_connection_failed(&mut self, _connector: &Rc<Connector>, _reason: FailureValue) {}

    /// An established connection went away.
    fn client_connection_lost(&mut self, _connector: &Rc<Connector>, _reason: FailureValue) {}
}

/// Convenience: build a factory from a closure, for protocols with no
/// shared per-factory state.
pub struct ProtocolFactoryFn {
    ports: PortCount,
    build: Box<dyn FnMut(&Address) -> Option<Box<dyn Protocol>>>,
}

impl ProtocolFactoryFn {
    pub fn new(build: impl FnMut(&Address) -> Option<Box<dyn Protocol>> + 'static) -> ProtocolFactoryFn {
        ProtocolFactoryFn { ports: PortCount::new(), build: Box::new(build) }
    }
}

impl Factory for ProtocolFactoryFn {
    fn port_count(&self) -> &PortCount {
        &self.ports
    }

    fn build_protocol(&mut self, addr: &Address) -> Option<Box<dyn Protocol>> {
        (self.build)(addr)
    }
}

impl ClientFactory for ProtocolFactoryFn {}

/// Reconnection defaults. The factor and jitter constants are inherited
/// from a long line of field-tested reconnecting clients.
pub const DEFAULT_INITIAL_DELAY: f64 = 1.0;
pub const DEFAULT_FACTOR: f64 = 2.7182818284590451;
pub const DEFAULT_JITTER: f64 = 0.11962656492;
pub const DEFAULT_MAX_DELAY: f64 = 3600.0;

/// A client factory that reconnects with exponential back-off.
///
/// Wraps an inner [`ClientFactory`]: protocol building and the
/// lifecycle notifications are delegated, and every connection loss or
/// failure (except a user-initiated abort) schedules another attempt at
/// `min(delay * factor, max_delay)`, perturbed by normal-distributed
/// jitter. Call [`reset_delay`](ReconnectingClientFactory::reset_delay)
/// from the protocol once it considers the session established.
pub struct ReconnectingClientFactory {
    reactor: Reactor,
    inner: Rc<RefCell<dyn ClientFactory>>,
    ports: PortCount,

    pub initial_delay: f64,
    pub factor: f64,
    pub jitter: f64,
    pub max_delay: f64,
    pub max_retries: Option<u32>,

    delay: Cell<f64>,
    retries: Cell<u32>,
    continue_trying: Cell<bool>,
    call: RefCell<Option<DelayedCall>>,
    connector: RefCell<Option<Rc<Connector>>>,
}

impl ReconnectingClientFactory {
    pub fn new(reactor: Reactor, inner: Rc<RefCell<dyn ClientFactory>>) -> ReconnectingClientFactory {
        ReconnectingClientFactory {
            reactor,
            inner,
            ports: PortCount::new(),
            initial_delay: DEFAULT_INITIAL_DELAY,
            factor: DEFAULT_FACTOR,
            jitter: DEFAULT_JITTER,
            max_delay: DEFAULT_MAX_DELAY,
            max_retries: None,
            delay: Cell::new(DEFAULT_INITIAL_DELAY),
            retries: Cell::new(0),
            continue_trying: Cell::new(true),
            call: RefCell::new(None),
            connector: RefCell::new(None),
        }
    }

    /// The delay the next attempt would be scheduled with.
    pub fn current_delay(&self) -> f64 {
        self.delay.get()
    }

    pub fn retries(&self) -> u32 {
        self.retries.get()
    }

    /// Have the connector connect again after a suitable delay.
    pub fn retry(&self, connector: Option<&Rc<Connector>>) {
        if !self.continue_trying.get() {
            debug_log!("Abandoning reconnection on explicit request");
            return;
        }
        let connector = match connector.cloned().or_else(|| self.connector.borrow().clone()) {
            Some(c) => c,
            None => {
                debug_log!("No connector to retry");
                return;
            }
        };

        let retries = self.retries.get() + 1;
        self.retries.set(retries);
        if let Some(max) = self.max_retries {
            if retries > max {
                debug_log!("Abandoning after {} retries", retries);
                return;
            }
        }

        let mut delay = (self.delay.get() * self.factor).min(self.max_delay);
        if self.jitter > 0.0 {
            delay = normal_variate(delay, delay * self.jitter).max(0.0);
        }
        self.delay.set(delay);

        debug_log!("Will retry in {:.3} seconds", delay);
        let call = self.reactor.call_later(delay, move || {
            connector.connect();
        });
        *self.call.borrow_mut() = Some(call);
    }

    /// Stop any attempt to reconnect in progress.
    pub fn stop_trying(&self) {
        if let Some(call) = self.call.borrow_mut().take() {
            let _ = call.cancel();
        }
        self.continue_trying.set(false);
        if let Some(connector) = self.connector.borrow().as_ref() {
            let _ = connector.stop_connecting();
        }
    }

    /// Call after a successful connection to reset the schedule.
    pub fn reset_delay(&self) {
        self.delay.set(self.initial_delay);
        self.retries.set(0);
        *self.call.borrow_mut() = None;
        self.continue_trying.set(true);
    }
}

impl Factory for ReconnectingClientFactory {
    fn port_count(&self) -> &PortCount {
        &self.ports
    }

    fn build_protocol(&mut self, addr: &Address) -> Option<Box<dyn Protocol>> {
        self.inner.borrow_mut().build_protocol(addr)
    }

    fn start_factory(&mut self) {
        self.inner.borrow_mut().start_factory();
    }

    fn stop_factory(&mut self) {
        self.inner.borrow_mut().stop_factory();
    }
}

impl ClientFactory for ReconnectingClientFactory {
    fn started_connecting(&mut self, connector: &Rc<Connector>) {
        *self.connector.borrow_mut() = Some(Rc::clone(connector));
        self.inner.borrow_mut().started_connecting(connector);
    }

    fn client_connection_failed(&mut self, connector: &Rc<Connector>, reason: FailureValue) {
        self.inner
            .borrow_mut()
            .client_connection_failed(connector, reason.clone());
        if self.continue_trying.get() {
            *self.connector.borrow_mut() = Some(Rc::clone(connector));
            if reason.check(&[ErrorKind::UserError]).is_none() {
                self.retry(Some(connector));
            }
        }
    }

    fn client_connection_lost(&mut self, connector: &Rc<Connector>, reason: FailureValue) {
        self.inner
            .borrow_mut()
            .client_connection_lost(connector, reason);
        if self.continue_trying.get() {
            *self.connector.borrow_mut() = Some(Rc::clone(connector));
            self.retry(Some(connector));
        }
    }
}

/// One-shot client helper for cases that don't really need a factory.
///
/// `connect_tcp` builds the protocol with the given closure and returns
/// a `Deferred` that fires with the closure's handle value once the
/// connection is made, or errbacks with the connection failure.
pub struct ClientCreator {
    reactor: Reactor,
}

impl ClientCreator {
    pub fn new(reactor: Reactor) -> ClientCreator {
        ClientCreator { reactor }
    }

    pub fn connect_tcp<V: Any + 'static>(
        &self,
        host: &str,
        port: u16,
        options: TcpConnectOptions,
        build: impl FnOnce() -> (Box<dyn Protocol>, V) + 'static,
    ) -> Deferred {
        let d = Deferred::new();
        let factory = InstanceFactory {
            ports: PortCount::new(),
            reactor: self.reactor.clone(),
            build: RefCell::new(Some(Box::new(move || {
                let (proto, handle) = build();
                (proto, Box::new(handle) as Box<dyn Any>)
            }))),
            deferred: d.clone(),
        };
        self.reactor
            .connect_tcp(host, port, Rc::new(RefCell::new(factory)), options);
        d
    }
}

type InstanceBuild = Box<dyn FnOnce() -> (Box<dyn Protocol>, Box<dyn Any>)>;

// Factory used by ClientCreator.
struct InstanceFactory {
    ports: PortCount,
    reactor: Reactor,
    build: RefCell<Option<InstanceBuild>>,
    deferred: Deferred,
}

impl Factory for InstanceFactory {
    fn port_count(&self) -> &PortCount {
        &self.ports
    }

    fn build_protocol(&mut self, _addr: &Address) -> Option<Box<dyn Protocol>> {
        let build = self.build.borrow_mut().take()?;
        let (proto, handle) = build();
        let d = self.deferred.clone();
        self.reactor.call_later(0.0, move || {
            d.callback_boxed(handle);
        });
        Some(proto)
    }
}

impl ClientFactory for InstanceFactory {
    fn client_connection_failed(&mut self, _connector: &Rc<Connector>, reason: FailureValue) {
        let d = self.deferred.clone();
        self.reactor.call_later(0.0, move || {
            if !d.called() {
                d.errback(reason);
            }
        });
    }
}
