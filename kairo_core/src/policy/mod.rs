//! Resource limiting policies, composed as factory/protocol wrappers.
//!
//! A [`WrappingFactory`] builds an inner protocol with the wrapped
//! factory, then hands the connection a [`ProtocolWrapper`] that acts
//! as the inner protocol's transport. Policy objects observe the byte
//! flow through [`WrapperEvents`] hooks and can throttle, time out or
//! refuse connections without the inner protocol noticing.

mod limit;
mod throttle;
mod timeout;

pub use limit::LimitConnectionsByPeer;
pub use throttle::{ThrottleOptions, ThrottlingPolicy};
pub use timeout::{IdleTimer, TimeoutPolicy};

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use crate::address::Address;
use crate::debug_log;
use crate::error::Result;
use crate::failure::FailureValue;
use crate::protocol::{ClientFactory, Connector, Factory, PortCount, Protocol};
use crate::transport::{ConnectionState, Consumer, Producer, Transport};

/// Hooks a policy implements to observe and steer wrapped connections.
///
/// All hooks default to no-ops; `build_allowed` defaults to accepting.
pub trait WrapperEvents {
    /// Gate for new connections; returning `false` makes the wrapping
    /// factory refuse by building no protocol.
    fn build_allowed(&self, _addr: &Address) -> bool {
        true
    }

    /// A wrapper was connected to its transport.
    fn connection_made(&self, _wrapper: &Rc<WrapperTransport>) {}

    /// Bytes are about to be delivered to the inner protocol.
    fn data_received(&self, _wrapper: &Rc<WrapperTransport>, _data: &[u8]) {}

    /// The inner protocol wrote bytes through the wrapper.
    fn wrote(&self, _wrapper: &Rc<WrapperTransport>, _len: usize) {}

    /// The wrapped connection went away.
    fn connection_lost(&self, _wrapper: &Rc<WrapperTransport>) {}
}

/// No-op events, for wrapping without policy.
pub struct NullEvents;

impl WrapperEvents for NullEvents {}

/// The transport the inner protocol sees: relays to the real transport
/// while reporting traffic to the policy.
pub struct WrapperTransport {
    inner: RefCell<Option<Box<dyn Protocol>>>,
    transport: RefCell<Option<Rc<dyn Transport>>>,
    producer: RefCell<Option<Rc<dyn Producer>>>,
    events: Rc<dyn WrapperEvents>,
    // slot for per-connection policy state (e.g. an idle timer)
    extra: RefCell<Option<Box<dyn Any>>>,
    self_weak: std::rc::Weak<WrapperTransport>,
}

impl WrapperTransport {
    fn real_transport(&self) -> Option<Rc<dyn Transport>> {
        self.transport.borrow().clone()
    }

    fn rc_from(this: &Rc<Self>) -> Rc<dyn Transport> {
        Rc::clone(this) as Rc<dyn Transport>
    }

    /// The producer the inner protocol registered through this wrapper.
    pub fn registered_producer(&self) -> Option<Rc<dyn Producer>> {
        self.producer.borrow().clone()
    }

    /// Per-connection policy state.
    pub fn set_extra(&self, value: Box<dyn Any>) {
        *self.extra.borrow_mut() = Some(value);
    }

    pub fn with_extra<R>(&self, f: impl FnOnce(Option<&mut Box<dyn Any>>) -> R) -> R {
        f(self.extra.borrow_mut().as_mut())
    }
}

impl Consumer for WrapperTransport {
    fn register_producer(&self, producer: Rc<dyn Producer>, streaming: bool) -> Result<()> {
        *self.producer.borrow_mut() = Some(Rc::clone(&producer));
        match self.real_transport() {
            Some(t) => t.register_producer(producer, streaming),
            None => Ok(()),
        }
    }

    fn unregister_producer(&self) {
        self.producer.borrow_mut().take();
        if let Some(t) = self.real_transport() {
            t.unregister_producer();
        }
    }

    fn write(&self, data: &[u8]) {
        if let Some(t) = self.real_transport() {
            if let Some(me) = self.self_rc() {
                self.events.wrote(&me, data.len());
            }
            t.write(data);
        }
    }
}

impl Transport for WrapperTransport {
    fn write_sequence(&self, data: &[&[u8]]) {
        if let Some(t) = self.real_transport() {
            let total: usize = data.iter().map(|d| d.len()).sum();
            if let Some(me) = self.self_rc() {
                self.events.wrote(&me, total);
            }
            t.write_sequence(data);
        }
    }

    fn lose_connection(&self) {
        if let Some(t) = self.real_transport() {
            t.lose_connection();
        }
    }

    fn abort_connection(&self) {
        if let Some(t) = self.real_transport() {
            t.abort_connection();
        }
    }

    fn get_peer(&self) -> Address {
        match self.real_transport() {
            Some(t) => t.get_peer(),
            None => Address::File("detached-wrapper".to_string()),
        }
    }

    fn get_host(&self) -> Address {
        match self.real_transport() {
            Some(t) => t.get_host(),
            None => Address::File("detached-wrapper".to_string()),
        }
    }

    fn state(&self) -> ConnectionState {
        match self.real_transport() {
            Some(t) => t.state(),
            None => ConnectionState::Connecting,
        }
    }

    fn stop_reading(&self) {
        if let Some(t) = self.real_transport() {
            t.stop_reading();
        }
    }

    fn start_reading(&self) {
        if let Some(t) = self.real_transport() {
            t.start_reading();
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl WrapperTransport {
    fn self_rc(&self) -> Option<Rc<WrapperTransport>> {
        self.self_weak.upgrade()
    }
}

/// The protocol a wrapping factory hands to the connection: relays
/// `data_received`/`connection_lost` into the inner protocol while the
/// paired [`WrapperTransport`] relays writes back out.
pub struct ProtocolWrapper {
    state: Rc<WrapperTransport>,
}

impl Protocol for ProtocolWrapper {
    fn connection_made(&mut self, transport: Rc<dyn Transport>) {
        *self.state.transport.borrow_mut() = Some(transport);
        self.state.events.connection_made(&self.state);
        let handle = WrapperTransport::rc_from(&self.state);
        if let Some(inner) = self.state.inner.borrow_mut().as_mut() {
            inner.make_connection(handle);
        }
    }

    fn data_received(&mut self, data: &[u8]) {
        self.state.events.data_received(&self.state, data);
        if let Some(inner) = self.state.inner.borrow_mut().as_mut() {
            inner.data_received(data);
        }
    }

    fn connection_lost(&mut self, reason: FailureValue) {
        self.state.events.connection_lost(&self.state);
        let inner = self.state.inner.borrow_mut().take();
        if let Some(mut inner) = inner {
            inner.connection_lost(reason);
        }
        self.state.transport.borrow_mut().take();
    }
}

/// Wraps a factory so every protocol it builds is interposed by a
/// policy.
pub struct WrappingFactory {
    ports: PortCount,
    wrapped: Rc<RefCell<dyn Factory>>,
    wrapped_client: Option<Rc<RefCell<dyn ClientFactory>>>,
    events: Rc<dyn WrapperEvents>,
}

impl WrappingFactory {
    /// Wrap a server-side factory.
    pub fn new<F: Factory + 'static>(wrapped: Rc<RefCell<F>>, events: Rc<dyn WrapperEvents>) -> WrappingFactory {
        WrappingFactory {
            ports: PortCount::new(),
            wrapped,
            wrapped_client: None,
            events,
        }
    }

    /// Wrap a client factory, delegating the client lifecycle callbacks
    /// as well.
    pub fn new_client<F: ClientFactory + 'static>(
        wrapped: Rc<RefCell<F>>,
        events: Rc<dyn WrapperEvents>,
    ) -> WrappingFactory {
        WrappingFactory {
            ports: PortCount::new(),
            wrapped: Rc::clone(&wrapped) as Rc<RefCell<dyn Factory>>,
            wrapped_client: Some(wrapped),
            events,
        }
    }
}

impl Factory for WrappingFactory {
    fn port_count(&self) -> &PortCount {
        &self.ports
    }

    fn build_protocol(&mut self, addr: &Address) -> Option<Box<dyn Protocol>> {
        if !self.events.build_allowed(addr) {
            debug_log!("Policy refused connection from {}", addr);
            return None;
        }
        let inner = self.wrapped.borrow_mut().build_protocol(addr)?;
        let events = Rc::clone(&self.events);
        let state = Rc::new_cyclic(|weak| WrapperTransport {
            inner: RefCell::new(Some(inner)),
            transport: RefCell::new(None),
            producer: RefCell::new(None),
            events,
            extra: RefCell::new(None),
            self_weak: weak.clone(),
        });
        Some(Box::new(ProtocolWrapper { state }))
    }

    fn start_factory(&mut self) {
        self.wrapped.borrow_mut().do_start();
    }

    fn stop_factory(&mut self) {
        self.wrapped.borrow_mut().do_stop();
    }
}

impl ClientFactory for WrappingFactory {
    fn started_connecting(&mut self, connector: &Rc<Connector>) {
        if let Some(client) = self.wrapped_client.as_ref() {
            client.borrow_mut().started_connecting(connector);
        }
    }

    fn client_connection_failed(&mut self, connector: &Rc<Connector>, reason: FailureValue) {
        if let Some(client) = self.wrapped_client.as_ref() {
            client.borrow_mut().client_connection_failed(connector, reason);
        }
    }

    fn client_connection_lost(&mut self, connector: &Rc<Connector>, reason: FailureValue) {
        if let Some(client) = self.wrapped_client.as_ref() {
            client.borrow_mut().client_connection_lost(connector, reason);
        }
    }
}

/// Logs every chunk in both directions; diagnostic wrapper.
pub struct SpewingPolicy;

impl WrapperEvents for SpewingPolicy {
    fn data_received(&self, _wrapper: &Rc<WrapperTransport>, data: &[u8]) {
        debug_log!("Received: {:?}", String::from_utf8_lossy(data));
        let _ = data;
    }

    fn wrote(&self, _wrapper: &Rc<WrapperTransport>, len: usize) {
        debug_log!("Sending {} bytes", len);
        let _ = len;
    }
}
