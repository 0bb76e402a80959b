//! Test doubles for the transport contract.
//!
//! `StringTransport` stands in for a real socket in protocol unit
//! tests: everything written is accumulated for assertions and the
//! disconnect is recorded instead of performed.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::BytesMut;

use crate::address::Address;
use crate::error::{KairoError, Result};
use crate::transport::{ConnectionState, Consumer, Producer, Transport};

/// An in-memory transport that records writes.
pub struct StringTransport {
    written: RefCell<BytesMut>,
    producer: RefCell<Option<(Rc<dyn Producer>, bool)>>,
    state: Cell<ConnectionState>,
    reading: Cell<bool>,
    peer: Address,
    host: Address,
}

impl Default for StringTransport {
    fn default() -> Self {
        Rc::try_unwrap(Self::new()).unwrap_or_else(|_| unreachable!())
    }
}

impl StringTransport {
    pub fn new() -> Rc<StringTransport> {
        let peer: SocketAddr = "192.0.2.2:4321".parse().expect("static addr");
        let host: SocketAddr = "192.0.2.1:1234".parse().expect("static addr");
        Rc::new(StringTransport {
            written: RefCell::new(BytesMut::new()),
            producer: RefCell::new(None),
            state: Cell::new(ConnectionState::Connected),
            reading: Cell::new(true),
            peer: Address::Inet(peer),
            host: Address::Inet(host),
        })
    }

    /// Everything written so far.
    pub fn value(&self) -> Vec<u8> {
        self.written.borrow().to_vec()
    }

    /// Drop the accumulated bytes.
    pub fn clear(&self) {
        self.written.borrow_mut().clear();
    }

    /// Whether `lose_connection` has been called.
    pub fn disconnecting(&self) -> bool {
        self.state.get() == ConnectionState::Disconnecting
    }

    /// Whether reads are currently enabled (`stop_reading` /
    /// `start_reading` toggles this).
    pub fn reading(&self) -> bool {
        self.reading.get()
    }

    pub fn registered_producer(&self) -> Option<(Rc<dyn Producer>, bool)> {
        self.producer.borrow().clone()
    }
}

impl Consumer for StringTransport {
    fn register_producer(&self, producer: Rc<dyn Producer>, streaming: bool) -> Result<()> {
        let mut slot = self.producer.borrow_mut();
        if slot.is_some() {
            return Err(KairoError::ProducerAlreadyRegistered);
        }
        *slot = Some((producer, streaming));
        Ok(())
    }

    fn unregister_producer(&self) {
        self.producer.borrow_mut().take();
    }

    fn write(&self, data: &[u8]) {
        self.written.borrow_mut().extend_from_slice(data);
    }
}

impl Transport for StringTransport {
    fn lose_connection(&self) {
        self.state.set(ConnectionState::Disconnecting);
    }

    fn get_peer(&self) -> Address {
        self.peer.clone()
    }

    fn get_host(&self) -> Address {
        self.host.clone()
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn stop_reading(&self) {
        self.reading.set(false);
    }

    fn start_reading(&self) {
        self.reading.set(true);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
