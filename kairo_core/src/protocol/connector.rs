use std::cell::{Cell, RefCell};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd;
use std::rc::{Rc, Weak};

use mio::net::TcpStream;

use super::ClientFactory;
use crate::address::Address;
use crate::defer::{CallbackReturn, downcast_value};
use crate::error::{KairoError, Result};
use crate::failure::FailureValue;
use crate::reactor::{DelayedCall, IoHandler, Reactor};
use crate::transport::Transport;
use crate::transport::tcp::TcpTransport;
use crate::{debug_error, debug_trace};

/// Options for an outbound TCP connection attempt.
///
/// Consuming-builder style:
///
/// ```rust
/// use kairo_core::protocol::TcpConnectOptions;
///
/// let opts = TcpConnectOptions::new()
///     .timeout(10.0)
///     .no_delay(true);
/// ```
#[derive(Debug, Clone)]
pub struct TcpConnectOptions {
    pub(crate) timeout: f64,
    pub(crate) bind_address: Option<SocketAddr>,
    pub(crate) resolve_timeouts: Vec<f64>,
    pub(crate) no_delay: bool,
    pub(crate) keep_alive: bool,
}

impl Default for TcpConnectOptions {
    fn default() -> Self {
        TcpConnectOptions {
            timeout: 30.0,
            bind_address: None,
            resolve_timeouts: vec![1.0, 3.0, 11.0, 45.0],
            no_delay: false,
            keep_alive: false,
        }
    }
}

impl TcpConnectOptions {
    pub fn new() -> TcpConnectOptions {
        TcpConnectOptions::default()
    }

    /// Seconds before the whole attempt fails with a timeout. Zero
    /// disables the timer.
    pub fn timeout(mut self, seconds: f64) -> Self {
        self.timeout = seconds;
        self
    }

    /// Local address to bind before connecting.
    pub fn bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = Some(addr);
        self
    }

    /// Per-attempt timeout sequence for name resolution.
    pub fn resolve_timeouts(mut self, timeouts: Vec<f64>) -> Self {
        self.resolve_timeouts = timeouts;
        self
    }

    /// Disable Nagle's algorithm on the connected socket.
    pub fn no_delay(mut self, enable: bool) -> Self {
        self.no_delay = enable;
        self
    }

    /// Enable TCP keep-alive on the connected socket.
    pub fn keep_alive(mut self, enable: bool) -> Self {
        self.keep_alive = enable;
        self
    }
}

/// States of a client connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

/// Controller of a single outbound connection.
///
/// Drives the state machine
/// `idle -> connecting -> connected|disconnected` and delivers
/// `started_connecting` / `client_connection_failed` /
/// `client_connection_lost` to its factory. Reconnection is the
/// factory's business; calling [`connect`](Connector::connect) again
/// from the `Disconnected` state starts a fresh attempt.
pub struct Connector {
    reactor: Reactor,
    host: String,
    port: u16,
    factory: Rc<RefCell<dyn ClientFactory>>,
    options: TcpConnectOptions,
    state: Cell<ConnectorState>,
    timeout_call: RefCell<Option<DelayedCall>>,
    pending: RefCell<Option<Rc<PendingConnect>>>,
    transport: RefCell<Option<Rc<TcpTransport>>>,
    self_weak: Weak<Connector>,
}

impl Connector {
    pub(crate) fn new(
        reactor: Reactor,
        host: &str,
        port: u16,
        factory: Rc<RefCell<dyn ClientFactory>>,
        options: TcpConnectOptions,
    ) -> Rc<Connector> {
        Rc::new_cyclic(|weak| Connector {
            reactor,
            host: host.to_string(),
            port,
            factory,
            options,
            state: Cell::new(ConnectorState::Idle),
            timeout_call: RefCell::new(None),
            pending: RefCell::new(None),
            transport: RefCell::new(None),
            self_weak: weak.clone(),
        })
    }

    fn rc(&self) -> Rc<Connector> {
        // self_weak always upgrades while a method is running on self
        self.self_weak.upgrade().unwrap_or_else(|| unreachable!())
    }

    pub fn state(&self) -> ConnectorState {
        self.state.get()
    }

    /// The peer this connector targets; valid in every state.
    pub fn get_destination(&self) -> Address {
        match self.host.parse::<IpAddr>() {
            Ok(ip) => Address::Inet(SocketAddr::new(ip, self.port)),
            Err(_) => Address::InetHost(self.host.clone(), self.port),
        }
    }

    /// Start (or restart) the connection attempt. Connecting from the
    /// wrong state is reported as a `UserError` by
    /// [`try_connect`](Connector::try_connect); this form just logs it.
    pub fn connect(&self) {
        if let Err(e) = self.try_connect() {
            debug_error!("connect() ignored: {}", e);
        }
    }

    pub fn try_connect(&self) -> Result<()> {
        match self.state.get() {
            ConnectorState::Idle | ConnectorState::Disconnected => {}
            _ => return Err(KairoError::UserAborted),
        }
        self.state.set(ConnectorState::Connecting);
        debug_trace!("Connector -> Connecting ({}:{})", self.host, self.port);

        self.factory.borrow_mut().do_start();
        let rc = self.rc();
        self.factory.borrow_mut().started_connecting(&rc);
        if self.state.get() != ConnectorState::Connecting {
            // started_connecting stopped us synchronously
            return Ok(());
        }

        if self.options.timeout > 0.0 {
            let weak = self.self_weak.clone();
            let call = self.reactor.call_later(self.options.timeout, move || {
                if let Some(connector) = weak.upgrade() {
                    connector.connection_failed(FailureValue::from_error(KairoError::Timeout));
                }
            });
            *self.timeout_call.borrow_mut() = Some(call);
        }

        let ok = self.rc();
        let err = self.rc();
        let port = self.port;
        self.reactor
            .resolve(&self.host, &self.options.resolve_timeouts)
            .add_callbacks(
                move |value| {
                    match downcast_value::<IpAddr>(value) {
                        Ok(ip) => ok.start_attempt(SocketAddr::new(*ip, port)),
                        Err(reason) => ok.connection_failed(reason),
                    }
                    CallbackReturn::ok(())
                },
                move |reason| {
                    err.connection_failed(reason);
                    CallbackReturn::ok(())
                },
            );
        Ok(())
    }

    /// Abandon an in-progress attempt. Errors with `NotConnecting` when
    /// no attempt is in progress.
    pub fn stop_connecting(&self) -> Result<()> {
        if self.state.get() != ConnectorState::Connecting {
            return Err(KairoError::NotConnecting);
        }
        self.connection_failed(FailureValue::from_error(KairoError::UserAborted));
        Ok(())
    }

    /// Break the connection in whatever state it is in.
    pub fn disconnect(&self) {
        match self.state.get() {
            ConnectorState::Connecting => {
                let _ = self.stop_connecting();
            }
            ConnectorState::Connected => {
                if let Some(transport) = self.transport.borrow().as_ref() {
                    transport.lose_connection();
                }
            }
            _ => {}
        }
    }

    fn start_attempt(&self, addr: SocketAddr) {
        if self.state.get() != ConnectorState::Connecting {
            return;
        }
        match start_connect(addr, self.options.bind_address) {
            Ok(stream) => {
                let pending = Rc::new(PendingConnect {
                    fileno: stream.as_raw_fd() as i32,
                    stream: RefCell::new(Some(stream)),
                    connector: self.self_weak.clone(),
                    reactor: self.reactor.clone(),
                });
                *self.pending.borrow_mut() = Some(Rc::clone(&pending));
                if let Err(e) = self.reactor.add_writer(pending) {
                    self.connection_failed(FailureValue::from_error(e));
                }
            }
            Err(e) => self.connection_failed(FailureValue::from_io(e)),
        }
    }

    fn cancel_timeout(&self) {
        if let Some(call) = self.timeout_call.borrow_mut().take() {
            let _ = call.cancel();
        }
    }

    fn drop_pending(&self) {
        if let Some(pending) = self.pending.borrow_mut().take() {
            self.reactor.discard_handler(pending.as_ref());
            pending.stream.borrow_mut().take();
        }
    }

    fn connection_failed(&self, reason: FailureValue) {
        if self.state.get() != ConnectorState::Connecting {
            return;
        }
        debug_trace!("Connector -> Disconnected: {}", reason);
        self.cancel_timeout();
        self.drop_pending();
        self.state.set(ConnectorState::Disconnected);
        let rc = self.rc();
        self.factory.borrow_mut().do_stop();
        self.factory.borrow_mut().client_connection_failed(&rc, reason);
    }

    // A PendingConnect completed the three-way handshake.
    fn connection_succeeded(&self, stream: TcpStream, peer: SocketAddr) {
        if self.state.get() != ConnectorState::Connecting {
            return;
        }
        self.cancel_timeout();
        *self.pending.borrow_mut() = None;

        let addr = Address::Inet(peer);
        let proto = self.factory.borrow_mut().build_protocol(&addr);
        let Some(proto) = proto else {
            self.state.set(ConnectorState::Disconnected);
            let rc = self.rc();
            self.factory.borrow_mut().do_stop();
            self.factory.borrow_mut().client_connection_failed(
                &rc,
                FailureValue::from_error(KairoError::ConnectionAborted),
            );
            return;
        };

        let weak = self.self_weak.clone();
        let hook = Box::new(move |reason: FailureValue| {
            if let Some(connector) = weak.upgrade() {
                connector.connection_broken(reason);
            }
        });
        match TcpTransport::create(
            &self.reactor,
            stream,
            proto,
            Some(hook),
            self.options.no_delay,
            self.options.keep_alive,
        ) {
            Ok(transport) => {
                self.state.set(ConnectorState::Connected);
                debug_trace!("Connector -> Connected ({})", peer);
                *self.transport.borrow_mut() = Some(transport);
            }
            Err(e) => {
                self.state.set(ConnectorState::Disconnected);
                let rc = self.rc();
                self.factory.borrow_mut().do_stop();
                self.factory
                    .borrow_mut()
                    .client_connection_failed(&rc, FailureValue::from_error(e));
            }
        }
    }

    // The established connection went away.
    fn connection_broken(&self, reason: FailureValue) {
        if self.state.get() != ConnectorState::Connected {
            return;
        }
        debug_trace!("Connector -> Disconnected (connection lost)");
        self.state.set(ConnectorState::Disconnected);
        *self.transport.borrow_mut() = None;
        let rc = self.rc();
        self.factory.borrow_mut().do_stop();
        self.factory.borrow_mut().client_connection_lost(&rc, reason);
    }
}

// In-flight nonblocking connect: watched for writability, which signals
// completion or failure of the handshake.
struct PendingConnect {
    fileno: i32,
    stream: RefCell<Option<TcpStream>>,
    connector: Weak<Connector>,
    reactor: Reactor,
}

impl IoHandler for PendingConnect {
    fn fileno(&self) -> i32 {
        self.fileno
    }

    fn register(&self, registry: &mio::Registry, token: mio::Token, interest: mio::Interest) -> io::Result<()> {
        match self.stream.borrow_mut().as_mut() {
            Some(stream) => registry.register(stream, token, interest),
            None => Ok(()),
        }
    }

    fn reregister(&self, registry: &mio::Registry, token: mio::Token, interest: mio::Interest) -> io::Result<()> {
        match self.stream.borrow_mut().as_mut() {
            Some(stream) => registry.reregister(stream, token, interest),
            None => Ok(()),
        }
    }

    fn deregister(&self, registry: &mio::Registry) -> io::Result<()> {
        match self.stream.borrow_mut().as_mut() {
            Some(stream) => registry.deregister(stream),
            None => Ok(()),
        }
    }

    fn do_write(&self) -> std::result::Result<(), FailureValue> {
        let Some(connector) = self.connector.upgrade() else {
            return Ok(());
        };
        let error = match self.stream.borrow().as_ref() {
            Some(stream) => stream.take_error(),
            None => return Ok(()),
        };
        match error {
            Ok(Some(e)) => return Err(FailureValue::from_io(e)),
            Err(e) => return Err(FailureValue::from_io(e)),
            Ok(None) => {}
        }
        let peer = match self.stream.borrow().as_ref() {
            Some(stream) => stream.peer_addr(),
            None => return Ok(()),
        };
        match peer {
            Ok(peer) => {
                // handshake done; hand the socket over to a transport
                self.reactor.discard_handler(self);
                if let Some(stream) = self.stream.borrow_mut().take() {
                    connector.connection_succeeded(stream, peer);
                }
                Ok(())
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(FailureValue::from_io(e)),
        }
    }

    fn connection_lost(&self, reason: FailureValue) {
        if let Some(connector) = self.connector.upgrade() {
            connector.connection_failed(reason);
        }
    }
}

// EINPROGRESS from a nonblocking connect (Linux 115, BSD/macOS 36).
fn connect_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || matches!(e.raw_os_error(), Some(115) | Some(36))
}

fn start_connect(addr: SocketAddr, bind: Option<SocketAddr>) -> io::Result<TcpStream> {
    let Some(bind) = bind else {
        return TcpStream::connect(addr);
    };
    let domain = socket2::Domain::for_address(addr);
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&bind.into())?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(ref e) if connect_in_progress(e) => {}
        Err(e) => return Err(e),
    }
    Ok(TcpStream::from_std(socket.into()))
}
