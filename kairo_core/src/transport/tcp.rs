//! TCP transports and listening ports.

use std::cell::{Cell, RefCell};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::rc::{Rc, Weak};

use bytes::{Buf, BufMut, BytesMut};
use mio::net::{TcpListener, TcpStream};

use crate::address::Address;
use crate::defer::{Deferred, succeed};
use crate::error::{KairoError, Result};
use crate::failure::FailureValue;
use crate::protocol::{Factory, Protocol};
use crate::reactor::{IoHandler, Reactor};
use crate::transport::tls::{TlsContext, TlsSession};
use crate::transport::{ConnectionState, Consumer, Producer, Transport};
use crate::{debug_error, debug_log, debug_trace, debug_warn};

const READ_CHUNK: usize = 8192;

/// Outbound buffer level above which a registered streaming producer is
/// paused until the buffer drains.
pub const WRITE_HIGH_WATER: usize = 64 * 1024;

pub(crate) type ClosedHook = Box<dyn FnOnce(FailureValue)>;

struct ProducerEntry {
    producer: Rc<dyn Producer>,
    streaming: bool,
    paused: bool,
}

/// A connected TCP byte stream owned by the reactor.
///
/// Shared as `Rc<TcpTransport>`; the protocol talks to it through the
/// [`Transport`] trait and it feeds the protocol from the reactor's
/// readiness callbacks. Interior state is split across `RefCell`s so a
/// protocol may call back into the transport from inside
/// `data_received`.
pub struct TcpTransport {
    reactor: Reactor,
    io: RefCell<TcpStream>,
    fileno: i32,
    peer: SocketAddr,
    host: SocketAddr,
    state: Cell<ConnectionState>,
    out_buf: RefCell<BytesMut>,
    close_reason: RefCell<Option<KairoError>>,
    protocol: RefCell<Option<Box<dyn Protocol>>>,
    producer: RefCell<Option<ProducerEntry>>,
    tls: RefCell<Option<TlsSession>>,
    write_registered: Cell<bool>,
    lost: Cell<bool>,
    closed_hook: RefCell<Option<ClosedHook>>,
    self_weak: Weak<TcpTransport>,
}

impl TcpTransport {
    /// Wrap an established socket, register it with the reactor, and
    /// bind the protocol to it.
    pub(crate) fn create(
        reactor: &Reactor,
        stream: TcpStream,
        protocol: Box<dyn Protocol>,
        closed_hook: Option<ClosedHook>,
        no_delay: bool,
        keep_alive: bool,
    ) -> Result<Rc<TcpTransport>> {
        let peer = stream.peer_addr()?;
        let host = stream.local_addr()?;
        if no_delay {
            stream.set_nodelay(true)?;
        }
        if keep_alive {
            socket2::SockRef::from(&stream).set_keepalive(true)?;
        }
        let fileno = stream.as_raw_fd() as i32;
        let transport = Rc::new_cyclic(|weak| TcpTransport {
            reactor: reactor.clone(),
            io: RefCell::new(stream),
            fileno,
            peer,
            host,
            state: Cell::new(ConnectionState::Connected),
            out_buf: RefCell::new(BytesMut::new()),
            close_reason: RefCell::new(None),
            protocol: RefCell::new(Some(protocol)),
            producer: RefCell::new(None),
            tls: RefCell::new(None),
            write_registered: Cell::new(false),
            lost: Cell::new(false),
            closed_hook: RefCell::new(closed_hook),
            self_weak: weak.clone(),
        });
        reactor.add_reader(Rc::clone(&transport) as Rc<dyn IoHandler>)?;
        let handle: Rc<dyn Transport> = Rc::clone(&transport) as Rc<dyn Transport>;
        if let Some(proto) = transport.protocol.borrow_mut().as_mut() {
            proto.make_connection(handle);
        }
        debug_trace!("TCP connection established {} <-> {}", host, peer);
        Ok(transport)
    }

    fn rc(&self) -> Option<Rc<TcpTransport>> {
        self.self_weak.upgrade()
    }

    /// Disable or enable Nagle's algorithm.
    pub fn set_tcp_no_delay(&self, enabled: bool) -> Result<()> {
        self.io.borrow().set_nodelay(enabled)?;
        Ok(())
    }

    /// Toggle TCP keep-alive probes.
    pub fn set_tcp_keep_alive(&self, enabled: bool) -> Result<()> {
        let io = self.io.borrow();
        socket2::SockRef::from(&*io).set_keepalive(enabled)?;
        Ok(())
    }

    /// Upgrade this plaintext connection to TLS.
    ///
    /// Allowed exactly once per connection; `connection_made` is not
    /// re-issued. Bytes already buffered for write go out in the clear
    /// ahead of the handshake, everything written afterwards is
    /// encrypted.
    pub fn start_tls(&self, context: TlsContext) -> Result<()> {
        if self.tls.borrow().is_some() {
            return Err(KairoError::TlsAlreadyStarted);
        }
        let session = TlsSession::new(context)?;
        *self.tls.borrow_mut() = Some(session);
        debug_log!("TLS started towards {}", self.peer);
        // A client session queues its hello immediately.
        self.pump_tls_out();
        Ok(())
    }

    /// Whether a TLS upgrade has happened on this connection.
    pub fn tls_started(&self) -> bool {
        self.tls.borrow().is_some()
    }

    /// The peer's certificate chain, valid after a completed handshake.
    pub fn tls_peer_certificates(&self) -> Option<Vec<rustls::pki_types::CertificateDer<'static>>> {
        self.tls
            .borrow()
            .as_ref()
            .and_then(|s| s.conn.peer_certificates().map(|c| c.to_vec()))
    }

    fn ensure_write(&self) {
        if self.write_registered.get() {
            return;
        }
        let Some(rc) = self.rc() else { return };
        self.write_registered.set(true);
        if let Err(e) = self.reactor.add_writer(rc as Rc<dyn IoHandler>) {
            debug_error!("Failed to watch socket for writing: {}", e);
        }
    }

    fn deliver(&self, data: &[u8]) {
        // The protocol is borrowed for the duration of the callback; it
        // may freely call write()/lose_connection() on this transport,
        // which touch other cells.
        let mut slot = self.protocol.borrow_mut();
        if let Some(proto) = slot.as_mut() {
            proto.data_received(data);
        }
    }

    fn pump_tls_out(&self) {
        let mut produced = false;
        {
            let mut tls = self.tls.borrow_mut();
            if let Some(session) = tls.as_mut() {
                let mut out = self.out_buf.borrow_mut();
                while session.conn.wants_write() {
                    let mut writer = (&mut *out).writer();
                    match session.conn.write_tls(&mut writer) {
                        Ok(0) => break,
                        Ok(_) => produced = true,
                        Err(e) => {
                            debug_error!("TLS record write failed: {}", e);
                            break;
                        }
                    }
                }
            }
        }
        if produced {
            self.ensure_write();
        }
    }

    // Feed raw wire bytes through rustls, returning the plaintext and
    // whether the peer sent close_notify.
    fn tls_process_inbound(
        &self,
        raw: &[u8],
    ) -> std::result::Result<(BytesMut, bool), FailureValue> {
        let mut plain = BytesMut::new();
        let mut peer_closed = false;
        {
            let mut tls = self.tls.borrow_mut();
            let Some(session) = tls.as_mut() else {
                return Ok((BytesMut::from(raw), false));
            };
            let mut cursor = raw;
            while !cursor.is_empty() {
                match session.conn.read_tls(&mut cursor) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => return Err(FailureValue::from_io(e)),
                }
                let state = session.conn.process_new_packets().map_err(|e| {
                    FailureValue::from_error(KairoError::ProtocolViolation(format!(
                        "TLS: {}",
                        e
                    )))
                })?;
                let pending = state.plaintext_bytes_to_read();
                if pending > 0 {
                    let mut buf = vec![0u8; pending];
                    session
                        .conn
                        .reader()
                        .read_exact(&mut buf)
                        .map_err(FailureValue::from_io)?;
                    plain.extend_from_slice(&buf);
                }
                if state.peer_has_closed() {
                    peer_closed = true;
                }
            }
        }
        self.pump_tls_out();
        Ok((plain, peer_closed))
    }

    fn maybe_pause_producer(&self) {
        let should_pause = self.out_buf.borrow().len() > WRITE_HIGH_WATER;
        if !should_pause {
            return;
        }
        let producer = {
            let mut slot = self.producer.borrow_mut();
            match slot.as_mut() {
                Some(entry) if entry.streaming && !entry.paused => {
                    entry.paused = true;
                    Some(Rc::clone(&entry.producer))
                }
                _ => None,
            }
        };
        if let Some(producer) = producer {
            debug_warn!("Write buffer above high-water mark; pausing producer");
            producer.pause_producing();
        }
    }

    // The outbound buffer just drained: resume a paused push producer or
    // ask a pull producer for its next chunk.
    fn buffer_drained(&self) {
        let producer = {
            let mut slot = self.producer.borrow_mut();
            match slot.as_mut() {
                Some(entry) if entry.streaming => {
                    if entry.paused {
                        entry.paused = false;
                        Some(Rc::clone(&entry.producer))
                    } else {
                        None
                    }
                }
                Some(entry) => Some(Rc::clone(&entry.producer)),
                None => None,
            }
        };
        if let Some(producer) = producer {
            producer.resume_producing();
        }
    }
}

impl Consumer for TcpTransport {
    fn register_producer(&self, producer: Rc<dyn Producer>, streaming: bool) -> Result<()> {
        {
            let mut slot = self.producer.borrow_mut();
            if slot.is_some() {
                return Err(KairoError::ProducerAlreadyRegistered);
            }
            *slot = Some(ProducerEntry { producer: Rc::clone(&producer), streaming, paused: false });
        }
        if !streaming {
            // a pull producer is primed for its first chunk
            producer.resume_producing();
        }
        Ok(())
    }

    fn unregister_producer(&self) {
        self.producer.borrow_mut().take();
    }

    fn write(&self, data: &[u8]) {
        if self.state.get() != ConnectionState::Connected {
            debug_warn!("write() on a {:?} transport dropped", self.state.get());
            return;
        }
        if data.is_empty() {
            return;
        }
        if self.tls.borrow().is_some() {
            {
                let mut tls = self.tls.borrow_mut();
                if let Some(session) = tls.as_mut() {
                    if let Err(e) = session.conn.writer().write_all(data) {
                        debug_error!("TLS plaintext write failed: {}", e);
                    }
                }
            }
            self.pump_tls_out();
        } else {
            self.out_buf.borrow_mut().extend_from_slice(data);
            self.ensure_write();
        }
        self.maybe_pause_producer();
    }
}

impl Transport for TcpTransport {
    fn lose_connection(&self) {
        if self.state.get() != ConnectionState::Connected {
            return;
        }
        self.state.set(ConnectionState::Disconnecting);
        if self.tls.borrow().is_some() {
            let mut tls = self.tls.borrow_mut();
            if let Some(session) = tls.as_mut() {
                session.conn.send_close_notify();
            }
            drop(tls);
            self.pump_tls_out();
        }
        // the close itself happens in do_write once the buffer is flushed
        self.ensure_write();
    }

    fn abort_connection(&self) {
        if matches!(self.state.get(), ConnectionState::Disconnected) {
            return;
        }
        self.state.set(ConnectionState::Disconnecting);
        self.out_buf.borrow_mut().clear();
        *self.close_reason.borrow_mut() = Some(KairoError::ConnectionAborted);
        self.ensure_write();
    }

    fn get_peer(&self) -> Address {
        if self.tls.borrow().is_some() {
            Address::Ssl(self.peer)
        } else {
            Address::Inet(self.peer)
        }
    }

    fn get_host(&self) -> Address {
        if self.tls.borrow().is_some() {
            Address::Ssl(self.host)
        } else {
            Address::Inet(self.host)
        }
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn stop_reading(&self) {
        self.reactor.remove_reader(self);
    }

    fn start_reading(&self) {
        if let Some(rc) = self.rc() {
            if let Err(e) = self.reactor.add_reader(rc as Rc<dyn IoHandler>) {
                debug_error!("Failed to resume reading: {}", e);
            }
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl IoHandler for TcpTransport {
    fn fileno(&self) -> i32 {
        self.fileno
    }

    fn register(&self, registry: &mio::Registry, token: mio::Token, interest: mio::Interest) -> io::Result<()> {
        registry.register(&mut *self.io.borrow_mut(), token, interest)
    }

    fn reregister(&self, registry: &mio::Registry, token: mio::Token, interest: mio::Interest) -> io::Result<()> {
        registry.reregister(&mut *self.io.borrow_mut(), token, interest)
    }

    fn deregister(&self, registry: &mio::Registry) -> io::Result<()> {
        registry.deregister(&mut *self.io.borrow_mut())
    }

    fn do_read(&self) -> std::result::Result<(), FailureValue> {
        let mut raw = BytesMut::new();
        let mut peer_closed = false;
        loop {
            let mut chunk = [0u8; READ_CHUNK];
            let outcome = self.io.borrow_mut().read(&mut chunk);
            match outcome {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(n) => {
                    raw.extend_from_slice(&chunk[..n]);
                    if n < READ_CHUNK {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(FailureValue::from_io(e));
                }
            }
        }

        if !raw.is_empty() {
            if self.tls.borrow().is_some() {
                let (plain, tls_closed) = self.tls_process_inbound(&raw)?;
                if tls_closed {
                    peer_closed = true;
                }
                if !plain.is_empty() {
                    self.deliver(&plain);
                }
            } else {
                self.deliver(&raw);
            }
        }

        if peer_closed {
            return Err(FailureValue::from_error(KairoError::ConnectionDone));
        }
        Ok(())
    }

    fn do_write(&self) -> std::result::Result<(), FailureValue> {
        self.pump_tls_out();

        let mut drained = false;
        {
            let mut out = self.out_buf.borrow_mut();
            while !out.is_empty() {
                let written = self.io.borrow_mut().write(&out);
                match written {
                    Ok(0) => break,
                    Ok(n) => {
                        out.advance(n);
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(FailureValue::from_io(e)),
                }
            }
            if out.is_empty() {
                drained = true;
            }
        }

        if drained {
            if self.state.get() == ConnectionState::Disconnecting {
                let reason = self
                    .close_reason
                    .borrow_mut()
                    .take()
                    .unwrap_or(KairoError::ConnectionDone);
                return Err(FailureValue::from_error(reason));
            }
            if self.write_registered.replace(false) {
                self.reactor.remove_writer(self);
            }
            self.buffer_drained();
        }
        Ok(())
    }

    fn connection_lost(&self, reason: FailureValue) {
        if self.lost.replace(true) {
            return;
        }
        self.state.set(ConnectionState::Disconnected);
        self.write_registered.set(false);
        if let Some(entry) = self.producer.borrow_mut().take() {
            entry.producer.stop_producing();
        }
        let proto = self.protocol.borrow_mut().take();
        if let Some(mut proto) = proto {
            proto.connection_lost(reason.clone());
        }
        let hook = self.closed_hook.borrow_mut().take();
        if let Some(hook) = hook {
            hook(reason);
        }
    }
}

/// A listening TCP socket: accepts connections, builds a transport and
/// a protocol for each, and joins them.
pub struct TcpPort {
    reactor: Reactor,
    listener: RefCell<TcpListener>,
    fileno: i32,
    addr: SocketAddr,
    factory: Rc<RefCell<dyn Factory>>,
    listening: Cell<bool>,
}

impl TcpPort {
    pub(crate) fn listen(
        reactor: &Reactor,
        addr: SocketAddr,
        factory: Rc<RefCell<dyn Factory>>,
    ) -> Result<Rc<TcpPort>> {
        let listener = TcpListener::bind(addr).map_err(|e| {
            if e.kind() == io::ErrorKind::AddrInUse {
                KairoError::AddressInUse(addr.to_string())
            } else {
                KairoError::from(e)
            }
        })?;
        let local = listener.local_addr()?;
        let fileno = listener.as_raw_fd() as i32;
        factory.borrow_mut().do_start();
        let port = Rc::new(TcpPort {
            reactor: reactor.clone(),
            listener: RefCell::new(listener),
            fileno,
            addr: local,
            factory,
            listening: Cell::new(true),
        });
        reactor.add_reader(Rc::clone(&port) as Rc<dyn IoHandler>)?;
        debug_log!("Listening on {}", local);
        Ok(port)
    }

    /// The bound address (useful with port 0).
    pub fn get_host(&self) -> Address {
        Address::Inet(self.addr)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting connections. Existing connections are unaffected.
    /// The returned deferred fires once the socket is unregistered.
    pub fn stop_listening(&self) -> Deferred {
        if self.listening.replace(false) {
            self.reactor.discard_handler(self);
            self.factory.borrow_mut().do_stop();
            debug_log!("Stopped listening on {}", self.addr);
        }
        succeed(())
    }
}

impl IoHandler for TcpPort {
    fn fileno(&self) -> i32 {
        self.fileno
    }

    fn register(&self, registry: &mio::Registry, token: mio::Token, interest: mio::Interest) -> io::Result<()> {
        registry.register(&mut *self.listener.borrow_mut(), token, interest)
    }

    fn reregister(&self, registry: &mio::Registry, token: mio::Token, interest: mio::Interest) -> io::Result<()> {
        registry.reregister(&mut *self.listener.borrow_mut(), token, interest)
    }

    fn deregister(&self, registry: &mio::Registry) -> io::Result<()> {
        registry.deregister(&mut *self.listener.borrow_mut())
    }

    fn do_read(&self) -> std::result::Result<(), FailureValue> {
        loop {
            let accepted = self.listener.borrow_mut().accept();
            match accepted {
                Ok((stream, peer)) => {
                    let addr = Address::Inet(peer);
                    let proto = self.factory.borrow_mut().build_protocol(&addr);
                    match proto {
                        Some(proto) => {
                            if let Err(e) = TcpTransport::create(
                                &self.reactor,
                                stream,
                                proto,
                                None,
                                false,
                                false,
                            ) {
                                debug_error!("Failed to set up accepted connection: {}", e);
                            }
                        }
                        None => {
                            debug_log!("Factory refused connection from {}", peer);
                            // dropping the stream closes it
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug_error!("accept() failed: {}", e);
                    break;
                }
            }
        }
        Ok(())
    }

    fn connection_lost(&self, _reason: FailureValue) {
        if self.listening.replace(false) {
            self.factory.borrow_mut().do_stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientCreator, ProtocolFactoryFn, TcpConnectOptions};
    use crate::transport::Transport;
    use std::time::{Duration, Instant};

    fn spin_until(reactor: &Reactor, secs: f64, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs_f64(secs);
        while !done() && Instant::now() < deadline {
            reactor.iterate(0.01).expect("iterate");
        }
    }

    // Echoes everything back to the peer.
    struct EchoProtocol {
        transport: Option<Rc<dyn Transport>>,
    }

    impl Protocol for EchoProtocol {
        fn connection_made(&mut self, transport: Rc<dyn Transport>) {
            self.transport = Some(transport);
        }

        fn data_received(&mut self, data: &[u8]) {
            if let Some(t) = self.transport.as_ref() {
                t.write(data);
            }
        }
    }

    #[derive(Default)]
    struct ClientRecord {
        made: u32,
        lost: u32,
        data_before_made: bool,
        data_after_lost: bool,
        received: Vec<u8>,
    }

    // Sends a greeting, collects the echo, and hangs up after enough
    // bytes came back.
    struct GreeterProtocol {
        record: Rc<RefCell<ClientRecord>>,
        expect: usize,
        transport: Option<Rc<dyn Transport>>,
    }

    impl Protocol for GreeterProtocol {
        fn connection_made(&mut self, transport: Rc<dyn Transport>) {
            self.record.borrow_mut().made += 1;
            transport.write_sequence(&[b"hello", b", ", b"world"]);
            self.transport = Some(transport);
        }

        fn data_received(&mut self, data: &[u8]) {
            let mut record = self.record.borrow_mut();
            if record.made == 0 {
                record.data_before_made = true;
            }
            if record.lost > 0 {
                record.data_after_lost = true;
            }
            record.received.extend_from_slice(data);
            let enough = record.received.len() >= self.expect;
            drop(record);
            if enough {
                if let Some(t) = self.transport.as_ref() {
                    t.lose_connection();
                }
            }
        }

        fn connection_lost(&mut self, reason: FailureValue) {
            let mut record = self.record.borrow_mut();
            record.lost += 1;
            // clean close or reset, but always a closed-connection kind
            assert!(reason.check(&[crate::error::ErrorKind::ConnectionClosed]).is_some());
        }
    }

    fn echo_server(reactor: &Reactor) -> Rc<TcpPort> {
        let factory = ProtocolFactoryFn::new(|_| {
            Some(Box::new(EchoProtocol { transport: None }) as Box<dyn Protocol>)
        });
        reactor
            .listen_tcp("127.0.0.1:0".parse().unwrap(), Rc::new(RefCell::new(factory)))
            .expect("listen")
    }

    #[test]
    fn echo_round_trip_and_lifecycle_order() {
        let reactor = Reactor::new().unwrap();
        let port = echo_server(&reactor);

        let record = Rc::new(RefCell::new(ClientRecord::default()));
        let record2 = Rc::clone(&record);
        let creator = ClientCreator::new(reactor.clone());
        let d = creator.connect_tcp(
            "127.0.0.1",
            port.port(),
            TcpConnectOptions::new().timeout(5.0),
            move || {
                let handle = Rc::clone(&record2);
                let proto = GreeterProtocol {
                    record: Rc::clone(&record2),
                    expect: b"hello, world".len(),
                    transport: None,
                };
                (Box::new(proto) as Box<dyn Protocol>, handle)
            },
        );

        spin_until(&reactor, 5.0, || record.borrow().lost == 1);

        let record = record.borrow();
        assert!(d.called());
        assert_eq!(record.made, 1);
        assert_eq!(record.lost, 1);
        assert_eq!(record.received, b"hello, world");
        assert!(!record.data_before_made);
        assert!(!record.data_after_lost);
        port.stop_listening();
    }

    #[test]
    fn refusing_factory_closes_the_connection() {
        let reactor = Reactor::new().unwrap();
        // a factory that refuses everything
        let factory = ProtocolFactoryFn::new(|_| None);
        let port = reactor
            .listen_tcp("127.0.0.1:0".parse().unwrap(), Rc::new(RefCell::new(factory)))
            .unwrap();

        let record = Rc::new(RefCell::new(ClientRecord::default()));
        let record2 = Rc::clone(&record);
        let creator = ClientCreator::new(reactor.clone());
        creator.connect_tcp(
            "127.0.0.1",
            port.port(),
            TcpConnectOptions::new().timeout(5.0),
            move || {
                let handle = Rc::clone(&record2);
                let proto = GreeterProtocol {
                    record: Rc::clone(&record2),
                    expect: usize::MAX,
                    transport: None,
                };
                (Box::new(proto) as Box<dyn Protocol>, handle)
            },
        );

        // the client connects at TCP level, then sees the close
        spin_until(&reactor, 5.0, || record.borrow().lost == 1);
        assert_eq!(record.borrow().received, b"");
        port.stop_listening();
    }

    #[test]
    fn stop_listening_keeps_existing_connections() {
        let reactor = Reactor::new().unwrap();
        let port = echo_server(&reactor);

        let record = Rc::new(RefCell::new(ClientRecord::default()));
        let record2 = Rc::clone(&record);
        let creator = ClientCreator::new(reactor.clone());
        creator.connect_tcp(
            "127.0.0.1",
            port.port(),
            TcpConnectOptions::new().timeout(5.0),
            move || {
                let handle = Rc::clone(&record2);
                let proto = GreeterProtocol {
                    record: Rc::clone(&record2),
                    expect: b"hello, world".len(),
                    transport: None,
                };
                (Box::new(proto) as Box<dyn Protocol>, handle)
            },
        );
        spin_until(&reactor, 5.0, || record.borrow().made == 1);

        let stopped = port.stop_listening();
        assert!(stopped.called());
        // the established connection still echoes to completion
        spin_until(&reactor, 5.0, || record.borrow().lost == 1);
        assert_eq!(record.borrow().received, b"hello, world");
    }

    #[test]
    fn tls_may_only_start_once_per_connection() {
        let reactor = Reactor::new().unwrap();
        let port = echo_server(&reactor);

        let record = Rc::new(RefCell::new(ClientRecord::default()));
        let record2 = Rc::clone(&record);
        let transport_slot: Rc<RefCell<Option<Rc<dyn Transport>>>> = Rc::new(RefCell::new(None));
        let slot2 = Rc::clone(&transport_slot);

        struct KeepTransport {
            record: Rc<RefCell<ClientRecord>>,
            slot: Rc<RefCell<Option<Rc<dyn Transport>>>>,
        }
        impl Protocol for KeepTransport {
            fn connection_made(&mut self, transport: Rc<dyn Transport>) {
                self.record.borrow_mut().made += 1;
                *self.slot.borrow_mut() = Some(transport);
            }
            fn data_received(&mut self, _data: &[u8]) {}
        }

        let creator = ClientCreator::new(reactor.clone());
        creator.connect_tcp(
            "127.0.0.1",
            port.port(),
            TcpConnectOptions::new().timeout(5.0),
            move || {
                (
                    Box::new(KeepTransport { record: record2, slot: slot2 }) as Box<dyn Protocol>,
                    (),
                )
            },
        );
        spin_until(&reactor, 5.0, || record.borrow().made == 1);

        let transport = transport_slot.borrow().clone().expect("connected");
        let tcp = transport
            .as_any()
            .downcast_ref::<TcpTransport>()
            .expect("a real TCP transport");
        assert!(!tcp.tls_started());
        tcp.start_tls(crate::transport::tls::TlsContext::client("localhost"))
            .unwrap();
        assert!(tcp.tls_started());
        assert!(matches!(
            tcp.start_tls(crate::transport::tls::TlsContext::client("localhost")),
            Err(KairoError::TlsAlreadyStarted)
        ));
        // the upgraded transport reports the SSL address family
        assert_eq!(tcp.get_peer().family(), "SSL");
        port.stop_listening();
    }

    #[test]
    fn second_producer_registration_is_refused() {
        let st = crate::transport::testing::StringTransport::new();
        struct NullProducer;
        impl Producer for NullProducer {
            fn resume_producing(&self) {}
            fn stop_producing(&self) {}
        }
        st.register_producer(Rc::new(NullProducer), true).unwrap();
        assert!(matches!(
            st.register_producer(Rc::new(NullProducer), true),
            Err(KairoError::ProducerAlreadyRegistered)
        ));
    }
}
