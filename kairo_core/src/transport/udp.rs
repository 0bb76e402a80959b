//! Datagram (UDP) ports.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::rc::Rc;

use mio::net::UdpSocket;

use crate::address::Address;
use crate::defer::{Deferred, succeed};
use crate::error::{KairoError, Result};
use crate::failure::FailureValue;
use crate::protocol::DatagramProtocol;
use crate::reactor::{IoHandler, Reactor};
use crate::{debug_error, debug_log};

const MAX_PACKET: usize = 8192;

/// A bound UDP socket joined to a [`DatagramProtocol`].
///
/// The port is both the listening socket and the datagram transport:
/// protocols send through [`write_to`](UdpPort::write_to) (or
/// [`write`](UdpPort::write) after [`connect`](UdpPort::connect)).
pub struct UdpPort {
    reactor: Reactor,
    socket: RefCell<UdpSocket>,
    fileno: i32,
    addr: SocketAddr,
    protocol: Rc<RefCell<dyn DatagramProtocol>>,
    connected_to: Cell<Option<SocketAddr>>,
    listening: Cell<bool>,
}

impl UdpPort {
    pub(crate) fn listen(
        reactor: &Reactor,
        addr: SocketAddr,
        protocol: Rc<RefCell<dyn DatagramProtocol>>,
    ) -> Result<Rc<UdpPort>> {
        let socket = UdpSocket::bind(addr).map_err(|e| {
            if e.kind() == io::ErrorKind::AddrInUse {
                KairoError::AddressInUse(addr.to_string())
            } else {
                KairoError::from(e)
            }
        })?;
        let local = socket.local_addr()?;
        let fileno = socket.as_raw_fd() as i32;
        let port = Rc::new(UdpPort {
            reactor: reactor.clone(),
            socket: RefCell::new(socket),
            fileno,
            addr: local,
            protocol,
            connected_to: Cell::new(None),
            listening: Cell::new(true),
        });
        reactor.add_reader(Rc::clone(&port) as Rc<dyn IoHandler>)?;
        port.protocol.borrow_mut().start_protocol(Rc::clone(&port));
        debug_log!("UDP port bound on {}", local);
        Ok(port)
    }

    pub fn get_host(&self) -> Address {
        Address::InetUdp(self.addr)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Restrict the socket to one peer; afterwards [`write`](UdpPort::write)
    /// sends there and ICMP unreachable errors surface as
    /// `connection_refused`.
    pub fn connect(&self, peer: SocketAddr) -> Result<()> {
        self.socket.borrow().connect(peer)?;
        self.connected_to.set(Some(peer));
        Ok(())
    }

    /// Send one datagram to `peer`.
    pub fn write_to(&self, data: &[u8], peer: SocketAddr) -> Result<usize> {
        match self.socket.borrow().send_to(data, peer) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                self.protocol.borrow_mut().connection_refused();
                Err(KairoError::ConnectionRefused)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send one datagram to the connected peer.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if self.connected_to.get().is_none() {
            return Err(KairoError::Other("UDP port is not connected".to_string()));
        }
        match self.socket.borrow().send(data) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                self.protocol.borrow_mut().connection_refused();
                Err(KairoError::ConnectionRefused)
            }
            Err(e) => {
                debug_error!("UDP send failed: {}", e);
                Err(e.into())
            }
        }
    }

    /// Unbind the socket; fires once the protocol has been stopped.
    pub fn stop_listening(&self) -> Deferred {
        if self.listening.replace(false) {
            self.reactor.discard_handler(self);
            self.protocol.borrow_mut().stop_protocol();
            debug_log!("UDP port on {} closed", self.addr);
        }
        succeed(())
    }
}

impl IoHandler for UdpPort {
    fn fileno(&self) -> i32 {
        self.fileno
    }

    fn register(&self, registry: &mio::Registry, token: mio::Token, interest: mio::Interest) -> io::Result<()> {
        registry.register(&mut *self.socket.borrow_mut(), token, interest)
    }

    fn reregister(&self, registry: &mio::Registry, token: mio::Token, interest: mio::Interest) -> io::Result<()> {
        registry.reregister(&mut *self.socket.borrow_mut(), token, interest)
    }

    fn deregister(&self, registry: &mio::Registry) -> io::Result<()> {
        registry.deregister(&mut *self.socket.borrow_mut())
    }

    fn do_read(&self) -> std::result::Result<(), FailureValue> {
        loop {
            let mut buf = [0u8; MAX_PACKET];
            let received = self.socket.borrow().recv_from(&mut buf);
            match received {
                Ok((n, from)) => {
                    self.protocol.borrow_mut().datagram_received(&buf[..n], from);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    // ICMP error generated by a previous write on a
                    // connected socket
                    self.protocol.borrow_mut().connection_refused();
                }
                Err(e) => return Err(FailureValue::from_io(e)),
            }
        }
        Ok(())
    }

    fn connection_lost(&self, _reason: FailureValue) {
        if self.listening.replace(false) {
            self.protocol.borrow_mut().stop_protocol();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn spin_until(reactor: &Reactor, secs: f64, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs_f64(secs);
        while !done() && Instant::now() < deadline {
            reactor.iterate(0.01).expect("iterate");
        }
    }

    #[derive(Default)]
    struct EchoState {
        started: u32,
        stopped: u32,
        datagrams: Vec<(Vec<u8>, SocketAddr)>,
    }

    struct UdpEcho {
        state: Rc<RefCell<EchoState>>,
        port: Option<Rc<UdpPort>>,
    }

    impl DatagramProtocol for UdpEcho {
        fn start_protocol(&mut self, port: Rc<UdpPort>) {
            self.state.borrow_mut().started += 1;
            self.port = Some(port);
        }

        fn stop_protocol(&mut self) {
            self.state.borrow_mut().stopped += 1;
        }

        fn datagram_received(&mut self, data: &[u8], from: SocketAddr) {
            self.state.borrow_mut().datagrams.push((data.to_vec(), from));
            if let Some(port) = self.port.as_ref() {
                let _ = port.write_to(data, from);
            }
        }
    }

    #[test]
    fn datagrams_round_trip_between_two_ports() {
        let reactor = Reactor::new().unwrap();
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let server_state = Rc::new(RefCell::new(EchoState::default()));
        let server = UdpPort::listen(
            &reactor,
            bind,
            Rc::new(RefCell::new(UdpEcho { state: Rc::clone(&server_state), port: None })),
        )
        .unwrap();

        let client_state = Rc::new(RefCell::new(EchoState::default()));
        let client = UdpPort::listen(
            &reactor,
            bind,
            Rc::new(RefCell::new(UdpEcho { state: Rc::clone(&client_state), port: None })),
        )
        .unwrap();

        let server_addr: SocketAddr =
            format!("127.0.0.1:{}", server.port()).parse().unwrap();
        client.write_to(b"ping", server_addr).unwrap();

        spin_until(&reactor, 5.0, || !client_state.borrow().datagrams.is_empty());

        let server_seen = server_state.borrow();
        assert_eq!(server_seen.datagrams.len(), 1);
        assert_eq!(server_seen.datagrams[0].0, b"ping");
        let client_seen = client_state.borrow();
        assert_eq!(client_seen.datagrams[0].0, b"ping");

        assert_eq!(server_state.borrow().started, 1);
        server.stop_listening();
        assert_eq!(server_state.borrow().stopped, 1);
        client.stop_listening();
    }
}
