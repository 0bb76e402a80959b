//! Protocols and the factories that build them.
//!
//! A [`Protocol`] is the user-visible state machine for one connection,
//! driven by `data_received` and bounded by exactly one
//! `connection_made` / `connection_lost` pair. A [`Factory`] mints a
//! protocol per accepted or initiated connection; client factories also
//! hear about the fate of their connection attempts.

mod connector;
mod factory;

pub use connector::{Connector, ConnectorState, TcpConnectOptions};
pub use factory::{
    ClientCreator, ClientFactory, Factory, PortCount, ProtocolFactoryFn,
    ReconnectingClientFactory,
};

use std::net::SocketAddr;
use std::rc::Rc;

use crate::failure::FailureValue;
use crate::transport::Transport;
use crate::transport::udp::UdpPort;

/// The stream-protocol contract.
///
/// Lifecycle per instance: built by a factory, then exactly one
/// [`make_connection`](Protocol::make_connection), any number of
/// [`data_received`](Protocol::data_received) calls, then exactly one
/// [`connection_lost`](Protocol::connection_lost).
pub trait Protocol {
    /// Bind this protocol to its transport. The default just forwards to
    /// [`connection_made`](Protocol::connection_made); override only when
    /// the binding itself needs interception.
    fn make_connection(&mut self, transport: Rc<dyn Transport>) {
        self.connection_made(transport);
    }

    /// The connection is up. Keep the transport handle here and send any
    /// greeting.
    fn connection_made(&mut self, _transport: Rc<dyn Transport>) {}

    /// Bytes arrived. Chunk boundaries are arbitrary; buffer partial
    /// messages yourself.
    fn data_received(&mut self, data: &[u8]);

    /// The connection is gone; the reason's kind distinguishes a clean
    /// close from a reset or a local abort.
    fn connection_lost(&mut self, _reason: FailureValue) {}
}

/// Datagram (UDP) protocol contract.
///
/// `start_protocol`/`stop_protocol` bracket the transport lifetime the
/// way `connection_made`/`connection_lost` do for streams.
pub trait DatagramProtocol {
    fn start_protocol(&mut self, _port: Rc<UdpPort>) {}

    fn stop_protocol(&mut self) {}

    fn datagram_received(&mut self, data: &[u8], from: SocketAddr);

    /// Delivered on a connected socket when an ICMP message reports that
    /// a previous write was refused.
    fn connection_refused(&mut self) {}
}

/// Contract for protocols attached to a child process.
///
/// Kairo specifies the contract only; spawning is a platform reactor
/// concern and no implementation ships here.
pub trait ProcessProtocol {
    fn out_received(&mut self, _data: &[u8]) {}
    fn err_received(&mut self, _data: &[u8]) {}
    fn in_connection_lost(&mut self) {}
    fn out_connection_lost(&mut self) {}
    fn err_connection_lost(&mut self) {}
    fn process_ended(&mut self, _reason: FailureValue) {}
}

/// The transport side of the process contract: per-stream close plus
/// signal delivery.
pub trait ProcessTransport {
    fn write_to_child(&self, data: &[u8]);
    fn close_stdin(&self);
    fn close_stdout(&self);
    fn close_stderr(&self);
    fn signal_process(&self, signal: i32) -> crate::error::Result<()>;
}
