//! Byte-stream transports and the producer/consumer flow-control
//! contract.
//!
//! A transport is the reactor-owned end of a connection: protocols write
//! through it and the reactor feeds it readiness events. The traits here
//! are the seam between the two; `tcp`, `udp` and `tls` hold the
//! concrete implementations.

pub mod tcp;
pub mod testing;
pub mod tls;
pub mod udp;

pub use tcp::{TcpPort, TcpTransport};
pub use testing::StringTransport;
pub use tls::{TlsContext, load_certs_pem, load_private_key_pem};
pub use udp::UdpPort;

use std::any::Any;
use std::rc::Rc;

use crate::address::Address;
use crate::error::Result;

/// Connection lifecycle of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// A data sink that supports producer registration.
///
/// Transports are consumers; so are protocol wrappers that interpose on
/// a transport. A *streaming* (push) producer is expected to keep
/// producing until paused; a non-streaming (pull) producer is asked for
/// exactly one chunk via `resume_producing` each time the consumer
/// drains.
pub trait Consumer {
    /// Attach `producer`. Registering while another producer is attached
    /// reports a `UserError`.
    fn register_producer(&self, producer: Rc<dyn Producer>, streaming: bool) -> Result<()>;

    fn unregister_producer(&self);

    fn write(&self, data: &[u8]);
}

/// A source of data that can be throttled by its consumer.
pub trait Producer {
    /// Produce more data: continuously for a push producer, exactly one
    /// chunk for a pull producer.
    fn resume_producing(&self);

    /// Stop producing until resumed. Only delivered to push producers.
    fn pause_producing(&self) {}

    /// Production is over; release any resources.
    fn stop_producing(&self);
}

/// The byte-stream endpoint owned by the reactor.
pub trait Transport: Consumer {
    /// Write several chunks; equivalent to writing their concatenation.
    fn write_sequence(&self, data: &[&[u8]]) {
        for chunk in data {
            self.write(chunk);
        }
    }

    /// Flush buffered data, then close. The protocol sees
    /// `connection_lost` with a connection-done reason once the close
    /// completes.
    fn lose_connection(&self);

    /// Close immediately without flushing; the reason reports a local
    /// abort.
    fn abort_connection(&self) {
        self.lose_connection();
    }

    fn get_peer(&self) -> Address;

    fn get_host(&self) -> Address;

    fn state(&self) -> ConnectionState;

    /// Temporarily stop delivering `data_received`. Used by throttling
    /// policies; pairs with [`start_reading`](Transport::start_reading).
    fn stop_reading(&self) {}

    /// Resume delivery after [`stop_reading`](Transport::stop_reading).
    fn start_reading(&self) {}

    /// Downcast support for transport-specific extensions (TCP socket
    /// options, TLS upgrade).
    fn as_any(&self) -> &dyn Any;
}
