pub mod prelude;

pub use kairo_core::reactor::{
    DelayedCall, Reactor, ReactorState, ReactorWaker, TriggerHandle, TriggerPhase,
};

pub use kairo_core::defer::{
    CallbackReturn, Deferred, DeferredList, ListOutcome, Outcome, Value, downcast_value, execute,
    fail, gather_results, maybe_deferred, succeed,
};

pub use kairo_core::failure::{FailureValue, Frame};
pub use kairo_core::error::{ErrorKind, KairoError, Result};
pub use kairo_core::address::Address;

pub use kairo_core::protocol::{
    ClientCreator, ClientFactory, Connector, ConnectorState, DatagramProtocol, Factory, PortCount,
    Protocol, ProtocolFactoryFn, ReconnectingClientFactory, TcpConnectOptions,
};

pub use kairo_core::transport::{
    Consumer, ConnectionState, Producer, StringTransport, TcpPort, TcpTransport, TlsContext,
    Transport, UdpPort,
};

pub use kairo_core::policy::{
    IdleTimer, LimitConnectionsByPeer, ProtocolWrapper, SpewingPolicy, ThrottleOptions,
    ThrottlingPolicy, TimeoutPolicy, WrapperEvents, WrapperTransport, WrappingFactory,
};

pub use kairo_core::resolver::{
    HostResolver, Record, RecordResolver, RecordType, ResolveTriple, ThreadedHostResolver,
};

pub use kairo_core::framed::{
    ArgKind, ArgList, ArgValue, BoxParser, Command, CommandBox, Dispatcher, FramedHandle,
    FramedProtocol,
};

pub use kairo_core;
pub use kairo_lib;
