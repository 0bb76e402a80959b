pub use once_cell::sync::Lazy;

pub use crate::{Reactor, ReactorState, TriggerPhase};
pub use crate::{CallbackReturn, Deferred, DeferredList, downcast_value, fail, gather_results, maybe_deferred, succeed};
pub use crate::{ErrorKind, FailureValue, KairoError};
pub use crate::{Address, ConnectionState, Consumer, Producer, Transport};
pub use crate::{ClientCreator, ClientFactory, Factory, PortCount, Protocol, ProtocolFactoryFn, TcpConnectOptions};
pub use crate::{ArgKind, ArgList, ArgValue, Command, Dispatcher, FramedHandle, FramedProtocol};

// Framework code is reactor-thread code
pub use std::cell::RefCell;
pub use std::rc::Rc;
pub use std::time::Duration;
