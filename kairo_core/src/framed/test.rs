//! End-to-end exercise of the framed protocol over real sockets.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::defer::{CallbackReturn, downcast_value};
use crate::framed::{ArgKind, ArgList, ArgValue, Command, Dispatcher, FramedHandle, FramedProtocol};
use crate::protocol::{ClientCreator, Protocol, ProtocolFactoryFn, TcpConnectOptions};
use crate::reactor::Reactor;

static SUM: Command = Command::new(
    "Sum",
    &[("a", ArgKind::Integer), ("b", ArgKind::Integer)],
    &[("total", ArgKind::Integer)],
);

fn spin_until(reactor: &Reactor, secs: f64, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs_f64(secs);
    while !done() && Instant::now() < deadline {
        reactor.iterate(0.01).expect("iterate");
    }
}

#[test]
fn framed_call_round_trips_over_tcp() {
    let reactor = Reactor::new().unwrap();

    let dispatcher = {
        let mut d = Dispatcher::new();
        d.register(&SUM, |args| {
            let a = args.get_integer("a").unwrap_or(0);
            let b = args.get_integer("b").unwrap_or(0);
            CallbackReturn::ok(ArgList::new().with("total", ArgValue::Integer(a + b)))
        });
        Rc::new(d)
    };
    let server_factory = ProtocolFactoryFn::new(move |_| {
        let (proto, _handle) = FramedProtocol::new(Rc::clone(&dispatcher));
        Some(Box::new(proto) as Box<dyn Protocol>)
    });
    let port = reactor
        .listen_tcp("127.0.0.1:0".parse().unwrap(), Rc::new(RefCell::new(server_factory)))
        .unwrap();

    let creator = ClientCreator::new(reactor.clone());
    let connected = creator.connect_tcp(
        "127.0.0.1",
        port.port(),
        TcpConnectOptions::new().timeout(5.0),
        || {
            let (proto, handle) = FramedProtocol::new(Rc::new(Dispatcher::new()));
            (Box::new(proto) as Box<dyn Protocol>, handle)
        },
    );

    let total = Rc::new(RefCell::new(None::<i64>));
    let total2 = Rc::clone(&total);
    connected.add_callback(move |value| {
        let handle = match downcast_value::<FramedHandle>(value) {
            Ok(handle) => handle,
            Err(reason) => return CallbackReturn::err(reason),
        };
        handle
            .call_remote(
                &SUM,
                ArgList::new()
                    .with("a", ArgValue::Integer(13))
                    .with("b", ArgValue::Integer(81)),
            )
            .add_callback(move |response| {
                match downcast_value::<ArgList>(response) {
                    Ok(args) => {
                        *total2.borrow_mut() = args.get_integer("total");
                        CallbackReturn::ok(())
                    }
                    Err(reason) => CallbackReturn::err(reason),
                }
            });
        CallbackReturn::ok(*handle)
    });

    spin_until(&reactor, 5.0, || total.borrow().is_some());
    assert_eq!(*total.borrow(), Some(94));
    port.stop_listening();
}
