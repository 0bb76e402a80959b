//! Framed command protocol demo: a Sum server and a client on one
//! reactor.
//!
//! The server registers responders for `Sum` and `Divide`; the client
//! connects, issues both calls, prints the results and shuts the
//! reactor down.

use kairo::prelude::*;
use kairo::ErrorKind;

static SUM: Command = Command::new(
    "Sum",
    &[("a", ArgKind::Integer), ("b", ArgKind::Integer)],
    &[("total", ArgKind::Integer)],
);

static DIVIDE: Command = Command::new(
    "Divide",
    &[("numerator", ArgKind::Integer), ("denominator", ArgKind::Integer)],
    &[("result", ArgKind::Float)],
)
.with_errors(&[("ZERO_DIVISION", ErrorKind::RemoteError)]);

fn math_dispatcher() -> Rc<Dispatcher> {
    let mut dispatcher = Dispatcher::new();
    dispatcher.register(&SUM, |args| {
        let a = args.get_integer("a").unwrap_or(0);
        let b = args.get_integer("b").unwrap_or(0);
        println!("server: Sum({}, {})", a, b);
        CallbackReturn::ok(ArgList::new().with("total", ArgValue::Integer(a + b)))
    });
    dispatcher.register(&DIVIDE, |args| {
        let numerator = args.get_integer("numerator").unwrap_or(0);
        let denominator = args.get_integer("denominator").unwrap_or(0);
        println!("server: Divide({}, {})", numerator, denominator);
        if denominator == 0 {
            CallbackReturn::err(FailureValue::from_error(KairoError::RemoteError {
                code: "ZERO_DIVISION".to_string(),
                description: format!("{} / 0", numerator),
                fatal: false,
            }))
        } else {
            CallbackReturn::ok(ArgList::new().with(
                "result",
                ArgValue::Float(numerator as f64 / denominator as f64),
            ))
        }
    });
    Rc::new(dispatcher)
}

fn run_client(reactor: &Reactor, port: u16) {
    let creator = ClientCreator::new(reactor.clone());
    let connected = creator.connect_tcp(
        "127.0.0.1",
        port,
        TcpConnectOptions::new().timeout(10.0),
        || {
            let (proto, handle) = FramedProtocol::new(Rc::new(Dispatcher::new()));
            (Box::new(proto) as Box<dyn Protocol>, handle)
        },
    );

    let reactor2 = reactor.clone();
    connected.add_callbacks(
        move |value| {
            let handle = match downcast_value::<FramedHandle>(value) {
                Ok(handle) => *handle,
                Err(reason) => return CallbackReturn::err(reason),
            };
            let sum = handle.call_remote(
                &SUM,
                ArgList::new()
                    .with("a", ArgValue::Integer(13))
                    .with("b", ArgValue::Integer(81)),
            );
            sum.add_callback(|response| match downcast_value::<ArgList>(response) {
                Ok(args) => {
                    println!("client: Sum(13, 81) -> {:?}", args.get_integer("total"));
                    CallbackReturn::ok(())
                }
                Err(reason) => CallbackReturn::err(reason),
            });

            let divide = handle.call_remote(
                &DIVIDE,
                ArgList::new()
                    .with("numerator", ArgValue::Integer(1))
                    .with("denominator", ArgValue::Integer(0)),
            );
            let reactor3 = reactor2.clone();
            divide.add_callbacks(
                |response| match downcast_value::<ArgList>(response) {
                    Ok(args) => {
                        println!("client: Divide -> {:?}", args.get_float("result"));
                        CallbackReturn::ok(())
                    }
                    Err(reason) => CallbackReturn::err(reason),
                },
                move |reason| {
                    println!("client: Divide failed as expected: {}", reason.error_message());
                    let _ = reactor3.stop();
                    CallbackReturn::ok(())
                },
            );
            CallbackReturn::ok(handle)
        },
        |reason| {
            eprintln!("connection failed: {}", reason);
            CallbackReturn::ok(())
        },
    );
}

fn main() -> kairo::Result<()> {
    let reactor = Reactor::new()?;

    let dispatcher = math_dispatcher();
    let factory = ProtocolFactoryFn::new(move |addr| {
        println!("server: connection from {}", addr);
        let (proto, _handle) = FramedProtocol::new(Rc::clone(&dispatcher));
        Some(Box::new(proto) as Box<dyn Protocol>)
    });
    let port = reactor.listen_tcp("127.0.0.1:0".parse().expect("addr"), Rc::new(RefCell::new(factory)))?;
    println!("listening on {}", port.get_host());

    run_client(&reactor, port.port());
    reactor.run()
}
