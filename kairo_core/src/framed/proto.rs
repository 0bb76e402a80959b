use std::cell::{Cell, RefCell};
use std::rc::Rc;

use fnv::FnvHashMap;

use super::boxes::{BoxParser, CommandBox};
use super::command::{ArgList, Command};
use crate::defer::{CallbackReturn, Deferred, downcast_value, fail, maybe_deferred};
use crate::error::{ErrorKind, KairoError, Result};
use crate::failure::FailureValue;
use crate::protocol::Protocol;
use crate::transport::Transport;
use crate::{debug_error, debug_log, debug_trace};

/// Reserved keys structuring call/response on the wire.
pub const COMMAND: &str = "_command";
pub const ASK: &str = "_ask";
pub const ANSWER: &str = "_answer";
pub const ERROR: &str = "_error";
pub const ERROR_CODE: &str = "_error_code";
pub const ERROR_DESCRIPTION: &str = "_error_description";

/// Code reported for errors the command's mapping doesn't know.
pub const UNKNOWN_ERROR_CODE: &str = "UNKNOWN";
/// Code reported when no responder is registered for a command.
pub const UNHANDLED_ERROR_CODE: &str = "UNHANDLED";

type PlainResponder = Rc<dyn Fn(ArgList) -> CallbackReturn>;
type SwitchResponder =
    Rc<dyn Fn(ArgList) -> std::result::Result<(ArgList, Box<dyn Protocol>), FailureValue>>;

enum ResponderEntry {
    Plain(PlainResponder),
    Switch(SwitchResponder),
}

/// Registration-time map from command descriptors to responders.
///
/// Build one, register every command the peer may ask for, and share it
/// (it is behind an `Rc`) across the factory's protocol instances.
#[derive(Default)]
pub struct Dispatcher {
    responders: FnvHashMap<&'static str, (&'static Command, ResponderEntry)>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    /// Register a responder. The closure gets the decoded arguments and
    /// returns the response arguments (or a failure, or a deferred that
    /// will produce either).
    pub fn register(
        &mut self,
        command: &'static Command,
        responder: impl Fn(ArgList) -> CallbackReturn + 'static,
    ) -> &mut Self {
        self.responders
            .insert(command.name, (command, ResponderEntry::Plain(Rc::new(responder))));
        self
    }

    /// Register a responder whose success both answers the call and
    /// switches the connection to a new protocol. Bytes past the switch
    /// point are handed to the new protocol unparsed.
    pub fn register_switch(
        &mut self,
        command: &'static Command,
        responder: impl Fn(ArgList) -> std::result::Result<(ArgList, Box<dyn Protocol>), FailureValue>
        + 'static,
    ) -> &mut Self {
        self.responders
            .insert(command.name, (command, ResponderEntry::Switch(Rc::new(responder))));
        self
    }

    fn lookup(&self, name: &str) -> Option<&(&'static Command, ResponderEntry)> {
        self.responders.get(name)
    }
}

struct PendingCall {
    command: &'static Command,
    deferred: Deferred,
    switch: Option<Box<dyn FnOnce() -> Box<dyn Protocol>>>,
}

struct FramedShared {
    transport: RefCell<Option<Rc<dyn Transport>>>,
    parser: RefCell<BoxParser>,
    dispatcher: Rc<Dispatcher>,
    outstanding: RefCell<FnvHashMap<String, PendingCall>>,
    counter: Cell<u64>,
    locked: Cell<bool>,
    inner: RefCell<Option<Box<dyn Protocol>>>,
    fail_all: RefCell<Option<FailureValue>>,
}

impl FramedShared {
    fn next_tag(&self) -> String {
        let n = self.counter.get() + 1;
        self.counter.set(n);
        format!("{:x}", n)
    }

    fn transport(&self) -> Option<Rc<dyn Transport>> {
        self.transport.borrow().clone()
    }

    fn send_raw(&self, cbox: &CommandBox) -> Result<()> {
        if cbox.is_empty() {
            return Err(KairoError::ProtocolViolation("refusing to send empty box".to_string()));
        }
        let wire = cbox.serialize()?;
        match self.transport() {
            Some(t) => {
                t.write(&wire);
                Ok(())
            }
            None => Err(KairoError::ConnectionLost("no transport attached".to_string())),
        }
    }

    // Terminal errback for response deferreds the application left
    // unhandled: log and drop the connection.
    fn puke(&self, reason: FailureValue) {
        debug_error!(
            "Framed command failure unhandled by application: {}; dropping connection",
            reason
        );
        reason.clean();
        if let Some(t) = self.transport() {
            t.lose_connection();
        }
    }

    fn switch_to(&self, mut new_protocol: Box<dyn Protocol>) {
        self.locked.set(true);
        if let Some(transport) = self.transport() {
            new_protocol.make_connection(transport);
        }
        *self.inner.borrow_mut() = Some(new_protocol);
        debug_log!("Connection switched protocols");
    }

    fn fail_all_outgoing(&self, reason: FailureValue) {
        *self.fail_all.borrow_mut() = Some(reason.clone());
        let pending: Vec<PendingCall> = {
            let mut outstanding = self.outstanding.borrow_mut();
            outstanding.drain().map(|(_, call)| call).collect()
        };
        for call in pending {
            call.deferred.errback(reason.clone());
        }
    }

    fn box_received(self: &Rc<Self>, cbox: CommandBox) {
        if cbox.contains(ANSWER) {
            self.answer_received(cbox);
        } else if cbox.contains(ERROR) {
            self.error_received(cbox);
        } else if cbox.contains(COMMAND) {
            self.command_received(cbox);
        } else {
            // boxes with none of the reserved keys are a framing error
            self.abort(KairoError::ProtocolViolation(
                "box carries no _command, _answer or _error".to_string(),
            ));
        }
    }

    fn abort(self: &Rc<Self>, error: KairoError) {
        debug_error!("Aborting framed connection: {}", error);
        self.fail_all_outgoing(FailureValue::from_error(error));
        if let Some(t) = self.transport() {
            t.abort_connection();
        }
    }

    fn answer_received(self: &Rc<Self>, cbox: CommandBox) {
        let Some(tag) = cbox.get_str(ANSWER).map(str::to_string) else {
            self.abort(KairoError::ProtocolViolation("unreadable _answer tag".to_string()));
            return;
        };
        let Some(call) = self.outstanding.borrow_mut().remove(&tag) else {
            debug_error!("Answer for unknown tag {:?}", tag);
            return;
        };
        if let Some(build) = call.switch {
            // the peer acknowledged the switch; change protocols before
            // anything else arrives
            self.switch_to(build());
        }
        match call.command.decode_response(&cbox) {
            Ok(args) => call.deferred.callback(args),
            Err(e) => call.deferred.errback(FailureValue::from_error(e)),
        }
        self.attach_puke(&call.deferred);
    }

    fn error_received(self: &Rc<Self>, cbox: CommandBox) {
        let Some(tag) = cbox.get_str(ERROR).map(str::to_string) else {
            self.abort(KairoError::ProtocolViolation("unreadable _error tag".to_string()));
            return;
        };
        let Some(call) = self.outstanding.borrow_mut().remove(&tag) else {
            debug_error!("Error for unknown tag {:?}", tag);
            return;
        };
        let code = cbox.get_str(ERROR_CODE).unwrap_or(UNKNOWN_ERROR_CODE).to_string();
        let description = cbox
            .get_str(ERROR_DESCRIPTION)
            .unwrap_or("Unknown Error")
            .to_string();
        // protocol-recognized codes first, then the per-command mapping
        let kind = if code == UNHANDLED_ERROR_CODE {
            ErrorKind::UnhandledResponder
        } else {
            call.command.kind_for_code(&code).unwrap_or(ErrorKind::RemoteError)
        };
        let fatal = call.command.is_fatal_code(&code);
        if call.switch.is_some() {
            // switch refused; the connection stays on framed traffic
            self.locked.set(false);
        }
        call.deferred.errback(FailureValue::new(
            kind,
            KairoError::RemoteError { code, description, fatal },
        ));
        self.attach_puke(&call.deferred);
    }

    // After firing a response deferred, catch whatever failure the
    // application's callbacks left behind.
    fn attach_puke(self: &Rc<Self>, deferred: &Deferred) {
        let me = Rc::clone(self);
        deferred.add_errback(move |reason| {
            me.puke(reason);
            CallbackReturn::ok(())
        });
    }

    fn command_received(self: &Rc<Self>, cbox: CommandBox) {
        let Some(name) = cbox.get_str(COMMAND).map(str::to_string) else {
            self.abort(KairoError::ProtocolViolation("unreadable _command".to_string()));
            return;
        };
        let ask = cbox.get_str(ASK).map(str::to_string);
        debug_trace!("Dispatching command {:?} (tag {:?})", name, ask);

        let entry = match self.dispatcher.lookup(&name) {
            Some((command, ResponderEntry::Plain(f))) => Ok((*command, Rc::clone(f))),
            Some((command, ResponderEntry::Switch(f))) => {
                self.run_switch_responder(*command, Rc::clone(f), &cbox, ask);
                return;
            }
            None => Err(()),
        };
        let Ok((command, responder)) = entry else {
            debug_log!("Unhandled command {:?}", name);
            if let Some(tag) = ask {
                let mut error_box = CommandBox::new();
                error_box.insert(ERROR, tag);
                error_box.insert(ERROR_CODE, UNHANDLED_ERROR_CODE);
                error_box.insert(ERROR_DESCRIPTION, format!("Unhandled Command: {:?}", name));
                if let Err(e) = self.send_raw(&error_box) {
                    debug_error!("Failed to report unhandled command: {}", e);
                }
            }
            return;
        };

        let d = maybe_deferred(|| match command.decode_request(&cbox) {
            Ok(args) => responder(args),
            Err(e) => CallbackReturn::err(FailureValue::from_error(e)),
        });

        let me = Rc::clone(self);
        let me2 = Rc::clone(self);
        let tag = ask.clone();
        let tag2 = ask;
        d.add_callbacks(
            move |value| {
                if let Some(tag) = tag {
                    me.send_answer(command, tag, value);
                }
                CallbackReturn::ok(())
            },
            move |reason| {
                match tag2 {
                    Some(tag) => me2.send_error(command, tag, reason),
                    None => {
                        debug_error!("Responder for un-asked command failed: {}", reason);
                        reason.clean();
                    }
                }
                CallbackReturn::ok(())
            },
        );
    }

    fn run_switch_responder(
        self: &Rc<Self>,
        command: &'static Command,
        responder: SwitchResponder,
        cbox: &CommandBox,
        ask: Option<String>,
    ) {
        let args = match command.decode_request(cbox) {
            Ok(args) => args,
            Err(e) => {
                if let Some(tag) = ask {
                    self.send_error(command, tag, FailureValue::from_error(e));
                }
                return;
            }
        };
        match responder(args) {
            Ok((response, new_protocol)) => {
                // answer first, in the old framing, then switch
                if let Some(tag) = ask {
                    match command.encode_response(&response) {
                        Ok(mut answer_box) => {
                            answer_box.insert(ANSWER, tag);
                            if let Err(e) = self.send_raw(&answer_box) {
                                debug_error!("Failed to send switch answer: {}", e);
                                return;
                            }
                        }
                        Err(e) => {
                            self.send_error(command, tag, FailureValue::from_error(e));
                            return;
                        }
                    }
                }
                self.switch_to(new_protocol);
            }
            Err(reason) => {
                if let Some(tag) = ask {
                    self.send_error(command, tag, reason);
                } else {
                    reason.clean();
                }
            }
        }
    }

    fn send_answer(self: &Rc<Self>, command: &'static Command, tag: String, value: crate::defer::Value) {
        let args = match downcast_value::<ArgList>(value) {
            Ok(args) => *args,
            Err(_) => {
                debug_error!("Responder for {} returned a non-ArgList value", command.name);
                self.send_error(
                    command,
                    tag,
                    FailureValue::from_error(KairoError::Other(
                        "responder produced an unserializable response".to_string(),
                    )),
                );
                return;
            }
        };
        match command.encode_response(&args) {
            Ok(mut answer_box) => {
                answer_box.insert(ANSWER, tag);
                if let Err(e) = self.send_raw(&answer_box) {
                    debug_error!("Failed to send answer: {}", e);
                }
            }
            Err(e) => {
                self.send_error(command, tag, FailureValue::from_error(e));
            }
        }
    }

    fn send_error(self: &Rc<Self>, command: &'static Command, tag: String, reason: FailureValue) {
        let mut error_box = CommandBox::new();
        error_box.insert(ERROR, tag);
        let known = command.code_for_kind(reason.kind());
        let fatal;
        match known {
            Some(code) => {
                error_box.insert(ERROR_CODE, code);
                error_box.insert(ERROR_DESCRIPTION, reason.error_message());
                fatal = command.is_fatal_code(code);
            }
            None => {
                // server-side logging happens here for unmapped errors
                debug_error!("Unmapped responder error for {}: {}", command.name, reason);
                error_box.insert(ERROR_CODE, UNKNOWN_ERROR_CODE);
                error_box.insert(ERROR_DESCRIPTION, "Unknown Error");
                fatal = true;
            }
        }
        reason.clean();
        if let Err(e) = self.send_raw(&error_box) {
            debug_error!("Failed to send error box: {}", e);
            return;
        }
        if fatal {
            if let Some(t) = self.transport() {
                t.lose_connection();
            }
        }
    }

    fn call_remote_inner(
        self: &Rc<Self>,
        command: &'static Command,
        args: &ArgList,
        switch: Option<Box<dyn FnOnce() -> Box<dyn Protocol>>>,
    ) -> Deferred {
        if self.locked.get() {
            return fail(FailureValue::from_error(KairoError::ProtocolSwitched));
        }
        if let Some(reason) = self.fail_all.borrow().as_ref() {
            return fail(reason.clone());
        }
        let mut request = match command.encode_request(args) {
            Ok(request) => request,
            Err(e) => return fail(FailureValue::from_error(e)),
        };
        request.insert(COMMAND, command.name);

        let d = Deferred::new();
        if command.requires_answer {
            let tag = self.next_tag();
            request.insert(ASK, tag.clone());
            self.outstanding.borrow_mut().insert(
                tag.clone(),
                PendingCall { command, deferred: d.clone(), switch },
            );
            if let Err(e) = self.send_raw(&request) {
                self.outstanding.borrow_mut().remove(&tag);
                return fail(FailureValue::from_error(e));
            }
        } else {
            if let Err(e) = self.send_raw(&request) {
                return fail(FailureValue::from_error(e));
            }
            d.callback(ArgList::new());
        }
        d
    }
}

/// The framed request/response protocol.
///
/// Create with [`FramedProtocol::new`], which also yields the
/// [`FramedHandle`] used to issue calls; hand the protocol itself to a
/// factory/transport.
pub struct FramedProtocol {
    shared: Rc<FramedShared>,
}

impl FramedProtocol {
    pub fn new(dispatcher: Rc<Dispatcher>) -> (FramedProtocol, FramedHandle) {
        let shared = Rc::new(FramedShared {
            transport: RefCell::new(None),
            parser: RefCell::new(BoxParser::new()),
            dispatcher,
            outstanding: RefCell::new(FnvHashMap::default()),
            counter: Cell::new(0),
            locked: Cell::new(false),
            inner: RefCell::new(None),
            fail_all: RefCell::new(None),
        });
        (
            FramedProtocol { shared: Rc::clone(&shared) },
            FramedHandle { shared },
        )
    }
}

impl Protocol for FramedProtocol {
    fn connection_made(&mut self, transport: Rc<dyn Transport>) {
        *self.shared.transport.borrow_mut() = Some(transport);
    }

    fn data_received(&mut self, data: &[u8]) {
        if self.shared.inner.borrow().is_some() {
            if let Some(inner) = self.shared.inner.borrow_mut().as_mut() {
                inner.data_received(data);
            }
            return;
        }
        self.shared.parser.borrow_mut().feed(data);
        loop {
            let next = self.shared.parser.borrow_mut().next_box();
            match next {
                Ok(Some(cbox)) => {
                    self.shared.box_received(cbox);
                    if self.shared.inner.borrow().is_some() {
                        // switched mid-stream: the unparsed remainder
                        // belongs to the new protocol
                        let leftover = self.shared.parser.borrow_mut().take_leftover();
                        if !leftover.is_empty() {
                            if let Some(inner) = self.shared.inner.borrow_mut().as_mut() {
                                inner.data_received(&leftover);
                            }
                        }
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.shared.abort(e);
                    return;
                }
            }
        }
    }

    fn connection_lost(&mut self, reason: FailureValue) {
        self.shared.fail_all_outgoing(reason.clone());
        let inner = self.shared.inner.borrow_mut().take();
        if let Some(mut inner) = inner {
            inner.connection_lost(reason);
        }
    }
}

/// Application-side handle to a framed connection.
#[derive(Clone)]
pub struct FramedHandle {
    shared: Rc<FramedShared>,
}

impl FramedHandle {
    /// Issue a command. The deferred fires with the decoded response
    /// [`ArgList`], or errbacks with the transported failure.
    pub fn call_remote(&self, command: &'static Command, args: ArgList) -> Deferred {
        self.shared.call_remote_inner(command, &args, None)
    }

    /// Issue a command and switch this connection to a new protocol
    /// when the peer acknowledges. The deferred fires with the response
    /// after the switch; on error the connection stays framed.
    pub fn call_remote_switch(
        &self,
        command: &'static Command,
        args: ArgList,
        build: impl FnOnce() -> Box<dyn Protocol> + 'static,
    ) -> Deferred {
        let d = self.shared.call_remote_inner(command, &args, Some(Box::new(build)));
        // no more framed traffic may be initiated while the switch is
        // in flight; a call that already failed locally locks nothing
        if d.failure_result().is_none() {
            self.shared.locked.set(true);
        }
        d
    }

    /// Whether the connection refuses framed traffic (switch completed
    /// or in flight).
    pub fn locked(&self) -> bool {
        self.shared.locked.get()
    }

    pub fn transport(&self) -> Option<Rc<dyn Transport>> {
        self.shared.transport()
    }

    pub fn lose_connection(&self) {
        if let Some(t) = self.shared.transport() {
            t.lose_connection();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framed::command::{ArgKind, ArgValue};
    use crate::transport::testing::StringTransport;

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

    static TO_RAW: Command = Command::new("ToRaw", &[], &[]);

    fn sum_dispatcher() -> Rc<Dispatcher> {
        let mut d = Dispatcher::new();
        d.register(&SUM, |args| {
            let a = args.get_integer("a").unwrap_or(0);
            let b = args.get_integer("b").unwrap_or(0);
            CallbackReturn::ok(ArgList::new().with("total", ArgValue::Integer(a + b)))
        });
        d.register(&DIVIDE, |args| {
            let n = args.get_integer("numerator").unwrap_or(0);
            let d = args.get_integer("denominator").unwrap_or(0);
            if d == 0 {
                CallbackReturn::err(FailureValue::from_error(KairoError::RemoteError {
                    code: "ZERO_DIVISION".to_string(),
                    description: "division by zero".to_string(),
                    fatal: false,
                }))
            } else {
                CallbackReturn::ok(
                    ArgList::new().with("result", ArgValue::Float(n as f64 / d as f64)),
                )
            }
        });
        Rc::new(d)
    }

    fn connected(dispatcher: Rc<Dispatcher>) -> (FramedProtocol, FramedHandle, Rc<StringTransport>) {
        let (mut proto, handle) = FramedProtocol::new(dispatcher);
        let st = StringTransport::new();
        proto.make_connection(Rc::clone(&st) as Rc<dyn Transport>);
        (proto, handle, st)
    }

    fn parse_written(st: &StringTransport) -> Vec<CommandBox> {
        let mut parser = BoxParser::new();
        parser.feed(&st.value());
        let mut boxes = Vec::new();
        while let Some(b) = parser.next_box().expect("well-formed output") {
            boxes.push(b);
        }
        boxes
    }

    #[test]
    fn responder_answers_with_the_same_tag() {
        let (mut server, _handle, st) = connected(sum_dispatcher());
        let mut request = CommandBox::new();
        request.insert(COMMAND, "Sum");
        request.insert(ASK, "2a");
        request.insert("a", "13");
        request.insert("b", "81");
        server.data_received(&request.serialize().unwrap());

        let boxes = parse_written(&st);
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].get_str(ANSWER), Some("2a"));
        assert_eq!(boxes[0].get_str("total"), Some("94"));
    }

    // The failure a call's errback chain observed, recorded before the
    // protocol's terminal errback can consume it.
    fn observe_failure(d: &Deferred) -> Rc<RefCell<Option<FailureValue>>> {
        let slot = Rc::new(RefCell::new(None));
        let slot2 = Rc::clone(&slot);
        d.add_errback(move |reason| {
            *slot2.borrow_mut() = Some(reason.clone());
            CallbackReturn::ok(())
        });
        slot
    }

    #[test]
    fn call_remote_fires_with_decoded_response() {
        let (mut proto, handle, st) = connected(sum_dispatcher());
        let d = handle.call_remote(
            &SUM,
            ArgList::new()
                .with("a", ArgValue::Integer(13))
                .with("b", ArgValue::Integer(81)),
        );
        // the request is on the wire with a tag
        let sent = parse_written(&st);
        assert_eq!(sent[0].get_str(COMMAND), Some("Sum"));
        let tag = sent[0].get_str(ASK).expect("tagged").to_string();
        assert!(!d.called());

        // loop the answer back as if from the peer
        let mut answer = CommandBox::new();
        answer.insert(ANSWER, tag);
        answer.insert("total", "94");
        proto.data_received(&answer.serialize().unwrap());

        let args = d.extract::<ArgList>().expect("fired");
        assert_eq!(args.get_integer("total"), Some(94));
    }

    #[test]
    fn known_error_codes_map_to_typed_failures() {
        let (mut proto, handle, st) = connected(sum_dispatcher());
        let d = handle.call_remote(
            &DIVIDE,
            ArgList::new()
                .with("numerator", ArgValue::Integer(1))
                .with("denominator", ArgValue::Integer(0)),
        );
        let seen = observe_failure(&d);
        let sent = parse_written(&st);
        let tag = sent[0].get_str(ASK).unwrap().to_string();

        let mut error_box = CommandBox::new();
        error_box.insert(ERROR, tag);
        error_box.insert(ERROR_CODE, "ZERO_DIVISION");
        error_box.insert(ERROR_DESCRIPTION, "division by zero");
        proto.data_received(&error_box.serialize().unwrap());

        let reason = seen.borrow().clone().expect("errbacked");
        assert_eq!(reason.kind(), ErrorKind::RemoteError);
        assert!(reason.error_message().contains("division by zero"));
    }

    #[test]
    fn unknown_error_codes_become_generic_remote_errors() {
        let (mut proto, handle, st) = connected(sum_dispatcher());
        let d = handle.call_remote(
            &SUM,
            ArgList::new()
                .with("a", ArgValue::Integer(1))
                .with("b", ArgValue::Integer(2)),
        );
        let seen = observe_failure(&d);
        let tag = parse_written(&st)[0].get_str(ASK).unwrap().to_string();

        let mut error_box = CommandBox::new();
        error_box.insert(ERROR, tag);
        error_box.insert(ERROR_CODE, "SOMETHING_ELSE");
        error_box.insert(ERROR_DESCRIPTION, "what");
        proto.data_received(&error_box.serialize().unwrap());

        let reason = seen.borrow().clone().expect("errbacked");
        assert_eq!(reason.kind(), ErrorKind::RemoteError);
    }

    #[test]
    fn unhandled_commands_report_the_unhandled_code() {
        let (mut server, _handle, st) = connected(Rc::new(Dispatcher::new()));
        let mut request = CommandBox::new();
        request.insert(COMMAND, "Nope");
        request.insert(ASK, "1");
        server.data_received(&request.serialize().unwrap());

        let boxes = parse_written(&st);
        assert_eq!(boxes[0].get_str(ERROR), Some("1"));
        assert_eq!(boxes[0].get_str(ERROR_CODE), Some(UNHANDLED_ERROR_CODE));
    }

    #[test]
    fn unhandled_code_maps_to_unhandled_kind_for_the_caller() {
        let (mut proto, handle, st) = connected(sum_dispatcher());
        let d = handle.call_remote(
            &SUM,
            ArgList::new()
                .with("a", ArgValue::Integer(1))
                .with("b", ArgValue::Integer(2)),
        );
        let seen = observe_failure(&d);
        let tag = parse_written(&st)[0].get_str(ASK).unwrap().to_string();

        let mut error_box = CommandBox::new();
        error_box.insert(ERROR, tag);
        error_box.insert(ERROR_CODE, UNHANDLED_ERROR_CODE);
        error_box.insert(ERROR_DESCRIPTION, "Unhandled Command: 'Sum'");
        proto.data_received(&error_box.serialize().unwrap());

        let reason = seen.borrow().clone().expect("errbacked");
        assert_eq!(reason.kind(), ErrorKind::UnhandledResponder);
        assert!(reason.check(&[ErrorKind::RemoteError]).is_some());
    }

    #[test]
    fn unmapped_responder_errors_send_unknown_and_drop() {
        static BOOM: Command = Command::new("Boom", &[], &[]);
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(&BOOM, |_args| {
            CallbackReturn::err(FailureValue::from_error(KairoError::Timeout))
        });
        let (mut server, _handle, st) = connected(Rc::new(dispatcher));

        let mut request = CommandBox::new();
        request.insert(COMMAND, "Boom");
        request.insert(ASK, "9");
        server.data_received(&request.serialize().unwrap());

        let boxes = parse_written(&st);
        assert_eq!(boxes[0].get_str(ERROR_CODE), Some(UNKNOWN_ERROR_CODE));
        assert!(st.disconnecting());
    }

    #[test]
    fn deferred_responders_answer_when_they_fire() {
        static SLOW: Command =
            Command::new("Slow", &[], &[("ok", ArgKind::Boolean)]);
        let gate = Deferred::new();
        let gate2 = gate.clone();
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(&SLOW, move |_args| CallbackReturn::Deferred(gate2.clone()));
        let (mut server, _handle, st) = connected(Rc::new(dispatcher));

        let mut request = CommandBox::new();
        request.insert(COMMAND, "Slow");
        request.insert(ASK, "5");
        server.data_received(&request.serialize().unwrap());
        assert!(parse_written(&st).is_empty());

        gate.callback(ArgList::new().with("ok", ArgValue::Boolean(true)));
        let boxes = parse_written(&st);
        assert_eq!(boxes[0].get_str(ANSWER), Some("5"));
        assert_eq!(boxes[0].get_str("ok"), Some("True"));
    }

    #[test]
    fn malformed_wire_data_aborts() {
        let (mut proto, handle, st) = connected(sum_dispatcher());
        let d = handle.call_remote(
            &SUM,
            ArgList::new()
                .with("a", ArgValue::Integer(1))
                .with("b", ArgValue::Integer(2)),
        );
        st.clear();
        // an empty box is illegal on the wire
        proto.data_received(&[0, 0]);
        assert!(st.disconnecting());
        let reason = d.failure_result().expect("failed all outgoing");
        assert_eq!(reason.kind(), ErrorKind::ProtocolViolation);
        d.add_errback(|_| CallbackReturn::ok(()));
    }

    // Inner protocol used by the switch tests.
    struct RawEcho {
        seen: Rc<RefCell<Vec<u8>>>,
        transport: Option<Rc<dyn Transport>>,
    }

    impl Protocol for RawEcho {
        fn connection_made(&mut self, transport: Rc<dyn Transport>) {
            self.transport = Some(transport);
        }

        fn data_received(&mut self, data: &[u8]) {
            self.seen.borrow_mut().extend_from_slice(data);
            if let Some(t) = self.transport.as_ref() {
                t.write(data);
            }
        }
    }

    #[test]
    fn switch_responder_hands_trailing_bytes_to_the_new_protocol() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_switch(&TO_RAW, move |_args| {
            Ok((
                ArgList::new(),
                Box::new(RawEcho { seen: Rc::clone(&seen2), transport: None }) as Box<dyn Protocol>,
            ))
        });
        let (mut server, handle, st) = connected(Rc::new(dispatcher));

        let mut request = CommandBox::new();
        request.insert(COMMAND, "ToRaw");
        request.insert(ASK, "7");
        let mut wire = request.serialize().unwrap().to_vec();
        wire.extend_from_slice(b"RAW BYTES AFTER SWITCH");
        server.data_received(&wire);

        // the trailing bytes reached the new protocol exactly once
        assert_eq!(&*seen.borrow(), b"RAW BYTES AFTER SWITCH");
        // the answer box went out first, then the echoed raw bytes
        let out = st.value();
        assert!(out.ends_with(b"RAW BYTES AFTER SWITCH"));
        let answer_len = out.len() - b"RAW BYTES AFTER SWITCH".len();
        let mut parser = BoxParser::new();
        parser.feed(&out[..answer_len]);
        let answer = parser.next_box().unwrap().expect("answer box first");
        assert_eq!(answer.get_str(ANSWER), Some("7"));
        assert!(handle.locked());

        // further framed traffic is refused
        let d = handle.call_remote(
            &SUM,
            ArgList::new()
                .with("a", ArgValue::Integer(1))
                .with("b", ArgValue::Integer(2)),
        );
        assert_eq!(
            d.failure_result().expect("refused").kind(),
            ErrorKind::ProtocolSwitched
        );
        d.add_errback(|_| CallbackReturn::ok(()));

        // later chunks flow straight through
        server.data_received(b"!");
        assert!(seen.borrow().ends_with(b"!"));
    }

    #[test]
    fn client_switch_happens_on_acknowledgement() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);
        let (mut proto, handle, st) = connected(sum_dispatcher());
        let d = handle.call_remote_switch(&TO_RAW, ArgList::new(), move || {
            Box::new(RawEcho { seen: Rc::clone(&seen2), transport: None }) as Box<dyn Protocol>
        });
        assert!(handle.locked());
        let tag = parse_written(&st)[0].get_str(ASK).unwrap().to_string();

        let mut answer = CommandBox::new();
        answer.insert(ANSWER, tag);
        let mut wire = answer.serialize().unwrap().to_vec();
        wire.extend_from_slice(b"post-switch payload");
        proto.data_received(&wire);

        assert!(d.called());
        assert_eq!(&*seen.borrow(), b"post-switch payload");
    }

    #[test]
    fn client_switch_unlocks_on_error() {
        let (mut proto, handle, st) = connected(sum_dispatcher());
        let d = handle.call_remote_switch(&TO_RAW, ArgList::new(), || {
            Box::new(RawEcho { seen: Rc::new(RefCell::new(Vec::new())), transport: None })
                as Box<dyn Protocol>
        });
        let seen = observe_failure(&d);
        let tag = parse_written(&st)[0].get_str(ASK).unwrap().to_string();

        let mut error_box = CommandBox::new();
        error_box.insert(ERROR, tag);
        error_box.insert(ERROR_CODE, "NOPE");
        error_box.insert(ERROR_DESCRIPTION, "no switching");
        proto.data_received(&error_box.serialize().unwrap());

        assert!(seen.borrow().is_some());
        assert!(!handle.locked());
    }

    #[test]
    fn connection_loss_fails_all_outstanding_calls() {
        let (mut server, handle, _st) = connected(sum_dispatcher());
        let d1 = handle.call_remote(
            &SUM,
            ArgList::new()
                .with("a", ArgValue::Integer(1))
                .with("b", ArgValue::Integer(2)),
        );
        let d2 = handle.call_remote(
            &SUM,
            ArgList::new()
                .with("a", ArgValue::Integer(3))
                .with("b", ArgValue::Integer(4)),
        );
        server.connection_lost(FailureValue::from_error(KairoError::ConnectionLost(
            "reset".to_string(),
        )));
        for d in [&d1, &d2] {
            assert_eq!(
                d.failure_result().expect("failed").kind(),
                ErrorKind::ConnectionLost
            );
            d.add_errback(|_| CallbackReturn::ok(()));
        }
        // new calls fail immediately with the same reason
        let d3 = handle.call_remote(
            &SUM,
            ArgList::new()
                .with("a", ArgValue::Integer(1))
                .with("b", ArgValue::Integer(1)),
        );
        assert_eq!(
            d3.failure_result().expect("failed").kind(),
            ErrorKind::ConnectionLost
        );
        d3.add_errback(|_| CallbackReturn::ok(()));
    }

    #[test]
    fn tags_are_unique_per_connection() {
        let (_server, handle, st) = connected(sum_dispatcher());
        for _ in 0..3 {
            handle
                .call_remote(
                    &SUM,
                    ArgList::new()
                        .with("a", ArgValue::Integer(0))
                        .with("b", ArgValue::Integer(0)),
                )
                .add_errback(|_| CallbackReturn::ok(()));
        }
        let sent = parse_written(&st);
        let tags: std::collections::HashSet<String> = sent
            .iter()
            .map(|b| b.get_str(ASK).unwrap().to_string())
            .collect();
        assert_eq!(tags.len(), 3);
    }
}
