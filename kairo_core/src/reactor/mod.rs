//! The single-threaded event loop at the center of the framework.
//!
//! A [`Reactor`] multiplexes socket readiness, timers, cross-thread
//! wakeups and lifecycle events onto one thread. Every protocol
//! callback, timer callback and system-event trigger runs here, one at
//! a time; worker threads exist only for explicitly offloaded work and
//! rejoin the loop through [`ReactorWaker`].
//!
//! There is no implicit global instance. Construct a reactor with
//! [`Reactor::new`] and pass the handle to whatever needs scheduling;
//! handles are cheap `Rc` clones and are not `Send`. At most one
//! reactor may be *running* in a process at a time.

mod events;
mod threads;
mod timer;

pub use events::{TriggerHandle, TriggerPhase};
pub use threads::ReactorWaker;
pub use timer::DelayedCall;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token, Waker};

use crate::alias::PMutex;

use crate::defer::Deferred;
use crate::error::{KairoError, Result};
use crate::failure::FailureValue;
use crate::resolver::{HostResolver, ThreadedHostResolver};
use crate::{debug_error, debug_log, debug_trace};

use threads::{ThreadMessage, ThreadPool, ThreadShared};
use timer::TimerQueue;

const WAKER_TOKEN: Token = Token(0);
const EVENT_CAPACITY: usize = 1024;

/// System event names the reactor itself fires.
pub const EVENT_STARTUP: &str = "startup";
pub const EVENT_SHUTDOWN: &str = "shutdown";

// Only one reactor may be inside run() per process.
static RUNNING_GUARD: PMutex<()> = PMutex::new(());

/// Lifecycle states of a reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorState {
    NotStarted,
    Running,
    Stopping,
    Crashed,
    Stopped,
}

/// A descriptor the reactor can watch for readiness.
///
/// Implementations own their socket behind interior mutability; the
/// reactor calls `do_read`/`do_write` when the descriptor is ready.
/// Returning an `Err` reason removes the descriptor and reports the
/// disconnect through `connection_lost`.
pub trait IoHandler {
    /// Stable small-integer identity (the raw fd on unix).
    fn fileno(&self) -> i32;

    fn register(&self, registry: &mio::Registry, token: Token, interest: Interest) -> io::Result<()>;
    fn reregister(&self, registry: &mio::Registry, token: Token, interest: Interest) -> io::Result<()>;
    fn deregister(&self, registry: &mio::Registry) -> io::Result<()>;

    fn do_read(&self) -> std::result::Result<(), FailureValue> {
        Ok(())
    }

    fn do_write(&self) -> std::result::Result<(), FailureValue> {
        Ok(())
    }

    /// The descriptor has been removed with the given reason.
    fn connection_lost(&self, _reason: FailureValue) {}
}

struct HandlerEntry {
    handler: Rc<dyn IoHandler>,
    token: Token,
    read: bool,
    write: bool,
}

impl HandlerEntry {
    fn interest(&self) -> Interest {
        match (self.read, self.write) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (false, true) => Interest::WRITABLE,
            // Registration always has at least one side; a fully
            // disinterested entry is removed instead.
            _ => Interest::READABLE,
        }
    }
}

struct ReactorInner {
    state: Cell<ReactorState>,
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    timers: RefCell<TimerQueue>,
    handlers: RefCell<HashMap<i32, HandlerEntry>>,
    tokens: RefCell<HashMap<Token, i32>>,
    next_token: Cell<usize>,
    triggers: RefCell<events::TriggerTable>,
    shared: Arc<ThreadShared>,
    pool: RefCell<ThreadPool>,
    pending_thread: RefCell<HashMap<u64, Deferred>>,
    next_thread_id: Cell<u64>,
    resolver: RefCell<Option<Rc<dyn HostResolver>>>,
    in_iteration: Cell<bool>,
}

/// Handle to the event loop. Clones share the loop.
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<ReactorInner>,
}

impl Reactor {
    pub fn new() -> Result<Reactor> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(Reactor {
            inner: Rc::new(ReactorInner {
                state: Cell::new(ReactorState::NotStarted),
                poll: RefCell::new(poll),
                events: RefCell::new(Events::with_capacity(EVENT_CAPACITY)),
                timers: RefCell::new(TimerQueue::new()),
                handlers: RefCell::new(HashMap::new()),
                tokens: RefCell::new(HashMap::new()),
                next_token: Cell::new(1),
                triggers: RefCell::new(events::TriggerTable::new()),
                shared: Arc::new(ThreadShared::new(waker)),
                pool: RefCell::new(ThreadPool::new()),
                pending_thread: RefCell::new(HashMap::new()),
                next_thread_id: Cell::new(0),
                resolver: RefCell::new(None),
                in_iteration: Cell::new(false),
            }),
        })
    }

    pub fn state(&self) -> ReactorState {
        self.inner.state.get()
    }

    // ============================================================
    // Lifecycle
    // ============================================================

    /// Fire the startup event, run the loop, and return once `stop()`
    /// has been called and the shutdown event has completed.
    pub fn run(&self) -> Result<()> {
        if self.inner.state.get() != ReactorState::NotStarted {
            return Err(KairoError::ReactorNotRestartable);
        }
        let Some(_running) = RUNNING_GUARD.try_lock() else {
            return Err(KairoError::NestedReactorCall);
        };
        self.inner.state.set(ReactorState::Running);
        debug_log!("Reactor starting");
        self.fire_system_event(EVENT_STARTUP);

        let result = loop {
            match self.inner.state.get() {
                ReactorState::Stopped | ReactorState::Crashed => break Ok(()),
                _ => {}
            }
            if let Err(e) = self.one_iteration(None) {
                break Err(e);
            }
        };

        debug_log!("Reactor finished: {:?}", self.inner.state.get());
        result
    }

    /// Request a clean shutdown: fire `before/shutdown` (waiting on any
    /// returned deferreds), then `during` and `after`, then let `run`
    /// return.
    pub fn stop(&self) -> Result<()> {
        match self.inner.state.get() {
            ReactorState::Running => {}
            _ => return Err(KairoError::ReactorNotRunning),
        }
        self.inner.state.set(ReactorState::Stopping);
        let me = self.clone();
        events::fire_event(&self.inner.triggers, EVENT_SHUTDOWN, move || {
            me.inner.state.set(ReactorState::Stopped);
        });
        Ok(())
    }

    /// Abort the loop without firing shutdown. Rude: outstanding
    /// deferreds stay uncalled and data may be lost.
    pub fn crash(&self) {
        self.inner.state.set(ReactorState::Crashed);
    }

    /// Run one pass of the loop: thread-queue, expired timers, then I/O
    /// polling for at most `delay` seconds. Intended for integrating the
    /// reactor into a foreign main loop.
    pub fn iterate(&self, delay: f64) -> Result<()> {
        self.one_iteration(Some(timer::secs_to_duration(delay)))
    }

    fn one_iteration(&self, wait: Option<Duration>) -> Result<()> {
        if self.inner.in_iteration.replace(true) {
            return Err(KairoError::NestedReactorCall);
        }
        let result = self.iteration_body(wait);
        self.inner.in_iteration.set(false);
        result
    }

    fn iteration_body(&self, wait: Option<Duration>) -> Result<()> {
        self.process_thread_messages();

        let now = Instant::now();
        let batch = self.inner.timers.borrow_mut().due_batch(now);
        for func in batch {
            func();
        }

        // Work queued by timers must not sit behind a blocking poll.
        let timeout = if !self.inner.shared.is_empty() {
            Some(Duration::ZERO)
        } else {
            let next_timer = self.inner.timers.borrow_mut().time_to_next(Instant::now());
            match (next_timer, wait) {
                (Some(t), Some(w)) => Some(t.min(w)),
                (Some(t), None) => Some(t),
                (None, Some(w)) => Some(w),
                (None, None) => None,
            }
        };

        let ready = {
            let mut poll = self.inner.poll.borrow_mut();
            let mut events = self.inner.events.borrow_mut();
            match poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
            let mut ready = Vec::new();
            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                // error and hangup conditions must reach the handler even
                // when the platform reports no plain readiness bit
                let readable = event.is_readable() || event.is_error() || event.is_read_closed();
                let writable = event.is_writable() || event.is_error() || event.is_write_closed();
                ready.push((event.token(), readable, writable));
            }
            ready
        };

        for (token, readable, writable) in ready {
            self.dispatch_event(token, readable, writable);
        }

        self.process_thread_messages();
        Ok(())
    }

    fn dispatch_event(&self, token: Token, readable: bool, writable: bool) {
        let fd = match self.inner.tokens.borrow().get(&token) {
            Some(fd) => *fd,
            None => return,
        };
        if readable {
            let handler = {
                let handlers = self.inner.handlers.borrow();
                handlers.get(&fd).filter(|e| e.read).map(|e| Rc::clone(&e.handler))
            };
            if let Some(handler) = handler {
                if let Err(reason) = handler.do_read() {
                    self.drop_handler(fd, reason);
                    return;
                }
            }
        }
        if writable {
            // re-check: the read side may have removed the handler
            let handler = {
                let handlers = self.inner.handlers.borrow();
                handlers.get(&fd).filter(|e| e.write).map(|e| Rc::clone(&e.handler))
            };
            if let Some(handler) = handler {
                if let Err(reason) = handler.do_write() {
                    self.drop_handler(fd, reason);
                }
            }
        }
    }

    fn process_thread_messages(&self) {
        for message in self.inner.shared.drain() {
            match message {
                ThreadMessage::Call(f) => f(),
                ThreadMessage::Result { id, outcome } => {
                    let pending = self.inner.pending_thread.borrow_mut().remove(&id);
                    if let Some(d) = pending {
                        match outcome {
                            Ok(value) => d.callback_boxed(value as Box<dyn Any>),
                            Err(e) => d.errback(FailureValue::from_error(e)),
                        }
                    }
                }
            }
        }
    }

    // ============================================================
    // Timers
    // ============================================================

    /// Schedule `f` to run `delay` seconds from now.
    pub fn call_later(&self, delay: f64, f: impl FnOnce() + 'static) -> DelayedCall {
        self.inner.timers.borrow_mut().schedule(delay, Box::new(f))
    }

    /// Every pending delayed call, earliest first.
    pub fn get_delayed_calls(&self) -> Vec<DelayedCall> {
        self.inner.timers.borrow().pending()
    }

    // ============================================================
    // I/O readiness
    // ============================================================

    /// Start watching `handler` for readability.
    pub fn add_reader(&self, handler: Rc<dyn IoHandler>) -> Result<()> {
        self.add_interest(handler, true)
    }

    /// Start watching `handler` for writability.
    pub fn add_writer(&self, handler: Rc<dyn IoHandler>) -> Result<()> {
        self.add_interest(handler, false)
    }

    fn add_interest(&self, handler: Rc<dyn IoHandler>, read: bool) -> Result<()> {
        let fd = handler.fileno();
        let mut handlers = self.inner.handlers.borrow_mut();
        if let Some(entry) = handlers.get_mut(&fd) {
            let changed = if read { !entry.read } else { !entry.write };
            if read {
                entry.read = true;
            } else {
                entry.write = true;
            }
            if changed {
                let poll = self.inner.poll.borrow();
                entry.handler.reregister(poll.registry(), entry.token, entry.interest())?;
            }
            return Ok(());
        }
        let token = Token(self.inner.next_token.get());
        self.inner.next_token.set(token.0 + 1);
        let entry = HandlerEntry { handler, token, read, write: !read };
        {
            let poll = self.inner.poll.borrow();
            entry.handler.register(poll.registry(), token, entry.interest())?;
        }
        self.inner.tokens.borrow_mut().insert(token, fd);
        handlers.insert(fd, entry);
        Ok(())
    }

    /// Stop watching for readability. Removing a descriptor that is not
    /// registered is a no-op.
    pub fn remove_reader(&self, handler: &dyn IoHandler) {
        self.remove_interest(handler.fileno(), true);
    }

    /// Stop watching for writability. Idempotent like `remove_reader`.
    pub fn remove_writer(&self, handler: &dyn IoHandler) {
        self.remove_interest(handler.fileno(), false);
    }

    fn remove_interest(&self, fd: i32, read: bool) {
        let mut handlers = self.inner.handlers.borrow_mut();
        let Some(entry) = handlers.get_mut(&fd) else { return };
        if read {
            entry.read = false;
        } else {
            entry.write = false;
        }
        let poll = self.inner.poll.borrow();
        if !entry.read && !entry.write {
            if let Err(e) = entry.handler.deregister(poll.registry()) {
                debug_error!("Failed to deregister fd {}: {}", fd, e);
            }
            self.inner.tokens.borrow_mut().remove(&entry.token);
            drop(poll);
            handlers.remove(&fd);
        } else if let Err(e) = entry.handler.reregister(poll.registry(), entry.token, entry.interest()) {
            debug_error!("Failed to reregister fd {}: {}", fd, e);
        }
    }

    // Remove a handler entirely and report the disconnect. Used when a
    // readiness callback fails.
    fn drop_handler(&self, fd: i32, reason: FailureValue) {
        let entry = self.inner.handlers.borrow_mut().remove(&fd);
        let Some(entry) = entry else { return };
        self.inner.tokens.borrow_mut().remove(&entry.token);
        {
            let poll = self.inner.poll.borrow();
            if let Err(e) = entry.handler.deregister(poll.registry()) {
                debug_error!("Failed to deregister fd {}: {}", fd, e);
            }
        }
        debug_trace!("Dropping descriptor {}: {}", fd, reason);
        entry.handler.connection_lost(reason);
    }

    /// Remove a descriptor without a failure, e.g. when a transport
    /// finishes a clean shutdown from inside its own callback.
    pub fn discard_handler(&self, handler: &dyn IoHandler) {
        let fd = handler.fileno();
        let entry = self.inner.handlers.borrow_mut().remove(&fd);
        let Some(entry) = entry else { return };
        self.inner.tokens.borrow_mut().remove(&entry.token);
        let poll = self.inner.poll.borrow();
        if let Err(e) = entry.handler.deregister(poll.registry()) {
            debug_error!("Failed to deregister fd {}: {}", fd, e);
        }
    }

    // ============================================================
    // System event triggers
    // ============================================================

    /// Register a trigger for `(phase, event)`.
    pub fn add_system_event_trigger(
        &self,
        phase: TriggerPhase,
        event: &str,
        f: impl Fn() + 'static,
    ) -> TriggerHandle {
        self.inner.triggers.borrow_mut().add(phase, event, move || {
            f();
            None
        })
    }

    /// Register a trigger that may return a `Deferred`. Only meaningful
    /// in the `Before` phase, where it gates the `During` phase.
    pub fn add_system_event_trigger_deferred(
        &self,
        phase: TriggerPhase,
        event: &str,
        f: impl Fn() -> Option<Deferred> + 'static,
    ) -> TriggerHandle {
        self.inner.triggers.borrow_mut().add(phase, event, f)
    }

    /// Remove a previously registered trigger. Unknown handles error.
    pub fn remove_system_event_trigger(&self, handle: TriggerHandle) -> Result<()> {
        self.inner.triggers.borrow_mut().remove(handle)
    }

    /// Fire the named event through before/during/after.
    pub fn fire_system_event(&self, event: &str) {
        events::fire_event(&self.inner.triggers, event, || {});
    }

    // ============================================================
    // Threads
    // ============================================================

    /// A `Send + Sync` handle for waking this reactor from other threads.
    pub fn waker(&self) -> ReactorWaker {
        ReactorWaker::new(Arc::clone(&self.inner.shared))
    }

    /// Enqueue `f` to run in the reactor thread on the next iteration.
    /// Safe to call from any thread (via [`Reactor::waker`]) and from
    /// reactor callbacks.
    pub fn call_from_thread(&self, f: impl FnOnce() + Send + 'static) {
        self.waker().call_from_thread(f);
    }

    /// Run `f` on the worker-thread pool.
    pub fn call_in_thread(&self, f: impl FnOnce() + Send + 'static) {
        self.inner.pool.borrow_mut().dispatch(Box::new(f));
    }

    /// Resize the worker pool; zero drains and joins all workers.
    pub fn suggest_thread_pool_size(&self, size: usize) {
        self.inner.pool.borrow_mut().suggest_size(size);
    }

    /// Run `f` on a worker thread and get its result as a `Deferred`
    /// fired back in the reactor thread.
    pub fn defer_to_thread(
        &self,
        f: impl FnOnce() -> std::result::Result<Box<dyn Any + Send>, KairoError> + Send + 'static,
    ) -> Deferred {
        let id = self.inner.next_thread_id.get();
        self.inner.next_thread_id.set(id + 1);
        let d = Deferred::new();
        self.inner.pending_thread.borrow_mut().insert(id, d.clone());
        let waker = self.waker();
        self.call_in_thread(move || {
            let outcome = f();
            waker.deliver_result(id, outcome);
        });
        d
    }

    // ============================================================
    // Name resolution
    // ============================================================

    /// Install the resolver used by [`Reactor::resolve`].
    pub fn install_resolver(&self, resolver: Rc<dyn HostResolver>) {
        *self.inner.resolver.borrow_mut() = Some(resolver);
    }

    /// Resolve a hostname to an address, returning a `Deferred` that
    /// fires with an `IpAddr`. Literal addresses short-circuit. The
    /// timeout sequence is tried value by value; exhaustion errbacks
    /// with a timeout failure.
    pub fn resolve(&self, name: &str, timeouts: &[f64]) -> Deferred {
        if let Ok(ip) = name.parse::<IpAddr>() {
            return crate::defer::succeed(ip);
        }
        let resolver = {
            let mut slot = self.inner.resolver.borrow_mut();
            match slot.as_ref() {
                Some(r) => Rc::clone(r),
                None => {
                    let r: Rc<dyn HostResolver> = Rc::new(ThreadedHostResolver::new(self.clone()));
                    *slot = Some(Rc::clone(&r));
                    r
                }
            }
        };
        resolver.get_host_by_name(name, timeouts)
    }

    // ============================================================
    // Listening and connecting
    // ============================================================

    /// Start a TCP server on `addr`; accepted connections get protocols
    /// from `factory`.
    pub fn listen_tcp(
        &self,
        addr: SocketAddr,
        factory: Rc<RefCell<dyn crate::protocol::Factory>>,
    ) -> Result<Rc<crate::transport::TcpPort>> {
        crate::transport::TcpPort::listen(self, addr, factory)
    }

    /// Begin an outbound TCP connection attempt.
    pub fn connect_tcp(
        &self,
        host: &str,
        port: u16,
        factory: Rc<RefCell<dyn crate::protocol::ClientFactory>>,
        options: crate::protocol::TcpConnectOptions,
    ) -> Rc<crate::protocol::Connector> {
        let connector = crate::protocol::Connector::new(self.clone(), host, port, factory, options);
        connector.connect();
        connector
    }

    /// Bind a UDP socket and attach a datagram protocol to it.
    pub fn listen_udp(
        &self,
        addr: SocketAddr,
        protocol: Rc<RefCell<dyn crate::protocol::DatagramProtocol>>,
    ) -> Result<Rc<crate::transport::UdpPort>> {
        crate::transport::UdpPort::listen(self, addr, protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn reactor() -> Reactor {
        Reactor::new().expect("reactor")
    }

    // run() takes the process-wide running guard, so tests that enter the
    // main loop are serialized.
    static RUN_LOCK: crate::alias::PMutex<()> = crate::alias::PMutex::new(());

    fn spin(r: &Reactor, secs: f64) {
        let deadline = Instant::now() + Duration::from_secs_f64(secs);
        while Instant::now() < deadline {
            r.iterate(0.005).expect("iterate");
        }
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let r = reactor();
        let order = Rc::new(RefCell::new(Vec::new()));
        for (delay, tag) in [(0.010, 10u32), (0.020, 20), (0.005, 5)] {
            let order = Rc::clone(&order);
            r.call_later(delay, move || order.borrow_mut().push(tag));
        }
        spin(&r, 0.1);
        assert_eq!(*order.borrow(), vec![5, 10, 20]);
    }

    #[test]
    fn zero_delay_call_scheduled_during_batch_waits_one_iteration() {
        let r = reactor();
        let log = Rc::new(RefCell::new(Vec::new()));
        let log2 = Rc::clone(&log);
        let r2 = r.clone();
        r.call_later(0.0, move || {
            log2.borrow_mut().push("outer");
            let log3 = Rc::clone(&log2);
            r2.call_later(0.0, move || log3.borrow_mut().push("inner"));
        });
        r.iterate(0.0).unwrap();
        assert_eq!(*log.borrow(), vec!["outer"]);
        r.iterate(0.0).unwrap();
        assert_eq!(*log.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn get_delayed_calls_lists_pending() {
        let r = reactor();
        let a = r.call_later(10.0, || {});
        let _b = r.call_later(5.0, || {});
        assert_eq!(r.get_delayed_calls().len(), 2);
        a.cancel().unwrap();
        assert_eq!(r.get_delayed_calls().len(), 1);
    }

    #[test]
    fn call_from_thread_wakes_the_loop() {
        let r = reactor();
        let hit = std::sync::Arc::new(std::sync::Mutex::new(false));
        let hit2 = std::sync::Arc::clone(&hit);
        let waker = r.waker();
        let handle = std::thread::spawn(move || {
            waker.call_from_thread(move || {});
        });
        handle.join().unwrap();
        // the message also carries a reactor-thread closure
        r.call_from_thread(move || *hit2.lock().unwrap() = true);
        spin(&r, 0.05);
        assert!(*hit.lock().unwrap());
    }

    #[test]
    fn defer_to_thread_round_trips() {
        let r = reactor();
        let d = r.defer_to_thread(|| Ok(Box::new(40 + 2) as Box<dyn Any + Send>));
        let deadline = Instant::now() + Duration::from_secs(2);
        while d.extract::<i32>().is_none() && Instant::now() < deadline {
            r.iterate(0.01).unwrap();
        }
        assert_eq!(d.extract::<i32>(), Some(42));
        r.suggest_thread_pool_size(0);
    }

    #[test]
    fn defer_to_thread_propagates_errors() {
        let r = reactor();
        let d = r.defer_to_thread(|| Err(KairoError::Timeout));
        let deadline = Instant::now() + Duration::from_secs(2);
        while d.failure_result().is_none() && Instant::now() < deadline {
            r.iterate(0.01).unwrap();
        }
        assert_eq!(
            d.failure_result().expect("failed").kind(),
            crate::error::ErrorKind::Timeout
        );
        d.add_errback(|_| crate::defer::CallbackReturn::ok(()));
        r.suggest_thread_pool_size(0);
    }

    #[test]
    fn resolve_short_circuits_ip_literals() {
        let r = reactor();
        let d = r.resolve("127.0.0.1", &[1.0]);
        assert_eq!(
            d.extract::<IpAddr>(),
            Some(IpAddr::from([127, 0, 0, 1]))
        );
    }

    #[test]
    fn run_fires_startup_and_stop_completes_shutdown() {
        let _guard = RUN_LOCK.lock();
        let r = reactor();
        let log = Rc::new(RefCell::new(Vec::new()));
        for (phase, tag) in [
            (TriggerPhase::Before, "before"),
            (TriggerPhase::During, "during"),
            (TriggerPhase::After, "after"),
        ] {
            let log = Rc::clone(&log);
            r.add_system_event_trigger(phase, EVENT_SHUTDOWN, move || {
                log.borrow_mut().push(tag);
            });
        }
        let startup_log = Rc::clone(&log);
        r.add_system_event_trigger(TriggerPhase::During, EVENT_STARTUP, move || {
            startup_log.borrow_mut().push("startup");
        });
        let r2 = r.clone();
        r.call_later(0.01, move || {
            r2.stop().unwrap();
        });
        r.run().unwrap();
        assert_eq!(r.state(), ReactorState::Stopped);
        assert_eq!(*log.borrow(), vec!["startup", "before", "during", "after"]);
    }

    #[test]
    fn crash_skips_shutdown_triggers() {
        let _guard = RUN_LOCK.lock();
        let r = reactor();
        let fired = Rc::new(RefCell::new(false));
        let fired2 = Rc::clone(&fired);
        r.add_system_event_trigger(TriggerPhase::During, EVENT_SHUTDOWN, move || {
            *fired2.borrow_mut() = true;
        });
        let r2 = r.clone();
        r.call_later(0.01, move || r2.crash());
        r.run().unwrap();
        assert_eq!(r.state(), ReactorState::Crashed);
        assert!(!*fired.borrow());
    }

    #[test]
    fn shutdown_waits_for_before_deferreds() {
        let _guard = RUN_LOCK.lock();
        let r = reactor();
        let gate = Deferred::new();
        let gate2 = gate.clone();
        r.add_system_event_trigger_deferred(TriggerPhase::Before, EVENT_SHUTDOWN, move || {
            Some(gate2.clone())
        });
        let r2 = r.clone();
        r.call_later(0.005, move || {
            r2.stop().unwrap();
        });
        let r3 = r.clone();
        let gate3 = gate.clone();
        r.call_later(0.02, move || {
            assert_eq!(r3.state(), ReactorState::Stopping);
            gate3.callback(());
        });
        r.run().unwrap();
        assert_eq!(r.state(), ReactorState::Stopped);
    }

    #[test]
    fn stop_before_run_errors() {
        let r = reactor();
        assert!(matches!(r.stop(), Err(KairoError::ReactorNotRunning)));
    }

    #[test]
    fn nested_iterate_is_rejected() {
        let r = reactor();
        let r2 = r.clone();
        let saw = Rc::new(RefCell::new(None));
        let saw2 = Rc::clone(&saw);
        r.call_later(0.0, move || {
            *saw2.borrow_mut() = Some(matches!(
                r2.iterate(0.0),
                Err(KairoError::NestedReactorCall)
            ));
        });
        r.iterate(0.0).unwrap();
        assert_eq!(*saw.borrow(), Some(true));
    }

    #[test]
    fn deferred_timeout_errbacks_with_timeout_failure() {
        let r = reactor();
        let d = Deferred::new();
        d.set_timeout(&r, 0.02);
        spin(&r, 0.1);
        assert_eq!(
            d.failure_result().expect("timed out").kind(),
            crate::error::ErrorKind::Timeout
        );
        d.add_errback(|_| crate::defer::CallbackReturn::ok(()));
    }

    #[test]
    fn firing_first_cancels_the_timeout() {
        let r = reactor();
        let d = Deferred::new();
        let call = d.set_timeout(&r, 0.02);
        d.callback(5i32);
        assert!(!call.active());
        spin(&r, 0.05);
        assert_eq!(d.extract::<i32>(), Some(5));
    }

    #[test]
    fn removing_unknown_trigger_errors() {
        let r = reactor();
        let handle = r.add_system_event_trigger(TriggerPhase::During, "custom", || {});
        r.remove_system_event_trigger(handle).unwrap();
        assert!(matches!(
            r.remove_system_event_trigger(handle),
            Err(KairoError::UnknownTrigger)
        ));
    }
}
