//! Asynchronous hostname resolution.
//!
//! The reactor delegates lookups to an installed [`HostResolver`]. The
//! stock implementation offloads the platform resolver onto the worker
//! pool; full DNS services implement [`RecordResolver`] on top and are
//! external to the core.
//!
//! Timeouts are a sequence of increasing seconds values: each attempt
//! uses the next value, and when the sequence is exhausted the lookup
//! errbacks with a timeout failure.

use std::any::Any;
use std::cell::Cell;
use std::rc::Rc;

use crate::defer::{CallbackReturn, Deferred, Outcome, fail};
use crate::error::KairoError;
use crate::failure::FailureValue;
use crate::reactor::Reactor;
use crate::debug_trace;

/// Name-to-address resolution, the only lookup the reactor needs.
pub trait HostResolver {
    /// Resolve `name`, firing the deferred with an `IpAddr`.
    fn get_host_by_name(&self, name: &str, timeouts: &[f64]) -> Deferred;
}

/// DNS record classes a record-level resolver can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    Aaaa,
    Cname,
    Mx,
    Ns,
    Ptr,
    Soa,
    Srv,
    Txt,
}

/// One resource record, payload left wire-encoded.
#[derive(Debug, Clone)]
pub struct Record {
    pub name: String,
    pub record_type: RecordType,
    pub ttl: u32,
    pub data: Vec<u8>,
}

/// The three record sections of a DNS response.
#[derive(Debug, Clone, Default)]
pub struct ResolveTriple {
    pub answers: Vec<Record>,
    pub authority: Vec<Record>,
    pub additional: Vec<Record>,
}

fn unsupported(what: &str) -> Deferred {
    fail(FailureValue::from_error(KairoError::HostResolutionFailed(
        format!("{} lookups are not supported by this resolver", what),
    )))
}

/// Record-level resolution, extending plain host lookup.
///
/// Every method returns a deferred firing with a [`ResolveTriple`].
/// The defaults refuse; a real DNS service overrides `lookup_record`
/// (and `lookup_zone` for transfers).
pub trait RecordResolver: HostResolver {
    fn lookup_record(&self, _name: &str, record_type: RecordType, _timeouts: &[f64]) -> Deferred {
        unsupported(&format!("{:?}", record_type))
    }

    fn lookup_address(&self, name: &str, timeouts: &[f64]) -> Deferred {
        self.lookup_record(name, RecordType::A, timeouts)
    }

    fn lookup_ipv6_address(&self, name: &str, timeouts: &[f64]) -> Deferred {
        self.lookup_record(name, RecordType::Aaaa, timeouts)
    }

    fn lookup_canonical_name(&self, name: &str, timeouts: &[f64]) -> Deferred {
        self.lookup_record(name, RecordType::Cname, timeouts)
    }

    fn lookup_mail_exchange(&self, name: &str, timeouts: &[f64]) -> Deferred {
        self.lookup_record(name, RecordType::Mx, timeouts)
    }

    fn lookup_nameservers(&self, name: &str, timeouts: &[f64]) -> Deferred {
        self.lookup_record(name, RecordType::Ns, timeouts)
    }

    fn lookup_pointer(&self, name: &str, timeouts: &[f64]) -> Deferred {
        self.lookup_record(name, RecordType::Ptr, timeouts)
    }

    fn lookup_authority(&self, name: &str, timeouts: &[f64]) -> Deferred {
        self.lookup_record(name, RecordType::Soa, timeouts)
    }

    fn lookup_service(&self, name: &str, timeouts: &[f64]) -> Deferred {
        self.lookup_record(name, RecordType::Srv, timeouts)
    }

    fn lookup_text(&self, name: &str, timeouts: &[f64]) -> Deferred {
        self.lookup_record(name, RecordType::Txt, timeouts)
    }

    /// Zone transfer; fires with a `Vec<Record>`.
    fn lookup_zone(&self, _name: &str, _timeouts: &[f64]) -> Deferred {
        unsupported("zone")
    }
}

/// The stock resolver: runs the platform lookup on the reactor's
/// worker pool and retries per the timeout sequence.
pub struct ThreadedHostResolver {
    reactor: Reactor,
}

impl ThreadedHostResolver {
    pub fn new(reactor: Reactor) -> ThreadedHostResolver {
        ThreadedHostResolver { reactor }
    }
}

impl HostResolver for ThreadedHostResolver {
    fn get_host_by_name(&self, name: &str, timeouts: &[f64]) -> Deferred {
        let out = Deferred::new();
        attempt(
            self.reactor.clone(),
            name.to_string(),
            timeouts.to_vec(),
            0,
            out.clone(),
        );
        out
    }
}

fn blocking_lookup(name: &str) -> std::result::Result<Box<dyn Any + Send>, KairoError> {
    use std::net::ToSocketAddrs;
    let mut addrs = (name, 0u16)
        .to_socket_addrs()
        .map_err(|e| KairoError::HostResolutionFailed(format!("{}: {}", name, e)))?;
    match addrs.next() {
        Some(addr) => Ok(Box::new(addr.ip()) as Box<dyn Any + Send>),
        None => Err(KairoError::HostResolutionFailed(name.to_string())),
    }
}

fn attempt(reactor: Reactor, name: String, timeouts: Vec<f64>, index: usize, out: Deferred) {
    debug_trace!("Resolving {:?}, attempt {}", name, index + 1);
    let lookup_name = name.clone();
    let d = reactor.defer_to_thread(move || blocking_lookup(&lookup_name));

    // Set when this attempt's timer fires; a late thread result for an
    // expired attempt is discarded.
    let expired = Rc::new(Cell::new(false));

    let timer = timeouts.get(index).copied().map(|seconds| {
        let expired = Rc::clone(&expired);
        let out = out.clone();
        let reactor2 = reactor.clone();
        let name2 = name.clone();
        let timeouts2 = timeouts.clone();
        reactor.call_later(seconds, move || {
            if out.called() {
                return;
            }
            expired.set(true);
            if index + 1 < timeouts2.len() {
                attempt(reactor2, name2, timeouts2, index + 1, out);
            } else {
                out.errback(FailureValue::from_error(KairoError::Timeout));
            }
        })
    });

    d.add_both(move |outcome| {
        if expired.get() || out.called() {
            // stale result from an expired attempt
            return CallbackReturn::ok(());
        }
        if let Some(timer) = timer.as_ref() {
            let _ = timer.cancel();
        }
        match outcome {
            Outcome::Success(value) => out.callback_boxed(value),
            Outcome::Failure(reason) => out.errback(reason),
        }
        CallbackReturn::ok(())
    });
}
