use std::cell::RefCell;
use std::collections::HashMap;
use std::net::IpAddr;
use std::rc::Rc;

use super::{WrapperEvents, WrapperTransport, WrappingFactory};
use crate::address::Address;
use crate::debug_log;
use crate::protocol::Factory;
use crate::transport::Transport;

/// Caps the number of simultaneous connections per peer host.
///
/// Once a host reaches the cap, further connections from it are refused
/// by building no protocol; disconnects free slots up again.
pub struct LimitConnectionsByPeer {
    max_connections_per_peer: usize,
    peer_connections: RefCell<HashMap<IpAddr, usize>>,
}

impl LimitConnectionsByPeer {
    pub fn new(max_connections_per_peer: usize) -> Rc<LimitConnectionsByPeer> {
        Rc::new(LimitConnectionsByPeer {
            max_connections_per_peer,
            peer_connections: RefCell::new(HashMap::new()),
        })
    }

    /// Wrap `factory` with this policy.
    pub fn wrap<F: Factory + 'static>(
        self: &Rc<Self>,
        factory: Rc<RefCell<F>>,
    ) -> WrappingFactory {
        WrappingFactory::new(factory, Rc::clone(self) as Rc<dyn WrapperEvents>)
    }

    pub fn connections_from(&self, host: IpAddr) -> usize {
        self.peer_connections.borrow().get(&host).copied().unwrap_or(0)
    }
}

impl WrapperEvents for LimitConnectionsByPeer {
    fn build_allowed(&self, addr: &Address) -> bool {
        let Some(host) = addr.host() else {
            // non-IP peers are not limited
            return true;
        };
        let mut peers = self.peer_connections.borrow_mut();
        let count = peers.entry(host).or_insert(0);
        if *count >= self.max_connections_per_peer {
            debug_log!("Refusing {}: per-peer limit reached", host);
            return false;
        }
        *count += 1;
        true
    }

    fn connection_lost(&self, wrapper: &Rc<WrapperTransport>) {
        let Some(host) = wrapper.get_peer().host() else { return };
        let mut peers = self.peer_connections.borrow_mut();
        if let Some(count) = peers.get_mut(&host) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                peers.remove(&host);
            }
        }
    }
}
