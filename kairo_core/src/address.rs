//! Family-tagged endpoint addresses.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// The address of a transport endpoint, tagged by transport family.
///
/// Code holding an `Address` must not assume the shape of another
/// family's payload; match on the variant (or compare
/// [`family`](Address::family) strings) before digging in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// TCP over IP.
    Inet(SocketAddr),
    /// TCP towards a not-yet-resolved host name, as reported by a
    /// connector's `get_destination`.
    InetHost(String, u16),
    /// UDP over IP.
    InetUdp(SocketAddr),
    /// TLS over TCP.
    Ssl(SocketAddr),
    /// Unix domain socket path.
    Unix(String),
    /// A file or file-like object standing in for a socket.
    File(String),
}

impl Address {
    pub fn family(&self) -> &'static str {
        match self {
            Address::Inet(_) | Address::InetHost(_, _) => "INET",
            Address::InetUdp(_) => "INET_UDP",
            Address::Ssl(_) => "SSL",
            Address::Unix(_) => "UNIX",
            Address::File(_) => "file",
        }
    }

    /// The socket address for the IP-based families.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Address::Inet(a) | Address::InetUdp(a) | Address::Ssl(a) => Some(*a),
            _ => None,
        }
    }

    /// The peer host for the IP-based families, used for per-peer
    /// accounting.
    pub fn host(&self) -> Option<IpAddr> {
        self.socket_addr().map(|a| a.ip())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Inet(a) | Address::InetUdp(a) | Address::Ssl(a) => {
                write!(f, "{}:{}", self.family(), a)
            }
            Address::InetHost(host, port) => write!(f, "INET:{}:{}", host, port),
            Address::Unix(path) => write!(f, "UNIX:{}", path),
            Address::File(name) => write!(f, "file:{}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn families_are_tagged() {
        let addr: SocketAddr = "127.0.0.1:80".parse().unwrap();
        assert_eq!(Address::Inet(addr).family(), "INET");
        assert_eq!(Address::InetUdp(addr).family(), "INET_UDP");
        assert_eq!(Address::Ssl(addr).family(), "SSL");
        assert_eq!(Address::Unix("/tmp/sock".into()).family(), "UNIX");
        assert_eq!(Address::File("stdin".into()).family(), "file");
    }

    #[test]
    fn host_is_only_defined_for_ip_families() {
        let addr: SocketAddr = "10.0.0.1:443".parse().unwrap();
        assert_eq!(Address::Ssl(addr).host(), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(Address::Unix("/tmp/sock".into()).host(), None);
    }
}
