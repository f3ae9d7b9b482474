use std::{fmt, net::SocketAddr};

/// One direction of a TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Flow {
    /// The sending endpoint.
    pub source: SocketAddr,
    /// The receiving endpoint.
    pub destination: SocketAddr,
}

impl Flow {
    /// Creates the flow from `source` to `destination`.
    pub fn new(source: SocketAddr, destination: SocketAddr) -> Self {
        Self { source, destination }
    }

    /// The opposite direction of the same connection.
    pub fn reverse(self) -> Self {
        Self { source: self.destination, destination: self.source }
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}

/// Direction-agnostic identity of a TCP connection. Both directions of a connection map to the
/// same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// The lower of the two endpoints.
    low: SocketAddr,
    /// The higher of the two endpoints.
    high: SocketAddr,
}

impl ConnectionKey {
    /// Creates the key of the connection between `a` and `b`, in either order.
    pub fn new(a: SocketAddr, b: SocketAddr) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    /// Returns the index of the half stream `flow` travels on: 0 if it leaves the lower
    /// endpoint, 1 otherwise.
    pub(crate) fn side(&self, flow: &Flow) -> usize {
        usize::from(flow.source != self.low)
    }

    /// Returns both endpoints, lower first.
    pub fn endpoints(&self) -> (SocketAddr, SocketAddr) {
        (self.low, self.high)
    }
}

impl From<Flow> for ConnectionKey {
    fn from(flow: Flow) -> Self {
        Self::new(flow.source, flow.destination)
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.low, self.high)
    }
}
