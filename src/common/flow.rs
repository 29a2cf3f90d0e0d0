//! Flow identity
//!
//! A flow is one transport conversation seen on the interface, keyed by
//! its 5-tuple. Source is the local application, destination is the remote
//! peer it tried to reach.

use std::net::SocketAddr;

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// 5-tuple identifying a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub network: Network,
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

impl FlowKey {
    pub fn new(network: Network, source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            network,
            source,
            destination,
        }
    }

    /// Identifier used by the retry table and in logs.
    pub fn id(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} -> {}", self.network, self.source, self.destination)
    }
}
