//! Cluster membership and replica placement as seen by the metadata subsystem.
//! Gossip itself is external; this module only names what is consumed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use uuid::Uuid;

/// Broadcast address of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint(IpAddr);

impl Endpoint {
    pub fn new(addr: IpAddr) -> Self {
        Self(addr)
    }

    pub fn v4(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self(IpAddr::V4(Ipv4Addr::new(a, b, c, d)))
    }

    pub fn addr(&self) -> IpAddr {
        self.0
    }

    /// Raw address bytes: 4 for IPv4, 16 for IPv6.
    pub fn octets(&self) -> Vec<u8> {
        match self.0 {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        }
    }

    pub fn from_octets(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(bytes);
                Some(Self(IpAddr::V4(Ipv4Addr::from(octets))))
            }
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(bytes);
                Some(Self(IpAddr::V6(Ipv6Addr::from(octets))))
            }
            _ => None,
        }
    }
}

impl From<IpAddr> for Endpoint {
    fn from(addr: IpAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position on the partitioner ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token(pub i64);

/// Keys of the passive advertisement channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ApplicationState {
    Schema,
    Other(String),
}

pub trait Membership: Send + Sync {
    fn local_endpoint(&self) -> Endpoint;

    fn live_members(&self) -> BTreeSet<Endpoint>;

    fn is_alive(&self, endpoint: &Endpoint) -> bool {
        self.live_members().contains(endpoint)
    }

    /// Messaging protocol version the peer last advertised.
    fn protocol_version(&self, endpoint: &Endpoint) -> i32;

    /// True for members that take part in the protocol but own no replicas.
    fn is_non_replicating_client(&self, endpoint: &Endpoint) -> bool;

    /// Schema version the peer currently advertises, if any.
    fn schema_version(&self, endpoint: &Endpoint) -> Option<Uuid>;

    /// Publishes the local schema version on the advertisement channel.
    fn advertise_schema_version(&self, version: Uuid);
}

pub trait ReplicaTopology: Send + Sync {
    fn token(&self, key: &[u8]) -> Token;

    fn natural_replicas(&self, keyspace: &str, token: Token) -> Vec<Endpoint>;

    /// Nodes currently streaming in as new owners of the token's range.
    fn pending_replicas(&self, keyspace: &str, token: Token) -> Vec<Endpoint>;
}

/// Receives membership transitions. Every hook defaults to a no-op.
pub trait EndpointStateObserver: Send + Sync {
    fn on_join(&self, _endpoint: &Endpoint) {}

    fn on_change(&self, _endpoint: &Endpoint, _state: &ApplicationState, _value: &str) {}

    fn on_alive(&self, _endpoint: &Endpoint, _schema_version: Option<Uuid>) {}

    fn on_dead(&self, _endpoint: &Endpoint) {}

    fn on_remove(&self, _endpoint: &Endpoint) {}
}
