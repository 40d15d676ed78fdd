//! In-process cluster: one shared view of membership, a token ring and a
//! loopback transport. Every node gets its own [`Membership`] and
//! [`Transport`] handle onto the same network.

use crate::dispatch::MessageSink;
use crate::membership::{
    ApplicationState, Endpoint, EndpointStateObserver, Membership, ReplicaTopology, Token,
};
use crate::messaging::{MessageIn, MessageOut, Transport, TransportError, Verb, CURRENT_VERSION};
use log::{debug, trace};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

/// Envelopes kept for inspection; older ones are evicted first.
pub const DEFAULT_SENT_CAPACITY: usize = 4_096;

/// One envelope as it crossed the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub from: Endpoint,
    pub to: Endpoint,
    pub id: String,
    pub message: MessageOut,
    pub delivered: bool,
}

impl SentMessage {
    pub fn verb(&self) -> Verb {
        self.message.verb
    }
}

struct NodeEntry {
    alive: bool,
    protocol_version: i32,
    non_replicating: bool,
    schema_version: Option<Uuid>,
    sink: Option<Arc<dyn MessageSink>>,
    observer: Option<Arc<dyn EndpointStateObserver>>,
}

impl NodeEntry {
    fn new(protocol_version: i32, non_replicating: bool) -> Self {
        Self {
            alive: true,
            protocol_version,
            non_replicating,
            schema_version: None,
            sink: None,
            observer: None,
        }
    }
}

struct NetworkState {
    nodes: RwLock<BTreeMap<Endpoint, NodeEntry>>,
    pending: RwLock<BTreeSet<Endpoint>>,
    sent: Mutex<VecDeque<SentMessage>>,
    sent_capacity: usize,
    replication_factor: usize,
}

#[derive(Clone)]
pub struct LocalNetwork {
    state: Arc<NetworkState>,
}

impl LocalNetwork {
    pub fn new(replication_factor: usize) -> Self {
        Self::with_sent_capacity(replication_factor, DEFAULT_SENT_CAPACITY)
    }

    /// Like `new`, keeping at most `capacity` recorded envelopes.
    pub fn with_sent_capacity(replication_factor: usize, capacity: usize) -> Self {
        Self {
            state: Arc::new(NetworkState {
                nodes: RwLock::new(BTreeMap::new()),
                pending: RwLock::new(BTreeSet::new()),
                sent: Mutex::new(VecDeque::new()),
                sent_capacity: capacity,
                replication_factor: replication_factor.max(1),
            }),
        }
    }

    pub fn add_node(&self, endpoint: Endpoint) {
        self.add_node_with(endpoint, CURRENT_VERSION, false);
    }

    /// Adds a member speaking `protocol_version`. Non-replicating members own
    /// no ring position.
    pub fn add_node_with(&self, endpoint: Endpoint, protocol_version: i32, non_replicating: bool) {
        self.state
            .nodes
            .write()
            .insert(endpoint, NodeEntry::new(protocol_version, non_replicating));
        debug!(
            "event=local_node_added endpoint={} version={} non_replicating={}",
            endpoint, protocol_version, non_replicating
        );
        for (observer, _) in self.observers_except(&endpoint) {
            observer.on_join(&endpoint);
        }
    }

    /// Connects a node's inbound side. Until then messages to it are
    /// recorded but not delivered.
    pub fn attach(&self, endpoint: Endpoint, sink: Arc<dyn MessageSink>) {
        if let Some(entry) = self.state.nodes.write().get_mut(&endpoint) {
            entry.sink = Some(sink);
        }
    }

    /// Subscribes `observer` to the membership events `endpoint` would see.
    pub fn observe(&self, endpoint: Endpoint, observer: Arc<dyn EndpointStateObserver>) {
        if let Some(entry) = self.state.nodes.write().get_mut(&endpoint) {
            entry.observer = Some(observer);
        }
    }

    pub fn set_alive(&self, endpoint: Endpoint, alive: bool) {
        let schema_version = {
            let mut nodes = self.state.nodes.write();
            let Some(entry) = nodes.get_mut(&endpoint) else {
                return;
            };
            if entry.alive == alive {
                return;
            }
            entry.alive = alive;
            entry.schema_version
        };
        for (observer, _) in self.observers_except(&endpoint) {
            if alive {
                observer.on_alive(&endpoint, schema_version);
            } else {
                observer.on_dead(&endpoint);
            }
        }
    }

    pub fn set_protocol_version(&self, endpoint: Endpoint, version: i32) {
        if let Some(entry) = self.state.nodes.write().get_mut(&endpoint) {
            entry.protocol_version = version;
        }
    }

    /// Marks `endpoint` as bootstrapping into every range.
    pub fn add_pending(&self, endpoint: Endpoint) {
        self.state.pending.write().insert(endpoint);
    }

    pub fn remove_node(&self, endpoint: Endpoint) {
        self.state.nodes.write().remove(&endpoint);
        self.state.pending.write().remove(&endpoint);
        for (observer, _) in self.observers_except(&endpoint) {
            observer.on_remove(&endpoint);
        }
    }

    pub fn membership(&self, local: Endpoint) -> Arc<LocalMembership> {
        Arc::new(LocalMembership {
            network: self.clone(),
            local,
        })
    }

    pub fn transport(&self, local: Endpoint) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            network: self.clone(),
            local,
        })
    }

    pub fn topology(&self) -> Arc<LocalTopology> {
        Arc::new(LocalTopology {
            network: self.clone(),
        })
    }

    pub fn advertised_version(&self, endpoint: &Endpoint) -> Option<Uuid> {
        self.state
            .nodes
            .read()
            .get(endpoint)
            .and_then(|entry| entry.schema_version)
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.sent.lock().iter().cloned().collect()
    }

    pub fn sent_with(&self, verb: Verb) -> Vec<SentMessage> {
        self.state
            .sent
            .lock()
            .iter()
            .filter(|sent| sent.verb() == verb)
            .cloned()
            .collect()
    }

    pub fn clear_sent(&self) {
        self.state.sent.lock().clear();
    }

    fn record(&self, sent: SentMessage) {
        let capacity = self.state.sent_capacity;
        if capacity == 0 {
            return;
        }
        let mut log = self.state.sent.lock();
        while log.len() >= capacity {
            log.pop_front();
        }
        log.push_back(sent);
    }

    fn observers_except(
        &self,
        endpoint: &Endpoint,
    ) -> Vec<(Arc<dyn EndpointStateObserver>, Endpoint)> {
        self.state
            .nodes
            .read()
            .iter()
            .filter(|(candidate, _)| *candidate != endpoint)
            .filter_map(|(candidate, entry)| {
                entry
                    .observer
                    .as_ref()
                    .map(|observer| (observer.clone(), *candidate))
            })
            .collect()
    }

    fn send(&self, from: Endpoint, to: &Endpoint, id: &str, message: &MessageOut) -> Result<(), TransportError> {
        let (sink, version) = {
            let nodes = self.state.nodes.read();
            let version = nodes
                .get(&from)
                .map(|entry| entry.protocol_version)
                .unwrap_or(CURRENT_VERSION);
            let target = nodes.get(to).filter(|entry| entry.alive);
            (target.map(|entry| entry.sink.clone()), version)
        };
        let delivered = matches!(sink, Some(Some(_)));
        self.record(SentMessage {
            from,
            to: *to,
            id: id.to_string(),
            message: message.clone(),
            delivered,
        });
        match sink {
            None => Err(TransportError::Unreachable(*to)),
            Some(None) => {
                trace!("event=local_message_parked to={} id={}", to, id);
                Ok(())
            }
            Some(Some(sink)) => {
                sink.deliver(MessageIn::from_out(from, message, version), id.to_string());
                Ok(())
            }
        }
    }
}

pub struct LocalTransport {
    network: LocalNetwork,
    local: Endpoint,
}

impl Transport for LocalTransport {
    fn send(&self, to: &Endpoint, id: &str, message: &MessageOut) -> Result<(), TransportError> {
        self.network.send(self.local, to, id, message)
    }
}

pub struct LocalMembership {
    network: LocalNetwork,
    local: Endpoint,
}

impl Membership for LocalMembership {
    fn local_endpoint(&self) -> Endpoint {
        self.local
    }

    fn live_members(&self) -> BTreeSet<Endpoint> {
        self.network
            .state
            .nodes
            .read()
            .iter()
            .filter(|(_, entry)| entry.alive)
            .map(|(endpoint, _)| *endpoint)
            .collect()
    }

    fn protocol_version(&self, endpoint: &Endpoint) -> i32 {
        self.network
            .state
            .nodes
            .read()
            .get(endpoint)
            .map(|entry| entry.protocol_version)
            .unwrap_or(0)
    }

    fn is_non_replicating_client(&self, endpoint: &Endpoint) -> bool {
        self.network
            .state
            .nodes
            .read()
            .get(endpoint)
            .map(|entry| entry.non_replicating)
            .unwrap_or(false)
    }

    fn schema_version(&self, endpoint: &Endpoint) -> Option<Uuid> {
        self.network.advertised_version(endpoint)
    }

    /// Records the version and tells every other member about it.
    fn advertise_schema_version(&self, version: Uuid) {
        {
            let mut nodes = self.network.state.nodes.write();
            let Some(entry) = nodes.get_mut(&self.local) else {
                return;
            };
            if entry.schema_version == Some(version) {
                return;
            }
            entry.schema_version = Some(version);
        }
        let value = version.to_string();
        for (observer, _) in self.network.observers_except(&self.local) {
            observer.on_change(&self.local, &ApplicationState::Schema, &value);
        }
    }
}

/// Ring of replicating members ordered by a digest of their address.
pub struct LocalTopology {
    network: LocalNetwork,
}

impl LocalTopology {
    fn ring(&self) -> Vec<(Token, Endpoint)> {
        let mut ring: Vec<(Token, Endpoint)> = self
            .network
            .state
            .nodes
            .read()
            .iter()
            .filter(|(_, entry)| !entry.non_replicating)
            .map(|(endpoint, _)| (token_of(&endpoint.octets()), *endpoint))
            .collect();
        ring.sort();
        ring
    }
}

impl ReplicaTopology for LocalTopology {
    fn token(&self, key: &[u8]) -> Token {
        token_of(key)
    }

    /// The first `replication_factor` members at or after the token,
    /// wrapping around the ring.
    fn natural_replicas(&self, _keyspace: &str, token: Token) -> Vec<Endpoint> {
        let ring = self.ring();
        if ring.is_empty() {
            return Vec::new();
        }
        let start = ring
            .iter()
            .position(|(position, _)| *position >= token)
            .unwrap_or(0);
        let count = self.network.state.replication_factor.min(ring.len());
        (0..count)
            .map(|offset| ring[(start + offset) % ring.len()].1)
            .collect()
    }

    fn pending_replicas(&self, _keyspace: &str, _token: Token) -> Vec<Endpoint> {
        self.network.state.pending.read().iter().copied().collect()
    }
}

fn token_of(bytes: &[u8]) -> Token {
    let digest = Sha256::digest(bytes);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    Token(i64::from_be_bytes(prefix))
}
