//! The two ways metadata leaves this node.
//!
//! DDL and registry changes go to every live member (control plane). Audit
//! writes go only to the replicas of their partition in the metadata keyspace
//! (data plane). Both are one-way hand-offs and never wait for the peers.

use crate::membership::{Endpoint, Membership, ReplicaTopology};
use crate::messaging::{MessageOut, MessagingService, Verb};
use crate::metadata::METADATA_KEYSPACE;
use crate::storage::Mutation;
use crate::util::MetaError;
use crate::wire::{self, CodecError};
use log::debug;
use std::sync::Arc;

/// Ordinary (non-metadata) write coordinator. Consistency levels, hints and
/// batching are its business.
pub trait WritePath: Send + Sync {
    fn mutate(&self, mutations: Vec<Mutation>) -> Result<(), MetaError>;
}

pub struct SchemaBroadcast {
    messaging: Arc<MessagingService>,
    membership: Arc<dyn Membership>,
}

impl SchemaBroadcast {
    pub fn new(messaging: Arc<MessagingService>, membership: Arc<dyn Membership>) -> Self {
        Self {
            messaging,
            membership,
        }
    }

    /// Live members other than us that speak at least our protocol version.
    /// Older peers are skipped, not queued; they catch up by pulling.
    pub fn targets(&self) -> Vec<Endpoint> {
        let local = self.membership.local_endpoint();
        let ours = self.messaging.current_version();
        self.membership
            .live_members()
            .into_iter()
            .filter(|endpoint| *endpoint != local)
            .filter(|endpoint| self.membership.protocol_version(endpoint) >= ours)
            .collect()
    }

    pub fn send(&self, mutations: &[Mutation]) -> Result<Vec<Endpoint>, CodecError> {
        let targets = self.targets();
        if targets.is_empty() {
            return Ok(targets);
        }
        let payload = wire::encode_definitions(mutations, self.messaging.current_version())?;
        let message = MessageOut::new(Verb::DefinitionsUpdate, payload);
        for endpoint in &targets {
            self.messaging.send_one_way(&message, endpoint);
        }
        debug!(
            "event=schema_broadcast mutations={} targets={}",
            mutations.len(),
            targets.len()
        );
        Ok(targets)
    }
}

pub struct ReplicaPush {
    messaging: Arc<MessagingService>,
    membership: Arc<dyn Membership>,
    topology: Arc<dyn ReplicaTopology>,
}

impl ReplicaPush {
    pub fn new(
        messaging: Arc<MessagingService>,
        membership: Arc<dyn Membership>,
        topology: Arc<dyn ReplicaTopology>,
    ) -> Self {
        Self {
            messaging,
            membership,
            topology,
        }
    }

    /// Natural and pending replicas of `key` in the metadata keyspace, each
    /// once, restricted to peers on at least our protocol version. The local
    /// node is included when it is a replica.
    pub fn targets(&self, key: &[u8]) -> Vec<Endpoint> {
        let token = self.topology.token(key);
        let ours = self.messaging.current_version();
        let local = self.membership.local_endpoint();
        let mut targets: Vec<Endpoint> = Vec::new();
        let candidates = self
            .topology
            .natural_replicas(METADATA_KEYSPACE, token)
            .into_iter()
            .chain(self.topology.pending_replicas(METADATA_KEYSPACE, token));
        for endpoint in candidates {
            if targets.contains(&endpoint) {
                continue;
            }
            if endpoint != local && self.membership.protocol_version(&endpoint) < ours {
                continue;
            }
            targets.push(endpoint);
        }
        targets
    }

    pub fn push(&self, mutation: &Mutation) -> Result<Vec<Endpoint>, CodecError> {
        let targets = self.targets(mutation.key());
        let payload = wire::encode_definitions(
            std::slice::from_ref(mutation),
            self.messaging.current_version(),
        )?;
        let message = MessageOut::new(Verb::DefinitionsUpdate, payload);
        for endpoint in &targets {
            self.messaging.send_one_way(&message, endpoint);
        }
        debug!(
            "event=replica_push keyspace={} key={} targets={}",
            mutation.keyspace(),
            mutation.key_string(),
            targets.len()
        );
        Ok(targets)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoutedMutations {
    pub ordinary: Vec<Mutation>,
    pub metadata: Vec<Mutation>,
}

/// Splits a batch so that metadata-keyspace mutations never reach the
/// ordinary write path.
pub fn route_mutations(mutations: Vec<Mutation>) -> RoutedMutations {
    let (metadata, ordinary) = mutations
        .into_iter()
        .partition(|mutation| mutation.keyspace() == METADATA_KEYSPACE);
    RoutedMutations { ordinary, metadata }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_separates_metadata_mutations() {
        let routed = route_mutations(vec![
            Mutation::new("app", "k1"),
            Mutation::new(METADATA_KEYSPACE, "ks.t"),
            Mutation::new("system", "ks"),
        ]);
        assert_eq!(routed.metadata.len(), 1);
        assert_eq!(routed.metadata[0].keyspace(), METADATA_KEYSPACE);
        assert!(routed
            .ordinary
            .iter()
            .all(|m| m.keyspace() != METADATA_KEYSPACE));
        assert_eq!(routed.ordinary.len(), 2);
    }
}
