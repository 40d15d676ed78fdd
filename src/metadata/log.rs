use super::{ClientIdentity, MetadataRegistry, TagKind, LOG_TABLE, METADATA_KEYSPACE};
use crate::replication::ReplicaPush;
use crate::storage::{CellName, DeletionTime, Mutation};
use crate::util::{now_seconds, timestamp_micros, MetaError};
use ::log::debug;
use std::sync::Arc;

const MARKER: &str = "";
const VALUE: &str = "value";

/// Append-only audit trail, partitioned by target and clustered by
/// `(time, client, tag)`. Writes are gated by the registry.
pub struct MetadataLog {
    registry: Arc<MetadataRegistry>,
    push: Arc<ReplicaPush>,
}

impl MetadataLog {
    pub fn new(registry: Arc<MetadataRegistry>, push: Arc<ReplicaPush>) -> Self {
        Self { registry, push }
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    /// Builds a log record. `time` is payload and only shapes the clustering
    /// path; the cells are stamped with a fresh clock reading.
    pub fn add(target: &str, time: i64, client: &str, kind: &TagKind, value: &str) -> Mutation {
        let timestamp = timestamp_micros();
        let mut mutation = Mutation::new(METADATA_KEYSPACE, target.as_bytes());
        let record = Self::record(time, client, kind);
        let family = mutation.add_or_get(LOG_TABLE);
        family.add_column(record.child(MARKER), Vec::new(), timestamp);
        family.add_column(record.child(VALUE), value, timestamp);
        mutation
    }

    /// Tombstones both leaves of a record.
    pub fn drop(target: &str, time: i64, client: &str, kind: &TagKind) -> Mutation {
        let deletion = DeletionTime::new(timestamp_micros(), now_seconds());
        let mut mutation = Mutation::new(METADATA_KEYSPACE, target.as_bytes());
        let record = Self::record(time, client, kind);
        let family = mutation.add_or_get(LOG_TABLE);
        family.add_tombstone(record.child(MARKER), deletion);
        family.add_tombstone(record.child(VALUE), deletion);
        mutation
    }

    /// Records an audit event if `(target, kind)` is enabled in the registry
    /// and pushes it to the replicas of the target's partition. A disabled
    /// pair is a silent no-op; the return value says whether anything was sent.
    pub fn announce(
        &self,
        target: &str,
        kind: &TagKind,
        client: Option<&ClientIdentity>,
        value: &str,
    ) -> Result<bool, MetaError> {
        let client = ClientIdentity::display_name(client);
        self.announce_as(target, kind, &client, value)
    }

    /// Announces several `(target, value)` pairs under one tag and client.
    pub fn announce_batch(
        &self,
        entries: &[(String, String)],
        kind: &TagKind,
        client: &str,
    ) -> Result<usize, MetaError> {
        let mut sent = 0;
        for (target, value) in entries {
            if self.announce_as(target, kind, client, value)? {
                sent += 1;
            }
        }
        Ok(sent)
    }

    fn announce_as(
        &self,
        target: &str,
        kind: &TagKind,
        client: &str,
        value: &str,
    ) -> Result<bool, MetaError> {
        if !self.registry.is_enabled(target, kind)? {
            debug!(
                "event=audit_skipped target={} tag={} reason=not_registered",
                target, kind
            );
            return Ok(false);
        }
        let mutation = Self::add(target, timestamp_micros(), client, kind, value);
        let targets = self.push.push(&mutation)?;
        debug!(
            "event=audit_announced target={} tag={} client={} replicas={}",
            target,
            kind,
            client,
            targets.len()
        );
        Ok(true)
    }

    fn record(time: i64, client: &str, kind: &TagKind) -> CellName {
        CellName::new([time.to_string(), client.to_string(), kind.code().to_string()])
    }
}
