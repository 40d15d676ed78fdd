//! MUTATION verb handling: apply locally, relay to the nodes the coordinator
//! asked us to forward to, and acknowledge exactly once to whoever is waiting.

use crate::membership::Endpoint;
use crate::messaging::{
    MessageIn, MessageOut, MessagingService, Verb, FORWARD_FROM, FORWARD_TO, VERSION_11,
};
use crate::metadata::{MetadataLog, TagKind, METADATA_KEYSPACE};
use crate::schema::SYSTEM_KEYSPACE;
use crate::storage::{Modification, Mutation, Storage};
use crate::util::MetaError;
use crate::wire;
use log::{debug, error, warn};
use std::sync::Arc;

pub struct MutationVerbHandler {
    storage: Arc<dyn Storage>,
    messaging: Arc<MessagingService>,
    row_audit: Option<Arc<MetadataLog>>,
}

impl MutationVerbHandler {
    pub fn new(storage: Arc<dyn Storage>, messaging: Arc<MessagingService>) -> Self {
        Self {
            storage,
            messaging,
            row_audit: None,
        }
    }

    /// Announces a row-level audit entry for every applied user mutation.
    pub fn with_row_audit(mut self, log: Arc<MetadataLog>) -> Self {
        self.row_audit = Some(log);
        self
    }

    pub fn do_verb(&self, message: &MessageIn, id: &str) -> Result<(), MetaError> {
        let mutation = wire::decode_mutation(&message.payload, message.version)?;
        let reply_to = match message.parameter(FORWARD_FROM) {
            Some(from) => wire::endpoint_from_bytes(from)?,
            None => {
                if let Some(forward_to) = message.parameter(FORWARD_TO) {
                    if message.version >= VERSION_11 {
                        self.forward_to_local_nodes(message, forward_to)?;
                    }
                }
                message.from
            }
        };

        if let Err(err) = self.storage.apply(&mutation) {
            error!(
                "event=mutation_apply_failed keyspace={} key={} from={} error={}",
                mutation.keyspace(),
                mutation.key_string(),
                message.from,
                err
            );
            return Err(err.into());
        }

        let ack = MessageOut::new(Verb::RequestResponse, Vec::new());
        self.messaging.send_reply(&ack, id, &reply_to);

        if let Some(log) = &self.row_audit {
            if !is_system_keyspace(mutation.keyspace()) {
                announce_rows(log, &mutation);
            }
        }
        Ok(())
    }

    /// Relays the message to every `(address, id)` in the forward list, tagged
    /// with the original sender so their acks skip us.
    fn forward_to_local_nodes(&self, message: &MessageIn, forward_to: &[u8]) -> Result<(), MetaError> {
        let entries = wire::decode_forward_to(forward_to)?;
        let relayed = MessageOut::new(message.verb, message.payload.clone())
            .with_parameter(FORWARD_FROM, wire::endpoint_bytes(&message.from));
        for (endpoint, id) in &entries {
            debug!(
                "event=mutation_forwarded to={} id={} coordinator={}",
                endpoint, id, message.from
            );
            self.messaging.send_one_way_with_id(&relayed, id, endpoint);
        }
        Ok(())
    }
}

fn is_system_keyspace(keyspace: &str) -> bool {
    keyspace == SYSTEM_KEYSPACE || keyspace == METADATA_KEYSPACE
}

/// One audit entry per table in the mutation: target `keyspace.table.key`,
/// value `column=value;` for each written cell.
pub fn row_audit_entries(mutation: &Mutation) -> Vec<(String, String, TagKind)> {
    let mut entries = Vec::new();
    for family in mutation.families() {
        let target = format!(
            "{}.{}.{}",
            mutation.keyspace(),
            family.table(),
            mutation.key_string()
        );
        let mut value = String::new();
        let mut has_row_marker = false;
        for modification in family.modifications() {
            if let Modification::Write { name, value: cell, .. } = modification {
                if name.leaf() == Some("") {
                    has_row_marker = true;
                    continue;
                }
                value.push_str(&name.components().join("."));
                value.push('=');
                value.push_str(&String::from_utf8_lossy(cell));
                value.push(';');
            }
        }
        let kind = if has_row_marker {
            TagKind::RowInserted
        } else if family.modifications().iter().all(Modification::is_deletion) {
            TagKind::RowDeleted
        } else {
            TagKind::RowUpdated
        };
        entries.push((target, value, kind));
    }
    entries
}

/// Row entries grouped by tag kind, in first-seen order.
fn group_by_kind(entries: Vec<(String, String, TagKind)>) -> Vec<(TagKind, Vec<(String, String)>)> {
    let mut groups: Vec<(TagKind, Vec<(String, String)>)> = Vec::new();
    for (target, value, kind) in entries {
        match groups.iter_mut().find(|(existing, _)| *existing == kind) {
            Some((_, rows)) => rows.push((target, value)),
            None => groups.push((kind, vec![(target, value)])),
        }
    }
    groups
}

fn announce_rows(log: &MetadataLog, mutation: &Mutation) {
    for (kind, rows) in group_by_kind(row_audit_entries(mutation)) {
        match log.announce_batch(&rows, &kind, "") {
            Ok(sent) => debug!(
                "event=row_audit tag={} rows={} sent={}",
                kind,
                rows.len(),
                sent
            ),
            Err(err) => warn!(
                "event=row_audit_failed tag={} rows={} error={}",
                kind,
                rows.len(),
                err
            ),
        }
    }
}

/// Compact forward-list entry for a coordinator fanning a write out through
/// one relay per remote group.
pub fn forward_list(entries: &[(Endpoint, String)]) -> Result<Vec<u8>, MetaError> {
    Ok(wire::encode_forward_to(entries)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CellName, DeletionTime};

    #[test]
    fn row_audit_classifies_inserts_updates_and_deletes() {
        let mut insert = Mutation::new("app", "42");
        let users = insert.add_or_get("users");
        users.add_column(CellName::new([""]), Vec::new(), 1);
        users.add_column(CellName::new(["email"]), "a@b", 1);
        let entries = row_audit_entries(&insert);
        assert_eq!(
            entries,
            vec![(
                "app.users.42".to_string(),
                "email=a@b;".to_string(),
                TagKind::RowInserted
            )]
        );

        let mut update = Mutation::new("app", "42");
        update
            .add_or_get("users")
            .add_column(CellName::new(["email"]), "c@d", 2);
        assert_eq!(row_audit_entries(&update)[0].2, TagKind::RowUpdated);

        let mut delete = Mutation::new("app", "42");
        delete
            .add_or_get("users")
            .delete_partition(DeletionTime::new(3, 0));
        let entries = row_audit_entries(&delete);
        assert_eq!(entries[0].1, "");
        assert_eq!(entries[0].2, TagKind::RowDeleted);
    }

    #[test]
    fn row_entries_group_by_kind_in_order() {
        let groups = group_by_kind(vec![
            ("a.t.1".into(), "x=1;".into(), TagKind::RowUpdated),
            ("a.t.2".into(), "".into(), TagKind::RowDeleted),
            ("a.u.3".into(), "y=2;".into(), TagKind::RowUpdated),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, TagKind::RowUpdated);
        assert_eq!(
            groups[0].1,
            vec![
                ("a.t.1".to_string(), "x=1;".to_string()),
                ("a.u.3".to_string(), "y=2;".to_string())
            ]
        );
        assert_eq!(groups[1].0, TagKind::RowDeleted);
    }
}
