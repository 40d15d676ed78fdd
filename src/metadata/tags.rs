use super::{join_target, TagKind, COLUMN_DROP_DROPPED, COLUMN_DROP_PERMANENT, TAGS_TABLE};
use crate::schema::SYSTEM_KEYSPACE;
use crate::storage::{CellName, ClusteringRange, DeletionTime, Mutation, Storage};
use crate::util::{now_seconds, StorageError};
use thiserror::Error;

const MARKER: &str = "";
const VALUE: &str = "value";
const CREATED_AT: &str = "created_at";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagStateError {
    #[error("column {target} is already permanently dropped")]
    PermanentlyDropped { target: String },
    #[error("tag on {target} holds unknown state '{value}'")]
    UnknownState { target: String, value: String },
    #[error("tag record mismatch: expected {expected}, found {found}")]
    Mismatch { expected: String, found: String },
}

/// One `(tag kind, target)` record of `system.metadata_tags`.
///
/// The column-drop kind walks `none -> dropped -> permanent_drop` and stops
/// there; every other kind just carries its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRecord {
    kind: TagKind,
    target: String,
    value: Option<Vec<u8>>,
    created_at: Option<Vec<u8>>,
}

impl TagRecord {
    pub fn new(kind: TagKind, target_parts: &[&str]) -> Self {
        Self {
            kind,
            target: join_target(target_parts),
            value: None,
            created_at: None,
        }
    }

    /// Reads the current state. Only the column-drop kind has state worth
    /// reading; other kinds start empty.
    pub fn load(
        storage: &dyn Storage,
        kind: TagKind,
        target_parts: &[&str],
    ) -> Result<Self, StorageError> {
        let mut record = Self::new(kind, target_parts);
        if record.kind != TagKind::ColumnDrop {
            return Ok(record);
        }
        let cells = storage.read(
            SYSTEM_KEYSPACE,
            TAGS_TABLE,
            record.kind.code().as_bytes(),
            &ClusteringRange::Prefix(CellName::new([record.target.as_str()])),
        )?;
        for cell in cells {
            match cell.name.component(1) {
                Some(VALUE) => record.value = Some(cell.value),
                Some(CREATED_AT) => record.created_at = Some(cell.value),
                _ => {}
            }
        }
        Ok(record)
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn kind(&self) -> &TagKind {
        &self.kind
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn value_str(&self) -> Option<String> {
        self.value
            .as_ref()
            .map(|value| String::from_utf8_lossy(value).into_owned())
    }

    /// Milliseconds since the epoch of the last `add_tag`.
    pub fn created_at_millis(&self) -> Option<i64> {
        let raw = self.created_at.as_deref()?;
        let bytes: [u8; 8] = raw.try_into().ok()?;
        Some(i64::from_be_bytes(bytes))
    }

    /// Writes the record, advancing the column-drop lifecycle. The record is
    /// left untouched when the transition is refused.
    pub fn add_tag(&mut self, timestamp: i64) -> Result<Mutation, TagStateError> {
        let value = self.next_value()?;
        let created_at = (timestamp / 1_000).to_be_bytes().to_vec();
        let mut mutation = Mutation::new(SYSTEM_KEYSPACE, self.kind.code().as_bytes());
        let record = CellName::new([self.target.as_str()]);
        let family = mutation.add_or_get(TAGS_TABLE);
        family.add_column(record.child(MARKER), Vec::new(), timestamp);
        family.add_column(record.child(VALUE), value.clone(), timestamp);
        family.add_column(record.child(CREATED_AT), created_at.clone(), timestamp);
        self.value = Some(value);
        self.created_at = Some(created_at);
        Ok(mutation)
    }

    /// Tombstones all three leaves at `timestamp`.
    pub fn drop_tag(&self, timestamp: i64) -> Mutation {
        let deletion = DeletionTime::new(timestamp, now_seconds());
        let mut mutation = Mutation::new(SYSTEM_KEYSPACE, self.kind.code().as_bytes());
        let record = CellName::new([self.target.as_str()]);
        let family = mutation.add_or_get(TAGS_TABLE);
        for leaf in [MARKER, VALUE, CREATED_AT] {
            family.add_tombstone(record.child(leaf), deletion);
        }
        mutation
    }

    /// Replaces this record with `new_state` in full.
    pub fn to_schema_update(
        &self,
        new_state: &mut TagRecord,
        timestamp: i64,
    ) -> Result<Mutation, TagStateError> {
        self.check_same_record(new_state)?;
        new_state.add_tag(timestamp)
    }

    pub fn drop_from_schema(
        &self,
        new_state: &TagRecord,
        timestamp: i64,
    ) -> Result<Mutation, TagStateError> {
        self.check_same_record(new_state)?;
        Ok(new_state.drop_tag(timestamp))
    }

    fn next_value(&self) -> Result<Vec<u8>, TagStateError> {
        if self.kind != TagKind::ColumnDrop {
            return Ok(self.value.clone().unwrap_or_default());
        }
        match self.value.as_deref() {
            None => Ok(COLUMN_DROP_DROPPED.as_bytes().to_vec()),
            Some(current) if current == COLUMN_DROP_DROPPED.as_bytes() => {
                Ok(COLUMN_DROP_PERMANENT.as_bytes().to_vec())
            }
            Some(current) if current == COLUMN_DROP_PERMANENT.as_bytes() => {
                Err(TagStateError::PermanentlyDropped {
                    target: self.target.clone(),
                })
            }
            Some(other) => Err(TagStateError::UnknownState {
                target: self.target.clone(),
                value: String::from_utf8_lossy(other).into_owned(),
            }),
        }
    }

    fn check_same_record(&self, other: &TagRecord) -> Result<(), TagStateError> {
        if self.kind != other.kind || self.target != other.target {
            return Err(TagStateError::Mismatch {
                expected: format!("{}/{}", self.kind, self.target),
                found: format!("{}/{}", other.kind, other.target),
            });
        }
        Ok(())
    }
}
