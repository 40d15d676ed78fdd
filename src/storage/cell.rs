use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Composite cell name: the clustering components followed by the leaf column.
///
/// An empty name addresses the whole partition, a strict prefix addresses a
/// clustering range, and a full name addresses a single leaf.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellName(Vec<String>);

impl CellName {
    pub fn new<I, S>(components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(components.into_iter().map(Into::into).collect())
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn components(&self) -> &[String] {
        &self.0
    }

    pub fn component(&self, idx: usize) -> Option<&str> {
        self.0.get(idx).map(String::as_str)
    }

    /// Last component, i.e. the leaf column name.
    pub fn leaf(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_prefix_of(&self, other: &CellName) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    pub fn child(&self, component: impl Into<String>) -> CellName {
        let mut components = self.0.clone();
        components.push(component.into());
        CellName(components)
    }
}

impl fmt::Display for CellName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(":"))
    }
}

/// Tombstone metadata: the write timestamp it shadows up to (microseconds) and
/// the wall-clock second it was created, which starts the gc grace window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionTime {
    pub marked_for_delete_at: i64,
    pub local_deletion_time: i32,
}

impl DeletionTime {
    pub fn new(marked_for_delete_at: i64, local_deletion_time: i32) -> Self {
        Self {
            marked_for_delete_at,
            local_deletion_time,
        }
    }

    /// Tombstone shadowing everything written at or before `timestamp`, stamped
    /// with the current wall-clock second.
    pub fn at(timestamp: i64) -> Self {
        Self::new(timestamp, crate::util::now_seconds())
    }

    pub fn shadows(&self, timestamp: i64) -> bool {
        timestamp <= self.marked_for_delete_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    Write {
        name: CellName,
        value: Vec<u8>,
        timestamp: i64,
    },
    /// Single-leaf tombstone.
    Tombstone {
        name: CellName,
        deletion: DeletionTime,
    },
    /// Range tombstone over every cell under `prefix`; an empty prefix deletes
    /// the partition.
    RangeDelete {
        prefix: CellName,
        deletion: DeletionTime,
    },
}

impl Modification {
    pub fn timestamp(&self) -> i64 {
        match self {
            Modification::Write { timestamp, .. } => *timestamp,
            Modification::Tombstone { deletion, .. } | Modification::RangeDelete { deletion, .. } => {
                deletion.marked_for_delete_at
            }
        }
    }

    pub fn is_deletion(&self) -> bool {
        !matches!(self, Modification::Write { .. })
    }
}

/// The modifications a mutation carries for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFamily {
    table: String,
    modifications: Vec<Modification>,
}

impl ColumnFamily {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            modifications: Vec::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn add_column(&mut self, name: CellName, value: impl Into<Vec<u8>>, timestamp: i64) {
        self.modifications.push(Modification::Write {
            name,
            value: value.into(),
            timestamp,
        });
    }

    pub fn add_tombstone(&mut self, name: CellName, deletion: DeletionTime) {
        self.modifications
            .push(Modification::Tombstone { name, deletion });
    }

    pub fn delete_range(&mut self, prefix: CellName, deletion: DeletionTime) {
        self.modifications
            .push(Modification::RangeDelete { prefix, deletion });
    }

    pub fn delete_partition(&mut self, deletion: DeletionTime) {
        self.delete_range(CellName::empty(), deletion);
    }

    pub fn push(&mut self, modification: Modification) {
        self.modifications.push(modification);
    }

    pub fn modifications(&self) -> &[Modification] {
        &self.modifications
    }

    pub fn is_empty(&self) -> bool {
        self.modifications.is_empty()
    }
}

/// All modifications for one partition key of one keyspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    keyspace: String,
    key: Vec<u8>,
    families: BTreeMap<String, ColumnFamily>,
}

impl Mutation {
    pub fn new(keyspace: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            keyspace: keyspace.into(),
            key: key.into(),
            families: BTreeMap::new(),
        }
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Partition key rendered for logs and audit targets.
    pub fn key_string(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }

    pub fn add_or_get(&mut self, table: &str) -> &mut ColumnFamily {
        self.families
            .entry(table.to_string())
            .or_insert_with(|| ColumnFamily::new(table))
    }

    pub fn family(&self, table: &str) -> Option<&ColumnFamily> {
        self.families.get(table)
    }

    pub fn families(&self) -> impl Iterator<Item = &ColumnFamily> {
        self.families.values()
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.families.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.families.values().all(ColumnFamily::is_empty)
    }

    /// Folds `other` into this mutation. Both must address the same partition.
    pub fn merge(&mut self, other: Mutation) -> bool {
        if other.keyspace != self.keyspace || other.key != self.key {
            return false;
        }
        for (table, family) in other.families {
            let target = self.add_or_get(&table);
            for modification in family.modifications {
                target.push(modification);
            }
        }
        true
    }
}
