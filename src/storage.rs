//! Cell model and the storage engine seam. The engine itself (flush,
//! compaction, repair) lives outside this crate; `MemoryStorage` is a complete
//! last-write-wins implementation for single-process use and tests.

pub mod cell;
pub mod memory;

pub use cell::{CellName, ColumnFamily, DeletionTime, Modification, Mutation};
pub use memory::MemoryStorage;

use crate::util::StorageError;

/// A live cell as returned by a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub name: CellName,
    pub value: Vec<u8>,
    pub timestamp: i64,
}

impl Cell {
    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// Which cells of a partition a read returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusteringRange {
    All,
    Prefix(CellName),
    /// Inclusive slice between two full names.
    Between { start: CellName, end: CellName },
}

impl ClusteringRange {
    pub fn contains(&self, name: &CellName) -> bool {
        match self {
            ClusteringRange::All => true,
            ClusteringRange::Prefix(prefix) => prefix.is_prefix_of(name),
            ClusteringRange::Between { start, end } => name >= start && name <= end,
        }
    }
}

/// The subset of an ordered key-value engine the metadata subsystem relies on.
/// Cells are last-write-wins by timestamp and deletes are tombstones.
pub trait Storage: Send + Sync {
    fn mutate(
        &self,
        keyspace: &str,
        table: &str,
        key: &[u8],
        name: &CellName,
        value: &[u8],
        timestamp: i64,
    ) -> Result<(), StorageError>;

    /// Tombstones every cell whose name starts with `prefix`.
    fn delete(
        &self,
        keyspace: &str,
        table: &str,
        key: &[u8],
        prefix: &CellName,
        deletion: DeletionTime,
    ) -> Result<(), StorageError>;

    fn read(
        &self,
        keyspace: &str,
        table: &str,
        key: &[u8],
        range: &ClusteringRange,
    ) -> Result<Vec<Cell>, StorageError>;

    /// Keys of every partition in the table that still holds a live cell.
    fn partition_keys(&self, keyspace: &str, table: &str) -> Result<Vec<Vec<u8>>, StorageError>;

    fn truncate(&self, keyspace: &str, table: &str) -> Result<(), StorageError>;

    fn apply(&self, mutation: &Mutation) -> Result<(), StorageError> {
        for family in mutation.families() {
            for modification in family.modifications() {
                match modification {
                    Modification::Write {
                        name,
                        value,
                        timestamp,
                    } => self.mutate(
                        mutation.keyspace(),
                        family.table(),
                        mutation.key(),
                        name,
                        value,
                        *timestamp,
                    )?,
                    Modification::Tombstone { name, deletion } => self.delete(
                        mutation.keyspace(),
                        family.table(),
                        mutation.key(),
                        name,
                        *deletion,
                    )?,
                    Modification::RangeDelete { prefix, deletion } => self.delete(
                        mutation.keyspace(),
                        family.table(),
                        mutation.key(),
                        prefix,
                        *deletion,
                    )?,
                }
            }
        }
        Ok(())
    }
}
