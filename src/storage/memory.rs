use super::{Cell, CellName, ClusteringRange, DeletionTime, Storage};
use crate::util::StorageError;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

type PartitionId = (String, String, Vec<u8>);

#[derive(Debug, Clone)]
struct StoredCell {
    value: Vec<u8>,
    timestamp: i64,
}

#[derive(Debug, Default)]
struct Partition {
    cells: BTreeMap<CellName, StoredCell>,
    tombstones: Vec<(CellName, DeletionTime)>,
}

impl Partition {
    fn shadowed(&self, name: &CellName, timestamp: i64) -> bool {
        self.tombstones
            .iter()
            .any(|(prefix, deletion)| prefix.is_prefix_of(name) && deletion.shadows(timestamp))
    }

    fn write(&mut self, name: &CellName, value: &[u8], timestamp: i64) {
        if self.shadowed(name, timestamp) {
            return;
        }
        if let Some(existing) = self.cells.get(name) {
            let newer = timestamp > existing.timestamp
                || (timestamp == existing.timestamp && value > existing.value.as_slice());
            if !newer {
                return;
            }
        }
        self.cells.insert(
            name.clone(),
            StoredCell {
                value: value.to_vec(),
                timestamp,
            },
        );
    }

    fn delete(&mut self, prefix: &CellName, deletion: DeletionTime) {
        match self.tombstones.iter_mut().find(|(p, _)| p == prefix) {
            Some((_, existing)) => {
                if deletion.marked_for_delete_at > existing.marked_for_delete_at {
                    *existing = deletion;
                }
            }
            None => self.tombstones.push((prefix.clone(), deletion)),
        }
        self.cells
            .retain(|name, cell| !(prefix.is_prefix_of(name) && deletion.shadows(cell.timestamp)));
    }
}

/// In-memory last-write-wins store. Tombstones are retained for the life of
/// the process; purging them after the grace window is compaction's job.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    partitions: RwLock<BTreeMap<PartitionId, Partition>>,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with an I/O error until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other(
                "memory storage write failure injected",
            )));
        }
        Ok(())
    }

    fn id(keyspace: &str, table: &str, key: &[u8]) -> PartitionId {
        (keyspace.to_string(), table.to_string(), key.to_vec())
    }
}

impl Storage for MemoryStorage {
    fn mutate(
        &self,
        keyspace: &str,
        table: &str,
        key: &[u8],
        name: &CellName,
        value: &[u8],
        timestamp: i64,
    ) -> Result<(), StorageError> {
        self.check_writable()?;
        self.partitions
            .write()
            .entry(Self::id(keyspace, table, key))
            .or_default()
            .write(name, value, timestamp);
        Ok(())
    }

    fn delete(
        &self,
        keyspace: &str,
        table: &str,
        key: &[u8],
        prefix: &CellName,
        deletion: DeletionTime,
    ) -> Result<(), StorageError> {
        self.check_writable()?;
        self.partitions
            .write()
            .entry(Self::id(keyspace, table, key))
            .or_default()
            .delete(prefix, deletion);
        Ok(())
    }

    fn read(
        &self,
        keyspace: &str,
        table: &str,
        key: &[u8],
        range: &ClusteringRange,
    ) -> Result<Vec<Cell>, StorageError> {
        let partitions = self.partitions.read();
        let Some(partition) = partitions.get(&Self::id(keyspace, table, key)) else {
            return Ok(Vec::new());
        };
        Ok(partition
            .cells
            .iter()
            .filter(|(name, _)| range.contains(name))
            .map(|(name, cell)| Cell {
                name: name.clone(),
                value: cell.value.clone(),
                timestamp: cell.timestamp,
            })
            .collect())
    }

    fn partition_keys(&self, keyspace: &str, table: &str) -> Result<Vec<Vec<u8>>, StorageError> {
        let partitions = self.partitions.read();
        Ok(partitions
            .iter()
            .filter(|((ks, t, _), partition)| {
                ks == keyspace && t == table && !partition.cells.is_empty()
            })
            .map(|((_, _, key), _)| key.clone())
            .collect())
    }

    fn truncate(&self, keyspace: &str, table: &str) -> Result<(), StorageError> {
        self.check_writable()?;
        self.partitions
            .write()
            .retain(|(ks, t, _), _| !(ks == keyspace && t == table));
        Ok(())
    }
}
