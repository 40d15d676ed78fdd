use super::{TagKind, REGISTRY_TABLE};
use crate::schema::SYSTEM_KEYSPACE;
use crate::storage::{CellName, ClusteringRange, DeletionTime, Mutation, Storage};
use crate::util::{timestamp_micros, StorageError};
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

const MARKER: &str = "";
const ADMIN_TAG: &str = "admin_tag";

/// Which `(target, tag kind)` pairs are audited. Storage is authoritative; the
/// cache only ever holds entries that were read from or written to it, so a
/// miss always falls through to a storage read.
pub struct MetadataRegistry {
    storage: Arc<dyn Storage>,
    cache: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MetadataRegistry {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Enables auditing of `kind` on `target`. The entry is written through to
    /// local storage and the mutation is returned for replication.
    pub fn add(
        &self,
        target: &str,
        kind: &TagKind,
        admin_tag: &str,
    ) -> Result<Mutation, StorageError> {
        let timestamp = timestamp_micros();
        let mut mutation = Mutation::new(SYSTEM_KEYSPACE, target.as_bytes());
        let entry = CellName::new([kind.code()]);
        let family = mutation.add_or_get(REGISTRY_TABLE);
        family.add_column(entry.child(MARKER), Vec::new(), timestamp);
        family.add_column(entry.child(ADMIN_TAG), admin_tag, timestamp);
        self.storage.apply(&mutation)?;
        self.cache
            .lock()
            .entry(target.to_string())
            .or_default()
            .insert(kind.code().to_string(), admin_tag.to_string());
        info!(
            "event=registry_add target={} tag={} admin_tag={}",
            target, kind, admin_tag
        );
        Ok(mutation)
    }

    /// Disables every tag kind on `target` with one partition tombstone.
    pub fn drop_target(&self, target: &str) -> Result<Mutation, StorageError> {
        let mut mutation = Mutation::new(SYSTEM_KEYSPACE, target.as_bytes());
        mutation
            .add_or_get(REGISTRY_TABLE)
            .delete_partition(DeletionTime::at(timestamp_micros()));
        self.storage.apply(&mutation)?;
        self.cache.lock().remove(target);
        info!("event=registry_drop target={}", target);
        Ok(mutation)
    }

    pub fn query(&self, target: &str, kind: &TagKind) -> Result<Option<String>, StorageError> {
        if let Some(admin_tag) = self
            .cache
            .lock()
            .get(target)
            .and_then(|entries| entries.get(kind.code()))
        {
            return Ok(Some(admin_tag.clone()));
        }
        let cells = self.storage.read(
            SYSTEM_KEYSPACE,
            REGISTRY_TABLE,
            target.as_bytes(),
            &ClusteringRange::Prefix(CellName::new([kind.code()])),
        )?;
        let admin_tag = cells
            .iter()
            .find(|cell| cell.name.component(1) == Some(ADMIN_TAG))
            .map(|cell| cell.value_str());
        if let Some(admin_tag) = &admin_tag {
            self.cache
                .lock()
                .entry(target.to_string())
                .or_default()
                .insert(kind.code().to_string(), admin_tag.clone());
        }
        Ok(admin_tag)
    }

    pub fn is_enabled(&self, target: &str, kind: &TagKind) -> Result<bool, StorageError> {
        Ok(self.query(target, kind)?.is_some())
    }

    /// Loads every entry of the given targets into the cache. Returns how many
    /// entries were found.
    pub fn hydrate<I, S>(&self, targets: I) -> Result<usize, StorageError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut loaded = 0;
        for target in targets {
            let target = target.as_ref();
            let cells = self.storage.read(
                SYSTEM_KEYSPACE,
                REGISTRY_TABLE,
                target.as_bytes(),
                &ClusteringRange::All,
            )?;
            let mut cache = self.cache.lock();
            for cell in cells {
                if let (Some(code), Some(ADMIN_TAG)) = (cell.name.component(0), cell.name.component(1))
                {
                    cache
                        .entry(target.to_string())
                        .or_default()
                        .insert(code.to_string(), cell.value_str());
                    loaded += 1;
                }
            }
        }
        debug!("event=registry_hydrated entries={}", loaded);
        Ok(loaded)
    }

    /// Forgets cached entries for `target`; the next query reads storage.
    pub fn invalidate(&self, target: &str) {
        if self.cache.lock().remove(target).is_some() {
            debug!("event=registry_invalidated target={}", target);
        }
    }

    #[cfg(test)]
    fn is_cached(&self, target: &str, kind: &TagKind) -> bool {
        self.cache
            .lock()
            .get(target)
            .map(|entries| entries.contains_key(kind.code()))
            .unwrap_or(false)
    }
}
