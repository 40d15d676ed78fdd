use super::defs::{
    COLUMN_KIND, COLUMN_VALIDATOR, DURABLE_WRITES, MARKER, STRATEGY_CLASS, STRATEGY_OPTIONS,
    TABLE_COMMENT, TABLE_ID,
};
use super::{
    is_schema_table, ColumnDef, ColumnKind, KeyspaceDef, SchemaEvent, SchemaObservers, TableDef,
    SCHEMA_COLUMNFAMILIES_TABLE, SCHEMA_COLUMNS_TABLE, SCHEMA_KEYSPACES_TABLE, SCHEMA_TABLES,
    SYSTEM_KEYSPACE,
};
use crate::metadata::REGISTRY_TABLE;
use crate::storage::{ClusteringRange, Mutation, Storage};
use crate::util::StorageError;
use log::{debug, info};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

/// Version of a node that holds no schema at all.
pub fn empty_version() -> Uuid {
    digest_to_uuid(&Sha256::new().finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub events: Vec<SchemaEvent>,
    pub version: Uuid,
    /// Registry partitions touched by the merge; their cache entries are stale.
    pub registry_targets: BTreeSet<String>,
}

struct SchemaState {
    keyspaces: BTreeMap<String, KeyspaceDef>,
    version: Uuid,
}

/// In-memory view of the schema tables. Every change goes through
/// `merge_schema`, which applies the mutations, reloads the touched keyspaces,
/// diffs them against the previous state and notifies observers.
pub struct SchemaStore {
    storage: Arc<dyn Storage>,
    state: RwLock<SchemaState>,
    observers: SchemaObservers,
}

impl SchemaStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            state: RwLock::new(SchemaState {
                keyspaces: BTreeMap::new(),
                version: empty_version(),
            }),
            observers: SchemaObservers::new(),
        }
    }

    /// Builds the store from whatever the schema tables already hold.
    pub fn load(storage: Arc<dyn Storage>) -> Result<Self, StorageError> {
        let store = Self::new(storage);
        store.reload()?;
        Ok(store)
    }

    pub fn reload(&self) -> Result<(), StorageError> {
        let mut state = self.state.write();
        let mut keyspaces = BTreeMap::new();
        for key in self
            .storage
            .partition_keys(SYSTEM_KEYSPACE, SCHEMA_KEYSPACES_TABLE)?
        {
            let name = String::from_utf8_lossy(&key).into_owned();
            if let Some(keyspace) = load_keyspace(self.storage.as_ref(), &name)? {
                keyspaces.insert(name, keyspace);
            }
        }
        state.keyspaces = keyspaces;
        state.version = compute_version(self.storage.as_ref())?;
        debug!(
            "event=schema_loaded keyspaces={} version={}",
            state.keyspaces.len(),
            state.version
        );
        Ok(())
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn observers(&self) -> &SchemaObservers {
        &self.observers
    }

    pub fn version(&self) -> Uuid {
        self.state.read().version
    }

    pub fn keyspace(&self, name: &str) -> Option<KeyspaceDef> {
        self.state.read().keyspaces.get(name).cloned()
    }

    pub fn table(&self, keyspace: &str, table: &str) -> Option<TableDef> {
        self.state
            .read()
            .keyspaces
            .get(keyspace)
            .and_then(|ks| ks.tables.get(table))
            .cloned()
    }

    pub fn keyspace_names(&self) -> Vec<String> {
        self.state.read().keyspaces.keys().cloned().collect()
    }

    /// Applies `mutations` and recomputes the schema from storage. Mutations
    /// for non-schema tables (registry, tags, log) are applied as-is.
    pub fn merge_schema(&self, mutations: &[Mutation]) -> Result<MergeReport, StorageError> {
        let mut touched = BTreeSet::new();
        let mut registry_targets = BTreeSet::new();
        for mutation in mutations {
            if mutation.keyspace() == SYSTEM_KEYSPACE {
                if mutation.tables().any(is_schema_table) {
                    touched.insert(mutation.key_string());
                }
                if mutation.family(REGISTRY_TABLE).is_some() {
                    registry_targets.insert(mutation.key_string());
                }
            }
        }

        let (events, version) = {
            let mut state = self.state.write();
            for mutation in mutations {
                self.storage.apply(mutation)?;
            }
            let mut events = Vec::new();
            for name in &touched {
                let old = state.keyspaces.get(name).cloned();
                let new = load_keyspace(self.storage.as_ref(), name)?;
                diff_keyspace(old.as_ref(), new.as_ref(), &mut events);
                match new {
                    Some(keyspace) => {
                        state.keyspaces.insert(name.clone(), keyspace);
                    }
                    None => {
                        state.keyspaces.remove(name);
                    }
                }
            }
            if !touched.is_empty() {
                state.version = compute_version(self.storage.as_ref())?;
            }
            (events, state.version)
        };

        if !touched.is_empty() {
            info!(
                "event=schema_merged mutations={} keyspaces={} changes={} version={}",
                mutations.len(),
                touched.len(),
                events.len(),
                version
            );
        }
        self.observers.notify(&events);
        Ok(MergeReport {
            events,
            version,
            registry_targets,
        })
    }

    /// Every live schema cell, one mutation per keyspace partition, with the
    /// original write timestamps. This is the payload of a pull response.
    pub fn serialize_schema(&self) -> Result<Vec<Mutation>, StorageError> {
        let _state = self.state.read();
        let mut partitions: BTreeMap<Vec<u8>, Mutation> = BTreeMap::new();
        for table in SCHEMA_TABLES {
            for key in self.storage.partition_keys(SYSTEM_KEYSPACE, table)? {
                let cells = self
                    .storage
                    .read(SYSTEM_KEYSPACE, table, &key, &ClusteringRange::All)?;
                let mutation = partitions
                    .entry(key.clone())
                    .or_insert_with(|| Mutation::new(SYSTEM_KEYSPACE, key.clone()));
                let family = mutation.add_or_get(table);
                for cell in cells {
                    family.add_column(cell.name, cell.value, cell.timestamp);
                }
            }
        }
        Ok(partitions.into_values().collect())
    }

    /// Drops every schema table and the in-memory schema. Observers are not
    /// notified; the caller is about to re-pull.
    pub fn clear(&self) -> Result<(), StorageError> {
        let mut state = self.state.write();
        for table in SCHEMA_TABLES {
            self.storage.truncate(SYSTEM_KEYSPACE, table)?;
        }
        state.keyspaces.clear();
        state.version = empty_version();
        info!("event=schema_cleared version={}", state.version);
        Ok(())
    }
}

fn diff_keyspace(
    old: Option<&KeyspaceDef>,
    new: Option<&KeyspaceDef>,
    events: &mut Vec<SchemaEvent>,
) {
    match (old, new) {
        (None, Some(new)) => {
            events.push(SchemaEvent::KeyspaceCreated(new.clone()));
            for table in new.tables.values() {
                events.push(SchemaEvent::TableCreated(table.clone()));
            }
        }
        (Some(old), None) => {
            for table in old.tables.values() {
                events.push(SchemaEvent::TableDropped(table.clone()));
            }
            events.push(SchemaEvent::KeyspaceDropped(old.clone()));
        }
        (Some(old), Some(new)) => {
            if old.attributes_differ(new) {
                events.push(SchemaEvent::KeyspaceUpdated {
                    old: old.clone(),
                    new: new.clone(),
                });
            }
            for (name, table) in &new.tables {
                match old.tables.get(name) {
                    None => events.push(SchemaEvent::TableCreated(table.clone())),
                    Some(previous) if previous != table => {
                        events.push(SchemaEvent::TableUpdated {
                            old: previous.clone(),
                            new: table.clone(),
                        })
                    }
                    Some(_) => {}
                }
            }
            for (name, table) in &old.tables {
                if !new.tables.contains_key(name) {
                    events.push(SchemaEvent::TableDropped(table.clone()));
                }
            }
        }
        (None, None) => {}
    }
}

fn malformed(table: &str, detail: impl Into<String>) -> StorageError {
    StorageError::Malformed {
        table: table.to_string(),
        detail: detail.into(),
    }
}

pub(crate) fn load_keyspace(
    storage: &dyn Storage,
    name: &str,
) -> Result<Option<KeyspaceDef>, StorageError> {
    let cells = storage.read(
        SYSTEM_KEYSPACE,
        SCHEMA_KEYSPACES_TABLE,
        name.as_bytes(),
        &ClusteringRange::All,
    )?;
    let mut present = false;
    let mut keyspace = KeyspaceDef::new(name, String::new(), BTreeMap::new(), true);
    for cell in &cells {
        match cell.name.component(0) {
            Some(MARKER) => present = true,
            Some(DURABLE_WRITES) => keyspace.durable_writes = cell.value == b"true",
            Some(STRATEGY_CLASS) => keyspace.strategy_class = cell.value_str(),
            Some(STRATEGY_OPTIONS) => {
                keyspace.strategy_options = serde_json::from_slice(&cell.value).map_err(|err| {
                    malformed(
                        SCHEMA_KEYSPACES_TABLE,
                        format!("strategy options of '{}': {}", name, err),
                    )
                })?;
            }
            _ => {}
        }
    }
    if !present {
        return Ok(None);
    }
    keyspace.tables = load_tables(storage, name)?;
    Ok(Some(keyspace))
}

fn load_tables(
    storage: &dyn Storage,
    keyspace: &str,
) -> Result<BTreeMap<String, TableDef>, StorageError> {
    let cells = storage.read(
        SYSTEM_KEYSPACE,
        SCHEMA_COLUMNFAMILIES_TABLE,
        keyspace.as_bytes(),
        &ClusteringRange::All,
    )?;
    let mut markers = BTreeSet::new();
    let mut tables: BTreeMap<String, TableDef> = BTreeMap::new();
    for cell in &cells {
        let (Some(table), Some(leaf)) = (cell.name.component(0), cell.name.component(1)) else {
            continue;
        };
        let def = tables
            .entry(table.to_string())
            .or_insert_with(|| TableDef::new(keyspace, table));
        match leaf {
            MARKER => {
                markers.insert(table.to_string());
            }
            TABLE_ID => {
                def.id = Uuid::parse_str(&cell.value_str()).map_err(|err| {
                    malformed(
                        SCHEMA_COLUMNFAMILIES_TABLE,
                        format!("id of {}.{}: {}", keyspace, table, err),
                    )
                })?;
            }
            TABLE_COMMENT => def.comment = cell.value_str(),
            _ => {}
        }
    }
    tables.retain(|name, _| markers.contains(name));

    let cells = storage.read(
        SYSTEM_KEYSPACE,
        SCHEMA_COLUMNS_TABLE,
        keyspace.as_bytes(),
        &ClusteringRange::All,
    )?;
    let mut columns: BTreeMap<(String, String), (bool, ColumnDef)> = BTreeMap::new();
    for cell in &cells {
        let (Some(table), Some(column), Some(leaf)) = (
            cell.name.component(0),
            cell.name.component(1),
            cell.name.component(2),
        ) else {
            continue;
        };
        let entry = columns
            .entry((table.to_string(), column.to_string()))
            .or_insert_with(|| {
                (
                    false,
                    ColumnDef {
                        name: column.to_string(),
                        validator: String::new(),
                        kind: ColumnKind::Regular,
                    },
                )
            });
        match leaf {
            MARKER => entry.0 = true,
            COLUMN_VALIDATOR => entry.1.validator = cell.value_str(),
            COLUMN_KIND => {
                entry.1.kind = ColumnKind::parse(&cell.value_str()).ok_or_else(|| {
                    malformed(
                        SCHEMA_COLUMNS_TABLE,
                        format!("kind of {}.{}.{}", keyspace, table, column),
                    )
                })?;
            }
            _ => {}
        }
    }
    for ((table, column), (present, def)) in columns {
        if !present {
            continue;
        }
        if let Some(table) = tables.get_mut(&table) {
            table.columns.insert(column, def);
        }
    }
    Ok(tables)
}

/// Digest of every live schema cell's partition, name and value. Timestamps
/// are excluded so nodes holding the same definitions agree.
fn compute_version(storage: &dyn Storage) -> Result<Uuid, StorageError> {
    let mut hasher = Sha256::new();
    for table in SCHEMA_TABLES {
        let mut keys = storage.partition_keys(SYSTEM_KEYSPACE, table)?;
        keys.sort();
        for key in keys {
            let cells = storage.read(SYSTEM_KEYSPACE, table, &key, &ClusteringRange::All)?;
            if cells.is_empty() {
                continue;
            }
            hasher.update(table.as_bytes());
            hasher.update((key.len() as u32).to_be_bytes());
            hasher.update(&key);
            for cell in cells {
                for component in cell.name.components() {
                    hasher.update((component.len() as u32).to_be_bytes());
                    hasher.update(component.as_bytes());
                }
                hasher.update((cell.value.len() as u32).to_be_bytes());
                hasher.update(&cell.value);
            }
        }
    }
    Ok(digest_to_uuid(&hasher.finalize()))
}

fn digest_to_uuid(digest: &[u8]) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn store() -> SchemaStore {
        SchemaStore::new(Arc::new(MemoryStorage::new()))
    }

    fn app() -> KeyspaceDef {
        KeyspaceDef::simple("app", 3).with_table(
            TableDef::new("app", "users")
                .with_column("id", "UUIDType", ColumnKind::PartitionKey)
                .with_column("email", "UTF8Type", ColumnKind::Regular),
        )
    }

    #[test]
    fn merge_reports_creation_and_moves_the_version() {
        let store = store();
        assert_eq!(store.version(), empty_version());
        let ks = app();
        let report = store.merge_schema(&[ks.to_schema(10)]).unwrap();
        assert_eq!(report.events.len(), 2);
        assert!(matches!(report.events[0], SchemaEvent::KeyspaceCreated(_)));
        assert_ne!(report.version, empty_version());
        assert_eq!(store.keyspace("app"), Some(ks));
    }

    #[test]
    fn identical_schema_yields_identical_version_regardless_of_timestamps() {
        let left = store();
        let right = store();
        let ks = app();
        left.merge_schema(&[ks.to_schema(10)]).unwrap();
        right.merge_schema(&[ks.to_schema(99)]).unwrap();
        assert_eq!(left.version(), right.version());
    }

    #[test]
    fn dropped_table_and_column_disappear_after_merge() {
        let store = store();
        let ks = app();
        store.merge_schema(&[ks.to_schema(10)]).unwrap();
        let users = ks.tables["users"].clone();
        let slimmer = users.clone().without_column("email");
        let report = store
            .merge_schema(&[users.to_schema_update(&slimmer, 20)])
            .unwrap();
        assert!(matches!(report.events[0], SchemaEvent::TableUpdated { .. }));
        assert_eq!(store.table("app", "users"), Some(slimmer.clone()));

        let report = store.merge_schema(&[slimmer.drop_from_schema(30)]).unwrap();
        assert!(matches!(report.events[0], SchemaEvent::TableDropped(_)));
        assert!(store.table("app", "users").is_none());
        assert!(store.keyspace("app").is_some());
    }

    #[test]
    fn serialized_schema_rebuilds_an_equal_peer() {
        let source = store();
        source.merge_schema(&[app().to_schema(10)]).unwrap();
        let peer = store();
        peer.merge_schema(&source.serialize_schema().unwrap())
            .unwrap();
        assert_eq!(peer.version(), source.version());
        assert_eq!(peer.keyspace("app"), source.keyspace("app"));
    }

    #[test]
    fn clear_resets_to_the_empty_version() {
        let store = store();
        store.merge_schema(&[app().to_schema(10)]).unwrap();
        store.clear().unwrap();
        assert_eq!(store.version(), empty_version());
        assert!(store.keyspace_names().is_empty());
        let reloaded = SchemaStore::load(store.storage().clone()).unwrap();
        assert_eq!(reloaded.version(), empty_version());
    }
}
