use super::{KeyspaceDef, TableDef};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A committed schema change, as computed by diffing the state before and
/// after a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaEvent {
    KeyspaceCreated(KeyspaceDef),
    KeyspaceUpdated { old: KeyspaceDef, new: KeyspaceDef },
    KeyspaceDropped(KeyspaceDef),
    TableCreated(TableDef),
    TableUpdated { old: TableDef, new: TableDef },
    TableDropped(TableDef),
}

/// Hooks invoked synchronously, on the merging thread, after each commit.
pub trait SchemaObserver: Send + Sync {
    fn on_create_keyspace(&self, _keyspace: &KeyspaceDef) {}

    fn on_create_table(&self, _table: &TableDef) {}

    fn on_update_keyspace(&self, _keyspace: &KeyspaceDef) {}

    fn on_update_table(&self, _table: &TableDef) {}

    fn on_drop_keyspace(&self, _keyspace: &KeyspaceDef) {}

    fn on_drop_table(&self, _table: &TableDef) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
pub struct SchemaObservers {
    next_id: AtomicU64,
    observers: RwLock<Vec<(ObserverId, Arc<dyn SchemaObserver>)>>,
}

impl SchemaObservers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn SchemaObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, observer));
        id
    }

    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers every event to every observer, in registration order. The
    /// list is snapshotted first so observers may (un)register re-entrantly.
    pub fn notify(&self, events: &[SchemaEvent]) {
        if events.is_empty() {
            return;
        }
        let observers: Vec<Arc<dyn SchemaObserver>> = self
            .observers
            .read()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for event in events {
            for observer in &observers {
                match event {
                    SchemaEvent::KeyspaceCreated(ks) => observer.on_create_keyspace(ks),
                    SchemaEvent::KeyspaceUpdated { new, .. } => observer.on_update_keyspace(new),
                    SchemaEvent::KeyspaceDropped(ks) => observer.on_drop_keyspace(ks),
                    SchemaEvent::TableCreated(table) => observer.on_create_table(table),
                    SchemaEvent::TableUpdated { new, .. } => observer.on_update_table(new),
                    SchemaEvent::TableDropped(table) => observer.on_drop_table(table),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl SchemaObserver for Recorder {
        fn on_create_keyspace(&self, keyspace: &KeyspaceDef) {
            self.seen.lock().push(format!("create:{}", keyspace.name));
        }

        fn on_drop_table(&self, table: &TableDef) {
            self.seen.lock().push(format!("drop:{}", table.qualified_name()));
        }
    }

    #[test]
    fn unregistered_observers_stop_receiving_events() {
        let observers = SchemaObservers::new();
        let recorder = Arc::new(Recorder::default());
        let id = observers.register(recorder.clone());
        observers.notify(&[
            SchemaEvent::KeyspaceCreated(KeyspaceDef::simple("app", 1)),
            SchemaEvent::TableDropped(TableDef::new("app", "users")),
        ]);
        assert!(observers.unregister(id));
        assert!(!observers.unregister(id));
        observers.notify(&[SchemaEvent::KeyspaceCreated(KeyspaceDef::simple("b", 1))]);
        assert_eq!(
            *recorder.seen.lock(),
            vec!["create:app".to_string(), "drop:app.users".to_string()]
        );
    }
}
