use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

const METRICS_SHARD_COUNT: usize = 8;

#[derive(Debug, Error, Clone)]
pub enum TelemetryError {
    #[error("metrics shard lock poisoned")]
    ShardPoisoned,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct MetricsShard {
    counters: HashMap<String, Arc<AtomicU64>>,
    gauges: HashMap<String, Arc<AtomicU64>>,
}

/// Namespaced counters and gauges shared across stages. Cloning shares the
/// underlying cells.
#[derive(Debug, Clone)]
pub struct SharedMetricsRegistry {
    prefix: Arc<String>,
    shards: Arc<Vec<Mutex<MetricsShard>>>,
}

impl SharedMetricsRegistry {
    pub fn new(namespace: impl Into<String>) -> Self {
        let raw = namespace.into();
        let prefix = if raw.ends_with('.') {
            raw
        } else {
            format!("{}.", raw)
        };
        let shards = (0..METRICS_SHARD_COUNT)
            .map(|_| Mutex::new(MetricsShard::default()))
            .collect();
        Self {
            prefix: Arc::new(prefix),
            shards: Arc::new(shards),
        }
    }

    pub fn inc_counter(&self, name: impl Into<String>, delta: u64) -> Result<u64, TelemetryError> {
        let key = self.qualify(name.into());
        let cell = {
            let mut guard = self.lock_shard(&key)?;
            guard
                .counters
                .entry(key)
                .or_insert_with(|| Arc::new(AtomicU64::new(0)))
                .clone()
        };
        Ok(atomic_saturating_add(&cell, delta))
    }

    pub fn counter(&self, name: impl Into<String>) -> Result<u64, TelemetryError> {
        let key = self.qualify(name.into());
        let guard = self.lock_shard(&key)?;
        Ok(guard
            .counters
            .get(&key)
            .map(|cell| cell.load(Ordering::Relaxed))
            .unwrap_or(0))
    }

    pub fn set_gauge(&self, name: impl Into<String>, value: u64) -> Result<(), TelemetryError> {
        let key = self.qualify(name.into());
        let cell = {
            let mut guard = self.lock_shard(&key)?;
            guard
                .gauges
                .entry(key)
                .or_insert_with(|| Arc::new(AtomicU64::new(0)))
                .clone()
        };
        cell.store(value, Ordering::Relaxed);
        Ok(())
    }

    pub fn snapshot(&self) -> Result<MetricsSnapshot, TelemetryError> {
        let mut counters = HashMap::new();
        let mut gauges = HashMap::new();
        for shard in self.shards.iter() {
            let guard = shard.lock().map_err(|_| TelemetryError::ShardPoisoned)?;
            for (name, cell) in guard.counters.iter() {
                counters.insert(name.clone(), cell.load(Ordering::Relaxed));
            }
            for (name, cell) in guard.gauges.iter() {
                gauges.insert(name.clone(), cell.load(Ordering::Relaxed));
            }
        }
        Ok(MetricsSnapshot { counters, gauges })
    }

    fn lock_shard(&self, key: &str) -> Result<MutexGuard<'_, MetricsShard>, TelemetryError> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        self.shards[idx]
            .lock()
            .map_err(|_| TelemetryError::ShardPoisoned)
    }

    fn qualify(&self, name: String) -> String {
        if name.starts_with(self.prefix.as_str()) {
            name
        } else {
            format!("{}{}", self.prefix, name)
        }
    }
}

fn atomic_saturating_add(cell: &AtomicU64, delta: u64) -> u64 {
    let mut current = cell.load(Ordering::Relaxed);
    loop {
        let new_value = current.saturating_add(delta);
        match cell.compare_exchange(current, new_value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return new_value,
            Err(actual) => current = actual,
        }
    }
}
