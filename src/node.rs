//! Composition root: builds and owns every metadata component of one node.

use crate::announcer::{Announcer, PullScheduler};
use crate::config::{ConfigError, MetaConfig};
use crate::dispatch::{Dispatcher, MessageSink, Stages};
use crate::forwarder::MutationVerbHandler;
use crate::membership::{Endpoint, Membership, ReplicaTopology};
use crate::messaging::{MessageIn, MessagingService, Transport, Verb};
use crate::metadata::{MetadataLog, MetadataRegistry};
use crate::migration::{
    DefinitionsUpdateHandler, MigrationRequestHandler, MigrationTask, SchemaMerger,
};
use crate::replication::{ReplicaPush, SchemaBroadcast};
use crate::schema::SchemaStore;
use crate::stage::{TaskScheduler, ThreadScheduler};
use crate::storage::Storage;
use crate::telemetry::{MetricsSnapshot, SharedMetricsRegistry, TelemetryError};
use crate::util::MetaError;
use log::info;
use std::sync::Arc;
use std::time::Instant;

pub struct MetadataNodeBuilder {
    config: MetaConfig,
    storage: Option<Arc<dyn Storage>>,
    membership: Option<Arc<dyn Membership>>,
    topology: Option<Arc<dyn ReplicaTopology>>,
    transport: Option<Arc<dyn Transport>>,
    scheduler: Option<Arc<dyn TaskScheduler>>,
    started_at: Option<Instant>,
    metrics: Option<SharedMetricsRegistry>,
}

impl MetadataNodeBuilder {
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn membership(mut self, membership: Arc<dyn Membership>) -> Self {
        self.membership = Some(membership);
        self
    }

    pub fn topology(mut self, topology: Arc<dyn ReplicaTopology>) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replaces the background scheduler used for delayed pulls and request
    /// expiry.
    pub fn scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Backdates the node's start, which decides whether catch-up pulls go
    /// out immediately or after the migration delay.
    pub fn started_at(mut self, started_at: Instant) -> Self {
        self.started_at = Some(started_at);
        self
    }

    pub fn metrics(mut self, metrics: SharedMetricsRegistry) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn start(self) -> Result<MetadataNode, MetaError> {
        self.config.validate()?;
        let storage = required(self.storage, "storage")?;
        let membership = required(self.membership, "membership")?;
        let topology = required(self.topology, "topology")?;
        let transport = required(self.transport, "transport")?;
        let metrics = self
            .metrics
            .unwrap_or_else(|| SharedMetricsRegistry::new("metaprop"));
        let local = membership.local_endpoint();

        let (scheduler, owned_scheduler) = match self.scheduler {
            Some(scheduler) => (scheduler, None),
            None => {
                let owned = Arc::new(ThreadScheduler::new("metadata-scheduler")?);
                (owned.clone() as Arc<dyn TaskScheduler>, Some(owned))
            }
        };

        let messaging = Arc::new(MessagingService::new(local, transport, metrics.clone()));
        let schema = Arc::new(SchemaStore::load(storage.clone())?);
        let registry = Arc::new(MetadataRegistry::new(storage.clone()));
        registry.hydrate(&self.config.audit.hydrate_targets)?;
        let push = Arc::new(ReplicaPush::new(
            messaging.clone(),
            membership.clone(),
            topology,
        ));
        let log = Arc::new(MetadataLog::new(registry.clone(), push.clone()));
        let merger = Arc::new(SchemaMerger::new(
            schema.clone(),
            registry.clone(),
            membership.clone(),
        ));

        let stages = Stages::start(&self.config)?;
        let task = MigrationTask::new(
            messaging.clone(),
            stages.migration.clone(),
            merger.clone(),
            scheduler.clone(),
            self.config.timeout_for(Verb::MigrationRequest),
        );
        let pulls = PullScheduler::new(
            schema.clone(),
            membership.clone(),
            scheduler.clone(),
            task,
            self.config.migration_delay(),
            self.started_at.unwrap_or_else(Instant::now),
        );
        let announcer = Arc::new(Announcer::new(
            schema.clone(),
            registry.clone(),
            log.clone(),
            SchemaBroadcast::new(messaging.clone(), membership.clone()),
            push,
            merger.clone(),
            stages.migration.clone(),
            membership,
            pulls,
        ));

        let mut mutation_handler = MutationVerbHandler::new(storage, messaging.clone());
        if self.config.audit.row_mutations {
            mutation_handler = mutation_handler.with_row_audit(log.clone());
        }
        let dispatcher = Arc::new(Dispatcher::new(
            self.config.clone(),
            messaging.clone(),
            stages.clone(),
            Arc::new(mutation_handler),
            Arc::new(DefinitionsUpdateHandler::new(merger)),
            Arc::new(MigrationRequestHandler::new(schema.clone(), messaging.clone())),
        ));

        announcer.passive_announce(schema.version());
        info!(
            "event=metadata_node_started endpoint={} version={} keyspaces={}",
            local,
            schema.version(),
            schema.keyspace_names().len()
        );
        Ok(MetadataNode {
            local,
            config: self.config,
            schema,
            registry,
            log,
            announcer,
            dispatcher,
            messaging,
            stages,
            owned_scheduler,
            metrics,
        })
    }
}

fn required<T>(value: Option<T>, what: &str) -> Result<T, MetaError> {
    value.ok_or_else(|| ConfigError::Invalid(format!("{} is required", what)).into())
}

/// One node's metadata subsystem.
pub struct MetadataNode {
    local: Endpoint,
    config: MetaConfig,
    schema: Arc<SchemaStore>,
    registry: Arc<MetadataRegistry>,
    log: Arc<MetadataLog>,
    announcer: Arc<Announcer>,
    dispatcher: Arc<Dispatcher>,
    messaging: Arc<MessagingService>,
    stages: Stages,
    owned_scheduler: Option<Arc<ThreadScheduler>>,
    metrics: SharedMetricsRegistry,
}

impl MetadataNode {
    pub fn builder(config: MetaConfig) -> MetadataNodeBuilder {
        MetadataNodeBuilder {
            config,
            storage: None,
            membership: None,
            topology: None,
            transport: None,
            scheduler: None,
            started_at: None,
            metrics: None,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.local
    }

    pub fn config(&self) -> &MetaConfig {
        &self.config
    }

    pub fn schema(&self) -> &Arc<SchemaStore> {
        &self.schema
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    pub fn metadata_log(&self) -> &Arc<MetadataLog> {
        &self.log
    }

    pub fn announcer(&self) -> &Arc<Announcer> {
        &self.announcer
    }

    pub fn messaging(&self) -> &Arc<MessagingService> {
        &self.messaging
    }

    /// Inbound side to hand to the transport.
    pub fn sink(&self) -> Arc<dyn MessageSink> {
        self.dispatcher.clone()
    }

    pub fn metrics(&self) -> &SharedMetricsRegistry {
        &self.metrics
    }

    /// Counters plus stage gauges sampled at the time of the call.
    pub fn metrics_snapshot(&self) -> Result<MetricsSnapshot, TelemetryError> {
        self.stages.publish_gauges(&self.metrics)?;
        self.metrics.snapshot()
    }

    pub fn receive(&self, message: MessageIn, id: String) -> Result<(), MetaError> {
        self.dispatcher.dispatch(message, id)?;
        Ok(())
    }

    /// Drains and joins every stage, then stops the owned scheduler.
    pub fn shutdown(&self) {
        self.stages.shutdown();
        if let Some(scheduler) = &self.owned_scheduler {
            scheduler.shutdown();
        }
        info!("event=metadata_node_stopped endpoint={}", self.local);
    }
}
