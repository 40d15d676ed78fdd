//! Schema migration plumbing: merging pushed definitions, answering pull
//! requests, and pulling a peer's full schema.

use crate::membership::{Endpoint, Membership};
use crate::messaging::{MessageIn, MessageOut, MessagingService, Verb};
use crate::metadata::MetadataRegistry;
use crate::schema::{MergeReport, SchemaStore};
use crate::stage::{Stage, StageError, TaskScheduler};
use crate::storage::Mutation;
use crate::util::MetaError;
use crate::wire;
use log::{debug, error, info, warn};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Applies definition batches to the local schema. Callers run it on the
/// migration stage so merges never interleave.
pub struct SchemaMerger {
    schema: Arc<SchemaStore>,
    registry: Arc<MetadataRegistry>,
    membership: Arc<dyn Membership>,
}

impl SchemaMerger {
    pub fn new(
        schema: Arc<SchemaStore>,
        registry: Arc<MetadataRegistry>,
        membership: Arc<dyn Membership>,
    ) -> Self {
        Self {
            schema,
            registry,
            membership,
        }
    }

    pub fn schema(&self) -> &Arc<SchemaStore> {
        &self.schema
    }

    /// Merges `mutations`, drops stale registry cache entries and advertises
    /// the resulting version.
    pub fn merge(&self, mutations: &[Mutation]) -> Result<MergeReport, MetaError> {
        let report = match self.schema.merge_schema(mutations) {
            Ok(report) => report,
            Err(err) => {
                error!(
                    "event=schema_merge_failed mutations={} error={}",
                    mutations.len(),
                    err
                );
                return Err(err.into());
            }
        };
        for target in &report.registry_targets {
            self.registry.invalidate(target);
        }
        self.membership.advertise_schema_version(report.version);
        debug!(
            "event=schema_merged mutations={} changes={} version={}",
            mutations.len(),
            report.events.len(),
            report.version
        );
        Ok(report)
    }
}

/// DEFINITIONS_UPDATE: a peer pushed schema or metadata mutations.
pub struct DefinitionsUpdateHandler {
    merger: Arc<SchemaMerger>,
}

impl DefinitionsUpdateHandler {
    pub fn new(merger: Arc<SchemaMerger>) -> Self {
        Self { merger }
    }

    pub fn do_verb(&self, message: &MessageIn) -> Result<(), MetaError> {
        let mutations = wire::decode_definitions(&message.payload, message.version)?;
        debug!(
            "event=definitions_received from={} mutations={}",
            message.from,
            mutations.len()
        );
        self.merger.merge(&mutations)?;
        Ok(())
    }
}

/// MIGRATION_REQUEST: reply with every live row of the schema tables.
pub struct MigrationRequestHandler {
    schema: Arc<SchemaStore>,
    messaging: Arc<MessagingService>,
}

impl MigrationRequestHandler {
    pub fn new(schema: Arc<SchemaStore>, messaging: Arc<MessagingService>) -> Self {
        Self { schema, messaging }
    }

    pub fn do_verb(&self, message: &MessageIn, id: &str) -> Result<(), MetaError> {
        let mutations = self.schema.serialize_schema()?;
        let payload = wire::encode_definitions(&mutations, self.messaging.current_version())?;
        debug!(
            "event=migration_request_served to={} mutations={}",
            message.from,
            mutations.len()
        );
        let response = MessageOut::new(Verb::RequestResponse, payload);
        self.messaging.send_reply(&response, id, &message.from);
        Ok(())
    }
}

type PullResult = Result<Uuid, MetaError>;

/// Pulls the complete schema of one peer and merges it locally.
#[derive(Clone)]
pub struct MigrationTask {
    messaging: Arc<MessagingService>,
    migration_stage: Arc<Stage>,
    merger: Arc<SchemaMerger>,
    scheduler: Arc<dyn TaskScheduler>,
    request_timeout: Duration,
}

impl MigrationTask {
    pub fn new(
        messaging: Arc<MessagingService>,
        migration_stage: Arc<Stage>,
        merger: Arc<SchemaMerger>,
        scheduler: Arc<dyn TaskScheduler>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            messaging,
            migration_stage,
            merger,
            scheduler,
            request_timeout,
        }
    }

    /// Queues the pull on the migration stage. The returned receipt resolves
    /// once the peer's schema has been merged.
    pub fn submit(&self, endpoint: Endpoint) -> Result<PullReceipt, StageError> {
        let (sender, receiver) = mpsc::sync_channel(1);
        let task = self.clone();
        self.migration_stage
            .execute(move || task.request(endpoint, sender))?;
        Ok(PullReceipt { endpoint, receiver })
    }

    fn request(&self, endpoint: Endpoint, done: SyncSender<PullResult>) {
        let stage = self.migration_stage.clone();
        let merger = self.merger.clone();
        let request = MessageOut::new(Verb::MigrationRequest, Vec::new());
        let id = self.messaging.send_rr(&request, &endpoint, move |response| {
            let mutations = match wire::decode_definitions(&response.payload, response.version) {
                Ok(mutations) => mutations,
                Err(err) => {
                    warn!(
                        "event=migration_response_invalid from={} error={}",
                        response.from, err
                    );
                    let _ = done.send(Err(err.into()));
                    return;
                }
            };
            let from = response.from;
            let merge = move || {
                let outcome = merger.merge(&mutations).map(|report| report.version);
                if let Ok(version) = &outcome {
                    info!(
                        "event=schema_pulled from={} mutations={} version={}",
                        from,
                        mutations.len(),
                        version
                    );
                }
                let _ = done.send(outcome);
            };
            if let Err(err) = stage.execute(merge) {
                warn!(
                    "event=migration_merge_rejected from={} error={}",
                    from, err
                );
            }
        });
        debug!("event=migration_requested to={} id={}", endpoint, id);

        let messaging = self.messaging.clone();
        self.scheduler.schedule(
            self.request_timeout,
            Box::new(move || {
                if messaging.expire_callback(&id) {
                    warn!(
                        "event=migration_request_expired to={} id={}",
                        endpoint, id
                    );
                }
            }),
        );
    }
}

/// Completion handle for one schema pull.
pub struct PullReceipt {
    endpoint: Endpoint,
    receiver: Receiver<PullResult>,
}

impl PullReceipt {
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Blocks until the pulled schema is merged and returns the new local
    /// version.
    pub fn wait(self, timeout: Duration) -> Result<Uuid, MetaError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(StageError::Timeout {
                stage: "migration".into(),
                waited_ms: timeout.as_millis(),
            }
            .into()),
            Err(RecvTimeoutError::Disconnected) => Err(MetaError::Other(format!(
                "schema pull from {} was abandoned",
                self.endpoint
            ))),
        }
    }
}
