//! Inbound message routing: every verb runs on its own stage, wrapped so that
//! work which waited past the verb's timeout is dropped instead of executed.

use crate::config::MetaConfig;
use crate::executor::{DroppableTask, TaskOutcome};
use crate::forwarder::MutationVerbHandler;
use crate::messaging::{MessageIn, MessagingService, Verb};
use crate::migration::{DefinitionsUpdateHandler, MigrationRequestHandler};
use crate::stage::{Stage, StageError};
use crate::telemetry::{SharedMetricsRegistry, TelemetryError};
use crate::util::MetaError;
use log::{debug, warn};
use std::sync::Arc;

/// Anything that accepts inbound envelopes from a transport.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, message: MessageIn, id: String);
}

/// The stages a node runs inbound work on.
#[derive(Clone)]
pub struct Stages {
    pub migration: Arc<Stage>,
    pub mutation: Arc<Stage>,
    pub response: Arc<Stage>,
}

impl Stages {
    pub fn start(config: &MetaConfig) -> Result<Self, StageError> {
        Ok(Self {
            migration: Arc::new(Stage::new("migration", 1)?),
            mutation: Arc::new(Stage::new("mutation", config.mutation_workers)?),
            response: Arc::new(Stage::new("request-response", config.mutation_workers)?),
        })
    }

    /// Publishes each stage's queued-or-running count as
    /// `stage.<name>.in_flight`.
    pub fn publish_gauges(&self, metrics: &SharedMetricsRegistry) -> Result<(), TelemetryError> {
        for stage in [&self.migration, &self.mutation, &self.response] {
            metrics.set_gauge(
                format!("stage.{}.in_flight", stage.name()),
                stage.in_flight() as u64,
            )?;
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.migration.shutdown();
        self.mutation.shutdown();
        self.response.shutdown();
    }
}

pub struct Dispatcher {
    config: MetaConfig,
    messaging: Arc<MessagingService>,
    stages: Stages,
    mutation: Arc<MutationVerbHandler>,
    definitions: Arc<DefinitionsUpdateHandler>,
    migration_requests: Arc<MigrationRequestHandler>,
}

impl Dispatcher {
    pub fn new(
        config: MetaConfig,
        messaging: Arc<MessagingService>,
        stages: Stages,
        mutation: Arc<MutationVerbHandler>,
        definitions: Arc<DefinitionsUpdateHandler>,
        migration_requests: Arc<MigrationRequestHandler>,
    ) -> Self {
        Self {
            config,
            messaging,
            stages,
            mutation,
            definitions,
            migration_requests,
        }
    }

    /// Queues `message` on its verb's stage. Returns once the work is queued.
    pub fn dispatch(&self, message: MessageIn, id: String) -> Result<(), StageError> {
        let verb = message.verb;
        let (stage, task) = match verb {
            Verb::Mutation => {
                let handler = self.mutation.clone();
                (
                    &self.stages.mutation,
                    DroppableTask::new(verb, move || handler.do_verb(&message, &id)),
                )
            }
            Verb::DefinitionsUpdate => {
                let handler = self.definitions.clone();
                (
                    &self.stages.migration,
                    DroppableTask::new(verb, move || handler.do_verb(&message)),
                )
            }
            Verb::MigrationRequest => {
                let handler = self.migration_requests.clone();
                (
                    &self.stages.migration,
                    DroppableTask::new(verb, move || handler.do_verb(&message, &id)),
                )
            }
            Verb::RequestResponse => {
                let messaging = self.messaging.clone();
                (
                    &self.stages.response,
                    DroppableTask::new(verb, move || route_response(&messaging, message, &id)),
                )
            }
        };
        let timeout = self.config.timeout_for(verb);
        let dropped = self.messaging.dropped().clone();
        stage.execute(move || {
            if task.run(timeout, &dropped) == TaskOutcome::Dropped {
                debug!("event=inbound_dropped verb={}", verb);
            }
        })
    }
}

fn route_response(messaging: &MessagingService, message: MessageIn, id: &str) -> Result<(), MetaError> {
    let from = message.from;
    if !messaging.deliver_response(id, message) {
        debug!("event=response_unclaimed id={} from={}", id, from);
    }
    Ok(())
}

impl MessageSink for Dispatcher {
    fn deliver(&self, message: MessageIn, id: String) {
        let verb = message.verb;
        if let Err(err) = self.dispatch(message, id) {
            warn!("event=inbound_rejected verb={} error={}", verb, err);
        }
    }
}
