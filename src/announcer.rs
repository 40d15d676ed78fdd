//! Entry point for every metadata change made on this node.
//!
//! DDL is validated against the local schema, merged on the migration stage
//! and, independently, broadcast to every live member. Registry changes take
//! the same broadcast, since any node may coordinate an audited change. Audit
//! entries travel only to the replicas of their partition. The announcer also
//! watches peer schema advertisements and pulls when they diverge from ours.

use crate::membership::{ApplicationState, Endpoint, EndpointStateObserver, Membership};
use crate::messaging::{CURRENT_VERSION, VERSION_117};
use crate::metadata::{ClientIdentity, MetadataLog, MetadataRegistry, TagKind, TagRecord};
use crate::migration::{MigrationTask, PullReceipt, SchemaMerger};
use crate::replication::{route_mutations, ReplicaPush, SchemaBroadcast, WritePath};
use crate::schema::{
    empty_version, KeyspaceDef, MergeReport, ObserverId, SchemaObserver, SchemaStore, TableDef,
};
use crate::stage::{Stage, StageError, TaskScheduler};
use crate::storage::{Mutation, Storage};
use crate::util::{timestamp_micros, ConfigurationError, MetaError};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// What `maybe_schedule_schema_pull` decided for one advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullDecision {
    UpToDate,
    Ineligible,
    Immediate,
    Delayed(Duration),
}

/// Decides when to pull a peer's schema. Right after start (or while we hold
/// no schema at all) pulls go out immediately; later ones wait out
/// `migration_delay` so a schema change in flight has a chance to arrive by
/// push first.
#[derive(Clone)]
pub struct PullScheduler {
    schema: Arc<SchemaStore>,
    membership: Arc<dyn Membership>,
    scheduler: Arc<dyn TaskScheduler>,
    task: MigrationTask,
    migration_delay: Duration,
    started_at: Instant,
}

impl PullScheduler {
    pub fn new(
        schema: Arc<SchemaStore>,
        membership: Arc<dyn Membership>,
        scheduler: Arc<dyn TaskScheduler>,
        task: MigrationTask,
        migration_delay: Duration,
        started_at: Instant,
    ) -> Self {
        Self {
            schema,
            membership,
            scheduler,
            task,
            migration_delay,
            started_at,
        }
    }

    pub fn maybe_schedule_schema_pull(&self, their_version: Uuid, endpoint: Endpoint) -> PullDecision {
        self.maybe_schedule_schema_pull_at(their_version, endpoint, Instant::now())
    }

    pub fn maybe_schedule_schema_pull_at(
        &self,
        their_version: Uuid,
        endpoint: Endpoint,
        now: Instant,
    ) -> PullDecision {
        let ours = self.schema.version();
        if ours == their_version {
            debug!(
                "event=schema_pull_skipped endpoint={} reason=same_version version={}",
                endpoint, ours
            );
            return PullDecision::UpToDate;
        }
        if !self.should_pull_schema_from(&endpoint) {
            debug!(
                "event=schema_pull_skipped endpoint={} reason=ineligible",
                endpoint
            );
            return PullDecision::Ineligible;
        }
        let uptime = now.saturating_duration_since(self.started_at);
        if ours == empty_version() || uptime < self.migration_delay {
            debug!(
                "event=schema_pull_immediate endpoint={} ours={} theirs={}",
                endpoint, ours, their_version
            );
            self.submit_migration_task(endpoint);
            return PullDecision::Immediate;
        }
        let delay = self.migration_delay;
        let pull = self.clone();
        self.scheduler
            .schedule(delay, Box::new(move || pull.fire_delayed_pull(endpoint)));
        debug!(
            "event=schema_pull_scheduled endpoint={} delay_ms={}",
            endpoint,
            delay.as_millis()
        );
        PullDecision::Delayed(delay)
    }

    /// Peers on an unknown or too old protocol, and non-replicating clients,
    /// are never pulled from.
    pub fn should_pull_schema_from(&self, endpoint: &Endpoint) -> bool {
        let version = self.membership.protocol_version(endpoint);
        (VERSION_117..=CURRENT_VERSION).contains(&version)
            && !self.membership.is_non_replicating_client(endpoint)
    }

    pub fn submit_migration_task(&self, endpoint: Endpoint) -> Option<PullReceipt> {
        match self.task.submit(endpoint) {
            Ok(receipt) => Some(receipt),
            Err(err) => {
                warn!(
                    "event=schema_pull_rejected endpoint={} error={}",
                    endpoint, err
                );
                None
            }
        }
    }

    fn fire_delayed_pull(&self, endpoint: Endpoint) {
        if !self.membership.is_alive(&endpoint) {
            debug!(
                "event=schema_pull_skipped endpoint={} reason=not_alive",
                endpoint
            );
            return;
        }
        if !self.should_pull_schema_from(&endpoint) {
            debug!(
                "event=schema_pull_skipped endpoint={} reason=ineligible",
                endpoint
            );
            return;
        }
        match self.membership.schema_version(&endpoint) {
            Some(current) if current != self.schema.version() => {
                self.submit_migration_task(endpoint);
            }
            _ => debug!(
                "event=schema_pull_skipped endpoint={} reason=converged",
                endpoint
            ),
        }
    }
}

pub struct Announcer {
    schema: Arc<SchemaStore>,
    registry: Arc<MetadataRegistry>,
    log: Arc<MetadataLog>,
    broadcast: SchemaBroadcast,
    push: Arc<ReplicaPush>,
    merger: Arc<SchemaMerger>,
    migration_stage: Arc<Stage>,
    membership: Arc<dyn Membership>,
    pulls: PullScheduler,
}

impl Announcer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        schema: Arc<SchemaStore>,
        registry: Arc<MetadataRegistry>,
        log: Arc<MetadataLog>,
        broadcast: SchemaBroadcast,
        push: Arc<ReplicaPush>,
        merger: Arc<SchemaMerger>,
        migration_stage: Arc<Stage>,
        membership: Arc<dyn Membership>,
        pulls: PullScheduler,
    ) -> Self {
        Self {
            schema,
            registry,
            log,
            broadcast,
            push,
            merger,
            migration_stage,
            membership,
            pulls,
        }
    }

    pub fn schema(&self) -> &Arc<SchemaStore> {
        &self.schema
    }

    pub fn pulls(&self) -> &PullScheduler {
        &self.pulls
    }

    pub fn register(&self, observer: Arc<dyn SchemaObserver>) -> ObserverId {
        self.schema.observers().register(observer)
    }

    pub fn unregister(&self, id: ObserverId) -> bool {
        self.schema.observers().unregister(id)
    }

    pub fn announce_new_keyspace(&self, keyspace: &KeyspaceDef) -> Result<(), MetaError> {
        self.announce_new_keyspace_at(keyspace, timestamp_micros())
    }

    pub fn announce_new_keyspace_at(
        &self,
        keyspace: &KeyspaceDef,
        timestamp: i64,
    ) -> Result<(), MetaError> {
        keyspace.validate()?;
        if self.schema.keyspace(&keyspace.name).is_some() {
            return Err(ConfigurationError::KeyspaceExists(keyspace.name.clone()).into());
        }
        info!(
            "event=keyspace_create keyspace={} tables={}",
            keyspace.name,
            keyspace.tables.len()
        );
        self.announce(vec![keyspace.to_schema(timestamp)])?;
        Ok(())
    }

    pub fn announce_new_table(&self, table: &TableDef) -> Result<(), MetaError> {
        table.validate()?;
        if self.schema.keyspace(&table.keyspace).is_none() {
            return Err(ConfigurationError::KeyspaceNotFound(table.keyspace.clone()).into());
        }
        if self.schema.table(&table.keyspace, &table.name).is_some() {
            return Err(ConfigurationError::TableExists {
                keyspace: table.keyspace.clone(),
                table: table.name.clone(),
            }
            .into());
        }
        info!("event=table_create table={}", table.qualified_name());
        self.announce(vec![table.to_schema(timestamp_micros())])?;
        Ok(())
    }

    pub fn announce_keyspace_update(
        &self,
        keyspace: &KeyspaceDef,
        client: Option<&ClientIdentity>,
    ) -> Result<(), MetaError> {
        keyspace.validate()?;
        let old = self
            .schema
            .keyspace(&keyspace.name)
            .ok_or_else(|| ConfigurationError::KeyspaceNotFound(keyspace.name.clone()))?;
        info!("event=keyspace_update keyspace={}", keyspace.name);
        self.announce(vec![old.to_schema_update(keyspace, timestamp_micros())])?;
        let value = format!(
            "Old: {};New: {}",
            old.describe_replication(),
            keyspace.describe_replication()
        );
        self.audit(&keyspace.name, &TagKind::KeyspaceAltered, client, &value);
        Ok(())
    }

    /// Alters a table. Every removed column advances its column-drop record
    /// in the same definitions batch; a column that was already dropped for
    /// good refuses the whole update.
    pub fn announce_table_update(
        &self,
        table: &TableDef,
        client: Option<&ClientIdentity>,
    ) -> Result<(), MetaError> {
        table.validate()?;
        let old = self.schema.table(&table.keyspace, &table.name).ok_or_else(|| {
            ConfigurationError::TableNotFound {
                keyspace: table.keyspace.clone(),
                table: table.name.clone(),
            }
        })?;
        old.validate_compatibility(table)?;

        let timestamp = timestamp_micros();
        let dropped = old.dropped_columns(table);
        let added = old.added_columns(table);
        let mut mutations = vec![old.to_schema_update(table, timestamp)];
        for column in &dropped {
            let mut record = TagRecord::load(
                self.storage().as_ref(),
                TagKind::ColumnDrop,
                &[table.keyspace.as_str(), table.name.as_str(), *column],
            )?;
            mutations.push(record.add_tag(timestamp)?);
        }
        info!(
            "event=table_update table={} added={} dropped={}",
            table.qualified_name(),
            added.len(),
            dropped.len()
        );
        self.announce(mutations)?;

        let target = table.qualified_name();
        self.audit(
            &target,
            &TagKind::TableAltered,
            client,
            &format!("Old: {};New: {}", old, table),
        );
        for column in added {
            let validator = table
                .columns
                .get(column)
                .map(|def| def.validator.as_str())
                .unwrap_or_default();
            self.audit(
                &format!("{}.{}", target, column),
                &TagKind::TableColumnAdded,
                client,
                validator,
            );
        }
        for column in dropped {
            self.audit(
                &format!("{}.{}", target, column),
                &TagKind::TableColumnDropped,
                client,
                "",
            );
        }
        Ok(())
    }

    pub fn announce_keyspace_drop(
        &self,
        name: &str,
        client: Option<&ClientIdentity>,
    ) -> Result<(), MetaError> {
        let old = self
            .schema
            .keyspace(name)
            .ok_or_else(|| ConfigurationError::KeyspaceNotFound(name.to_string()))?;
        info!("event=keyspace_drop keyspace={}", name);
        self.announce(vec![old.drop_from_schema(timestamp_micros())])?;
        self.audit(
            name,
            &TagKind::KeyspaceDropped,
            client,
            &old.describe_replication(),
        );
        Ok(())
    }

    pub fn announce_table_drop(
        &self,
        keyspace: &str,
        table: &str,
        client: Option<&ClientIdentity>,
    ) -> Result<(), MetaError> {
        let old = self.schema.table(keyspace, table).ok_or_else(|| {
            ConfigurationError::TableNotFound {
                keyspace: keyspace.to_string(),
                table: table.to_string(),
            }
        })?;
        info!("event=table_drop table={}", old.qualified_name());
        self.announce(vec![old.drop_from_schema(timestamp_micros())])?;
        self.audit(&old.qualified_name(), &TagKind::TableDropped, client, "");
        Ok(())
    }

    /// Enables auditing of `kind` on `target` cluster-wide. Every live member
    /// gets the entry, since the audit gate is checked on the coordinator.
    pub fn announce_registry_update(
        &self,
        target: &str,
        kind: &TagKind,
        admin_tag: &str,
    ) -> Result<(), MetaError> {
        let mutation = self.registry.add(target, kind, admin_tag)?;
        self.broadcast.send(std::slice::from_ref(&mutation))?;
        Ok(())
    }

    pub fn announce_registry_drop(&self, target: &str) -> Result<(), MetaError> {
        let mutation = self.registry.drop_target(target)?;
        self.broadcast.send(std::slice::from_ref(&mutation))?;
        Ok(())
    }

    pub fn announce_metadata_log(
        &self,
        target: &str,
        kind: &TagKind,
        client: Option<&ClientIdentity>,
        value: &str,
    ) -> Result<bool, MetaError> {
        self.log.announce(target, kind, client, value)
    }

    /// Executes a client batch: metadata-keyspace mutations are pushed to
    /// their replicas, the rest goes through the ordinary write path.
    pub fn execute_mutations(
        &self,
        mutations: Vec<Mutation>,
        write_path: &dyn WritePath,
    ) -> Result<(), MetaError> {
        let routed = route_mutations(mutations);
        if !routed.ordinary.is_empty() {
            write_path.mutate(routed.ordinary)?;
        }
        for mutation in &routed.metadata {
            self.push.push(mutation)?;
        }
        Ok(())
    }

    pub fn passive_announce(&self, version: Uuid) {
        self.membership.advertise_schema_version(version);
        debug!("event=schema_version_advertised version={}", version);
    }

    /// No migration work is queued or running.
    pub fn is_ready_for_bootstrap(&self) -> bool {
        self.migration_stage.in_flight() == 0
    }

    /// Throws away the local schema and pulls it again from the first
    /// eligible live peer. Returns the resulting version, or `None` when no
    /// peer could serve the pull.
    pub fn reset_local_schema(&self, timeout: Duration) -> Result<Option<Uuid>, MetaError> {
        info!("event=schema_reset");
        self.schema.clear()?;
        self.passive_announce(self.schema.version());
        let local = self.membership.local_endpoint();
        let source = self
            .membership
            .live_members()
            .into_iter()
            .find(|endpoint| *endpoint != local && self.pulls.should_pull_schema_from(endpoint));
        let Some(source) = source else {
            warn!("event=schema_reset_no_source");
            return Ok(None);
        };
        let receipt = self.pulls.task.submit(source)?;
        Ok(Some(receipt.wait(timeout)?))
    }

    fn storage(&self) -> &Arc<dyn Storage> {
        self.schema.storage()
    }

    /// Local merge on the migration stage, broadcast to peers, then wait for
    /// the local merge only.
    fn announce(&self, mutations: Vec<Mutation>) -> Result<MergeReport, MetaError> {
        if self.migration_stage.is_worker_thread() {
            return Err(StageError::WouldDeadlock {
                stage: self.migration_stage.name().to_string(),
            }
            .into());
        }
        let merger = self.merger.clone();
        let local = mutations.clone();
        let merge = self.migration_stage.submit(move || merger.merge(&local))?;
        if let Err(err) = self.broadcast.send(&mutations) {
            warn!("event=schema_broadcast_failed error={}", err);
        }
        merge.wait()?
    }

    fn audit(&self, target: &str, kind: &TagKind, client: Option<&ClientIdentity>, value: &str) {
        if let Err(err) = self.log.announce(target, kind, client, value) {
            warn!(
                "event=audit_failed target={} tag={} error={}",
                target, kind, err
            );
        }
    }
}

impl EndpointStateObserver for Announcer {
    fn on_join(&self, endpoint: &Endpoint) {
        if let Some(version) = self.membership.schema_version(endpoint) {
            self.on_alive(endpoint, Some(version));
        }
    }

    fn on_change(&self, endpoint: &Endpoint, state: &ApplicationState, value: &str) {
        if *state != ApplicationState::Schema || *endpoint == self.membership.local_endpoint() {
            return;
        }
        match Uuid::parse_str(value) {
            Ok(version) => {
                self.pulls.maybe_schedule_schema_pull(version, *endpoint);
            }
            Err(err) => warn!(
                "event=schema_advertisement_invalid endpoint={} value={} error={}",
                endpoint, value, err
            ),
        }
    }

    fn on_alive(&self, endpoint: &Endpoint, schema_version: Option<Uuid>) {
        if *endpoint == self.membership.local_endpoint() {
            return;
        }
        if let Some(version) = schema_version {
            self.pulls.maybe_schedule_schema_pull(version, *endpoint);
        }
    }
}
