//! Schema and metadata propagation for a replicated storage cluster.
//!
//! Schema changes are merged locally on a serialized stage and broadcast to
//! every live member; audit records and registry entries are pushed only to
//! the replicas of their partition. Peers that fall behind catch up by
//! pulling the full schema.

pub mod announcer;
pub mod config;
pub mod dispatch;
pub mod executor;
pub mod forwarder;
pub mod local;
pub mod membership;
pub mod messaging;
pub mod metadata;
pub mod migration;
pub mod node;
pub mod replication;
pub mod schema;
pub mod stage;
pub mod storage;
pub mod telemetry;
pub mod timeouts;
pub mod util;
pub mod wire;

pub use announcer::{Announcer, PullDecision, PullScheduler};
pub use config::{load_config, AuditConfig, ConfigError, MetaConfig};
pub use dispatch::{Dispatcher, MessageSink, Stages};
pub use executor::{DroppableTask, DroppedMessageCounter, TaskOutcome};
pub use forwarder::MutationVerbHandler;
pub use local::{LocalMembership, LocalNetwork, LocalTopology, LocalTransport, SentMessage};
pub use membership::{
    ApplicationState, Endpoint, EndpointStateObserver, Membership, ReplicaTopology, Token,
};
pub use messaging::{
    MessageIn, MessageOut, MessagingService, Transport, TransportError, Verb, CURRENT_VERSION,
    FORWARD_FROM, FORWARD_TO, VERSION_10, VERSION_11, VERSION_117, VERSION_12,
};
pub use metadata::{
    ClientIdentity, MetadataLog, MetadataRegistry, TagKind, TagRecord, TagStateError,
    METADATA_KEYSPACE,
};
pub use migration::{
    DefinitionsUpdateHandler, MigrationRequestHandler, MigrationTask, PullReceipt, SchemaMerger,
};
pub use node::{MetadataNode, MetadataNodeBuilder};
pub use replication::{route_mutations, ReplicaPush, RoutedMutations, SchemaBroadcast, WritePath};
pub use schema::{
    empty_version, ColumnDef, ColumnKind, KeyspaceDef, MergeReport, ObserverId, SchemaEvent,
    SchemaObserver, SchemaObservers, SchemaStore, TableDef, SYSTEM_KEYSPACE,
};
pub use stage::{ScheduledTask, Stage, StageError, TaskHandle, TaskScheduler, ThreadScheduler};
pub use storage::{
    Cell, CellName, ClusteringRange, ColumnFamily, DeletionTime, MemoryStorage, Modification,
    Mutation, Storage,
};
pub use telemetry::{MetricsSnapshot, SharedMetricsRegistry, TelemetryError};
pub use util::{ConfigurationError, MetaError, StorageError};
pub use wire::CodecError;
