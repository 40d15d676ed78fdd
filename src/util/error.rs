use crate::config::ConfigError;
use crate::messaging::TransportError;
use crate::metadata::tags::TagStateError;
use crate::stage::StageError;
use crate::wire::CodecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("malformed stored value in {table}: {detail}")]
    Malformed { table: String, detail: String },
    #[error("{0}")]
    Other(String),
}

/// Rejected schema operations. Raised before any mutation is built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("cannot add already existing keyspace '{0}'")]
    KeyspaceExists(String),
    #[error("cannot add already existing table '{table}' to keyspace '{keyspace}'")]
    TableExists { keyspace: String, table: String },
    #[error("keyspace '{0}' does not exist")]
    KeyspaceNotFound(String),
    #[error("table '{table}' does not exist in keyspace '{keyspace}'")]
    TableNotFound { keyspace: String, table: String },
    #[error("invalid definition: {0}")]
    Invalid(String),
    #[error("incompatible definition change: {0}")]
    Incompatible(String),
}

#[derive(Debug, Error)]
pub enum MetaError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    TagState(#[from] TagStateError),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Other(String),
}
