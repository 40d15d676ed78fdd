//! Keyspace and table definitions, their encoding into the `system` schema
//! tables, and the node-local schema state those tables are merged into.

pub mod defs;
pub mod observer;
pub mod store;

pub use defs::{ColumnDef, ColumnKind, KeyspaceDef, TableDef};
pub use observer::{ObserverId, SchemaEvent, SchemaObserver, SchemaObservers};
pub use store::{empty_version, MergeReport, SchemaStore};

use crate::util::ConfigurationError;

pub const SYSTEM_KEYSPACE: &str = "system";
pub const SCHEMA_KEYSPACES_TABLE: &str = "schema_keyspaces";
pub const SCHEMA_COLUMNFAMILIES_TABLE: &str = "schema_columnfamilies";
pub const SCHEMA_COLUMNS_TABLE: &str = "schema_columns";

pub const SCHEMA_TABLES: [&str; 3] = [
    SCHEMA_KEYSPACES_TABLE,
    SCHEMA_COLUMNFAMILIES_TABLE,
    SCHEMA_COLUMNS_TABLE,
];

pub const MAX_IDENTIFIER_LENGTH: usize = 48;

pub fn is_schema_table(table: &str) -> bool {
    SCHEMA_TABLES.contains(&table)
}

pub(crate) fn validate_identifier(what: &str, name: &str) -> Result<(), ConfigurationError> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if name.is_empty() || !valid_chars || name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(ConfigurationError::Invalid(format!(
            "{} name must be 1-{} word characters, got '{}'",
            what, MAX_IDENTIFIER_LENGTH, name
        )));
    }
    Ok(())
}
