//! Audit metadata: the enablement registry, the append-only audit log and the
//! per-target tag records.

pub mod log;
pub mod registry;
pub mod tags;

pub use self::log::MetadataLog;
pub use registry::MetadataRegistry;
pub use tags::{TagRecord, TagStateError};

use std::fmt;

/// Keyspace holding the audit log. Replicated like user data, so audit
/// entries travel to the partition's replicas rather than to every member.
pub const METADATA_KEYSPACE: &str = "system_metadata";
pub const LOG_TABLE: &str = "log";
/// Registry and tag records live in the node-local `system` keyspace.
pub const REGISTRY_TABLE: &str = "metadata_registry";
pub const TAGS_TABLE: &str = "metadata_tags";

pub const COLUMN_DROP_DROPPED: &str = "dropped";
pub const COLUMN_DROP_PERMANENT: &str = "permanent_drop";

/// Audit category. The wire code is what gets stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TagKind {
    KeyspaceAltered,
    KeyspaceDropped,
    TableAltered,
    TableColumnAdded,
    TableColumnDropped,
    TableRenamed,
    TableProbed,
    TableDropped,
    TableTruncated,
    RowInserted,
    RowUpdated,
    RowDeleted,
    ColumnDrop,
    Custom(String),
}

impl TagKind {
    pub fn code(&self) -> &str {
        match self {
            TagKind::KeyspaceAltered => "a_ks",
            TagKind::KeyspaceDropped => "d_ks",
            TagKind::TableAltered => "a_cf_al",
            TagKind::TableColumnAdded => "a_cf_ad",
            TagKind::TableColumnDropped => "a_cf_d",
            TagKind::TableRenamed => "a_cf_r",
            TagKind::TableProbed => "a_cf_p",
            TagKind::TableDropped => "d_cf",
            TagKind::TableTruncated => "t_cf",
            TagKind::RowInserted => "i_r",
            TagKind::RowUpdated => "u_r",
            TagKind::RowDeleted => "d_r",
            TagKind::ColumnDrop => "column_drop_tag",
            TagKind::Custom(code) => code,
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "a_ks" => TagKind::KeyspaceAltered,
            "d_ks" => TagKind::KeyspaceDropped,
            "a_cf_al" => TagKind::TableAltered,
            "a_cf_ad" => TagKind::TableColumnAdded,
            "a_cf_d" => TagKind::TableColumnDropped,
            "a_cf_r" => TagKind::TableRenamed,
            "a_cf_p" => TagKind::TableProbed,
            "d_cf" => TagKind::TableDropped,
            "t_cf" => TagKind::TableTruncated,
            "i_r" => TagKind::RowInserted,
            "u_r" => TagKind::RowUpdated,
            "d_r" => TagKind::RowDeleted,
            "column_drop_tag" => TagKind::ColumnDrop,
            other => TagKind::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for TagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Authenticated principal behind a request, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user: String,
}

impl ClientIdentity {
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }

    /// Name recorded in the audit log; anonymous callers record `""`.
    pub fn display_name(client: Option<&ClientIdentity>) -> String {
        client.map(|c| c.user.clone()).unwrap_or_default()
    }
}

/// Dotted `keyspace[.table[.column]]` audit target.
pub fn join_target(parts: &[&str]) -> String {
    parts.join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_and_unknown_codes_stay_custom() {
        for kind in [
            TagKind::KeyspaceAltered,
            TagKind::TableColumnDropped,
            TagKind::RowDeleted,
            TagKind::ColumnDrop,
        ] {
            assert_eq!(TagKind::from_code(kind.code()), kind);
        }
        assert_eq!(
            TagKind::from_code("x_custom"),
            TagKind::Custom("x_custom".into())
        );
        assert_eq!(join_target(&["ks", "t", "c"]), "ks.t.c");
        assert_eq!(ClientIdentity::display_name(None), "");
    }
}
