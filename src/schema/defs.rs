use super::{
    validate_identifier, SCHEMA_COLUMNFAMILIES_TABLE, SCHEMA_COLUMNS_TABLE, SCHEMA_KEYSPACES_TABLE,
    SYSTEM_KEYSPACE,
};
use crate::storage::{CellName, DeletionTime, Mutation};
use crate::util::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub(crate) const MARKER: &str = "";
pub(crate) const DURABLE_WRITES: &str = "durable_writes";
pub(crate) const STRATEGY_CLASS: &str = "strategy_class";
pub(crate) const STRATEGY_OPTIONS: &str = "strategy_options";
pub(crate) const TABLE_ID: &str = "id";
pub(crate) const TABLE_COMMENT: &str = "comment";
pub(crate) const COLUMN_VALIDATOR: &str = "validator";
pub(crate) const COLUMN_KIND: &str = "kind";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    PartitionKey,
    Clustering,
    Regular,
}

impl ColumnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnKind::PartitionKey => "partition_key",
            ColumnKind::Clustering => "clustering_key",
            ColumnKind::Regular => "regular",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "partition_key" => Some(ColumnKind::PartitionKey),
            "clustering_key" => Some(ColumnKind::Clustering),
            "regular" => Some(ColumnKind::Regular),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub validator: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub keyspace: String,
    pub name: String,
    pub id: Uuid,
    pub comment: String,
    pub columns: BTreeMap<String, ColumnDef>,
}

impl TableDef {
    pub fn new(keyspace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            name: name.into(),
            id: Uuid::new_v4(),
            comment: String::new(),
            columns: BTreeMap::new(),
        }
    }

    pub fn with_column(
        mut self,
        name: impl Into<String>,
        validator: impl Into<String>,
        kind: ColumnKind,
    ) -> Self {
        let name = name.into();
        self.columns.insert(
            name.clone(),
            ColumnDef {
                name,
                validator: validator.into(),
                kind,
            },
        );
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn without_column(mut self, name: &str) -> Self {
        self.columns.remove(name);
        self
    }

    /// Dotted `keyspace.table` name used as an audit target.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.keyspace, self.name)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_identifier("keyspace", &self.keyspace)?;
        validate_identifier("table", &self.name)?;
        for column in self.columns.values() {
            validate_identifier("column", &column.name)?;
            if column.validator.is_empty() {
                return Err(ConfigurationError::Invalid(format!(
                    "column '{}' of {} has no validator",
                    column.name,
                    self.qualified_name()
                )));
            }
        }
        Ok(())
    }

    /// Rejects changes that would reinterpret existing data.
    pub fn validate_compatibility(&self, new: &TableDef) -> Result<(), ConfigurationError> {
        if self.keyspace != new.keyspace || self.name != new.name {
            return Err(ConfigurationError::Incompatible(format!(
                "table mismatch: {} vs {}",
                self.qualified_name(),
                new.qualified_name()
            )));
        }
        if self.id != new.id {
            return Err(ConfigurationError::Incompatible(format!(
                "table id mismatch for {}: {} vs {}",
                self.qualified_name(),
                self.id,
                new.id
            )));
        }
        let old_keys: Vec<&str> = self.partition_key_columns().collect();
        let new_keys: Vec<&str> = new.partition_key_columns().collect();
        if old_keys != new_keys {
            return Err(ConfigurationError::Incompatible(format!(
                "partition key of {} cannot change",
                self.qualified_name()
            )));
        }
        Ok(())
    }

    pub fn partition_key_columns(&self) -> impl Iterator<Item = &str> {
        self.columns
            .values()
            .filter(|column| column.kind == ColumnKind::PartitionKey)
            .map(|column| column.name.as_str())
    }

    pub fn dropped_columns<'a>(&'a self, new: &'a TableDef) -> Vec<&'a str> {
        self.columns
            .keys()
            .filter(|name| !new.columns.contains_key(*name))
            .map(String::as_str)
            .collect()
    }

    pub fn added_columns<'a>(&'a self, new: &'a TableDef) -> Vec<&'a str> {
        new.columns
            .keys()
            .filter(|name| !self.columns.contains_key(*name))
            .map(String::as_str)
            .collect()
    }

    pub fn to_schema(&self, timestamp: i64) -> Mutation {
        let mut mutation = Mutation::new(SYSTEM_KEYSPACE, self.keyspace.as_bytes());
        self.add_to_schema(&mut mutation, timestamp);
        mutation
    }

    /// Full new state of the table plus range tombstones for every column the
    /// new definition no longer carries.
    pub fn to_schema_update(&self, new: &TableDef, timestamp: i64) -> Mutation {
        let mut mutation = new.to_schema(timestamp);
        let deletion = DeletionTime::at(timestamp);
        let columns = mutation.add_or_get(SCHEMA_COLUMNS_TABLE);
        for dropped in self.dropped_columns(new) {
            columns.delete_range(CellName::new([self.name.as_str(), dropped]), deletion);
        }
        mutation
    }

    pub fn drop_from_schema(&self, timestamp: i64) -> Mutation {
        let mut mutation = Mutation::new(SYSTEM_KEYSPACE, self.keyspace.as_bytes());
        let deletion = DeletionTime::at(timestamp);
        let prefix = CellName::new([self.name.as_str()]);
        mutation
            .add_or_get(SCHEMA_COLUMNFAMILIES_TABLE)
            .delete_range(prefix.clone(), deletion);
        mutation
            .add_or_get(SCHEMA_COLUMNS_TABLE)
            .delete_range(prefix, deletion);
        mutation
    }

    pub(crate) fn add_to_schema(&self, mutation: &mut Mutation, timestamp: i64) {
        let table = CellName::new([self.name.as_str()]);
        let families = mutation.add_or_get(SCHEMA_COLUMNFAMILIES_TABLE);
        families.add_column(table.child(MARKER), Vec::new(), timestamp);
        families.add_column(table.child(TABLE_ID), self.id.to_string(), timestamp);
        families.add_column(table.child(TABLE_COMMENT), self.comment.clone(), timestamp);
        let columns = mutation.add_or_get(SCHEMA_COLUMNS_TABLE);
        for column in self.columns.values() {
            let prefix = table.child(column.name.as_str());
            columns.add_column(prefix.child(MARKER), Vec::new(), timestamp);
            columns.add_column(
                prefix.child(COLUMN_VALIDATOR),
                column.validator.clone(),
                timestamp,
            );
            columns.add_column(prefix.child(COLUMN_KIND), column.kind.as_str(), timestamp);
        }
    }
}

impl fmt::Display for TableDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[id={}, columns=[", self.qualified_name(), self.id)?;
        for (idx, column) in self.columns.values().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} {}", column.name, column.validator)?;
        }
        f.write_str("]]")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyspaceDef {
    pub name: String,
    pub strategy_class: String,
    pub strategy_options: BTreeMap<String, String>,
    pub durable_writes: bool,
    pub tables: BTreeMap<String, TableDef>,
}

impl KeyspaceDef {
    pub fn new(
        name: impl Into<String>,
        strategy_class: impl Into<String>,
        strategy_options: BTreeMap<String, String>,
        durable_writes: bool,
    ) -> Self {
        Self {
            name: name.into(),
            strategy_class: strategy_class.into(),
            strategy_options,
            durable_writes,
            tables: BTreeMap::new(),
        }
    }

    pub fn simple(name: impl Into<String>, replication_factor: u32) -> Self {
        let mut options = BTreeMap::new();
        options.insert(
            "replication_factor".to_string(),
            replication_factor.to_string(),
        );
        Self::new(name, "SimpleStrategy", options, true)
    }

    pub fn with_table(mut self, table: TableDef) -> Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_identifier("keyspace", &self.name)?;
        if self.strategy_class.is_empty() {
            return Err(ConfigurationError::Invalid(format!(
                "keyspace '{}' has no replication strategy",
                self.name
            )));
        }
        for table in self.tables.values() {
            if table.keyspace != self.name {
                return Err(ConfigurationError::Invalid(format!(
                    "table {} declared under keyspace '{}'",
                    table.qualified_name(),
                    self.name
                )));
            }
            table.validate()?;
        }
        Ok(())
    }

    /// True when the keyspace-level attributes differ; tables are ignored.
    pub fn attributes_differ(&self, other: &KeyspaceDef) -> bool {
        self.strategy_class != other.strategy_class
            || self.strategy_options != other.strategy_options
            || self.durable_writes != other.durable_writes
    }

    /// `Strategy,{k=v, ...},durable` rendering used in audit values.
    pub fn describe_replication(&self) -> String {
        let simple = self
            .strategy_class
            .rsplit('.')
            .next()
            .unwrap_or(self.strategy_class.as_str());
        let options = self
            .strategy_options
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{},{{{}}},{}", simple, options, self.durable_writes)
    }

    pub fn to_schema(&self, timestamp: i64) -> Mutation {
        let mut mutation = self.attributes_to_schema(timestamp);
        for table in self.tables.values() {
            table.add_to_schema(&mut mutation, timestamp);
        }
        mutation
    }

    /// Rewrites the keyspace attributes from `new`; tables are untouched.
    pub fn to_schema_update(&self, new: &KeyspaceDef, timestamp: i64) -> Mutation {
        new.attributes_to_schema(timestamp)
    }

    pub fn drop_from_schema(&self, timestamp: i64) -> Mutation {
        let mut mutation = Mutation::new(SYSTEM_KEYSPACE, self.name.as_bytes());
        let deletion = DeletionTime::at(timestamp);
        for table in [
            SCHEMA_KEYSPACES_TABLE,
            SCHEMA_COLUMNFAMILIES_TABLE,
            SCHEMA_COLUMNS_TABLE,
        ] {
            mutation.add_or_get(table).delete_partition(deletion);
        }
        mutation
    }

    fn attributes_to_schema(&self, timestamp: i64) -> Mutation {
        let mut mutation = Mutation::new(SYSTEM_KEYSPACE, self.name.as_bytes());
        let options = render_options(&self.strategy_options);
        let keyspaces = mutation.add_or_get(SCHEMA_KEYSPACES_TABLE);
        keyspaces.add_column(CellName::new([MARKER]), Vec::new(), timestamp);
        keyspaces.add_column(
            CellName::new([DURABLE_WRITES]),
            self.durable_writes.to_string(),
            timestamp,
        );
        keyspaces.add_column(
            CellName::new([STRATEGY_CLASS]),
            self.strategy_class.clone(),
            timestamp,
        );
        keyspaces.add_column(CellName::new([STRATEGY_OPTIONS]), options, timestamp);
        mutation
    }
}

impl fmt::Display for KeyspaceDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}, tables={}]",
            self.name,
            self.describe_replication(),
            self.tables.len()
        )
    }
}

fn render_options(options: &BTreeMap<String, String>) -> String {
    // A string map always serializes; fall back to an empty object regardless.
    serde_json::to_string(options).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Modification;

    fn users() -> TableDef {
        TableDef::new("app", "users")
            .with_column("id", "UUIDType", ColumnKind::PartitionKey)
            .with_column("email", "UTF8Type", ColumnKind::Regular)
            .with_column("age", "Int32Type", ColumnKind::Regular)
    }

    #[test]
    fn identifiers_are_word_characters_only() {
        assert!(KeyspaceDef::simple("app_1", 3).validate().is_ok());
        assert!(matches!(
            KeyspaceDef::simple("app-1", 3).validate(),
            Err(ConfigurationError::Invalid(_))
        ));
        let long = "k".repeat(49);
        assert!(KeyspaceDef::simple(long, 3).validate().is_err());
    }

    #[test]
    fn table_update_tombstones_dropped_columns_only() {
        let old = users();
        let new = old.clone().without_column("age");
        let mutation = old.to_schema_update(&new, 100);
        let columns = mutation.family(SCHEMA_COLUMNS_TABLE).unwrap();
        let ranges: Vec<&CellName> = columns
            .modifications()
            .iter()
            .filter_map(|m| match m {
                Modification::RangeDelete { prefix, .. } => Some(prefix),
                _ => None,
            })
            .collect();
        assert_eq!(ranges, vec![&CellName::new(["users", "age"])]);
        assert_eq!(old.dropped_columns(&new), vec!["age"]);
    }

    #[test]
    fn compatibility_rejects_new_identity_or_partition_key() {
        let old = users();
        let mut renamed_id = old.clone();
        renamed_id.id = Uuid::new_v4();
        assert!(matches!(
            old.validate_compatibility(&renamed_id),
            Err(ConfigurationError::Incompatible(_))
        ));
        let rekeyed = old
            .clone()
            .with_column("email", "UTF8Type", ColumnKind::PartitionKey);
        assert!(old.validate_compatibility(&rekeyed).is_err());
        let added = old.clone().with_column("nick", "UTF8Type", ColumnKind::Regular);
        assert!(old.validate_compatibility(&added).is_ok());
    }

    #[test]
    fn replication_description_uses_simple_class_name() {
        let mut ks = KeyspaceDef::simple("app", 3);
        ks.strategy_class = "org.apache.cassandra.locator.SimpleStrategy".into();
        assert_eq!(
            ks.describe_replication(),
            "SimpleStrategy,{replication_factor=3},true"
        );
    }
}
