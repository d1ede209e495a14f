//! Schema introspection data models.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Table listing entry.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TableInfo {
    pub name: String,
    pub schema: String,
    pub table_type: TableType,
}

/// Kind of relation returned by `list_tables`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TableType {
    Table,
    View,
    Other,
}

impl TableType {
    /// Parse a catalog table type string (`BASE TABLE`, `VIEW`, `table`, ...).
    pub fn parse(s: &str) -> Self {
        let upper = s.to_uppercase();
        if upper.contains("VIEW") {
            Self::View
        } else if upper.contains("TABLE") {
            Self::Table
        } else {
            Self::Other
        }
    }
}

/// Column definition returned by `describe_table`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ColumnDefinition {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    pub is_primary_key: bool,
}

/// Full description of one table.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TableSchema {
    pub schema: String,
    pub table_name: String,
    pub columns: Vec<ColumnDefinition>,
    pub primary_key: Vec<String>,
}

impl TableSchema {
    /// Get the schema-qualified table name.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table_name)
    }
}
