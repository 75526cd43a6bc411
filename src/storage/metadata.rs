//! Table and index metadata, persisted at page 0 of each `.db`/`.idx` file.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ColumnType {
    Int,
    Float,
    Str,
}

impl ColumnType {
    /// Maps a declared SQL type token (`INT`, `VARCHAR`, ...) to a column
    /// type, or `None` if the token is not recognized.
    pub fn from_token(token: &str) -> Option<ColumnType> {
        match token.to_ascii_uppercase().as_str() {
            "INT" | "INTEGER" | "BIGINT" | "SMALLINT" => Some(ColumnType::Int),
            "FLOAT" | "REAL" | "DOUBLE" | "DOUBLE PRECISION" => Some(ColumnType::Float),
            "STR" | "TEXT" | "VARCHAR" | "CHAR" | "STRING" => Some(ColumnType::Str),
            _ => None,
        }
    }
}

/// Table metadata: page 0 of a `<table>.db` file.
#[derive(Clone, Serialize, Deserialize)]
pub struct TableMeta {
    /// Ordered column name -> declared type, preserving declaration order
    /// for positional INSERT.
    pub schema: Vec<(String, ColumnType)>,
    pub primary_key: String,
    /// index name -> indexed column name.
    pub indexes: BTreeMap<String, String>,
    pub root_page: u32,
    pub next_page: u32,
}

impl TableMeta {
    pub fn has_column(&self, name: &str) -> bool {
        self.schema.iter().any(|(c, _)| c == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.schema.iter().map(|(c, _)| c.as_str()).collect()
    }
}

/// Index metadata: page 0 of an `<index>.idx` file.
#[derive(Clone, Serialize, Deserialize)]
pub struct IndexMeta {
    pub root_page: u32,
    pub next_page: u32,
}
