//! Graph schema definitions.
//!
//! A schema declares node tables (typed columns with a `node_id` primary key)
//! and relationship tables (source type, target type, cardinality and optional
//! edge properties). Schemas can be built in code or read from TOML:
//!
//! ```toml
//! [[node_tables]]
//! name = "User"
//! columns = [
//!     { name = "node_id", type = "INT64" },
//!     { name = "user_id", type = "STRING" },
//! ]
//!
//! [[rel_tables]]
//! name = "Friend"
//! from = "User"
//! to = "User"
//! cardinality = "MANY_MANY"
//! ```

use crate::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Name of the mandatory primary key column on node tables.
pub const NODE_ID_COLUMN: &str = "node_id";

static IDENTIFIER: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok());

/// Validates a table or column identifier.
///
/// Identifiers are interpolated into SQL, so only `[A-Za-z_][A-Za-z0-9_]*` is
/// accepted.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] for anything else.
pub fn validate_identifier(name: &str) -> Result<()> {
    let valid = IDENTIFIER
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(name));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid identifier: '{name}'")))
    }
}

/// Declared column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnType {
    /// 64-bit integer.
    Int64,
    /// 32-bit integer.
    Int32,
    /// 16-bit integer.
    Int16,
    /// Double precision float.
    Double,
    /// Single precision float.
    Float,
    /// UTF-8 string.
    String,
    /// Boolean.
    Bool,
    /// Fixed-size float vector.
    FloatArray(usize),
}

impl ColumnType {
    /// `SQLite` storage class for the column.
    #[must_use]
    pub const fn sql_type(self) -> &'static str {
        match self {
            Self::Int64 | Self::Int32 | Self::Int16 | Self::Bool => "INTEGER",
            Self::Double | Self::Float => "REAL",
            Self::String => "TEXT",
            Self::FloatArray(_) => "BLOB",
        }
    }

    /// Returns `true` for integer types.
    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(self, Self::Int64 | Self::Int32 | Self::Int16)
    }

    /// Vector dimension for array columns.
    #[must_use]
    pub const fn vector_dim(self) -> Option<usize> {
        match self {
            Self::FloatArray(dim) => Some(dim),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int64 => write!(f, "INT64"),
            Self::Int32 => write!(f, "INT32"),
            Self::Int16 => write!(f, "INT16"),
            Self::Double => write!(f, "DOUBLE"),
            Self::Float => write!(f, "FLOAT"),
            Self::String => write!(f, "STRING"),
            Self::Bool => write!(f, "BOOL"),
            Self::FloatArray(dim) => write!(f, "FLOAT[{dim}]"),
        }
    }
}

impl FromStr for ColumnType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_uppercase();
        match upper.as_str() {
            "INT64" | "BIGINT" => Ok(Self::Int64),
            "INT32" | "INT" | "INTEGER" => Ok(Self::Int32),
            "INT16" | "SMALLINT" => Ok(Self::Int16),
            "DOUBLE" => Ok(Self::Double),
            "FLOAT" | "REAL" => Ok(Self::Float),
            "STRING" | "TEXT" => Ok(Self::String),
            "BOOL" | "BOOLEAN" => Ok(Self::Bool),
            other => other
                .strip_suffix(']')
                .and_then(|rest| {
                    rest.strip_prefix("FLOAT[")
                        .or_else(|| rest.strip_prefix("DOUBLE["))
                })
                .and_then(|dim| dim.parse::<usize>().ok())
                .filter(|dim| *dim > 0)
                .map(Self::FloatArray)
                .ok_or_else(|| Error::InvalidInput(format!("unknown column type: '{s}'"))),
        }
    }
}

impl TryFrom<String> for ColumnType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.to_string()
    }
}

/// Relationship cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Cardinality {
    /// Each source has at most one target and vice versa.
    OneOne,
    /// Each target has at most one source.
    OneMany,
    /// Each source has at most one target.
    ManyOne,
    /// Unconstrained.
    #[default]
    ManyMany,
}

impl Cardinality {
    /// Whether each source may appear at most once.
    #[must_use]
    pub const fn unique_source(self) -> bool {
        matches!(self, Self::OneOne | Self::ManyOne)
    }

    /// Whether each target may appear at most once.
    #[must_use]
    pub const fn unique_target(self) -> bool {
        matches!(self, Self::OneOne | Self::OneMany)
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::OneOne => "ONE_ONE",
            Self::OneMany => "ONE_MANY",
            Self::ManyOne => "MANY_ONE",
            Self::ManyMany => "MANY_MANY",
        };
        write!(f, "{label}")
    }
}

impl FromStr for Cardinality {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "ONE_ONE" => Ok(Self::OneOne),
            "ONE_MANY" => Ok(Self::OneMany),
            "MANY_ONE" => Ok(Self::ManyOne),
            "MANY_MANY" => Ok(Self::ManyMany),
            _ => Err(Error::InvalidInput(format!("unknown cardinality: '{s}'"))),
        }
    }
}

/// A typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Column type.
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl ColumnDef {
    /// Creates a column definition.
    #[must_use]
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// A node table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTableDef {
    /// Table name (type label).
    pub name: String,
    /// Columns, including the primary key.
    pub columns: Vec<ColumnDef>,
    /// Primary key column; must be `node_id`.
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
}

fn default_primary_key() -> String {
    NODE_ID_COLUMN.to_string()
}

impl NodeTableDef {
    /// Creates a node table with only the `node_id` column.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: vec![ColumnDef::new(NODE_ID_COLUMN, ColumnType::Int64)],
            primary_key: default_primary_key(),
        }
    }

    /// Adds a column.
    #[must_use]
    pub fn with_column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push(ColumnDef::new(name, column_type));
        self
    }

    /// Looks up a column by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// A relationship table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelTableDef {
    /// Table name (edge label).
    pub name: String,
    /// Source node table.
    pub from: String,
    /// Target node table.
    pub to: String,
    /// Cardinality constraint.
    #[serde(default)]
    pub cardinality: Cardinality,
    /// Edge properties.
    #[serde(default)]
    pub properties: Vec<ColumnDef>,
}

impl RelTableDef {
    /// Creates an unconstrained relationship table without properties.
    #[must_use]
    pub fn new(name: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            from: from.into(),
            to: to.into(),
            cardinality: Cardinality::ManyMany,
            properties: Vec::new(),
        }
    }

    /// Sets the cardinality.
    #[must_use]
    pub const fn with_cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    /// Adds an edge property.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.properties.push(ColumnDef::new(name, column_type));
        self
    }
}

/// A complete schema declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    /// Node tables.
    #[serde(default)]
    pub node_tables: Vec<NodeTableDef>,
    /// Relationship tables.
    #[serde(default)]
    pub rel_tables: Vec<RelTableDef>,
}

impl SchemaDefinition {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node table.
    #[must_use]
    pub fn with_node_table(mut self, table: NodeTableDef) -> Self {
        self.node_tables.push(table);
        self
    }

    /// Adds a relationship table.
    #[must_use]
    pub fn with_rel_table(mut self, table: RelTableDef) -> Self {
        self.rel_tables.push(table);
        self
    }

    /// Parses a schema from TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be parsed or fails validation.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let schema: Self = toml::from_str(contents).map_err(|e| Error::OperationFailed {
            operation: "parse_schema".to_string(),
            cause: e.to_string(),
        })?;
        schema.validate()?;
        Ok(schema)
    }

    /// Checks identifiers, primary keys and relationship endpoints.
    ///
    /// Relationship endpoints must name node tables declared in this schema.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();

        for table in &self.node_tables {
            validate_identifier(&table.name)?;
            if !names.insert(table.name.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "duplicate table '{}'",
                    table.name
                )));
            }
            if table.primary_key != NODE_ID_COLUMN {
                return Err(Error::InvalidInput(format!(
                    "table '{}' must use '{NODE_ID_COLUMN}' as primary key",
                    table.name
                )));
            }
            match table.column(NODE_ID_COLUMN) {
                Some(col) if col.column_type == ColumnType::Int64 => {},
                _ => {
                    return Err(Error::InvalidInput(format!(
                        "table '{}' must declare '{NODE_ID_COLUMN} INT64'",
                        table.name
                    )));
                },
            }
            validate_columns(&table.name, &table.columns)?;
        }

        for rel in &self.rel_tables {
            validate_identifier(&rel.name)?;
            if !names.insert(rel.name.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "duplicate table '{}'",
                    rel.name
                )));
            }
            for endpoint in [&rel.from, &rel.to] {
                if !self.node_tables.iter().any(|t| &t.name == endpoint) {
                    return Err(Error::InvalidInput(format!(
                        "relationship '{}' references unknown node table '{endpoint}'",
                        rel.name
                    )));
                }
            }
            validate_columns(&rel.name, &rel.properties)?;
            if rel
                .properties
                .iter()
                .any(|p| p.name == "source_id" || p.name == "target_id")
            {
                return Err(Error::InvalidInput(format!(
                    "relationship '{}' uses a reserved property name",
                    rel.name
                )));
            }
        }

        Ok(())
    }

    /// Looks up a node table.
    #[must_use]
    pub fn node_table(&self, name: &str) -> Option<&NodeTableDef> {
        self.node_tables.iter().find(|t| t.name == name)
    }

    /// Looks up a relationship table.
    #[must_use]
    pub fn rel_table(&self, name: &str) -> Option<&RelTableDef> {
        self.rel_tables.iter().find(|t| t.name == name)
    }
}

fn validate_columns(table: &str, columns: &[ColumnDef]) -> Result<()> {
    let mut seen = HashSet::new();
    for column in columns {
        validate_identifier(&column.name)?;
        if !seen.insert(column.name.as_str()) {
            return Err(Error::InvalidInput(format!(
                "duplicate column '{}' in '{table}'",
                column.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("INT64", ColumnType::Int64; "int64")]
    #[test_case("int16", ColumnType::Int16; "lowercase int16")]
    #[test_case("STRING", ColumnType::String; "string")]
    #[test_case("DOUBLE", ColumnType::Double; "double")]
    #[test_case("FLOAT[64]", ColumnType::FloatArray(64); "float array")]
    #[test_case("DOUBLE[3]", ColumnType::FloatArray(3); "double array")]
    fn test_parse_column_type(input: &str, expected: ColumnType) {
        assert_eq!(input.parse::<ColumnType>().unwrap(), expected);
    }

    #[test_case("FLOAT[0]"; "zero dim")]
    #[test_case("DECIMAL"; "unknown")]
    #[test_case("FLOAT[x]"; "bad dim")]
    fn test_parse_column_type_rejects(input: &str) {
        assert!(input.parse::<ColumnType>().is_err());
    }

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("User").is_ok());
        assert!(validate_identifier("_tmp1").is_ok());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("drop table;").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_endpoint() {
        let schema = SchemaDefinition::new()
            .with_node_table(NodeTableDef::new("User"))
            .with_rel_table(RelTableDef::new("Likes", "User", "Genre"));
        assert!(schema.validate().is_err());
    }

    #[test]
    fn test_validate_requires_node_id() {
        let table = NodeTableDef {
            name: "User".to_string(),
            columns: vec![ColumnDef::new("user_id", ColumnType::String)],
            primary_key: "node_id".to_string(),
        };
        let schema = SchemaDefinition::new().with_node_table(table);
        assert!(schema.validate().is_err());
    }

    #[test]
    fn test_from_toml() {
        let toml = r#"
            [[node_tables]]
            name = "User"
            columns = [
                { name = "node_id", type = "INT64" },
                { name = "user_id", type = "STRING" },
            ]

            [[node_tables]]
            name = "Track"
            columns = [
                { name = "node_id", type = "INT64" },
                { name = "year", type = "INT16" },
            ]

            [[rel_tables]]
            name = "ListenedTo"
            from = "User"
            to = "Track"
            cardinality = "MANY_MANY"
            properties = [{ name = "play_count", type = "INT32" }]
        "#;

        let schema = SchemaDefinition::from_toml(toml).unwrap();
        assert_eq!(schema.node_tables.len(), 2);
        let rel = schema.rel_table("ListenedTo").unwrap();
        assert_eq!(rel.cardinality, Cardinality::ManyMany);
        assert_eq!(rel.properties[0].column_type, ColumnType::Int32);
    }

    #[test]
    fn test_cardinality_uniqueness() {
        assert!(Cardinality::OneOne.unique_source());
        assert!(Cardinality::OneOne.unique_target());
        assert!(Cardinality::ManyOne.unique_source());
        assert!(!Cardinality::ManyOne.unique_target());
        assert!(Cardinality::OneMany.unique_target());
        assert!(!Cardinality::ManyMany.unique_source());
    }
}
