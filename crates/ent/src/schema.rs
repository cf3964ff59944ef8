//! Table schema descriptors
//!
//! A [`Schema`] declares a table's columns (ordered), their semantic types,
//! nullability, auto-generated expressions and the unique keys. Every schema
//! has an `id` primary key of type [`ColumnType::Id`] generated on insert.
//! Schemas are immutable once built; one per entity type.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::{EntError, Result};
use crate::id::Id;
use crate::value::{Row, Value};

/// Name of the primary key column
pub const ID_COLUMN: &str = "id";

/// Semantic column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Id,
    String,
    Boolean,
    Integer,
    Timestamp,
    Json,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Id => "id",
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::Timestamp => "timestamp",
            Self::Json => "json",
        };
        f.write_str(name)
    }
}

/// Expression evaluated by the store when a row is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoExpr {
    /// Shard-qualified id on the island the row is written to
    ShardId,
    /// Current timestamp
    Now,
    /// Raw SQL expression, e.g. `nextval('users_id_seq')`
    Sql(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
    pub auto_insert: Option<AutoExpr>,
    pub auto_update: Option<AutoExpr>,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
            auto_insert: None,
            auto_update: None,
        }
    }

    /// Primary key column with a store-generated shard-qualified id
    pub fn primary_id() -> Self {
        Self::new(ID_COLUMN, ColumnType::Id).auto_insert(AutoExpr::ShardId)
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn auto_insert(mut self, expr: AutoExpr) -> Self {
        self.auto_insert = Some(expr);
        self
    }

    pub fn auto_update(mut self, expr: AutoExpr) -> Self {
        self.auto_update = Some(expr);
        self
    }

    /// Must be supplied by the caller on insert
    pub fn is_required(&self) -> bool {
        !self.nullable && self.auto_insert.is_none() && self.auto_update.is_none()
    }

    /// Expression the store evaluates when the column is omitted on insert
    pub fn insert_default(&self) -> Option<&AutoExpr> {
        self.auto_insert.as_ref().or(self.auto_update.as_ref())
    }
}

#[derive(Debug, Clone)]
pub struct Schema {
    table: String,
    columns: Vec<Column>,
    unique_keys: Vec<Vec<String>>,
}

impl Schema {
    /// Build and validate a schema
    pub fn new(table: impl Into<String>, columns: Vec<Column>, unique_keys: &[&[&str]]) -> Result<Self> {
        let table = table.into();
        if table.is_empty() {
            return Err(EntError::config("schema table name must not be empty"));
        }

        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(EntError::config(format!(
                    "{table}: column {} declared twice",
                    column.name
                )));
            }
        }

        match columns.iter().find(|c| c.name == ID_COLUMN) {
            Some(id) if id.ty == ColumnType::Id && id.auto_insert.is_some() && !id.nullable => {}
            Some(_) => {
                return Err(EntError::config(format!(
                    "{table}: column {ID_COLUMN} must be a non-nullable id generated on insert"
                )))
            }
            None => {
                return Err(EntError::config(format!(
                    "{table}: missing primary key column {ID_COLUMN}"
                )))
            }
        }

        let mut keys = Vec::with_capacity(unique_keys.len());
        for key in unique_keys {
            if key.is_empty() {
                return Err(EntError::config(format!("{table}: empty unique key")));
            }
            let mut in_key = HashSet::new();
            for column in key.iter() {
                if !seen.contains(column) {
                    return Err(EntError::config(format!(
                        "{table}: unique key references undeclared column {column}"
                    )));
                }
                if !in_key.insert(*column) {
                    return Err(EntError::config(format!(
                        "{table}: unique key lists column {column} twice"
                    )));
                }
            }
            keys.push(key.iter().map(|c| c.to_string()).collect());
        }

        Ok(Self {
            table,
            columns,
            unique_keys: keys,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn unique_keys(&self) -> &[Vec<String>] {
        &self.unique_keys
    }

    pub fn id_column(&self) -> Option<&Column> {
        self.column(ID_COLUMN)
    }

    pub fn has_auto_update(&self) -> bool {
        self.columns.iter().any(|c| c.auto_update.is_some())
    }

    /// Whether `columns` (in any order) is the primary key or a declared unique key
    pub fn is_unique_key<S: AsRef<str>>(&self, columns: &[S]) -> bool {
        let wanted: HashSet<&str> = columns.iter().map(AsRef::as_ref).collect();
        if wanted.len() != columns.len() {
            return false;
        }
        if wanted.len() == 1 && wanted.contains(ID_COLUMN) {
            return true;
        }
        self.unique_keys.iter().any(|key| {
            key.len() == wanted.len() && key.iter().all(|c| wanted.contains(c.as_str()))
        })
    }

    /// Validate an insert payload and produce the full row to write.
    ///
    /// Omitted nullable columns become `Null`; omitted auto columns are left
    /// for the store to generate.
    pub fn normalize_insert(&self, fields: &Row) -> Result<Row> {
        for name in fields.columns() {
            let column = self.known_column(name)?;
            if column.auto_insert.is_some() {
                return Err(self.invalid(format!(
                    "column {name} is generated on insert and must not be supplied"
                )));
            }
        }

        let mut row = Row::new();
        for column in &self.columns {
            match fields.get(&column.name) {
                Some(value) => row.set(column.name.as_str(), self.coerce(column, value)?),
                None if column.insert_default().is_some() => {}
                None if column.nullable => row.set(column.name.as_str(), Value::Null),
                None => {
                    return Err(self.invalid(format!("missing required column {}", column.name)))
                }
            }
        }
        Ok(row)
    }

    /// Validate a partial update. The primary key and insert-generated
    /// columns are immutable.
    pub fn normalize_update(&self, patch: &Row) -> Result<Row> {
        let mut row = Row::new();
        for (name, value) in patch.iter() {
            let column = self.known_column(name)?;
            if column.auto_insert.is_some() {
                return Err(self.invalid(format!("column {name} cannot be updated")));
            }
            row.set(name, self.coerce(column, value)?);
        }
        Ok(row)
    }

    /// Validate a unique-key lookup: the columns must form the primary key
    /// or a declared unique key, and hold non-null values.
    pub fn normalize_key(&self, key: &Row) -> Result<Row> {
        let columns: Vec<&str> = key.columns().collect();
        if !self.is_unique_key(&columns) {
            return Err(self.invalid(format!(
                "({}) is not a unique key",
                columns.join(", ")
            )));
        }
        let mut row = Row::new();
        for (name, value) in key.iter() {
            let column = self.known_column(name)?;
            if value.is_null() {
                return Err(self.invalid(format!("unique key column {name} must not be null")));
            }
            row.set(name, self.coerce(column, value)?);
        }
        Ok(row)
    }

    fn known_column(&self, name: &str) -> Result<&Column> {
        self.column(name)
            .ok_or_else(|| self.invalid(format!("unknown column {name}")))
    }

    fn coerce(&self, column: &Column, value: &Value) -> Result<Value> {
        let accepted = match (column.ty, value) {
            (_, Value::Null) if column.nullable => Value::Null,
            (_, Value::Null) => {
                return Err(self.invalid(format!("column {} is not nullable", column.name)))
            }
            (ColumnType::Id, Value::Id(_))
            | (ColumnType::String, Value::String(_))
            | (ColumnType::Boolean, Value::Bool(_))
            | (ColumnType::Integer, Value::Int(_))
            | (ColumnType::Timestamp, Value::Timestamp(_))
            | (ColumnType::Json, Value::Json(_)) => value.clone(),
            (ColumnType::Id, Value::String(raw)) => Value::Id(Id::new(raw.as_str())),
            (ty, other) => {
                return Err(self.invalid(format!(
                    "column {} expects {ty}, got {}",
                    column.name,
                    other.type_name()
                )))
            }
        };
        Ok(accepted)
    }

    fn invalid(&self, message: String) -> EntError {
        EntError::validation(self.table.as_str(), message)
    }
}
