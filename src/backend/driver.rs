//! Execution primitives.
//!
//! A [`Driver`] owns one connection to a storage engine and executes
//! rendered commands, returning a [`Cursor`] over raw rows. The engine
//! behind it stays opaque to the rest of the crate; a conforming driver
//! is all a [`Relational`](super::Relational) backend needs.

use std::collections::VecDeque;

use crate::error::RelataResult;
use crate::model::Entity;
use crate::schema::Schema;
use crate::value::Value;

/// Low-level command execution over one connection.
pub trait Driver {
    fn connect(&mut self) -> RelataResult<()>;
    fn disconnect(&mut self) -> RelataResult<()>;

    /// Execute one rendered command. A command that runs but affects or
    /// returns nothing usable yields a failed cursor, not an error.
    fn execute(&mut self, command: &str) -> RelataResult<Cursor>;

    /// The identifier generated by the most recent insert, if any.
    fn insert_id(&mut self) -> Option<Value>;

    /// Names of the sources the connection exposes.
    fn sources(&mut self) -> RelataResult<Vec<String>>;

    /// Introspect one source.
    fn describe(&mut self, source: &str) -> RelataResult<Schema>;
}

/// Raw result of one executed command.
#[derive(Debug, Clone, Default)]
pub struct Cursor {
    pub columns: Vec<String>,
    pub rows: VecDeque<Vec<Value>>,
    pub affected: u64,
    /// Set when the engine reported a falsy result for a statement that
    /// did run; write pipelines convert this to a boolean failure.
    pub failed: bool,
}

impl Cursor {
    /// A row-bearing cursor.
    pub fn with_rows<I, R>(columns: Vec<String>, rows: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Vec<Value>>,
    {
        Self {
            columns,
            rows: rows.into_iter().map(Into::into).collect(),
            affected: 0,
            failed: false,
        }
    }

    /// A write acknowledgement.
    pub fn acknowledged(affected: u64) -> Self {
        Self {
            affected,
            ..Self::default()
        }
    }

    /// A falsy execution result.
    pub fn failure() -> Self {
        Self {
            failed: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl Iterator for Cursor {
    type Item = Vec<Value>;

    fn next(&mut self) -> Option<Vec<Value>> {
        self.rows.pop_front()
    }
}

/// Lazily flattens raw cursor rows into records.
///
/// The scope map (see
/// [`Relational::schema_map`](super::Relational::schema_map)) assigns each
/// column run to a model scope: the first scope becomes the record's own
/// fields, every further scope nests as a map value under its alias.
#[derive(Debug)]
pub struct RecordSet {
    cursor: Cursor,
    map: Vec<(String, Vec<String>)>,
    model: Option<String>,
}

impl RecordSet {
    pub fn new(cursor: Cursor, map: Vec<(String, Vec<String>)>, model: Option<String>) -> Self {
        Self { cursor, map, model }
    }

    /// Consume the remaining rows, returning the raw cursor.
    pub fn into_cursor(self) -> Cursor {
        self.cursor
    }
}

impl Iterator for RecordSet {
    type Item = Entity;

    fn next(&mut self) -> Option<Entity> {
        let row = self.cursor.next()?;
        let mut entity = Entity::new();
        entity.model = self.model.clone();
        entity.exists = true;

        let mapped: usize = self.map.iter().map(|(_, fields)| fields.len()).sum();
        if mapped == 0 {
            // No scope map: zip the cursor's own column names.
            for (column, value) in self.cursor.columns.iter().zip(row) {
                entity.set(column.clone(), value);
            }
            return Some(entity);
        }

        let mut values = row.into_iter();
        for (index, (scope, fields)) in self.map.iter().enumerate() {
            if index == 0 {
                for field in fields {
                    entity.set(field.clone(), values.next().unwrap_or(Value::Null));
                }
            } else {
                let nested: Vec<(String, Value)> = fields
                    .iter()
                    .map(|field| (field.clone(), values.next().unwrap_or(Value::Null)))
                    .collect();
                entity.set(scope.clone(), Value::Map(nested));
            }
        }
        Some(entity)
    }
}
