//! Storage backends.
//!
//! [`Backend`] is the contract every storage adapter satisfies:
//! connection lifecycle, source introspection, and the four CRUD
//! operations driven by a [`Query`] descriptor. Relational adapters
//! additionally implement the [`Renderer`] clause contract consumed by
//! [`Query::export`](crate::query::Query::export).

pub mod document;
pub mod driver;
pub mod relational;

pub use document::ToCommandMap;
pub use driver::{Cursor, Driver, RecordSet};
pub use relational::{CommandKind, Relational};

use crate::error::{RelataError, RelataResult};
use crate::model::Entity;
use crate::query::{Conditions, OrderSpec, Query};
use crate::schema::{FieldDef, Schema};
use crate::value::Value;

/// How a read result is handed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnKind {
    /// Lazily-iterating record wrapper (the default).
    #[default]
    Records,
    /// Fully materialized list.
    List,
    /// The raw cursor, untouched.
    Cursor,
}

/// Options applied to a read operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    pub wrap: ReturnKind,
}

impl ReadOptions {
    pub fn records() -> Self {
        Self {
            wrap: ReturnKind::Records,
        }
    }

    pub fn list() -> Self {
        Self {
            wrap: ReturnKind::List,
        }
    }

    pub fn cursor() -> Self {
        Self {
            wrap: ReturnKind::Cursor,
        }
    }
}

/// Result of a read operation, shaped per [`ReadOptions`].
#[derive(Debug)]
pub enum ReadResult {
    Records(RecordSet),
    List(Vec<Entity>),
    Cursor(Cursor),
    /// A single scalar, produced by calculation reads.
    Value(Value),
}

impl ReadResult {
    pub fn kind(&self) -> &'static str {
        match self {
            ReadResult::Records(_) => "records",
            ReadResult::List(_) => "list",
            ReadResult::Cursor(_) => "cursor",
            ReadResult::Value(_) => "value",
        }
    }

    /// Materialize into a list regardless of the wrapping.
    pub fn into_list(self) -> Vec<Entity> {
        match self {
            ReadResult::Records(records) => records.collect(),
            ReadResult::List(list) => list,
            ReadResult::Cursor(_) | ReadResult::Value(_) => Vec::new(),
        }
    }
}

/// The operation contract every storage adapter satisfies.
///
/// Write operations convert primitive execution failure into `Ok(false)`
/// so callers can branch without exception handling; driver-raised errors
/// (malformed command, lost connection) propagate unmodified.
pub trait Backend {
    fn connect(&mut self) -> RelataResult<()>;
    fn disconnect(&mut self) -> RelataResult<()>;

    /// Names of the sources (tables, collections) the connection exposes.
    fn entities(&mut self) -> RelataResult<Vec<String>>;

    /// Introspect the schema of one source.
    fn describe(&mut self, entity: &str) -> RelataResult<Schema>;

    fn create(&mut self, query: &mut Query) -> RelataResult<bool>;
    fn read(&mut self, query: &mut Query, options: ReadOptions) -> RelataResult<ReadResult>;
    fn update(&mut self, query: &mut Query) -> RelataResult<bool>;
    fn delete(&mut self, query: &mut Query) -> RelataResult<bool>;
}

/// The clause-rendering contract relational adapters implement.
///
/// [`Query::export`](crate::query::Query::export) calls the renderer named
/// after each descriptor attribute; attributes without a renderer are
/// copied through raw.
pub trait Renderer {
    /// Quote an identifier where the engine requires it.
    fn name(&self, identifier: &str) -> String;

    /// Cast a value into a command literal, using the declared field type
    /// when one exists and introspection otherwise.
    fn value(&self, value: &Value, field: Option<&FieldDef>) -> String;

    /// Render the field projection; for create operations this yields a
    /// `(fields, values)` pair.
    fn fields(&self, query: &Query) -> RelataResult<FieldsRender>;

    /// Compile a condition set into an AND-joined clause with the given
    /// prefix (`WHERE`, `HAVING`, or empty for join constraints).
    fn conditions(
        &self,
        conditions: &Conditions,
        query: &Query,
        prefix: &str,
    ) -> RelataResult<String>;

    fn order(&self, order: &OrderSpec, query: &Query) -> String;

    fn limit(&self, limit: Option<u64>, offset: Option<u64>) -> String;

    fn joins(&self, query: &Query) -> RelataResult<String>;

    fn group(&self, group: &[String], query: &Query) -> String;

    fn comment(&self, comment: &str) -> String;
}

/// Output of the fields renderer. `values` is only present for the
/// create shape and flattens into the export.
#[derive(Debug, Clone, Default)]
pub struct FieldsRender {
    pub fields: String,
    pub values: Option<String>,
}

/// A backend that refuses every operation. Useful as a placeholder where
/// resolution never reaches storage (embedded and contained links).
pub struct NullBackend;

impl Backend for NullBackend {
    fn connect(&mut self) -> RelataResult<()> {
        Ok(())
    }

    fn disconnect(&mut self) -> RelataResult<()> {
        Ok(())
    }

    fn entities(&mut self) -> RelataResult<Vec<String>> {
        Err(RelataError::execution("null backend has no sources"))
    }

    fn describe(&mut self, _entity: &str) -> RelataResult<Schema> {
        Err(RelataError::execution("null backend has no schema"))
    }

    fn create(&mut self, _query: &mut Query) -> RelataResult<bool> {
        Err(RelataError::execution("null backend cannot create"))
    }

    fn read(&mut self, _query: &mut Query, _options: ReadOptions) -> RelataResult<ReadResult> {
        Err(RelataError::execution("null backend cannot read"))
    }

    fn update(&mut self, _query: &mut Query) -> RelataResult<bool> {
        Err(RelataError::execution("null backend cannot update"))
    }

    fn delete(&mut self, _query: &mut Query) -> RelataResult<bool> {
        Err(RelataError::execution("null backend cannot delete"))
    }
}

/// Factory producing a fresh backend for a registered kind.
pub type BackendFactory = Box<dyn Fn() -> Box<dyn Backend> + Send + Sync>;

/// Explicit registry mapping a backend-kind key to a factory, validated
/// at registration.
#[derive(Default)]
pub struct BackendRegistry {
    entries: Vec<(String, BackendFactory)>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: impl Into<String>,
        factory: BackendFactory,
    ) -> RelataResult<()> {
        let kind = kind.into();
        if kind.is_empty() {
            return Err(RelataError::argument("backend kind must not be empty"));
        }
        if self.entries.iter().any(|(k, _)| *k == kind) {
            return Err(RelataError::config(format!(
                "backend kind `{kind}` is already registered"
            )));
        }
        self.entries.push((kind, factory));
        Ok(())
    }

    pub fn create(&self, kind: &str) -> RelataResult<Box<dyn Backend>> {
        self.entries
            .iter()
            .find(|(k, _)| k == kind)
            .map(|(_, factory)| factory())
            .ok_or_else(|| RelataError::config(format!("unknown backend kind `{kind}`")))
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.entries.iter().map(|(k, _)| k.as_str()).collect()
    }
}
