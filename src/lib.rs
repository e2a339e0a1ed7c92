//! Backend-agnostic query construction and relational resolution.
//!
//! A [`Query`](query::Query) describes one CRUD operation independently of
//! any storage engine; a [`Backend`](backend::Backend) renders and executes
//! it. Models, their schemas, and the associations between them live in a
//! [`Registry`](model::Registry), and a [`Relationship`](relationship::Relationship)
//! resolves related records per its link kind.

pub mod backend;
pub mod error;
pub mod filters;
pub mod model;
pub mod query;
pub mod relationship;
pub mod schema;
pub mod value;

pub use error::{RelataError, RelataResult};
pub use query::Query;
pub use value::Value;

pub mod prelude {
    pub use crate::backend::{
        Backend, BackendRegistry, Cursor, Driver, ReadOptions, ReadResult, RecordSet, Relational,
        Renderer, ToCommandMap,
    };
    pub use crate::error::{RelataError, RelataResult};
    pub use crate::filters::FilterChain;
    pub use crate::model::{Entity, ModelDef, Registry};
    pub use crate::query::{Conditions, Direction, FieldSpec, Operation, Query};
    pub use crate::relationship::{
        FetchOptions, LinkKind, Related, RelationConfig, RelationType, Relationship,
    };
    pub use crate::schema::{FieldDef, FieldType, Schema};
    pub use crate::value::Value;
}
