//! Field definitions for a storage source.
//!
//! A [`Schema`] is the ordered set of fields a model (or a backend's
//! `describe`) declares for one source. Backends consult it when casting
//! condition values and when flattening raw result rows back into records.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Abstract column types, mapped to engine-native types by each backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Id,
    String,
    Text,
    Integer,
    Float,
    Boolean,
    Date,
    DateTime,
    Binary,
}

/// A single field definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub ty: FieldType,
    /// Declared length for string-ish types.
    pub length: Option<usize>,
    pub nullable: bool,
    pub default: Option<Value>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            length: None,
            nullable: true,
            default: None,
        }
    }

    pub fn length(mut self, length: usize) -> Self {
        self.length = Some(length);
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// An ordered field set for one source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<FieldDef>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field, replacing any previous definition with the same name.
    pub fn field(mut self, def: FieldDef) -> Self {
        self.fields.retain(|f| f.name != def.name);
        self.fields.push(def);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Field names in declaration order.
    pub fn names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
