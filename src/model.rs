//! The model contract.
//!
//! A [`ModelDef`] describes one record type: its storage source, primary
//! key, schema, meta configuration, and declared relationships. Definitions
//! live in a [`Registry`] keyed by model name, constructed once at
//! configuration time and passed around by handle; after that the registry
//! is treated as read-only.
//!
//! An [`Entity`] is a record handle bound to a query: field values plus the
//! existence flag backends update after successful writes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{RelataError, RelataResult};
use crate::relationship::{RelationConfig, Relationship};
use crate::schema::{FieldDef, Schema};
use crate::value::Value;

/// A record type definition.
#[derive(Debug)]
pub struct ModelDef {
    name: String,
    namespace: String,
    connection: String,
    source: String,
    key: Vec<String>,
    schema: Schema,
    relations: RwLock<Vec<Relationship>>,
}

impl ModelDef {
    /// Create a definition with conventional defaults: source is the
    /// lowercased model name, key is `id`, connection is `default`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            source: name.to_lowercase(),
            name,
            namespace: String::new(),
            connection: "default".to_string(),
            key: vec!["id".to_string()],
            schema: Schema::new(),
            relations: RwLock::new(Vec::new()),
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = connection.into();
        self
    }

    pub fn key<I, S>(mut self, key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key = key.into_iter().map(Into::into).collect();
        self
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Meta-configuration lookup by key.
    pub fn meta(&self, key: &str) -> Option<Value> {
        match key {
            "name" => Some(Value::from(self.name.as_str())),
            "namespace" => Some(Value::from(self.namespace.as_str())),
            "source" => Some(Value::from(self.source.as_str())),
            "connection" => Some(Value::from(self.connection.as_str())),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace_name(&self) -> &str {
        &self.namespace
    }

    pub fn source_name(&self) -> &str {
        &self.source
    }

    pub fn full_schema(&self) -> &Schema {
        &self.schema
    }

    pub fn schema_field(&self, name: &str) -> Option<&FieldDef> {
        self.schema.get(name)
    }

    /// Declared primary key field names.
    pub fn key_names(&self) -> &[String] {
        &self.key
    }

    /// Resolve the primary key against an entity's current values. Returns
    /// `None` when any key field is absent or null.
    pub fn key_values(&self, entity: &Entity) -> Option<Vec<(String, Value)>> {
        let mut values = Vec::with_capacity(self.key.len());
        for field in &self.key {
            match entity.get(field) {
                Some(Value::Null) | None => return None,
                Some(value) => values.push((field.clone(), value.clone())),
            }
        }
        Some(values)
    }

    /// All declared relationships.
    pub fn relations(&self) -> Vec<Relationship> {
        self.relations.read().expect("relation registry poisoned").clone()
    }

    /// One relationship by association name.
    pub fn relation(&self, name: &str) -> Option<Relationship> {
        self.relations
            .read()
            .expect("relation registry poisoned")
            .iter()
            .find(|r| r.name() == name)
            .cloned()
    }
}

/// Process-wide model registry, passed by handle.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    models: Arc<RwLock<HashMap<String, Arc<ModelDef>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model definition, returning its shared handle.
    pub fn register(&self, model: ModelDef) -> Arc<ModelDef> {
        let model = Arc::new(model);
        self.models
            .write()
            .expect("model registry poisoned")
            .insert(model.name().to_string(), Arc::clone(&model));
        model
    }

    pub fn model(&self, name: &str) -> Option<Arc<ModelDef>> {
        self.models
            .read()
            .expect("model registry poisoned")
            .get(name)
            .cloned()
    }

    /// Declare an association on a registered model. Key maps and target
    /// names missing from the config are derived here; see
    /// [`Relationship::new`].
    pub fn relate(&self, origin: &str, config: RelationConfig) -> RelataResult<Relationship> {
        let origin = self
            .model(origin)
            .ok_or_else(|| RelataError::config(format!("unknown model `{origin}`")))?;
        let relationship = Relationship::new(&origin, config, self)?;
        origin
            .relations
            .write()
            .expect("relation registry poisoned")
            .push(relationship.clone());
        Ok(relationship)
    }
}

/// A record bound to a query: field values plus persistence state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Name of the model this record belongs to, when known.
    pub model: Option<String>,
    data: Vec<(String, Value)>,
    /// Whether the record is known to exist in storage.
    pub exists: bool,
    parent: Option<Box<Entity>>,
}

impl Entity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Self::default()
        }
    }

    /// Set a field, replacing any previous value for the same name.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        let field = field.into();
        let value = value.into();
        match self.data.iter_mut().find(|(name, _)| *name == field) {
            Some((_, slot)) => *slot = value,
            None => self.data.push((field, value)),
        }
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    /// Field values in assignment order.
    pub fn data(&self) -> &[(String, Value)] {
        &self.data
    }

    /// The logical parent for records hydrated out of an embedded document.
    pub fn parent(&self) -> Option<&Entity> {
        self.parent.as_deref()
    }

    pub fn set_parent(&mut self, parent: Entity) -> &mut Self {
        self.parent = Some(Box::new(parent));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;

    #[test]
    fn test_registry_roundtrip() {
        let registry = Registry::new();
        registry.register(
            ModelDef::new("Gallery")
                .source("galleries")
                .schema(Schema::new().field(FieldDef::new("id", FieldType::Id))),
        );
        let gallery = registry.model("Gallery").unwrap();
        assert_eq!(gallery.source_name(), "galleries");
        assert_eq!(gallery.key_names(), ["id"]);
        assert_eq!(gallery.meta("source"), Some(Value::from("galleries")));
        assert!(registry.model("Nope").is_none());
    }

    #[test]
    fn test_key_values_requires_all_fields() {
        let model = ModelDef::new("Pair").key(["a", "b"]);
        let mut entity = Entity::new();
        entity.set("a", 1);
        assert_eq!(model.key_values(&entity), None);
        entity.set("b", 2);
        assert_eq!(
            model.key_values(&entity),
            Some(vec![
                ("a".to_string(), Value::Int(1)),
                ("b".to_string(), Value::Int(2)),
            ])
        );
    }

    #[test]
    fn test_entity_set_replaces() {
        let mut entity = Entity::new();
        entity.set("title", "draft").set("title", "final");
        assert_eq!(entity.get("title"), Some(&Value::from("final")));
        assert_eq!(entity.data().len(), 1);
    }
}
