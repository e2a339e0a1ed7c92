//! Association descriptors.
//!
//! A [`Relationship`] describes one association between two models, plus
//! the link-kind-specific strategy used to resolve it at fetch time. It is
//! created once when the association is declared (see
//! [`Registry::relate`](crate::model::Registry::relate)) and immutable
//! afterwards.

use serde::{Deserialize, Serialize};

use crate::backend::{Backend, ReadOptions, ReadResult};
use crate::error::{RelataError, RelataResult};
use crate::model::{Entity, ModelDef, Registry};
use crate::query::{ConditionValue, Conditions, Operation, Query};
use crate::value::Value;

/// Association cardinality and direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationType {
    BelongsTo,
    HasOne,
    HasMany,
}

impl RelationType {
    /// Whether resolution fetches a collection rather than a single record.
    pub fn is_plural(self) -> bool {
        matches!(self, RelationType::HasMany)
    }
}

/// How related data is reached: nested in place, back-referenced, or
/// fetched through key fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkKind {
    /// The related data is already nested at the hydration field.
    Embedded,
    /// Back-reference from an embedded child to its logical parent.
    Contained,
    /// Foreign-key lookup against the target model.
    Key,
    /// A list of foreign keys, always resolved as a collection.
    KeyList,
    /// An opaque reference, resolved like a key lookup.
    Ref,
}

/// Declaration-time configuration for an association.
///
/// Only `relation` is mandatory up front; the constructor derives the rest
/// (target, hydration field, key map) from conventions where possible and
/// raises a configuration error where it cannot.
pub struct RelationConfig {
    pub relation: RelationType,
    pub name: Option<String>,
    /// Target model identity. Derived from the origin's namespace plus the
    /// association name when absent.
    pub to: Option<String>,
    /// Key fields on the dependent side, zipped against the declared
    /// primary key to derive the key map.
    pub key: Vec<String>,
    /// Explicit origin-field to target-field pairs, bypassing derivation.
    pub key_map: Option<Vec<(String, String)>>,
    pub link: Option<LinkKind>,
    /// Field projection applied to fetched records. Empty means all.
    pub fields: Vec<String>,
    /// Name of the field related data hydrates into.
    pub field_name: Option<String>,
    /// Constraints merged into every fetch and join for this association.
    pub constraints: Conditions,
    /// Late-binding hook, applied once before derivation.
    pub strategy: Option<fn(&mut RelationConfig)>,
}

impl RelationConfig {
    pub fn new(relation: RelationType, name: impl Into<String>) -> Self {
        Self {
            relation,
            name: Some(name.into()),
            to: None,
            key: Vec::new(),
            key_map: None,
            link: None,
            fields: Vec::new(),
            field_name: None,
            constraints: Conditions::new(),
            strategy: None,
        }
    }

    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
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

    pub fn key_map<I, A, B>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        self.key_map = Some(
            pairs
                .into_iter()
                .map(|(a, b)| (a.into(), b.into()))
                .collect(),
        );
        self
    }

    pub fn link(mut self, link: LinkKind) -> Self {
        self.link = Some(link);
        self
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn field_name(mut self, field_name: impl Into<String>) -> Self {
        self.field_name = Some(field_name.into());
        self
    }

    pub fn constraints(mut self, constraints: impl Into<Conditions>) -> Self {
        self.constraints = constraints.into();
        self
    }

    pub fn strategy(mut self, hook: fn(&mut RelationConfig)) -> Self {
        self.strategy = Some(hook);
        self
    }
}

/// Result of resolving an association against one record.
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    /// Raw nested value (embedded links).
    Value(Value),
    /// A single related record.
    Entity(Entity),
    /// A related collection.
    Set(Vec<Entity>),
}

/// An immutable association between two models.
#[derive(Debug, Clone, PartialEq)]
pub struct Relationship {
    name: String,
    relation: RelationType,
    from: String,
    to: String,
    /// Origin-field to target-field pairs, in key order.
    key: Vec<(String, String)>,
    link: LinkKind,
    fields: Vec<String>,
    field_name: String,
    constraints: Conditions,
}

impl Relationship {
    /// Build an association from its declaration-time config.
    ///
    /// Missing pieces are derived: the target from the origin's namespace
    /// plus the association name, the hydration field from the name, and
    /// the key map by zipping the supplied key list against the declared
    /// primary key. For `HasOne`/`HasMany` the declared key is the origin
    /// model's; for `BelongsTo` the direction reverses and the target's key
    /// is used. A cardinality mismatch is a configuration error.
    pub fn new(
        origin: &ModelDef,
        mut config: RelationConfig,
        registry: &Registry,
    ) -> RelataResult<Relationship> {
        if let Some(hook) = config.strategy.take() {
            hook(&mut config);
        }

        let name = match (&config.name, &config.to) {
            (Some(name), _) => name.clone(),
            (None, Some(to)) => to.rsplit('.').next().unwrap_or(to).to_string(),
            (None, None) => {
                return Err(RelataError::config(
                    "a relationship requires at least one of `to` or `name`",
                ))
            }
        };

        let to = config.to.clone().unwrap_or_else(|| {
            if origin.namespace_name().is_empty() {
                name.clone()
            } else {
                format!("{}.{}", origin.namespace_name(), name)
            }
        });

        let field_name = config
            .field_name
            .clone()
            .unwrap_or_else(|| underscore(&name));

        let key = match config.key_map.take() {
            Some(map) => {
                if let Some(target) = registry.model(&to) {
                    if map.len() != target.key_names().len() {
                        return Err(RelataError::config(format!(
                            "relationship `{name}`: key map has {} pair(s) but `{to}` declares {} key field(s)",
                            map.len(),
                            target.key_names().len()
                        )));
                    }
                }
                map
            }
            None => {
                let declared: Vec<String> = match config.relation {
                    RelationType::BelongsTo => registry
                        .model(&to)
                        .ok_or_else(|| {
                            RelataError::config(format!(
                                "relationship `{name}`: unknown target model `{to}`"
                            ))
                        })?
                        .key_names()
                        .to_vec(),
                    RelationType::HasOne | RelationType::HasMany => origin.key_names().to_vec(),
                };
                if declared.is_empty() {
                    return Err(RelataError::config(format!(
                        "relationship `{name}`: related model declares no key"
                    )));
                }
                let supplied = if config.key.is_empty() {
                    let base = match config.relation {
                        RelationType::BelongsTo => underscore(&name),
                        _ => underscore(origin.name()),
                    };
                    if declared.len() != 1 {
                        return Err(RelataError::config(format!(
                            "relationship `{name}`: cannot derive a composite key, supply one explicitly"
                        )));
                    }
                    vec![format!("{base}_id")]
                } else {
                    config.key.clone()
                };
                if supplied.len() != declared.len() {
                    return Err(RelataError::config(format!(
                        "relationship `{name}`: supplied key has {} field(s) but the declared key has {}",
                        supplied.len(),
                        declared.len()
                    )));
                }
                match config.relation {
                    // origin pk -> dependent fk
                    RelationType::HasOne | RelationType::HasMany => {
                        declared.into_iter().zip(supplied).collect()
                    }
                    // dependent fk -> target pk
                    RelationType::BelongsTo => supplied.into_iter().zip(declared).collect(),
                }
            }
        };

        Ok(Relationship {
            name,
            relation: config.relation,
            from: origin.name().to_string(),
            to,
            key,
            link: config.link.unwrap_or(LinkKind::Key),
            fields: config.fields,
            field_name,
            constraints: config.constraints,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn relation(&self) -> RelationType {
        self.relation
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    /// Origin-field to target-field pairs.
    pub fn key(&self) -> &[(String, String)] {
        &self.key
    }

    pub fn link(&self) -> LinkKind {
        self.link
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    pub fn constraints(&self) -> &Conditions {
        &self.constraints
    }

    /// Resolve the association for one record.
    ///
    /// Dispatches on the link kind: embedded and contained links resolve
    /// without touching the backend; key and keylist links build conditions
    /// from the record's current values and fetch from the target model. A
    /// required origin field that is absent resolves silently to `None`.
    pub fn get(
        &self,
        entity: &Entity,
        backend: &mut dyn Backend,
        registry: &Registry,
        options: FetchOptions,
    ) -> RelataResult<Option<Related>> {
        match self.link {
            LinkKind::Embedded => Ok(entity
                .get(&self.field_name)
                .cloned()
                .map(Related::Value)),
            LinkKind::Contained => {
                let parent = match self.relation {
                    RelationType::HasMany => entity.parent().and_then(Entity::parent),
                    _ => entity.parent(),
                };
                Ok(parent.cloned().map(Related::Entity))
            }
            LinkKind::Key | LinkKind::Ref => {
                let mut conditions = self.constraints.clone();
                for (origin_field, target_field) in &self.key {
                    match entity.get(origin_field) {
                        None | Some(Value::Null) => return Ok(None),
                        Some(value) => {
                            conditions
                                .add(target_field.clone(), ConditionValue::from(value.clone()));
                        }
                    }
                }
                let records = self.fetch(conditions, backend, registry, options)?;
                if self.relation.is_plural() {
                    Ok(Some(Related::Set(records)))
                } else {
                    Ok(records.into_iter().next().map(Related::Entity))
                }
            }
            LinkKind::KeyList => {
                let mut conditions = self.constraints.clone();
                for (origin_field, target_field) in &self.key {
                    match entity.get(origin_field) {
                        None | Some(Value::Null) => return Ok(None),
                        Some(Value::Array(items)) => {
                            conditions.add(target_field.clone(), ConditionValue::List(items.clone()));
                        }
                        Some(value) => {
                            conditions
                                .add(target_field.clone(), ConditionValue::List(vec![value.clone()]));
                        }
                    }
                }
                let records = self.fetch(conditions, backend, registry, options)?;
                Ok(Some(Related::Set(records)))
            }
        }
    }

    fn fetch(
        &self,
        conditions: Conditions,
        backend: &mut dyn Backend,
        registry: &Registry,
        options: FetchOptions,
    ) -> RelataResult<Vec<Entity>> {
        let target = registry.model(&self.to).ok_or_else(|| {
            RelataError::config(format!(
                "relationship `{}`: unknown target model `{}`",
                self.name, self.to
            ))
        })?;
        let mut query = Query::for_model(Operation::Read, target, registry.clone())
            .conditions(conditions)
            .conditions(options.conditions);
        if !self.fields.is_empty() {
            query = query.fields(self.fields.iter().map(String::as_str));
        }
        if !options.fields.is_empty() {
            query = query.fields(options.fields.iter().map(String::as_str));
        }
        if let Some(limit) = options.limit {
            query = query.limit(limit);
        }
        match backend.read(&mut query, ReadOptions::list())? {
            ReadResult::List(records) => Ok(records),
            ReadResult::Records(records) => Ok(records.collect()),
            other => Err(RelataError::execution(format!(
                "relationship `{}`: backend returned an unusable result shape ({})",
                self.name,
                other.kind()
            ))),
        }
    }

    /// Project a primary-key value into dependent-side foreign-key values.
    ///
    /// Accepts either a scalar (single-field keys) or a map of key fields.
    /// The key map direction inverts for `BelongsTo`.
    pub fn foreign_key(&self, pk: &Value) -> Vec<(String, Value)> {
        let mut out = Vec::with_capacity(self.key.len());
        for (origin_field, target_field) in &self.key {
            let (pk_field, fk_field) = match self.relation {
                RelationType::BelongsTo => (target_field, origin_field),
                _ => (origin_field, target_field),
            };
            let value = match pk {
                Value::Map(pairs) => pairs
                    .iter()
                    .find(|(name, _)| name == pk_field)
                    .map(|(_, v)| v.clone())
                    .unwrap_or(Value::Null),
                scalar => scalar.clone(),
            };
            out.push((fk_field.clone(), value));
        }
        out
    }
}

/// Caller options merged into a relationship fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub conditions: Conditions,
    pub fields: Vec<String>,
    pub limit: Option<u64>,
}

/// Lower-snake a model or association name: `BlogPost` -> `blog_post`.
pub(crate) fn underscore(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelDef, Registry};
    use crate::schema::{FieldDef, FieldType, Schema};

    fn gallery_schema() -> Schema {
        Schema::new()
            .field(FieldDef::new("id", FieldType::Id))
            .field(FieldDef::new("title", FieldType::String))
    }

    fn registry() -> Registry {
        let registry = Registry::new();
        registry.register(ModelDef::new("Gallery").source("galleries").schema(gallery_schema()));
        registry.register(
            ModelDef::new("Image").source("images").schema(
                Schema::new()
                    .field(FieldDef::new("id", FieldType::Id))
                    .field(FieldDef::new("gallery_id", FieldType::Integer)),
            ),
        );
        registry
    }

    #[test]
    fn test_has_many_key_derivation() {
        let registry = registry();
        let rel = registry
            .relate(
                "Gallery",
                RelationConfig::new(RelationType::HasMany, "Images").key(["gallery_id"]),
            )
            .unwrap();
        assert_eq!(rel.key(), [("id".to_string(), "gallery_id".to_string())]);
        assert_eq!(rel.to(), "Images");
    }

    #[test]
    fn test_belongs_to_reverses_direction() {
        let registry = registry();
        let rel = registry
            .relate(
                "Image",
                RelationConfig::new(RelationType::BelongsTo, "Gallery").key(["gallery_id"]),
            )
            .unwrap();
        assert_eq!(rel.key(), [("gallery_id".to_string(), "id".to_string())]);
    }

    #[test]
    fn test_cardinality_mismatch_is_config_error() {
        let registry = registry();
        let err = registry
            .relate(
                "Gallery",
                RelationConfig::new(RelationType::HasMany, "Images")
                    .key(["gallery_id", "extra_id"]),
            )
            .unwrap_err();
        assert!(matches!(err, RelataError::Config(_)));
    }

    #[test]
    fn test_requires_to_or_name() {
        let registry = registry();
        let gallery = registry.model("Gallery").unwrap();
        let mut config = RelationConfig::new(RelationType::HasMany, "ignored");
        config.name = None;
        let err = Relationship::new(&gallery, config, &registry).unwrap_err();
        assert!(matches!(err, RelataError::Config(_)));
    }

    #[test]
    fn test_foreign_key_projection() {
        let registry = registry();
        let rel = registry
            .relate(
                "Gallery",
                RelationConfig::new(RelationType::HasMany, "Images")
                    .to("Image")
                    .key(["gallery_id"]),
            )
            .unwrap();
        assert_eq!(
            rel.foreign_key(&Value::Int(7)),
            vec![("gallery_id".to_string(), Value::Int(7))]
        );

        let belongs = registry
            .relate(
                "Image",
                RelationConfig::new(RelationType::BelongsTo, "Gallery").key(["gallery_id"]),
            )
            .unwrap();
        let pk = Value::Map(vec![("id".to_string(), Value::Int(3))]);
        assert_eq!(
            belongs.foreign_key(&pk),
            vec![("gallery_id".to_string(), Value::Int(3))]
        );
    }

    #[test]
    fn test_strategy_hook_applies_once_at_init() {
        let registry = registry();
        let rel = registry
            .relate(
                "Gallery",
                RelationConfig::new(RelationType::HasMany, "Images")
                    .to("Image")
                    .key(["gallery_id"])
                    .strategy(|config| {
                        config.fields = vec!["id".to_string()];
                    }),
            )
            .unwrap();
        assert_eq!(rel.fields(), ["id"]);
    }

    #[test]
    fn test_embedded_link_reads_in_place() {
        let registry = registry();
        let rel = registry
            .relate(
                "Gallery",
                RelationConfig::new(RelationType::HasMany, "Images")
                    .to("Image")
                    .key(["gallery_id"])
                    .link(LinkKind::Embedded)
                    .field_name("images"),
            )
            .unwrap();
        let mut entity = Entity::for_model("Gallery");
        entity.set("images", Value::Array(vec![Value::Int(1)]));
        // Embedded resolution never needs a live backend.
        let mut backend = crate::backend::NullBackend;
        let related = rel
            .get(&entity, &mut backend, &registry, FetchOptions::default())
            .unwrap();
        assert_eq!(
            related,
            Some(Related::Value(Value::Array(vec![Value::Int(1)])))
        );
    }

    /// Backend recording the conditions of every read it serves.
    #[derive(Default)]
    struct StubBackend {
        seen: Vec<Conditions>,
        rows: Vec<Entity>,
    }

    impl Backend for StubBackend {
        fn connect(&mut self) -> RelataResult<()> {
            Ok(())
        }

        fn disconnect(&mut self) -> RelataResult<()> {
            Ok(())
        }

        fn entities(&mut self) -> RelataResult<Vec<String>> {
            Ok(Vec::new())
        }

        fn describe(&mut self, _entity: &str) -> RelataResult<Schema> {
            Ok(Schema::new())
        }

        fn create(&mut self, _query: &mut Query) -> RelataResult<bool> {
            Ok(false)
        }

        fn read(&mut self, query: &mut Query, _options: ReadOptions) -> RelataResult<ReadResult> {
            self.seen.push(query.effective_conditions()?);
            Ok(ReadResult::List(self.rows.clone()))
        }

        fn update(&mut self, _query: &mut Query) -> RelataResult<bool> {
            Ok(false)
        }

        fn delete(&mut self, _query: &mut Query) -> RelataResult<bool> {
            Ok(false)
        }
    }

    #[test]
    fn test_key_link_fetches_with_derived_conditions() {
        let registry = registry();
        let rel = registry
            .relate(
                "Gallery",
                RelationConfig::new(RelationType::HasMany, "Images")
                    .to("Image")
                    .key(["gallery_id"]),
            )
            .unwrap();
        let mut entity = Entity::for_model("Gallery");
        entity.set("id", 1);

        let mut backend = StubBackend::default();
        backend.rows = vec![Entity::for_model("Image")];
        let related = rel
            .get(&entity, &mut backend, &registry, FetchOptions::default())
            .unwrap();
        assert!(matches!(related, Some(Related::Set(ref set)) if set.len() == 1));

        let mut expected = Conditions::new();
        expected.add("gallery_id", ConditionValue::Scalar(Value::Int(1)));
        assert_eq!(backend.seen, vec![expected]);
    }

    #[test]
    fn test_key_list_link_builds_in_conditions() {
        let registry = registry();
        let rel = registry
            .relate(
                "Gallery",
                RelationConfig::new(RelationType::HasMany, "Images")
                    .to("Image")
                    .key_map([("image_ids", "id")])
                    .link(LinkKind::KeyList),
            )
            .unwrap();
        let mut entity = Entity::for_model("Gallery");
        entity.set("image_ids", vec![1, 2]);

        let mut backend = StubBackend::default();
        let related = rel
            .get(&entity, &mut backend, &registry, FetchOptions::default())
            .unwrap();
        // Key lists always resolve to a collection, even when empty.
        assert!(matches!(related, Some(Related::Set(_))));

        let mut expected = Conditions::new();
        expected.add(
            "id",
            ConditionValue::List(vec![Value::Int(1), Value::Int(2)]),
        );
        assert_eq!(backend.seen, vec![expected]);

        // A scalar in the list field wraps into a one-element list.
        let mut scalar = Entity::for_model("Gallery");
        scalar.set("image_ids", 7);
        rel.get(&scalar, &mut backend, &registry, FetchOptions::default())
            .unwrap();
        let mut wrapped = Conditions::new();
        wrapped.add("id", ConditionValue::List(vec![Value::Int(7)]));
        assert_eq!(backend.seen[1], wrapped);
    }

    #[test]
    fn test_underscore() {
        assert_eq!(underscore("Gallery"), "gallery");
        assert_eq!(underscore("BlogPost"), "blog_post");
    }
}
