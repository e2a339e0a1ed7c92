//! The query descriptor.
//!
//! A [`Query`] aggregates everything needed to describe one CRUD operation
//! independently of any storage engine: operation type, source, field set,
//! conditions, paging, joins, eager-load paths, and the alias bookkeeping
//! that keeps repeated models distinct across a join graph. Backends
//! receive it through [`Query::export`] and render it into their native
//! command form.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::Renderer;
use crate::error::{RelataError, RelataResult};
use crate::model::{Entity, ModelDef, Registry};
use crate::relationship::Relationship;
use crate::schema::{FieldDef, Schema};
use crate::value::Value;

/// The CRUD operation a descriptor requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

/// Join flavor for child descriptors attached as joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
}

impl JoinKind {
    pub fn keyword(self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER",
            JoinKind::Left => "LEFT",
            JoinKind::Right => "RIGHT",
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    /// Parse a direction token, normalizing anything unrecognized to ASC.
    pub fn parse(token: &str) -> Direction {
        if token.trim().eq_ignore_ascii_case("desc") {
            Direction::Desc
        } else {
            Direction::Asc
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

/// Ordering specification.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderSpec {
    /// A single column name, a `col DIR` string, or a raw fragment;
    /// backends decide which by inspecting the schema.
    Column(String),
    /// Columns zipped to directions.
    List(Vec<(String, Direction)>),
}

/// One entry in a field specification.
///
/// Nested entries flatten recursively into dotted `relation.field` names.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldSpec {
    Name(String),
    Raw(String),
    Nested(String, Vec<FieldSpec>),
}

impl FieldSpec {
    pub fn raw(expr: impl Into<String>) -> Self {
        FieldSpec::Raw(expr.into())
    }

    pub fn nested<I, F>(relation: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<FieldSpec>,
    {
        FieldSpec::Nested(
            relation.into(),
            fields.into_iter().map(Into::into).collect(),
        )
    }
}

impl From<&str> for FieldSpec {
    fn from(s: &str) -> Self {
        // Anything that is not a plain (possibly dotted) identifier is a
        // computed expression and passes through verbatim.
        let plain = s == "*"
            || s.chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '.');
        if plain {
            FieldSpec::Name(s.to_string())
        } else {
            FieldSpec::Raw(s.to_string())
        }
    }
}

impl From<String> for FieldSpec {
    fn from(s: String) -> Self {
        FieldSpec::from(s.as_str())
    }
}

/// The value side of one keyed condition.
#[derive(Debug, Clone)]
pub enum ConditionValue {
    Scalar(Value),
    List(Vec<Value>),
    /// Correlated sub-descriptor, rendered as `col IN (<subselect>)`.
    Sub(Box<Query>),
}

impl PartialEq for ConditionValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ConditionValue::Scalar(a), ConditionValue::Scalar(b)) => a == b,
            (ConditionValue::List(a), ConditionValue::List(b)) => a == b,
            // Sub-descriptors carry registry handles and have no structural
            // identity.
            _ => false,
        }
    }
}

impl From<Value> for ConditionValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Array(items) => ConditionValue::List(items),
            value => ConditionValue::Scalar(value),
        }
    }
}

impl<V: Into<Value>> From<Vec<V>> for ConditionValue {
    fn from(items: Vec<V>) -> Self {
        ConditionValue::List(items.into_iter().map(Into::into).collect())
    }
}

macro_rules! scalar_condition_from {
    ($($ty:ty),+) => {
        $(impl From<$ty> for ConditionValue {
            fn from(v: $ty) -> Self {
                ConditionValue::Scalar(v.into())
            }
        })+
    };
}

scalar_condition_from!(bool, i32, i64, u64, f64, &str, String);

/// One compiled condition entry, kept in insertion order.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionEntry {
    /// Raw fragment, passed through verbatim.
    Fragment(String),
    /// Keyed comparison.
    Field(String, ConditionValue),
    /// Column-to-column binding, used for join constraints.
    Bind(String, String),
}

/// An ordered condition set. Merging appends; it never replaces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conditions {
    entries: Vec<ConditionEntry>,
}

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, value: ConditionValue) -> &mut Self {
        self.entries
            .push(ConditionEntry::Field(field.into(), value));
        self
    }

    pub fn fragment(&mut self, fragment: impl Into<String>) -> &mut Self {
        self.entries.push(ConditionEntry::Fragment(fragment.into()));
        self
    }

    pub fn bind(&mut self, left: impl Into<String>, right: impl Into<String>) -> &mut Self {
        self.entries
            .push(ConditionEntry::Bind(left.into(), right.into()));
        self
    }

    /// Append every entry of `other`, preserving both orders.
    pub fn merge(&mut self, other: Conditions) -> &mut Self {
        self.entries.extend(other.entries);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[ConditionEntry] {
        &self.entries
    }
}

impl<S: Into<String>, V: Into<ConditionValue>> From<Vec<(S, V)>> for Conditions {
    fn from(pairs: Vec<(S, V)>) -> Self {
        let mut conditions = Conditions::new();
        for (field, value) in pairs {
            conditions.add(field, value.into());
        }
        conditions
    }
}

/// Per-path relationship bookkeeping recorded while a join graph builds.
#[derive(Debug, Clone)]
pub struct RelationPathConfig {
    pub path: String,
    pub alias: String,
    pub relationship: Relationship,
}

/// Rendered attributes of one descriptor, keyed for template substitution.
///
/// Typed accessors cover the known clauses; [`Export::get`] is the generic
/// escape hatch the command templates read through, so placeholders for
/// attributes a backend never rendered simply resolve to nothing.
#[derive(Debug, Clone, Default)]
pub struct Export {
    pub source: String,
    pub fields: String,
    pub values: String,
    pub conditions: String,
    pub having: String,
    pub group: String,
    pub order: String,
    pub limit: String,
    pub joins: String,
    pub constraints: String,
    pub columns: String,
    pub comment: String,
    extras: Vec<(String, String)>,
}

impl Export {
    pub fn set_extra(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.extras.push((key.into(), value.into()));
    }

    /// Look up a rendered attribute by placeholder name.
    pub fn get(&self, key: &str) -> Option<&str> {
        let known = match key {
            "source" => &self.source,
            "fields" => &self.fields,
            "values" => &self.values,
            "conditions" => &self.conditions,
            "having" => &self.having,
            "group" => &self.group,
            "order" => &self.order,
            "limit" => &self.limit,
            "joins" => &self.joins,
            "constraints" => &self.constraints,
            "columns" => &self.columns,
            "comment" => &self.comment,
            _ => {
                return self
                    .extras
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.as_str())
            }
        };
        Some(known.as_str())
    }
}

/// A mutable CRUD operation descriptor.
#[derive(Debug, Clone)]
pub struct Query {
    pub op: Operation,
    pub source: Option<String>,
    /// Join flavor; only meaningful on child descriptors attached as joins.
    pub join_kind: Option<JoinKind>,
    /// Join constraints; only meaningful on child descriptors.
    pub constraints: Conditions,
    pub joins: Vec<Query>,
    pub group: Vec<String>,
    pub order: Option<OrderSpec>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub page: Option<u64>,
    /// Pending field values for create/update.
    pub data: Vec<(String, Value)>,
    /// Bound record whose persistence state tracks execution results.
    pub entity: Option<Entity>,
    /// Restricts which data fields a write may touch. Empty means all.
    pub whitelist: Vec<String>,
    /// Calculation op (e.g. `count`); replaces the field list on read.
    pub calculate: Option<String>,
    pub comment: Option<String>,
    /// Overrides the bound model's schema for casting and row flattening.
    pub schema_override: Option<Schema>,
    alias: Option<String>,
    fields: Vec<String>,
    raw_fields: Vec<String>,
    conditions: Conditions,
    having: Conditions,
    with: Vec<String>,
    relationships: Vec<RelationPathConfig>,
    model: Option<Arc<ModelDef>>,
    registry: Option<Registry>,
    alias_counts: HashMap<String, usize>,
    alias_paths: Vec<(String, String)>,
    alias_models: Vec<(String, String)>,
    extras: Vec<(String, Value)>,
    built: bool,
}

impl Query {
    pub fn new(op: Operation) -> Self {
        Self {
            op,
            source: None,
            join_kind: None,
            constraints: Conditions::new(),
            joins: Vec::new(),
            group: Vec::new(),
            order: None,
            limit: None,
            offset: None,
            page: None,
            data: Vec::new(),
            entity: None,
            whitelist: Vec::new(),
            calculate: None,
            comment: None,
            schema_override: None,
            alias: None,
            fields: Vec::new(),
            raw_fields: Vec::new(),
            conditions: Conditions::new(),
            having: Conditions::new(),
            with: Vec::new(),
            relationships: Vec::new(),
            model: None,
            registry: None,
            alias_counts: HashMap::new(),
            alias_paths: Vec::new(),
            alias_models: Vec::new(),
            extras: Vec::new(),
            built: false,
        }
    }

    /// Create a read descriptor for the given source.
    pub fn read(source: impl Into<String>) -> Self {
        let mut query = Self::new(Operation::Read);
        query.source = Some(source.into());
        query
    }

    /// Create an insert descriptor for the given source.
    pub fn create(source: impl Into<String>) -> Self {
        let mut query = Self::new(Operation::Create);
        query.source = Some(source.into());
        query
    }

    /// Create an update descriptor for the given source.
    pub fn update(source: impl Into<String>) -> Self {
        let mut query = Self::new(Operation::Update);
        query.source = Some(source.into());
        query
    }

    /// Create a delete descriptor for the given source.
    pub fn delete(source: impl Into<String>) -> Self {
        let mut query = Self::new(Operation::Delete);
        query.source = Some(source.into());
        query
    }

    /// Create a descriptor bound to a registered model: the source comes
    /// from the model, and the model name becomes the root alias.
    pub fn for_model(op: Operation, model: Arc<ModelDef>, registry: Registry) -> Self {
        let mut query = Self::new(op);
        query.source = Some(model.source_name().to_string());
        query.registry = Some(registry);
        query.model = Some(model);
        let name = query.model.as_ref().map(|m| m.name().to_string());
        if let Some(name) = name {
            query.set_alias(name);
        }
        query
    }

    pub fn model(&self) -> Option<&Arc<ModelDef>> {
        self.model.as_ref()
    }

    /// The schema conditions and fields resolve against: the explicit
    /// override when present, else the bound model's.
    pub fn schema(&self) -> Option<&Schema> {
        self.schema_override
            .as_ref()
            .or_else(|| self.model.as_ref().map(|m| m.full_schema()))
    }

    pub fn schema_field(&self, name: &str) -> Option<&FieldDef> {
        let bare = name.rsplit('.').next().unwrap_or(name);
        self.schema().and_then(|s| s.get(bare))
    }

    // ------------------------------------------------------------------
    // Fields
    // ------------------------------------------------------------------

    /// Add field names and raw expressions. Nested entries flatten into
    /// dotted `relation.field` names; duplicate names are dropped.
    pub fn fields<I, F>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<FieldSpec>,
    {
        for spec in specs {
            self.push_field(spec.into(), None);
        }
        self
    }

    fn push_field(&mut self, spec: FieldSpec, prefix: Option<&str>) {
        match spec {
            FieldSpec::Name(name) => {
                let name = match prefix {
                    Some(prefix) => format!("{prefix}.{name}"),
                    None => name,
                };
                if !self.fields.contains(&name) {
                    self.fields.push(name);
                }
            }
            FieldSpec::Raw(expr) => self.raw_fields.push(expr),
            FieldSpec::Nested(relation, children) => {
                let nested = match prefix {
                    Some(prefix) => format!("{prefix}.{relation}"),
                    None => relation,
                };
                for child in children {
                    self.push_field(child, Some(&nested));
                }
            }
        }
    }

    /// Drop the whole field set, named and raw.
    pub fn clear_fields(&mut self) -> &mut Self {
        self.fields.clear();
        self.raw_fields.clear();
        self
    }

    /// Named fields in insertion order, followed by raw expressions.
    pub fn field_list(&self) -> Vec<String> {
        let mut out = self.fields.clone();
        out.extend(self.raw_fields.iter().cloned());
        out
    }

    // ------------------------------------------------------------------
    // Conditions
    // ------------------------------------------------------------------

    /// Merge a condition set into the existing one. Never replaces.
    pub fn conditions<C: Into<Conditions>>(mut self, spec: C) -> Self {
        self.conditions.merge(spec.into());
        self
    }

    /// Add one `field = value` condition.
    pub fn filter(mut self, field: impl Into<String>, value: impl Into<ConditionValue>) -> Self {
        self.conditions.add(field, value.into());
        self
    }

    /// Add one `field IN (...)` condition.
    pub fn filter_in<I, V>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.conditions.add(
            field,
            ConditionValue::List(values.into_iter().map(Into::into).collect()),
        );
        self
    }

    /// Add a raw condition fragment, passed through verbatim.
    pub fn filter_raw(mut self, fragment: impl Into<String>) -> Self {
        self.conditions.fragment(fragment);
        self
    }

    /// Add a correlated `field IN (<subselect>)` condition.
    pub fn filter_sub(mut self, field: impl Into<String>, sub: Query) -> Self {
        self.conditions
            .add(field, ConditionValue::Sub(Box::new(sub)));
        self
    }

    pub fn condition_entries(&self) -> &Conditions {
        &self.conditions
    }

    /// Merge a having condition set.
    pub fn having<C: Into<Conditions>>(mut self, spec: C) -> Self {
        self.having.merge(spec.into());
        self
    }

    pub fn having_entries(&self) -> &Conditions {
        &self.having
    }

    /// The conditions a backend should compile: the explicit set when any
    /// is present, else conditions derived from the bound record's primary
    /// key. A bound record whose key cannot be resolved is a configuration
    /// error on everything but create.
    pub fn effective_conditions(&self) -> RelataResult<Conditions> {
        if !self.conditions.is_empty() {
            return Ok(self.conditions.clone());
        }
        let entity = match &self.entity {
            Some(entity) => entity,
            None => return Ok(Conditions::new()),
        };
        if self.op == Operation::Create {
            return Ok(Conditions::new());
        }
        let model = self.model.as_ref().ok_or_else(|| {
            RelataError::config("cannot derive conditions from a record without a bound model")
        })?;
        let key_values = model.key_values(entity).ok_or_else(|| {
            RelataError::config(format!(
                "could not resolve the primary key of `{}` for implicit conditions",
                model.name()
            ))
        })?;
        let mut conditions = Conditions::new();
        for (field, value) in key_values {
            conditions.add(field, ConditionValue::Scalar(value));
        }
        Ok(conditions)
    }

    // ------------------------------------------------------------------
    // Paging and simple attributes
    // ------------------------------------------------------------------

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Set the page, overwriting the offset as `(page - 1) * limit`.
    pub fn page(mut self, page: u64) -> Self {
        self.page = Some(page);
        self.offset = Some(page.saturating_sub(1) * self.limit.unwrap_or(0));
        self
    }

    pub fn order(mut self, column: impl Into<String>) -> Self {
        self.order = Some(OrderSpec::Column(column.into()));
        self
    }

    pub fn order_by<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = (S, Direction)>,
        S: Into<String>,
    {
        self.order = Some(OrderSpec::List(
            items.into_iter().map(|(c, d)| (c.into(), d)).collect(),
        ));
        self
    }

    pub fn group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Request a calculation (e.g. `count`) instead of a field projection.
    pub fn calculate(mut self, op: impl Into<String>) -> Self {
        self.calculate = Some(op.into());
        self
    }

    pub fn whitelist<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Set pending field values for a write.
    pub fn data<I, S, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, V)>,
        S: Into<String>,
        V: Into<Value>,
    {
        for (field, value) in pairs {
            self.data.push((field.into(), value.into()));
        }
        self
    }

    /// Bind a record whose values and persistence state back this query.
    pub fn bind(mut self, entity: Entity) -> Self {
        self.entity = Some(entity);
        self
    }

    pub fn set_extra(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.extras.push((key.into(), value.into()));
    }

    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extras
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    // ------------------------------------------------------------------
    // Aliasing
    // ------------------------------------------------------------------

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// The alias already bound to a dotted relation path, if any.
    pub fn alias_of(&self, path: &str) -> Option<&str> {
        self.alias_paths
            .iter()
            .find(|(_, p)| p == path)
            .map(|(alias, _)| alias.as_str())
    }

    /// Set the descriptor's own alias, recording alias-to-model when a
    /// model is bound.
    pub fn set_alias(&mut self, alias: impl Into<String>) -> &mut Self {
        let alias = alias.into();
        if let Some(model) = &self.model {
            self.alias_models
                .push((alias.clone(), model.name().to_string()));
        }
        self.alias_counts.entry(alias.clone()).or_insert(1);
        self.alias = Some(alias);
        self
    }

    /// Consuming form of [`Query::set_alias`] for builder chains.
    pub fn aliased(mut self, alias: impl Into<String>) -> Self {
        self.set_alias(alias);
        self
    }

    /// Assign a unique alias to a relation path.
    ///
    /// The base name is the explicit value or the path's last segment; a
    /// base already used in this descriptor gets an incrementing `__N`
    /// suffix, so repeated models across a join graph stay distinct. The
    /// assignment is recorded by path.
    pub fn alias_for(&mut self, value: Option<&str>, path: &str) -> String {
        let base = value
            .map(str::to_string)
            .unwrap_or_else(|| path.rsplit('.').next().unwrap_or(path).to_string());
        let count = self.alias_counts.entry(base.clone()).or_insert(0);
        *count += 1;
        let alias = if *count == 1 {
            base
        } else {
            format!("{base}__{count}")
        };
        self.alias_paths.push((alias.clone(), path.to_string()));
        alias
    }

    /// Alias-to-model assignments recorded so far.
    pub fn alias_models(&self) -> &[(String, String)] {
        &self.alias_models
    }

    // ------------------------------------------------------------------
    // Eager loading and joins
    // ------------------------------------------------------------------

    /// Declare eager-load relation paths. Requires a bound model.
    pub fn with<I, S>(mut self, paths: I) -> RelataResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.model.is_none() {
            return Err(RelataError::config(
                "eager loading requires a query bound to a model",
            ));
        }
        for path in paths {
            let path = path.into();
            if !self.with.contains(&path) {
                self.with.push(path);
            }
        }
        Ok(self)
    }

    pub fn with_paths(&self) -> &[String] {
        &self.with
    }

    /// Register the relationship chain for a dotted path, assigning an
    /// alias to every segment not yet seen. Returns the path's alias.
    pub fn relationship(&mut self, path: &str) -> RelataResult<String> {
        if path.is_empty() {
            return Err(RelataError::argument("relation path must not be empty"));
        }
        let registry = self
            .registry
            .clone()
            .ok_or_else(|| RelataError::config("relation paths require a model registry"))?;
        let mut current = self
            .model
            .clone()
            .ok_or_else(|| RelataError::config("relation paths require a bound model"))?;
        let mut assembled = String::new();
        let mut last_alias = String::new();
        for segment in path.split('.') {
            if segment.is_empty() {
                return Err(RelataError::argument(format!(
                    "malformed relation path `{path}`"
                )));
            }
            let relationship = current.relation(segment).ok_or_else(|| {
                RelataError::config(format!(
                    "model `{}` declares no relation `{segment}`",
                    current.name()
                ))
            })?;
            if assembled.is_empty() {
                assembled = segment.to_string();
            } else {
                assembled = format!("{assembled}.{segment}");
            }
            if let Some(alias) = self.alias_of(&assembled) {
                last_alias = alias.to_string();
            } else {
                let alias = self.alias_for(None, &assembled);
                self.alias_models
                    .push((alias.clone(), relationship.to().to_string()));
                self.relationships.push(RelationPathConfig {
                    path: assembled.clone(),
                    alias: alias.clone(),
                    relationship: relationship.clone(),
                });
                last_alias = alias;
            }
            current = registry.model(relationship.to()).ok_or_else(|| {
                RelataError::config(format!(
                    "relation `{segment}` targets unknown model `{}`",
                    relationship.to()
                ))
            })?;
        }
        Ok(last_alias)
    }

    pub fn relation_configs(&self) -> &[RelationPathConfig] {
        &self.relationships
    }

    /// Materialize eager-load paths into child join descriptors.
    ///
    /// Idempotent: the graph is built at most once per descriptor.
    pub fn build_joins(&mut self) -> RelataResult<()> {
        if self.built {
            return Ok(());
        }
        self.built = true;
        let registry = self
            .registry
            .clone()
            .ok_or_else(|| RelataError::config("join materialization requires a model registry"))?;

        let mut paths: Vec<String> = Vec::new();
        for path in self.with.clone() {
            let mut assembled = String::new();
            for segment in path.split('.') {
                if assembled.is_empty() {
                    assembled = segment.to_string();
                } else {
                    assembled = format!("{assembled}.{segment}");
                }
                if !paths.contains(&assembled) {
                    paths.push(assembled.clone());
                }
            }
        }
        for path in &paths {
            self.relationship(path)?;
        }

        let root_alias = self
            .alias
            .clone()
            .or_else(|| self.source.clone())
            .unwrap_or_default();
        for config in self.relationships.clone() {
            let relationship = &config.relationship;
            let parent_alias = match config.path.rsplit_once('.') {
                Some((parent_path, _)) => self
                    .alias_of(parent_path)
                    .unwrap_or(root_alias.as_str())
                    .to_string(),
                None => root_alias.clone(),
            };
            let target = registry.model(relationship.to()).ok_or_else(|| {
                RelataError::config(format!(
                    "relation `{}` targets unknown model `{}`",
                    relationship.name(),
                    relationship.to()
                ))
            })?;
            let mut child = Query::new(Operation::Read);
            child.source = Some(target.source_name().to_string());
            child.model = Some(target);
            child.registry = Some(registry.clone());
            child.alias = Some(config.alias.clone());
            child.join_kind = Some(JoinKind::Left);
            for (origin_field, target_field) in relationship.key() {
                child.constraints.bind(
                    format!("{parent_alias}.{origin_field}"),
                    format!("{}.{target_field}", config.alias),
                );
            }
            child.constraints.merge(relationship.constraints().clone());
            // Relation-scoped field requests on this descriptor narrow the
            // child's projection, on top of the association's own.
            let mut projection: Vec<String> = relationship.fields().to_vec();
            for field in &self.fields {
                if let Some((prefix, bare)) = field.rsplit_once('.') {
                    if prefix == config.path && !projection.iter().any(|f| f == bare) {
                        projection.push(bare.to_string());
                    }
                }
            }
            if !projection.is_empty() {
                child = child.fields(projection.iter().map(String::as_str));
            }
            self.joins.push(child);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Export
    // ------------------------------------------------------------------

    /// Render this descriptor's attributes through a backend's clause
    /// renderers. Eager-load paths materialize into joins first (once);
    /// attributes the backend does not render are copied raw into the
    /// export's extras.
    pub fn export(&mut self, renderer: &dyn Renderer) -> RelataResult<Export> {
        if !self.with.is_empty() {
            self.build_joins()?;
        }
        let this = &*self;

        let mut export = Export::default();
        let source = this
            .source
            .clone()
            .ok_or_else(|| RelataError::config("query has no source"))?;
        // Only reads carry a source alias; write commands address the
        // source bare.
        export.source = match &this.alias {
            Some(alias) if this.op == Operation::Read && alias != &source => {
                format!("{} AS {}", renderer.name(&source), renderer.name(alias))
            }
            _ => renderer.name(&source),
        };

        let fields = renderer.fields(this)?;
        export.fields = fields.fields;
        export.values = fields.values.unwrap_or_default();

        if this.op != Operation::Create {
            export.conditions =
                renderer.conditions(&this.effective_conditions()?, this, "WHERE")?;
        }
        export.having = renderer.conditions(&this.having, this, "HAVING")?;
        export.group = renderer.group(&this.group, this);
        export.order = this
            .order
            .as_ref()
            .map(|order| renderer.order(order, this))
            .unwrap_or_default();
        export.limit = renderer.limit(this.limit, this.offset);
        export.joins = renderer.joins(this)?;
        export.constraints = renderer.conditions(&this.constraints, this, "")?;
        export.comment = this
            .comment
            .as_deref()
            .map(|comment| renderer.comment(comment))
            .unwrap_or_default();
        for (key, value) in &this.extras {
            export.set_extra(key.clone(), value.plain());
        }
        Ok(export)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_round_trip() {
        let query = Query::read("posts").fields(["a", "b", "a"]);
        assert_eq!(query.field_list(), vec!["a", "b"]);
    }

    #[test]
    fn test_clear_fields() {
        let mut query = Query::read("posts").fields(["a", "b"]);
        query.clear_fields();
        assert!(query.field_list().is_empty());
    }

    #[test]
    fn test_raw_expressions_come_last() {
        let query = Query::read("posts").fields(["COUNT(*)", "a"]);
        assert_eq!(query.field_list(), vec!["a", "COUNT(*)"]);
    }

    #[test]
    fn test_nested_fields_flatten_to_dotted_names() {
        let query = Query::read("posts").fields([
            FieldSpec::from("id"),
            FieldSpec::nested("Comments", ["id", "body"]),
            FieldSpec::nested("Comments", [FieldSpec::nested("Author", ["name"])]),
        ]);
        assert_eq!(
            query.field_list(),
            vec!["id", "Comments.id", "Comments.body", "Comments.Author.name"]
        );
    }

    #[test]
    fn test_conditions_merge_never_replace() {
        let query = Query::read("posts")
            .filter("a", 1)
            .conditions(vec![("b", 2)]);
        assert_eq!(query.condition_entries().len(), 2);
    }

    #[test]
    fn test_page_overwrites_offset() {
        let query = Query::read("posts").limit(10).offset(7).page(3);
        assert_eq!(query.offset, Some(20));
        assert_eq!(query.page, Some(3));
    }

    #[test]
    fn test_alias_disambiguation() {
        let mut query = Query::read("posts");
        let first = query.alias_for(None, "Comments");
        let second = query.alias_for(None, "Post.Comments");
        let third = query.alias_for(None, "Post.Post.Comments");
        assert_eq!(first, "Comments");
        assert_eq!(second, "Comments__2");
        assert_eq!(third, "Comments__3");
        assert_eq!(query.alias_of("Post.Comments"), Some("Comments__2"));
        assert_eq!(query.alias_of("Comments"), Some("Comments"));
        assert_eq!(query.alias_of("Missing"), None);
    }

    #[test]
    fn test_explicit_alias_base() {
        let mut query = Query::read("posts");
        let alias = query.alias_for(Some("C"), "Comments");
        assert_eq!(alias, "C");
        assert_eq!(query.alias_of("Comments"), Some("C"));
    }

    #[test]
    fn test_with_requires_model() {
        let err = Query::read("posts").with(["Comments"]).unwrap_err();
        assert!(matches!(err, RelataError::Config(_)));
    }

    #[test]
    fn test_empty_relation_path_is_argument_error() {
        let mut query = Query::read("posts");
        let err = query.relationship("").unwrap_err();
        assert!(matches!(err, RelataError::Argument(_)));
    }

    #[test]
    fn test_effective_conditions_from_bound_record() {
        use crate::model::{Entity, ModelDef, Registry};

        let registry = Registry::new();
        let model = registry.register(ModelDef::new("Post").source("posts"));
        let mut entity = Entity::for_model("Post");
        entity.set("id", 9);
        let query = Query::for_model(Operation::Read, model, registry).bind(entity);
        let conditions = query.effective_conditions().unwrap();
        assert_eq!(
            conditions.entries(),
            &[ConditionEntry::Field(
                "id".to_string(),
                ConditionValue::Scalar(Value::Int(9))
            )]
        );
    }

    #[test]
    fn test_unresolved_implicit_key_is_config_error() {
        use crate::model::{Entity, ModelDef, Registry};

        let registry = Registry::new();
        let model = registry.register(ModelDef::new("Post").source("posts"));
        let query =
            Query::for_model(Operation::Update, model, registry).bind(Entity::for_model("Post"));
        assert!(matches!(
            query.effective_conditions(),
            Err(RelataError::Config(_))
        ));
    }
}
