//! Generic SQL backend over a [`Driver`].
//!
//! [`Relational`] renders a [`Query`] into a SQL command string through
//! named templates, pushes it through the backend's filter chain, and hands
//! it to the driver. Clause rendering lives in the [`Renderer`] impl;
//! engine-specific adapters wrap a [`Relational`] around their driver and
//! only override what their dialect needs.

use crate::error::{RelataError, RelataResult};
use crate::filters::FilterChain;
use crate::query::{
    ConditionEntry, ConditionValue, Conditions, Export, JoinKind, Operation, OrderSpec, Query,
};
use crate::schema::{FieldDef, FieldType, Schema};
use crate::value::Value;

use super::driver::{Cursor, Driver, RecordSet};
use super::{Backend, FieldsRender, ReadOptions, ReadResult, Renderer, ReturnKind};

/// Identifiers that collide with SQL keywords and must be quoted.
const RESERVED: &[&str] = &[
    "ALL", "AND", "AS", "ASC", "BETWEEN", "BY", "CASE", "CHECK", "COLUMN", "CONSTRAINT", "CREATE",
    "DEFAULT", "DELETE", "DESC", "DISTINCT", "DROP", "ELSE", "END", "EXISTS", "FROM", "GROUP",
    "HAVING", "IN", "INDEX", "INSERT", "INTO", "IS", "JOIN", "KEY", "LEFT", "LIKE", "LIMIT",
    "NOT", "NULL", "ON", "OR", "ORDER", "PRIMARY", "RIGHT", "SELECT", "SET", "TABLE", "THEN",
    "UNION", "UPDATE", "USER", "VALUES", "WHEN", "WHERE",
];

/// The command shape a rendered export interpolates into.
///
/// Placeholders name export attributes; an attribute a query never set
/// renders empty and the surrounding whitespace collapses away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Create,
    Read,
    Update,
    Delete,
    Schema,
}

impl CommandKind {
    pub fn for_operation(op: Operation) -> CommandKind {
        match op {
            Operation::Create => CommandKind::Create,
            Operation::Read => CommandKind::Read,
            Operation::Update => CommandKind::Update,
            Operation::Delete => CommandKind::Delete,
        }
    }

    pub fn template(self) -> &'static str {
        match self {
            CommandKind::Create => "INSERT INTO {source} ({fields}) VALUES ({values});{comment}",
            CommandKind::Read => {
                "SELECT {fields} FROM {source} {joins} {conditions} {group} {having} {order} {limit};{comment}"
            }
            CommandKind::Update => "UPDATE {source} SET {fields} {conditions};{comment}",
            CommandKind::Delete => "DELETE FROM {source} {conditions};{comment}",
            CommandKind::Schema => "CREATE TABLE {source} ({columns});{comment}",
        }
    }
}

/// A SQL backend generic over its connection driver.
pub struct Relational<D: Driver> {
    driver: D,
    filters: FilterChain<String, RelataResult<Cursor>>,
}

impl<D: Driver> Relational<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            filters: FilterChain::new(),
        }
    }

    pub fn driver(&mut self) -> &mut D {
        &mut self.driver
    }

    /// The chain every rendered command passes through before execution.
    pub fn filters(&mut self) -> &mut FilterChain<String, RelataResult<Cursor>> {
        &mut self.filters
    }

    /// Interpolate an export into the command template for `kind`.
    pub fn render_command(&self, kind: CommandKind, export: &Export) -> String {
        tidy(&interpolate(kind.template(), export))
    }

    /// Scope map for row flattening: one `(scope, columns)` run per joined
    /// model, root first, in the order the projection was rendered. Empty
    /// when the query has no joins.
    pub fn schema_map(query: &Query) -> Vec<(String, Vec<String>)> {
        if query.joins.is_empty() {
            return Vec::new();
        }
        let mut map = Vec::with_capacity(query.joins.len() + 1);
        map.push((scope_name(query), scope_fields(query)));
        for child in &query.joins {
            map.push((scope_name(child), scope_fields(child)));
        }
        map
    }

    /// Create a storage table for a schema. `key` becomes the primary key.
    pub fn create_table(
        &mut self,
        source: &str,
        schema: &Schema,
        key: &[String],
    ) -> RelataResult<bool> {
        if schema.is_empty() {
            return Err(RelataError::argument(
                "cannot create a table without fields",
            ));
        }
        let mut columns: Vec<String> = schema.fields().iter().map(|f| self.column(f)).collect();
        if !key.is_empty() {
            let keys = key
                .iter()
                .map(|k| self.name(k))
                .collect::<Vec<_>>()
                .join(", ");
            columns.push(format!("PRIMARY KEY ({keys})"));
        }
        let mut export = Export::default();
        export.source = self.name(source);
        export.columns = columns.join(", ");
        let command = self.render_command(CommandKind::Schema, &export);
        let cursor = self.run_command(command)?;
        Ok(!cursor.failed)
    }

    fn column(&self, field: &FieldDef) -> String {
        let ty = match field.ty {
            FieldType::Id | FieldType::Integer => "INT".to_string(),
            FieldType::Float => "FLOAT".to_string(),
            FieldType::Boolean => "TINYINT(1)".to_string(),
            FieldType::String => format!("VARCHAR({})", field.length.unwrap_or(255)),
            FieldType::Text => "TEXT".to_string(),
            FieldType::Date => "DATE".to_string(),
            FieldType::DateTime => "DATETIME".to_string(),
            FieldType::Binary => "BLOB".to_string(),
        };
        let mut out = format!("{} {}", self.name(&field.name), ty);
        if !field.nullable {
            out.push_str(" NOT NULL");
        }
        if let Some(default) = &field.default {
            out.push_str(" DEFAULT ");
            out.push_str(&self.value(default, Some(field)));
        }
        out
    }

    fn run_command(&mut self, command: String) -> RelataResult<Cursor> {
        let filters = &self.filters;
        let driver = &mut self.driver;
        filters.run(command, &mut |cmd| {
            tracing::debug!(command = %cmd, "executing");
            driver.execute(&cmd)
        })
    }

    /// A column reference, alias-qualified when the query joins.
    fn column_ref(&self, column: &str, query: &Query) -> String {
        if let Some((prefix, field)) = column.rsplit_once('.') {
            let alias = query.alias_of(prefix).unwrap_or(prefix);
            return format!("{}.{}", self.name(alias), self.name(field));
        }
        match query.alias() {
            Some(alias) if !query.joins.is_empty() => {
                format!("{}.{}", self.name(alias), self.name(column))
            }
            _ => self.name(column),
        }
    }

    fn projection_ref(&self, field: &str, query: &Query) -> String {
        if is_plain_identifier(field) {
            self.column_ref(field, query)
        } else {
            field.to_string()
        }
    }
}

impl<D: Driver> Renderer for Relational<D> {
    fn name(&self, identifier: &str) -> String {
        if identifier == "*" {
            return identifier.to_string();
        }
        if identifier.contains('.') {
            return identifier
                .split('.')
                .map(|part| self.name(part))
                .collect::<Vec<_>>()
                .join(".");
        }
        if needs_quote(identifier) {
            format!("\"{identifier}\"")
        } else {
            identifier.to_string()
        }
    }

    fn value(&self, value: &Value, field: Option<&FieldDef>) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Array(items) => items
                .iter()
                .map(|item| self.value(item, field))
                .collect::<Vec<_>>()
                .join(", "),
            _ => {
                let ty = field.map(|f| f.ty).unwrap_or_else(|| value.infer_type());
                match ty {
                    FieldType::Boolean => (if value.as_bool() { "1" } else { "0" }).to_string(),
                    FieldType::Id | FieldType::Integer | FieldType::Float => value.plain(),
                    _ => format!("'{}'", value.plain().replace('\'', "''")),
                }
            }
        }
    }

    fn fields(&self, query: &Query) -> RelataResult<FieldsRender> {
        match query.op {
            Operation::Create => {
                let data = write_data(query);
                if data.is_empty() {
                    return Err(RelataError::argument("create requires field values"));
                }
                let fields = data
                    .iter()
                    .map(|(f, _)| self.name(f))
                    .collect::<Vec<_>>()
                    .join(", ");
                let values = data
                    .iter()
                    .map(|(f, v)| self.value(v, query.schema_field(f)))
                    .collect::<Vec<_>>()
                    .join(", ");
                Ok(FieldsRender {
                    fields,
                    values: Some(values),
                })
            }
            Operation::Update => {
                let data = write_data(query);
                if data.is_empty() {
                    return Err(RelataError::argument("update requires field values"));
                }
                let fields = data
                    .iter()
                    .map(|(f, v)| {
                        format!("{} = {}", self.name(f), self.value(v, query.schema_field(f)))
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                Ok(FieldsRender {
                    fields,
                    values: None,
                })
            }
            Operation::Read | Operation::Delete => {
                if let Some(calc) = &query.calculate {
                    return Ok(FieldsRender {
                        fields: format!("{}(*) AS {}", calc.to_ascii_uppercase(), self.name(calc)),
                        values: None,
                    });
                }
                if query.joins.is_empty() {
                    let list = query.field_list();
                    if list.is_empty() {
                        return Ok(FieldsRender {
                            fields: "*".to_string(),
                            values: None,
                        });
                    }
                    let fields = list
                        .iter()
                        .map(|f| self.projection_ref(f, query))
                        .collect::<Vec<_>>()
                        .join(", ");
                    return Ok(FieldsRender {
                        fields,
                        values: None,
                    });
                }
                // Joined reads enumerate one column run per scope so result
                // rows flatten back through the same map.
                let mut parts = Vec::new();
                for (scope, fields) in Self::schema_map(query) {
                    if fields.is_empty() {
                        parts.push(format!("{}.*", self.name(&scope)));
                    } else {
                        for field in fields {
                            parts.push(format!("{}.{}", self.name(&scope), self.name(&field)));
                        }
                    }
                }
                Ok(FieldsRender {
                    fields: parts.join(", "),
                    values: None,
                })
            }
        }
    }

    fn conditions(
        &self,
        conditions: &Conditions,
        query: &Query,
        prefix: &str,
    ) -> RelataResult<String> {
        if conditions.is_empty() {
            return Ok(String::new());
        }
        let mut parts = Vec::with_capacity(conditions.len());
        for entry in conditions.entries() {
            match entry {
                ConditionEntry::Fragment(fragment) => parts.push(fragment.clone()),
                ConditionEntry::Bind(left, right) => parts.push(format!(
                    "{} = {}",
                    self.column_ref(left, query),
                    self.column_ref(right, query)
                )),
                ConditionEntry::Field(column, value) => {
                    let col = self.column_ref(column, query);
                    let field = query.schema_field(column);
                    match value {
                        ConditionValue::Scalar(Value::Null) => parts.push(format!("{col} IS NULL")),
                        ConditionValue::Scalar(scalar) => {
                            parts.push(format!("{col} = {}", self.value(scalar, field)))
                        }
                        ConditionValue::List(items) => {
                            let rendered = items
                                .iter()
                                .map(|item| self.value(item, field))
                                .collect::<Vec<_>>()
                                .join(", ");
                            parts.push(format!("{col} IN ({rendered})"));
                        }
                        ConditionValue::Sub(sub) => {
                            let mut sub = (**sub).clone();
                            let export = sub.export(self)?;
                            let command = self.render_command(CommandKind::Read, &export);
                            let inner = command.trim_end_matches(';');
                            parts.push(format!("{col} IN ({inner})"));
                        }
                    }
                }
            }
        }
        let clause = parts.join(" AND ");
        if prefix.is_empty() {
            Ok(clause)
        } else {
            Ok(format!("{prefix} {clause}"))
        }
    }

    fn order(&self, order: &OrderSpec, query: &Query) -> String {
        match order {
            OrderSpec::Column(spec) => {
                let spec = spec.trim();
                // Only a declared schema column gets the bare `ASC` form;
                // anything else is a fragment.
                if is_plain_identifier(spec) && query.schema_field(spec).is_some() {
                    return format!("ORDER BY {} ASC", self.column_ref(spec, query));
                }
                if let Some((column, token)) = spec.rsplit_once(' ') {
                    let column = column.trim();
                    let is_direction = token.eq_ignore_ascii_case("asc")
                        || token.eq_ignore_ascii_case("desc");
                    if is_plain_identifier(column) && is_direction {
                        return format!(
                            "ORDER BY {} {}",
                            self.column_ref(column, query),
                            crate::query::Direction::parse(token).keyword()
                        );
                    }
                }
                format!("ORDER BY {spec}")
            }
            OrderSpec::List(items) => {
                let parts = items
                    .iter()
                    .map(|(column, dir)| {
                        format!("{} {}", self.column_ref(column, query), dir.keyword())
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("ORDER BY {parts}")
            }
        }
    }

    fn limit(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        match (limit, offset) {
            (Some(limit), Some(offset)) if offset > 0 => format!("LIMIT {limit} OFFSET {offset}"),
            (Some(limit), _) => format!("LIMIT {limit}"),
            (None, _) => String::new(),
        }
    }

    fn joins(&self, query: &Query) -> RelataResult<String> {
        let mut parts = Vec::with_capacity(query.joins.len());
        for child in &query.joins {
            let kind = child.join_kind.unwrap_or(JoinKind::Inner);
            let source = child
                .source
                .clone()
                .ok_or_else(|| RelataError::config("join has no source"))?;
            let target = match child.alias() {
                Some(alias) if alias != source => {
                    format!("{} AS {}", self.name(&source), self.name(alias))
                }
                _ => self.name(&source),
            };
            let on = self.conditions(&child.constraints, child, "")?;
            if on.is_empty() {
                parts.push(format!("{} JOIN {}", kind.keyword(), target));
            } else {
                parts.push(format!("{} JOIN {} ON {}", kind.keyword(), target, on));
            }
        }
        Ok(parts.join(" "))
    }

    fn group(&self, group: &[String], query: &Query) -> String {
        if group.is_empty() {
            return String::new();
        }
        let columns = group
            .iter()
            .map(|column| self.column_ref(column, query))
            .collect::<Vec<_>>()
            .join(", ");
        format!("GROUP BY {columns}")
    }

    fn comment(&self, comment: &str) -> String {
        format!(" /* {} */", comment.trim())
    }
}

impl<D: Driver> Backend for Relational<D> {
    fn connect(&mut self) -> RelataResult<()> {
        tracing::debug!("connecting");
        self.driver.connect()
    }

    fn disconnect(&mut self) -> RelataResult<()> {
        tracing::debug!("disconnecting");
        self.driver.disconnect()
    }

    fn entities(&mut self) -> RelataResult<Vec<String>> {
        self.driver.sources()
    }

    fn describe(&mut self, entity: &str) -> RelataResult<Schema> {
        self.driver.describe(entity)
    }

    fn create(&mut self, query: &mut Query) -> RelataResult<bool> {
        let export = query.export(&*self)?;
        let command = self.render_command(CommandKind::Create, &export);
        let cursor = self.run_command(command)?;
        if cursor.failed {
            return Ok(false);
        }
        let key = query.model().and_then(|m| m.key_names().first().cloned());
        let id = self.driver.insert_id();
        if let Some(entity) = query.entity.as_mut() {
            if let (Some(key), Some(id)) = (key, id) {
                if matches!(entity.get(&key), None | Some(Value::Null)) {
                    entity.set(key, id);
                }
            }
            entity.exists = true;
        }
        Ok(true)
    }

    fn read(&mut self, query: &mut Query, options: ReadOptions) -> RelataResult<ReadResult> {
        let export = query.export(&*self)?;
        let command = self.render_command(CommandKind::Read, &export);
        let mut cursor = self.run_command(command)?;
        if query.calculate.is_some() {
            let value = cursor
                .next()
                .and_then(|row| row.into_iter().next())
                .unwrap_or(Value::Null);
            return Ok(ReadResult::Value(value));
        }
        let map = Self::schema_map(query);
        let model = query.model().map(|m| m.name().to_string());
        match options.wrap {
            ReturnKind::Cursor => Ok(ReadResult::Cursor(cursor)),
            ReturnKind::Records => Ok(ReadResult::Records(RecordSet::new(cursor, map, model))),
            ReturnKind::List => Ok(ReadResult::List(
                RecordSet::new(cursor, map, model).collect(),
            )),
        }
    }

    fn update(&mut self, query: &mut Query) -> RelataResult<bool> {
        let export = query.export(&*self)?;
        let command = self.render_command(CommandKind::Update, &export);
        let cursor = self.run_command(command)?;
        if cursor.failed {
            return Ok(false);
        }
        if let Some(entity) = query.entity.as_mut() {
            entity.exists = true;
        }
        Ok(true)
    }

    fn delete(&mut self, query: &mut Query) -> RelataResult<bool> {
        let export = query.export(&*self)?;
        // An unconditioned delete would empty the source; refuse it instead
        // of executing.
        if export.conditions.trim().is_empty() {
            tracing::warn!(source = %export.source, "refusing delete without conditions");
            return Ok(false);
        }
        let command = self.render_command(CommandKind::Delete, &export);
        let cursor = self.run_command(command)?;
        if cursor.failed {
            return Ok(false);
        }
        if let Some(entity) = query.entity.as_mut() {
            entity.exists = false;
        }
        Ok(true)
    }
}

/// Pending write values: explicit data first, else the bound record's
/// fields minus its key, narrowed by the whitelist when one is set.
fn write_data(query: &Query) -> Vec<(String, Value)> {
    let mut pairs: Vec<(String, Value)> = if !query.data.is_empty() {
        query.data.clone()
    } else if let Some(entity) = &query.entity {
        let key: Vec<&String> = query
            .model()
            .map(|m| m.key_names().iter().collect())
            .unwrap_or_default();
        entity
            .data()
            .iter()
            .filter(|(field, _)| !key.iter().any(|k| *k == field))
            .cloned()
            .collect()
    } else {
        Vec::new()
    };
    if !query.whitelist.is_empty() {
        pairs.retain(|(field, _)| query.whitelist.contains(field));
    }
    pairs
}

fn scope_name(query: &Query) -> String {
    query
        .alias()
        .map(str::to_string)
        .or_else(|| query.source.clone())
        .unwrap_or_default()
}

/// The bare columns one scope contributes to a joined projection: its
/// explicit un-dotted fields, else its schema's declaration order.
fn scope_fields(query: &Query) -> Vec<String> {
    let named: Vec<String> = query
        .field_list()
        .into_iter()
        .filter(|f| f != "*" && !f.contains('.') && is_plain_identifier(f))
        .collect();
    if !named.is_empty() {
        return named;
    }
    query.schema().map(|s| s.names()).unwrap_or_default()
}

fn is_plain_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.')
}

fn needs_quote(identifier: &str) -> bool {
    identifier.is_empty()
        || identifier
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
        || !identifier
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_')
        || RESERVED.contains(&identifier.to_ascii_uppercase().as_str())
}

/// Substitute `{placeholder}` keys with export attributes; unknown keys
/// render empty.
fn interpolate(template: &str, export: &Export) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        rest = &rest[start + 1..];
        match rest.find('}') {
            Some(end) => {
                if let Some(value) = export.get(&rest[..end]) {
                    out.push_str(value);
                }
                rest = &rest[end + 1..];
            }
            None => {
                out.push('{');
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Collapse the whitespace left behind by empty placeholders.
fn tidy(command: &str) -> String {
    let mut out = String::with_capacity(command.len());
    let mut last_space = false;
    for c in command.trim().chars() {
        if c == ' ' {
            if !last_space {
                out.push(c);
            }
            last_space = true;
        } else {
            if c == ';' && out.ends_with(' ') {
                out.pop();
            }
            out.push(c);
            last_space = false;
        }
    }
    out
}
