//! Document-store command rendering.
//!
//! Document engines take structured command maps instead of SQL strings, so
//! a [`Query`] converts through [`ToCommandMap`] into a JSON document in the
//! wire shape of MongoDB-style servers. Raw condition fragments survive as
//! `$where` clauses; correlated subqueries have no document form and are
//! rejected.

use serde_json::{json, Map, Value as Json};

use crate::error::{RelataError, RelataResult};
use crate::query::{ConditionEntry, ConditionValue, Direction, Operation, OrderSpec, Query};
use crate::value::Value;

/// Conversion of a query descriptor into a document-store command map.
pub trait ToCommandMap {
    fn to_command_map(&self) -> RelataResult<Json>;
}

impl ToCommandMap for Query {
    fn to_command_map(&self) -> RelataResult<Json> {
        let source = self
            .source
            .clone()
            .ok_or_else(|| RelataError::config("query has no source"))?;
        match self.op {
            Operation::Read => {
                let mut command = Map::new();
                command.insert("find".to_string(), Json::String(source));
                let filter = filter_document(self)?;
                if !filter.is_empty() {
                    command.insert("filter".to_string(), Json::Object(filter));
                }
                let projection = projection_document(self);
                if !projection.is_empty() {
                    command.insert("projection".to_string(), Json::Object(projection));
                }
                if let Some(order) = &self.order {
                    command.insert("sort".to_string(), Json::Object(sort_document(order)));
                }
                if let Some(offset) = self.offset {
                    if offset > 0 {
                        command.insert("skip".to_string(), json!(offset));
                    }
                }
                if let Some(limit) = self.limit {
                    command.insert("limit".to_string(), json!(limit));
                }
                Ok(Json::Object(command))
            }
            Operation::Create => {
                let document: Map<String, Json> = write_document(self);
                Ok(json!({
                    "insert": source,
                    "documents": [Json::Object(document)],
                }))
            }
            Operation::Update => {
                let filter = filter_document(self)?;
                let update = write_document(self);
                Ok(json!({
                    "update": source,
                    "updates": [{
                        "q": Json::Object(filter),
                        "u": { "$set": Json::Object(update) },
                        "multi": true,
                    }],
                }))
            }
            Operation::Delete => {
                let filter = filter_document(self)?;
                Ok(json!({
                    "delete": source,
                    "deletes": [{ "q": Json::Object(filter), "limit": 0 }],
                }))
            }
        }
    }
}

fn filter_document(query: &Query) -> RelataResult<Map<String, Json>> {
    let mut clauses: Vec<(String, Json)> = Vec::new();
    for entry in query.effective_conditions()?.entries() {
        match entry {
            ConditionEntry::Fragment(fragment) => {
                clauses.push(("$where".to_string(), Json::String(fragment.clone())));
            }
            ConditionEntry::Field(column, ConditionValue::Scalar(value)) => {
                clauses.push((column.clone(), Json::from(value)));
            }
            ConditionEntry::Field(column, ConditionValue::List(items)) => {
                let items: Vec<Json> = items.iter().map(Json::from).collect();
                clauses.push((column.clone(), json!({ "$in": items })));
            }
            ConditionEntry::Field(_, ConditionValue::Sub(_)) => {
                return Err(RelataError::argument(
                    "subquery conditions cannot render into a document command",
                ));
            }
            ConditionEntry::Bind(_, _) => {
                return Err(RelataError::argument(
                    "column bindings cannot render into a document command",
                ));
            }
        }
    }
    let mut filter = Map::new();
    // A repeated key in a flat document would overwrite its earlier clause;
    // the clauses combine under `$and` instead.
    let repeats = clauses
        .iter()
        .enumerate()
        .any(|(i, (key, _))| clauses[..i].iter().any(|(prior, _)| prior == key));
    if repeats {
        let list: Vec<Json> = clauses
            .into_iter()
            .map(|(key, value)| {
                let mut clause = Map::new();
                clause.insert(key, value);
                Json::Object(clause)
            })
            .collect();
        filter.insert("$and".to_string(), Json::Array(list));
    } else {
        filter.extend(clauses);
    }
    Ok(filter)
}

fn projection_document(query: &Query) -> Map<String, Json> {
    let mut projection = Map::new();
    for field in query.field_list() {
        if field == "*" {
            continue;
        }
        projection.insert(field, json!(1));
    }
    projection
}

fn sort_document(order: &OrderSpec) -> Map<String, Json> {
    let mut sort = Map::new();
    match order {
        OrderSpec::Column(spec) => {
            let spec = spec.trim();
            match spec.rsplit_once(' ') {
                Some((column, token))
                    if token.eq_ignore_ascii_case("asc") || token.eq_ignore_ascii_case("desc") =>
                {
                    sort.insert(
                        column.trim().to_string(),
                        direction_flag(Direction::parse(token)),
                    );
                }
                _ => {
                    sort.insert(spec.to_string(), json!(1));
                }
            }
        }
        OrderSpec::List(items) => {
            for (column, direction) in items {
                sort.insert(column.clone(), direction_flag(*direction));
            }
        }
    }
    sort
}

fn direction_flag(direction: Direction) -> Json {
    match direction {
        Direction::Asc => json!(1),
        Direction::Desc => json!(-1),
    }
}

fn write_document(query: &Query) -> Map<String, Json> {
    let pairs: Vec<(String, Value)> = if !query.data.is_empty() {
        query.data.clone()
    } else if let Some(entity) = &query.entity {
        entity.data().to_vec()
    } else {
        Vec::new()
    };
    let mut document = Map::new();
    for (field, value) in pairs {
        if !query.whitelist.is_empty() && !query.whitelist.contains(&field) {
            continue;
        }
        document.insert(field, Json::from(&value));
    }
    document
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_command_shape() {
        let query = Query::read("images")
            .fields(["id", "file"])
            .filter("gallery_id", 1)
            .filter_in("status", ["live", "draft"])
            .order("created desc")
            .limit(10)
            .page(2);
        let command = query.to_command_map().unwrap();
        assert_eq!(
            command,
            json!({
                "find": "images",
                "filter": {
                    "gallery_id": 1,
                    "status": { "$in": ["live", "draft"] },
                },
                "projection": { "id": 1, "file": 1 },
                "sort": { "created": -1 },
                "skip": 10,
                "limit": 10,
            })
        );
    }

    #[test]
    fn test_fragment_becomes_where_clause() {
        let query = Query::read("images").filter_raw("this.width > this.height");
        let command = query.to_command_map().unwrap();
        assert_eq!(
            command["filter"]["$where"],
            json!("this.width > this.height")
        );
    }

    #[test]
    fn test_repeated_keys_combine_under_and() {
        let query = Query::read("images").filter("id", 1).filter("id", 2);
        let command = query.to_command_map().unwrap();
        assert_eq!(
            command["filter"],
            json!({ "$and": [{ "id": 1 }, { "id": 2 }] })
        );

        let query = Query::read("images")
            .filter_raw("this.width > 10")
            .filter_raw("this.height > 10");
        let command = query.to_command_map().unwrap();
        assert_eq!(
            command["filter"],
            json!({ "$and": [
                { "$where": "this.width > 10" },
                { "$where": "this.height > 10" },
            ]})
        );
    }

    #[test]
    fn test_insert_command_shape() {
        let query = Query::create("images").data([("file", "oak.jpg")]);
        let command = query.to_command_map().unwrap();
        assert_eq!(
            command,
            json!({
                "insert": "images",
                "documents": [{ "file": "oak.jpg" }],
            })
        );
    }

    #[test]
    fn test_update_sets_fields() {
        let query = Query::update("images")
            .data([("file", "pine.jpg")])
            .filter("id", 3);
        let command = query.to_command_map().unwrap();
        assert_eq!(
            command,
            json!({
                "update": "images",
                "updates": [{
                    "q": { "id": 3 },
                    "u": { "$set": { "file": "pine.jpg" } },
                    "multi": true,
                }],
            })
        );
    }

    #[test]
    fn test_delete_command_shape() {
        let query = Query::delete("images").filter("id", 3);
        let command = query.to_command_map().unwrap();
        assert_eq!(
            command,
            json!({
                "delete": "images",
                "deletes": [{ "q": { "id": 3 }, "limit": 0 }],
            })
        );
    }

    #[test]
    fn test_subquery_is_rejected() {
        let query = Query::read("images").filter_sub("gallery_id", Query::read("galleries"));
        assert!(matches!(
            query.to_command_map(),
            Err(RelataError::Argument(_))
        ));
    }
}
