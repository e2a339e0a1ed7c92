//! End-to-end tests through the public API: model registration,
//! relationship declaration, rendering, and execution against a scripted
//! driver.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use relata::prelude::*;

/// Driver scripted with canned cursors, logging every executed command.
#[derive(Default)]
struct ScriptedDriver {
    log: Arc<Mutex<Vec<String>>>,
    results: VecDeque<Cursor>,
    generated: Option<Value>,
}

impl ScriptedDriver {
    fn new(log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }
}

impl Driver for ScriptedDriver {
    fn connect(&mut self) -> RelataResult<()> {
        Ok(())
    }

    fn disconnect(&mut self) -> RelataResult<()> {
        Ok(())
    }

    fn execute(&mut self, command: &str) -> RelataResult<Cursor> {
        self.log.lock().unwrap().push(command.to_string());
        Ok(self
            .results
            .pop_front()
            .unwrap_or_else(|| Cursor::acknowledged(1)))
    }

    fn insert_id(&mut self) -> Option<Value> {
        self.generated.clone()
    }

    fn sources(&mut self) -> RelataResult<Vec<String>> {
        Ok(vec!["galleries".to_string(), "images".to_string()])
    }

    fn describe(&mut self, _source: &str) -> RelataResult<Schema> {
        Ok(Schema::new())
    }
}

fn gallery_registry() -> Registry {
    let registry = Registry::new();
    registry.register(
        ModelDef::new("Gallery").source("galleries").schema(
            Schema::new()
                .field(FieldDef::new("id", FieldType::Id))
                .field(FieldDef::new("title", FieldType::String).length(80)),
        ),
    );
    registry.register(
        ModelDef::new("Image").source("images").schema(
            Schema::new()
                .field(FieldDef::new("id", FieldType::Id))
                .field(FieldDef::new("gallery_id", FieldType::Integer))
                .field(FieldDef::new("file", FieldType::String)),
        ),
    );
    registry
        .relate(
            "Gallery",
            RelationConfig::new(RelationType::HasMany, "Images")
                .to("Image")
                .key(["gallery_id"]),
        )
        .unwrap();
    registry
        .relate(
            "Image",
            RelationConfig::new(RelationType::BelongsTo, "Gallery").key(["gallery_id"]),
        )
        .unwrap();
    registry
}

#[test]
fn test_create_then_read_round_trip() {
    let registry = gallery_registry();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut driver = ScriptedDriver::new(Arc::clone(&log));
    driver.generated = Some(Value::Int(42));
    driver.results.push_back(Cursor::acknowledged(1));
    driver.results.push_back(Cursor::with_rows(
        vec!["id".to_string(), "title".to_string()],
        [vec![Value::Int(42), Value::from("trees")]],
    ));
    let mut backend = Relational::new(driver);

    let gallery = registry.model("Gallery").unwrap();
    let mut entity = Entity::for_model("Gallery");
    entity.set("title", "trees");
    let mut insert =
        Query::for_model(Operation::Create, Arc::clone(&gallery), registry.clone()).bind(entity);
    assert!(backend.create(&mut insert).unwrap());
    let saved = insert.entity.as_ref().unwrap();
    assert!(saved.exists);
    assert_eq!(saved.get("id"), Some(&Value::Int(42)));

    let mut read =
        Query::for_model(Operation::Read, gallery, registry).filter("id", 42);
    let found = backend.read(&mut read, ReadOptions::list()).unwrap();
    let records = found.into_list();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("title"), Some(&Value::from("trees")));

    assert_eq!(
        *log.lock().unwrap(),
        [
            "INSERT INTO galleries (title) VALUES ('trees');",
            "SELECT * FROM galleries AS Gallery WHERE id = 42;",
        ]
    );
}

#[test]
fn test_relationship_fetch_builds_conditions_from_record() {
    let registry = gallery_registry();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut driver = ScriptedDriver::new(Arc::clone(&log));
    driver.results.push_back(Cursor::with_rows(
        vec![
            "id".to_string(),
            "gallery_id".to_string(),
            "file".to_string(),
        ],
        [
            vec![Value::Int(7), Value::Int(1), Value::from("oak.jpg")],
            vec![Value::Int(8), Value::Int(1), Value::from("pine.jpg")],
        ],
    ));
    let mut backend = Relational::new(driver);

    let gallery = registry.model("Gallery").unwrap();
    let images = gallery.relation("Images").unwrap();
    let mut record = Entity::for_model("Gallery");
    record.set("id", 1);

    let related = images
        .get(&record, &mut backend, &registry, FetchOptions::default())
        .unwrap();
    match related {
        Some(Related::Set(set)) => {
            assert_eq!(set.len(), 2);
            assert_eq!(set[0].get("file"), Some(&Value::from("oak.jpg")));
        }
        other => panic!("expected a related set, got {other:?}"),
    }
    assert_eq!(
        *log.lock().unwrap(),
        ["SELECT * FROM images AS Image WHERE gallery_id = 1;"]
    );

    // A record missing its key resolves silently to nothing.
    let empty = Entity::for_model("Gallery");
    assert_eq!(
        images
            .get(&empty, &mut backend, &registry, FetchOptions::default())
            .unwrap(),
        None
    );
}

#[test]
fn test_nested_eager_load_disambiguates_aliases() {
    let registry = gallery_registry();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut driver = ScriptedDriver::new(Arc::clone(&log));
    driver.results.push_back(Cursor::with_rows(
        vec![],
        [vec![
            Value::Int(1),
            Value::from("trees"),
            Value::Int(7),
            Value::Int(1),
            Value::from("oak.jpg"),
            Value::Int(1),
            Value::from("trees"),
        ]],
    ));
    let mut backend = Relational::new(driver);

    let gallery = registry.model("Gallery").unwrap();
    let mut query = Query::for_model(Operation::Read, gallery, registry)
        .with(["Images.Gallery"])
        .unwrap();
    let result = backend.read(&mut query, ReadOptions::records()).unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        ["SELECT Gallery.id, Gallery.title, \
          Images.id, Images.gallery_id, Images.file, \
          Gallery__2.id, Gallery__2.title \
          FROM galleries AS Gallery \
          LEFT JOIN images AS Images ON Gallery.id = Images.gallery_id \
          LEFT JOIN galleries AS Gallery__2 ON Images.gallery_id = Gallery__2.id;"]
    );

    let records = result.into_list();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("id"), Some(&Value::Int(1)));
    assert_eq!(
        records[0].get("Images"),
        Some(&Value::Map(vec![
            ("id".to_string(), Value::Int(7)),
            ("gallery_id".to_string(), Value::Int(1)),
            ("file".to_string(), Value::from("oak.jpg")),
        ]))
    );
    assert_eq!(
        records[0].get("Gallery__2"),
        Some(&Value::Map(vec![
            ("id".to_string(), Value::Int(1)),
            ("title".to_string(), Value::from("trees")),
        ]))
    );
}

#[test]
fn test_backend_registry_builds_working_backends() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let factory_log = Arc::clone(&log);
    let mut backends = BackendRegistry::new();
    backends
        .register(
            "sql",
            Box::new(move || {
                Box::new(Relational::new(ScriptedDriver::new(Arc::clone(
                    &factory_log,
                ))))
            }),
        )
        .unwrap();

    let mut backend = backends.create("sql").unwrap();
    // Unconditioned deletes never reach the driver.
    let mut wipe = Query::delete("images");
    assert!(!backend.delete(&mut wipe).unwrap());
    assert!(log.lock().unwrap().is_empty());

    let mut targeted = Query::delete("images").filter("id", 3);
    assert!(backend.delete(&mut targeted).unwrap());
    assert_eq!(*log.lock().unwrap(), ["DELETE FROM images WHERE id = 3;"]);
}

#[test]
fn test_document_rendering_from_same_descriptor() {
    let query = Query::read("images")
        .fields(["id", "file"])
        .filter("gallery_id", 1)
        .limit(5);
    let command = query.to_command_map().unwrap();
    assert_eq!(command["find"], serde_json::json!("images"));
    assert_eq!(command["filter"]["gallery_id"], serde_json::json!(1));
    assert_eq!(command["limit"], serde_json::json!(5));
}
