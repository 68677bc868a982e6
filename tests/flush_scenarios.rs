//! Integration tests for the flush protocol, run against `MockDatabase`
//! rather than the `FakeDatabase` used by `engine.rs`'s own unit tests — this
//! one actually keeps table state, so assertions can look at what ended up
//! in the database rather than just at return codes.

mod support;

use rustorm::prelude::*;
use support::mock_db::MockDatabase;

#[derive(rustorm::Entity)]
struct Unit {
    #[entity(id)]
    id: Option<Value>,
    name: Value,
}

#[derive(rustorm::Entity)]
struct User {
    #[entity(id)]
    id: Option<Value>,
    username: Value,
    #[entity(relation)]
    unit: RelatedValue,
    #[entity(many_to_many)]
    groups: Vec<Value>,
}

#[derive(rustorm::Entity)]
struct Group {
    #[entity(id)]
    id: Option<Value>,
    name: Value,
}

#[derive(rustorm::Entity)]
struct NodeA {
    #[entity(id)]
    id: Option<Value>,
    label: Value,
    #[entity(relation)]
    b: RelatedValue,
}

#[derive(rustorm::Entity)]
struct NodeB {
    #[entity(id)]
    id: Option<Value>,
    label: Value,
    #[entity(relation)]
    a: RelatedValue,
}

fn registry() -> StaticMetadataRegistry {
    let mut registry = StaticMetadataRegistry::new();
    registry.register(
        EntityMetadata::new("Unit", "units", "id")
            .with_column("id", ColumnInfo::new("id", DataType::Integer).auto_increment())
            .with_column("name", ColumnInfo::new("name", DataType::Text).not_null()),
    );
    registry.register(
        EntityMetadata::new("User", "users", "id")
            .with_column("id", ColumnInfo::new("id", DataType::Integer).auto_increment())
            .with_column("username", ColumnInfo::new("username", DataType::Text).not_null())
            .with_relation(RelationInfo::ManyToOne {
                field: "unit".to_string(),
                target_class: "Unit".to_string(),
                fk_column: "unit_id".to_string(),
                nullable: true,
            })
            .with_relation(RelationInfo::ManyToMany {
                field: "groups".to_string(),
                target_class: "Group".to_string(),
                link_table: "user_groups".to_string(),
                join_column: "user_id".to_string(),
                inverse_join_column: "group_id".to_string(),
            }),
    );
    registry.register(
        EntityMetadata::new("Group", "groups", "id")
            .with_column("id", ColumnInfo::new("id", DataType::Integer).auto_increment())
            .with_column("name", ColumnInfo::new("name", DataType::Text).not_null()),
    );
    registry.register(
        EntityMetadata::new("NodeA", "node_a", "id")
            .with_column("id", ColumnInfo::new("id", DataType::Integer).auto_increment())
            .with_column("label", ColumnInfo::new("label", DataType::Text).not_null())
            .with_relation(RelationInfo::ManyToOne {
                field: "b".to_string(),
                target_class: "NodeB".to_string(),
                fk_column: "b_id".to_string(),
                nullable: true,
            }),
    );
    registry.register(
        EntityMetadata::new("NodeB", "node_b", "id")
            .with_column("id", ColumnInfo::new("id", DataType::Integer).auto_increment())
            .with_column("label", ColumnInfo::new("label", DataType::Text).not_null())
            .with_relation(RelationInfo::ManyToOne {
                field: "a".to_string(),
                target_class: "NodeA".to_string(),
                fk_column: "a_id".to_string(),
                nullable: true,
            }),
    );
    registry
}

fn factory() -> StaticEntityFactory {
    let mut factory = StaticEntityFactory::new();
    factory.register("Unit", || {
        Box::new(Unit { id: None, name: Value::Null }) as Box<dyn Entity>
    });
    factory.register("User", || {
        Box::new(User { id: None, username: Value::Null, unit: RelatedValue::None, groups: Vec::new() })
            as Box<dyn Entity>
    });
    factory.register("Group", || {
        Box::new(Group { id: None, name: Value::Null }) as Box<dyn Entity>
    });
    factory.register("NodeA", || {
        Box::new(NodeA { id: None, label: Value::Null, b: RelatedValue::None }) as Box<dyn Entity>
    });
    factory.register("NodeB", || {
        Box::new(NodeB { id: None, label: Value::Null, a: RelatedValue::None }) as Box<dyn Entity>
    });
    factory
}

#[tokio::test]
async fn single_insert_assigns_an_id_and_is_findable() {
    let registry = registry();
    let factory = factory();
    let db = MockDatabase::new();
    let mut engine = Engine::new(&db, &registry, &factory, EngineConfig::default());

    let user = Box::new(User {
        id: None,
        username: Value::Text("John".to_string()),
        unit: RelatedValue::None,
        groups: Vec::new(),
    });
    let handle = engine.persist(user).unwrap();
    engine.flush().await.unwrap();

    let rows = db.rows_of("users");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id"), Some(&Value::Int(1)));
    assert_eq!(rows[0].get("username"), Some(&Value::Text("John".to_string())));

    let log = db.log();
    assert_eq!(log.len(), 1);
    assert!(log[0].sql.starts_with("INSERT INTO users (username) VALUES (:p1)"));
    assert_eq!(log[0].bound.get(":p1"), Some(&Value::Text("John".to_string())));

    let found = engine.find("User", Value::Int(1)).await.unwrap().unwrap();
    assert_eq!(found, handle);
    assert_eq!(
        engine.identity_map().get_entity(found).unwrap().get_column("username"),
        Some(Value::Text("John".to_string()))
    );
}

#[tokio::test]
async fn owning_one_to_one_with_a_new_target_inserts_the_unit_first() {
    let registry = registry();
    let factory = factory();
    let db = MockDatabase::new();
    let mut engine = Engine::new(&db, &registry, &factory, EngineConfig::default());

    let unit = Box::new(Unit { id: None, name: Value::Text("U".to_string()) });
    let user = Box::new(User {
        id: None,
        username: Value::Text("John".to_string()),
        unit: RelatedValue::New(unit),
        groups: Vec::new(),
    });
    engine.persist(user).unwrap();
    engine.flush().await.unwrap();

    let log = db.log();
    let insert_tables: Vec<&str> = log
        .iter()
        .filter(|e| e.sql.starts_with("INSERT"))
        .map(|e| if e.sql.contains("units") { "units" } else { "users" })
        .collect();
    assert_eq!(insert_tables, vec!["units", "users"]);

    let unit_row = db.rows_of("units").into_iter().next().unwrap();
    let user_row = db.rows_of("users").into_iter().next().unwrap();
    assert_eq!(user_row.get("unit_id"), unit_row.get("id"));
}

#[tokio::test]
async fn a_dirty_update_emits_exactly_one_update() {
    let registry = registry();
    let factory = factory();
    let db = MockDatabase::new();
    let mut engine = Engine::new(&db, &registry, &factory, EngineConfig::default());

    let user = Box::new(User {
        id: None,
        username: Value::Text("John".to_string()),
        unit: RelatedValue::None,
        groups: Vec::new(),
    });
    let handle = engine.persist(user).unwrap();
    engine.flush().await.unwrap();
    db.clear_log();

    {
        let entity = engine.identity_map_mut().get_entity_mut(handle).unwrap();
        entity.set_column("username", Value::Text("Jane".to_string()));
    }
    engine.flush().await.unwrap();

    let log = db.log();
    let updates: Vec<_> = log.iter().filter(|e| e.sql.starts_with("UPDATE")).collect();
    assert_eq!(updates.len(), 1);
    assert!(updates[0].sql.starts_with("UPDATE users SET username = :p1 WHERE id = :p2"));
    assert_eq!(updates[0].bound.get(":p1"), Some(&Value::Text("Jane".to_string())));
    assert_eq!(updates[0].bound.get(":p2"), Some(&Value::Int(1)));

    let entity = engine.identity_map().get_entity(handle).unwrap();
    assert_eq!(entity.get_column("username"), Some(Value::Text("Jane".to_string())));
}

#[tokio::test]
async fn many_to_many_add_and_remove_touches_only_the_changed_links() {
    let registry = registry();
    let factory = factory();
    let db = MockDatabase::new();
    let mut engine = Engine::new(&db, &registry, &factory, EngineConfig::default());

    let user = Box::new(User {
        id: None,
        username: Value::Text("John".to_string()),
        unit: RelatedValue::None,
        groups: vec![Value::Int(1), Value::Int(2)],
    });
    let handle = engine.persist(user).unwrap();
    engine.flush().await.unwrap();

    let links = db.rows_of("user_groups");
    assert_eq!(links.len(), 2);
    db.clear_log();

    {
        let entity = engine.identity_map_mut().get_entity_mut(handle).unwrap();
        let user = entity.downcast_mut::<User>().unwrap();
        user.groups = vec![Value::Int(2), Value::Int(3)];
    }
    engine.flush().await.unwrap();

    let log = db.log();
    let deletes: Vec<_> = log.iter().filter(|e| e.sql.starts_with("DELETE FROM user_groups")).collect();
    let inserts: Vec<_> = log.iter().filter(|e| e.sql.contains("user_groups")).filter(|e| e.sql.starts_with("INSERT")).collect();
    assert_eq!(deletes.len(), 1);
    assert_eq!(inserts.len(), 1);

    let links = db.rows_of("user_groups");
    let group_ids: std::collections::HashSet<Value> =
        links.iter().map(|row| row.get("group_id").cloned().unwrap()).collect();
    assert_eq!(group_ids, [Value::Int(2), Value::Int(3)].into_iter().collect());
}

#[tokio::test]
async fn listener_mutation_during_post_persist_yields_one_additional_update_in_the_same_flush() {
    let registry = registry();
    let factory = factory();
    let db = MockDatabase::new();
    let mut engine = Engine::new(&db, &registry, &factory, EngineConfig::default());

    // `postPersist` mutates the freshly inserted row's field directly; the
    // engine diffs it against the snapshot it just took and emits the
    // follow-up UPDATE itself, in the same flush (§8 scenario 5) — no
    // rescheduling needed.
    engine.register_listener(
        LifecycleEvent::PostPersist,
        Box::new(FnListener(move |ctx: &mut EventContext<'_>| {
            let Some(entity) = ctx.entity.as_deref_mut() else { return Ok(()) };
            if entity.class_name() != "User" {
                return Ok(());
            }
            if let Value::Text(text) = entity.get_column("username").unwrap_or(Value::Null) {
                entity.set_column("username", Value::Text(format!("{text}X")));
            }
            Ok(())
        })),
    );

    let user = Box::new(User {
        id: None,
        username: Value::Text("John".to_string()),
        unit: RelatedValue::None,
        groups: Vec::new(),
    });
    let handle = engine.persist(user).unwrap();
    engine.flush().await.unwrap();

    let rows = db.rows_of("users");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("username"), Some(&Value::Text("JohnX".to_string())));

    let log = db.log();
    let updates: Vec<_> = log.iter().filter(|e| e.sql.starts_with("UPDATE")).collect();
    assert_eq!(updates.len(), 1);

    let entity = engine.identity_map().get_entity(handle).unwrap();
    assert_eq!(entity.get_column("username"), Some(Value::Text("JohnX".to_string())));
}

#[tokio::test]
async fn a_cycle_between_two_nullable_fks_breaks_with_a_follow_up_update() {
    let registry = registry();
    let factory = factory();
    let db = MockDatabase::new();
    let mut engine = Engine::new(&db, &registry, &factory, EngineConfig::default());

    let b = Box::new(NodeB { id: None, label: Value::Text("b".to_string()), a: RelatedValue::None });
    let b_handle = engine.persist(b).unwrap();
    let a = Box::new(NodeA {
        id: None,
        label: Value::Text("a".to_string()),
        b: RelatedValue::Pending(b_handle),
    });
    let a_handle = engine.persist(a).unwrap();
    {
        let entity = engine.identity_map_mut().get_entity_mut(b_handle).unwrap();
        entity.set_relation_pending("a", a_handle);
    }

    engine.flush().await.unwrap();

    let a_row = db.rows_of("node_a").into_iter().next().unwrap();
    let b_row = db.rows_of("node_b").into_iter().next().unwrap();
    assert_eq!(a_row.get("b_id"), b_row.get("id"));

    let log = db.log();
    let updates: Vec<_> = log.iter().filter(|e| e.sql.starts_with("UPDATE node_a")).collect();
    assert_eq!(updates.len(), 1);
}

#[tokio::test]
async fn clear_empties_the_identity_map() {
    let registry = registry();
    let factory = factory();
    let db = MockDatabase::new();
    let mut engine = Engine::new(&db, &registry, &factory, EngineConfig::default());

    let user = Box::new(User {
        id: None,
        username: Value::Text("John".to_string()),
        unit: RelatedValue::None,
        groups: Vec::new(),
    });
    engine.persist(user).unwrap();
    assert!(!engine.identity_map().is_empty());

    engine.clear();
    assert!(engine.identity_map().is_empty());
}

#[tokio::test]
async fn persist_flush_detach_find_round_trips_through_the_database() {
    let registry = registry();
    let factory = factory();
    let db = MockDatabase::new();
    let mut engine = Engine::new(&db, &registry, &factory, EngineConfig::default());

    let user = Box::new(User {
        id: None,
        username: Value::Text("John".to_string()),
        unit: RelatedValue::None,
        groups: Vec::new(),
    });
    let handle = engine.persist(user).unwrap();
    engine.flush().await.unwrap();
    engine.detach(handle).unwrap();
    assert!(engine.identity_map().get_entity(handle).is_none());

    let found = engine.find("User", Value::Int(1)).await.unwrap().unwrap();
    let entity = engine.identity_map().get_entity(found).unwrap();
    assert_eq!(entity.get_column("username"), Some(Value::Text("John".to_string())));
}

#[tokio::test]
async fn persisting_twice_before_flushing_is_idempotent() {
    let registry = registry();
    let factory = factory();
    let db = MockDatabase::new();
    let mut engine = Engine::new(&db, &registry, &factory, EngineConfig::default());

    let user = Box::new(User {
        id: Some(Value::Int(7)),
        username: Value::Text("John".to_string()),
        unit: RelatedValue::None,
        groups: Vec::new(),
    });
    let h1 = engine.persist(user).unwrap();
    let again = Box::new(User {
        id: Some(Value::Int(7)),
        username: Value::Text("ignored".to_string()),
        unit: RelatedValue::None,
        groups: Vec::new(),
    });
    let h2 = engine.persist(again).unwrap();
    assert_eq!(h1, h2);

    engine.flush().await.unwrap();
    let rows = db.rows_of("users");
    assert_eq!(rows.len(), 0, "an entity persisted with an existing primary key is an update target, not an insert");
}
