//! Shared fixture: users, posts, roles and countries in an in-memory store.

#![allow(dead_code)]

use restgate::config::EntityConfig;
use restgate::{resolve, Dispatcher, MemoryStorage, ResponseEnvelope, RestConfig};
use restgate::query::QueryParams;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn entities() -> Vec<EntityConfig> {
    serde_json::from_value(json!([
        {
            "name": "user",
            "table": "users",
            "timestamps": true,
            "fields": [
                {"name": "id", "type": "integer"},
                {"name": "name", "type": "text"},
                {"name": "email", "type": "text"},
                {"name": "age", "type": "integer"},
                {"name": "country_id", "type": "integer"}
            ],
            "relations": [
                {"name": "posts", "target": "post", "kind": "has_many"},
                {"name": "country", "target": "country", "kind": "belongs_to"},
                {"name": "roles", "target": "role", "kind": "belongs_to_many", "pivot_table": "role_user", "pivot_fields": ["level"]}
            ]
        },
        {
            "name": "post",
            "table": "posts",
            "timestamps": true,
            "fields": [
                {"name": "id", "type": "integer"},
                {"name": "user_id", "type": "integer"},
                {"name": "title", "type": "text"}
            ],
            "relations": [
                {"name": "author", "target": "user", "kind": "belongs_to", "foreign_key": "user_id"}
            ]
        },
        {
            "name": "role",
            "table": "roles",
            "fields": [{"name": "id", "type": "integer"}, {"name": "name", "type": "text"}]
        },
        {
            "name": "country",
            "table": "countries",
            "default_order": ["name"],
            "fields": [{"name": "id", "type": "integer"}, {"name": "name", "type": "text"}],
            "relations": [{"name": "users", "target": "user", "kind": "has_many", "foreign_key": "country_id"}]
        }
    ]))
    .expect("fixture entities deserialize")
}

/// Store with two users (5 and 7), five posts, three roles and two countries.
/// User 5 holds roles 1 and 2.
pub fn storage() -> Arc<MemoryStorage> {
    let registry = resolve(&entities()).expect("fixture entities resolve");
    let s = MemoryStorage::new(registry, 1000);
    s.seed(
        "country",
        vec![json!({"id": 1, "name": "Norway"}), json!({"id": 2, "name": "Chile"})],
    )
    .unwrap();
    s.seed(
        "user",
        vec![
            json!({"id": 5, "name": "Ann", "email": "ann@example.com", "age": 34, "country_id": 1,
                   "created_at": "2024-01-10T00:00:00Z", "updated_at": "2024-01-10T00:00:00Z"}),
            json!({"id": 7, "name": "Bob", "email": "bob@example.org", "age": 19, "country_id": 2,
                   "created_at": "2024-03-01T00:00:00Z", "updated_at": "2024-03-01T00:00:00Z"}),
        ],
    )
    .unwrap();
    s.seed(
        "post",
        vec![
            json!({"id": 1, "user_id": 5, "title": "first", "created_at": "2024-02-01T00:00:00Z"}),
            json!({"id": 2, "user_id": 5, "title": "second", "created_at": "2024-02-02T00:00:00Z"}),
            json!({"id": 3, "user_id": 5, "title": "third", "created_at": "2024-02-03T00:00:00Z"}),
            json!({"id": 4, "user_id": 7, "title": "hello", "created_at": "2024-02-04T00:00:00Z"}),
            json!({"id": 5, "user_id": 5, "title": "fourth", "created_at": "2024-02-05T00:00:00Z"}),
        ],
    )
    .unwrap();
    s.seed(
        "role",
        vec![
            json!({"id": 1, "name": "admin"}),
            json!({"id": 2, "name": "editor"}),
            json!({"id": 3, "name": "viewer"}),
        ],
    )
    .unwrap();
    s.seed_pivot(
        "role_user",
        vec![
            json!({"user_id": 5, "role_id": 1, "level": 1}),
            json!({"user_id": 5, "role_id": 2, "level": 2}),
        ],
    )
    .unwrap();
    Arc::new(s)
}

pub fn dispatcher() -> (Dispatcher, Arc<MemoryStorage>) {
    let storage = storage();
    let d = Dispatcher::for_storage(RestConfig::default(), storage.clone()).expect("dispatcher builds");
    (d, storage)
}

pub fn params(pairs: &[(&str, &str)]) -> QueryParams {
    QueryParams::from_pairs(pairs.iter().copied())
}

/// `data` array field values, in order.
pub fn column(env: &ResponseEnvelope, field: &str) -> Vec<Value> {
    env.payload
        .as_array()
        .map(|rows| rows.iter().map(|r| r[field].clone()).collect())
        .unwrap_or_default()
}

