//! End-to-end dispatch over the in-memory engine.

mod common;

use axum::http::{Method, StatusCode};
use common::{column, dispatcher, params};
use restgate::config::EntityConfig;
use restgate::{resolve, Dispatcher, IncomingRequest, MemoryStorage, RestConfig};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn related_posts_newest_first_with_limit() {
    let (d, _) = dispatcher();
    let req = IncomingRequest::new(Method::GET, "users")
        .id(5)
        .relation("posts", None)
        .params(params(&[("orderby", "-created_at"), ("limit", "2")]));
    let env = d.dispatch(req).await;
    assert_eq!(env.status, StatusCode::OK);
    assert_eq!(column(&env, "id"), vec![json!(5), json!(3)]);
    assert_eq!(column(&env, "title"), vec![json!("fourth"), json!("third")]);
}

#[tokio::test]
async fn attach_returns_owner_with_relation_loaded() {
    let (d, storage) = dispatcher();
    let req = IncomingRequest::new(Method::POST, "users").id(5).relation("roles", Some(3));
    let env = d.dispatch(req).await;
    assert_eq!(env.status, StatusCode::OK);
    assert_eq!(env.payload["id"], 5);
    let roles = env.payload["roles"].as_array().unwrap();
    let ids: Vec<_> = roles.iter().map(|r| r["id"].clone()).collect();
    assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);
    assert_eq!(roles[2]["pivot"], json!({"user_id": 5, "role_id": 3, "level": null}));
    assert_eq!(storage.pivot_rows("role_user").len(), 3);
}

#[tokio::test]
async fn attach_with_all_returns_collection() {
    let (d, _) = dispatcher();
    let req = IncomingRequest::new(Method::POST, "users")
        .id(5)
        .relation("roles", Some(3))
        .params(params(&[("all", "true")]));
    let env = d.dispatch(req).await;
    assert_eq!(env.status, StatusCode::OK);
    assert_eq!(column(&env, "id"), vec![json!(5), json!(7)]);
}

#[tokio::test]
async fn attach_twice_merges_pivot_attributes() {
    let (d, storage) = dispatcher();
    let first = IncomingRequest::new(Method::POST, "users")
        .id(5)
        .relation("roles", Some(1))
        .body(json!({"level": 9}));
    d.dispatch(first).await;
    let links = storage.pivot_rows("role_user");
    assert_eq!(links.len(), 2);
    assert_eq!(links[0]["level"], 9);
}

#[tokio::test]
async fn attach_rejects_missing_related_record() {
    let (d, storage) = dispatcher();
    let req = IncomingRequest::new(Method::POST, "users").id(5).relation("roles", Some(42));
    let env = d.dispatch(req).await;
    assert_eq!(env.status, StatusCode::BAD_REQUEST);
    assert_eq!(env.payload["code"], "not_found");
    assert_eq!(storage.pivot_rows("role_user").len(), 2);
}

#[tokio::test]
async fn attach_on_non_pivot_relation_is_bad_request() {
    let (d, _) = dispatcher();
    let req = IncomingRequest::new(Method::POST, "users").id(5).relation("posts", Some(4));
    let env = d.dispatch(req).await;
    assert_eq!(env.status, StatusCode::BAD_REQUEST);
    assert_eq!(env.payload["code"], "bad_request");
}

#[tokio::test]
async fn detach_removes_link() {
    let (d, _) = dispatcher();
    let req = IncomingRequest::new(Method::DELETE, "users").id(5).relation("roles", Some(1));
    let env = d.dispatch(req).await;
    assert_eq!(env.status, StatusCode::OK);
    let ids: Vec<_> = env.payload["roles"].as_array().unwrap().iter().map(|r| r["id"].clone()).collect();
    assert_eq!(ids, vec![json!(2)]);
}

#[tokio::test]
async fn sync_replaces_links_by_default() {
    let (d, _) = dispatcher();
    let req = IncomingRequest::new(Method::PUT, "users")
        .id(5)
        .relation("roles", Some(3))
        .body(json!({"level": 4}));
    let env = d.dispatch(req).await;
    let roles = env.payload["roles"].as_array().unwrap();
    assert_eq!(roles.len(), 1);
    assert_eq!(roles[0]["id"], 3);
    assert_eq!(roles[0]["pivot"]["level"], 4);
}

#[tokio::test]
async fn sync_without_detaching_keeps_existing_links() {
    let (d, _) = dispatcher();
    let req = IncomingRequest::new(Method::PUT, "users")
        .id(5)
        .relation("roles", Some(3))
        .params(params(&[("sync_without_detaching", "true")]));
    let env = d.dispatch(req).await;
    let ids: Vec<_> = env.payload["roles"].as_array().unwrap().iter().map(|r| r["id"].clone()).collect();
    assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);
}

#[tokio::test]
async fn missing_record_is_400_on_write_and_404_on_read() {
    let (d, _) = dispatcher();
    let env = d.dispatch(IncomingRequest::new(Method::DELETE, "users").id(999)).await;
    assert_eq!(env.status, StatusCode::BAD_REQUEST);
    assert_eq!(env.body()["error"]["code"], "not_found");

    let env = d.dispatch(IncomingRequest::new(Method::GET, "users").id(999)).await;
    assert_eq!(env.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn page_wins_over_offset() {
    let (d, _) = dispatcher();
    let req = IncomingRequest::new(Method::GET, "posts").params(params(&[("limit", "2"), ("page", "2"), ("offset", "0")]));
    let env = d.dispatch(req).await;
    assert_eq!(column(&env, "id"), vec![json!(3), json!(4)]);

    let req = IncomingRequest::new(Method::GET, "posts").params(params(&[("limit", "2"), ("offset", "1")]));
    let env = d.dispatch(req).await;
    assert_eq!(column(&env, "id"), vec![json!(2), json!(3)]);
}

#[tokio::test]
async fn select_and_where_shape_rows() {
    let (d, _) = dispatcher();
    let req = IncomingRequest::new(Method::GET, "users").params(params(&[("select", "name"), ("where", "age,>,20")]));
    let env = d.dispatch(req).await;
    assert_eq!(env.body(), json!({"data": [{"name": "Ann"}]}));

    let req = IncomingRequest::new(Method::GET, "users").params(params(&[("where", "email,like,%example.org")]));
    let env = d.dispatch(req).await;
    assert_eq!(column(&env, "name"), vec![json!("Bob")]);
}

#[tokio::test]
async fn unknown_where_field_is_query_error() {
    let (d, _) = dispatcher();
    let req = IncomingRequest::new(Method::GET, "users").params(params(&[("where", "shoe_size,42")]));
    let env = d.dispatch(req).await;
    assert_eq!(env.status, StatusCode::BAD_REQUEST);
    assert_eq!(env.payload["code"], "query_parse_error");
}

#[tokio::test]
async fn aggregate_select_groups_rows() {
    let (d, _) = dispatcher();
    let req = IncomingRequest::new(Method::GET, "posts")
        .params(params(&[("select", "user_id;total=count(*)"), ("orderby", "-total")]));
    let env = d.dispatch(req).await;
    assert_eq!(
        env.body(),
        json!({"data": [{"user_id": 5, "total": 4}, {"user_id": 7, "total": 1}]})
    );
}

#[tokio::test]
async fn distinct_collapses_duplicates() {
    let (d, _) = dispatcher();
    let req = IncomingRequest::new(Method::GET, "posts").params(params(&[("select", "user_id"), ("distinct", "true")]));
    let env = d.dispatch(req).await;
    assert_eq!(column(&env, "user_id"), vec![json!(5), json!(7)]);
}

#[tokio::test]
async fn temporal_range_uses_timestamp_field() {
    let (d, _) = dispatcher();
    let req = IncomingRequest::new(Method::GET, "users").params(params(&[("from", "2024-02-01")]));
    let env = d.dispatch(req).await;
    assert_eq!(column(&env, "name"), vec![json!("Bob")]);
}

#[tokio::test]
async fn default_order_applies_without_orderby() {
    let (d, _) = dispatcher();
    let env = d.dispatch(IncomingRequest::new(Method::GET, "countries")).await;
    assert_eq!(column(&env, "name"), vec![json!("Chile"), json!("Norway")]);
}

#[tokio::test]
async fn narrowed_relation_returns_member_or_404() {
    let (d, _) = dispatcher();
    let req = IncomingRequest::new(Method::GET, "users").id(5).relation("roles", Some(2));
    let env = d.dispatch(req).await;
    assert_eq!(env.status, StatusCode::OK);
    assert_eq!(env.payload["name"], "editor");
    assert_eq!(env.payload["pivot"]["level"], 2);

    let req = IncomingRequest::new(Method::GET, "users").id(5).relation("roles", Some(3));
    let env = d.dispatch(req).await;
    assert_eq!(env.status, StatusCode::NOT_FOUND);
    assert_eq!(env.body(), json!({"data": null}));
}

#[tokio::test]
async fn dotted_relation_walks_to_one_hops() {
    let (d, _) = dispatcher();
    let req = IncomingRequest::new(Method::GET, "posts").id(4).relation("author.country", None);
    let env = d.dispatch(req).await;
    assert_eq!(env.payload, json!({"id": 2, "name": "Chile"}));

    let req = IncomingRequest::new(Method::GET, "users").id(5).relation("posts.author", None);
    let env = d.dispatch(req).await;
    assert_eq!(env.status, StatusCode::BAD_REQUEST);
    assert_eq!(env.payload["code"], "invalid_relation_chain");
}

#[tokio::test]
async fn eager_loading_nests_relations() {
    let (d, _) = dispatcher();
    let req = IncomingRequest::new(Method::GET, "users")
        .id(5)
        .params(params(&[("with", "posts;country;roles")]));
    let env = d.dispatch(req).await;
    assert_eq!(env.payload["posts"].as_array().unwrap().len(), 4);
    assert_eq!(env.payload["country"]["name"], "Norway");
    assert_eq!(env.payload["roles"][1]["pivot"]["level"], 2);

    let req = IncomingRequest::new(Method::GET, "countries")
        .id(2)
        .params(params(&[("with", "users.posts"), ("select", "name")]));
    let env = d.dispatch(req).await;
    assert_eq!(env.payload["users"][0]["name"], "Bob");
    assert_eq!(env.payload["users"][0]["posts"][0]["title"], "hello");
}

#[tokio::test]
async fn unknown_eager_relation_is_not_found() {
    let (d, _) = dispatcher();
    let req = IncomingRequest::new(Method::GET, "users").params(params(&[("with", "pets")]));
    let env = d.dispatch(req).await;
    assert_eq!(env.status, StatusCode::NOT_FOUND);
    assert_eq!(env.payload["code"], "relation_not_found");
}

#[tokio::test]
async fn create_validates_and_returns_201() {
    let (d, _) = dispatcher();
    let req = IncomingRequest::new(Method::POST, "users").body(json!({"name": "Cy", "email": "cy@example.com", "age": 40}));
    let env = d.dispatch(req).await;
    assert_eq!(env.status, StatusCode::CREATED);
    assert_eq!(env.payload["id"], 8);
    assert!(env.payload["created_at"].as_str().unwrap().ends_with('Z'));

    let req = IncomingRequest::new(Method::POST, "users").body(json!({"name": "Cy", "shoe_size": 44}));
    let env = d.dispatch(req).await;
    assert_eq!(env.status, StatusCode::BAD_REQUEST);
    assert_eq!(env.payload["code"], "validation_error");
}

#[tokio::test]
async fn update_returns_fresh_record() {
    let (d, _) = dispatcher();
    let req = IncomingRequest::new(Method::PATCH, "users").id(7).body(json!({"age": 20, "id": 99}));
    let env = d.dispatch(req).await;
    assert_eq!(env.status, StatusCode::OK);
    assert_eq!(env.payload["id"], 7);
    assert_eq!(env.payload["age"], 20);
    assert_ne!(env.payload["updated_at"], "2024-03-01T00:00:00Z");
}

#[tokio::test]
async fn delete_returns_removed_record() {
    let (d, _) = dispatcher();
    let env = d.dispatch(IncomingRequest::new(Method::DELETE, "posts").id(4)).await;
    assert_eq!(env.payload["title"], "hello");
    let env = d.dispatch(IncomingRequest::new(Method::GET, "posts")).await;
    assert_eq!(column(&env, "id").len(), 4);
}

#[tokio::test]
async fn irregular_plural_resource_is_routable() {
    let entities: Vec<EntityConfig> = serde_json::from_value(json!([
        {"name": "person", "table": "people", "fields": [{"name": "id", "type": "integer"}, {"name": "name", "type": "text"}]}
    ]))
    .unwrap();
    let storage = MemoryStorage::new(resolve(&entities).unwrap(), 1000);
    storage.seed("person", vec![json!({"id": 1, "name": "Ada"})]).unwrap();
    let d = Dispatcher::for_storage(RestConfig::default(), Arc::new(storage)).unwrap();

    let env = d.dispatch(IncomingRequest::new(Method::GET, "people")).await;
    assert_eq!(env.status, StatusCode::OK);
    assert_eq!(column(&env, "name"), vec![json!("Ada")]);

    let env = d.dispatch(IncomingRequest::new(Method::GET, "people").id(1)).await;
    assert_eq!(env.payload["name"], "Ada");

    let env = d.dispatch(IncomingRequest::new(Method::GET, "people-list")).await;
    assert_eq!(env.status, StatusCode::NOT_FOUND);
    assert_eq!(env.payload["code"], "handler_not_found");
}

#[tokio::test]
async fn create_with_all_returns_collection_and_201() {
    let (d, _) = dispatcher();
    let req = IncomingRequest::new(Method::POST, "users")
        .body(json!({"name": "Cy", "email": "cy@example.com", "age": 40}))
        .params(params(&[("all", "true")]));
    let env = d.dispatch(req).await;
    assert_eq!(env.status, StatusCode::CREATED);
    assert!(env.payload.is_array());
    assert_eq!(column(&env, "id"), vec![json!(5), json!(7), json!(8)]);
}

#[tokio::test]
async fn update_with_all_returns_filtered_collection() {
    let (d, _) = dispatcher();
    let req = IncomingRequest::new(Method::PATCH, "users")
        .id(7)
        .body(json!({"age": 20}))
        .params(params(&[("all", "true"), ("where", "age,<,30")]));
    let env = d.dispatch(req).await;
    assert_eq!(env.status, StatusCode::OK);
    assert!(env.payload.is_array());
    assert_eq!(column(&env, "id"), vec![json!(7)]);
    assert_eq!(column(&env, "age"), vec![json!(20)]);
}

#[tokio::test]
async fn delete_with_all_returns_remaining_rows() {
    let (d, _) = dispatcher();
    let req = IncomingRequest::new(Method::DELETE, "posts")
        .id(4)
        .params(params(&[("all", "true")]));
    let env = d.dispatch(req).await;
    assert_eq!(env.status, StatusCode::OK);
    assert!(env.payload.is_array());
    assert_eq!(column(&env, "id"), vec![json!(1), json!(2), json!(3), json!(5)]);
}

#[tokio::test]
async fn detach_and_sync_with_all_return_collection() {
    let (d, storage) = dispatcher();
    let req = IncomingRequest::new(Method::DELETE, "users")
        .id(5)
        .relation("roles", Some(1))
        .params(params(&[("all", "true")]));
    let env = d.dispatch(req).await;
    assert_eq!(env.status, StatusCode::OK);
    assert!(env.payload.is_array());
    assert_eq!(column(&env, "id"), vec![json!(5), json!(7)]);
    assert_eq!(storage.pivot_rows("role_user").len(), 1);

    let req = IncomingRequest::new(Method::PUT, "users")
        .id(5)
        .relation("roles", Some(3))
        .params(params(&[("all", "true")]));
    let env = d.dispatch(req).await;
    assert_eq!(env.status, StatusCode::OK);
    assert!(env.payload.is_array());
    assert_eq!(column(&env, "id"), vec![json!(5), json!(7)]);
    let links = storage.pivot_rows("role_user");
    assert_eq!(links.len(), 1);
    assert_eq!(links[0]["role_id"], 3);
}
