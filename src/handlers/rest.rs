//! Uniform REST handler: turns `/{resource}/{id?}/{relation?}/{relationId?}` into a dispatch.

use crate::dispatch::IncomingRequest;
use crate::error::AppError;
use crate::query::QueryParams;
use crate::response::ResponseEnvelope;
use crate::service::EntityId;
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::Method,
    response::Response,
};
use serde_json::Value;
use std::collections::HashMap;

/// Numeric path ids only; anything else does not match a route.
fn parse_id(segments: &HashMap<String, String>, key: &str) -> Result<Option<EntityId>, AppError> {
    match segments.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<EntityId>()
            .map(Some)
            .map_err(|_| AppError::NotFound(format!("no route for {} '{}'", key, raw))),
    }
}

fn parse_body(body: &Bytes) -> Result<Value, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|e| AppError::BadRequest(format!("invalid JSON body: {}", e)))
}

fn build_request(
    method: Method,
    segments: &HashMap<String, String>,
    pairs: Vec<(String, String)>,
    body: &Bytes,
) -> Result<IncomingRequest, (AppError, bool)> {
    let route_miss = |e| (e, false);
    let id = parse_id(segments, "id").map_err(route_miss)?;
    let relation_id = parse_id(segments, "relation_id").map_err(route_miss)?;
    let body = parse_body(body).map_err(|e| (e, true))?;

    let resource = segments.get("resource").cloned().unwrap_or_default();
    let mut req = IncomingRequest::new(method, resource)
        .params(QueryParams::new(pairs))
        .body(body);
    if let Some(id) = id {
        req = req.id(id);
    }
    if let Some(relation) = segments.get("relation") {
        req = req.relation(relation.clone(), relation_id);
    }
    Ok(req)
}

pub async fn dispatch_rest(
    State(state): State<AppState>,
    method: Method,
    Path(segments): Path<HashMap<String, String>>,
    Query(pairs): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Response {
    let cors = &state.dispatcher.config().cors;
    let envelope = match build_request(method.clone(), &segments, pairs, &body) {
        Ok(req) => state.dispatcher.dispatch(req).await,
        Err((e, write)) => {
            tracing::debug!(error = %e, "request rejected before dispatch");
            ResponseEnvelope::from_error(&e, write)
        }
    };
    envelope.into_http(cors, &method)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segments(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn numeric_segments_become_ids() {
        let s = segments(&[("resource", "users"), ("id", "5"), ("relation", "roles"), ("relation_id", "3")]);
        let req = build_request(Method::POST, &s, vec![], &Bytes::new()).unwrap();
        assert_eq!(req.id, Some(5));
        assert_eq!(req.relation.as_deref(), Some("roles"));
        assert_eq!(req.relation_id, Some(3));
        assert_eq!(req.body, Value::Null);
    }

    #[test]
    fn non_numeric_id_is_a_route_miss() {
        let s = segments(&[("resource", "users"), ("id", "abc")]);
        let (err, write) = build_request(Method::GET, &s, vec![], &Bytes::new()).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(!write);
    }

    #[test]
    fn malformed_json_is_rejected() {
        let s = segments(&[("resource", "users")]);
        let (err, _) = build_request(Method::POST, &s, vec![], &Bytes::from_static(b"{oops")).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
