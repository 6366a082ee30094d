//! Standard response envelope: `{"data": ...}` on success, `{"error": ...}` on failure.

use crate::config::CorsConfig;
use crate::error::AppError;
use crate::service::Record;
use axum::{
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

/// Result shape of a read.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Null,
    One(Record),
    Many(Vec<Record>),
}

impl From<Payload> for Value {
    fn from(p: Payload) -> Value {
        match p {
            Payload::Null => Value::Null,
            Payload::One(r) => Value::Object(r),
            Payload::Many(rows) => Value::Array(rows.into_iter().map(Value::Object).collect()),
        }
    }
}

impl From<Option<Record>> for Payload {
    fn from(r: Option<Record>) -> Payload {
        r.map(Payload::One).unwrap_or(Payload::Null)
    }
}

/// `(payload, status, is_error)`. `is_error` only picks the top-level key; the status
/// is always set explicitly.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseEnvelope {
    pub payload: Value,
    pub status: StatusCode,
    pub is_error: bool,
}

impl ResponseEnvelope {
    pub fn success(payload: impl Into<Value>) -> Self {
        ResponseEnvelope {
            payload: payload.into(),
            status: StatusCode::OK,
            is_error: false,
        }
    }

    pub fn error(payload: impl Into<Value>, status: StatusCode) -> Self {
        ResponseEnvelope {
            payload: payload.into(),
            status,
            is_error: true,
        }
    }

    /// Envelope for a failed operation; `write` picks the write-path status contract.
    pub fn from_error(err: &AppError, write: bool) -> Self {
        if let AppError::UnsupportedOperation(_) = err {
            return Self::success(Value::Null);
        }
        let detail = serde_json::to_value(err.detail()).unwrap_or(Value::Null);
        Self::error(detail, err.status(write))
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn body(&self) -> Value {
        if self.is_error {
            json!({ "error": self.payload })
        } else {
            json!({ "data": self.payload })
        }
    }

    /// HTTP response with CORS headers when enabled; preflight `OPTIONS` is left alone.
    pub fn into_http(self, cors: &CorsConfig, method: &Method) -> Response {
        let mut response = self.into_response();
        if !cors.enabled || method == Method::OPTIONS {
            return response;
        }
        let headers = response.headers_mut();
        let pairs = [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, cors.allow_origins.clone()),
            (header::ACCESS_CONTROL_ALLOW_METHODS, cors.allow_methods.join(", ")),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, cors.allow_headers.clone()),
        ];
        for (name, value) in pairs {
            match HeaderValue::from_str(&value) {
                Ok(v) => {
                    headers.insert(name, v);
                }
                Err(_) => tracing::warn!(header = %name, value = %value, "invalid CORS header value"),
            }
        }
        if cors.allow_credentials {
            headers.insert(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        }
        response
    }
}

impl IntoResponse for ResponseEnvelope {
    fn into_response(self) -> Response {
        (self.status, Json(self.body())).into_response()
    }
}
