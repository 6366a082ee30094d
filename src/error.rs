//! Typed errors and HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing reference: {kind} '{id}'")]
    MissingReference { kind: &'static str, id: String },
    #[error("invalid primary key: entity {entity} field {field}")]
    InvalidPrimaryKey { entity: String, field: String },
    #[error("duplicate {kind} name: {name}")]
    DuplicateName { kind: &'static str, name: String },
    #[error("config load: {0}")]
    Load(String),
    #[error("validation: {0}")]
    Validation(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("query parse: {0}")]
    QueryParse(String),
    #[error("relation '{relation}' not found on {entity}")]
    RelationNotFound { entity: String, relation: String },
    #[error("invalid relation chain '{path}': {reason}")]
    InvalidRelationChain { path: String, reason: String },
    #[error("no handler registered for '{0}'")]
    HandlerNotFound(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
}

impl AppError {
    /// Stable machine-readable code for the error body.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config_error",
            AppError::QueryParse(_) => "query_parse_error",
            AppError::RelationNotFound { .. } => "relation_not_found",
            AppError::InvalidRelationChain { .. } => "invalid_relation_chain",
            AppError::HandlerNotFound(_) => "handler_not_found",
            AppError::NotFound(_) => "not_found",
            AppError::UnsupportedOperation(_) => "unsupported_operation",
            AppError::Validation(_) => "validation_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::Db(_) => "database_error",
        }
    }

    /// HTTP status for this error. `write` selects the write-path contract:
    /// a missing entity or relation is a bad request there, a 404 on reads.
    pub fn status(&self, write: bool) -> StatusCode {
        match self {
            AppError::NotFound(_) | AppError::RelationNotFound { .. } => {
                if write {
                    StatusCode::BAD_REQUEST
                } else {
                    StatusCode::NOT_FOUND
                }
            }
            AppError::QueryParse(_)
            | AppError::InvalidRelationChain { .. }
            | AppError::Validation(_)
            | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::HandlerNotFound(_) => StatusCode::NOT_FOUND,
            AppError::UnsupportedOperation(_) => StatusCode::OK,
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Db(e) => {
                if let sqlx::Error::RowNotFound = e {
                    StatusCode::NOT_FOUND
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }
        }
    }

    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status(false);
        let body = ErrorBody { error: self.detail() };
        (status, Json(body)).into_response()
    }
}
