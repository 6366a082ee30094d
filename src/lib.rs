//! restgate: one uniform REST surface over storage-backed entities declared in config.

pub mod case;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod memory;
pub mod query;
pub mod relation;
pub mod response;
pub mod routes;
pub mod service;
pub mod sql;
pub mod state;

pub use config::{load_entities_from_path, resolve, EntityRegistry, RestConfig};
pub use dispatch::{Dispatcher, HandlerRegistry, IncomingRequest, Operation};
pub use error::{AppError, ConfigError};
pub use memory::MemoryStorage;
pub use response::{Payload, ResponseEnvelope};
pub use routes::{app_router, common_routes, rest_routes};
pub use service::{EntityHandler, Handler, Storage};
pub use sql::PgStorage;
pub use state::AppState;
