//! Handlers and the storage seam they run against.

mod handler;
mod storage;
mod validation;
pub use handler::{EntityHandler, Handler};
pub use storage::*;
pub use validation::RequestValidator;
