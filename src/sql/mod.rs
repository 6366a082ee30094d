//! PostgreSQL storage: safe SQL builder (identifiers from config only, values as parameters) and its executor.

mod builder;
pub mod params;
mod storage;
pub use builder::*;
pub use params::*;
pub use storage::PgStorage;
