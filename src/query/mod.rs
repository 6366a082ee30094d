//! Declarative query translation: grammar, parsed directives, and the translator.

pub mod grammar;
mod params;
mod parsed;
mod translator;

pub use params::QueryParams;
pub use parsed::*;
pub use translator::{QueryBuilder, QueryTranslator};
