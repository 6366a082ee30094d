//! HTTP handlers: the uniform REST entry point.

pub mod rest;
pub use rest::*;
