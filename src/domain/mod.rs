//! Domain layer for the dispatch engine
//!
//! Core models, error types and the ports the engine consumes.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{DomainError, DomainResult};
