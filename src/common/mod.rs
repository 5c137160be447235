//! Shared infrastructure: diagnostics and error types.

pub mod error;

pub use error::{InvariantError, ValidationResult};
