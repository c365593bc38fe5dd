//! Object model error types.

use thiserror::Error;

/// Errors that can occur while building or parsing git objects.
#[derive(Debug, Error)]
pub enum ObjectError {
    /// Malformed object identifier.
    #[error("invalid object id: {0}")]
    InvalidId(String),

    /// Unknown object type name or pack type code.
    #[error("invalid object type: {0}")]
    InvalidType(String),
}
