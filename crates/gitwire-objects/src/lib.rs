//! Git object model for gitwire.
//!
//! Object identifiers, object types and loose git objects as they travel
//! through the smart transfer protocol.

mod error;
mod object;

pub use error::ObjectError;
pub use object::{GitObject, ObjectId, ObjectType};

/// Result type for object operations.
pub type Result<T> = std::result::Result<T, ObjectError>;
