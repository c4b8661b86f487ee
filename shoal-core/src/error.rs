//! Error types for Shoal core operations.
//!
//! All errors are explicit and typed. Callers match on them, they never parse strings.

use thiserror::Error;

/// The result type for Shoal core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Shoal core operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A resource limit was exceeded.
    #[error("limit exceeded: {limit} (max={max}, actual={actual})")]
    LimitExceeded {
        /// Which limit was exceeded.
        limit: &'static str,
        /// The maximum allowed value.
        max: u64,
        /// The actual value that exceeded the limit.
        actual: u64,
    },

    /// An invalid argument was provided.
    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument {
        /// The name of the argument.
        name: &'static str,
        /// Why it was invalid.
        reason: &'static str,
    },

    /// The requested resource was not found.
    #[error("{resource} not found: {id}")]
    NotFound {
        /// The type of resource.
        resource: &'static str,
        /// An identifier for the resource.
        id: u64,
    },

    /// The operation is not permitted in the current state.
    #[error("invalid state: in {current}, need {required}")]
    InvalidState {
        /// The current state.
        current: &'static str,
        /// The required state for this operation.
        required: &'static str,
    },
}
