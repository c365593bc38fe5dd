//! Git protocol error types.

use thiserror::Error;

/// Errors that can occur during a protocol conversation.
#[derive(Debug, Error)]
pub enum GitError {
    /// Invalid pack file format.
    #[error("invalid pack file: {0}")]
    InvalidPack(String),

    /// Invalid pkt-line framing.
    #[error("invalid pkt-line: {0}")]
    InvalidPktLine(String),

    /// Side-band frame tagged with an unknown channel.
    #[error("invalid side-band channel: {0}")]
    InvalidSideBand(u8),

    /// The peer violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer reported a fatal error (`ERR` line).
    #[error("remote error: {0}")]
    Remote(String),

    /// The stream ended while more data was required.
    #[error("unexpected end of stream: {0}")]
    UnexpectedEof(String),

    /// The ref name is not present in the discovered advertisement.
    #[error("unknown ref: {0}")]
    UnknownRef(String),

    /// A create targeted a ref that already exists.
    #[error("ref already exists: {0}")]
    RefConflict(String),

    /// An update or create was issued without any commits.
    #[error("empty history for ref: {0}")]
    EmptyHistory(String),

    /// A ref handle was used for an operation it does not allow.
    #[error("invalid ref handle: {0}")]
    InvalidHandle(String),

    /// The remote did not negotiate a capability the action needs.
    #[error("unsupported by remote: {0}")]
    Unsupported(String),

    /// The action is not allowed in the conversation's current state.
    #[error("cannot {action} while {state}")]
    InvalidState {
        /// The attempted action.
        action: &'static str,
        /// The state the conversation was in.
        state: String,
    },

    /// Object model error.
    #[error("object error: {0}")]
    Object(#[from] gitwire_objects::ObjectError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    /// Returns true for errors raised by caller misuse, which leave the
    /// conversation usable.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::UnknownRef(_)
                | Self::RefConflict(_)
                | Self::EmptyHistory(_)
                | Self::InvalidHandle(_)
                | Self::Unsupported(_)
                | Self::InvalidState { .. }
        )
    }
}
