//! Crate-level error type.
//!
//! Every failure in the sync core maps to one [`SyncError`] variant. None of
//! them is fatal to a session: callers log and degrade into a chat entry or an
//! inline error string.

use thiserror::Error;

/// Errors raised by the transport adapter, the assistant pipeline, and the
/// local stores.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The event channel is not (or no longer) established.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Any completion-call failure: network, non-2xx, malformed body, missing text.
    #[error("assistant unavailable: {0}")]
    AssistantUnavailable(String),

    /// The trigger token was sent with nothing after it.
    #[error("assistant command has no query")]
    EmptyCommand,

    /// An entry with this id is already in the transcript.
    #[error("duplicate chat entry '{id}'")]
    DuplicateEntry { id: String },

    /// The command router is dispatching and refuses new submissions.
    #[error("assistant is busy with a previous request")]
    Busy,

    /// A local edit targeted a file that is not the active document.
    #[error("file '{file_id}' is not the active document")]
    InactiveFile { file_id: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Short human-readable message for inline display in the input surface.
    ///
    /// Assistant failures are shown as `Error: <reason>`; everything else uses
    /// the `Display` text.
    pub fn inline_message(&self) -> String {
        match self {
            SyncError::AssistantUnavailable(reason) => format!("Error: {reason}"),
            other => other.to_string(),
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, SyncError::TransportUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
