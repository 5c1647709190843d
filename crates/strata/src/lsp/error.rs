//! Failures of the language-server bridge.
//!
//! The bridge only cares whether a failure means the server is gone (so
//! realtime expansion should stop asking) or whether one request went wrong.
//! The `CollaboratorError` conversion below draws that line.

use std::fmt::Display;

use thiserror::Error;

use crate::error::CollaboratorError;

/// Failure talking to a language server.
#[derive(Debug, Error)]
pub enum LspError {
    /// The server binary is not on `PATH`.
    #[error("{command} not found; realtime call-hierarchy expansion is unavailable\n{install_hint}")]
    Missing {
        /// Executable that was looked up.
        command: String,
        /// How to install it.
        install_hint: String,
    },

    /// The server could not be launched or rejected the handshake.
    #[error("could not start {command}: {reason}")]
    Startup {
        /// Executable that was launched.
        command: String,
        /// What went wrong.
        reason: String,
    },

    /// Reading or writing the server's pipes failed.
    #[error("language server I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A message body was not the expected JSON.
    #[error("malformed JSON-RPC payload: {0}")]
    Json(#[from] serde_json::Error),

    /// Broken framing, or a response that does not answer the pending request.
    #[error("JSON-RPC protocol violation: {0}")]
    Protocol(String),

    /// The server answered with an error object.
    #[error("language server returned error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Server-supplied text.
        message: String,
    },

    /// A symbol or URI that does not name a local file.
    #[error("not a local file: {0}")]
    NotLocal(String),

    /// End of stream on the server's stdout.
    #[error("language server closed its output")]
    Closed,

    /// The bridge worker thread is gone.
    #[error("call-hierarchy bridge stopped")]
    BridgeStopped,
}

impl LspError {
    /// Server binary not found.
    #[must_use]
    pub fn missing(command: &str, install_hint: &str) -> Self {
        Self::Missing {
            command: command.to_string(),
            install_hint: install_hint.to_string(),
        }
    }

    /// Launch or handshake failure.
    #[must_use]
    pub fn startup(command: &str, reason: impl Display) -> Self {
        Self::Startup {
            command: command.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the server can no longer answer anything.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Missing { .. } | Self::Startup { .. } | Self::Closed | Self::BridgeStopped
        )
    }
}

impl From<LspError> for CollaboratorError {
    fn from(error: LspError) -> Self {
        if error.is_fatal() {
            Self::Unavailable(error.to_string())
        } else {
            Self::Failed(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lost_server_maps_to_unavailable() {
        for error in [
            LspError::missing("rust-analyzer", "rustup component add rust-analyzer"),
            LspError::startup("rust-analyzer", "handshake refused"),
            LspError::Closed,
            LspError::BridgeStopped,
        ] {
            let mapped: CollaboratorError = error.into();
            assert!(matches!(mapped, CollaboratorError::Unavailable(_)), "{mapped:?}");
        }
    }

    #[test]
    fn single_request_failures_map_to_failed() {
        let err: CollaboratorError = LspError::Rpc {
            code: -32601,
            message: "no such method".into(),
        }
        .into();
        match err {
            CollaboratorError::Failed(message) => assert!(message.contains("-32601")),
            other => panic!("expected Failed, got {other:?}"),
        }
        let err: CollaboratorError = LspError::Protocol("missing Content-Length".into()).into();
        assert!(matches!(err, CollaboratorError::Failed(_)));
    }
}
