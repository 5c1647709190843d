//! Language-server plumbing for realtime graph expansion.
//!
//! [`LspClient`] is a thin JSON-RPC transport over a server's stdio.
//! [`LspBridge`] owns one client on a keep-alive worker thread and answers
//! call-hierarchy questions for the staged cascade.
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::PathBuf;
//! use std::time::Duration;
//! use strata::lsp::{AnyProvider, LspBridge};
//!
//! let bridge = LspBridge::new(
//!     AnyProvider::default(),
//!     PathBuf::from("/path/to/workspace"),
//!     Duration::from_secs(10),
//! )?;
//! // The server starts on the first neighbors() call.
//! bridge.shutdown()?;
//! # Ok::<(), strata::CollaboratorError>(())
//! ```
//!
//! ## Design Notes
//!
//! - Uses `lsp-types` for all protocol types
//! - JSON-RPC format: `Content-Length: N\r\n\r\n{json}`
//! - Request IDs are incrementing integers
//! - One request in flight per bridge

mod bridge;
mod error;
mod provider;
mod transport;

pub use bridge::{BackendFactory, HierarchyBackend, LspBridge, LspHierarchy};
pub use error::LspError;
pub use provider::{AnyProvider, LspProvider, PyrightProvider, RustAnalyzerProvider};
pub use transport::LspClient;

/// Result type for LSP operations.
pub type Result<T> = std::result::Result<T, LspError>;
