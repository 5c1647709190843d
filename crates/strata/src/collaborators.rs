//! Contracts for external services the engine depends on.
//!
//! Parsing, embedding, reranking and call-hierarchy lookups are supplied by
//! the caller as trait objects. Every call that may block on another process
//! goes through [`run_with_timeout`] so a stalled service degrades a stage
//! instead of hanging a search.

use std::sync::mpsc;
use std::time::Duration;

use crate::binary_search::pack_bits;
use crate::error::CollaboratorError;
use crate::types::{Language, Relationship, Symbol};

/// Result type for collaborator calls.
pub type CollabResult<T> = std::result::Result<T, CollaboratorError>;

/// Symbols and relationships extracted from one file.
#[derive(Debug, Clone, Default)]
pub struct ParsedSource {
    /// Definitions, in source order
    pub symbols: Vec<Symbol>,
    /// References from those definitions
    pub relationships: Vec<Relationship>,
}

/// Extracts symbols and relationships from source text.
pub trait SourceParser: Send + Sync {
    /// Whether `language` can be parsed.
    fn supports(&self, language: Language) -> bool;

    /// Parse `text` written in `language`.
    fn parse(&self, text: &str, language: Language) -> CollabResult<ParsedSource>;
}

/// Turns text into vectors.
pub trait Embedder: Send + Sync {
    /// Dense embedding of `text`.
    fn embed(&self, text: &str) -> CollabResult<Vec<f32>>;

    /// Packed sign bits of the embedding.
    fn embed_binary(&self, text: &str) -> CollabResult<Vec<u8>> {
        Ok(pack_bits(&self.embed(text)?))
    }
}

/// Scores (query, document) pairs; higher is more relevant.
pub trait Reranker: Send + Sync {
    /// One score per pair, in input order.
    fn score_pairs(&self, pairs: &[(String, String)]) -> CollabResult<Vec<f32>>;
}

/// Realtime call-hierarchy lookups.
pub trait CallHierarchyProvider: Send + Sync {
    /// Callers and callees of `symbol` within `depth` hops, at most
    /// `max_nodes` of them, each with its hop distance.
    fn neighbors(
        &self,
        symbol: &Symbol,
        depth: u32,
        max_nodes: usize,
    ) -> CollabResult<Vec<(Symbol, u32)>>;
}

/// Run `f` on a helper thread and wait at most `timeout` for it.
///
/// On timeout the helper is left to finish on its own and its result is
/// discarded.
pub fn run_with_timeout<T, F>(timeout: Duration, f: F) -> CollabResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> CollabResult<T> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    std::thread::Builder::new()
        .name("strata-collaborator".into())
        .spawn(move || {
            // The receiver may be gone after a timeout.
            let _ = tx.send(f());
        })
        .map_err(|e| CollaboratorError::Unavailable(format!("cannot spawn worker: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(CollaboratorError::Timeout(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(CollaboratorError::Failed(
            "collaborator worker exited without a result".into(),
        )),
    }
}
