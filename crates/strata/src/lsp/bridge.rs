//! Keep-alive worker that owns one language server.
//!
//! The server is started on the first request and reused for every request
//! after that. Callers talk to the worker over a channel; one request is in
//! flight at a time and each waits at most the configured timeout. Shutdown
//! answers anything still queued, stops the server, and joins the thread.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use lsp_types::CallHierarchyItem;

use super::error::LspError;
use super::provider::{AnyProvider, LspProvider};
use super::transport::{LspClient, uri_to_path};
use crate::collaborators::{CallHierarchyProvider, CollabResult};
use crate::error::CollaboratorError;
use crate::types::{Symbol, SymbolKind};

/// Something that can answer call-hierarchy questions on the worker thread.
pub trait HierarchyBackend: Send {
    /// Callers and callees of `symbol` within `depth` hops, at most `max_nodes`.
    fn neighbors(
        &mut self,
        symbol: &Symbol,
        depth: u32,
        max_nodes: usize,
    ) -> super::Result<Vec<(Symbol, u32)>>;

    /// Stop the backing process.
    fn shutdown(&mut self) -> super::Result<()>;
}

/// Creates the backend on the worker's first request.
pub type BackendFactory =
    Box<dyn FnOnce() -> super::Result<Box<dyn HierarchyBackend>> + Send + 'static>;

type Reply = Sender<CollabResult<Vec<(Symbol, u32)>>>;

enum Request {
    Neighbors {
        symbol: Symbol,
        depth: u32,
        max_nodes: usize,
        reply: Reply,
    },
    Shutdown,
}

/// Handle to the keep-alive worker.
pub struct LspBridge {
    sender: Mutex<Option<Sender<Request>>>,
    in_flight: Mutex<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
    timeout: Duration,
}

impl LspBridge {
    /// Bridge to a language server for `workspace`, started lazily.
    pub fn new(provider: AnyProvider, workspace: PathBuf, timeout: Duration) -> CollabResult<Self> {
        Self::with_backend(
            Box::new(move || {
                let client = LspClient::start(&provider, &workspace)?;
                Ok(Box::new(LspHierarchy::new(client)) as Box<dyn HierarchyBackend>)
            }),
            timeout,
        )
    }

    /// Bridge over a custom backend.
    pub fn with_backend(factory: BackendFactory, timeout: Duration) -> CollabResult<Self> {
        let (tx, rx) = mpsc::channel();
        let worker = std::thread::Builder::new()
            .name("strata-lsp-bridge".into())
            .spawn(move || worker_loop(&rx, factory))
            .map_err(|e| CollaboratorError::Unavailable(format!("cannot spawn LSP worker: {e}")))?;

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            in_flight: Mutex::new(()),
            worker: Mutex::new(Some(worker)),
            timeout,
        })
    }

    /// Per-request time budget.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> CollabResult<MutexGuard<'a, T>> {
        mutex
            .lock()
            .map_err(|e| CollaboratorError::Failed(format!("LSP bridge mutex poisoned: {e}")))
    }

    /// Answer queued requests, stop the server, and join the worker.
    ///
    /// Calling this more than once is harmless.
    pub fn shutdown(&self) -> CollabResult<()> {
        let sender = Self::lock(&self.sender)?.take();
        if let Some(sender) = sender {
            // The worker may already be gone.
            let _ = sender.send(Request::Shutdown);
        }
        let worker = Self::lock(&self.worker)?.take();
        if let Some(worker) = worker {
            worker
                .join()
                .map_err(|_| CollaboratorError::Failed("LSP worker panicked".into()))?;
        }
        Ok(())
    }
}

impl CallHierarchyProvider for LspBridge {
    fn neighbors(
        &self,
        symbol: &Symbol,
        depth: u32,
        max_nodes: usize,
    ) -> CollabResult<Vec<(Symbol, u32)>> {
        let _serial = Self::lock(&self.in_flight)?;
        let (reply, response) = mpsc::channel();
        {
            let sender = Self::lock(&self.sender)?;
            let sender = sender
                .as_ref()
                .ok_or_else(|| CollaboratorError::from(LspError::BridgeStopped))?;
            sender
                .send(Request::Neighbors {
                    symbol: symbol.clone(),
                    depth,
                    max_nodes,
                    reply,
                })
                .map_err(|_| CollaboratorError::from(LspError::BridgeStopped))?;
        }
        match response.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                tracing::debug!(symbol = %symbol.name, "LSP request timed out");
                Err(CollaboratorError::Timeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(LspError::BridgeStopped.into()),
        }
    }
}

impl Drop for LspBridge {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "LSP bridge did not shut down cleanly");
        }
    }
}

impl std::fmt::Debug for LspBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspBridge")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn worker_loop(rx: &Receiver<Request>, factory: BackendFactory) {
    let mut factory = Some(factory);
    let mut backend: Option<Box<dyn HierarchyBackend>> = None;
    let mut start_error: Option<String> = None;

    while let Ok(request) = rx.recv() {
        let Request::Neighbors {
            symbol,
            depth,
            max_nodes,
            reply,
        } = request
        else {
            break;
        };

        if backend.is_none() && start_error.is_none() {
            if let Some(make) = factory.take() {
                match make() {
                    Ok(b) => {
                        tracing::info!("Language server started");
                        backend = Some(b);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Language server unavailable");
                        start_error = Some(e.to_string());
                    }
                }
            }
        }

        let result = match (&mut backend, &start_error) {
            (Some(b), _) => b.neighbors(&symbol, depth, max_nodes).map_err(Into::into),
            (None, Some(message)) => Err(CollaboratorError::Unavailable(message.clone())),
            (None, None) => Err(LspError::BridgeStopped.into()),
        };
        // The caller may have timed out and dropped its receiver.
        let _ = reply.send(result);
    }

    for pending in rx.try_iter() {
        if let Request::Neighbors { reply, .. } = pending {
            let _ = reply.send(Err(LspError::BridgeStopped.into()));
        }
    }
    if let Some(mut b) = backend {
        if let Err(e) = b.shutdown() {
            tracing::warn!(error = %e, "Language server shutdown failed");
        }
    }
    tracing::debug!("LSP bridge worker stopped");
}

/// Call-hierarchy expansion against a live [`LspClient`].
pub struct LspHierarchy {
    client: LspClient,
}

impl LspHierarchy {
    /// Backend over a started client.
    #[must_use]
    pub fn new(client: LspClient) -> Self {
        Self { client }
    }

    fn root_items(&mut self, symbol: &Symbol) -> super::Result<Vec<CallHierarchyItem>> {
        let path = symbol
            .file_path
            .as_deref()
            .ok_or_else(|| LspError::NotLocal(format!("{} has no file path", symbol.name)))?;
        let line = symbol.start_line.saturating_sub(1);
        let col = name_column(path, line, &symbol.name).unwrap_or(0);
        self.client.prepare_call_hierarchy(path, line, col)
    }
}

impl HierarchyBackend for LspHierarchy {
    fn neighbors(
        &mut self,
        symbol: &Symbol,
        depth: u32,
        max_nodes: usize,
    ) -> super::Result<Vec<(Symbol, u32)>> {
        let mut out = Vec::new();
        if depth == 0 || max_nodes == 0 {
            return Ok(out);
        }

        let mut seen: HashSet<(PathBuf, String, u32)> = HashSet::new();
        let mut queue: VecDeque<(CallHierarchyItem, u32)> = VecDeque::new();
        for item in self.root_items(symbol)? {
            if let Some(s) = item_to_symbol(&item) {
                seen.insert(symbol_key(&s));
            }
            queue.push_back((item, 0));
        }

        while let Some((item, hop)) = queue.pop_front() {
            if hop >= depth {
                continue;
            }
            let mut related = self.client.incoming_calls(item.clone())?;
            related.extend(self.client.outgoing_calls(item)?);
            for next in related {
                let Some(found) = item_to_symbol(&next) else {
                    continue;
                };
                if !seen.insert(symbol_key(&found)) {
                    continue;
                }
                out.push((found, hop + 1));
                if out.len() >= max_nodes {
                    return Ok(out);
                }
                queue.push_back((next, hop + 1));
            }
        }
        Ok(out)
    }

    fn shutdown(&mut self) -> super::Result<()> {
        self.client.shutdown()
    }
}

fn symbol_key(symbol: &Symbol) -> (PathBuf, String, u32) {
    (
        symbol.file_path.clone().unwrap_or_default(),
        symbol.name.clone(),
        symbol.start_line,
    )
}

/// Column of `name` on a 0-indexed line, in UTF-16 code units.
fn name_column(path: &Path, line: u32, name: &str) -> Option<u32> {
    let content = std::fs::read_to_string(path).ok()?;
    let text = content.lines().nth(usize::try_from(line).ok()?)?;
    let byte = text.find(name)?;
    u32::try_from(text[..byte].encode_utf16().count()).ok()
}

fn map_kind(kind: lsp_types::SymbolKind) -> SymbolKind {
    use lsp_types::SymbolKind as K;
    if kind == K::METHOD || kind == K::CONSTRUCTOR {
        SymbolKind::Method
    } else if kind == K::CLASS {
        SymbolKind::Class
    } else if kind == K::STRUCT {
        SymbolKind::Struct
    } else if kind == K::ENUM {
        SymbolKind::Enum
    } else if kind == K::INTERFACE {
        SymbolKind::Interface
    } else if kind == K::CONSTANT {
        SymbolKind::Const
    } else if kind == K::VARIABLE || kind == K::FIELD || kind == K::PROPERTY {
        SymbolKind::Variable
    } else if kind == K::MODULE || kind == K::NAMESPACE || kind == K::PACKAGE {
        SymbolKind::Module
    } else {
        SymbolKind::Function
    }
}

fn item_to_symbol(item: &CallHierarchyItem) -> Option<Symbol> {
    let path = uri_to_path(&item.uri).ok()?;
    Symbol::new(
        item.name.clone(),
        map_kind(item.kind),
        item.range.start.line + 1,
        item.range.end.line + 1,
    )
    .map(|s| s.with_file_path(path))
}
