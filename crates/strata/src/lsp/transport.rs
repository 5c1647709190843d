//! JSON-RPC transport for LSP communication.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use lsp_types::{
    CallHierarchyIncomingCall, CallHierarchyIncomingCallsParams, CallHierarchyItem,
    CallHierarchyOutgoingCall, CallHierarchyOutgoingCallsParams, CallHierarchyPrepareParams,
    ClientCapabilities, DidOpenTextDocumentParams, InitializeParams, InitializeResult,
    PartialResultParams, Position, TextDocumentIdentifier, TextDocumentItem,
    TextDocumentPositionParams, Uri, WindowClientCapabilities, WorkDoneProgressParams,
    notification::{DidOpenTextDocument, Notification},
    request::{
        CallHierarchyIncomingCalls, CallHierarchyOutgoingCalls, CallHierarchyPrepare, Initialize,
        Shutdown,
    },
};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tracing::{debug, trace, warn};

use super::Result;
use super::error::LspError;
use super::provider::LspProvider;

/// Characters escaped in the path part of a `file://` URI.
const PATH_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// LSP client for communicating with language servers.
///
/// Provides a thin JSON-RPC transport layer over stdin/stdout.
pub struct LspClient {
    process: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    request_id: i64,
    language_id: &'static str,
    opened: HashSet<PathBuf>,
}

impl LspClient {
    /// Start an LSP server and perform the initialize handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The LSP server executable is not found
    /// - The server fails to start
    /// - The initialize handshake fails
    #[must_use = "LSP client holds a running process that should be shut down"]
    pub fn start(provider: &dyn LspProvider, workspace_path: &Path) -> Result<Self> {
        let command = provider.command();
        let args = provider.args();

        debug!(
            command = command,
            args = ?args,
            workspace = %workspace_path.display(),
            "Starting LSP server"
        );

        let mut process = Command::new(command)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    LspError::missing(command, provider.install_hint())
                } else {
                    LspError::startup(command, e)
                }
            })?;

        let (Some(stdin), Some(stdout)) = (process.stdin.take(), process.stdout.take()) else {
            let _ = process.kill();
            let _ = process.wait();
            return Err(LspError::startup(command, "stdio pipes unavailable"));
        };

        let mut client = Self {
            process,
            stdin,
            stdout: BufReader::new(stdout),
            request_id: 0,
            language_id: provider.language_id(),
            opened: HashSet::new(),
        };

        client
            .initialize(workspace_path, provider.initialize_options())
            .map_err(|e| LspError::startup(command, format!("initialize failed: {e}")))?;

        Ok(client)
    }

    #[allow(deprecated)] // root_uri is deprecated but still widely used
    fn initialize(&mut self, workspace_path: &Path, init_options: Option<Value>) -> Result<()> {
        let workspace_uri = path_to_uri(workspace_path)?;

        let capabilities = ClientCapabilities {
            window: Some(WindowClientCapabilities {
                work_done_progress: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        let params = InitializeParams {
            root_uri: Some(workspace_uri),
            capabilities,
            initialization_options: init_options,
            ..Default::default()
        };

        let _result: InitializeResult = self.send_request::<Initialize>(params)?;
        self.send_notification("initialized", &json!({}))?;

        debug!("LSP initialize handshake complete");
        Ok(())
    }

    /// Send an LSP request and wait for the response.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be written, the response cannot
    /// be read or decoded, the server reports an error, or the response ID
    /// does not match.
    pub fn send_request<R>(&mut self, params: R::Params) -> Result<R::Result>
    where
        R: lsp_types::request::Request,
        R::Params: Serialize,
        R::Result: DeserializeOwned,
    {
        self.request_id += 1;
        let id = self.request_id;

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": R::METHOD,
            "params": params,
        });

        trace!(method = R::METHOD, id = id, "Sending LSP request");

        self.write_message(&request)?;
        self.read_response(id)
    }

    fn send_notification(&mut self, method: &str, params: &Value) -> Result<()> {
        let notification = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });

        trace!(method = method, "Sending LSP notification");
        self.write_message(&notification)
    }

    fn write_message(&mut self, message: &Value) -> Result<()> {
        let body = serde_json::to_string(message)?;
        write!(self.stdin, "Content-Length: {}\r\n\r\n{body}", body.len())?;
        self.stdin.flush()?;
        Ok(())
    }

    /// Read until the response to `expected_id` arrives.
    ///
    /// Notifications are skipped; server requests get a null result.
    fn read_response<T: DeserializeOwned>(&mut self, expected_id: i64) -> Result<T> {
        loop {
            let message = read_message(&mut self.stdout)?;

            if let Some(method) = message.get("method").and_then(Value::as_str) {
                if let Some(request_id) = message.get("id") {
                    trace!(method = method, "Acknowledging server request");
                    let response = json!({
                        "jsonrpc": "2.0",
                        "id": request_id,
                        "result": null,
                    });
                    self.write_message(&response)?;
                } else {
                    trace!(method = method, "Skipping LSP notification");
                }
                continue;
            }

            return decode_response(&message, expected_id);
        }
    }

    /// Notify the server that a document is open, once per file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or communication fails.
    pub fn ensure_open(&mut self, file: &Path) -> Result<()> {
        if self.opened.contains(file) {
            return Ok(());
        }
        let content = std::fs::read_to_string(file)?;
        let params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: path_to_uri(file)?,
                language_id: self.language_id.to_string(),
                version: 1,
                text: content,
            },
        };
        let params_value = serde_json::to_value(params)?;
        self.send_notification(DidOpenTextDocument::METHOD, &params_value)?;
        self.opened.insert(file.to_path_buf());
        trace!(file = %file.display(), "Sent didOpen notification");
        Ok(())
    }

    /// Call-hierarchy items at a position (0-indexed line and column).
    ///
    /// # Errors
    ///
    /// Returns an error if the file path is invalid or communication fails.
    pub fn prepare_call_hierarchy(
        &mut self,
        file: &Path,
        line: u32,
        col: u32,
    ) -> Result<Vec<CallHierarchyItem>> {
        self.ensure_open(file)?;
        let params = CallHierarchyPrepareParams {
            text_document_position_params: TextDocumentPositionParams {
                text_document: TextDocumentIdentifier::new(path_to_uri(file)?),
                position: Position::new(line, col),
            },
            work_done_progress_params: WorkDoneProgressParams::default(),
        };
        Ok(self
            .send_request::<CallHierarchyPrepare>(params)?
            .unwrap_or_default())
    }

    /// Items that call `item`.
    ///
    /// # Errors
    ///
    /// Returns an error if communication fails.
    pub fn incoming_calls(&mut self, item: CallHierarchyItem) -> Result<Vec<CallHierarchyItem>> {
        let params = CallHierarchyIncomingCallsParams {
            item,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        let calls: Option<Vec<CallHierarchyIncomingCall>> =
            self.send_request::<CallHierarchyIncomingCalls>(params)?;
        Ok(calls
            .unwrap_or_default()
            .into_iter()
            .map(|c| c.from)
            .collect())
    }

    /// Items that `item` calls.
    ///
    /// # Errors
    ///
    /// Returns an error if communication fails.
    pub fn outgoing_calls(&mut self, item: CallHierarchyItem) -> Result<Vec<CallHierarchyItem>> {
        let params = CallHierarchyOutgoingCallsParams {
            item,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        let calls: Option<Vec<CallHierarchyOutgoingCall>> =
            self.send_request::<CallHierarchyOutgoingCalls>(params)?;
        Ok(calls.unwrap_or_default().into_iter().map(|c| c.to).collect())
    }

    /// Gracefully shut down the LSP server.
    ///
    /// Sends a shutdown request followed by an exit notification.
    ///
    /// # Errors
    ///
    /// Returns an error if communication with the server fails.
    pub fn shutdown(&mut self) -> Result<()> {
        debug!("Shutting down LSP server");

        let _: () = self.send_request::<Shutdown>(())?;
        self.send_notification("exit", &json!(null))?;

        match self.process.wait() {
            Ok(status) => {
                if !status.success() {
                    warn!(
                        exit_code = ?status.code(),
                        "LSP server exited with non-zero status"
                    );
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to wait for LSP server process exit");
            }
        }

        Ok(())
    }
}

impl Drop for LspClient {
    fn drop(&mut self) {
        if let Err(e) = self.send_notification("exit", &json!(null)) {
            trace!(error = %e, "Failed to send exit notification to LSP server during cleanup");
        }

        if let Err(e) = self.process.kill() {
            // InvalidInput means process already exited
            if e.kind() != std::io::ErrorKind::InvalidInput {
                warn!(error = %e, "Failed to kill LSP server process during cleanup");
            }
        }

        let _ = self.process.wait();
    }
}

/// Read one framed JSON-RPC message.
fn read_message(reader: &mut impl BufRead) -> Result<Value> {
    let content_length = read_content_length(reader)?;
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

fn read_content_length(reader: &mut impl BufRead) -> Result<usize> {
    let mut content_length = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(LspError::Closed);
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
        if let Some(value) = line.strip_prefix("Content-Length:") {
            content_length = Some(value.trim().parse().map_err(|_| {
                LspError::Protocol(format!("invalid Content-Length: {}", value.trim()))
            })?);
        }
    }
    content_length.ok_or_else(|| LspError::Protocol("missing Content-Length header".into()))
}

fn decode_response<T: DeserializeOwned>(message: &Value, expected_id: i64) -> Result<T> {
    if let Some(error) = message.get("error") {
        let code = error["code"].as_i64().unwrap_or(-1);
        let text = error["message"].as_str().unwrap_or("unknown error");
        return Err(LspError::Rpc {
            code,
            message: text.to_string(),
        });
    }

    let actual_id = message["id"]
        .as_i64()
        .ok_or_else(|| LspError::Protocol("response missing 'id' field".to_string()))?;
    if actual_id != expected_id {
        return Err(LspError::Protocol(format!(
            "response {actual_id} does not answer request {expected_id}"
        )));
    }

    let result = message
        .get("result")
        .cloned()
        .unwrap_or(Value::Null);
    Ok(serde_json::from_value(result)?)
}

/// Convert a filesystem path to an LSP URI.
///
/// On Unix this produces `file:///home/user/src/main.rs`; on Windows
/// `file:///C:/Users/src/main.rs`. Reserved characters are percent-encoded.
pub(crate) fn path_to_uri(path: &Path) -> Result<Uri> {
    let absolute_path = path.canonicalize().map_err(|e| {
        LspError::NotLocal(format!("cannot canonicalize path '{}': {e}", path.display()))
    })?;
    let path_str = absolute_path.to_str().ok_or_else(|| {
        LspError::NotLocal(format!("path contains invalid UTF-8: {}", path.display()))
    })?;
    let path_str = path_str.strip_prefix(r"\\?\").unwrap_or(path_str);

    #[cfg(windows)]
    let uri_string = format!(
        "file:///{}",
        utf8_percent_encode(&path_str.replace('\\', "/"), PATH_SET)
    );

    #[cfg(not(windows))]
    let uri_string = format!("file://{}", utf8_percent_encode(path_str, PATH_SET));

    uri_string
        .parse()
        .map_err(|e| LspError::NotLocal(format!("invalid URI '{uri_string}': {e}")))
}

/// Convert a `file://` URI back to a filesystem path.
pub(crate) fn uri_to_path(uri: &Uri) -> Result<PathBuf> {
    let text = uri.as_str();
    let encoded = text
        .strip_prefix("file://")
        .ok_or_else(|| LspError::NotLocal(format!("not a file URI: {text}")))?;
    let decoded = percent_decode_str(encoded)
        .decode_utf8()
        .map_err(|e| LspError::NotLocal(format!("URI is not UTF-8: {e}")))?;

    // file:///C:/x -> C:/x
    let bytes = decoded.as_bytes();
    if bytes.len() > 2 && bytes[0] == b'/' && bytes[1].is_ascii_alphabetic() && bytes[2] == b':' {
        return Ok(PathBuf::from(&decoded[1..]));
    }
    Ok(PathBuf::from(decoded.into_owned()))
}
