//! Stdio request loop.
//!
//! The reader keeps consuming frames while requests run: every request is handled in
//! its own task and all responses go through a single writer task, so frames never
//! interleave and responses may complete in any order.

use crate::protocol::{self, Incoming, ProtocolError, Response, SUPPORTED_PROTOCOL_VERSIONS};
use crate::tools::{self, ToolCall};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::{self, Future};
use std::sync::{Arc, Mutex};
use supervisor::{cancellation, CancelHandle, Cancellation, PackageManager, PipPackageManager, Supervisor};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const SERVER_NAME: &str = "pyexec-mcp";

const INSTRUCTIONS: &str = "Runs Python in real interpreter processes on this machine. \
Use python_eval for single expressions, python_execute for code blocks, \
python_run_script for files on disk, and python_install / python_list_packages \
to manage packages.";

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelledParams {
    request_id: Value,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Clone)]
pub struct McpServer {
    supervisor: Arc<Supervisor>,
    packages: Arc<dyn PackageManager>,
    in_flight: Arc<Mutex<HashMap<String, CancelHandle>>>,
}

impl McpServer {
    pub fn new(supervisor: Arc<Supervisor>, packages: Arc<dyn PackageManager>) -> Self {
        Self {
            supervisor,
            packages,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Server backed by `pip` in the supervisor's interpreter.
    pub fn from_supervisor(supervisor: Arc<Supervisor>) -> Self {
        let packages = Arc::new(PipPackageManager::new(supervisor.clone()));
        Self::new(supervisor, packages)
    }

    /// Serve frames from `reader` until it closes.
    ///
    /// On close, executions still in flight are cancelled and awaited so no child
    /// outlives the session.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.serve_until(reader, writer, future::pending()).await
    }

    /// Like [`serve`](Self::serve), but also stops reading once `shutdown` resolves.
    /// In-flight executions are then cancelled and answered exactly as on close.
    pub async fn serve_until<R, W, S>(&self, reader: R, writer: W, shutdown: S) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
        S: Future<Output = ()>,
    {
        let (tx, rx) = mpsc::unbounded_channel::<Response>();
        let writer_task = tokio::spawn(write_frames(writer, rx));
        let mut tasks = JoinSet::new();
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut failure = None;
        tokio::pin!(shutdown);

        loop {
            buf.clear();
            let read = tokio::select! {
                read = reader.read_until(b'\n', &mut buf) => match read {
                    Ok(read) => read,
                    Err(err) => {
                        warn!(error = %err, "Control channel read failed");
                        failure = Some(err);
                        break;
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            };
            if read == 0 {
                break;
            }
            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line.trim(),
                Err(err) => {
                    send(&tx, Response::failure(Value::Null, &ProtocolError::Parse(err.to_string())));
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }
            self.handle_frame(line, &tx, &mut tasks);

            // Reap finished handlers so the set does not grow with the session
            while tasks.try_join_next().is_some() {}
        }

        let pending = self.cancel_all();
        info!(pending, "Control channel closed");
        while tasks.join_next().await.is_some() {}

        drop(tx);
        let written = match writer_task.await {
            Ok(result) => result,
            Err(err) => Err(ProtocolError::Internal(format!("writer task: {}", err))),
        };
        match failure {
            Some(err) => Err(ProtocolError::Io(err)),
            None => written,
        }
    }

    fn handle_frame(&self, line: &str, tx: &mpsc::UnboundedSender<Response>, tasks: &mut JoinSet<()>) {
        let incoming = match protocol::parse_frame(line) {
            Ok(incoming) => incoming,
            Err(err) => {
                warn!(error = %err, "Rejected frame");
                send(tx, Response::failure(protocol::salvage_id(line), &err));
                return;
            }
        };

        match incoming {
            Incoming::Response => debug!("Ignoring response frame"),
            Incoming::Notification { method, params } => self.handle_notification(&method, params),
            Incoming::Request { id, method, params } => {
                // Registered before spawning so a cancellation that arrives right behind
                // the request is never missed
                let cancellation = if method == "tools/call" {
                    let (handle, cancellation) = cancellation();
                    self.register(&id, handle);
                    cancellation
                } else {
                    Cancellation::never()
                };

                let server = self.clone();
                let tx = tx.clone();
                tasks.spawn(async move {
                    // The handler runs in its own task so a panic still gets a reply
                    let handler = {
                        let server = server.clone();
                        let method = method.clone();
                        tokio::spawn(async move {
                            server.handle_request(&method, params, cancellation).await
                        })
                    };
                    let result = match handler.await {
                        Ok(result) => result,
                        Err(err) => {
                            error!(%method, error = %err, "Request handler failed");
                            Err(ProtocolError::Internal(format!("request handler failed: {}", err)))
                        }
                    };
                    if method == "tools/call" {
                        server.unregister(&id);
                    }
                    send(&tx, Response::from_result(id, result));
                });
            }
        }
    }

    async fn handle_request(
        &self,
        method: &str,
        params: Value,
        cancellation: Cancellation,
    ) -> Result<Value, ProtocolError> {
        match method {
            "initialize" => Ok(self.initialize(&params)),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": tools::tool_definitions() })),
            "tools/call" => self.call_tool(params, cancellation).await,
            other => Err(ProtocolError::MethodNotFound(other.to_string())),
        }
    }

    fn handle_notification(&self, method: &str, params: Value) {
        match method {
            "notifications/initialized" => info!("Client initialized"),
            "notifications/cancelled" => match serde_json::from_value::<CancelledParams>(params) {
                Ok(cancel) => {
                    let key = protocol::request_key(&cancel.request_id);
                    let handle = self.lock_in_flight().remove(&key);
                    match handle {
                        Some(handle) => {
                            info!(request_id = %key, reason = ?cancel.reason, "Cancelling request");
                            handle.cancel();
                        }
                        None => debug!(request_id = %key, "Cancellation for unknown or finished request"),
                    }
                }
                Err(err) => warn!(error = %err, "Malformed cancellation"),
            },
            other => debug!(method = other, "Ignoring notification"),
        }
    }

    fn initialize(&self, params: &Value) -> Value {
        let requested = params.get("protocolVersion").and_then(Value::as_str);
        let version = requested
            .filter(|v| SUPPORTED_PROTOCOL_VERSIONS.contains(v))
            .unwrap_or(SUPPORTED_PROTOCOL_VERSIONS[0]);
        info!(requested = ?requested, negotiated = version, "Initialize");

        json!({
            "protocolVersion": version,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") },
            "instructions": INSTRUCTIONS,
        })
    }

    async fn call_tool(&self, params: Value, cancellation: Cancellation) -> Result<Value, ProtocolError> {
        let params: CallParams =
            serde_json::from_value(params).map_err(|e| ProtocolError::InvalidParams(e.to_string()))?;
        let arguments = match params.arguments {
            None | Some(Value::Null) => json!({}),
            Some(arguments) => arguments,
        };
        let call = ToolCall::parse(&params.name, arguments)?;

        let execution_id = Uuid::new_v4();
        let span = info_span!("tool", tool = call.name(), %execution_id);
        let output = async {
            info!("Tool call started");
            let output =
                tools::run(call, &self.supervisor, self.packages.as_ref(), cancellation).await;
            info!(is_error = output.is_error, "Tool call finished");
            output
        }
        .instrument(span)
        .await;

        Ok(output.into_result())
    }

    fn register(&self, id: &Value, handle: CancelHandle) {
        self.lock_in_flight().insert(protocol::request_key(id), handle);
    }

    fn unregister(&self, id: &Value) {
        self.lock_in_flight().remove(&protocol::request_key(id));
    }

    fn cancel_all(&self) -> usize {
        let mut in_flight = self.lock_in_flight();
        let pending = in_flight.len();
        for (_, handle) in in_flight.drain() {
            handle.cancel();
        }
        pending
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancelHandle>> {
        // A panicking handler cannot leave the map half-updated
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn send(tx: &mpsc::UnboundedSender<Response>, response: Response) {
    if tx.send(response).is_err() {
        warn!("Writer closed, dropping response");
    }
}

async fn write_frames<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Response>) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let frame = serde_json::to_string(&response)
            .map_err(|e| ProtocolError::Internal(format!("encoding response: {}", e)))?;
        writer.write_all(frame.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}
