//! JSON-RPC connection to a long-lived query server process.
//!
//! One reader task owns the inbound half of the transport and routes every
//! message: responses go to the caller waiting on that request id,
//! `evaluation/queryCompleted` requests go to the completion registered under
//! their run id, and progress notifications go to the sink registered under
//! their progress id. Outbound frames are funnelled through a single writer task.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use super::cancel::{CancellationContext, ProgressSink};
use super::codec::JsonRpcCodec;
use super::error::ServerError;
use super::messages::*;
use super::{QueryServer, RunQuery};
use crate::config::QueryServerConfig;

/// Message used when `runQueries` returns without a matching completion.
pub const NO_RESULT_MESSAGE: &str = "No result from server";

type ResponseSender = oneshot::Sender<Result<Value, ServerError>>;

struct PendingRequest {
    method: &'static str,
    tx: ResponseSender,
}

#[derive(Default)]
struct Routes {
    pending: Mutex<HashMap<u64, PendingRequest>>,
    completions: Mutex<HashMap<u64, oneshot::Sender<EvaluationResult>>>,
    progress: Mutex<HashMap<u64, Arc<dyn ProgressSink>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Routes {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn dispatch(&self, message: Value, outgoing: &mpsc::UnboundedSender<Value>) {
        let method = message.get("method").and_then(Value::as_str);
        let id = message.get("id").filter(|id| !id.is_null()).cloned();
        match (method, id) {
            (Some(QUERY_COMPLETED), Some(id)) => {
                self.complete_query(message.get("params").cloned().unwrap_or(Value::Null));
                let _ = outgoing.send(json!({ "jsonrpc": "2.0", "id": id, "result": {} }));
            }
            (Some(PROGRESS_UPDATED), None) => {
                self.report_progress(message.get("params").cloned().unwrap_or(Value::Null));
            }
            (Some(method), Some(id)) => {
                debug!(method, "rejecting unsupported server request");
                let _ = outgoing.send(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32601, "message": format!("unsupported method {method}") },
                }));
            }
            (Some(method), None) => debug!(method, "ignoring server notification"),
            (None, Some(id)) => self.resolve_response(&id, &message),
            (None, None) => warn!("dropping message with neither method nor id"),
        }
    }

    fn resolve_response(&self, id: &Value, message: &Value) {
        let Some(id) = id.as_u64() else {
            warn!(%id, "response with non-numeric id");
            return;
        };
        let Some(pending) = lock(&self.pending).remove(&id) else {
            debug!(id, "response for unknown or abandoned request");
            return;
        };
        let outcome = match message.get("error") {
            Some(error) => {
                let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
                if code == REQUEST_CANCELLED_CODE {
                    Err(ServerError::Cancelled)
                } else {
                    Err(ServerError::Rpc {
                        method: pending.method.to_string(),
                        code,
                        message: error
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    })
                }
            }
            None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = pending.tx.send(outcome);
    }

    fn complete_query(&self, params: Value) {
        let result: EvaluationResult = match serde_json::from_value(params) {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "malformed queryCompleted payload");
                return;
            }
        };
        match lock(&self.completions).remove(&result.run_id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => warn!(run_id = result.run_id, "no evaluation registered for completed run"),
        }
    }

    fn report_progress(&self, params: Value) {
        let Ok(progress) = serde_json::from_value::<ProgressMessage>(params) else {
            return;
        };
        let sink = lock(&self.progress).get(&progress.id).cloned();
        if let Some(sink) = sink {
            sink.report(&progress);
        }
    }

    /// Fails every in-flight request and completion. Called when the
    /// transport ends or the server is replaced.
    fn fail_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let pending: Vec<_> = lock(&self.pending).drain().collect();
        for (_, request) in pending {
            let _ = request.tx.send(Err(ServerError::restarted(request.method)));
        }
        // Dropping the senders wakes every completion waiter.
        lock(&self.completions).clear();
        lock(&self.progress).clear();
    }
}

/// Removes routing entries for a request once its caller stops waiting.
struct RequestGuard<'a> {
    routes: &'a Routes,
    id: u64,
    progress_id: Option<u64>,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        lock(&self.routes.pending).remove(&self.id);
        if let Some(progress_id) = self.progress_id {
            lock(&self.routes.progress).remove(&progress_id);
        }
    }
}

/// Slot that receives the `queryCompleted` callback for one run.
pub struct CompletionRegistration {
    id: u64,
    rx: oneshot::Receiver<EvaluationResult>,
    routes: Arc<Routes>,
}

impl CompletionRegistration {
    /// Run id to send as the evaluate id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Result delivered so far, if any.
    pub fn try_take(&mut self) -> Option<EvaluationResult> {
        self.rx.try_recv().ok()
    }

    pub async fn wait(&mut self) -> Result<EvaluationResult, ServerError> {
        (&mut self.rx)
            .await
            .map_err(|_| ServerError::restarted(QUERY_COMPLETED))
    }
}

impl Drop for CompletionRegistration {
    fn drop(&mut self) {
        lock(&self.routes.completions).remove(&self.id);
    }
}

/// One live transport to a server.
pub struct RpcConnection {
    routes: Arc<Routes>,
    outgoing: mpsc::UnboundedSender<Value>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RpcConnection {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let routes = Arc::new(Routes::default());
        let (outgoing, mut rx) = mpsc::unbounded_channel::<Value>();

        let mut sink = FramedWrite::new(writer, JsonRpcCodec::default());
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(err) = sink.send(frame).await {
                    warn!(error = %err, "failed writing to query server");
                    break;
                }
            }
        });

        let mut frames = FramedRead::new(reader, JsonRpcCodec::default());
        let reader_routes = Arc::clone(&routes);
        let reader_outgoing = outgoing.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(message) => reader_routes.dispatch(message, &reader_outgoing),
                    Err(err) => {
                        warn!(error = %err, "closing query server connection after bad frame");
                        break;
                    }
                }
            }
            debug!("query server connection closed");
            reader_routes.fail_all();
        });

        Self {
            routes,
            outgoing,
            reader,
            writer,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.routes.closed.load(Ordering::SeqCst)
    }

    pub fn register_completion(&self) -> CompletionRegistration {
        let id = self.routes.next_id();
        let (tx, rx) = oneshot::channel();
        lock(&self.routes.completions).insert(id, tx);
        CompletionRegistration {
            id,
            rx,
            routes: Arc::clone(&self.routes),
        }
    }

    /// Sends `K` and waits for its response.
    ///
    /// If `cancel` fires first a `$/cancelRequest` is sent and the call waits
    /// at most `grace` for the server to acknowledge before resolving with
    /// [`ServerError::Cancelled`] (or [`ServerError::Timeout`] when it was the
    /// deadline rather than an explicit cancel).
    pub async fn request<K: RequestKind>(
        &self,
        params: K::Params,
        cancel: &CancellationContext,
        progress: Option<Arc<dyn ProgressSink>>,
        grace: Duration,
    ) -> Result<K::Response, ServerError> {
        if self.is_closed() {
            return Err(ServerError::restarted(K::METHOD));
        }
        let id = self.routes.next_id();
        let progress_id = self.routes.next_id();
        let (tx, mut rx) = oneshot::channel();
        lock(&self.routes.pending).insert(
            id,
            PendingRequest {
                method: K::METHOD,
                tx,
            },
        );
        let has_progress = progress.is_some();
        if let Some(sink) = progress {
            lock(&self.routes.progress).insert(progress_id, sink);
        }
        let _guard = RequestGuard {
            routes: &self.routes,
            id,
            progress_id: has_progress.then_some(progress_id),
        };

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": K::METHOD,
            "params": WithProgressId { body: params, progress_id },
        });
        self.outgoing
            .send(frame)
            .map_err(|_| ServerError::restarted(K::METHOD))?;

        let received = tokio::select! {
            received = &mut rx => Some(received),
            _ = cancel.cancelled() => None,
        };
        let value = match received {
            Some(Ok(outcome)) => outcome?,
            Some(Err(_)) => return Err(ServerError::restarted(K::METHOD)),
            None => {
                debug!(id, method = K::METHOD, "cancelling request");
                let _ = self.outgoing.send(json!({
                    "jsonrpc": "2.0",
                    "method": CANCEL_REQUEST,
                    "params": { "id": id },
                }));
                if tokio::time::timeout(grace, &mut rx).await.is_err() {
                    debug!(id, method = K::METHOD, "server did not acknowledge cancellation");
                }
                return Err(if cancel.token().is_cancelled() {
                    ServerError::Cancelled
                } else {
                    ServerError::Timeout {
                        method: K::METHOD.to_string(),
                    }
                });
            }
        };
        Ok(serde_json::from_value(value)?)
    }

    /// Tears the connection down and fails everything in flight.
    pub fn close(&self) {
        self.routes.fail_all();
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Client for a query server, optionally owning the server process.
pub struct QueryServerClient {
    config: QueryServerConfig,
    connection: RwLock<Option<Arc<RpcConnection>>>,
    child: tokio::sync::Mutex<Option<Child>>,
}

impl QueryServerClient {
    /// Launches the configured server executable and connects over its stdio.
    pub async fn spawn(config: QueryServerConfig) -> Result<Self, ServerError> {
        let client = Self {
            config,
            connection: RwLock::new(None),
            child: tokio::sync::Mutex::new(None),
        };
        client.start_process().await?;
        Ok(client)
    }

    /// Attaches to an already established transport.
    pub fn connect<R, W>(reader: R, writer: W, config: QueryServerConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            config,
            connection: RwLock::new(Some(Arc::new(RpcConnection::new(reader, writer)))),
            child: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &QueryServerConfig {
        &self.config
    }

    /// Swaps in a new transport. Everything in flight on the old one fails
    /// with [`ServerError::ServerRestarted`].
    pub fn replace_transport<R, W>(&self, reader: R, writer: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.install(Some(Arc::new(RpcConnection::new(reader, writer))));
    }

    /// Kills the server process (if owned) and launches a fresh one.
    pub async fn restart(&self) -> Result<(), ServerError> {
        info!("restarting query server");
        self.install(None);
        self.kill_process().await;
        self.start_process().await
    }

    pub async fn shutdown(&self) {
        self.install(None);
        self.kill_process().await;
    }

    /// Asks the server to drop cached evaluation results for `db`.
    pub async fn clear_cache(
        &self,
        db: Dataset,
        dry_run: bool,
        cancel: &CancellationContext,
    ) -> Result<ClearCacheResult, ServerError> {
        self.connection()?
            .request::<ClearCache>(ClearCacheParams { dry_run, db }, cancel, None, self.config.cancel_grace)
            .await
    }

    fn connection(&self) -> Result<Arc<RpcConnection>, ServerError> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ServerError::NotRunning)
    }

    fn install(&self, next: Option<Arc<RpcConnection>>) {
        let previous = {
            let mut slot = self.connection.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *slot, next)
        };
        if let Some(previous) = previous {
            previous.close();
        }
    }

    async fn start_process(&self) -> Result<(), ServerError> {
        let path = self
            .config
            .server_path
            .as_ref()
            .ok_or_else(|| ServerError::Spawn("no server executable configured".into()))?;
        let mut child = tokio::process::Command::new(path)
            .args(&self.config.server_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ServerError::Spawn(format!("{}: {e}", path.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ServerError::Spawn("server stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ServerError::Spawn("server stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "query_server", "{line}");
                }
            });
        }

        info!(server = %path.display(), pid = child.id(), "query server started");
        self.install(Some(Arc::new(RpcConnection::new(stdout, stdin))));
        *self.child.lock().await = Some(child);
        Ok(())
    }

    async fn kill_process(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(err) = child.kill().await {
                warn!(error = %err, "failed to stop query server");
            }
        }
    }
}

#[async_trait]
impl QueryServer for QueryServerClient {
    async fn compile_query(
        &self,
        params: CompileQueryParams,
        cancel: &CancellationContext,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<CheckQueryResult, ServerError> {
        self.connection()?
            .request::<CompileQuery>(params, cancel, progress, self.config.cancel_grace)
            .await
    }

    async fn compile_upgrade_sequence(
        &self,
        params: CompileUpgradeSequenceParams,
        cancel: &CancellationContext,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<CompileUpgradeSequenceResult, ServerError> {
        self.connection()?
            .request::<CompileUpgradeSequence>(params, cancel, progress, self.config.cancel_grace)
            .await
    }

    async fn run_query(
        &self,
        run: RunQuery,
        cancel: &CancellationContext,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<EvaluationResult, ServerError> {
        let connection = self.connection()?;
        let mut completion = connection.register_completion();
        let id = completion.id();
        let params = EvaluateQueriesParams {
            db: run.db,
            evaluate_id: id,
            queries: vec![QueryToRun {
                id,
                qlo: run.compiled_query,
                compiled_upgrade: run.compiled_upgrade,
                results_path: run.results_path,
                timeout_secs: self.config.timeout_secs,
                allow_unknown_templates: true,
            }],
            stop_on_error: false,
            use_sequence_hint: false,
        };
        connection
            .request::<RunQueries>(params, cancel, progress, self.config.cancel_grace)
            .await?;

        let mut result = completion.try_take().unwrap_or_else(|| {
            warn!(run_id = id, "runQueries returned without a completion");
            EvaluationResult::synthetic(QueryResultType::OtherError, NO_RESULT_MESSAGE)
        });
        if result.log_file_location.is_none() {
            result.log_file_location = run.log_path;
        }
        Ok(result)
    }

    async fn start_log(&self, params: LogParams) -> Result<LogResult, ServerError> {
        self.connection()?
            .request::<StartLog>(params, &CancellationContext::new(), None, self.config.cancel_grace)
            .await
    }

    async fn end_log(&self, params: LogParams) -> Result<LogResult, ServerError> {
        self.connection()?
            .request::<EndLog>(params, &CancellationContext::new(), None, self.config.cancel_grace)
            .await
    }

    fn supports_per_query_eval_log(&self) -> bool {
        self.config.per_query_eval_log
    }

    fn query_timeout_secs(&self) -> u64 {
        self.config.timeout_secs
    }
}
