//! One live app-server connection: transport, handshake and message pump.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, Command};

use super::extract::{TURN_ID_PATHS, first_non_blank};
use super::protocol::{
    self, Incoming, METHOD_INITIALIZE, METHOD_INITIALIZED, normalize_method, rpc_error,
};
use super::server_requests::{ServerReply, ServerRequestPolicy};
use super::turn::TurnAggregator;
use crate::config::AppServerConfig;
use crate::types::TurnResult;

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Byte streams to an app-server plus the process that owns them, if any.
pub struct Transport {
    writer: Writer,
    reader: Lines<BufReader<Reader>>,
    child: Option<Child>,
}

impl Transport {
    pub fn new(
        writer: impl AsyncWrite + Send + Unpin + 'static,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        let reader: Reader = Box::new(reader);
        Self {
            writer: Box::new(writer),
            reader: BufReader::new(reader).lines(),
            child: None,
        }
    }

    #[must_use]
    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }
}

/// Produces fresh transports. The client calls this once per session.
pub trait Launch: Send + Sync {
    /// # Errors
    /// Returns an error if the app-server cannot be started.
    fn launch(&self) -> Result<Transport>;
}

/// Spawns the configured app-server executable with piped stdio.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn from_config(config: &AppServerConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            cwd: config.cwd.clone(),
        }
    }
}

impl Launch for ProcessLauncher {
    fn launch(&self) -> Result<Transport> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn app-server '{}'", self.command))?;
        let stdin = child.stdin.take().context("No stdin on app-server")?;
        let stdout = child.stdout.take().context("No stdout on app-server")?;
        tracing::info!(command = %self.command, pid = child.id(), "spawned app-server");
        Ok(Transport::new(stdin, stdout).with_child(child))
    }
}

/// Identity reported in the `initialize` handshake.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub name: String,
    pub title: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "tether".to_string(),
            title: "tether".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Protocol event surfaced to the caller after server requests have been
/// answered inline.
enum Event {
    Response {
        id: u64,
        outcome: Result<Value, Value>,
    },
    Notification {
        method: String,
        params: Value,
    },
}

/// An initialized app-server session.
pub struct RpcSession {
    transport: Transport,
    next_id: u64,
}

impl RpcSession {
    /// Performs the handshake: `initialize` request, matching response,
    /// then the `initialized` notification.
    ///
    /// # Errors
    /// Returns an error if the transport fails or the server rejects
    /// `initialize`.
    pub async fn open(
        transport: Transport,
        client_info: &ClientInfo,
        policy: &ServerRequestPolicy,
    ) -> Result<Self> {
        let mut session = Self {
            transport,
            next_id: 1,
        };
        let params = json!({
            "clientInfo": {
                "name": client_info.name,
                "title": client_info.title,
                "version": client_info.version,
            }
        });
        session
            .call(METHOD_INITIALIZE, params, policy)
            .await
            .context("app-server handshake failed")?;
        session
            .write(&protocol::notification(METHOD_INITIALIZED, None))
            .await?;
        Ok(session)
    }

    /// Sends a request and waits for its response, answering server requests
    /// and skipping notifications in the meantime.
    ///
    /// # Errors
    /// Returns an error on transport failure or an RPC error response.
    pub async fn call(
        &mut self,
        method: &str,
        params: Value,
        policy: &ServerRequestPolicy,
    ) -> Result<Value> {
        let id = self.send_request(method, params).await?;
        loop {
            match self.next_event(policy).await? {
                Event::Response { id: got, outcome } if got == id => {
                    return outcome.map_err(|error| rpc_error(method, &error).into());
                }
                Event::Response { id: got, .. } => {
                    tracing::debug!(id = got, "ignoring response to stale request");
                }
                Event::Notification { method, .. } => {
                    tracing::trace!(%method, "notification while awaiting response");
                }
            }
        }
    }

    /// Sends a turn request (start or steer) and drains notifications until
    /// the turn completes.
    ///
    /// # Errors
    /// Returns an error on transport failure or an RPC error response.
    pub async fn run_turn(
        &mut self,
        method: &str,
        params: Value,
        thread_id: &str,
        policy: &ServerRequestPolicy,
    ) -> Result<TurnResult> {
        let id = self.send_request(method, params).await?;
        let mut aggregator = TurnAggregator::new(thread_id);
        let mut answered = false;

        while !(answered && aggregator.is_completed()) {
            match self.next_event(policy).await? {
                Event::Response { id: got, outcome } if got == id => {
                    let result = outcome.map_err(|error| rpc_error(method, &error))?;
                    aggregator.accept_response(first_non_blank(&result, TURN_ID_PATHS));
                    answered = true;
                }
                Event::Response { id: got, .. } => {
                    tracing::debug!(id = got, "ignoring response to stale request");
                }
                Event::Notification {
                    method: name,
                    params,
                } => {
                    if normalize_method(&name) == "turn_completed" {
                        aggregator.offer_completion(params);
                    } else {
                        aggregator.apply(&name, &params);
                    }
                }
            }
        }

        Ok(aggregator.finish())
    }

    /// Closes stdin, kills the process and waits for it. Secondary errors
    /// are logged and ignored.
    pub async fn shutdown(self) {
        let Transport {
            mut writer,
            reader,
            child,
        } = self.transport;
        if let Err(err) = writer.shutdown().await {
            tracing::debug!(error = %err, "closing app-server stdin failed");
        }
        drop(writer);
        drop(reader);
        if let Some(mut child) = child {
            if let Err(err) = child.start_kill() {
                tracing::debug!(error = %err, "killing app-server failed");
            }
            match child.wait().await {
                Ok(status) => tracing::info!(%status, "app-server exited"),
                Err(err) => tracing::debug!(error = %err, "waiting for app-server failed"),
            }
        }
    }

    async fn send_request(&mut self, method: &str, params: Value) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;
        tracing::debug!(id, method, "-> request");
        self.write(&protocol::request(id, method, params)).await?;
        Ok(id)
    }

    async fn write(&mut self, message: &Value) -> Result<()> {
        let mut line = serde_json::to_string(message).context("Failed to encode message")?;
        line.push('\n');
        let writer = &mut self.transport.writer;
        writer
            .write_all(line.as_bytes())
            .await
            .context("Failed to write to app-server")?;
        writer
            .flush()
            .await
            .context("Failed to flush app-server stdin")?;
        Ok(())
    }

    /// Reads until the next response or notification, answering any server
    /// requests on the way.
    async fn next_event(&mut self, policy: &ServerRequestPolicy) -> Result<Event> {
        loop {
            let line = self
                .transport
                .reader
                .next_line()
                .await
                .context("Failed to read from app-server")?
                .ok_or_else(|| anyhow!("app-server closed its output"))?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(trimmed) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping non-JSON line from app-server");
                    continue;
                }
            };
            let Some(message) = Incoming::classify(value) else {
                tracing::warn!("skipping unrecognized message from app-server");
                continue;
            };

            match message {
                Incoming::Response { id, outcome } => return Ok(Event::Response { id, outcome }),
                Incoming::Notification { method, params } => {
                    return Ok(Event::Notification { method, params });
                }
                Incoming::Request { id, method, params } => {
                    self.answer_server_request(id, &method, &params, policy)
                        .await?;
                }
            }
        }
    }

    async fn answer_server_request(
        &mut self,
        id: Value,
        method: &str,
        params: &Value,
        policy: &ServerRequestPolicy,
    ) -> Result<()> {
        let normalized = normalize_method(method);
        let reply = match policy.reply(&normalized, params) {
            ServerReply::Result(result) => {
                tracing::info!(method, "answered server request");
                protocol::response(id, result)
            }
            ServerReply::Error { code, message } => {
                tracing::warn!(method, "rejected unsupported server request");
                protocol::error_response(id, code, &message)
            }
        };
        self.write(&reply).await
    }
}

/// Fails unless `thread_id` is usable as a request parameter.
pub(crate) fn require_thread_id(thread_id: &str) -> Result<()> {
    if thread_id.trim().is_empty() {
        bail!("thread id must not be empty");
    }
    Ok(())
}
