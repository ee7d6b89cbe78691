//! Turn session client for the app-server subprocess.
//!
//! Speaks newline-delimited JSON-RPC 2.0 to a single long-lived process and
//! exposes thread start, turn start and turn steer as independently
//! retryable operations. All use of the process is serialized behind one
//! mutex.

pub mod extract;
pub mod protocol;
pub mod server_requests;
pub mod session;
pub mod turn;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;

use self::extract::{THREAD_ID_PATHS, first_non_blank};
use self::protocol::{METHOD_THREAD_START, METHOD_TURN_START, METHOD_TURN_STEER};
pub use self::server_requests::ServerRequestPolicy;
use self::session::require_thread_id;
pub use self::session::{ClientInfo, Launch, ProcessLauncher, RpcSession, Transport};
use crate::config::{AppServerConfig, Config};
use crate::types::{TurnInput, TurnResult};

/// Physical attempts per operation: one, plus one retry on a fresh session.
const MAX_ATTEMPTS: usize = 2;

/// Boxed future returned by [`TurnClient`] operations.
pub type TurnFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// The three turn operations the coordinator builds on.
pub trait TurnClient: Send + Sync {
    /// Creates a thread and returns its id.
    fn start_thread<'a>(&'a self, input: &'a TurnInput) -> TurnFuture<'a, String>;

    /// Starts a new turn in `thread_id` and waits for it to complete.
    fn start_turn<'a>(&'a self, thread_id: &'a str, prompt: &'a str) -> TurnFuture<'a, TurnResult>;

    /// Continues the turn the caller believes is current. The server rejects
    /// this when `expected_turn_id` is stale.
    fn steer_turn<'a>(
        &'a self,
        thread_id: &'a str,
        expected_turn_id: &'a str,
        prompt: &'a str,
    ) -> TurnFuture<'a, TurnResult>;
}

impl<C: TurnClient + ?Sized> TurnClient for Arc<C> {
    fn start_thread<'a>(&'a self, input: &'a TurnInput) -> TurnFuture<'a, String> {
        (**self).start_thread(input)
    }

    fn start_turn<'a>(&'a self, thread_id: &'a str, prompt: &'a str) -> TurnFuture<'a, TurnResult> {
        (**self).start_turn(thread_id, prompt)
    }

    fn steer_turn<'a>(
        &'a self,
        thread_id: &'a str,
        expected_turn_id: &'a str,
        prompt: &'a str,
    ) -> TurnFuture<'a, TurnResult> {
        (**self).steer_turn(thread_id, expected_turn_id, prompt)
    }
}

/// Thread parameters fixed for the lifetime of the client.
#[derive(Debug, Clone, Default)]
pub struct ThreadDefaults {
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub approval_policy: Option<String>,
    pub sandbox: Option<String>,
    pub cwd: Option<String>,
    pub tool_endpoint: Option<String>,
    pub tool_server_name: String,
}

impl ThreadDefaults {
    pub fn from_config(config: &AppServerConfig) -> Self {
        let non_blank = |value: &str| {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        };
        Self {
            model: config.model.as_deref().and_then(non_blank),
            reasoning_effort: Some(config.reasoning_effort.as_wire().to_string()),
            approval_policy: non_blank(&config.approval_policy),
            sandbox: non_blank(&config.sandbox),
            cwd: config
                .cwd
                .as_ref()
                .map(|cwd| cwd.to_string_lossy().to_string()),
            tool_endpoint: config.tool_endpoint.as_deref().and_then(non_blank),
            tool_server_name: config.tool_server_name.clone(),
        }
    }

    /// Builds `thread/start` params for `input`.
    fn thread_start_params(&self, input: &TurnInput) -> Value {
        let mut params = Map::new();
        let mut put = |key: &str, value: Option<&str>| {
            if let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) {
                params.insert(key.to_string(), json!(value));
            }
        };
        put("baseInstructions", Some(input.base_instructions.as_str()));
        put(
            "developerInstructions",
            Some(input.developer_instructions.as_str()),
        );
        put("model", self.model.as_deref());
        put("approvalPolicy", self.approval_policy.as_deref());
        put("sandbox", self.sandbox.as_deref());
        put("cwd", self.cwd.as_deref());

        let mut overrides = Map::new();
        if let Some(effort) = &self.reasoning_effort {
            overrides.insert("model_reasoning_effort".to_string(), json!(effort));
        }
        if let Some(endpoint) = &self.tool_endpoint {
            let name = if self.tool_server_name.trim().is_empty() {
                "tether"
            } else {
                self.tool_server_name.trim()
            };
            overrides.insert(
                "mcp_servers".to_string(),
                json!({ name: { "url": endpoint } }),
            );
        }
        if !overrides.is_empty() {
            params.insert("config".to_string(), Value::Object(overrides));
        }
        Value::Object(params)
    }
}

/// Single-slot holder for the live session.
///
/// `poisoned` is set while an attempt is in flight. If the attempt's future
/// is dropped mid-read the flag stays set and the half-read session is torn
/// down before the next use.
#[derive(Default)]
struct SessionSlot {
    session: Option<RpcSession>,
    poisoned: bool,
}

impl SessionSlot {
    async fn teardown(&mut self) {
        self.poisoned = false;
        if let Some(session) = self.session.take() {
            tracing::info!("tearing down app-server session");
            session.shutdown().await;
        }
    }
}

enum Operation<'a> {
    StartThread(&'a TurnInput),
    StartTurn {
        thread_id: &'a str,
        prompt: &'a str,
    },
    SteerTurn {
        thread_id: &'a str,
        expected_turn_id: &'a str,
        prompt: &'a str,
    },
}

impl Operation<'_> {
    fn name(&self) -> &'static str {
        match self {
            Operation::StartThread(_) => "start thread",
            Operation::StartTurn { .. } => "start turn",
            Operation::SteerTurn { .. } => "steer turn",
        }
    }
}

enum Outcome {
    Thread(String),
    Turn(TurnResult),
}

/// [`TurnClient`] backed by a real (or scripted) app-server.
pub struct AppServerClient {
    launcher: Arc<dyn Launch>,
    client_info: ClientInfo,
    defaults: ThreadDefaults,
    policy: ServerRequestPolicy,
    attempt_timeout: Option<Duration>,
    slot: Mutex<SessionSlot>,
}

impl AppServerClient {
    pub fn new(
        launcher: Arc<dyn Launch>,
        defaults: ThreadDefaults,
        policy: ServerRequestPolicy,
        attempt_timeout: Option<Duration>,
    ) -> Self {
        Self {
            launcher,
            client_info: ClientInfo::default(),
            defaults,
            policy,
            attempt_timeout,
            slot: Mutex::new(SessionSlot::default()),
        }
    }

    /// Client spawning the configured executable.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(ProcessLauncher::from_config(&config.app_server)),
            ThreadDefaults::from_config(&config.app_server),
            ServerRequestPolicy::from_config(&config.policy),
            config.app_server.turn_timeout(),
        )
    }

    #[must_use]
    pub fn with_client_info(mut self, client_info: ClientInfo) -> Self {
        self.client_info = client_info;
        self
    }

    /// Tears down the live session, if any.
    pub async fn shutdown(&self) {
        self.slot.lock().await.teardown().await;
    }

    async fn execute(&self, op: Operation<'_>) -> Result<Outcome> {
        let mut slot = self.slot.lock().await;
        let mut last_error = None;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.attempt(&mut slot, &op).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    tracing::warn!(
                        operation = op.name(),
                        attempt,
                        error = %format!("{err:#}"),
                        "app-server operation failed"
                    );
                    slot.teardown().await;
                    last_error = Some(err);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| anyhow!("no attempt was made"));
        Err(err.context(format!("{} failed after {MAX_ATTEMPTS} attempts", op.name())))
    }

    async fn attempt(&self, slot: &mut SessionSlot, op: &Operation<'_>) -> Result<Outcome> {
        if slot.poisoned {
            tracing::warn!("previous call was interrupted; discarding session");
            slot.teardown().await;
        }
        if slot.session.is_none() {
            let transport = self.launcher.launch()?;
            let session = RpcSession::open(transport, &self.client_info, &self.policy).await?;
            slot.session = Some(session);
        }

        slot.poisoned = true;
        let session = slot
            .session
            .as_mut()
            .context("app-server session missing after launch")?;
        let outcome = match self.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, self.run(session, op))
                .await
                .with_context(|| format!("{} timed out after {}s", op.name(), limit.as_secs()))?,
            None => self.run(session, op).await,
        }?;
        slot.poisoned = false;
        Ok(outcome)
    }

    async fn run(&self, session: &mut RpcSession, op: &Operation<'_>) -> Result<Outcome> {
        match *op {
            Operation::StartThread(input) => {
                let params = self.defaults.thread_start_params(input);
                let result = session
                    .call(METHOD_THREAD_START, params, &self.policy)
                    .await?;
                let thread_id = first_non_blank(&result, THREAD_ID_PATHS)
                    .ok_or_else(|| anyhow!("thread/start response carried no thread id"))?;
                tracing::info!(%thread_id, "started thread");
                Ok(Outcome::Thread(thread_id))
            }
            Operation::StartTurn { thread_id, prompt } => {
                let params = json!({
                    "threadId": thread_id,
                    "input": [text_input(prompt)],
                });
                let result = session
                    .run_turn(METHOD_TURN_START, params, thread_id, &self.policy)
                    .await?;
                tracing::info!(
                    %thread_id,
                    turn_id = %result.turn_id,
                    status = %result.status,
                    "turn completed"
                );
                Ok(Outcome::Turn(result))
            }
            Operation::SteerTurn {
                thread_id,
                expected_turn_id,
                prompt,
            } => {
                let params = json!({
                    "threadId": thread_id,
                    "expectedTurnId": expected_turn_id,
                    "input": [text_input(prompt)],
                });
                let result = session
                    .run_turn(METHOD_TURN_STEER, params, thread_id, &self.policy)
                    .await?;
                tracing::info!(
                    %thread_id,
                    turn_id = %result.turn_id,
                    status = %result.status,
                    "steered turn completed"
                );
                Ok(Outcome::Turn(result))
            }
        }
    }
}

fn text_input(prompt: &str) -> Value {
    json!({ "type": "text", "text": prompt })
}

impl TurnClient for AppServerClient {
    fn start_thread<'a>(&'a self, input: &'a TurnInput) -> TurnFuture<'a, String> {
        Box::pin(async move {
            match self.execute(Operation::StartThread(input)).await? {
                Outcome::Thread(thread_id) => Ok(thread_id),
                Outcome::Turn(_) => Err(anyhow!("start thread produced a turn result")),
            }
        })
    }

    fn start_turn<'a>(&'a self, thread_id: &'a str, prompt: &'a str) -> TurnFuture<'a, TurnResult> {
        Box::pin(async move {
            require_thread_id(thread_id)?;
            match self
                .execute(Operation::StartTurn { thread_id, prompt })
                .await?
            {
                Outcome::Turn(result) => Ok(result),
                Outcome::Thread(_) => Err(anyhow!("start turn produced a thread id")),
            }
        })
    }

    fn steer_turn<'a>(
        &'a self,
        thread_id: &'a str,
        expected_turn_id: &'a str,
        prompt: &'a str,
    ) -> TurnFuture<'a, TurnResult> {
        Box::pin(async move {
            require_thread_id(thread_id)?;
            anyhow::ensure!(
                !expected_turn_id.trim().is_empty(),
                "steer requires an expected turn id"
            );
            match self
                .execute(Operation::SteerTurn {
                    thread_id,
                    expected_turn_id,
                    prompt,
                })
                .await?
            {
                Outcome::Turn(result) => Ok(result),
                Outcome::Thread(_) => Err(anyhow!("steer turn produced a thread id")),
            }
        })
    }
}
