//! Folding turn notifications into a `TurnResult`.

use serde_json::Value;

use super::extract::{
    NOTIFICATION_THREAD_ID_PATHS, NOTIFICATION_TURN_ID_PATHS, TURN_ERROR_PATHS,
    TURN_STATUS_PATHS, TURN_TEXT_PATHS, first_non_blank, first_present,
};
use super::protocol::normalize_method;
use crate::types::{ToolCallRecord, ToolCallStatus, TurnResult};

const AGENT_MESSAGE_DELTA: &str = "item_agent_message_delta";
const ITEM_COMPLETED: &str = "item_completed";
const TURN_STARTED: &str = "turn_started";
const TURN_COMPLETED: &str = "turn_completed";
const ERROR: &str = "error";

/// Accumulates notifications for one turn.
///
/// Text priority: a completed agent-message item overrides everything,
/// then concatenated deltas, then text on the turn-completed event.
#[derive(Debug, Default)]
pub struct TurnAggregator {
    thread_id: String,
    turn_id: String,
    status: String,
    error: Option<String>,
    item_text: Option<String>,
    delta_text: String,
    terminal_text: Option<String>,
    tool_calls: Vec<ToolCallRecord>,
    held: Vec<Value>,
    completed: bool,
}

impl TurnAggregator {
    pub fn new(thread_id: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            ..Self::default()
        }
    }

    /// Turn id known so far (from the request's response or notifications).
    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    /// Records our turn id and settles completions held while it was
    /// unknown.
    pub fn set_turn_id(&mut self, turn_id: String) {
        if turn_id.trim().is_empty() {
            return;
        }
        self.turn_id = turn_id;
        for params in std::mem::take(&mut self.held) {
            self.offer_completion(params);
        }
    }

    /// Records the turn request's response. Without a turn id in it, the
    /// latest held completion is taken as ours.
    pub fn accept_response(&mut self, turn_id: Option<String>) {
        if let Some(turn_id) = turn_id {
            self.set_turn_id(turn_id);
        } else if self.turn_id.is_empty()
            && let Some(params) = self.held.pop()
        {
            self.held.clear();
            self.apply_completed(&params);
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Applies one notification. `method` may be in any casing.
    pub fn apply(&mut self, method: &str, params: &Value) {
        let method = normalize_method(method);
        match method.as_str() {
            AGENT_MESSAGE_DELTA => {
                if let Some(delta) = params.get("delta").and_then(Value::as_str) {
                    self.delta_text.push_str(delta);
                }
            }
            ITEM_COMPLETED => self.apply_item(params.get("item").unwrap_or(params)),
            TURN_STARTED => {
                if let Some(turn_id) = first_non_blank(params, NOTIFICATION_TURN_ID_PATHS) {
                    self.set_turn_id(turn_id);
                }
            }
            TURN_COMPLETED => self.apply_completed(params),
            ERROR => {
                if let Some(message) = first_non_blank(params, TURN_ERROR_PATHS) {
                    self.error = Some(message);
                }
            }
            _ => {}
        }
    }

    /// Routes a turn-completed notification. Completions without a turn id
    /// are ours. One naming a turn is held until our id is known, then
    /// applied only if the ids match.
    pub fn offer_completion(&mut self, params: Value) {
        match first_non_blank(&params, NOTIFICATION_TURN_ID_PATHS) {
            None => self.apply_completed(&params),
            Some(_) if self.turn_id.is_empty() => {
                tracing::debug!("holding completion until the turn id is known");
                self.held.push(params);
            }
            Some(turn_id) if turn_id == self.turn_id => self.apply_completed(&params),
            Some(turn_id) => {
                tracing::debug!(
                    %turn_id,
                    ours = %self.turn_id,
                    "skipping completion of another turn"
                );
            }
        }
    }

    fn apply_item(&mut self, item: &Value) {
        let kind = item
            .get("type")
            .and_then(Value::as_str)
            .map(normalize_method)
            .unwrap_or_default();
        match kind.as_str() {
            "agent_message" => {
                if let Some(text) = item.get("text").and_then(Value::as_str)
                    && !text.trim().is_empty()
                {
                    self.item_text = Some(text.to_string());
                }
            }
            "mcp_tool_call" | "tool_call" | "dynamic_tool_call" => {
                self.tool_calls.push(tool_call_record(item));
            }
            _ => {}
        }
    }

    fn apply_completed(&mut self, params: &Value) {
        if self.turn_id.is_empty()
            && let Some(turn_id) = first_non_blank(params, NOTIFICATION_TURN_ID_PATHS)
        {
            self.turn_id = turn_id;
        }
        if self.thread_id.is_empty()
            && let Some(thread_id) = first_non_blank(params, NOTIFICATION_THREAD_ID_PATHS)
        {
            self.thread_id = thread_id;
        }
        if let Some(status) = first_non_blank(params, TURN_STATUS_PATHS) {
            self.status = status;
        }
        if let Some(message) = first_non_blank(params, TURN_ERROR_PATHS) {
            self.error = Some(message);
        }
        if let Some(text) = first_non_blank(params, TURN_TEXT_PATHS) {
            self.terminal_text = Some(text);
        }
        self.completed = true;
    }

    pub fn finish(self) -> TurnResult {
        let text = self
            .item_text
            .or_else(|| (!self.delta_text.is_empty()).then_some(self.delta_text))
            .or(self.terminal_text)
            .unwrap_or_default();
        let status = if self.status.is_empty() {
            "completed".to_string()
        } else {
            self.status
        };
        TurnResult {
            thread_id: self.thread_id,
            turn_id: self.turn_id,
            status,
            text,
            error: self.error,
            tool_calls: self.tool_calls,
        }
    }
}

fn tool_call_record(item: &Value) -> ToolCallRecord {
    let text = |key: &str| {
        item.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let status = item
        .get("status")
        .and_then(Value::as_str)
        .map_or(ToolCallStatus::Unknown, ToolCallStatus::from_wire);
    ToolCallRecord {
        server: text("server"),
        tool: text("tool"),
        status,
        arguments: item.get("arguments").cloned().unwrap_or(Value::Null),
        result: first_present(item, &[&["result"], &["error"]])
            .cloned()
            .unwrap_or(Value::Null),
    }
}
