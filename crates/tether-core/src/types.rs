//! Data crossing the coordinator/client boundary.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Placeholder used when the scope segment of a key is blank.
pub const UNKNOWN_SCOPE: &str = "unknown-scope";
/// Placeholder used when the channel segment of a key is blank.
pub const UNKNOWN_CHANNEL: &str = "unknown-channel";

/// Two-segment conversation identity: (scope, channel).
///
/// Scopes both event coalescing and session continuity. Blank segments are
/// replaced with fixed placeholders, so a malformed key still maps to a
/// stable slot instead of failing lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    scope: String,
    channel: String,
}

impl ConversationKey {
    pub fn new(scope: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            scope: normalize_segment(scope.into(), UNKNOWN_SCOPE),
            channel: normalize_segment(channel.into(), UNKNOWN_CHANNEL),
        }
    }

    /// Parses `scope:channel`. A missing separator treats the whole input as
    /// the scope.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((scope, channel)) => Self::new(scope, channel),
            None => Self::new(raw, ""),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.channel)
    }
}

fn normalize_segment(value: String, placeholder: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        placeholder.to_string()
    } else if trimmed.len() == value.len() {
        value
    } else {
        trimmed.to_string()
    }
}

/// Inputs for a single turn. Immutable per call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnInput {
    /// Instructions the thread is created with (system-level).
    pub base_instructions: String,
    /// Additional developer-level instructions for the thread.
    pub developer_instructions: String,
    /// The user prompt for this turn.
    pub prompt: String,
}

impl TurnInput {
    pub fn new(
        base_instructions: impl Into<String>,
        developer_instructions: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            base_instructions: base_instructions.into(),
            developer_instructions: developer_instructions.into(),
            prompt: prompt.into(),
        }
    }
}

/// Normalized status of a tool call reported by the app-server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ToolCallStatus {
    Completed,
    InProgress,
    Failed,
    #[default]
    Unknown,
}

impl ToolCallStatus {
    /// Maps the many status spellings seen on the wire onto the four
    /// canonical values.
    pub fn from_wire(raw: &str) -> Self {
        let normalized: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .flat_map(char::to_lowercase)
            .collect();
        match normalized.as_str() {
            "completed" | "complete" | "success" | "succeeded" | "ok" => Self::Completed,
            "inprogress" | "running" | "pending" | "started" => Self::InProgress,
            "failed" | "failure" | "error" | "errored" | "declined" | "cancelled"
            | "canceled" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::InProgress => "inProgress",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }
}

/// One tool invocation made by the subprocess during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub server: String,
    pub tool: String,
    pub status: ToolCallStatus,
    pub arguments: Value,
    pub result: Value,
}

/// Aggregated outcome of one completed turn.
///
/// Identifiers may be empty when the subprocess omits them; the coordinator
/// backfills them from its cache before handing the result out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnResult {
    pub thread_id: String,
    pub turn_id: String,
    pub status: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
}
