use serde::{Deserialize, Serialize};
use tether_core::types::{ConversationKey, ToolCallRecord, TurnResult};

use crate::bot::queue::{BatchMeta, Keyed};

/// One inbound chat event, as read from a JSON line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct InboundEvent {
    pub id: Option<String>,
    pub scope: String,
    pub channel: String,
    pub author: Option<String>,
    pub text: String,
    pub is_bot: bool,
}

impl Keyed for InboundEvent {
    fn key(&self) -> ConversationKey {
        ConversationKey::new(self.scope.as_str(), self.channel.as_str())
    }
}

/// One JSON line written per handled batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundReply {
    pub scope: String,
    pub channel: String,
    pub event_id: Option<String>,
    pub merge_count: usize,
    pub queue_wait_ms: u64,
    pub thread_id: String,
    pub turn_id: String,
    pub status: String,
    pub text: String,
    pub error: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
}

impl OutboundReply {
    fn base(key: &ConversationKey, event: &InboundEvent, meta: &BatchMeta) -> Self {
        Self {
            scope: key.scope().to_string(),
            channel: key.channel().to_string(),
            event_id: event.id.clone(),
            merge_count: meta.merge_count,
            queue_wait_ms: u64::try_from(meta.queue_wait.as_millis()).unwrap_or(u64::MAX),
            thread_id: String::new(),
            turn_id: String::new(),
            status: String::new(),
            text: String::new(),
            error: None,
            tool_calls: Vec::new(),
        }
    }

    pub(crate) fn from_turn(
        key: &ConversationKey,
        event: &InboundEvent,
        meta: &BatchMeta,
        result: TurnResult,
    ) -> Self {
        Self {
            thread_id: result.thread_id,
            turn_id: result.turn_id,
            status: result.status,
            text: result.text,
            error: result.error,
            tool_calls: result.tool_calls,
            ..Self::base(key, event, meta)
        }
    }

    pub(crate) fn notice(
        key: &ConversationKey,
        event: &InboundEvent,
        meta: &BatchMeta,
        status: &str,
        text: &str,
    ) -> Self {
        Self {
            status: status.to_string(),
            text: text.to_string(),
            ..Self::base(key, event, meta)
        }
    }

    pub(crate) fn failure(
        key: &ConversationKey,
        event: &InboundEvent,
        meta: &BatchMeta,
        error: String,
    ) -> Self {
        Self {
            status: "error".to_string(),
            error: Some(error),
            ..Self::base(key, event, meta)
        }
    }
}
