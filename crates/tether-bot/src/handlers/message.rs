use crate::bot::context::BotContext;
use crate::bot::queue::{BatchMeta, Keyed};
use crate::commands::{BotCommand, parse_command};
use crate::types::{InboundEvent, OutboundReply};

const RESET_DONE: &str = "Session cleared. Start a new conversation anytime.";
const RESET_EMPTY: &str = "No active session. The next message starts a new one.";

/// Handles the latest event of a coalesced batch and builds the reply line.
pub(crate) async fn handle_batch(
    context: &BotContext,
    event: InboundEvent,
    meta: BatchMeta,
) -> OutboundReply {
    let key = event.key();

    if parse_command(&event.text) == Some(BotCommand::New) {
        let existed = context.coordinator().reset(&key);
        let text = if existed { RESET_DONE } else { RESET_EMPTY };
        return OutboundReply::notice(&key, &event, &meta, "reset", text);
    }

    tracing::info!(
        %key,
        author = event.author.as_deref().unwrap_or("unknown"),
        merge_count = meta.merge_count,
        queue_wait_ms = meta.queue_wait.as_millis(),
        "Accepted batch"
    );

    let input = context.turn_input(&event.text);
    match context.coordinator().run_turn(&key, &input).await {
        Ok(result) => {
            tracing::info!(
                %key,
                thread_id = %result.thread_id,
                turn_id = %result.turn_id,
                status = %result.status,
                tool_calls = result.tool_calls.len(),
                "Turn finished"
            );
            OutboundReply::from_turn(&key, &event, &meta, result)
        }
        Err(err) => {
            tracing::error!(%key, error = %format!("{err:#}"), "Turn failed");
            OutboundReply::failure(&key, &event, &meta, format!("{err:#}"))
        }
    }
}
