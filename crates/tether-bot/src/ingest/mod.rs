use crate::types::InboundEvent;

/// Parses one stdin line into an event worth dispatching.
///
/// Returns `None` for blank or malformed lines, events from bots, and events
/// without text. Each rejection is logged.
pub(crate) fn parse_event(line: &str) -> Option<InboundEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut event: InboundEvent = match serde_json::from_str(trimmed) {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(error = %err, "Ignoring malformed event line");
            return None;
        }
    };

    if event.is_bot {
        tracing::debug!(author = ?event.author, "Ignoring event from bot");
        return None;
    }

    let text = event.text.trim();
    if text.is_empty() {
        tracing::debug!(id = ?event.id, "Ignoring empty event");
        return None;
    }
    if text.len() != event.text.len() {
        event.text = text.to_string();
    }

    Some(event)
}
