//! Ordered candidate-path lookups for loosely shaped payloads.
//!
//! The same field shows up under several paths and spellings depending on
//! the app-server version. Each lookup is a fixed priority list of paths;
//! the first one that yields a non-blank string wins.

use serde_json::Value;

/// A path of object keys. The empty path addresses the value itself.
pub type CandidatePath = &'static [&'static str];

pub const THREAD_ID_PATHS: &[CandidatePath] = &[
    &[],
    &["thread", "id"],
    &["threadId"],
    &["thread_id"],
    &["id"],
];

pub const TURN_ID_PATHS: &[CandidatePath] =
    &[&[], &["turn", "id"], &["turnId"], &["turn_id"], &["id"]];

/// Thread id as carried on notifications (never the bare value or `id`,
/// which name other entities there).
pub const NOTIFICATION_THREAD_ID_PATHS: &[CandidatePath] = &[
    &["threadId"],
    &["thread_id"],
    &["turn", "threadId"],
    &["thread", "id"],
];

pub const NOTIFICATION_TURN_ID_PATHS: &[CandidatePath] =
    &[&["turn", "id"], &["turnId"], &["turn_id"]];

pub const TURN_STATUS_PATHS: &[CandidatePath] = &[&["turn", "status"], &["status"]];

pub const TURN_ERROR_PATHS: &[CandidatePath] = &[
    &["turn", "error", "message"],
    &["error", "message"],
    &["turn", "error"],
    &["error"],
];

/// Text attached to the terminal turn-completed event.
pub const TURN_TEXT_PATHS: &[CandidatePath] = &[
    &["turn", "text"],
    &["text"],
    &["lastAgentMessage"],
    &["last_agent_message"],
];

/// Returns the first candidate that resolves to a non-blank string.
pub fn first_non_blank(value: &Value, paths: &[CandidatePath]) -> Option<String> {
    paths
        .iter()
        .filter_map(|path| lookup(value, path))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Returns the first candidate path that is present and not null.
pub fn first_present<'a>(value: &'a Value, paths: &[CandidatePath]) -> Option<&'a Value> {
    paths
        .iter()
        .filter_map(|path| lookup(value, path))
        .find(|v| !v.is_null())
}

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter()
        .try_fold(value, |current, key| current.get(*key))
}
