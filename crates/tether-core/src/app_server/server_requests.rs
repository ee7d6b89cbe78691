//! Answers for requests the app-server sends mid-turn.
//!
//! Every server request must be answered or the server stalls waiting on
//! us. Approvals are always declined; user-input prompts pick the option
//! that looks like a decline; anything else gets "method not supported".

use serde_json::{Map, Value, json};

use super::protocol::METHOD_NOT_FOUND;
use crate::config::PolicyConfig;

/// Reply to a server request: either a result or a JSON-RPC error.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerReply {
    Result(Value),
    Error { code: i64, message: String },
}

/// Policy for answering server-initiated requests.
#[derive(Debug, Clone)]
pub struct ServerRequestPolicy {
    decline_labels: Vec<String>,
}

impl Default for ServerRequestPolicy {
    fn default() -> Self {
        Self::from_config(&PolicyConfig::default())
    }
}

impl ServerRequestPolicy {
    pub fn from_config(config: &PolicyConfig) -> Self {
        let decline_labels = config
            .decline_labels
            .iter()
            .map(|label| label.trim().to_lowercase())
            .filter(|label| !label.is_empty())
            .collect();
        Self { decline_labels }
    }

    /// Builds the reply for a request whose method is already normalized.
    pub fn reply(&self, method: &str, params: &Value) -> ServerReply {
        match classify(method) {
            RequestKind::ItemApproval => ServerReply::Result(json!({ "decision": "decline" })),
            RequestKind::LegacyApproval => ServerReply::Result(json!({ "decision": "denied" })),
            RequestKind::UserInput => ServerReply::Result(self.answer_user_input(params)),
            RequestKind::Unsupported => ServerReply::Error {
                code: METHOD_NOT_FOUND,
                message: format!("method not supported: {method}"),
            },
        }
    }

    fn answer_user_input(&self, params: &Value) -> Value {
        let mut answers = Map::new();
        let questions = params
            .get("questions")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for (index, question) in questions.iter().enumerate() {
            let id = question
                .get("id")
                .and_then(Value::as_str)
                .map_or_else(|| index.to_string(), str::to_string);
            let labels: Vec<&str> = question
                .get("options")
                .and_then(Value::as_array)
                .map(|options| options.iter().filter_map(option_label).collect())
                .unwrap_or_default();
            let chosen: Vec<&str> = self.pick_label(&labels).into_iter().collect();
            answers.insert(id, json!({ "answers": chosen }));
        }

        json!({ "answers": answers })
    }

    /// Prefers the first option matching any decline label (in label
    /// priority order), falling back to the first option.
    fn pick_label<'a>(&self, labels: &[&'a str]) -> Option<&'a str> {
        self.decline_labels
            .iter()
            .find_map(|needle| {
                labels
                    .iter()
                    .find(|label| label.to_lowercase().contains(needle.as_str()))
            })
            .or_else(|| labels.first())
            .copied()
    }
}

enum RequestKind {
    ItemApproval,
    LegacyApproval,
    UserInput,
    Unsupported,
}

fn classify(method: &str) -> RequestKind {
    if method.ends_with("request_approval") {
        RequestKind::ItemApproval
    } else if matches!(method, "exec_command_approval" | "apply_patch_approval")
        || method.ends_with("_approval")
    {
        RequestKind::LegacyApproval
    } else if method.ends_with("request_user_input") {
        RequestKind::UserInput
    } else {
        RequestKind::Unsupported
    }
}

fn option_label(option: &Value) -> Option<&str> {
    option
        .as_str()
        .or_else(|| option.get("label").and_then(Value::as_str))
}
