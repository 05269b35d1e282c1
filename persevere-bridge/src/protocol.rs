//! Newline-delimited JSON messages exchanged with the host runtime.
//!
//! Every line is one object tagged by `type`. Host events travel nested under
//! `event` because they carry their own `type` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Host -> bridge.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// A host event, `{type, properties}`.
    Event { event: Value },
    /// Answer to one of our [`Outbound::Request`]s.
    Response {
        id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
    /// Host-initiated call into the plugin.
    Call {
        id: Value,
        method: String,
        #[serde(default)]
        params: Value,
    },
    /// Fire a delegated injection announced by [`Outbound::Schedule`].
    Inject { token: String },
}

/// Bridge -> host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Request {
        id: u64,
        method: &'static str,
        params: Value,
    },
    Result {
        id: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Schedule {
        token: String,
        session_id: String,
        kind: &'static str,
        delay_ms: u64,
    },
    Unschedule { token: String },
}

impl Outbound {
    pub fn reply(id: Value, outcome: Result<Value, String>) -> Self {
        match outcome {
            Ok(result) => Outbound::Result {
                id,
                result: Some(result),
                error: None,
            },
            Err(error) => Outbound::Result {
                id,
                result: None,
                error: Some(error),
            },
        }
    }
}

/// Queue drained by the stdout writer task.
pub type Outbox = mpsc::UnboundedSender<Outbound>;
