//! Host event routing.
//!
//! [`HostEvent`] is the typed form of the host's `{type, properties}` event
//! payloads; [`EventDispatcher`] maps each kind onto the two schedulers and
//! filters out user-message events caused by the plugin's own injections.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::echo::EchoTracker;
use crate::delivery::Delivery;
use crate::io::config::PluginConfig;
use crate::io::evaluator::CompletionEvaluator;
use crate::io::host::Host;
use crate::io::loop_state::LoopStateStore;
use crate::io::prompt::PromptRenderer;
use crate::iteration::{IterationLoop, IterationSettings, ProcessedPrompt};
use crate::notify::Notifier;
use crate::todo::{TodoScheduler, TodoSettings};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum Role {
    User,
    Assistant,
    Other(String),
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        match value.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            _ => Role::Other(value),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MessageTime {
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub created: i64,
}

/// The `info` object of `message.updated` events.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageInfo {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub role: Role,
    #[serde(default)]
    pub time: MessageTime,
    /// Marker copied from the prompt that produced this message, if any.
    #[serde(default)]
    pub marker: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolPhase {
    Before,
    After,
}

/// Host lifecycle events the plugin reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    SessionIdle {
        session_id: String,
    },
    SessionError {
        session_id: String,
        error: Option<Value>,
    },
    /// `message.updated` and `message.part.updated`.
    MessageUpdated {
        info: MessageInfo,
    },
    ToolExecute {
        session_id: String,
        phase: ToolPhase,
    },
    SessionDeleted {
        session_id: String,
    },
    /// Anything else; logged and ignored.
    Other {
        kind: String,
    },
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    properties: Value,
}

#[derive(Deserialize)]
struct SessionProps {
    #[serde(rename = "sessionID", default)]
    session_id: String,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct MessageProps {
    info: MessageInfo,
}

#[derive(Deserialize)]
struct DeletedInfo {
    id: String,
}

#[derive(Deserialize)]
struct DeletedProps {
    info: DeletedInfo,
}

impl HostEvent {
    /// Parse a raw `{type, properties}` host event.
    pub fn from_json(value: Value) -> Result<Self> {
        let raw: RawEvent = serde_json::from_value(value).context("parse host event envelope")?;
        let props = raw.properties;
        let event = match raw.kind.as_str() {
            "session.idle" => {
                let p: SessionProps = parse_props(&raw.kind, props)?;
                HostEvent::SessionIdle {
                    session_id: p.session_id,
                }
            }
            "session.error" => {
                let p: SessionProps = parse_props(&raw.kind, props)?;
                HostEvent::SessionError {
                    session_id: p.session_id,
                    error: p.error,
                }
            }
            "message.updated" | "message.part.updated" => {
                let p: MessageProps = parse_props(&raw.kind, props)?;
                HostEvent::MessageUpdated { info: p.info }
            }
            "tool.execute.before" | "tool.execute.after" => {
                let p: SessionProps = parse_props(&raw.kind, props)?;
                let phase = if raw.kind.ends_with("before") {
                    ToolPhase::Before
                } else {
                    ToolPhase::After
                };
                HostEvent::ToolExecute {
                    session_id: p.session_id,
                    phase,
                }
            }
            "session.deleted" => {
                let p: DeletedProps = parse_props(&raw.kind, props)?;
                HostEvent::SessionDeleted {
                    session_id: p.info.id,
                }
            }
            _ => HostEvent::Other { kind: raw.kind },
        };
        Ok(event)
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            HostEvent::SessionIdle { session_id }
            | HostEvent::SessionError { session_id, .. }
            | HostEvent::ToolExecute { session_id, .. }
            | HostEvent::SessionDeleted { session_id } => Some(session_id),
            HostEvent::MessageUpdated { info } => Some(&info.session_id),
            HostEvent::Other { .. } => None,
        }
    }
}

fn parse_props<T: serde::de::DeserializeOwned>(kind: &str, props: Value) -> Result<T> {
    serde_json::from_value(props).with_context(|| format!("parse {kind} properties"))
}

/// Single entry point for host events. Cheap to clone.
#[derive(Clone)]
pub struct EventDispatcher {
    todo: TodoScheduler,
    iteration: IterationLoop,
    echo: Arc<EchoTracker>,
}

impl EventDispatcher {
    pub fn new(todo: TodoScheduler, iteration: IterationLoop, echo: Arc<EchoTracker>) -> Self {
        Self {
            todo,
            iteration,
            echo,
        }
    }

    /// Wire both schedulers to one host, sharing the echo tracker and renderer.
    pub fn build(
        cfg: &PluginConfig,
        host: Arc<dyn Host>,
        store: Arc<dyn LoopStateStore>,
        evaluator: Option<Arc<dyn CompletionEvaluator>>,
        delivery: Delivery,
    ) -> Self {
        let echo = Arc::new(EchoTracker::new());
        let notifier = Notifier::new(host, echo.clone(), cfg);
        let renderer = Arc::new(PromptRenderer::new());
        let todo = TodoScheduler::new(
            notifier.clone(),
            renderer.clone(),
            delivery.clone(),
            TodoSettings::from_config(cfg),
        );
        let iteration = IterationLoop::new(
            notifier,
            renderer,
            delivery,
            store,
            evaluator,
            IterationSettings::from_config(cfg),
        );
        Self::new(todo, iteration, echo)
    }

    pub fn todo(&self) -> &TodoScheduler {
        &self.todo
    }

    pub fn iteration(&self) -> &IterationLoop {
        &self.iteration
    }

    #[instrument(skip_all, fields(session_id = event.session_id().unwrap_or_default()))]
    pub async fn dispatch(&self, event: &HostEvent) {
        match event {
            HostEvent::SessionIdle { session_id } => {
                tokio::join!(
                    self.todo.on_session_idle(session_id),
                    self.iteration.on_session_idle(session_id)
                );
            }
            HostEvent::SessionError { session_id, error } => {
                debug!(error = ?error, "session error");
                self.todo.on_session_error(session_id);
                self.iteration.on_session_error(session_id);
            }
            HostEvent::MessageUpdated { info } => self.on_message(info),
            HostEvent::ToolExecute { session_id, .. } => {
                self.todo.cancel_countdown(session_id);
            }
            HostEvent::SessionDeleted { session_id } => {
                self.todo.on_session_deleted(session_id);
                self.iteration.on_session_deleted(session_id);
                self.echo.forget(session_id);
            }
            HostEvent::Other { kind } => debug!(kind, "ignoring host event"),
        }
    }

    /// Loop-tag processing for a user prompt before the host submits it.
    pub async fn transform_prompt(&self, session_id: &str, raw: &str) -> ProcessedPrompt {
        self.iteration.process_prompt(session_id, raw).await
    }

    fn on_message(&self, info: &MessageInfo) {
        let session_id = info.session_id.as_str();
        match &info.role {
            Role::Assistant => {
                self.todo.cancel_countdown(session_id);
                self.iteration.on_assistant_message(session_id);
            }
            Role::User => {
                if self
                    .echo
                    .is_echo(session_id, info.marker.as_deref(), info.time.created)
                {
                    debug!(session_id, message_id = %info.id, "ignoring echo of injected prompt");
                    return;
                }
                self.todo.on_user_message(session_id);
            }
            Role::Other(role) => debug!(session_id, role, "ignoring message role"),
        }
    }
}
