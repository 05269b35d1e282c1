//! User-facing signalling shared by both schedulers.
//!
//! Success and failure take the same path: a toast plus, for status updates,
//! an ignorable message appended to the conversation. Every host failure here
//! is logged and swallowed.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::core::codename::generate_marker;
use crate::core::echo::{EchoTracker, InjectionSource, wall_clock_ms};
use crate::core::types::{PromptRequest, Toast, ToastVariant};
use crate::io::config::PluginConfig;
use crate::io::host::Host;

#[derive(Clone)]
pub struct Notifier {
    host: Arc<dyn Host>,
    echo: Arc<EchoTracker>,
    toast_duration_ms: u64,
    agent: Option<String>,
    model: Option<String>,
}

impl Notifier {
    pub fn new(host: Arc<dyn Host>, echo: Arc<EchoTracker>, cfg: &PluginConfig) -> Self {
        Self {
            host,
            echo,
            toast_duration_ms: cfg.toast_duration_ms,
            agent: cfg.agent.clone(),
            model: cfg.model.clone(),
        }
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub async fn toast(&self, title: &str, message: &str, variant: ToastVariant) {
        let toast = Toast {
            title: title.to_string(),
            message: message.to_string(),
            variant,
            duration_ms: self.toast_duration_ms,
        };
        if let Err(err) = self.host.show_toast(toast).await {
            debug!(error = %err, "toast failed");
        }
    }

    /// Toast plus an ignored, no-reply status line in the session.
    pub async fn status(
        &self,
        session_id: &str,
        source: InjectionSource,
        title: &str,
        message: &str,
        variant: ToastVariant,
    ) {
        self.toast(title, message, variant).await;
        let request = PromptRequest {
            text: format!("[{title}] {message}"),
            no_reply: true,
            ignored: true,
            ..self.request(session_id)
        };
        if let Err(err) = self.send_marked(request, source).await {
            warn!(session_id, error = %err, "status message failed");
        }
    }

    /// Send a prompt the model should act on.
    pub async fn send_continuation(
        &self,
        session_id: &str,
        source: InjectionSource,
        text: String,
    ) -> Result<()> {
        let request = PromptRequest {
            text,
            ..self.request(session_id)
        };
        self.send_marked(request, source).await
    }

    async fn send_marked(&self, mut request: PromptRequest, source: InjectionSource) -> Result<()> {
        let marker = generate_marker(source.as_str());
        // Record before sending: the host may emit the echo before the call returns.
        self.echo
            .record(&request.session_id, source, &marker, wall_clock_ms());
        request.marker = Some(marker);
        self.host.send_prompt(request).await
    }

    fn request(&self, session_id: &str) -> PromptRequest {
        PromptRequest {
            session_id: session_id.to_string(),
            agent: self.agent.clone(),
            model: self.model.clone(),
            ..PromptRequest::default()
        }
    }
}
