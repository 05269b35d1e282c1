//! Protocol loop: read host lines, dispatch, write replies.
//!
//! Event handlers await host responses that arrive on the same input stream,
//! so every event and call runs on its own task while the reader keeps
//! draining stdin. On a current-thread runtime spawned tasks start in arrival
//! order, which keeps event handling ordered up to each handler's first await.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use persevere::delivery::Delivery;
use persevere::dispatch::{EventDispatcher, HostEvent};
use persevere::io::config::{DeliveryMode, EvaluatorMode, PluginConfig};
use persevere::io::evaluator::{CommandEvaluator, CompletionEvaluator};
use persevere::io::loop_state::FileLoopStore;
use persevere::iteration::LoopError;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::hook::HostDeliveryHook;
use crate::host::{HostEvaluator, StdioHost};
use crate::protocol::{Inbound, Outbound, Outbox};

/// How long queued output may keep draining after stdin closes.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct Bridge {
    dispatcher: EventDispatcher,
    host: Arc<StdioHost>,
    hook: Option<Arc<HostDeliveryHook>>,
    outbox: Outbox,
}

impl Bridge {
    pub fn new(cfg: &PluginConfig, project_dir: &Path, outbox: Outbox) -> Self {
        let host = Arc::new(StdioHost::new(outbox.clone()));
        let evaluator: Option<Arc<dyn CompletionEvaluator>> = match cfg.evaluator.mode {
            EvaluatorMode::Host => Some(Arc::new(HostEvaluator::new(
                host.clone(),
                Duration::from_secs(cfg.evaluator.timeout_secs),
            ))),
            EvaluatorMode::Command => CommandEvaluator::from_config(&cfg.evaluator)
                .map(|evaluator| {
                    Arc::new(evaluator.with_workdir(project_dir)) as Arc<dyn CompletionEvaluator>
                }),
            EvaluatorMode::None => None,
        };
        let hook = match cfg.delivery {
            DeliveryMode::Direct => None,
            DeliveryMode::Host => Some(Arc::new(HostDeliveryHook::new(outbox.clone()))),
        };
        let delivery = match &hook {
            Some(hook) => Delivery::Delegated(hook.clone()),
            None => Delivery::Direct,
        };
        let store = FileLoopStore::new(cfg.state_path_in(project_dir));
        info!(
            state_path = %store.path().display(),
            evaluator = ?cfg.evaluator.mode,
            delivery = ?cfg.delivery,
            "bridge configured"
        );
        let dispatcher =
            EventDispatcher::build(cfg, host.clone(), Arc::new(store), evaluator, delivery);
        Self {
            dispatcher,
            host,
            hook,
            outbox,
        }
    }

    /// Handle one input line. Never blocks on host round trips.
    pub fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let inbound: Inbound = match serde_json::from_str(line) {
            Ok(inbound) => inbound,
            Err(err) => {
                warn!(error = %err, "unparsable protocol line");
                return;
            }
        };
        match inbound {
            Inbound::Event { event } => match HostEvent::from_json(event) {
                Ok(event) => {
                    let dispatcher = self.dispatcher.clone();
                    tokio::spawn(async move { dispatcher.dispatch(&event).await });
                }
                Err(err) => warn!(error = %format!("{err:#}"), "malformed host event"),
            },
            Inbound::Response { id, result, error } => {
                let outcome = match error {
                    Some(message) => Err(message),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                if !self.host.resolve(id, outcome) {
                    debug!(id, "response for unknown or expired request");
                }
            }
            Inbound::Call { id, method, params } => {
                let dispatcher = self.dispatcher.clone();
                let outbox = self.outbox.clone();
                tokio::spawn(async move {
                    let outcome = handle_call(&dispatcher, &method, params).await;
                    if let Err(message) = &outcome {
                        debug!(method, error = %message, "call rejected");
                    }
                    let _ = outbox.send(Outbound::reply(id, outcome));
                });
            }
            Inbound::Inject { token } => match &self.hook {
                Some(hook) => {
                    hook.inject(&token);
                }
                None => warn!(token, "inject received but delivery mode is direct"),
            },
        }
    }

    pub fn shutdown(&self) {
        self.host.shutdown();
    }
}

#[derive(Deserialize)]
struct SessionParams {
    #[serde(rename = "sessionID")]
    session_id: String,
}

#[derive(Deserialize)]
struct PromptParams {
    #[serde(rename = "sessionID")]
    session_id: String,
    prompt: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartParams {
    #[serde(rename = "sessionID")]
    session_id: String,
    prompt: String,
    #[serde(default)]
    max_iterations: Option<u32>,
}

#[derive(Deserialize)]
struct CompleteParams {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(default)]
    summary: Option<String>,
}

fn params<T: serde::de::DeserializeOwned>(method: &str, value: Value) -> Result<T, String> {
    serde_json::from_value(value).map_err(|err| format!("invalid {method} params: {err}"))
}

fn loop_error(err: LoopError) -> String {
    err.to_string()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|err| err.to_string())
}

/// Execute a host-initiated call.
pub async fn handle_call(
    dispatcher: &EventDispatcher,
    method: &str,
    value: Value,
) -> Result<Value, String> {
    let iteration = dispatcher.iteration();
    match method {
        "transform_prompt" => {
            let p: PromptParams = params(method, value)?;
            let processed = dispatcher.transform_prompt(&p.session_id, &p.prompt).await;
            Ok(json!({ "text": processed.text, "started": to_json(&processed.started)? }))
        }
        "start_loop" => {
            let p: StartParams = params(method, value)?;
            let state = iteration
                .start_loop(&p.session_id, &p.prompt, p.max_iterations)
                .map_err(loop_error)?;
            to_json(&state)
        }
        "cancel_loop" => {
            let p: SessionParams = params(method, value)?;
            let state = iteration
                .cancel_loop(&p.session_id)
                .await
                .map_err(loop_error)?;
            to_json(&state)
        }
        "complete_loop" => {
            let p: CompleteParams = params(method, value)?;
            let done = iteration
                .complete_loop(&p.session_id, p.summary)
                .await
                .map_err(loop_error)?;
            Ok(json!({
                "iterations": done.iterations,
                "summary": done.summary,
                "codename": done.codename,
            }))
        }
        "loop_status" => to_json(&iteration.status().map_err(loop_error)?),
        "mark_recovering" => {
            let p: SessionParams = params(method, value)?;
            dispatcher.todo().mark_recovering(&p.session_id);
            Ok(Value::Null)
        }
        "mark_recovered" => {
            let p: SessionParams = params(method, value)?;
            dispatcher.todo().mark_recovery_complete(&p.session_id);
            Ok(Value::Null)
        }
        other => Err(format!("unknown method {other}")),
    }
}

/// Serve the protocol until `reader` reaches EOF.
pub async fn run<R, W>(cfg: &PluginConfig, project_dir: &Path, reader: R, writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let bridge = Bridge::new(cfg, project_dir, tx);
    let writer_task = tokio::spawn(write_lines(rx, writer));

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await.context("read protocol input")? {
        bridge.handle_line(&line);
    }

    info!("input closed, shutting down");
    bridge.shutdown();
    drop(bridge);
    // The writer exits once every task holding the outbox has finished.
    match tokio::time::timeout(SHUTDOWN_GRACE, writer_task).await {
        Ok(joined) => joined.context("join protocol writer")?,
        Err(_) => {
            debug!("tasks still running at shutdown, dropping their output");
            Ok(())
        }
    }
}

async fn write_lines<W>(mut rx: mpsc::UnboundedReceiver<Outbound>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = serde_json::to_string(&message).context("serialize protocol line")?;
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .context("write protocol output")?;
        writer.flush().await.context("flush protocol output")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use persevere::io::config::EvaluatorConfig;
    use tokio::io::{AsyncReadExt, BufReader};
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;

    struct Harness {
        _dir: tempfile::TempDir,
        bridge: Bridge,
        rx: UnboundedReceiver<Outbound>,
    }

    impl Harness {
        fn new(cfg: PluginConfig) -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let (tx, rx) = mpsc::unbounded_channel();
            let bridge = Bridge::new(&cfg, dir.path(), tx);
            Self {
                _dir: dir,
                bridge,
                rx,
            }
        }

        fn send(&self, line: Value) {
            self.bridge.handle_line(&line.to_string());
        }

        async fn next(&mut self) -> Value {
            let message = tokio::time::timeout(Duration::from_secs(60), self.rx.recv())
                .await
                .expect("outbound message")
                .expect("channel open");
            serde_json::to_value(&message).expect("serialize")
        }

        /// Wait for a request of `method`, answering any toast requests on the way.
        async fn expect_request(&mut self, method: &str) -> Value {
            loop {
                let message = self.next().await;
                assert_eq!(message["type"], "request", "unexpected {message}");
                if message["method"] == "show_toast" && method != "show_toast" {
                    self.respond(&message, Value::Null);
                    continue;
                }
                assert_eq!(message["method"], method, "unexpected {message}");
                return message;
            }
        }

        fn respond(&self, request: &Value, result: Value) {
            self.send(json!({"type": "response", "id": request["id"], "result": result}));
        }
    }

    fn quiet_config() -> PluginConfig {
        PluginConfig {
            countdown_toasts: false,
            ..PluginConfig::default()
        }
    }

    fn idle_line() -> Value {
        json!({"type": "event", "event": {"type": "session.idle", "properties": {"sessionID": "s1"}}})
    }

    fn open_todos() -> Value {
        json!([{"id": "1", "content": "wire the parser", "status": "pending"}])
    }

    #[tokio::test(start_paused = true)]
    async fn idle_event_drives_todo_continuation_over_protocol() {
        let mut h = Harness::new(quiet_config());

        h.send(idle_line());
        let fetch = h.expect_request("fetch_todos").await;
        assert_eq!(fetch["params"]["sessionID"], "s1");
        h.respond(&fetch, open_todos());

        let refetch = h.expect_request("fetch_todos").await;
        h.respond(&refetch, open_todos());
        let prompt = h.expect_request("send_prompt").await;
        assert_eq!(prompt["params"]["sessionID"], "s1");
        assert!(
            prompt["params"]["text"]
                .as_str()
                .expect("text")
                .contains("[pending] wire the parser")
        );
        assert!(prompt["params"]["marker"].as_str().is_some());
        h.respond(&prompt, Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn host_delivery_schedules_and_injects_by_token() {
        let mut h = Harness::new(PluginConfig {
            delivery: DeliveryMode::Host,
            ..quiet_config()
        });

        h.send(idle_line());
        let fetch = h.expect_request("fetch_todos").await;
        h.respond(&fetch, open_todos());

        let schedule = h.next().await;
        assert_eq!(schedule["type"], "schedule");
        assert_eq!(schedule["kind"], "todo");
        assert_eq!(schedule["delay_ms"], 2_000);
        h.send(json!({"type": "inject", "token": schedule["token"]}));

        let refetch = h.expect_request("fetch_todos").await;
        h.respond(&refetch, open_todos());
        h.expect_request("send_prompt").await;
    }

    #[tokio::test(start_paused = true)]
    async fn user_message_retracts_scheduled_injection() {
        let mut h = Harness::new(PluginConfig {
            delivery: DeliveryMode::Host,
            ..quiet_config()
        });

        h.send(idle_line());
        let fetch = h.expect_request("fetch_todos").await;
        h.respond(&fetch, open_todos());
        let schedule = h.next().await;

        h.send(json!({"type": "event", "event": {"type": "message.updated", "properties": {"info": {
            "id": "m1", "sessionID": "s1", "role": "user", "time": {"created": 1}
        }}}}));
        let retract = h.next().await;
        assert_eq!(retract, json!({"type": "unschedule", "token": schedule["token"]}));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_calls_round_trip() {
        let mut h = Harness::new(PluginConfig {
            evaluator: EvaluatorConfig {
                mode: EvaluatorMode::None,
                ..EvaluatorConfig::default()
            },
            ..quiet_config()
        });

        h.send(json!({"type": "call", "id": 1, "method": "start_loop",
            "params": {"sessionID": "s1", "prompt": "Port it", "maxIterations": 3}}));
        let started = h.next().await;
        assert_eq!(started["id"], 1);
        assert_eq!(started["result"]["max_iterations"], 3);
        assert_eq!(started["result"]["iteration"], 1);

        h.send(json!({"type": "call", "id": 2, "method": "start_loop",
            "params": {"sessionID": "s2", "prompt": "Other"}}));
        let rejected = h.next().await;
        assert!(
            rejected["error"]
                .as_str()
                .expect("error")
                .contains("already active")
        );

        h.send(json!({"type": "call", "id": 3, "method": "complete_loop",
            "params": {"sessionID": "s1", "summary": "done"}}));
        let status_line = h.expect_request("show_toast").await;
        h.respond(&status_line, Value::Null);
        let status_prompt = h.expect_request("send_prompt").await;
        assert_eq!(status_prompt["params"]["ignored"], true);
        h.respond(&status_prompt, Value::Null);
        let completed = h.next().await;
        assert_eq!(completed["id"], 3);
        assert_eq!(completed["result"]["iterations"], 1);
        assert_eq!(completed["result"]["summary"], "done");

        h.send(json!({"type": "call", "id": 4, "method": "loop_status"}));
        let status = h.next().await;
        assert_eq!(status, json!({"type": "result", "id": 4, "result": null}));

        h.send(json!({"type": "call", "id": 5, "method": "nope"}));
        let unknown = h.next().await;
        assert_eq!(unknown["error"], "unknown method nope");
    }

    #[tokio::test]
    async fn run_exits_on_eof_and_writes_replies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = b"{\"type\":\"call\",\"id\":9,\"method\":\"loop_status\"}\nnot json\n";
        let (client, server) = tokio::io::duplex(4096);
        let (mut read_half, _write_half) = tokio::io::split(client);

        let cfg = quiet_config();
        let path = dir.path().to_path_buf();
        let serve = tokio::spawn(async move {
            run(&cfg, &path, BufReader::new(&input[..]), server).await
        });

        let mut buf = vec![0u8; 256];
        let n = tokio::time::timeout(Duration::from_secs(5), read_half.read(&mut buf))
            .await
            .expect("reply in time")
            .expect("read");
        let reply: Value = serde_json::from_slice(buf[..n].trim_ascii()).expect("json line");
        assert_eq!(reply, json!({"type": "result", "id": 9, "result": null}));
        serve.await.expect("join").expect("run");
    }
}
