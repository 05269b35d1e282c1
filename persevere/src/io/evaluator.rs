//! Completion evaluator seam.
//!
//! The iteration loop never judges completion itself; it hands an
//! [`EvaluationRequest`] to a [`CompletionEvaluator`] supplied by the
//! integrator. [`CommandEvaluator`] runs an external program for this, in the
//! same way guard and executor commands are run elsewhere: JSON request on
//! stdin, JSON verdict on stdout, killed after a timeout.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::core::types::{EvaluationRequest, Verdict};
use crate::io::config::{EvaluatorConfig, EvaluatorMode};

#[async_trait]
pub trait CompletionEvaluator: Send + Sync {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<Verdict>;
}

/// Evaluator backed by an external command.
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    argv: Vec<String>,
    timeout: Duration,
    workdir: Option<PathBuf>,
}

impl CommandEvaluator {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self {
            argv,
            timeout,
            workdir: None,
        }
    }

    /// Build from config when `mode = "command"`.
    pub fn from_config(cfg: &EvaluatorConfig) -> Option<Self> {
        if cfg.mode != EvaluatorMode::Command || cfg.command.is_empty() {
            return None;
        }
        Some(Self::new(
            cfg.command.clone(),
            Duration::from_secs(cfg.timeout_secs),
        ))
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

#[async_trait]
impl CompletionEvaluator for CommandEvaluator {
    #[instrument(skip_all, fields(session_id = %request.session_id, iteration = request.iteration))]
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<Verdict> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("evaluator command must be non-empty"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(workdir) = &self.workdir {
            cmd.current_dir(workdir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn evaluator {:?}", self.argv))?;

        let payload = serde_json::to_vec(request).context("serialize evaluation request")?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .context("write evaluator stdin")?;
            // Dropping stdin closes the pipe so the evaluator sees EOF.
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("evaluator timed out after {:?}", self.timeout))?
            .context("wait for evaluator")?;

        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "evaluator failed");
            return Err(anyhow!(
                "evaluator failed with status {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let verdict = parse_verdict(&stdout)?;
        debug!(is_complete = verdict.is_complete, "evaluator verdict");
        Ok(verdict)
    }
}

/// Parse a verdict from evaluator output: the whole output, or failing that the
/// last line that is a verdict object (tools often log before answering).
pub fn parse_verdict(output: &str) -> Result<Verdict> {
    if let Ok(verdict) = serde_json::from_str::<Verdict>(output.trim()) {
        return Ok(verdict);
    }
    output
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<Verdict>(line).ok())
        .ok_or_else(|| anyhow!("evaluator output contained no verdict"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> EvaluationRequest {
        EvaluationRequest {
            session_id: "ses_1".to_string(),
            iteration: 1,
            max_iterations: 3,
            prompt: "task".to_string(),
            transcript: "assistant: done".to_string(),
        }
    }

    fn sh(script: &str) -> CommandEvaluator {
        CommandEvaluator::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            Duration::from_secs(5),
        )
    }

    #[test]
    fn parse_verdict_takes_last_json_line() {
        let verdict = parse_verdict(
            "thinking...\n{\"isComplete\":false}\n{\"isComplete\":true,\"feedback\":\"ok\"}\n",
        )
        .expect("verdict");
        assert!(verdict.is_complete);
        assert_eq!(verdict.feedback, "ok");
    }

    #[test]
    fn parse_verdict_rejects_garbage() {
        let err = parse_verdict("nope").unwrap_err();
        assert!(err.to_string().contains("no verdict"));
    }

    #[test]
    fn from_config_requires_command_mode() {
        assert!(CommandEvaluator::from_config(&EvaluatorConfig::default()).is_none());
        let cfg = EvaluatorConfig {
            mode: EvaluatorMode::Command,
            command: vec!["judge".to_string()],
            timeout_secs: 9,
        };
        let evaluator = CommandEvaluator::from_config(&cfg).expect("evaluator");
        assert_eq!(evaluator.timeout, Duration::from_secs(9));
    }

    #[tokio::test]
    async fn command_receives_request_on_stdin() {
        let evaluator = sh(
            r#"input=$(cat); case "$input" in *'"sessionID":"ses_1"'*) echo '{"isComplete":true,"feedback":"seen"}';; *) echo '{"isComplete":false}';; esac"#,
        );
        let verdict = evaluator.evaluate(&request()).await.expect("verdict");
        assert!(verdict.is_complete);
        assert_eq!(verdict.feedback, "seen");
    }

    #[tokio::test]
    async fn failing_command_is_an_error() {
        let evaluator = sh("cat >/dev/null; echo broken >&2; exit 3");
        let err = evaluator.evaluate(&request()).await.unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let evaluator = CommandEvaluator::new(
            vec!["sh".to_string(), "-c".to_string(), "sleep 5".to_string()],
            Duration::from_millis(100),
        );
        let err = evaluator.evaluate(&request()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
