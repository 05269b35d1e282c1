//! Persisted iteration loop record (`.persevere/loop-state.md`).
//!
//! The file is a frontmatter header of `key: value` lines followed by the
//! original task prompt verbatim:
//!
//! ```text
//! ---
//! active: true
//! iteration: 2
//! max_iterations: 10
//! completion_marker: "SILENT_HARBOR"
//! session_id: "ses_123"
//! started_at: "2026-01-01T00:00:00.000Z"
//! ---
//!
//! Fix the flaky tests.
//! ```
//!
//! A file that cannot be read or parsed is reported as "no loop" rather than
//! an error, so a corrupted record never wedges the state machine.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, warn};

/// The single persisted iteration loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopState {
    pub active: bool,
    /// 1-indexed; never exceeds `max_iterations`.
    pub iteration: u32,
    pub max_iterations: u32,
    /// Codename of this run. Display only.
    pub completion_marker: String,
    /// RFC 3339 timestamp.
    pub started_at: String,
    /// Session that owns the loop. Events from other sessions are ignored.
    pub session_id: String,
    /// Original task text, reused in every continuation prompt.
    pub prompt: String,
}

impl LoopState {
    /// A fresh active loop at iteration 1.
    pub fn start(session_id: &str, prompt: &str, max_iterations: u32, codename: &str) -> Self {
        Self {
            active: true,
            iteration: 1,
            max_iterations,
            completion_marker: codename.to_string(),
            started_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            session_id: session_id.to_string(),
            prompt: prompt.to_string(),
        }
    }

    /// Whether `other` describes the same run (not just the same session).
    pub fn same_run(&self, other: &LoopState) -> bool {
        self.session_id == other.session_id
            && self.completion_marker == other.completion_marker
            && self.started_at == other.started_at
    }
}

/// Storage seam for the loop record. Implementations must normalize corrupt
/// data to `Ok(None)`.
pub trait LoopStateStore: Send + Sync {
    fn read(&self) -> Result<Option<LoopState>>;
    fn write(&self, state: &LoopState) -> Result<()>;
    /// Remove the record. Returns whether one existed.
    fn clear(&self) -> Result<bool>;
    /// Bump `iteration` by one and persist. `Ok(None)` when no record exists.
    fn increment_iteration(&self) -> Result<Option<LoopState>>;
}

/// File-backed store bound to one path.
#[derive(Debug, Clone)]
pub struct FileLoopStore {
    path: PathBuf,
}

impl FileLoopStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LoopStateStore for FileLoopStore {
    fn read(&self) -> Result<Option<LoopState>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "unreadable loop state, treating as absent");
                return Ok(None);
            }
        };
        let state = parse_loop_state(&contents);
        if state.is_none() {
            warn!(path = %self.path.display(), "malformed loop state, treating as absent");
        }
        Ok(state)
    }

    fn write(&self, state: &LoopState) -> Result<()> {
        debug!(
            path = %self.path.display(),
            session_id = %state.session_id,
            iteration = state.iteration,
            "writing loop state"
        );
        super::write_atomic(&self.path, &render_loop_state(state))
    }

    fn clear(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "cleared loop state");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => {
                Err(err).with_context(|| format!("remove loop state {}", self.path.display()))
            }
        }
    }

    fn increment_iteration(&self) -> Result<Option<LoopState>> {
        let Some(mut state) = self.read()? else {
            return Ok(None);
        };
        state.iteration += 1;
        self.write(&state)?;
        Ok(Some(state))
    }
}

/// In-memory store for embedding without persistence, and for tests.
#[derive(Debug, Default)]
pub struct MemoryLoopStore {
    state: Mutex<Option<LoopState>>,
}

impl MemoryLoopStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<LoopState>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl LoopStateStore for MemoryLoopStore {
    fn read(&self) -> Result<Option<LoopState>> {
        Ok(self.lock().clone())
    }

    fn write(&self, state: &LoopState) -> Result<()> {
        *self.lock() = Some(state.clone());
        Ok(())
    }

    fn clear(&self) -> Result<bool> {
        Ok(self.lock().take().is_some())
    }

    fn increment_iteration(&self) -> Result<Option<LoopState>> {
        let mut guard = self.lock();
        Ok(guard.as_mut().map(|state| {
            state.iteration += 1;
            state.clone()
        }))
    }
}

/// Serialize a loop record to its on-disk form.
pub fn render_loop_state(state: &LoopState) -> String {
    let mut buf = String::new();
    buf.push_str("---\n");
    buf.push_str(&format!("active: {}\n", state.active));
    buf.push_str(&format!("iteration: {}\n", state.iteration));
    buf.push_str(&format!("max_iterations: {}\n", state.max_iterations));
    buf.push_str(&format!(
        "completion_marker: {}\n",
        quote(&state.completion_marker)
    ));
    buf.push_str(&format!("session_id: {}\n", quote(&state.session_id)));
    buf.push_str(&format!("started_at: {}\n", quote(&state.started_at)));
    buf.push_str("---\n\n");
    buf.push_str(&state.prompt);
    buf.push('\n');
    buf
}

/// Parse the on-disk form. Returns `None` for anything malformed.
pub fn parse_loop_state(contents: &str) -> Option<LoopState> {
    let (header, body) = split_frontmatter(contents)?;
    let mut fields = HashMap::new();
    for line in header.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let (key, value) = trimmed.split_once(':')?;
        fields.insert(key.trim(), unquote(value.trim())?);
    }

    let active = match fields.get("active")?.as_str() {
        "true" => true,
        "false" => false,
        _ => return None,
    };
    let iteration: u32 = fields.get("iteration")?.parse().ok()?;
    let max_iterations: u32 = fields.get("max_iterations")?.parse().ok()?;
    let session_id = fields.get("session_id")?.clone();
    if iteration == 0 || max_iterations == 0 || session_id.is_empty() {
        return None;
    }

    let body = body.strip_prefix('\n').unwrap_or(body);
    let prompt = body.strip_suffix('\n').unwrap_or(body);

    Some(LoopState {
        active,
        iteration,
        max_iterations,
        completion_marker: fields.remove("completion_marker").unwrap_or_default(),
        started_at: fields.remove("started_at").unwrap_or_default(),
        session_id,
        prompt: prompt.to_string(),
    })
}

fn quote(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

fn unquote(value: &str) -> Option<String> {
    if value.starts_with('"') {
        return serde_json::from_str::<String>(value).ok();
    }
    if value.len() >= 2 && value.starts_with('\'') && value.ends_with('\'') {
        return Some(value[1..value.len() - 1].to_string());
    }
    Some(value.to_string())
}

/// Split a document into (frontmatter, rest).
fn split_frontmatter(contents: &str) -> Option<(&str, &str)> {
    let after = contents.strip_prefix("---\n")?;
    let end = after.find("\n---\n")?;
    Some((&after[..end], &after[end + 5..]))
}
