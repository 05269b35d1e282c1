//! Host runtime abstraction.
//!
//! The [`Host`] trait is everything the schedulers need from the process that
//! owns sessions, models and tools. The bridge binary implements it over a
//! line protocol; tests use a scripted host that records every call.

use anyhow::Result;
use async_trait::async_trait;

use crate::core::types::{PromptRequest, Toast, Todo, TranscriptEntry};

#[async_trait]
pub trait Host: Send + Sync {
    /// Current todo list of a session.
    async fn fetch_todos(&self, session_id: &str) -> Result<Vec<Todo>>;

    /// Append a prompt to a session.
    async fn send_prompt(&self, request: PromptRequest) -> Result<()>;

    /// Best effort; callers ignore failures.
    async fn show_toast(&self, toast: Toast) -> Result<()>;

    /// The last `limit` messages of a session, oldest first.
    async fn fetch_transcript(&self, session_id: &str, limit: usize)
    -> Result<Vec<TranscriptEntry>>;
}
