//! Prompt texts injected into sessions, rendered from embedded templates.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::todos::{incomplete_todos, summarize};
use crate::core::types::{Todo, Verdict};
use crate::io::loop_state::LoopState;

const TODO_CONTINUATION_TEMPLATE: &str = include_str!("../prompts/todo_continuation.md");
const ITERATION_CONTINUATION_TEMPLATE: &str = include_str!("../prompts/iteration_continuation.md");
const LOOP_STARTED_TEMPLATE: &str = include_str!("../prompts/loop_started.md");

#[derive(Debug, Clone, Serialize)]
struct TodoLine<'a> {
    status: &'static str,
    content: &'a str,
}

/// Template engine wrapper around minijinja.
pub struct PromptRenderer {
    env: Environment<'static>,
}

impl Default for PromptRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("todo_continuation", TODO_CONTINUATION_TEMPLATE)
            .expect("todo continuation template should be valid");
        env.add_template("iteration_continuation", ITERATION_CONTINUATION_TEMPLATE)
            .expect("iteration continuation template should be valid");
        env.add_template("loop_started", LOOP_STARTED_TEMPLATE)
            .expect("loop started template should be valid");
        Self { env }
    }

    /// Continuation listing the currently incomplete todos, numbered in host order.
    pub fn todo_continuation(&self, todos: &[Todo], help_agent: Option<&str>) -> Result<String> {
        let summary = summarize(todos);
        let lines: Vec<TodoLine<'_>> = incomplete_todos(todos)
            .into_iter()
            .map(|todo| TodoLine {
                status: todo.status.as_str(),
                content: todo.content.trim(),
            })
            .collect();
        let template = self.env.get_template("todo_continuation")?;
        let rendered = template.render(context! {
            incomplete => summary.incomplete,
            completed => summary.completed(),
            total => summary.total,
            todos => lines,
            help_agent => help_agent.map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }

    /// Continuation for the next loop iteration, carrying the evaluator's feedback.
    pub fn iteration_continuation(&self, state: &LoopState, verdict: &Verdict) -> Result<String> {
        let missing: Vec<&str> = verdict
            .missing_items
            .iter()
            .map(|item| item.trim())
            .filter(|item| !item.is_empty())
            .collect();
        let template = self.env.get_template("iteration_continuation")?;
        let rendered = template.render(context! {
            codename => state.completion_marker,
            iteration => state.iteration,
            max_iterations => state.max_iterations,
            feedback => (!verdict.feedback.trim().is_empty()).then(|| verdict.feedback.trim()),
            missing_items => missing,
            prompt => state.prompt.trim(),
        })?;
        Ok(rendered)
    }

    /// Rewritten user prompt announcing a freshly started loop.
    pub fn loop_started(&self, state: &LoopState, remainder: &str) -> Result<String> {
        let template = self.env.get_template("loop_started")?;
        let rendered = template.render(context! {
            codename => state.completion_marker,
            max_iterations => state.max_iterations,
            remainder => (!remainder.trim().is_empty()).then(|| remainder.trim()),
            task => state.prompt.trim(),
        })?;
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{TodoPriority, TodoStatus};

    fn todo(content: &str, status: TodoStatus) -> Todo {
        Todo {
            id: content.to_string(),
            content: content.to_string(),
            status,
            priority: TodoPriority::Medium,
        }
    }

    fn state() -> LoopState {
        LoopState {
            active: true,
            iteration: 2,
            max_iterations: 5,
            completion_marker: "QUIET_OTTER".to_string(),
            started_at: String::new(),
            session_id: "s1".to_string(),
            prompt: "Port the parser".to_string(),
        }
    }

    #[test]
    fn todo_continuation_numbers_incomplete_items_with_status() {
        let renderer = PromptRenderer::new();
        let text = renderer
            .todo_continuation(
                &[
                    todo("write tests", TodoStatus::Completed),
                    todo("fix bug", TodoStatus::InProgress),
                    todo("update docs", TodoStatus::Pending),
                ],
                None,
            )
            .expect("render");
        assert!(text.contains("2 unfinished tasks (1/3 done)"));
        assert!(text.contains("1. [in_progress] fix bug\n2. [pending] update docs\n"));
        assert!(!text.contains("write tests"));
        assert!(text.contains("without asking for permission"));
        assert!(!text.contains("agent for help"));
        assert!(!text.contains("delegate"));
    }

    #[test]
    fn todo_continuation_appends_help_hint() {
        let renderer = PromptRenderer::new();
        let text = renderer
            .todo_continuation(&[todo("one", TodoStatus::Pending)], Some("oracle"))
            .expect("render");
        assert!(text.contains("1 unfinished task (0/1 done)"));
        assert!(text.contains("`oracle` agent"));
    }

    #[test]
    fn iteration_continuation_embeds_feedback_and_missing_items() {
        let renderer = PromptRenderer::new();
        let verdict = Verdict {
            is_complete: false,
            feedback: "Error paths untested.".to_string(),
            missing_items: vec!["tests for EOF".to_string(), " ".to_string()],
            confidence: Some(0.4),
        };
        let text = renderer
            .iteration_continuation(&state(), &verdict)
            .expect("render");
        assert!(text.starts_with("[ITERATION LOOP QUIET_OTTER - ITERATION 2/5]"));
        assert!(text.contains("Feedback:\nError paths untested."));
        assert!(text.contains("Still missing:\n- tests for EOF\n\nOriginal task:"));
        assert!(text.contains("Original task:\nPort the parser"));
    }

    #[test]
    fn iteration_continuation_omits_empty_sections() {
        let renderer = PromptRenderer::new();
        let text = renderer
            .iteration_continuation(&state(), &Verdict::default())
            .expect("render");
        assert!(!text.contains("Feedback:"));
        assert!(!text.contains("Still missing:"));
    }

    #[test]
    fn loop_started_names_codename_and_task() {
        let renderer = PromptRenderer::new();
        let text = renderer
            .loop_started(&state(), "Context: see README")
            .expect("render");
        assert!(text.contains("QUIET_OTTER STARTED - up to 5 iterations"));
        assert!(text.contains("Context: see README"));
        assert!(text.ends_with("Task:\nPort the parser"));
    }
}
