//! Todo list accounting used by the continuation scheduler.

use crate::core::types::Todo;

/// Counts derived from a fresh todo fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TodoSummary {
    pub incomplete: usize,
    pub total: usize,
}

impl TodoSummary {
    pub fn completed(&self) -> usize {
        self.total - self.incomplete
    }
}

pub fn summarize(todos: &[Todo]) -> TodoSummary {
    TodoSummary {
        incomplete: todos.iter().filter(|t| t.status.is_incomplete()).count(),
        total: todos.len(),
    }
}

/// Incomplete items in host order.
pub fn incomplete_todos(todos: &[Todo]) -> Vec<&Todo> {
    todos.iter().filter(|t| t.status.is_incomplete()).collect()
}
