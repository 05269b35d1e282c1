//! Detection of the `<iterate>` tag in user-authored prompts.
//!
//! Syntax: `<iterate max="5">task body</iterate>`. The attribute is optional
//! (`max_iterations` is accepted as an alias) and the body may span lines.

use std::sync::LazyLock;

use regex::Regex;

static LOOP_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)<iterate(?:\s+max(?:_iterations)?\s*=\s*["']?(\d+)["']?)?\s*>(.*?)</iterate\s*>"#,
    )
    .expect("loop tag regex should be valid")
});

/// A loop request extracted from a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopTag {
    /// Trimmed task body.
    pub task: String,
    /// Explicit ceiling, if the tag carried one.
    pub max_iterations: Option<u32>,
    /// The prompt with the tag removed and trimmed.
    pub remainder: String,
}

/// Find the first loop tag in `prompt`. Tags with an empty body are ignored.
pub fn parse_loop_tag(prompt: &str) -> Option<LoopTag> {
    let caps = LOOP_TAG_RE.captures(prompt)?;
    let whole = caps.get(0)?;
    let task = caps.get(2)?.as_str().trim();
    if task.is_empty() {
        return None;
    }
    let max_iterations = caps
        .get(1)
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .filter(|max| *max > 0);

    let mut remainder = String::with_capacity(prompt.len());
    remainder.push_str(&prompt[..whole.start()]);
    remainder.push_str(&prompt[whole.end()..]);

    Some(LoopTag {
        task: task.to_string(),
        max_iterations,
        remainder: remainder.trim().to_string(),
    })
}
