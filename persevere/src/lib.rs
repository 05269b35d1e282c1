//! Keeps a coding agent working across turns.
//!
//! Two schedulers react to host session events:
//!
//! - **[`todo`]**: when a session idles with unfinished todo items, count down
//!   and send a continuation prompt unless the user acts first.
//! - **[`iteration`]**: a bounded loop, persisted to disk, that asks a
//!   completion evaluator after every idle turn and feeds its verdict back as
//!   the next prompt.
//!
//! [`dispatch`] routes host events to both. The layering follows a strict
//! split: **[`core`]** holds pure logic, **[`io`]** every side effect (files,
//! the host runtime, the evaluator command), isolated behind traits so tests
//! can script them.

pub mod core;
pub mod delivery;
pub mod dispatch;
pub mod exit_codes;
pub mod io;
pub mod iteration;
pub mod logging;
pub mod notify;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod todo;
