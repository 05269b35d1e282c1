//! Deterministic, pure logic shared by the schedulers.
//!
//! Core modules are free of I/O side effects. They operate on in-memory data
//! and return deterministic outputs suitable for tests.

pub mod codename;
pub mod echo;
pub mod loop_tag;
pub mod todos;
pub mod types;
