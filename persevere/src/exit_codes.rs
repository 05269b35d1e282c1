//! Stable exit codes for `persevere` CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid config, unreadable state, or any other error.
pub const INVALID: i32 = 1;
/// The loop operation was rejected (already active, none active, wrong session).
pub const REJECTED: i32 = 2;
