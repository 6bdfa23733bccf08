//! Stable exit codes for warden CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid config, unreachable state, or any other error.
pub const ERROR: i32 = 1;
/// `warden clear` found nothing to clear, or the user declined.
pub const NOTHING_DONE: i32 = 2;
