//! Stable exit codes for brain CLI commands.

/// Command succeeded or the session ended DONE.
pub const OK: i32 = 0;
/// Invalid input, configuration or authentication, or any unexpected error.
pub const INVALID: i32 = 1;
/// The session ended ABORTED (refusal, declined confirmation, model failure).
pub const ABORTED: i32 = 2;
/// `brain resume` stopped at a failing command block.
pub const HALTED: i32 = 3;
