//! Stable exit codes for waypoint CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid input, state, config, or other errors.
pub const INVALID: i32 = 1;
/// The mission reached a terminal state: every task completed, failed, or
/// was skipped.
pub const COMPLETE: i32 = 2;
/// Non-terminal tasks remain but none can run (failed or skipped
/// dependencies).
pub const BLOCKED: i32 = 3;
/// The session suspended on a question or an approval; resume with
/// `answer` or `approve`.
pub const AWAITING_INPUT: i32 = 4;
