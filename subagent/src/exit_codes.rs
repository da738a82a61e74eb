//! Stable exit codes for `subagent` CLI commands.

use crate::core::types::ScopeStatus;

/// Command succeeded; for `run`, the scope ended with SUCCESS.
pub const OK: i32 = 0;
/// Invalid input: unreadable or invalid scope file, config or fixture.
pub const INVALID: i32 = 1;
/// The scope ended with ERROR.
pub const ERROR: i32 = 2;
/// The scope ran out of turns or time.
pub const TIMEOUT: i32 = 3;
/// The scope was cancelled (Ctrl-C or forced termination).
pub const INTERRUPTED: i32 = 4;

/// Exit code for a finished scope.
pub fn for_status(status: ScopeStatus) -> i32 {
    match status {
        ScopeStatus::Success => OK,
        ScopeStatus::Timeout => TIMEOUT,
        ScopeStatus::Interrupted => INTERRUPTED,
        ScopeStatus::Error | ScopeStatus::Initialized | ScopeStatus::Executing => ERROR,
    }
}
