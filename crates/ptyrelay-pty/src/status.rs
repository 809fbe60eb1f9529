//! Translation of a child's wait status into a process exit code

use nix::sys::wait::WaitStatus;

/// Offset added to a signal number, as shells report signalled children
pub const SIGNAL_EXIT_BASE: i32 = 128;

/// Map a wait status onto the exit code the tool itself returns.
///
/// Normal exit passes the code through, termination or stop by a signal
/// yields `128 + signal`, anything else yields `1`.
pub fn exit_code(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, sig, _) => SIGNAL_EXIT_BASE + sig as i32,
        WaitStatus::Stopped(_, sig) => SIGNAL_EXIT_BASE + sig as i32,
        _ => 1,
    }
}
