//! PTY (Pseudo-Terminal) handling for ptyrelay
//!
//! Allocates a master/slave pair, launches a child process with the slave as
//! its controlling terminal, and reports the child's exit status.

pub mod child;
pub mod pty;
pub mod status;

pub use child::{stderr_pipe, ChildCommand, LaunchError, StderrRoute};
pub use pty::{Pty, PtySession};
pub use status::exit_code;

use nix::errno::Errno;
use thiserror::Error;

/// Exit status used when the session cannot produce a child status, and by a
/// child that fails to launch.
pub const LAUNCH_FAILURE_EXIT: i32 = 255;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open PTY master: {0}")]
    OpenFailed(Errno),

    #[error("Failed to grant PTY slave: {0}")]
    GrantFailed(Errno),

    #[error("Failed to unlock PTY slave: {0}")]
    UnlockFailed(Errno),

    #[error("Failed to resolve PTY slave name: {0}")]
    SlaveNameFailed(Errno),

    #[error("Failed to create pipe: {0}")]
    PipeFailed(Errno),

    #[error("Fork failed: {0}")]
    ForkFailed(Errno),

    #[error("Failed to wait for child: {0}")]
    WaitFailed(Errno),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("PTY I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
