//! Run a program on a pseudo-terminal and relay it to plain standard streams
//!
//! The child sees a real terminal on stdin, stdout and (optionally) stderr,
//! while the caller talks to it through whatever its own streams are: pipes,
//! files or another terminal.

pub mod cli;
pub mod session;
pub mod terminal_guard;

pub use session::{Session, SessionConfig, StderrMode};
pub use terminal_guard::{RawMode, TerminalGuard};
