//! Byte relay between descriptors for ptyrelay
//!
//! One worker thread per direction copies bytes from an input descriptor to
//! an output descriptor. The first worker to finish releases the session
//! through a shared [`CompletionLatch`]; the rest are cancelled and joined by
//! [`RunningRelay::shutdown`].

pub mod engine;
pub mod latch;
pub mod link;
mod transfer;

pub use engine::{RelayEngine, RelayReport, RunningRelay};
pub use latch::{Completion, CompletionLatch};
pub use link::{LinkOutcome, LinkReport, RelayLink, TransferMode};

use nix::errno::Errno;
use std::os::unix::io::RawFd;
use thiserror::Error;

/// Bytes moved per read/write or splice call
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Largest accepted buffer size
pub const MAX_BUFFER_SIZE: usize = 1 << 20;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Failed to duplicate fd {fd}: {source}")]
    Duplicate {
        fd: RawFd,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create cancellation pipe: {0}")]
    CancelPipe(Errno),

    #[error("Failed to spawn relay worker {label}: {source}")]
    Spawn {
        label: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No relay links configured")]
    NoLinks,
}
