//! One relay direction: an input descriptor copied to an output descriptor

use crate::latch::{Completion, CompletionLatch};
use crate::transfer::{self, Readiness, TransferError};
use crate::{RelayError, DEFAULT_BUFFER_SIZE, MAX_BUFFER_SIZE};
use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use tracing::{debug, warn};

/// Upper bound on chunks forwarded after cancellation
const MAX_DRAIN_CHUNKS: usize = 64;

/// How a link moves bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    /// Splice when the platform supports it and either end is a pipe,
    /// otherwise read/write
    #[default]
    Auto,

    /// Always use the read/write loop
    Copy,
}

/// Why a link stopped. Error codes are raw `errno` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// Input reached end of file
    Eof,

    /// Reading a PTY master failed with `EIO`: every slave descriptor closed
    Hangup,

    /// Stopped by [`RunningRelay::shutdown`](crate::RunningRelay::shutdown)
    Cancelled,

    ReadFailed { errno: i32 },
    WriteFailed { errno: i32 },
    ShortWrite { expected: usize, written: usize },
    SpliceFailed { errno: i32 },
    PollFailed { errno: i32 },
}

impl LinkOutcome {
    /// Orderly endings are EOF, hang-up and cancellation
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Eof | Self::Hangup | Self::Cancelled)
    }
}

impl fmt::Display for LinkOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eof => f.write_str("end of input"),
            Self::Hangup => f.write_str("terminal hung up"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::ReadFailed { errno } => write!(f, "read error: {}", os_error(*errno)),
            Self::WriteFailed { errno } => write!(f, "write error: {}", os_error(*errno)),
            Self::ShortWrite { expected, written } => {
                write!(f, "short write: {written} of {expected} bytes")
            }
            Self::SpliceFailed { errno } => write!(f, "splice error: {}", os_error(*errno)),
            Self::PollFailed { errno } => write!(f, "poll error: {}", os_error(*errno)),
        }
    }
}

/// Final state of one link after its worker exited
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkReport {
    pub label: String,
    pub bytes: u64,
    pub outcome: LinkOutcome,
}

/// A single unidirectional copy path.
///
/// The link owns duplicates of its descriptors, so closing the originals
/// never pulls a descriptor out from under a running worker.
#[derive(Debug)]
pub struct RelayLink {
    label: String,
    input: File,
    output: File,
    input_fd: RawFd,
    output_fd: RawFd,
    buffer_size: usize,
    mode: TransferMode,
    drain_on_cancel: bool,
    nonblocking_output: bool,
}

impl RelayLink {
    /// Create a link copying `input` to `output`
    pub fn new(
        label: impl Into<String>,
        input: BorrowedFd<'_>,
        output: BorrowedFd<'_>,
    ) -> Result<Self, RelayError> {
        Ok(Self {
            label: label.into(),
            input: duplicate(input)?,
            output: duplicate(output)?,
            input_fd: input.as_raw_fd(),
            output_fd: output.as_raw_fd(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            mode: TransferMode::Auto,
            drain_on_cancel: false,
            nonblocking_output: false,
        })
    }

    /// Set the chunk size, clamped to `1..=MAX_BUFFER_SIZE`
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.clamp(1, MAX_BUFFER_SIZE);
        self
    }

    pub fn transfer_mode(mut self, mode: TransferMode) -> Self {
        self.mode = mode;
        self
    }

    /// Forward whatever input is immediately available when cancelled
    pub fn drain_on_cancel(mut self, drain: bool) -> Self {
        self.drain_on_cancel = drain;
        self
    }

    /// Put the output in non-blocking mode and wait for room alongside the
    /// cancellation pipe, so a full output cannot keep the worker alive after
    /// cancellation. A partial write then waits for room and carries on.
    ///
    /// `O_NONBLOCK` belongs to the open file description, so only use this
    /// on an output whose other users can cope with it.
    pub fn nonblocking_output(mut self, nonblocking: bool) -> Self {
        self.nonblocking_output = nonblocking;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether this link will use the zero-copy path
    pub fn uses_splice(&self) -> bool {
        self.mode == TransferMode::Auto
            && transfer::SPLICE_AVAILABLE
            && (transfer::is_pipe(&self.input) || transfer::is_pipe(&self.output))
    }

    /// Worker body: copy until EOF, error or cancellation, then signal the
    /// latch exactly once.
    pub(crate) fn run(mut self, cancel: BorrowedFd<'_>, latch: &CompletionLatch) -> LinkReport {
        let mut pump = Pump {
            buf: Vec::new(),
            splice: self.uses_splice(),
            bytes: 0,
        };
        if !pump.splice {
            pump.buf = vec![0u8; self.buffer_size];
        }
        if self.nonblocking_output {
            if let Err(errno) = transfer::set_nonblocking(self.output.as_fd()) {
                warn!(
                    link = %self.label,
                    fd = self.output_fd,
                    errno = errno as i32,
                    "Failed to make output non-blocking, writes may outlast cancellation"
                );
                self.nonblocking_output = false;
            }
        }

        debug!(
            link = %self.label,
            input_fd = self.input_fd,
            output_fd = self.output_fd,
            splice = pump.splice,
            "relay link started"
        );

        let outcome = self.relay(&mut pump, cancel);
        self.log_outcome(outcome, pump.bytes);

        latch.signal(Completion {
            label: self.label.clone(),
            outcome,
        });

        LinkReport {
            label: self.label,
            bytes: pump.bytes,
            outcome,
        }
    }

    fn relay(&mut self, pump: &mut Pump, cancel: BorrowedFd<'_>) -> LinkOutcome {
        loop {
            match transfer::wait_readable(self.input.as_fd(), cancel) {
                Ok(Readiness::Ready) => {}
                Ok(Readiness::Cancelled) => return self.drain(pump, cancel),
                Err(errno) => {
                    return LinkOutcome::PollFailed {
                        errno: errno as i32,
                    }
                }
            }

            if let Some(outcome) = self.step(pump, cancel) {
                return outcome;
            }
        }
    }

    /// Forward what is already readable. The output wait sees the closed
    /// cancellation pipe at once, so a full output stops the drain.
    fn drain(&mut self, pump: &mut Pump, cancel: BorrowedFd<'_>) -> LinkOutcome {
        if !self.drain_on_cancel {
            return LinkOutcome::Cancelled;
        }

        for _ in 0..MAX_DRAIN_CHUNKS {
            match transfer::input_pending(self.input.as_fd()) {
                Ok(true) => {}
                Ok(false) => break,
                Err(errno) => {
                    return LinkOutcome::PollFailed {
                        errno: errno as i32,
                    }
                }
            }

            if let Some(outcome) = self.step(pump, cancel) {
                return outcome;
            }
        }
        LinkOutcome::Cancelled
    }

    /// Move one chunk; `Some` ends the link.
    fn step(&mut self, pump: &mut Pump, cancel: BorrowedFd<'_>) -> Option<LinkOutcome> {
        if pump.splice {
            self.splice_step(pump, cancel)
        } else {
            self.copy_step(pump, cancel)
        }
    }

    fn splice_step(&mut self, pump: &mut Pump, cancel: BorrowedFd<'_>) -> Option<LinkOutcome> {
        let moved =
            transfer::splice_chunk(self.input.as_fd(), self.output.as_fd(), self.buffer_size);

        match moved {
            Ok(0) => Some(LinkOutcome::Eof),
            Ok(n) => {
                pump.bytes += n as u64;
                None
            }
            Err(TransferError::Splice(libc::EINVAL)) => {
                // Nothing moved; the read/write loop carries on from here.
                debug!(link = %self.label, "splice refused, falling back to read/write");
                pump.splice = false;
                pump.buf = vec![0u8; self.buffer_size];
                None
            }
            // Either end would block. Nothing moved, so go back to polling.
            Err(TransferError::Splice(libc::EAGAIN)) if self.nonblocking_output => {
                self.wait_for_room(cancel)
            }
            Err(TransferError::Splice(libc::EAGAIN)) => None,
            Err(err) => Some(failure(err)),
        }
    }

    /// Read one chunk and write all of it. A blocking output must take the
    /// whole chunk in one call; a non-blocking one is written in pieces as
    /// room appears.
    fn copy_step(&mut self, pump: &mut Pump, cancel: BorrowedFd<'_>) -> Option<LinkOutcome> {
        let n = match transfer::read_chunk(&mut self.input, &mut pump.buf) {
            Ok(0) => return Some(LinkOutcome::Eof),
            Ok(n) => n,
            // Readiness went stale on a non-blocking input
            Err(TransferError::Read(libc::EAGAIN)) => return None,
            Err(err) => return Some(failure(err)),
        };

        let mut written = 0;
        while written < n {
            match transfer::write_chunk(&mut self.output, &pump.buf[written..n]) {
                Ok(count) => {
                    written += count;
                    pump.bytes += count as u64;
                    if count == 0 || (written < n && !self.nonblocking_output) {
                        return Some(LinkOutcome::ShortWrite {
                            expected: n,
                            written,
                        });
                    }
                }
                Err(TransferError::Write(libc::EAGAIN)) if self.nonblocking_output => {
                    if let Some(outcome) = self.wait_for_room(cancel) {
                        return Some(outcome);
                    }
                }
                Err(err) => return Some(failure(err)),
            }
        }
        None
    }

    /// Wait until the output can take more bytes; `Some` ends the link.
    fn wait_for_room(&self, cancel: BorrowedFd<'_>) -> Option<LinkOutcome> {
        match transfer::wait_writable(self.output.as_fd(), cancel) {
            Ok(Readiness::Ready) => None,
            Ok(Readiness::Cancelled) => Some(LinkOutcome::Cancelled),
            Err(errno) => Some(LinkOutcome::PollFailed {
                errno: errno as i32,
            }),
        }
    }

    fn log_outcome(&self, outcome: LinkOutcome, bytes: u64) {
        match outcome {
            LinkOutcome::Eof | LinkOutcome::Hangup | LinkOutcome::Cancelled => {
                debug!(link = %self.label, bytes, %outcome, "relay link finished");
            }
            LinkOutcome::ReadFailed { errno } | LinkOutcome::PollFailed { errno } => {
                warn!(link = %self.label, fd = self.input_fd, errno, %outcome, "relay link failed");
            }
            LinkOutcome::WriteFailed { errno } => {
                warn!(link = %self.label, fd = self.output_fd, errno, %outcome, "relay link failed");
            }
            LinkOutcome::ShortWrite { .. } => {
                warn!(link = %self.label, fd = self.output_fd, %outcome, "relay link failed");
            }
            LinkOutcome::SpliceFailed { errno } => {
                warn!(
                    link = %self.label,
                    input_fd = self.input_fd,
                    output_fd = self.output_fd,
                    errno,
                    %outcome,
                    "relay link failed"
                );
            }
        }
    }
}

/// Per-worker transfer state
struct Pump {
    buf: Vec<u8>,
    splice: bool,
    bytes: u64,
}

fn failure(err: TransferError) -> LinkOutcome {
    match err {
        TransferError::Read(libc::EIO) | TransferError::Splice(libc::EIO) => LinkOutcome::Hangup,
        TransferError::Read(errno) => LinkOutcome::ReadFailed { errno },
        TransferError::Write(errno) => LinkOutcome::WriteFailed { errno },
        TransferError::Splice(errno) => LinkOutcome::SpliceFailed { errno },
    }
}

fn duplicate(fd: BorrowedFd<'_>) -> Result<File, RelayError> {
    fd.try_clone_to_owned()
        .map(File::from)
        .map_err(|source| RelayError::Duplicate {
            fd: fd.as_raw_fd(),
            source,
        })
}

fn os_error(errno: i32) -> io::Error {
    io::Error::from_raw_os_error(errno)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;
    use std::io::{Read, Write};

    #[test]
    fn test_outcome_classification() {
        assert!(!LinkOutcome::Eof.is_error());
        assert!(!LinkOutcome::Hangup.is_error());
        assert!(!LinkOutcome::Cancelled.is_error());
        assert!(LinkOutcome::ReadFailed { errno: libc::EBADF }.is_error());
        assert!(LinkOutcome::ShortWrite {
            expected: 4,
            written: 2
        }
        .is_error());
    }

    #[test]
    fn test_outcome_display() {
        let outcome = LinkOutcome::WriteFailed {
            errno: libc::EPIPE,
        };
        assert!(outcome.to_string().starts_with("write error"));
        assert_eq!(
            LinkOutcome::ShortWrite {
                expected: 10,
                written: 3
            }
            .to_string(),
            "short write: 3 of 10 bytes"
        );
    }

    #[test]
    fn test_buffer_size_clamped() {
        let (read, write) = pipe().unwrap();
        let link = RelayLink::new("up", read.as_fd(), write.as_fd()).unwrap();
        assert_eq!(link.buffer_size(0).buffer_size, 1);

        let link = RelayLink::new("up", read.as_fd(), write.as_fd()).unwrap();
        assert_eq!(link.buffer_size(usize::MAX).buffer_size, MAX_BUFFER_SIZE);
    }

    #[test]
    fn test_copy_mode_never_splices() {
        let (read, write) = pipe().unwrap();
        let link = RelayLink::new("up", read.as_fd(), write.as_fd())
            .unwrap()
            .transfer_mode(TransferMode::Copy);
        assert!(!link.uses_splice());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_auto_mode_splices_pipes() {
        let (read, write) = pipe().unwrap();
        let link = RelayLink::new("up", read.as_fd(), write.as_fd()).unwrap();
        assert!(link.uses_splice());
    }

    #[test]
    fn test_link_survives_closed_originals() {
        let (in_read, in_write) = pipe().unwrap();
        let (out_read, out_write) = pipe().unwrap();
        let link = RelayLink::new("down", in_read.as_fd(), out_write.as_fd())
            .unwrap()
            .transfer_mode(TransferMode::Copy);
        drop(in_read);
        drop(out_write);

        File::from(in_write).write_all(b"still here").unwrap();

        let (cancel_read, _cancel_write) = pipe().unwrap();
        let latch = CompletionLatch::new();
        let report = link.run(cancel_read.as_fd(), &latch);

        assert_eq!(report.outcome, LinkOutcome::Eof);
        assert_eq!(report.bytes, 10);
        assert!(latch.is_set());

        let mut copied = String::new();
        File::from(out_read).read_to_string(&mut copied).unwrap();
        assert_eq!(copied, "still here");
    }
}
