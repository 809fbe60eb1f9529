//! Single-chunk transfers and readiness checks used by the link workers

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::{AsRawFd, BorrowedFd};

/// Why a chunk could not be moved. Codes are raw `errno` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferError {
    Read(i32),
    Write(i32),
    Splice(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    Ready,
    Cancelled,
}

/// Read one chunk. `Ok(0)` is end of input.
pub(crate) fn read_chunk(input: &mut File, buf: &mut [u8]) -> Result<usize, TransferError> {
    loop {
        match input.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::Read(errno_of(&e))),
        }
    }
}

/// One write call; the count may be short. A full non-blocking output
/// reports `Write(EAGAIN)`.
pub(crate) fn write_chunk(output: &mut File, data: &[u8]) -> Result<usize, TransferError> {
    loop {
        match output.write(data) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::Write(errno_of(&e))),
        }
    }
}

/// Move up to `len` bytes inside the kernel. `Ok(0)` is end of input.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn splice_chunk(
    input: BorrowedFd<'_>,
    output: BorrowedFd<'_>,
    len: usize,
) -> Result<usize, TransferError> {
    loop {
        // SAFETY: null offsets make splice use and advance the file positions
        let moved = unsafe {
            libc::splice(
                input.as_raw_fd(),
                std::ptr::null_mut(),
                output.as_raw_fd(),
                std::ptr::null_mut(),
                len,
                libc::SPLICE_F_MOVE | libc::SPLICE_F_MORE,
            )
        };
        if moved >= 0 {
            return Ok(moved as usize);
        }

        let err = io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(TransferError::Splice(errno_of(&err)));
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn splice_chunk(
    _input: BorrowedFd<'_>,
    _output: BorrowedFd<'_>,
    _len: usize,
) -> Result<usize, TransferError> {
    Err(TransferError::Splice(libc::EINVAL))
}

/// Whether the platform can move bytes between descriptors in the kernel
pub(crate) const SPLICE_AVAILABLE: bool = cfg!(any(target_os = "linux", target_os = "android"));

pub(crate) fn is_pipe(file: &File) -> bool {
    file.metadata()
        .map(|meta| meta.file_type().is_fifo())
        .unwrap_or(false)
}

/// Block until `input` has something to report or `cancel` fires.
///
/// Cancellation takes priority: a worker that sees both stops reading.
pub(crate) fn wait_readable(
    input: BorrowedFd<'_>,
    cancel: BorrowedFd<'_>,
) -> Result<Readiness, Errno> {
    wait_ready(input, PollFlags::POLLIN, cancel)
}

/// Block until `output` has room or `cancel` fires
pub(crate) fn wait_writable(
    output: BorrowedFd<'_>,
    cancel: BorrowedFd<'_>,
) -> Result<Readiness, Errno> {
    wait_ready(output, PollFlags::POLLOUT, cancel)
}

fn wait_ready(
    fd: BorrowedFd<'_>,
    interest: PollFlags,
    cancel: BorrowedFd<'_>,
) -> Result<Readiness, Errno> {
    let mut fds = [
        PollFd::new(fd, interest),
        PollFd::new(cancel, PollFlags::POLLIN),
    ];
    loop {
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }

        if fired(&fds[1]) {
            return Ok(Readiness::Cancelled);
        }
        if fired(&fds[0]) {
            return Ok(Readiness::Ready);
        }
    }
}

/// Non-blocking check used while draining after cancellation
pub(crate) fn input_pending(input: BorrowedFd<'_>) -> Result<bool, Errno> {
    let mut fds = [PollFd::new(input, PollFlags::POLLIN)];
    loop {
        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(fired(&fds[0])),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

// Any revents counts: POLLHUP and POLLERR are reported by the next read.
fn fired(fd: &PollFd<'_>) -> bool {
    fd.revents().map_or(false, |revents| !revents.is_empty())
}

/// Set `O_NONBLOCK` on the open file description behind `fd`, which every
/// duplicate shares.
pub(crate) fn set_nonblocking(fd: BorrowedFd<'_>) -> Result<(), Errno> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map(drop)
}

fn errno_of(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}
