//! Child-side launch sequence
//!
//! Everything in [`launch`] runs in the forked child, between `fork` and
//! `execvp`. Nothing on that path allocates, including the failure report,
//! so the parent may fork while other threads hold the allocator lock.

use crate::PtyError;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::setsid;
use std::ffi::{CStr, CString, OsStr};
use std::fmt::{self, Write};
use std::os::raw::c_char;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use thiserror::Error;

/// Where the child's standard error is connected
#[derive(Debug, Clone, Copy)]
pub enum StderrRoute<'fd> {
    /// Standard error shares the PTY slave with stdin and stdout
    Merged,

    /// Standard error goes to the write end of a pipe so it can be relayed
    /// separately from the terminal stream
    Separate {
        write: BorrowedFd<'fd>,
        read: BorrowedFd<'fd>,
    },
}

/// Pipe for [`StderrRoute::Separate`] as `(read, write)`.
///
/// Both ends are close-on-exec, so the child's `dup2` onto descriptor 2 is
/// the only copy that survives into the new program.
pub fn stderr_pipe() -> Result<(OwnedFd, OwnedFd), PtyError> {
    let (read, write) = nix::unistd::pipe().map_err(PtyError::PipeFailed)?;
    set_cloexec(read.as_raw_fd()).map_err(PtyError::PipeFailed)?;
    set_cloexec(write.as_raw_fd()).map_err(PtyError::PipeFailed)?;
    Ok((read, write))
}

pub(crate) fn set_cloexec(fd: RawFd) -> Result<(), Errno> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map(drop)
}

/// Program and argument vector, converted to C strings before forking
#[derive(Debug, Clone)]
pub struct ChildCommand {
    argv: Vec<CString>,
}

impl ChildCommand {
    /// Build from an argument vector whose first element is the program
    pub fn new<I, S>(argv: I) -> Result<Self, PtyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let argv = argv
            .into_iter()
            .map(|arg| {
                CString::new(arg.as_ref().as_bytes()).map_err(|_| {
                    PtyError::InvalidArgument(format!(
                        "argument contains NUL byte: {:?}",
                        arg.as_ref()
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if argv.is_empty() {
            return Err(PtyError::InvalidArgument("no program given".to_string()));
        }

        Ok(Self { argv })
    }

    /// The program, resolved through `PATH` at exec time
    pub fn program(&self) -> &CStr {
        &self.argv[0]
    }

    /// Full argument vector including the program name
    pub fn args(&self) -> &[CString] {
        &self.argv
    }

    /// NULL-terminated pointer array for `execvp`, valid while `self` lives
    pub(crate) fn argv_ptrs(&self) -> Vec<*const c_char> {
        self.argv
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect()
    }
}

impl fmt::Display for ChildCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.argv.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// A failed step of the child launch sequence
#[derive(Error, Debug)]
pub enum LaunchError<'a> {
    #[error("slave device path is empty")]
    EmptySlavePath,

    #[error("close(master fd {fd}) error: {errno}")]
    CloseMaster { fd: RawFd, errno: Errno },

    #[error("setsid() error: {0}")]
    NewSession(Errno),

    #[error("open({}) error: {errno}", .path.to_string_lossy())]
    OpenSlave { path: &'a CStr, errno: Errno },

    #[error("ioctl(TIOCSCTTY) error: {0}")]
    ControllingTerminal(Errno),

    #[error("dup2({from}, {to}) error: {errno}")]
    Redirect { from: RawFd, to: RawFd, errno: Errno },

    #[error("close(fd {fd}) error: {errno}")]
    CloseInherited { fd: RawFd, errno: Errno },

    #[error("execvp({}) error: {errno}", .program.to_string_lossy())]
    Exec { program: &'a CStr, errno: Errno },
}

/// Run the launch sequence. Only returns if a step failed.
pub(crate) fn launch<'a>(
    slave_path: &'a CStr,
    master: RawFd,
    command: &'a ChildCommand,
    argv: &[*const c_char],
    stderr: StderrRoute<'_>,
) -> LaunchError<'a> {
    if slave_path.to_bytes().is_empty() {
        return LaunchError::EmptySlavePath;
    }

    if let Err(errno) = close_fd(master) {
        return LaunchError::CloseMaster { fd: master, errno };
    }

    if let Err(errno) = setsid() {
        return LaunchError::NewSession(errno);
    }

    // SAFETY: slave_path is a valid NUL-terminated string
    let slave = unsafe { libc::open(slave_path.as_ptr(), libc::O_RDWR | libc::O_NOCTTY) };
    if slave < 0 {
        return LaunchError::OpenSlave {
            path: slave_path,
            errno: Errno::last(),
        };
    }

    // SAFETY: slave is an open terminal and this process is a session leader
    // without a controlling terminal.
    if unsafe { libc::ioctl(slave, libc::TIOCSCTTY, 0) } == -1 {
        return LaunchError::ControllingTerminal(Errno::last());
    }

    if let Err(err) = wire_stdio(slave, stderr) {
        return err;
    }

    // Rust runtimes ignore SIGPIPE; the new image expects the default.
    // SAFETY: restores a default disposition, no handler is installed
    let _ = unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigDfl) };

    // SAFETY: argv is a NULL-terminated array of pointers into `command`
    unsafe { libc::execvp(command.program().as_ptr(), argv.as_ptr()) };
    LaunchError::Exec {
        program: command.program(),
        errno: Errno::last(),
    }
}

fn wire_stdio(slave: RawFd, stderr: StderrRoute<'_>) -> Result<(), LaunchError<'static>> {
    redirect(slave, libc::STDIN_FILENO)?;
    redirect(slave, libc::STDOUT_FILENO)?;
    match stderr {
        StderrRoute::Merged => redirect(slave, libc::STDERR_FILENO)?,
        StderrRoute::Separate { write, read } => {
            redirect(write.as_raw_fd(), libc::STDERR_FILENO)?;
            close_inherited(read.as_raw_fd())?;
            close_inherited(write.as_raw_fd())?;
        }
    }
    close_inherited(slave)
}

/// Write `ptyrelay: <err>` to standard error without allocating.
pub(crate) fn report(err: &LaunchError<'_>) {
    let mut line = LineBuf::default();
    let _ = writeln!(line, "ptyrelay: {err}");
    let bytes = line.as_bytes();
    // SAFETY: bytes points to initialised memory of the given length
    unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
}

/// Fixed-size line buffer; output past its capacity is dropped.
struct LineBuf {
    buf: [u8; 512],
    len: usize,
}

impl Default for LineBuf {
    fn default() -> Self {
        Self {
            buf: [0; 512],
            len: 0,
        }
    }
}

impl LineBuf {
    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

fn redirect(from: RawFd, to: RawFd) -> Result<(), LaunchError<'static>> {
    // SAFETY: plain descriptor syscall
    if unsafe { libc::dup2(from, to) } == -1 {
        return Err(LaunchError::Redirect {
            from,
            to,
            errno: Errno::last(),
        });
    }
    Ok(())
}

/// Close a descriptor unless it is one of the standard streams.
fn close_inherited(fd: RawFd) -> Result<(), LaunchError<'static>> {
    if fd <= libc::STDERR_FILENO {
        return Ok(());
    }
    close_fd(fd).map_err(|errno| LaunchError::CloseInherited { fd, errno })
}

fn close_fd(fd: RawFd) -> Result<(), Errno> {
    // SAFETY: the child owns its copy of the descriptor table
    if unsafe { libc::close(fd) } == -1 {
        return Err(Errno::last());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_keeps_argv() {
        let cmd = ChildCommand::new(["sh", "-c", "exit 0"]).unwrap();
        assert_eq!(cmd.program().to_str().unwrap(), "sh");
        assert_eq!(cmd.args().len(), 3);
        assert_eq!(cmd.to_string(), "sh -c exit 0");
    }

    #[test]
    fn test_empty_argv_rejected() {
        let result = ChildCommand::new(Vec::<String>::new());
        assert!(matches!(result, Err(PtyError::InvalidArgument(_))));
    }

    #[test]
    fn test_nul_argument_rejected() {
        let result = ChildCommand::new(["echo", "a\0b"]);
        assert!(matches!(result, Err(PtyError::InvalidArgument(_))));
    }

    #[test]
    fn test_launch_error_messages_name_the_step() {
        let err = LaunchError::ControllingTerminal(Errno::EPERM);
        assert!(err.to_string().starts_with("ioctl(TIOCSCTTY)"));

        let program = CString::new("missing").unwrap();
        let err = LaunchError::Exec {
            program: &program,
            errno: Errno::ENOENT,
        };
        assert!(err.to_string().contains("execvp(missing)"));
    }

    #[test]
    fn test_argv_ptrs_null_terminated() {
        let cmd = ChildCommand::new(["ls", "-l"]).unwrap();
        let ptrs = cmd.argv_ptrs();
        assert_eq!(ptrs.len(), 3);
        assert!(ptrs[2].is_null());
    }

    #[test]
    fn test_stderr_pipe_is_cloexec() {
        let (read, write) = stderr_pipe().unwrap();
        for fd in [read.as_raw_fd(), write.as_raw_fd()] {
            let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD).unwrap());
            assert!(flags.contains(FdFlag::FD_CLOEXEC));
        }
    }

    #[test]
    fn test_line_buf_truncates() {
        let mut line = LineBuf::default();
        let long = "x".repeat(600);
        write!(line, "{long}").unwrap();
        assert_eq!(line.as_bytes().len(), 512);
    }
}
