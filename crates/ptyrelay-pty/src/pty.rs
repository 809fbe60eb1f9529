//! Low-level PTY allocation and management
//!
//! Provides the master/slave pair and the session that exists once a child
//! has been forked onto the slave side.

use crate::child::{self, ChildCommand, StderrRoute};
use crate::{status, PtyError, LAUNCH_FAILURE_EXIT};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, unlockpt, PtyMaster, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, IsTerminal};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// A freshly allocated pseudo-terminal pair
pub struct Pty {
    /// Master side, opened `O_RDWR | O_NOCTTY`
    master: OwnedFd,

    /// Device path of the granted and unlocked slave
    slave_path: PathBuf,
}

impl Pty {
    /// Allocate a new PTY pair
    pub fn open() -> Result<Self, PtyError> {
        let master =
            posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(PtyError::OpenFailed)?;
        grantpt(&master).map_err(PtyError::GrantFailed)?;
        unlockpt(&master).map_err(PtyError::UnlockFailed)?;
        let slave_path = PathBuf::from(slave_name(&master)?);

        // SAFETY: into_raw_fd hands over the only owner of an open descriptor
        let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
        child::set_cloexec(master.as_raw_fd()).map_err(PtyError::OpenFailed)?;

        debug!(
            master_fd = master.as_raw_fd(),
            slave = %slave_path.display(),
            "allocated pty"
        );

        Ok(Self { master, slave_path })
    }

    /// Device path of the slave side
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    /// Borrow the master descriptor
    pub fn master(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    /// Open the slave device read/write without acquiring it as controlling
    /// terminal.
    pub fn open_slave(&self) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(&self.slave_path)
    }

    /// Resize the PTY
    pub fn set_window_size(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        set_winsize(self.master.as_raw_fd(), &winsize)
    }

    /// Current PTY dimensions as `(rows, cols)`
    pub fn window_size(&self) -> Result<(u16, u16), PtyError> {
        let winsize = get_winsize(self.master.as_raw_fd())?;
        Ok((winsize.ws_row, winsize.ws_col))
    }

    /// Copy the window size of `fd` onto the PTY.
    ///
    /// Returns `false` without touching the PTY when `fd` is not a terminal
    /// or reports an empty size.
    pub fn inherit_window_size(&self, fd: BorrowedFd<'_>) -> Result<bool, PtyError> {
        if !fd.is_terminal() {
            return Ok(false);
        }

        let winsize = get_winsize(fd.as_raw_fd())?;
        if winsize.ws_row == 0 || winsize.ws_col == 0 {
            return Ok(false);
        }

        set_winsize(self.master.as_raw_fd(), &winsize)?;
        debug!(
            rows = winsize.ws_row,
            cols = winsize.ws_col,
            "inherited window size"
        );
        Ok(true)
    }

    /// Fork and launch `command` on the slave side.
    ///
    /// The child never returns from this call: it either becomes `command`
    /// or reports the failed launch step on its standard error and exits with
    /// [`LAUNCH_FAILURE_EXIT`].
    pub fn spawn(
        self,
        command: &ChildCommand,
        stderr: StderrRoute<'_>,
    ) -> Result<PtySession, PtyError> {
        let slave_path = CString::new(self.slave_path.as_os_str().as_bytes())
            .map_err(|_| PtyError::InvalidArgument("slave path contains NUL".to_string()))?;
        let argv = command.argv_ptrs();

        // SAFETY: the child path only issues raw syscalls on memory prepared
        // above, then execs or exits.
        match unsafe { fork() }.map_err(PtyError::ForkFailed)? {
            ForkResult::Parent { child } => {
                debug!(pid = child.as_raw(), program = %command, "forked child");
                Ok(PtySession {
                    master: self.master,
                    slave_path: self.slave_path,
                    pid: child,
                })
            }
            ForkResult::Child => {
                let err = child::launch(
                    &slave_path,
                    self.master.as_raw_fd(),
                    command,
                    &argv,
                    stderr,
                );
                child::report(&err);
                // SAFETY: _exit skips atexit handlers and stdio flushing that
                // belong to the parent image.
                unsafe { libc::_exit(LAUNCH_FAILURE_EXIT) }
            }
        }
    }
}

impl AsFd for Pty {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }
}

/// A PTY with a child process attached to its slave side
#[derive(Debug)]
pub struct PtySession {
    master: OwnedFd,
    slave_path: PathBuf,
    pid: Pid,
}

impl PtySession {
    /// Get the process ID
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Device path of the child's terminal
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    /// Borrow the master descriptor
    pub fn master(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    /// Block until the child changes state
    pub fn wait(&self) -> Result<WaitStatus, PtyError> {
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    trace!(?status, "child state changed");
                    return Ok(status);
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(PtyError::WaitFailed(e)),
            }
        }
    }

    /// Wait for the child and translate its status into an exit code
    pub fn wait_exit_code(&self) -> Result<i32, PtyError> {
        self.wait().map(status::exit_code)
    }

    /// Send a signal to the child
    pub fn kill(&self, sig: Signal) -> Result<(), PtyError> {
        signal::kill(self.pid, sig).map_err(|e| PtyError::IoError(e.into()))
    }

    /// Close the master side, hanging up the child's terminal
    pub fn close(self) {
        debug!(master_fd = self.master.as_raw_fd(), "closing pty master");
        drop(self.master);
    }
}

impl AsFd for PtySession {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn slave_name(master: &PtyMaster) -> Result<String, PtyError> {
    nix::pty::ptsname_r(master).map_err(PtyError::SlaveNameFailed)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn slave_name(master: &PtyMaster) -> Result<String, PtyError> {
    // SAFETY: ptsname is only called during setup, before any thread exists
    unsafe { nix::pty::ptsname(master) }.map_err(PtyError::SlaveNameFailed)
}

fn get_winsize(fd: RawFd) -> Result<Winsize, PtyError> {
    let mut winsize = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: out param is a valid pointer to the right type
    let ret = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut winsize as *mut Winsize) };
    if ret < 0 {
        return Err(PtyError::IoError(io::Error::last_os_error()));
    }
    Ok(winsize)
}

fn set_winsize(fd: RawFd, winsize: &Winsize) -> Result<(), PtyError> {
    // SAFETY: in param is a valid pointer to the right type
    let ret = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, winsize as *const Winsize) };
    if ret < 0 {
        return Err(PtyError::IoError(io::Error::last_os_error()));
    }
    Ok(())
}
