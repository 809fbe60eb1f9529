//! RAII guard for the caller's terminal line discipline while relaying

use nix::sys::termios::{self, LocalFlags, SetArg, Termios};
use std::io::{self, IsTerminal};
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use tracing::{debug, warn};

/// Local-mode flags to clear and set while the guard is held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMode {
    clear: LocalFlags,
    set: LocalFlags,
}

impl RawMode {
    pub fn new(clear: LocalFlags, set: LocalFlags) -> Self {
        Self { clear, set }
    }

    /// Deliver input byte by byte but keep echo and signal keys
    pub fn canonical_off() -> Self {
        Self::new(LocalFlags::ICANON, LocalFlags::empty())
    }

    /// Pass every key through untouched
    pub fn raw() -> Self {
        Self::new(
            LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ISIG | LocalFlags::IEXTEN,
            LocalFlags::empty(),
        )
    }

    fn apply(&self, termios: &mut Termios) {
        termios.local_flags.remove(self.clear);
        termios.local_flags.insert(self.set);
    }
}

impl Default for RawMode {
    fn default() -> Self {
        Self::canonical_off()
    }
}

/// Holds a terminal in a modified mode and puts the saved configuration back
/// when restored or dropped.
///
/// On a descriptor that is not a terminal the guard is inert.
#[derive(Debug)]
pub struct TerminalGuard {
    fd: Option<OwnedFd>,
    saved: Option<Termios>,
    // Marker to ensure this type is !Send and !Sync
    _marker: std::marker::PhantomData<*const ()>,
}

impl TerminalGuard {
    /// Save the current configuration of `fd` and apply `mode` immediately
    pub fn acquire(fd: BorrowedFd<'_>, mode: RawMode) -> io::Result<Self> {
        if !fd.is_terminal() {
            debug!("not a terminal, leaving line discipline alone");
            return Ok(Self::inert());
        }

        let fd = fd.try_clone_to_owned()?;
        let saved = termios::tcgetattr(&fd)?;
        let mut modified = saved.clone();
        mode.apply(&mut modified);
        termios::tcsetattr(&fd, SetArg::TCSANOW, &modified)?;
        debug!(clear = ?mode.clear, set = ?mode.set, "terminal mode applied");

        Ok(Self {
            fd: Some(fd),
            saved: Some(saved),
            _marker: std::marker::PhantomData,
        })
    }

    fn inert() -> Self {
        Self {
            fd: None,
            saved: None,
            _marker: std::marker::PhantomData,
        }
    }

    /// Whether a saved configuration is waiting to be restored
    pub fn is_active(&self) -> bool {
        self.saved.is_some()
    }

    /// Put the saved configuration back. Later calls do nothing.
    pub fn restore(&mut self) -> io::Result<()> {
        if let (Some(fd), Some(saved)) = (self.fd.as_ref(), self.saved.take()) {
            termios::tcsetattr(fd.as_fd(), SetArg::TCSANOW, &saved)?;
            debug!("terminal mode restored");
        }
        Ok(())
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            warn!("Failed to restore terminal mode: {e}");
        }
    }
}
