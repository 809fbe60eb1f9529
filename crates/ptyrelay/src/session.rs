//! Session controller: one child on a fresh PTY, relayed to this process's
//! standard streams until the child is gone.

use crate::terminal_guard::{RawMode, TerminalGuard};
use anyhow::{Context, Result};
use ptyrelay_pty::{stderr_pipe, ChildCommand, Pty, PtySession, StderrRoute};
use nix::sys::signal::Signal;
use ptyrelay_relay::{
    RelayEngine, RelayLink, RelayReport, RunningRelay, TransferMode, DEFAULT_BUFFER_SIZE,
};
use std::ffi::{OsStr, OsString};
use std::io::{self, Write};
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::path::Path;
use tracing::{debug, info, warn};

/// Where the child's standard error ends up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StderrMode {
    /// A pipe relayed to our standard error
    #[default]
    Separate,

    /// The PTY slave, mixed into our standard output
    Merged,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub stderr: StderrMode,

    /// Line discipline applied to our stdin while relaying, if it is a
    /// terminal. `None` leaves it untouched.
    pub raw_mode: Option<RawMode>,

    pub buffer_size: usize,
    pub transfer: TransferMode,

    /// Copy our terminal's window size onto the PTY before launching
    pub inherit_window_size: bool,

    /// Print the startup banner on stdout
    pub banner: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stderr: StderrMode::Separate,
            raw_mode: Some(RawMode::default()),
            buffer_size: DEFAULT_BUFFER_SIZE,
            transfer: TransferMode::Auto,
            inherit_window_size: true,
            banner: true,
        }
    }
}

pub struct Session {
    config: SessionConfig,
    invocation: Vec<OsString>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            invocation: std::env::args_os().collect(),
        }
    }

    /// Arguments reported by the banner, in place of this process's own
    pub fn with_invocation<I, S>(mut self, invocation: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.invocation = invocation.into_iter().map(Into::into).collect();
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Run `argv` on a new PTY and return the exit code this process should
    /// report for it.
    pub fn run<S: AsRef<OsStr>>(&self, argv: &[S]) -> Result<i32> {
        let command = ChildCommand::new(argv).context("Invalid command line")?;
        let stdin = io::stdin();

        let pty = Pty::open().context("Failed to allocate a pseudo-terminal")?;
        if self.config.inherit_window_size {
            if let Err(e) = pty.inherit_window_size(stdin.as_fd()) {
                warn!("Failed to copy window size: {e}");
            }
        }

        if self.config.banner {
            print_banner(|out| write_banner(out, &self.invocation, pty.slave_path()));
        }

        let err_pipe = match self.config.stderr {
            StderrMode::Separate => Some(stderr_pipe()?),
            StderrMode::Merged => None,
        };
        let route = match &err_pipe {
            Some((read, write)) => StderrRoute::Separate {
                write: write.as_fd(),
                read: read.as_fd(),
            },
            None => StderrRoute::Merged,
        };

        let session = pty
            .spawn(&command, route)
            .with_context(|| format!("Failed to start {command}"))?;

        // Only the child writes to the error pipe; our copy would hide its EOF
        let err_read = err_pipe.map(|(read, _write)| read);

        if self.config.banner {
            print_banner(|out| writeln!(out, "child pid {}", session.pid()));
        }
        info!(
            pid = session.pid().as_raw(),
            slave = %session.slave_path().display(),
            "child started"
        );

        let mut guard = self.config.raw_mode.and_then(|mode| {
            TerminalGuard::acquire(stdin.as_fd(), mode)
                .map_err(|e| warn!("Failed to set terminal mode, continuing without it: {e}"))
                .ok()
        });

        let result = self.relay(&session, stdin.as_fd(), err_read.as_ref());

        if let Some(guard) = guard.as_mut() {
            if let Err(e) = guard.restore() {
                warn!("Failed to restore terminal mode: {e}");
            }
        }
        session.close();

        let code = result?;
        debug!(code, "session finished");
        Ok(code)
    }

    /// Relay until the first link finishes, reap the child, then stop the
    /// remaining links.
    fn relay(
        &self,
        session: &PtySession,
        stdin: BorrowedFd<'_>,
        err_read: Option<&OwnedFd>,
    ) -> Result<i32> {
        let relay = match self.start_relay(session, stdin, err_read) {
            Ok(relay) => relay,
            Err(e) => {
                abandon(session);
                return Err(e);
            }
        };

        let first = relay.await_any_completion();
        debug!(link = %first.label, outcome = %first.outcome, "first relay link finished");

        let waited = session.wait_exit_code();
        let report = relay.shutdown();
        log_report(&report);

        waited.context("Failed to collect child status")
    }

    fn start_relay(
        &self,
        session: &PtySession,
        stdin: BorrowedFd<'_>,
        err_read: Option<&OwnedFd>,
    ) -> Result<RunningRelay> {
        let stdout = io::stdout();
        let stderr = io::stderr();

        // The master is ours alone, so the up link may make it non-blocking
        let mut engine = RelayEngine::new()
            .link(
                self.link("up", stdin, session.master())?
                    .nonblocking_output(true),
            )
            .link(
                self.link("down", session.master(), stdout.as_fd())?
                    .drain_on_cancel(true),
            );
        if let Some(err_read) = err_read {
            engine = engine.link(
                self.link("down err", err_read.as_fd(), stderr.as_fd())?
                    .drain_on_cancel(true),
            );
        }

        engine.start().context("Failed to start relay")
    }

    fn link(
        &self,
        label: &str,
        input: BorrowedFd<'_>,
        output: BorrowedFd<'_>,
    ) -> Result<RelayLink> {
        let link = RelayLink::new(label, input, output)
            .with_context(|| format!("Failed to set up {label} link"))?;
        Ok(link
            .buffer_size(self.config.buffer_size)
            .transfer_mode(self.config.transfer))
    }
}

/// Startup banner: our own argument vector and the child's terminal
pub fn write_banner<W: Write>(
    out: &mut W,
    invocation: &[OsString],
    slave: &Path,
) -> io::Result<()> {
    writeln!(out, "argc={}", invocation.len())?;
    for (i, arg) in invocation.iter().enumerate() {
        writeln!(out, "argv[{i}]=\"{}\"", arg.to_string_lossy())?;
    }
    writeln!(out, "child device is: {}", slave.display())
}

/// Banner output is informational; failing to print it is not fatal.
fn print_banner<F>(write: F)
where
    F: FnOnce(&mut io::StdoutLock<'static>) -> io::Result<()>,
{
    let mut stdout = io::stdout().lock();
    if let Err(e) = write(&mut stdout).and_then(|()| stdout.flush()) {
        warn!("Failed to print banner: {e}");
    }
}

/// Kill and reap a child nothing will relay for
fn abandon(session: &PtySession) {
    if let Err(e) = session.kill(Signal::SIGKILL) {
        warn!(pid = session.pid().as_raw(), "Failed to kill child: {e}");
    }
    match session.wait() {
        Ok(status) => debug!(?status, "abandoned child reaped"),
        Err(e) => warn!(pid = session.pid().as_raw(), "Failed to reap child: {e}"),
    }
}

fn log_report(report: &RelayReport) {
    for link in &report.links {
        debug!(
            link = %link.label,
            bytes = link.bytes,
            outcome = %link.outcome,
            "relay link report"
        );
    }
    debug!(total_bytes = report.total_bytes(), "relay stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.stderr, StderrMode::Separate);
        assert_eq!(config.raw_mode, Some(RawMode::canonical_off()));
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.transfer, TransferMode::Auto);
        assert!(config.inherit_window_size);
        assert!(config.banner);
    }

    #[test]
    fn test_banner_format() {
        let invocation: Vec<OsString> = ["ptyrelay", "cat", "-u"]
            .iter()
            .map(OsString::from)
            .collect();
        let mut out = Vec::new();
        write_banner(&mut out, &invocation, Path::new("/dev/pts/7")).unwrap();

        assert_eq!(
            String::from_utf8(out).unwrap(),
            "argc=3\n\
             argv[0]=\"ptyrelay\"\n\
             argv[1]=\"cat\"\n\
             argv[2]=\"-u\"\n\
             child device is: /dev/pts/7\n"
        );
    }

    #[test]
    fn test_invocation_override() {
        let session = Session::new(SessionConfig::default()).with_invocation(["a", "b"]);
        assert_eq!(session.invocation, vec![OsString::from("a"), OsString::from("b")]);
    }

    #[test]
    fn test_abandon_reaps_child() {
        let pty = Pty::open().unwrap();
        let command = ChildCommand::new(&["sleep", "30"]).unwrap();
        let session = pty.spawn(&command, StderrRoute::Merged).unwrap();

        abandon(&session);
        // Already reaped, so there is nothing left to wait for
        assert!(session.wait().is_err());
    }

    #[test]
    fn test_empty_command_rejected() {
        let session = Session::new(SessionConfig {
            banner: false,
            ..SessionConfig::default()
        });
        let argv: [&str; 0] = [];
        let err = session.run(&argv).unwrap_err();
        assert!(err.to_string().contains("Invalid command line"));
    }
}
