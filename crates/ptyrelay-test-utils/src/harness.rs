use crate::{OutputCapture, TestConfig};
use anyhow::{Context, Result};
use ptyrelay_pty::{ChildCommand, Pty, PtySession, StderrRoute};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::BorrowedFd;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

/// Runs the `ptyrelay` binary under test
pub struct TestHarness {
    binary: PathBuf,
    config: TestConfig,
}

/// Everything a finished run left behind
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    /// Exit code, or `None` if the binary itself was killed by a signal
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// A run with piped stdio whose stdin stays open until closed or dropped
pub struct PipedHandle {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: JoinHandle<std::io::Result<Vec<u8>>>,
    stderr: JoinHandle<std::io::Result<Vec<u8>>>,
    config: TestConfig,
}

/// A run whose stdio is a terminal allocated by the test
pub struct PtyHandle {
    session: PtySession,
    writer: File,
    reader: JoinHandle<()>,
    capture: OutputCapture,
    config: TestConfig,
}

impl TestHarness {
    pub fn new(config: TestConfig) -> Self {
        Self::with_binary(locate_binary(), config)
    }

    /// Integration tests should pass `env!("CARGO_BIN_EXE_ptyrelay")`
    pub fn with_binary(binary: impl Into<PathBuf>, config: TestConfig) -> Self {
        Self {
            binary: binary.into(),
            config,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn config(&self) -> &TestConfig {
        &self.config
    }

    /// Full argument vector: harness flags, then `args` as given
    pub fn argv(&self, args: &[&str]) -> Vec<String> {
        let mut argv = Vec::new();
        if self.config.quiet {
            argv.push("--quiet".to_string());
        }
        if let Some(level) = &self.config.log_level {
            argv.push("--log-level".to_string());
            argv.push(level.clone());
        }
        argv.extend(args.iter().map(|arg| arg.to_string()));
        argv
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.argv(args)).kill_on_drop(true);
        cmd
    }

    /// Run to completion with stdin at end of file
    pub async fn run_null_stdin(&self, args: &[&str]) -> Result<RunOutput> {
        let mut cmd = self.command(args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(self.config.timeout, cmd.output())
            .await
            .context("ptyrelay did not finish in time")?
            .context("Failed to run ptyrelay")?;

        Ok(RunOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Start with piped stdio. Stdin stays open until the handle closes it.
    pub fn spawn_piped(&self, args: &[&str]) -> Result<PipedHandle> {
        let mut cmd = self.command(args);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().context("Failed to spawn ptyrelay")?;
        let stdin = child.stdin.take();
        let mut stdout = child.stdout.take().context("stdout not piped")?;
        let mut stderr = child.stderr.take().context("stderr not piped")?;

        let stdout = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await.map(|_| buf)
        });
        let stderr = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await.map(|_| buf)
        });

        Ok(PipedHandle {
            child,
            stdin,
            stdout,
            stderr,
            config: self.config.clone(),
        })
    }

    /// Start on a fresh PTY, as if launched from an interactive shell
    pub fn spawn_in_pty(&self, args: &[&str]) -> Result<PtyHandle> {
        let pty = Pty::open().context("Failed to create PTY")?;
        pty.set_window_size(24, 80)?;

        let mut argv = vec![self.binary.to_string_lossy().into_owned()];
        argv.extend(self.argv(args));
        let command = ChildCommand::new(&argv)?;

        let session = pty
            .spawn(&command, StderrRoute::Merged)
            .context("Failed to spawn ptyrelay on a PTY")?;

        let mut master = File::from(session.master().try_clone_to_owned()?);
        let writer = File::from(session.master().try_clone_to_owned()?);
        let capture = OutputCapture::new();
        let sink = capture.clone();

        // Ends with EIO once every slave descriptor is closed
        let reader = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 4096];
            loop {
                match master.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => sink.capture_bytes_blocking(&buf[..n]),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        });

        Ok(PtyHandle {
            session,
            writer,
            reader,
            capture,
            config: self.config.clone(),
        })
    }
}

impl PipedHandle {
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let stdin = self.stdin.as_mut().context("stdin already closed")?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Hand stdin to a task that writes `chunk` over and over until the
    /// binary stops reading
    pub fn keep_writing(&mut self, chunk: Vec<u8>) -> Result<()> {
        let mut stdin = self.stdin.take().context("stdin already closed")?;
        tokio::spawn(async move { while stdin.write_all(&chunk).await.is_ok() {} });
        Ok(())
    }

    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Wait for exit with stdin still open, then collect the output
    pub async fn wait(mut self) -> Result<RunOutput> {
        let status = tokio::time::timeout(self.config.timeout, self.child.wait())
            .await
            .context("ptyrelay did not exit in time")??;
        self.stdin = None;

        let stdout = self.stdout.await??;
        let stderr = self.stderr.await??;
        Ok(RunOutput {
            status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

impl PtyHandle {
    pub fn capture(&self) -> &OutputCapture {
        &self.capture
    }

    /// Master side of the terminal the binary runs on
    pub fn master(&self) -> BorrowedFd<'_> {
        self.session.master()
    }

    /// Type into the terminal
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data)?;
        Ok(())
    }

    pub async fn wait_for(&self, pattern: &str) -> Result<String> {
        self.capture.wait_for(pattern, self.config.timeout).await
    }

    /// Wait for the binary to exit and return its exit code
    pub async fn wait(self) -> Result<i32> {
        let session = self.session;
        let code = tokio::time::timeout(
            self.config.timeout,
            tokio::task::spawn_blocking(move || session.wait_exit_code()),
        )
        .await
        .context("ptyrelay did not exit in time")???;

        drop(self.writer);
        let _ = tokio::time::timeout(self.config.timeout, self.reader).await;
        Ok(code)
    }
}

/// Find the built binary when the test was not given its path
fn locate_binary() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_ptyrelay") {
        return PathBuf::from(path);
    }

    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
    let workspace_root = Path::new(&manifest_dir)
        .parent()
        .and_then(|p| p.parent())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let release_path = workspace_root.join("target/release/ptyrelay");
    let debug_path = workspace_root.join("target/debug/ptyrelay");
    if release_path.exists() {
        release_path
    } else if debug_path.exists() {
        debug_path
    } else {
        PathBuf::from("ptyrelay")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argv_prefixes_harness_flags() {
        let config = TestConfig {
            log_level: Some("debug".to_string()),
            ..TestConfig::default()
        };
        let harness = TestHarness::with_binary("/bin/ptyrelay", config);
        assert_eq!(
            harness.argv(&["sh", "-c", "exit 3"]),
            vec!["--quiet", "--log-level", "debug", "sh", "-c", "exit 3"]
        );
    }

    #[test]
    fn test_argv_without_quiet() {
        let config = TestConfig {
            quiet: false,
            ..TestConfig::default()
        };
        let harness = TestHarness::with_binary("/bin/ptyrelay", config);
        assert_eq!(harness.argv(&["true"]), vec!["true"]);
    }
}
