pub mod capture;
pub mod harness;

pub use capture::OutputCapture;
pub use harness::{PipedHandle, PtyHandle, RunOutput, TestHarness};

use std::sync::Once;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                    EnvFilter::new("ptyrelay=debug,ptyrelay_relay=debug,ptyrelay_pty=debug")
                }),
            )
            .with_test_writer()
            .init();
    });
}

#[derive(Debug, Clone)]
pub struct TestConfig {
    /// Upper bound on any single run of the binary
    pub timeout: Duration,
    /// Pass `--quiet` so stdout only carries the child's output
    pub quiet: bool,
    /// Value for `--log-level`, if any
    pub log_level: Option<String>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            quiet: true,
            log_level: None,
        }
    }
}
