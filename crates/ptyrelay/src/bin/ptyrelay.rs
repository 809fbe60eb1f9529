use ptyrelay_pty::LAUNCH_FAILURE_EXIT;
use std::io::{self, Write};
use tracing::error;

fn main() {
    let code = match ptyrelay::cli::run() {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            LAUNCH_FAILURE_EXIT
        }
    };

    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
    std::process::exit(code);
}
