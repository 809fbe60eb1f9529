//! Command line front end

use crate::session::{Session, SessionConfig, StderrMode};
use crate::terminal_guard::RawMode;
use anyhow::Result;
use clap::builder::RangedU64ValueParser;
use clap::{Parser, ValueEnum};
use ptyrelay_relay::{TransferMode, DEFAULT_BUFFER_SIZE, MAX_BUFFER_SIZE};
use std::ffi::OsString;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Run a program on a pseudo-terminal, relaying it to plain stdio"
)]
pub struct Args {
    /// Send the child's stderr through the terminal instead of a separate pipe
    #[arg(long)]
    pub merge_stderr: bool,

    /// Also turn off echo and signal keys on our terminal while relaying
    #[arg(long, conflicts_with = "no_raw")]
    pub raw: bool,

    /// Leave our terminal's line discipline untouched
    #[arg(long)]
    pub no_raw: bool,

    /// Bytes moved per read/write or splice call, at most 1 MiB
    #[arg(
        long,
        default_value_t = DEFAULT_BUFFER_SIZE,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..=MAX_BUFFER_SIZE as u64)
    )]
    pub buffer_size: usize,

    /// Always copy through user space
    #[arg(long)]
    pub no_splice: bool,

    /// Do not copy our terminal's window size to the child
    #[arg(long)]
    pub no_winsize: bool,

    /// Suppress the startup banner
    #[arg(short, long)]
    pub quiet: bool,

    /// Log level
    #[arg(long, value_enum, default_value = "warn")]
    pub log_level: LogLevel,

    /// Program to run, followed by its arguments
    #[arg(required = true, trailing_var_arg = true, value_name = "PROGRAM")]
    pub command: Vec<OsString>,
}

impl Args {
    pub fn session_config(&self) -> SessionConfig {
        let raw_mode = if self.no_raw {
            None
        } else if self.raw {
            Some(RawMode::raw())
        } else {
            Some(RawMode::canonical_off())
        };

        SessionConfig {
            stderr: if self.merge_stderr {
                StderrMode::Merged
            } else {
                StderrMode::Separate
            },
            raw_mode,
            buffer_size: self.buffer_size,
            transfer: if self.no_splice {
                TransferMode::Copy
            } else {
                TransferMode::Auto
            },
            inherit_window_size: !self.no_winsize,
            banner: !self.quiet,
        }
    }
}

/// Parse the command line, run the session and return its exit code
pub fn run() -> Result<i32> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::from(args.log_level))
        .with_writer(io::stderr)
        .init();

    Session::new(args.session_config()).run(&args.command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults_match_session_defaults() {
        let args = parse(&["ptyrelay", "cat"]);
        let config = args.session_config();
        let defaults = SessionConfig::default();

        assert_eq!(args.log_level, LogLevel::Warn);
        assert_eq!(config.stderr, defaults.stderr);
        assert_eq!(config.raw_mode, defaults.raw_mode);
        assert_eq!(config.buffer_size, defaults.buffer_size);
        assert_eq!(config.transfer, defaults.transfer);
        assert_eq!(config.inherit_window_size, defaults.inherit_window_size);
        assert_eq!(config.banner, defaults.banner);
    }

    #[test]
    fn test_child_flags_pass_through() {
        let args = parse(&["ptyrelay", "-q", "sh", "-c", "echo hi", "--quiet"]);
        assert!(args.quiet);
        assert_eq!(args.command, vec!["sh", "-c", "echo hi", "--quiet"]);
    }

    #[test]
    fn test_double_dash_separator() {
        let args = parse(&["ptyrelay", "--", "ls", "-l"]);
        assert_eq!(args.command, vec!["ls", "-l"]);
    }

    #[test_case(&["ptyrelay"] ; "missing program")]
    #[test_case(&["ptyrelay", "--buffer-size", "0", "cat"] ; "zero buffer")]
    #[test_case(&["ptyrelay", "--buffer-size", "1048577", "cat"] ; "oversized buffer")]
    #[test_case(&["ptyrelay", "--raw", "--no-raw", "cat"] ; "conflicting modes")]
    fn test_rejected(argv: &[&str]) {
        assert!(Args::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_all_flags() {
        let args = parse(&[
            "ptyrelay",
            "--merge-stderr",
            "--raw",
            "--buffer-size",
            "512",
            "--no-splice",
            "--no-winsize",
            "--log-level",
            "debug",
            "vi",
        ]);
        let config = args.session_config();

        assert_eq!(config.stderr, StderrMode::Merged);
        assert_eq!(config.raw_mode, Some(RawMode::raw()));
        assert_eq!(config.buffer_size, 512);
        assert_eq!(config.transfer, TransferMode::Copy);
        assert!(!config.inherit_window_size);
        assert!(config.banner);
        assert_eq!(args.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_largest_buffer_accepted() {
        let args = parse(&["ptyrelay", "--buffer-size", "1048576", "cat"]);
        assert_eq!(args.buffer_size, MAX_BUFFER_SIZE);
    }

    #[test]
    fn test_no_raw() {
        let config = parse(&["ptyrelay", "--no-raw", "cat"]).session_config();
        assert_eq!(config.raw_mode, None);
    }
}
