//! Environment-driven configuration.
//!
//! The core recognises two environment inputs, both optional:
//! `VELO_LOG_LEVEL` (`essential` | `verbose` | `debug`) and `VELO_IO_POLICY`
//! (`default` | `performance` | `efficiency`). `PATH` is probed only to tell
//! the user whether the prefix's `bin/` is reachable.

use crate::prefix::Prefix;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

/// Verbosity requested through `VELO_LOG_LEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    #[default]
    Essential,
    Verbose,
    Debug,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "essential" => Ok(LogLevel::Essential),
            "verbose" => Ok(LogLevel::Verbose),
            "debug" => Ok(LogLevel::Debug),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

impl LogLevel {
    pub fn from_env() -> Self {
        std::env::var("VELO_LOG_LEVEL")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default()
    }

    fn filter_directive(self) -> &'static str {
        match self {
            LogLevel::Essential => "velo=warn",
            LogLevel::Verbose => "velo=info",
            LogLevel::Debug => "velo=debug",
        }
    }
}

/// Worker-priority hint requested through `VELO_IO_POLICY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoPolicy {
    #[default]
    Default,
    Performance,
    Efficiency,
}

impl FromStr for IoPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(IoPolicy::Default),
            "performance" => Ok(IoPolicy::Performance),
            "efficiency" => Ok(IoPolicy::Efficiency),
            other => Err(format!("unknown io policy '{other}'")),
        }
    }
}

impl IoPolicy {
    pub fn from_env() -> Self {
        std::env::var("VELO_IO_POLICY")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default()
    }

    /// Whole-package download concurrency suggested by the policy.
    pub fn download_concurrency(self, configured: usize) -> usize {
        match self {
            IoPolicy::Default => configured,
            IoPolicy::Performance => configured * 2,
            IoPolicy::Efficiency => (configured / 2).max(1),
        }
    }
}

/// Install the tracing subscriber according to `VELO_LOG_LEVEL`.
///
/// An explicit `RUST_LOG` always wins, so debugging remains possible without
/// touching velo's own knobs.
pub fn init_logging(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.filter_directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Whether `<prefix>/bin` is on the user's `PATH`.
pub fn prefix_bin_on_path(prefix: &Prefix) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    let bin = prefix.bin();
    std::env::split_paths(&path).any(|entry| entry == bin)
}
