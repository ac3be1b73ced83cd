//! Error types for Velo library operations.
//!
//! All fallible library functions return [`Result<T>`], whose error side is
//! [`VeloError`]. The enum covers every failure surface of the core: formula
//! lookup and parsing, downloads, installation, dependency resolution, tap
//! management, and spawned platform tools.
//!
//! # Error Handling Strategy
//!
//! The library uses `thiserror` for ergonomic error construction and
//! conversion. Common underlying errors (reqwest, serde_json, std::io) convert
//! automatically via `#[from]`. For miscellaneous failures with rich context,
//! the [`Other`](VeloError::Other) variant wraps `anyhow::Error`.
//!
//! Locally recovered conditions (re-signing failures, xattr clearing, tap
//! updates on a detached HEAD) are logged with `tracing::warn!` and never
//! reach this enum.

use std::path::PathBuf;
use thiserror::Error;

/// Error type for all Velo library operations.
#[derive(Error, Debug)]
pub enum VeloError {
    // ── Formula ────────────────────────────────────────────────────────────
    /// No tap knows a formula with the given name.
    #[error("Formula not found: {0}")]
    FormulaNotFound(String),

    /// A formula file was located but could not be turned into a record.
    #[error("Failed to parse formula {name}: {reason}")]
    FormulaParseError { name: String, reason: String },

    /// The formula exists but not at the requested version.
    #[error("{package} has no version {version}")]
    VersionNotAvailable { package: String, version: String },

    // ── Download ───────────────────────────────────────────────────────────
    /// A download failed after the transport layer accepted the request.
    #[error("Download of {url} failed: {reason}")]
    DownloadFailed { url: String, reason: String },

    /// The downloaded bytes do not hash to the expected digest.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Network or HTTP request failure below the download logic.
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    /// The registry refused to serve the bottle (terminal auth failure).
    #[error("Bottle not accessible at {url}: {reason}")]
    BottleNotAccessible { url: String, reason: String },

    // ── Install ────────────────────────────────────────────────────────────
    /// The exact package/version is already present in the Cellar.
    #[error("{package} {version} is already installed")]
    AlreadyInstalled { package: String, version: String },

    /// The bottle archive could not be unpacked.
    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    /// A symlink could not be created or replaced.
    #[error("Failed to create symlink {dest}: {reason}")]
    SymlinkFailed { dest: PathBuf, reason: String },

    /// Mach-O install-name rewriting failed for a file.
    #[error("Failed to rewrite library paths in {path}: {reason}")]
    LibraryPathRewriteFailed { path: PathBuf, reason: String },

    /// Umbrella failure for a package install, with the failing stage.
    #[error("Installation of {package} failed: {reason}")]
    InstallationFailed { package: String, reason: String },

    // ── System ─────────────────────────────────────────────────────────────
    /// The running machine is not the supported target.
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// A path under the prefix is not writable by the current user.
    #[error("Insufficient permissions for {0}")]
    InsufficientPermissions(PathBuf),

    /// An expected path does not exist.
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// File system operation failed.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse JSON from a cache file, receipt, or lockfile.
    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    // ── Dependency ─────────────────────────────────────────────────────────
    /// A dependency edge points at a package the graph does not contain.
    #[error("Dependency not found: {0}")]
    DependencyNotFound(String),

    /// The dependency graph contains a cycle.
    #[error("Circular dependency: {}", chain.join(" -> "))]
    CircularDependency { chain: Vec<String> },

    /// Two requirement sets demand incompatible versions of one package.
    #[error("Version conflict on {package}: {}", requirements.join(", "))]
    VersionConflict {
        package: String,
        requirements: Vec<String>,
    },

    // ── Tap ────────────────────────────────────────────────────────────────
    /// Cloning a tap repository failed.
    #[error("Failed to clone tap {tap}: {reason}")]
    TapCloneFailed { tap: String, reason: String },

    /// Updating an existing tap repository failed.
    #[error("Failed to update tap {tap}: {reason}")]
    TapUpdateFailed { tap: String, reason: String },

    /// The tap directory does not exist.
    #[error("Tap not found: {0}")]
    TapNotFound(String),

    /// A tap name that is not of the form `org/repo`.
    #[error("Invalid tap name: {0}")]
    InvalidTapName(String),

    // ── Receipts ───────────────────────────────────────────────────────────
    /// An update was requested for a receipt that does not exist.
    #[error("No receipt for {package} {version}")]
    ReceiptNotFound { package: String, version: String },

    // ── Process ────────────────────────────────────────────────────────────
    /// A spawned platform tool exited non-zero.
    #[error("{command} exited with {exit_code}: {stderr}")]
    ProcessError {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    // ── Update ─────────────────────────────────────────────────────────────
    /// Checking a tap or index for updates failed.
    #[error("Update check failed: {0}")]
    UpdateCheckFailed(String),

    /// Miscellaneous error with rich context.
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl VeloError {
    /// Wrap an arbitrary failure as an install failure for `package`.
    pub fn install_failure(package: &str, err: impl std::fmt::Display) -> Self {
        VeloError::InstallationFailed {
            package: package.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Convenience type alias for library operations.
pub type Result<T> = std::result::Result<T, VeloError>;
