//! Velo — a binary package manager for Homebrew-format bottles under a
//! user-local prefix.
//!
//! The library resolves a dependency closure from formula definitions,
//! downloads bottles in parallel with SHA-256 verification, installs them
//! into `~/.velo` (or any project-local prefix), rewrites embedded library
//! paths so binaries resolve inside the prefix, and exposes executables
//! through a layered symlink hierarchy that supports coexisting versions.
//!
//! # Architecture
//!
//! - **prefix.rs**: the canonical filesystem layout and symlink primitives
//! - **tap.rs / cache.rs / parser.rs**: formula repositories, the two-tier
//!   formula cache, and the search index
//! - **resolver.rs**: canonicalisation, cycle/conflict detection, install
//!   order
//! - **download.rs**: segmented parallel downloads and the OCI bearer flow
//! - **relocate.rs / install.rs**: extraction, path rewriting, linking
//! - **orchestrator.rs**: the resolve → download → install driver
//! - **receipt.rs / lockfile.rs**: install records and reproducible pins
//!
//! # Quick Start
//!
//! ```no_run
//! use velo::{Orchestrator, Prefix};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let prefix = Prefix::default_location();
//!     prefix.ensure_skeleton()?;
//!
//!     let orchestrator = Orchestrator::new(prefix)?;
//!     let report = orchestrator.install(&["wget".to_string()], false).await?;
//!     for outcome in report.installed {
//!         println!("installed {} {}", outcome.package, outcome.version);
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod download;
pub mod equivalence;
pub mod error;
pub mod formula;
pub mod install;
pub mod lockfile;
pub mod orchestrator;
pub mod parser;
pub mod platform;
pub mod prefix;
pub mod progress;
pub mod receipt;
pub mod relocate;
pub mod resolver;
pub mod tap;
pub mod version;

pub use cache::{FormulaCache, SearchIndex, TapMetadataStore};
pub use download::{DownloadConfig, Downloader};
pub use error::{Result, VeloError};
pub use formula::{Bottle, Dependency, DependencyType, Formula};
pub use install::{InstallOptions, InstallOutcome, Installer};
pub use lockfile::Lockfile;
pub use orchestrator::{InstallReport, Orchestrator, OrchestratorConfig};
pub use parser::{FormulaParser, RubyFormulaParser};
pub use prefix::{Prefix, SymlinkOutcome};
pub use progress::{NullSink, ProgressEvent, ProgressSink};
pub use receipt::{InstalledAs, Receipt, ReceiptStore};
pub use resolver::{DependencyGraph, DependencyNode, InstallPlan, Resolver};
pub use tap::{TapConfig, TapManager};
pub use version::{PackageSpec, SemanticVersion, VersionConstraint, VersionConstraintSet};
