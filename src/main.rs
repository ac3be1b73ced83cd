//! Thin CLI over the velo library: argument parsing, progress rendering,
//! and output formatting only. All package-management behaviour lives in
//! the library crate.

use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use velo::config::{self, LogLevel};
use velo::lockfile::{LOCKFILE_NAME, Lockfile};
use velo::progress::{ProgressEvent, ProgressSink};
use velo::{Orchestrator, OrchestratorConfig, Prefix, VeloError, version::PackageSpec};

#[derive(Parser)]
#[command(name = "velo")]
#[command(author, version, about = "Fast binary package manager for a user-local prefix", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Use a different prefix than ~/.velo (project-local installs)
    #[arg(long, global = true)]
    prefix: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Install formulae and their dependencies
    Install {
        /// Formula names (name or name@version)
        formulas: Vec<String>,

        /// Reinstall even if already installed
        #[arg(long)]
        force: bool,

        /// Resolve and report without installing
        #[arg(long)]
        dry_run: bool,
    },

    /// Uninstall formulae
    Uninstall {
        formulas: Vec<String>,

        /// Ignore packages that still depend on these
        #[arg(long)]
        force: bool,
    },

    /// List installed packages
    List {
        /// Show every installed version
        #[arg(long)]
        versions: bool,
    },

    /// Search formula names (and descriptions with --descriptions)
    Search {
        query: String,

        #[arg(long)]
        descriptions: bool,
    },

    /// Show information about a formula
    Info { formula: String },

    /// Update taps (all, or one org/repo)
    Update {
        tap: Option<String>,

        /// Update even when the tap is fresh
        #[arg(long)]
        force: bool,
    },

    /// Point opt/ and bin/ defaults at a specific installed version
    Default { formula: String, version: String },

    /// Resolve the given roots and write velo.lock
    Lock { formulas: Vec<String> },

    /// Reinstall exactly what velo.lock records
    Restore,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{} {e}", "error:".red().bold());
        std::process::exit(1);
    }
}

async fn run() -> velo::Result<()> {
    let cli = Cli::parse();
    config::init_logging(LogLevel::from_env());
    velo::platform::check_architecture()?;

    let prefix = cli
        .prefix
        .map(Prefix::new)
        .unwrap_or_else(Prefix::default_location);
    prefix.ensure_skeleton()?;

    if std::io::stderr().is_terminal() && !config::prefix_bin_on_path(&prefix) {
        eprintln!(
            "{} {} is not on your PATH",
            "hint:".yellow(),
            prefix.bin().display()
        );
    }

    match cli.command {
        Commands::Install {
            formulas,
            force,
            dry_run,
        } => install(prefix, &formulas, force, dry_run).await,
        Commands::Uninstall { formulas, force } => uninstall(prefix, &formulas, force),
        Commands::List { versions } => list(prefix, versions),
        Commands::Search {
            query,
            descriptions,
        } => search(prefix, &query, descriptions),
        Commands::Info { formula } => info(prefix, &formula),
        Commands::Update { tap, force } => update(prefix, tap, force).await,
        Commands::Default { formula, version } => {
            prefix.set_default_version(&formula, &version)?;
            println!("{} now defaults to {}", formula.bold(), version.cyan());
            Ok(())
        }
        Commands::Lock { formulas } => lock(prefix, &formulas),
        Commands::Restore => restore(prefix).await,
    }
}

fn orchestrator(prefix: Prefix) -> velo::Result<Orchestrator> {
    let defaults = OrchestratorConfig::default();
    let config = OrchestratorConfig {
        max_concurrent_downloads: config::IoPolicy::from_env()
            .download_concurrency(defaults.max_concurrent_downloads),
        abort_on_conflict: true,
    };
    Ok(Orchestrator::new(prefix)?
        .with_config(config)
        .with_sink(Arc::new(CliSink::new())))
}

async fn install(
    prefix: Prefix,
    formulas: &[String],
    force: bool,
    dry_run: bool,
) -> velo::Result<()> {
    if formulas.is_empty() {
        println!("{}", "No formulae specified".red());
        return Ok(());
    }
    let roots: Vec<String> = formulas
        .iter()
        .map(|raw| PackageSpec::parse(raw).name)
        .collect();

    let orchestrator = orchestrator(prefix)?;

    if dry_run {
        let plan = orchestrator.plan(&roots)?;
        println!(
            "Would install {} packages ({} already present), ~{} MB download:",
            plan.new.len().to_string().bold(),
            plan.already_installed.len(),
            plan.estimated_download_bytes / (1024 * 1024)
        );
        for name in &plan.install_order {
            let marker = if plan.new.contains(name) { "+" } else { "=" };
            println!("  {marker} {name}");
        }
        for conflict in &plan.graph.version_conflicts {
            println!(
                "{} {}: {}",
                "conflict:".yellow().bold(),
                conflict.package,
                conflict.describe().join("; ")
            );
        }
        return Ok(());
    }

    let report = orchestrator.install(&roots, force).await?;
    for outcome in &report.installed {
        println!(
            "Installed {} {}",
            outcome.package.bold().green(),
            outcome.version.dimmed()
        );
        for (dest, reason) in &outcome.symlinks_skipped {
            println!("  {} skipped {dest}: {reason}", "!".yellow());
        }
    }
    for name in &report.already_installed {
        println!("{} already installed", name.cyan());
    }
    Ok(())
}

fn uninstall(prefix: Prefix, formulas: &[String], force: bool) -> velo::Result<()> {
    let orchestrator = Orchestrator::new(prefix)?;
    for formula in formulas {
        orchestrator.uninstall(formula, force)?;
        println!("Uninstalled {}", formula.bold().green());
    }
    Ok(())
}

fn list(prefix: Prefix, versions: bool) -> velo::Result<()> {
    let cellar = prefix.cellar();
    if !cellar.exists() {
        return Ok(());
    }
    let mut names: Vec<String> = std::fs::read_dir(&cellar)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();

    for name in names {
        if !prefix.is_installed(&name) {
            continue;
        }
        let installed = prefix.installed_versions(&name)?;
        if versions {
            println!("{} {}", name.bold(), installed.join(", ").dimmed());
        } else if let Some(newest) = installed.last() {
            println!("{} {}", name.bold(), newest.dimmed());
        }
    }
    Ok(())
}

fn search(prefix: Prefix, query: &str, descriptions: bool) -> velo::Result<()> {
    let orchestrator = Orchestrator::new(prefix)?;
    let results = orchestrator.taps().search(query, descriptions)?;
    if results.is_empty() {
        match orchestrator.taps().suggest(query) {
            Some(suggestion) => {
                println!("No matches. Did you mean {}?", suggestion.cyan())
            }
            None => println!("No matches for {}", query.bold()),
        }
        return Ok(());
    }
    for name in results {
        match orchestrator.taps().cache().get(&name) {
            Some(formula) => println!(
                "{} {}",
                name.bold(),
                formula.description.unwrap_or_default().dimmed()
            ),
            None => println!("{}", name.bold()),
        }
    }
    Ok(())
}

fn info(prefix: Prefix, name: &str) -> velo::Result<()> {
    let orchestrator = Orchestrator::new(prefix.clone())?;
    let formula = orchestrator.taps().find_formula(name)?;

    println!("{} {}", formula.name.bold(), formula.version.cyan());
    if let Some(description) = &formula.description {
        println!("{description}");
    }
    if let Some(homepage) = &formula.homepage {
        println!("{}", homepage.underline());
    }
    if let Some(tap) = &formula.tap {
        println!("From: {}", tap.dimmed());
    }

    let required: Vec<&str> = formula
        .required_dependencies()
        .map(|d| d.name.as_str())
        .collect();
    if !required.is_empty() {
        println!("Depends on: {}", required.join(", "));
    }

    let installed = prefix.installed_versions(&formula.name)?;
    if installed.is_empty() {
        println!("Not installed");
    } else {
        println!("Installed: {}", installed.join(", ").green());
    }
    if !formula.has_bottle_for(orchestrator.platform_tag()) {
        println!("{}", "No bottle for this platform".yellow());
    }
    Ok(())
}

async fn update(prefix: Prefix, tap: Option<String>, force: bool) -> velo::Result<()> {
    let orchestrator = orchestrator(prefix)?;
    let max_age = Duration::from_secs(24 * 60 * 60);
    let sink: Arc<dyn ProgressSink> = Arc::new(CliSink::new());

    let taps = match tap {
        Some(tap) => vec![tap],
        None => orchestrator.taps().list_taps()?,
    };
    if taps.is_empty() {
        println!("No taps configured; add one with git into the taps/ directory");
        return Ok(());
    }

    for tap in taps {
        match orchestrator
            .taps()
            .update_tap(&tap, force, max_age, Arc::clone(&sink))
            .await
        {
            Ok(true) => println!("Updated {}", tap.bold().green()),
            Ok(false) => println!("{} already up to date", tap.cyan()),
            Err(e @ VeloError::TapUpdateFailed { .. }) => {
                println!("{} {e}", "warning:".yellow())
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn lock(prefix: Prefix, formulas: &[String]) -> velo::Result<()> {
    let orchestrator = orchestrator(prefix)?;
    let roots: Vec<String> = formulas
        .iter()
        .map(|raw| PackageSpec::parse(raw).name)
        .collect();
    let plan = orchestrator.plan(&roots)?;
    let path = orchestrator.write_lockfile(&plan)?;
    println!(
        "Locked {} packages into {}",
        plan.graph.nodes.len().to_string().bold(),
        path.display()
    );
    Ok(())
}

async fn restore(prefix: Prefix) -> velo::Result<()> {
    let path = prefix.root().join(LOCKFILE_NAME);
    if !path.exists() {
        return Err(VeloError::PathNotFound(path));
    }
    let lockfile = Lockfile::read(&path)?;
    let orchestrator = orchestrator(prefix)?;
    let installed = orchestrator.install_from_lockfile(&lockfile).await?;
    println!(
        "Restored {} packages",
        installed.len().to_string().bold().green()
    );
    Ok(())
}

/// Progress rendering: one indicatif bar per in-flight download, plain
/// lines for everything else.
///
/// Quiet mode: when stdout or stderr is not a terminal (redirected output,
/// CI logs), no bars are drawn and the chatty status lines are suppressed;
/// only failures are still reported, as plain text.
struct CliSink {
    interactive: bool,
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl CliSink {
    fn new() -> Self {
        CliSink {
            interactive: std::io::stdout().is_terminal() && std::io::stderr().is_terminal(),
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar_for(&self, package: &str) -> ProgressBar {
        if !self.interactive {
            return ProgressBar::hidden();
        }
        let mut bars = self.bars.lock().expect("progress lock poisoned");
        bars.entry(package.to_string())
            .or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new(0));
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes}")
                        .unwrap()
                        .progress_chars("━━╸"),
                );
                bar.set_message(format!("Downloading {package}"));
                bar
            })
            .clone()
    }

    fn finish(&self, package: &str, message: String) {
        if let Some(bar) = self
            .bars
            .lock()
            .expect("progress lock poisoned")
            .remove(package)
        {
            bar.finish_with_message(message);
        }
    }

    /// Status line shown only on an interactive terminal.
    fn status(&self, line: String) {
        if self.interactive {
            eprintln!("{line}");
        }
    }
}

impl ProgressSink for CliSink {
    fn handle(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::ResolveStarted { roots } => {
                self.status(format!("Resolving {}...", roots.join(", ")));
            }
            ProgressEvent::ResolveCompleted {
                new,
                already_installed,
            } => {
                self.status(format!(
                    "{new} to install, {already_installed} already present"
                ));
            }
            ProgressEvent::DownloadStarted { package, .. } => {
                self.bar_for(&package);
            }
            ProgressEvent::DownloadProgress {
                package,
                bytes,
                total,
            } => {
                let bar = self.bar_for(&package);
                if let Some(total) = total {
                    bar.set_length(total);
                }
                bar.set_position(bytes);
            }
            ProgressEvent::DownloadCompleted { package } => {
                self.finish(&package, format!("✓ {package}"));
            }
            ProgressEvent::DownloadFailed { package, reason } => {
                self.finish(&package, format!("✗ {package}: {reason}"));
                if !self.interactive {
                    eprintln!("download of {package} failed: {reason}");
                }
            }
            ProgressEvent::InstallStarted { package, version } => {
                self.status(format!(
                    "  Installing {} {}...",
                    package.bold(),
                    version.dimmed()
                ));
            }
            ProgressEvent::InstallCompleted { .. } => {}
            ProgressEvent::InstallFailed { package, reason } => {
                // Failures are reported even with output redirected.
                eprintln!("  {} {package}: {reason}", "✗".red());
            }
            ProgressEvent::TapUpdateStarted { tap } => {
                self.status(format!("Updating {tap}..."));
            }
            ProgressEvent::TapUpdateHeartbeat { tap, elapsed_secs } => {
                self.status(format!("  still updating {tap} ({elapsed_secs}s)..."));
            }
            ProgressEvent::TapUpdateCompleted { .. } => {}
        }
    }
}
