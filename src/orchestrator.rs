//! Orchestrator — resolve, download, install, record.
//!
//! The happy path: resolve an install plan from the requested roots,
//! download every missing bottle in parallel (bounded by
//! `max_concurrent_downloads`), then install strictly serially in
//! topological order. A download failure aborts before any new package is
//! installed; an install failure aborts the run but leaves already-installed
//! packages in place. Every successful install writes a receipt recording
//! whether it was explicit or pulled in as a dependency.

use crate::download::{Downloader, hash_file};
use crate::error::{Result, VeloError};
use crate::formula::{Bottle, Formula};
use crate::install::{InstallOptions, InstallOutcome, Installer};
use crate::lockfile::{LOCKFILE_NAME, Lockfile};
use crate::prefix::Prefix;
use crate::progress::{DownloadProgressHandle, ProgressEvent, ProgressSink, null_sink};
use crate::receipt::{InstalledAs, Receipt};
use crate::resolver::{DependencyGraph, DependencyNode, InstallPlan, Resolver};
use crate::tap::TapManager;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Orchestration policy knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Whole-package download workers.
    pub max_concurrent_downloads: usize,
    /// Abort when the resolver reports version conflicts. Conflicts are
    /// always surfaced in the plan either way.
    pub abort_on_conflict: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            max_concurrent_downloads: 4,
            abort_on_conflict: false,
        }
    }
}

/// Result of one orchestration run.
#[derive(Debug)]
pub struct InstallReport {
    pub installed: Vec<InstallOutcome>,
    pub already_installed: Vec<String>,
    pub plan: InstallPlan,
}

/// Drives resolve → download → install against one prefix.
pub struct Orchestrator {
    prefix: Prefix,
    taps: Arc<TapManager>,
    downloader: Downloader,
    installer: Installer,
    platform_tag: String,
    config: OrchestratorConfig,
    sink: Arc<dyn ProgressSink>,
}

impl Orchestrator {
    pub fn new(prefix: Prefix) -> Result<Self> {
        let platform_tag = crate::platform::detect_bottle_tag()?;
        let taps = Arc::new(TapManager::new(prefix.clone()));
        Ok(Orchestrator {
            installer: Installer::new(prefix.clone()),
            downloader: Downloader::new()?,
            taps,
            platform_tag,
            config: OrchestratorConfig::default(),
            sink: null_sink(),
            prefix,
        })
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Override the detected platform tag (tests, project-local pins).
    pub fn with_platform_tag(mut self, platform_tag: impl Into<String>) -> Self {
        self.platform_tag = platform_tag.into();
        self
    }

    /// Use a downloader with non-default configuration.
    pub fn with_downloader(mut self, downloader: Downloader) -> Self {
        self.downloader = downloader;
        self
    }

    pub fn taps(&self) -> &Arc<TapManager> {
        &self.taps
    }

    pub fn installer(&self) -> &Installer {
        &self.installer
    }

    pub fn prefix(&self) -> &Prefix {
        &self.prefix
    }

    pub fn platform_tag(&self) -> &str {
        &self.platform_tag
    }

    /// Resolve only; no side effects beyond formula caching.
    pub fn plan(&self, roots: &[String]) -> Result<InstallPlan> {
        self.sink.handle(ProgressEvent::ResolveStarted {
            roots: roots.to_vec(),
        });
        let resolver = Resolver::new(self.taps.as_ref(), &self.prefix, &self.platform_tag);
        let plan = resolver.resolve(roots)?;
        self.sink.handle(ProgressEvent::ResolveCompleted {
            new: plan.new.len(),
            already_installed: plan.already_installed.len(),
        });
        Ok(plan)
    }

    /// The full happy path for a set of roots.
    pub async fn install(&self, roots: &[String], force: bool) -> Result<InstallReport> {
        let plan = self.plan(roots)?;

        if plan.has_conflicts() {
            for conflict in &plan.graph.version_conflicts {
                tracing::warn!(
                    "version conflict on {}: {}",
                    conflict.package,
                    conflict.describe().join("; ")
                );
            }
            if self.config.abort_on_conflict {
                let first = &plan.graph.version_conflicts[0];
                return Err(VeloError::VersionConflict {
                    package: first.package.clone(),
                    requirements: first.describe(),
                });
            }
        }

        let to_install: Vec<&DependencyNode> = plan
            .install_order
            .iter()
            .filter_map(|name| plan.node(name))
            .filter(|node| {
                !node.is_installed || (force && plan.roots.contains(&node.canonical_name))
            })
            .collect();

        let bottles = self.download_all(&to_install).await?;

        let mut installed = Vec::new();
        for node in &to_install {
            let name = node.canonical_name.as_str();
            let bottle_path = bottles
                .get(name)
                .ok_or_else(|| VeloError::install_failure(name, "bottle missing after download"))?;

            self.sink.handle(ProgressEvent::InstallStarted {
                package: name.to_string(),
                version: node.formula.version.clone(),
            });

            let options = InstallOptions {
                force: force || node.is_installed,
                create_symlinks: true,
            };
            let outcome = match self.installer.install(&node.formula, bottle_path, &options) {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.sink.handle(ProgressEvent::InstallFailed {
                        package: name.to_string(),
                        reason: e.to_string(),
                    });
                    // Packages installed earlier in the order stay.
                    return Err(e);
                }
            };

            self.record_receipt(&plan, node, &outcome)?;

            self.sink.handle(ProgressEvent::InstallCompleted {
                package: name.to_string(),
                version: node.formula.version.clone(),
            });
            installed.push(outcome);
        }

        Ok(InstallReport {
            installed,
            already_installed: plan.already_installed.clone(),
            plan,
        })
    }

    /// Uninstall with the dependents safety check.
    pub fn uninstall(&self, name: &str, force: bool) -> Result<()> {
        let receipts = self.installer.receipts();
        if !force {
            let dependents: Vec<String> = receipts
                .dependents_of(name)?
                .into_iter()
                .filter(|dependent| self.prefix.is_installed(dependent))
                .collect();
            if !dependents.is_empty() {
                return Err(VeloError::install_failure(
                    name,
                    format!("required by {}", dependents.join(", ")),
                ));
            }
        }

        self.installer.uninstall(name)?;
        receipts.forget_dependent(name)?;
        Ok(())
    }

    /// Pin the given plan into `<prefix>/velo.lock`.
    pub fn write_lockfile(&self, plan: &InstallPlan) -> Result<PathBuf> {
        let metadata = crate::cache::TapMetadataStore::new(&self.prefix.cache());
        let lockfile = Lockfile::from_plan(plan, &self.platform_tag, &metadata);
        let path = self.prefix.root().join(LOCKFILE_NAME);
        lockfile.write(&path)?;
        Ok(path)
    }

    /// Reinstall exactly what a lockfile records, in dependency order.
    pub async fn install_from_lockfile(&self, lockfile: &Lockfile) -> Result<Vec<InstallOutcome>> {
        let mut graph = DependencyGraph::default();
        for (name, locked) in &lockfile.dependencies {
            let formula = Formula {
                name: name.clone(),
                version: locked.version.clone(),
                description: None,
                homepage: None,
                dependencies: vec![],
                bottles: vec![Bottle {
                    platform_tag: self.platform_tag.clone(),
                    sha256: locked.sha256.clone().unwrap_or_default(),
                    url: locked.resolved_url.clone(),
                    root_url: None,
                    size: None,
                }],
                source_sha256: None,
                tap: locked.tap.clone(),
            };
            graph.nodes.insert(
                name.clone(),
                DependencyNode {
                    canonical_name: name.clone(),
                    formula,
                    requirements: vec![],
                    is_installed: self.prefix.is_installed(name),
                    equivalent_names: crate::equivalence::equivalent_names(name),
                },
            );
            graph.depends_on.insert(
                name.clone(),
                locked.deps.iter().cloned().collect::<BTreeSet<_>>(),
            );
        }

        let order = graph.topological_order()?;
        let to_install: Vec<&DependencyNode> = order
            .iter()
            .filter_map(|name| graph.nodes.get(name))
            .filter(|node| !node.is_installed)
            .collect();

        let bottles = self.download_all(&to_install).await?;

        let mut installed = Vec::new();
        for node in &to_install {
            let bottle_path = &bottles[node.canonical_name.as_str()];
            let outcome =
                self.installer
                    .install(&node.formula, bottle_path, &InstallOptions::default())?;
            let receipt = Receipt::new(
                node.canonical_name.clone(),
                node.formula.version.clone(),
                InstalledAs::Explicit,
                vec![],
                outcome.symlinks_created.clone(),
            );
            self.installer.receipts().save(&receipt)?;
            installed.push(outcome);
        }
        Ok(installed)
    }

    /// Download every bottle in parallel. All downloads are attempted; any
    /// failure aborts the run with an aggregate error before installing.
    async fn download_all(
        &self,
        nodes: &[&DependencyNode],
    ) -> Result<HashMap<String, PathBuf>> {
        let downloads_dir = self.prefix.cache().join("downloads");
        tokio::fs::create_dir_all(&downloads_dir).await?;

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_downloads.max(1)));
        let mut tasks = Vec::new();

        for node in nodes {
            let name = node.canonical_name.clone();
            let version = node.formula.version.clone();

            let Some(bottle) = node.formula.preferred_bottle(&self.platform_tag) else {
                tasks.push(tokio::spawn(async move {
                    (
                        name.clone(),
                        Err(VeloError::BottleNotAccessible {
                            url: String::new(),
                            reason: format!("no bottle of {name} {version} for this platform"),
                        }),
                    )
                }));
                continue;
            };
            let Some(url) = bottle.resolved_url(&node.formula.name, &version) else {
                tasks.push(tokio::spawn(async move {
                    (
                        name.clone(),
                        Err(VeloError::BottleNotAccessible {
                            url: String::new(),
                            reason: format!("bottle of {name} {version} has no download URL"),
                        }),
                    )
                }));
                continue;
            };

            let sha256 = bottle.sha256.clone();
            let destination = downloads_dir.join(format!(
                "{}--{}.{}.bottle.tar.gz",
                node.formula.name, version, self.platform_tag
            ));
            let downloader = self.downloader.clone();
            let sink = Arc::clone(&self.sink);
            let semaphore = Arc::clone(&semaphore);

            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let handle = DownloadProgressHandle::new(sink, name.clone());

                // Cached bottles with a matching digest are reused.
                if destination.exists()
                    && !sha256.is_empty()
                    && hash_file(&destination)
                        .map(|actual| actual.eq_ignore_ascii_case(&sha256))
                        .unwrap_or(false)
                {
                    handle.completed();
                    return (name, Ok(destination));
                }

                let expected = (!sha256.is_empty()).then_some(sha256.as_str());
                let result = downloader
                    .download(&url, &destination, expected, Some(&handle))
                    .await
                    .map(|()| destination);
                (name, result)
            }));
        }

        let mut bottles = HashMap::new();
        let mut failures: BTreeMap<String, String> = BTreeMap::new();
        for task in tasks {
            let (name, result) = task
                .await
                .map_err(|e| VeloError::Other(anyhow::anyhow!("download task panicked: {e}")))?;
            match result {
                Ok(path) => {
                    bottles.insert(name, path);
                }
                Err(e) => {
                    failures.insert(name, e.to_string());
                }
            }
        }

        if !failures.is_empty() {
            let summary = failures
                .iter()
                .map(|(name, reason)| format!("{name}: {reason}"))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(VeloError::InstallationFailed {
                package: failures.keys().cloned().collect::<Vec<_>>().join(", "),
                reason: summary,
            });
        }

        Ok(bottles)
    }

    /// Write the receipt for one installed node and register it with the
    /// receipts of the dependencies it uses.
    fn record_receipt(
        &self,
        plan: &InstallPlan,
        node: &DependencyNode,
        outcome: &InstallOutcome,
    ) -> Result<()> {
        let name = node.canonical_name.as_str();
        let is_root = plan.roots.iter().any(|root| root == name);
        let installed_as = if is_root {
            InstalledAs::Explicit
        } else {
            InstalledAs::Dependency
        };
        let requested_by = if is_root {
            vec![]
        } else {
            plan.dependents_of(name)
        };

        let receipt = Receipt::new(
            name,
            node.formula.version.clone(),
            installed_as,
            requested_by,
            outcome.symlinks_created.clone(),
        );
        self.installer.receipts().save(&receipt)?;

        // Dependencies installed in earlier runs learn their new dependent.
        if let Some(prerequisites) = plan.graph.depends_on.get(name) {
            for prerequisite in prerequisites {
                if let Some(version) = self.prefix.latest_installed_version(prerequisite)? {
                    match self
                        .installer
                        .receipts()
                        .add_dependent(name, prerequisite, &version)
                    {
                        Ok(()) | Err(VeloError::ReceiptNotFound { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(())
    }
}
