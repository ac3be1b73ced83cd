//! Tap management — formula repositories under `taps/<org>/<repo>`.
//!
//! A tap is a git repository of formula files, laid out either flat
//! (`Formula/wget.rb`) or sharded by first letter (`Formula/w/wget.rb`); both
//! layouts are accepted. The manager owns cloning and updating taps, the
//! process-wide single-flight update guard, and formula lookup across taps in
//! priority order.

use crate::cache::{FormulaCache, SearchIndex, TapMetadataStore};
use crate::error::{Result, VeloError};
use crate::formula::Formula;
use crate::parser::{FormulaParser, default_parser};
use crate::prefix::Prefix;
use crate::progress::{ProgressEvent, ProgressSink, null_sink};
use chrono::{SecondsFormat, Utc};
use std::fs;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Process-wide "update in progress" flag; concurrent requests return
/// immediately instead of queueing behind the running update.
static UPDATE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

/// Timing knobs for tap updates.
#[derive(Debug, Clone)]
pub struct TapConfig {
    /// Hard ceiling on one clone-or-pull operation.
    pub update_timeout: Duration,
    /// Interval between progress heartbeats while git runs.
    pub heartbeat_interval: Duration,
}

impl Default for TapConfig {
    fn default() -> Self {
        TapConfig {
            update_timeout: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

/// Parse an `org/repo` tap name.
pub fn parse_tap_name(tap: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = tap.split('/').collect();
    match parts.as_slice() {
        [org, repo] if !org.is_empty() && !repo.is_empty() => {
            Ok((org.to_string(), repo.to_string()))
        }
        _ => Err(VeloError::InvalidTapName(tap.to_string())),
    }
}

/// Owns tap repositories and formula lookup across them.
pub struct TapManager {
    prefix: Prefix,
    cache: Arc<FormulaCache>,
    metadata: TapMetadataStore,
    parser: Arc<dyn FormulaParser>,
    config: TapConfig,
}

impl TapManager {
    pub fn new(prefix: Prefix) -> Self {
        let cache = Arc::new(FormulaCache::new(prefix.cache()));
        Self::with_parts(prefix, cache, default_parser(), TapConfig::default())
    }

    pub fn with_parts(
        prefix: Prefix,
        cache: Arc<FormulaCache>,
        parser: Arc<dyn FormulaParser>,
        config: TapConfig,
    ) -> Self {
        let metadata = TapMetadataStore::new(&prefix.cache());
        TapManager {
            prefix,
            cache,
            metadata,
            parser,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<FormulaCache> {
        &self.cache
    }

    pub fn tap_dir(&self, tap: &str) -> Result<PathBuf> {
        let (org, repo) = parse_tap_name(tap)?;
        Ok(self.prefix.taps().join(org).join(repo))
    }

    /// All taps on disk, `homebrew/core` first, then other `homebrew/*`
    /// taps, then the rest alphabetically.
    pub fn list_taps(&self) -> Result<Vec<String>> {
        let taps_root = self.prefix.taps();
        if !taps_root.exists() {
            return Ok(vec![]);
        }

        let mut taps = Vec::new();
        for org_entry in fs::read_dir(&taps_root)? {
            let org_entry = org_entry?;
            let org = org_entry.file_name().to_string_lossy().to_string();
            if org.starts_with('.') || !org_entry.path().is_dir() {
                continue;
            }
            for repo_entry in fs::read_dir(org_entry.path())? {
                let repo_entry = repo_entry?;
                let repo = repo_entry.file_name().to_string_lossy().to_string();
                if repo.starts_with('.') || !repo_entry.path().is_dir() {
                    continue;
                }
                taps.push(format!("{org}/{repo}"));
            }
        }

        taps.sort_by(|a, b| tap_priority(a).cmp(&tap_priority(b)).then_with(|| a.cmp(b)));
        Ok(taps)
    }

    pub fn is_tapped(&self, tap: &str) -> Result<bool> {
        Ok(self.tap_dir(tap)?.is_dir())
    }

    /// Clone a tap that is not yet on disk.
    pub async fn add_tap(&self, tap: &str, git_url: Option<&str>) -> Result<()> {
        let dir = self.tap_dir(tap)?;
        if dir.exists() {
            return Ok(());
        }
        let (org, repo) = parse_tap_name(tap)?;
        let url = git_url
            .map(String::from)
            .unwrap_or_else(|| format!("https://github.com/{org}/{repo}.git"));

        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent)?;
        }

        let dir_str = dir.to_string_lossy();
        let output = self
            .run_git(
                tap,
                &["clone", "--depth", "1", url.as_str(), dir_str.as_ref()],
                null_sink(),
            )
            .await?;
        if !output.status.success() {
            return Err(VeloError::TapCloneFailed {
                tap: tap.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Clone-or-pull a tap, honouring the freshness window and the
    /// process-wide single-flight guard.
    ///
    /// Returns `true` when an update actually ran. A detached-head checkout
    /// is a no-op; concurrent callers return immediately.
    pub async fn update_tap(
        &self,
        tap: &str,
        force: bool,
        max_age: Duration,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<bool> {
        let dir = self.tap_dir(tap)?;

        if !force {
            if let Some(meta) = self.metadata.get(tap) {
                if let Some(last_updated) = meta.last_updated.as_deref() {
                    if let Ok(when) = chrono::DateTime::parse_from_rfc3339(last_updated) {
                        let age = Utc::now().signed_duration_since(when.with_timezone(&Utc));
                        if age.to_std().map(|a| a < max_age).unwrap_or(true) {
                            tracing::debug!("tap {tap} is fresh, skipping update");
                            return Ok(false);
                        }
                    }
                }
            }
        }

        if UPDATE_IN_PROGRESS
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("tap update already in progress");
            return Ok(false);
        }
        let _guard = UpdateGuard;

        sink.handle(ProgressEvent::TapUpdateStarted {
            tap: tap.to_string(),
        });
        let started = Instant::now();

        if dir.join(".git").exists() {
            // A detached HEAD means the user pinned the tap; leave it alone.
            if self.is_detached_head(&dir).await? {
                tracing::warn!("tap {tap} is on a detached HEAD, not updating");
                return Ok(false);
            }

            let dir_str = dir.to_string_lossy();
            let output = self
                .run_git(
                    tap,
                    &["-C", dir_str.as_ref(), "pull", "--ff-only", "--quiet"],
                    Arc::clone(&sink),
                )
                .await?;
            if !output.status.success() {
                return Err(VeloError::TapUpdateFailed {
                    tap: tap.to_string(),
                    reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
        } else {
            self.add_tap(tap, None).await?;
        }

        let last_commit = self.head_commit(&dir).await;
        self.metadata.update(tap, |meta| {
            meta.last_updated = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
            meta.last_commit = last_commit.clone();
            meta.update_duration = Some(started.elapsed().as_secs_f64());
        })?;

        sink.handle(ProgressEvent::TapUpdateCompleted {
            tap: tap.to_string(),
        });
        Ok(true)
    }

    async fn is_detached_head(&self, dir: &std::path::Path) -> Result<bool> {
        let dir_str = dir.to_string_lossy();
        let status = tokio::process::Command::new("git")
            .args(["-C", dir_str.as_ref(), "symbolic-ref", "-q", "HEAD"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        Ok(!status.success())
    }

    async fn head_commit(&self, dir: &std::path::Path) -> Option<String> {
        let dir_str = dir.to_string_lossy();
        let output = tokio::process::Command::new("git")
            .args(["-C", dir_str.as_ref(), "rev-parse", "HEAD"])
            .output()
            .await
            .ok()?;
        if output.status.success() {
            Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            None
        }
    }

    /// Run git under the update timeout, emitting heartbeats while it works.
    async fn run_git(
        &self,
        tap: &str,
        args: &[&str],
        sink: Arc<dyn ProgressSink>,
    ) -> Result<std::process::Output> {
        let mut command = tokio::process::Command::new("git");
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn()?;

        let heartbeat = {
            let sink = Arc::clone(&sink);
            let tap = tap.to_string();
            let interval = self.config.heartbeat_interval;
            let started = Instant::now();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // the immediate first tick
                loop {
                    ticker.tick().await;
                    sink.handle(ProgressEvent::TapUpdateHeartbeat {
                        tap: tap.clone(),
                        elapsed_secs: started.elapsed().as_secs(),
                    });
                }
            })
        };

        let result = tokio::time::timeout(self.config.update_timeout, child.wait_with_output()).await;
        heartbeat.abort();

        match result {
            Ok(output) => Ok(output?),
            Err(_) => Err(VeloError::TapUpdateFailed {
                tap: tap.to_string(),
                reason: format!(
                    "timed out after {}s",
                    self.config.update_timeout.as_secs()
                ),
            }),
        }
    }

    /// Path of the formula file for `name` in `tap`, trying the flat layout
    /// then the first-letter sharded layout.
    pub fn formula_path(&self, tap: &str, name: &str) -> Result<Option<PathBuf>> {
        let formula_dir = self.tap_dir(tap)?.join("Formula");
        let flat = formula_dir.join(format!("{name}.rb"));
        if flat.is_file() {
            return Ok(Some(flat));
        }
        if let Some(first) = name.chars().next() {
            let sharded = formula_dir
                .join(first.to_lowercase().to_string())
                .join(format!("{name}.rb"));
            if sharded.is_file() {
                return Ok(Some(sharded));
            }
        }
        Ok(None)
    }

    /// Locate a formula: cache → index case-insensitive match → direct parse
    /// from taps in priority order → debug fixtures. Located formulas are
    /// cached before return.
    pub fn find_formula(&self, name: &str) -> Result<Formula> {
        if let Some(cached) = self.cache.get(name) {
            return Ok(cached);
        }

        let taps = self.list_taps()?;

        // Case-insensitive spelling fix through the persisted indexes.
        for tap in &taps {
            if let Some(index) = SearchIndex::load(&self.prefix.cache(), tap) {
                if let Some(actual) = index.lookup(name) {
                    if actual != name {
                        if let Some(cached) = self.cache.get(actual) {
                            return Ok(cached);
                        }
                    }
                    if let Some(formula) = self.parse_from_tap(tap, actual)? {
                        self.cache.set(&formula)?;
                        return Ok(formula);
                    }
                }
            }
        }

        for tap in &taps {
            if let Some(formula) = self.parse_from_tap(tap, name)? {
                self.cache.set(&formula)?;
                return Ok(formula);
            }
        }

        #[cfg(debug_assertions)]
        if let Some(formula) = self.fixture_formula(name) {
            self.cache.set(&formula)?;
            return Ok(formula);
        }

        Err(VeloError::FormulaNotFound(name.to_string()))
    }

    fn parse_from_tap(&self, tap: &str, name: &str) -> Result<Option<Formula>> {
        let Some(path) = self.formula_path(tap, name)? else {
            return Ok(None);
        };
        let source = fs::read_to_string(&path)?;
        let mut formula = self.parser.parse(name, &source)?;
        formula.tap = Some(tap.to_string());
        Ok(Some(formula))
    }

    /// JSON fixtures for tests, honoured in debug builds only.
    #[cfg(debug_assertions)]
    fn fixture_formula(&self, name: &str) -> Option<Formula> {
        let dir = std::env::var_os("VELO_TEST_FIXTURES")?;
        let path = PathBuf::from(dir).join(format!("{name}.json"));
        let contents = fs::read_to_string(path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Rebuild and persist the search index for one tap, preloading every
    /// parsed formula into the cache.
    pub fn build_index(&self, tap: &str) -> Result<SearchIndex> {
        let formula_dir = self.tap_dir(tap)?.join("Formula");
        if !formula_dir.is_dir() {
            return Err(VeloError::TapNotFound(tap.to_string()));
        }

        let mut formulas = Vec::new();
        for path in formula_files(&formula_dir)? {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let source = fs::read_to_string(&path)?;
            match self.parser.parse(stem, &source) {
                Ok(mut formula) => {
                    formula.tap = Some(tap.to_string());
                    formulas.push(formula);
                }
                Err(e) => tracing::warn!("skipping {}: {e}", path.display()),
            }
        }

        self.cache.preload(&formulas)?;
        let index = SearchIndex::build(&formulas);
        index.save(&self.prefix.cache(), tap)?;
        self.metadata.update(tap, |meta| {
            meta.search_index_built = Some(index.built_at.clone());
        })?;
        Ok(index)
    }

    /// A usable index for `tap`: the persisted one when fresh, else rebuilt.
    pub fn fresh_index(&self, tap: &str) -> Result<SearchIndex> {
        let last_updated = self.metadata.get(tap).and_then(|m| m.last_updated);
        if let Some(index) = SearchIndex::load(&self.prefix.cache(), tap) {
            if index.is_fresh(last_updated.as_deref()) {
                return Ok(index);
            }
        }
        self.build_index(tap)
    }

    /// Search across every tap, merging ranked per-tap results.
    pub fn search(&self, term: &str, include_descriptions: bool) -> Result<Vec<String>> {
        let mut results = Vec::new();
        for tap in self.list_taps()? {
            for hit in self.fresh_index(&tap)?.search(term, include_descriptions) {
                if !results.contains(&hit) {
                    results.push(hit);
                }
            }
        }
        Ok(results)
    }

    /// Closest known name for "did you mean" output.
    pub fn suggest(&self, term: &str) -> Option<String> {
        for tap in self.list_taps().ok()? {
            if let Some(index) = SearchIndex::load(&self.prefix.cache(), &tap) {
                if let Some(hit) = index.suggest(term) {
                    return Some(hit);
                }
            }
        }
        None
    }
}

struct UpdateGuard;

impl Drop for UpdateGuard {
    fn drop(&mut self) {
        UPDATE_IN_PROGRESS.store(false, Ordering::SeqCst);
    }
}

/// Lookup priority: `homebrew/core`, then other `homebrew/*`, then the rest.
fn tap_priority(tap: &str) -> u8 {
    if tap == "homebrew/core" {
        0
    } else if tap.starts_with("homebrew/") {
        1
    } else {
        2
    }
}

/// All `.rb` files in a Formula directory, flat or first-letter sharded.
fn formula_files(formula_dir: &std::path::Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(formula_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "rb") {
            files.push(path);
        } else if path.is_dir() {
            for nested in fs::read_dir(&path)? {
                let nested = nested?.path();
                if nested.is_file() && nested.extension().is_some_and(|e| e == "rb") {
                    files.push(nested);
                }
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_formula(prefix: &Prefix, tap: &str, name: &str, version: &str, sharded: bool) {
        let (org, repo) = parse_tap_name(tap).unwrap();
        let mut dir = prefix.taps().join(org).join(repo).join("Formula");
        if sharded {
            dir = dir.join(&name[..1]);
        }
        fs::create_dir_all(&dir).unwrap();
        let class = name
            .chars()
            .next()
            .unwrap()
            .to_uppercase()
            .collect::<String>()
            + &name[1..];
        let source = format!(
            "class {class} < Formula\n  desc \"{name} tool\"\n  url \"https://example.com/{name}-{version}.tar.gz\"\nend\n"
        );
        fs::write(dir.join(format!("{name}.rb")), source).unwrap();
    }

    fn manager() -> (TempDir, TapManager) {
        let tmp = TempDir::new().unwrap();
        let prefix = Prefix::new(tmp.path());
        prefix.ensure_skeleton().unwrap();
        (tmp, TapManager::new(prefix.clone()))
    }

    #[test]
    fn test_parse_tap_name() {
        let (org, repo) = parse_tap_name("homebrew/core").unwrap();
        assert_eq!(org, "homebrew");
        assert_eq!(repo, "core");

        assert!(matches!(
            parse_tap_name("invalid"),
            Err(VeloError::InvalidTapName(_))
        ));
        assert!(matches!(
            parse_tap_name("too/many/slashes"),
            Err(VeloError::InvalidTapName(_))
        ));
        assert!(matches!(
            parse_tap_name("/repo"),
            Err(VeloError::InvalidTapName(_))
        ));
    }

    #[test]
    fn taps_listed_in_priority_order() {
        let (_tmp, manager) = manager();
        write_formula(&manager.prefix, "zeta/tools", "ztool", "1.0.0", false);
        write_formula(&manager.prefix, "homebrew/extras", "etool", "1.0.0", false);
        write_formula(&manager.prefix, "homebrew/core", "wget", "1.24.5", false);
        write_formula(&manager.prefix, "acme/tools", "atool", "1.0.0", false);

        let taps = manager.list_taps().unwrap();
        assert_eq!(
            taps,
            vec!["homebrew/core", "homebrew/extras", "acme/tools", "zeta/tools"]
        );
    }

    #[test]
    fn finds_formula_in_flat_and_sharded_layouts() {
        let (_tmp, manager) = manager();
        write_formula(&manager.prefix, "homebrew/core", "wget", "1.24.5", false);
        write_formula(&manager.prefix, "homebrew/core", "ripgrep", "14.1.0", true);

        let wget = manager.find_formula("wget").unwrap();
        assert_eq!(wget.version, "1.24.5");
        assert_eq!(wget.tap.as_deref(), Some("homebrew/core"));

        let ripgrep = manager.find_formula("ripgrep").unwrap();
        assert_eq!(ripgrep.version, "14.1.0");
    }

    #[test]
    fn located_formulas_are_cached() {
        let (_tmp, manager) = manager();
        write_formula(&manager.prefix, "homebrew/core", "wget", "1.24.5", false);

        manager.find_formula("wget").unwrap();
        // Remove the tap file; the cache must still answer.
        fs::remove_file(
            manager
                .formula_path("homebrew/core", "wget")
                .unwrap()
                .unwrap(),
        )
        .unwrap();
        let again = manager.find_formula("wget").unwrap();
        assert_eq!(again.version, "1.24.5");
    }

    #[test]
    fn earlier_tap_wins_lookup() {
        let (_tmp, manager) = manager();
        write_formula(&manager.prefix, "homebrew/core", "tool", "2.0.0", false);
        write_formula(&manager.prefix, "acme/tools", "tool", "9.9.9", false);

        let found = manager.find_formula("tool").unwrap();
        assert_eq!(found.version, "2.0.0");
        assert_eq!(found.tap.as_deref(), Some("homebrew/core"));
    }

    #[test]
    fn unknown_formula_is_not_found() {
        let (_tmp, manager) = manager();
        write_formula(&manager.prefix, "homebrew/core", "wget", "1.24.5", false);
        assert!(matches!(
            manager.find_formula("no-such-thing"),
            Err(VeloError::FormulaNotFound(_))
        ));
    }

    #[test]
    fn index_search_and_case_insensitive_lookup() {
        let (_tmp, manager) = manager();
        write_formula(&manager.prefix, "homebrew/core", "wget", "1.24.5", false);
        write_formula(&manager.prefix, "homebrew/core", "wget2", "2.1.0", false);
        manager.build_index("homebrew/core").unwrap();

        let results = manager.search("wget", false).unwrap();
        assert_eq!(results, vec!["wget", "wget2"]);

        // Wrong case resolves through the index.
        let found = manager.find_formula("WGET").unwrap();
        assert_eq!(found.name, "wget");
    }

    #[tokio::test]
    async fn update_is_single_flight() {
        let (_tmp, manager) = manager();
        write_formula(&manager.prefix, "homebrew/core", "wget", "1.24.5", false);

        UPDATE_IN_PROGRESS.store(true, Ordering::SeqCst);
        let ran = manager
            .update_tap("homebrew/core", true, Duration::ZERO, null_sink())
            .await
            .unwrap();
        UPDATE_IN_PROGRESS.store(false, Ordering::SeqCst);
        assert!(!ran);
    }

    #[tokio::test]
    async fn fresh_tap_skips_update() {
        let (_tmp, manager) = manager();
        manager
            .metadata
            .update("homebrew/core", |m| {
                m.last_updated = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
            })
            .unwrap();

        let ran = manager
            .update_tap(
                "homebrew/core",
                false,
                Duration::from_secs(24 * 60 * 60),
                null_sink(),
            )
            .await
            .unwrap();
        assert!(!ran);
    }
}
