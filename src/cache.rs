//! Formula cache and search index.
//!
//! Two-tier memoisation over parsed formula records:
//!
//! - **Memory tier**: a bounded `moka` cache (default 1000 entries) shared by
//!   concurrent readers; lasts for the process lifetime.
//! - **Disk tier**: one `cache/formula-<name>.velocache` JSON file per
//!   formula, authoritative across runs.
//!
//! `set` writes both tiers, so a reader observing a slightly stale memory
//! entry between a `set` and its own `get` still converges via disk. The
//! search index is persisted per tap alongside a build timestamp and is
//! considered fresh iff that timestamp is not older than the tap's last
//! update.

use crate::error::Result;
use crate::formula::Formula;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const DEFAULT_MAX_MEMORY_ENTRIES: u64 = 1000;
const FORMULA_PREFIX: &str = "formula-";
const CACHE_EXTENSION: &str = "velocache";

/// Two-tier formula cache rooted at a prefix's `cache/` directory.
pub struct FormulaCache {
    cache_dir: PathBuf,
    memory: moka::sync::Cache<String, Formula>,
    disk_write: Mutex<()>,
}

impl FormulaCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self::with_capacity(cache_dir, DEFAULT_MAX_MEMORY_ENTRIES)
    }

    pub fn with_capacity(cache_dir: impl Into<PathBuf>, max_memory_entries: u64) -> Self {
        FormulaCache {
            cache_dir: cache_dir.into(),
            memory: moka::sync::Cache::new(max_memory_entries),
            disk_write: Mutex::new(()),
        }
    }

    fn disk_path(&self, name: &str) -> PathBuf {
        let safe = name.replace('/', "-");
        self.cache_dir
            .join(format!("{FORMULA_PREFIX}{safe}.{CACHE_EXTENSION}"))
    }

    /// Look up a formula: memory first, then disk (re-populating memory).
    pub fn get(&self, name: &str) -> Option<Formula> {
        if let Some(hit) = self.memory.get(name) {
            return Some(hit);
        }

        let path = self.disk_path(name);
        let contents = fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<Formula>(&contents) {
            Ok(formula) => {
                self.memory.insert(name.to_string(), formula.clone());
                Some(formula)
            }
            Err(e) => {
                tracing::warn!("discarding unreadable cache entry {}: {e}", path.display());
                None
            }
        }
    }

    /// Store a formula in both tiers.
    pub fn set(&self, formula: &Formula) -> Result<()> {
        self.memory
            .insert(formula.name.clone(), formula.clone());

        let _guard = self.disk_write.lock().expect("cache lock poisoned");
        fs::create_dir_all(&self.cache_dir)?;
        let json = serde_json::to_string(formula)?;
        fs::write(self.disk_path(&formula.name), json)?;
        Ok(())
    }

    /// Batch writer used when building a full tap index.
    pub fn preload(&self, formulas: &[Formula]) -> Result<()> {
        for formula in formulas {
            self.set(formula)?;
        }
        Ok(())
    }

    /// Drop every cached formula from both tiers.
    pub fn clear(&self) -> Result<()> {
        self.memory.invalidate_all();

        let _guard = self.disk_write.lock().expect("cache lock poisoned");
        if !self.cache_dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with(FORMULA_PREFIX) {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

/// Case-insensitive name and keyword index over one tap's formulas.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchIndex {
    /// RFC 3339 build timestamp, compared against the tap's last update.
    pub built_at: String,
    /// lowercased name → actual name
    names: BTreeMap<String, String>,
    /// description keyword → names mentioning it
    keywords: BTreeMap<String, BTreeSet<String>>,
}

impl SearchIndex {
    /// Build an index over a batch of formulas, stamped now.
    pub fn build(formulas: &[Formula]) -> Self {
        let mut index = SearchIndex {
            built_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            ..Default::default()
        };
        for formula in formulas {
            index.add(formula);
        }
        index
    }

    pub fn add(&mut self, formula: &Formula) {
        self.names
            .insert(formula.name.to_lowercase(), formula.name.clone());

        if let Some(description) = &formula.description {
            for token in description.split_whitespace() {
                let keyword = token.to_lowercase();
                if keyword.len() > 2 {
                    self.keywords
                        .entry(keyword)
                        .or_default()
                        .insert(formula.name.clone());
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Exact case-insensitive lookup of an actual formula name.
    pub fn lookup(&self, name: &str) -> Option<&str> {
        self.names.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Names matching `term`, exact case-folded matches first, then
    /// alphabetical. With `include_descriptions`, keyword hits count too.
    pub fn search(&self, term: &str, include_descriptions: bool) -> Vec<String> {
        let needle = term.to_lowercase();
        let mut hits: BTreeSet<String> = self
            .names
            .iter()
            .filter(|(lowered, _)| lowered.contains(&needle))
            .map(|(_, actual)| actual.clone())
            .collect();

        if include_descriptions {
            for (keyword, names) in &self.keywords {
                if keyword.contains(&needle) {
                    hits.extend(names.iter().cloned());
                }
            }
        }

        let mut results: Vec<String> = hits.into_iter().collect();
        results.sort_by(|a, b| {
            let a_exact = a.to_lowercase() == needle;
            let b_exact = b.to_lowercase() == needle;
            b_exact.cmp(&a_exact).then_with(|| a.cmp(b))
        });
        results
    }

    /// The closest known name to a missed query, for "did you mean" output.
    pub fn suggest(&self, term: &str) -> Option<String> {
        let needle = term.to_lowercase();
        self.names
            .iter()
            .map(|(lowered, actual)| {
                let score = strsim::jaro_winkler(&needle, lowered);
                (actual.clone(), score)
            })
            .filter(|(_, score)| *score > 0.85)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(name, _)| name)
    }

    fn index_path(cache_dir: &Path, tap: &str) -> PathBuf {
        let safe = tap.replace('/', "-");
        cache_dir.join(format!("search-index-{safe}.{CACHE_EXTENSION}"))
    }

    /// Persist this index for `tap`.
    pub fn save(&self, cache_dir: &Path, tap: &str) -> Result<()> {
        fs::create_dir_all(cache_dir)?;
        let json = serde_json::to_string(self)?;
        fs::write(Self::index_path(cache_dir, tap), json)?;
        Ok(())
    }

    /// Load the persisted index for `tap`, if present and readable.
    pub fn load(cache_dir: &Path, tap: &str) -> Option<Self> {
        let contents = fs::read_to_string(Self::index_path(cache_dir, tap)).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Fresh iff the index was built at or after the tap's last update.
    pub fn is_fresh(&self, tap_last_updated: Option<&str>) -> bool {
        let Some(updated) = tap_last_updated else {
            // Tap has never been updated; any index is current.
            return !self.built_at.is_empty();
        };
        match (
            DateTime::parse_from_rfc3339(&self.built_at),
            DateTime::parse_from_rfc3339(updated),
        ) {
            (Ok(built), Ok(updated)) => built >= updated,
            _ => false,
        }
    }
}

/// Per-tap bookkeeping entry in `cache/tap-metadata.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapMetadata {
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub last_commit: Option<String>,
    /// Seconds the last update took.
    #[serde(default)]
    pub update_duration: Option<f64>,
    #[serde(default)]
    pub search_index_built: Option<String>,
}

/// Store for the tap metadata file.
#[derive(Debug, Clone)]
pub struct TapMetadataStore {
    path: PathBuf,
}

impl TapMetadataStore {
    pub fn new(cache_dir: &Path) -> Self {
        TapMetadataStore {
            path: cache_dir.join("tap-metadata.json"),
        }
    }

    pub fn load(&self) -> BTreeMap<String, TapMetadata> {
        let Ok(contents) = fs::read_to_string(&self.path) else {
            return BTreeMap::new();
        };
        serde_json::from_str(&contents).unwrap_or_default()
    }

    pub fn get(&self, tap: &str) -> Option<TapMetadata> {
        self.load().remove(tap)
    }

    pub fn set(&self, tap: &str, metadata: TapMetadata) -> Result<()> {
        let mut all = self.load();
        all.insert(tap.to_string(), metadata);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&all)?)?;
        Ok(())
    }

    /// Merge an update into one tap's entry.
    pub fn update<F>(&self, tap: &str, mutator: F) -> Result<TapMetadata>
    where
        F: FnOnce(&mut TapMetadata),
    {
        let mut entry = self.get(tap).unwrap_or_default();
        mutator(&mut entry);
        self.set(tap, entry.clone())?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn formula(name: &str, description: &str) -> Formula {
        Formula {
            name: name.into(),
            version: "1.0.0".into(),
            description: Some(description.into()),
            homepage: None,
            dependencies: vec![],
            bottles: vec![],
            source_sha256: None,
            tap: Some("homebrew/core".into()),
        }
    }

    #[test]
    fn get_miss_loads_from_disk() {
        let tmp = TempDir::new().unwrap();
        let writer = FormulaCache::new(tmp.path());
        writer.set(&formula("wget", "Internet file retriever")).unwrap();

        // A fresh cache instance has a cold memory tier.
        let reader = FormulaCache::new(tmp.path());
        let hit = reader.get("wget").unwrap();
        assert_eq!(hit.name, "wget");
    }

    #[test]
    fn cache_entry_roundtrip_is_stable() {
        let tmp = TempDir::new().unwrap();
        let cache = FormulaCache::new(tmp.path());
        let original = formula("ripgrep", "Search tool like grep");
        cache.set(&original).unwrap();

        let path = tmp.path().join("formula-ripgrep.velocache");
        let first = fs::read_to_string(&path).unwrap();
        let decoded: Formula = serde_json::from_str(&first).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(serde_json::to_string(&decoded).unwrap(), first);
    }

    #[test]
    fn clear_removes_formula_entries_only() {
        let tmp = TempDir::new().unwrap();
        let cache = FormulaCache::new(tmp.path());
        cache.set(&formula("wget", "Internet file retriever")).unwrap();
        fs::write(tmp.path().join("tap-metadata.json"), "{}").unwrap();

        cache.clear().unwrap();
        assert!(cache.get("wget").is_none());
        assert!(tmp.path().join("tap-metadata.json").exists());
    }

    #[test]
    fn search_matches_names_and_ranks_exact_first() {
        let index = SearchIndex::build(&[
            formula("python@3.12", "Interpreted programming language"),
            formula("wget", "Internet file retriever"),
            formula("wget2", "Successor of GNU wget"),
        ]);

        let results = index.search("wget", false);
        assert_eq!(results, vec!["wget", "wget2"]);
    }

    #[test]
    fn search_reaches_descriptions_only_when_asked() {
        let index = SearchIndex::build(&[
            formula("wget", "Internet file retriever"),
            formula("aria2", "Download utility for the internet"),
        ]);

        assert!(index.search("internet", false).is_empty());
        let with_desc = index.search("internet", true);
        assert_eq!(with_desc, vec!["aria2", "wget"]);
    }

    #[test]
    fn short_tokens_are_not_keywords() {
        let index = SearchIndex::build(&[formula("jq", "A JSON tool")]);
        // "A" (len 1) is never indexed as a keyword; "json" is.
        assert!(index.search("a", true).is_empty());
        assert_eq!(index.search("json", true), vec!["jq"]);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let index = SearchIndex::build(&[formula("CMake", "Build system")]);
        assert_eq!(index.lookup("cmake"), Some("CMake"));
        assert_eq!(index.lookup("CMAKE"), Some("CMake"));
        assert!(index.lookup("make").is_none());
    }

    #[test]
    fn suggest_finds_close_names() {
        let index = SearchIndex::build(&[formula("ripgrep", "Search tool")]);
        assert_eq!(index.suggest("ripgrpe").as_deref(), Some("ripgrep"));
        assert!(index.suggest("zzzzzz").is_none());
    }

    #[test]
    fn index_persists_per_tap_with_slash_mapped() {
        let tmp = TempDir::new().unwrap();
        let index = SearchIndex::build(&[formula("wget", "Internet file retriever")]);
        index.save(tmp.path(), "homebrew/core").unwrap();

        assert!(tmp.path().join("search-index-homebrew-core.velocache").exists());
        let loaded = SearchIndex::load(tmp.path(), "homebrew/core").unwrap();
        assert_eq!(loaded.lookup("wget"), Some("wget"));
    }

    #[test]
    fn freshness_tracks_tap_update_time() {
        let index = SearchIndex::build(&[]);
        assert!(index.is_fresh(None));
        assert!(index.is_fresh(Some("2000-01-01T00:00:00Z")));
        assert!(!index.is_fresh(Some("2999-01-01T00:00:00Z")));
    }

    #[test]
    fn tap_metadata_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = TapMetadataStore::new(tmp.path());
        store
            .update("homebrew/core", |m| {
                m.last_updated = Some("2026-01-01T00:00:00Z".into());
                m.update_duration = Some(3.5);
            })
            .unwrap();

        let loaded = store.get("homebrew/core").unwrap();
        assert_eq!(loaded.last_updated.as_deref(), Some("2026-01-01T00:00:00Z"));
        assert_eq!(loaded.update_duration, Some(3.5));
        assert!(store.get("other/tap").is_none());
    }
}
