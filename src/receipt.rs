//! Install receipts — why and how each package version was installed.
//!
//! One receipt lives at `receipts/<name>/<version>/receipt.json`, with stable
//! key ordering and ISO-8601 timestamps. Receipts distinguish explicit
//! installs from dependency installs and track the dependents that keep a
//! dependency alive: a dependency whose `requestedBy` list drains empty is a
//! garbage-collection candidate.

use crate::error::{Result, VeloError};
use crate::prefix::Prefix;
use crate::version::compare_version_strings;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// How an install came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstalledAs {
    /// The user asked for this package by name.
    Explicit,
    /// Pulled in to satisfy another package.
    Dependency,
}

/// Per-install record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub package: String,
    pub version: String,
    pub installed_at: String,
    pub installed_as: InstalledAs,
    pub requested_by: Vec<String>,
    pub symlinks_created: Vec<String>,
}

impl Receipt {
    /// A fresh receipt stamped with the current time.
    pub fn new(
        package: impl Into<String>,
        version: impl Into<String>,
        installed_as: InstalledAs,
        requested_by: Vec<String>,
        symlinks_created: Vec<String>,
    ) -> Self {
        Receipt {
            package: package.into(),
            version: version.into(),
            installed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            installed_as,
            requested_by,
            symlinks_created,
        }
    }
}

/// Store for receipts under `<prefix>/receipts`.
#[derive(Debug, Clone)]
pub struct ReceiptStore {
    prefix: Prefix,
}

impl ReceiptStore {
    pub fn new(prefix: Prefix) -> Self {
        ReceiptStore { prefix }
    }

    fn receipt_path(&self, name: &str, version: &str) -> PathBuf {
        self.prefix
            .receipts()
            .join(name)
            .join(version)
            .join("receipt.json")
    }

    /// Write a receipt, creating parent directories.
    pub fn save(&self, receipt: &Receipt) -> Result<()> {
        let path = self.receipt_path(&receipt.package, &receipt.version);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(receipt)?;
        fs::write(&path, json)?;
        Ok(())
    }

    /// Load the receipt for an exact version. Absence is `Ok(None)`.
    pub fn load(&self, name: &str, version: &str) -> Result<Option<Receipt>> {
        let path = self.receipt_path(name, version);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Load the newest version's receipt for `name`. Absence is `Ok(None)`.
    pub fn load_latest(&self, name: &str) -> Result<Option<Receipt>> {
        match self.recorded_versions(name)?.pop() {
            Some(version) => self.load(name, &version),
            None => Ok(None),
        }
    }

    /// All versions with a receipt on disk, sorted oldest to newest.
    pub fn recorded_versions(&self, name: &str) -> Result<Vec<String>> {
        let dir = self.prefix.receipts().join(name);
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut versions = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let version = entry.file_name().to_string_lossy().to_string();
            if version.starts_with('.') {
                continue;
            }
            if entry.path().join("receipt.json").exists() {
                versions.push(version);
            }
        }
        versions.sort_by(|a, b| compare_version_strings(a, b));
        Ok(versions)
    }

    /// Read-modify-write an existing receipt.
    pub fn update<F>(&self, name: &str, version: &str, mutator: F) -> Result<Receipt>
    where
        F: FnOnce(&mut Receipt),
    {
        let mut receipt = self
            .load(name, version)?
            .ok_or_else(|| VeloError::ReceiptNotFound {
                package: name.to_string(),
                version: version.to_string(),
            })?;
        mutator(&mut receipt);
        self.save(&receipt)?;
        Ok(receipt)
    }

    /// Record that `dependent` relies on `onto` at `version`. Idempotent.
    pub fn add_dependent(&self, dependent: &str, onto: &str, version: &str) -> Result<()> {
        self.update(onto, version, |receipt| {
            if !receipt.requested_by.iter().any(|d| d == dependent) {
                receipt.requested_by.push(dependent.to_string());
                receipt.requested_by.sort();
            }
        })?;
        Ok(())
    }

    /// Drop `dependent` from the dependents set. Idempotent.
    pub fn remove_dependent(&self, dependent: &str, onto: &str, version: &str) -> Result<()> {
        self.update(onto, version, |receipt| {
            receipt.requested_by.retain(|d| d != dependent);
        })?;
        Ok(())
    }

    /// Remove the receipt file and garbage-collect empty enclosing dirs.
    pub fn delete(&self, name: &str, version: &str) -> Result<()> {
        let path = self.receipt_path(name, version);
        if path.exists() {
            fs::remove_file(&path)?;
        }

        let version_dir = self.prefix.receipts().join(name).join(version);
        remove_if_empty(&version_dir)?;
        remove_if_empty(&self.prefix.receipts().join(name))?;
        Ok(())
    }

    /// Drop `dependent` from every receipt that lists it, after `dependent`
    /// itself is uninstalled.
    pub fn forget_dependent(&self, dependent: &str) -> Result<()> {
        let receipts_root = self.prefix.receipts();
        if !receipts_root.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&receipts_root)? {
            let entry = entry?;
            let package = entry.file_name().to_string_lossy().to_string();
            if package.starts_with('.') {
                continue;
            }
            for version in self.recorded_versions(&package)? {
                if let Some(receipt) = self.load(&package, &version)? {
                    if receipt.requested_by.iter().any(|d| d == dependent) {
                        self.remove_dependent(dependent, &package, &version)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Packages that still require `name`, across every recorded version
    /// (the uninstall safety check).
    pub fn dependents_of(&self, name: &str) -> Result<Vec<String>> {
        let mut dependents = Vec::new();
        for version in self.recorded_versions(name)? {
            if let Some(receipt) = self.load(name, &version)? {
                dependents.extend(receipt.requested_by);
            }
        }
        dependents.sort();
        dependents.dedup();
        Ok(dependents)
    }
}

fn remove_if_empty(dir: &std::path::Path) -> Result<()> {
    if dir.is_dir() && fs::read_dir(dir)?.next().is_none() {
        fs::remove_dir(dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ReceiptStore) {
        let tmp = TempDir::new().unwrap();
        let prefix = Prefix::new(tmp.path());
        prefix.ensure_skeleton().unwrap();
        (tmp, ReceiptStore::new(prefix))
    }

    fn receipt(name: &str, version: &str) -> Receipt {
        Receipt::new(
            name,
            version,
            InstalledAs::Explicit,
            vec![],
            vec![format!("bin/{name}")],
        )
    }

    #[test]
    fn save_and_load_roundtrip() {
        let (_tmp, store) = store();
        let original = receipt("wget", "1.24.5");
        store.save(&original).unwrap();

        let loaded = store.load("wget", "1.24.5").unwrap().unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn load_missing_is_none_not_error() {
        let (_tmp, store) = store();
        assert!(store.load("absent", "1.0.0").unwrap().is_none());
        assert!(store.load_latest("absent").unwrap().is_none());
    }

    #[test]
    fn load_latest_picks_newest_version() {
        let (_tmp, store) = store();
        store.save(&receipt("tool", "1.9.0")).unwrap();
        store.save(&receipt("tool", "1.10.0")).unwrap();

        let latest = store.load_latest("tool").unwrap().unwrap();
        assert_eq!(latest.version, "1.10.0");
    }

    #[test]
    fn update_missing_receipt_fails() {
        let (_tmp, store) = store();
        let err = store.update("absent", "1.0.0", |_| {}).unwrap_err();
        assert!(matches!(err, VeloError::ReceiptNotFound { .. }));
    }

    #[test]
    fn dependents_maintenance_is_idempotent() {
        let (_tmp, store) = store();
        let mut dep = receipt("openssl@3", "3.3.0");
        dep.installed_as = InstalledAs::Dependency;
        dep.requested_by = vec!["wget".to_string()];
        store.save(&dep).unwrap();

        store.add_dependent("curl", "openssl@3", "3.3.0").unwrap();
        store.add_dependent("curl", "openssl@3", "3.3.0").unwrap();
        let loaded = store.load("openssl@3", "3.3.0").unwrap().unwrap();
        assert_eq!(loaded.requested_by, vec!["curl", "wget"]);

        store.remove_dependent("wget", "openssl@3", "3.3.0").unwrap();
        store.remove_dependent("wget", "openssl@3", "3.3.0").unwrap();
        let loaded = store.load("openssl@3", "3.3.0").unwrap().unwrap();
        assert_eq!(loaded.requested_by, vec!["curl"]);
    }

    #[test]
    fn delete_garbage_collects_empty_directories() {
        let (_tmp, store) = store();
        store.save(&receipt("tool", "1.0.0")).unwrap();
        store.delete("tool", "1.0.0").unwrap();

        assert!(!store.prefix.receipts().join("tool").exists());
        // Deleting again is harmless.
        store.delete("tool", "1.0.0").unwrap();
    }

    #[test]
    fn serialized_keys_are_camel_case_and_stable() {
        let (_tmp, store) = store();
        let r = receipt("wget", "1.24.5");
        store.save(&r).unwrap();

        let raw = fs::read_to_string(
            store
                .prefix
                .receipts()
                .join("wget/1.24.5/receipt.json"),
        )
        .unwrap();
        assert!(raw.contains("\"installedAt\""));
        assert!(raw.contains("\"installedAs\""));
        assert!(raw.contains("\"requestedBy\""));
        assert!(raw.contains("\"symlinksCreated\""));
        let package_pos = raw.find("\"package\"").unwrap();
        let version_pos = raw.find("\"version\"").unwrap();
        assert!(package_pos < version_pos);

        // A second encode is byte-identical.
        let reloaded = store.load("wget", "1.24.5").unwrap().unwrap();
        assert_eq!(serde_json::to_string_pretty(&reloaded).unwrap(), raw);
    }
}
