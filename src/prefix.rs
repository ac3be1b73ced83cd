//! Prefix layout — the canonical filesystem model shared by every subsystem.
//!
//! A [`Prefix`] owns one directory tree (default `~/.velo`) with the layout:
//!
//! ```text
//! <prefix>/
//!   Cellar/<name>/<version>/…   # versioned package store
//!   bin/                        # user-facing executables (symlinks/wrappers)
//!   opt/<name>                  # stable link to the current version
//!   cache/                      # formula and index cache artefacts
//!   taps/<org>/<repo>/          # formula repositories
//!   receipts/<name>/<version>/  # install receipts
//!   tmp/                        # scratch space
//!   logs/
//! ```
//!
//! Prefixes are explicitly constructed context objects, never process
//! globals: project-local instances with a different root are first-class.
//! The symlink primitives here implement the conflict policy the installer
//! relies on, so all symlink decisions live in one place.

use crate::equivalence;
use crate::error::{Result, VeloError};
use crate::version::compare_version_strings;
use std::fs;
use std::os::unix::fs as unix_fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

/// Outcome of a checked symlink creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymlinkOutcome {
    /// The link was created (or an equivalent-owner link was replaced).
    Created,
    /// The destination was left untouched, with the reason.
    Skipped(String),
    /// Creation was attempted and failed.
    Failed(String),
}

/// Handle to one prefix tree.
#[derive(Debug, Clone)]
pub struct Prefix {
    root: PathBuf,
}

impl Prefix {
    /// A prefix rooted at an explicit directory (project-local installs).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Prefix { root: root.into() }
    }

    /// The default user-local prefix, `~/.velo`.
    pub fn default_location() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Prefix {
            root: PathBuf::from(home).join(".velo"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cellar(&self) -> PathBuf {
        self.root.join("Cellar")
    }

    pub fn bin(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn opt(&self) -> PathBuf {
        self.root.join("opt")
    }

    pub fn cache(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn taps(&self) -> PathBuf {
        self.root.join("taps")
    }

    pub fn receipts(&self) -> PathBuf {
        self.root.join("receipts")
    }

    pub fn tmp(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Create every subtree of the layout. Idempotent.
    pub fn ensure_skeleton(&self) -> Result<()> {
        for dir in [
            self.cellar(),
            self.bin(),
            self.opt(),
            self.cache(),
            self.taps(),
            self.receipts(),
            self.tmp(),
            self.logs(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// `<prefix>/Cellar/<name>/<version>`.
    pub fn package_dir(&self, name: &str, version: &str) -> PathBuf {
        self.cellar().join(name).join(version)
    }

    /// Non-hidden version directory names under `Cellar/<name>`, sorted
    /// oldest to newest.
    pub fn installed_versions(&self, name: &str) -> Result<Vec<String>> {
        let package_root = self.cellar().join(name);
        if !package_root.exists() {
            return Ok(vec![]);
        }

        let mut versions = Vec::new();
        for entry in fs::read_dir(&package_root)? {
            let entry = entry?;
            let version = entry.file_name().to_string_lossy().to_string();
            if version.starts_with('.') {
                continue;
            }
            if entry.path().is_dir() {
                versions.push(version);
            }
        }

        versions.sort_by(|a, b| compare_version_strings(a, b));
        Ok(versions)
    }

    /// Newest installed version of `name`, if any.
    pub fn latest_installed_version(&self, name: &str) -> Result<Option<String>> {
        Ok(self.installed_versions(name)?.pop())
    }

    /// Whether at least one non-empty version directory exists for `name`.
    ///
    /// An empty skeleton left behind by an interrupted install does not count
    /// as installed.
    pub fn is_installed(&self, name: &str) -> bool {
        let versions = match self.installed_versions(name) {
            Ok(v) => v,
            Err(_) => return false,
        };
        versions.iter().any(|version| {
            let dir = self.package_dir(name, version);
            fs::read_dir(&dir)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false)
        })
    }

    /// `<prefix>/bin/<binary>`.
    pub fn symlink_path(&self, binary: &str) -> PathBuf {
        self.bin().join(binary)
    }

    /// `<prefix>/bin/<binary>@<version>`.
    pub fn versioned_symlink_path(&self, binary: &str, version: &str) -> PathBuf {
        self.bin().join(format!("{binary}@{version}"))
    }

    /// `<prefix>/opt/<name>`.
    pub fn opt_path(&self, name: &str) -> PathBuf {
        self.opt().join(name)
    }

    /// The package that owns an existing symlink, if its target resolves
    /// into the Cellar.
    pub fn symlink_owner(&self, dest: &Path) -> Option<String> {
        let target = fs::read_link(dest).ok()?;
        let resolved = if target.is_relative() {
            resolve_dot_segments(&dest.parent()?.join(&target))
        } else {
            resolve_dot_segments(&target)
        };
        let relative = resolved.strip_prefix(self.cellar()).ok()?;
        relative
            .components()
            .next()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
    }

    /// Create `dest` pointing at `source`, honouring the conflict policy.
    ///
    /// - Absent destination: create.
    /// - Symlink owned by `owning_package` (or an equivalent name): replace.
    /// - Symlink owned by another package: skip unless `force`.
    /// - Regular file: skip unless `force`.
    ///
    /// Skip and failure outcomes leave the prior destination untouched.
    pub fn create_symlink_checked(
        &self,
        source: &Path,
        dest: &Path,
        owning_package: &str,
        force: bool,
    ) -> SymlinkOutcome {
        let dest_exists = dest.symlink_metadata().is_ok();
        if dest_exists {
            let is_symlink = dest
                .symlink_metadata()
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false);

            if is_symlink {
                match self.symlink_owner(dest) {
                    Some(owner)
                        if equivalence::are_equivalent(&owner, owning_package) || force => {}
                    Some(owner) => {
                        return SymlinkOutcome::Skipped(format!("conflicts with {owner}"));
                    }
                    None if force => {}
                    None => {
                        return SymlinkOutcome::Skipped(
                            "existing symlink points outside the Cellar".to_string(),
                        );
                    }
                }
            } else if !force {
                return SymlinkOutcome::Skipped("file already exists".to_string());
            }

            if let Err(e) = remove_existing_destination(dest, force) {
                return SymlinkOutcome::Failed(format!(
                    "could not remove existing {}: {e}",
                    dest.display()
                ));
            }
        }

        let link_value = self.relative_link_value(source, dest);
        match unix_fs::symlink(&link_value, dest) {
            Ok(()) => SymlinkOutcome::Created,
            Err(e) => SymlinkOutcome::Failed(e.to_string()),
        }
    }

    /// Repoint `opt/<name>` and every default `bin/` entry of that version's
    /// binaries at the chosen version.
    pub fn set_default_version(&self, name: &str, version: &str) -> Result<()> {
        let package_dir = self.package_dir(name, version);
        if !package_dir.exists() {
            return Err(VeloError::VersionNotAvailable {
                package: name.to_string(),
                version: version.to_string(),
            });
        }

        self.create_opt_symlink(name, version)?;

        let bin_dir = package_dir.join("bin");
        if bin_dir.is_dir() {
            for entry in fs::read_dir(&bin_dir)? {
                let entry = entry?;
                let binary = entry.file_name().to_string_lossy().to_string();
                if binary.starts_with('.') {
                    continue;
                }
                let dest = self.symlink_path(&binary);
                if let SymlinkOutcome::Failed(reason) =
                    self.create_symlink_checked(&entry.path(), &dest, name, true)
                {
                    return Err(VeloError::SymlinkFailed { dest, reason });
                }
            }
        }

        Ok(())
    }

    /// Create or refresh `opt/<name>` pointing at the given version.
    pub fn create_opt_symlink(&self, name: &str, version: &str) -> Result<()> {
        fs::create_dir_all(self.opt())?;
        let dest = self.opt_path(name);
        let source = self.package_dir(name, version);
        match self.create_symlink_checked(&source, &dest, name, true) {
            SymlinkOutcome::Failed(reason) => Err(VeloError::SymlinkFailed { dest, reason }),
            _ => Ok(()),
        }
    }

    /// The value stored in the link: relative when both ends live under the
    /// prefix, absolute otherwise.
    fn relative_link_value(&self, source: &Path, dest: &Path) -> PathBuf {
        let (Ok(rel_source), Some(dest_dir)) = (source.strip_prefix(&self.root), dest.parent())
        else {
            return source.to_path_buf();
        };
        let Ok(rel_dest_dir) = dest_dir.strip_prefix(&self.root) else {
            return source.to_path_buf();
        };

        let mut value = PathBuf::new();
        for _ in rel_dest_dir.components() {
            value.push("..");
        }
        value.join(rel_source)
    }
}

/// Remove an existing destination entry prior to replacement.
///
/// Clears extended attributes and restores write permission before retrying;
/// under `force`, a still-failing removal falls back to `rm -f`.
fn remove_existing_destination(dest: &Path, force: bool) -> std::io::Result<()> {
    if fs::remove_file(dest).is_ok() {
        return Ok(());
    }

    let _ = Command::new("xattr").arg("-c").arg(dest).output();
    if let Ok(metadata) = dest.symlink_metadata() {
        let mut permissions = metadata.permissions();
        use std::os::unix::fs::PermissionsExt;
        permissions.set_mode(permissions.mode() | 0o200);
        let _ = fs::set_permissions(dest, permissions);
    }

    match fs::remove_file(dest) {
        Ok(()) => Ok(()),
        Err(e) if force => {
            let status = Command::new("rm").arg("-f").arg(dest).status()?;
            if status.success() && dest.symlink_metadata().is_err() {
                Ok(())
            } else {
                Err(e)
            }
        }
        Err(e) => Err(e),
    }
}

/// Lexically resolve the `.` and `..` segments of a link target without
/// touching the filesystem. Symlink targets under the prefix are built from
/// `..` chains, so string comparison against Cellar paths needs this.
pub(crate) fn resolve_dot_segments(path: &Path) -> PathBuf {
    path.components()
        .fold(PathBuf::new(), |mut resolved, component| {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    resolved.pop();
                }
                other => resolved.push(other),
            }
            resolved
        })
}
