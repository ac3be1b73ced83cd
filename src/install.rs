//! Installer — extract, relocate, link.
//!
//! A package directory moves through a small state machine:
//!
//! ```text
//! Absent ──extract──▶ Extracted ──rewrite──▶ Relocated
//!      (failure: delete d, raise)                │
//!                                       create_symlinks
//!                                                ▼
//!                                             Linked ──opt_symlink──▶ Installed
//! ```
//!
//! Any failure past `Absent` rolls back by deleting the package directory
//! (and any symlinks this call created), so a package is either fully
//! installed or not present at all. `force` re-enters `Absent` from an
//! existing install by removing its symlinks first.

use crate::error::{Result, VeloError};
use crate::formula::Formula;
use crate::prefix::{Prefix, SymlinkOutcome};
use crate::receipt::ReceiptStore;
use crate::relocate;
use flate2::read::GzDecoder;
use std::fs;
use std::path::{Path, PathBuf};
use tar::Archive;

const WRAPPER_MARKER: &str = "# generated by velo";

/// Knobs for one install call.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Replace an existing install of the same version.
    pub force: bool,
    /// Create `bin/` and `opt/` entries (disabled for keg-only-style use).
    pub create_symlinks: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        InstallOptions {
            force: false,
            create_symlinks: true,
        }
    }
}

/// What one install produced, for receipts and summaries.
#[derive(Debug, Clone, Default)]
pub struct InstallOutcome {
    pub package: String,
    pub version: String,
    /// Prefix-relative paths of created `bin/` entries.
    pub symlinks_created: Vec<String>,
    /// `(destination, reason)` for entries the conflict policy skipped.
    pub symlinks_skipped: Vec<(String, String)>,
}

/// Performs installs and uninstalls against one prefix.
pub struct Installer {
    prefix: Prefix,
    receipts: ReceiptStore,
}

impl Installer {
    pub fn new(prefix: Prefix) -> Self {
        let receipts = ReceiptStore::new(prefix.clone());
        Installer { prefix, receipts }
    }

    pub fn prefix(&self) -> &Prefix {
        &self.prefix
    }

    pub fn receipts(&self) -> &ReceiptStore {
        &self.receipts
    }

    /// Install a verified bottle archive.
    pub fn install(
        &self,
        formula: &Formula,
        bottle_file: &Path,
        options: &InstallOptions,
    ) -> Result<InstallOutcome> {
        let name = formula.name.as_str();
        let version = formula.version.as_str();
        let package_dir = self.prefix.package_dir(name, version);

        let occupied = fs::read_dir(&package_dir)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if occupied {
            if !options.force {
                return Err(VeloError::AlreadyInstalled {
                    package: name.to_string(),
                    version: version.to_string(),
                });
            }
            self.remove_version_symlinks(name, version)?;
            fs::remove_dir_all(&package_dir)?;
        }

        // Extracted.
        if let Err(e) = extract_bottle(bottle_file, &package_dir) {
            let _ = fs::remove_dir_all(&package_dir);
            return Err(e);
        }

        // Relocated.
        if let Err(e) = relocate::relocate_package(&self.prefix, name, version) {
            let _ = fs::remove_dir_all(&package_dir);
            return Err(e);
        }

        let mut outcome = InstallOutcome {
            package: name.to_string(),
            version: version.to_string(),
            ..Default::default()
        };

        if options.create_symlinks {
            // Linked.
            if let Err(e) = self.link_package(name, version, options.force, &mut outcome) {
                self.rollback(&package_dir, &outcome);
                return Err(e);
            }
            // Installed.
            if let Err(e) = self.prefix.create_opt_symlink(name, version) {
                self.rollback(&package_dir, &outcome);
                return Err(e);
            }
            self.sweep_missing_opt_links();
        }

        Ok(outcome)
    }

    fn rollback(&self, package_dir: &Path, outcome: &InstallOutcome) {
        for relative in &outcome.symlinks_created {
            let _ = fs::remove_file(self.prefix.root().join(relative));
        }
        let _ = fs::remove_dir_all(package_dir);
    }

    /// Create the three-tier entries for every binary of one version.
    fn link_package(
        &self,
        name: &str,
        version: &str,
        force: bool,
        outcome: &mut InstallOutcome,
    ) -> Result<()> {
        let package_dir = self.prefix.package_dir(name, version);
        let has_frameworks = package_dir.join("Frameworks").is_dir();

        for binary in collect_binaries(&package_dir)? {
            let binary_name = binary
                .file_name()
                .and_then(|n| n.to_str())
                .map(String::from)
                .ok_or_else(|| VeloError::PathNotFound(binary.clone()))?;

            let framework_resident = has_frameworks
                && binary.starts_with(package_dir.join("Frameworks"));

            let versioned = self.prefix.versioned_symlink_path(&binary_name, version);
            let default = self.prefix.symlink_path(&binary_name);

            for dest in [&versioned, &default] {
                let result = if framework_resident {
                    self.write_wrapper_script(&binary, dest, name, force)
                } else {
                    self.prefix.create_symlink_checked(&binary, dest, name, force)
                };
                match result {
                    SymlinkOutcome::Created => {
                        let relative = dest
                            .strip_prefix(self.prefix.root())
                            .unwrap_or(dest)
                            .to_string_lossy()
                            .to_string();
                        outcome.symlinks_created.push(relative);
                    }
                    SymlinkOutcome::Skipped(reason) => {
                        tracing::debug!("skipped {}: {reason}", dest.display());
                        outcome
                            .symlinks_skipped
                            .push((dest.to_string_lossy().to_string(), reason));
                    }
                    SymlinkOutcome::Failed(reason) => {
                        return Err(VeloError::SymlinkFailed {
                            dest: dest.clone(),
                            reason,
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Framework-resident binaries cannot be reached through a plain symlink
    /// (they locate their framework relative to the process image), so the
    /// `bin/` entry is a wrapper that exports the framework search path and
    /// execs the real binary.
    fn write_wrapper_script(
        &self,
        binary: &Path,
        dest: &Path,
        owning_package: &str,
        force: bool,
    ) -> SymlinkOutcome {
        if dest.symlink_metadata().is_ok() {
            let replaceable = self
                .prefix
                .symlink_owner(dest)
                .map(|owner| crate::equivalence::are_equivalent(&owner, owning_package))
                .unwrap_or_else(|| is_velo_wrapper(dest));
            if !replaceable && !force {
                return SymlinkOutcome::Skipped("file already exists".to_string());
            }
            if let Err(e) = fs::remove_file(dest) {
                return SymlinkOutcome::Failed(e.to_string());
            }
        }

        let frameworks_dir = self
            .prefix
            .package_dir(owning_package, &version_of(binary, &self.prefix))
            .join("Frameworks");

        let mut script = format!(
            "#!/bin/bash\n{WRAPPER_MARKER}\nexport DYLD_FRAMEWORK_PATH=\"{frameworks}${{DYLD_FRAMEWORK_PATH:+:$DYLD_FRAMEWORK_PATH}}\"\n",
            frameworks = frameworks_dir.display(),
        );
        if let Some(home) = python_framework_home(binary) {
            script.push_str(&format!("export PYTHONHOME=\"{}\"\n", home.display()));
        }
        script.push_str(&format!("exec \"{}\" \"$@\"\n", binary.display()));

        if let Err(e) = fs::write(dest, script) {
            return SymlinkOutcome::Failed(e.to_string());
        }
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(dest, fs::Permissions::from_mode(0o755)) {
            return SymlinkOutcome::Failed(e.to_string());
        }
        SymlinkOutcome::Created
    }

    /// Give `opt/` entries to installed packages that lack one.
    fn sweep_missing_opt_links(&self) {
        let Ok(entries) = fs::read_dir(self.prefix.cellar()) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if self.prefix.opt_path(&name).symlink_metadata().is_ok() {
                continue;
            }
            if let Ok(Some(version)) = self.prefix.latest_installed_version(&name) {
                if let Err(e) = self.prefix.create_opt_symlink(&name, &version) {
                    tracing::warn!("could not backfill opt link for {name}: {e}");
                }
            }
        }
    }

    /// Remove every version of a package: its symlinks, its `opt/` entry,
    /// its Cellar directory, and its receipts.
    pub fn uninstall(&self, name: &str) -> Result<()> {
        let versions = self.prefix.installed_versions(name)?;
        if versions.is_empty() {
            return Err(VeloError::PathNotFound(self.prefix.cellar().join(name)));
        }

        for version in &versions {
            self.remove_version_symlinks(name, version)?;
            let _ = self.receipts.delete(name, version);
        }

        let opt = self.prefix.opt_path(name);
        if opt.symlink_metadata().is_ok() {
            fs::remove_file(&opt)?;
        }

        fs::remove_dir_all(self.prefix.cellar().join(name))?;
        Ok(())
    }

    /// Remove a single version. Remaining versions keep the package alive:
    /// `opt/` and the default `bin/` entries are repointed at the newest one.
    pub fn uninstall_version(&self, name: &str, version: &str) -> Result<()> {
        let package_dir = self.prefix.package_dir(name, version);
        if !package_dir.exists() {
            return Err(VeloError::VersionNotAvailable {
                package: name.to_string(),
                version: version.to_string(),
            });
        }

        self.remove_version_symlinks(name, version)?;
        let _ = self.receipts.delete(name, version);
        fs::remove_dir_all(&package_dir)?;

        let remaining = self.prefix.installed_versions(name)?;
        match remaining.last() {
            Some(newest) => {
                self.prefix.set_default_version(name, newest)?;
            }
            None => {
                let opt = self.prefix.opt_path(name);
                if opt.symlink_metadata().is_ok() {
                    fs::remove_file(&opt)?;
                }
                let _ = fs::remove_dir(self.prefix.cellar().join(name));
            }
        }
        Ok(())
    }

    /// Delete `bin/` entries resolving into (or wrapping) one version.
    fn remove_version_symlinks(&self, name: &str, version: &str) -> Result<()> {
        let bin = self.prefix.bin();
        if !bin.is_dir() {
            return Ok(());
        }
        let package_dir = self.prefix.package_dir(name, version);

        for entry in fs::read_dir(&bin)? {
            let entry = entry?;
            let path = entry.path();
            let Ok(metadata) = path.symlink_metadata() else {
                continue;
            };

            let points_here = if metadata.file_type().is_symlink() {
                resolved_target(&path)
                    .map(|target| target.starts_with(&package_dir))
                    .unwrap_or(false)
            } else {
                is_velo_wrapper(&path)
                    && fs::read_to_string(&path)
                        .map(|body| body.contains(&package_dir.to_string_lossy().to_string()))
                        .unwrap_or(false)
            };

            if points_here {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Resolve a symlink one level and normalize, without touching the target.
fn resolved_target(link: &Path) -> Option<PathBuf> {
    let target = fs::read_link(link).ok()?;
    let resolved = if target.is_relative() {
        link.parent()?.join(target)
    } else {
        target
    };
    Some(crate::prefix::resolve_dot_segments(&resolved))
}

fn is_velo_wrapper(path: &Path) -> bool {
    fs::read_to_string(path)
        .map(|body| body.contains(WRAPPER_MARKER))
        .unwrap_or(false)
}

/// The version segment of a path under `Cellar/<name>/<version>/…`, read
/// back from the path itself.
fn version_of(binary: &Path, prefix: &Prefix) -> String {
    binary
        .strip_prefix(prefix.cellar())
        .ok()
        .and_then(|rest| rest.components().nth(1))
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .unwrap_or_default()
}

/// `PYTHONHOME` for python-named framework binaries: the versioned framework
/// directory two levels above `bin/`.
fn python_framework_home(binary: &Path) -> Option<PathBuf> {
    let name = binary.file_name()?.to_str()?;
    if !name.starts_with("python") {
        return None;
    }
    let bin_dir = binary.parent()?;
    if bin_dir.file_name()? != "bin" {
        return None;
    }
    let versioned = bin_dir.parent()?;
    if versioned.parent()?.file_name()? == "Versions" {
        Some(versioned.to_path_buf())
    } else {
        None
    }
}

/// Executables exposed by one package version: `bin/`, `libexec/bin/`, and
/// framework-versioned `bin/` directories. Hidden names and compiled-Python
/// artefacts are excluded.
fn collect_binaries(package_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut binaries = Vec::new();

    for dir in [package_dir.join("bin"), package_dir.join("libexec/bin")] {
        push_binaries(&dir, &mut binaries)?;
    }

    let frameworks = package_dir.join("Frameworks");
    if frameworks.is_dir() {
        for framework in fs::read_dir(&frameworks)?.filter_map(|e| e.ok()) {
            let versions = framework.path().join("Versions");
            if !versions.is_dir() {
                continue;
            }
            for version in fs::read_dir(&versions)?.filter_map(|e| e.ok()) {
                push_binaries(&version.path().join("bin"), &mut binaries)?;
            }
        }
    }

    binaries.sort();
    Ok(binaries)
}

fn push_binaries(dir: &Path, binaries: &mut Vec<PathBuf>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || name.ends_with(".pyc") {
            continue;
        }
        if entry.path().is_file() || entry.path().is_symlink() {
            binaries.push(entry.path());
        }
    }
    Ok(())
}

/// Unpack a bottle archive into `dest`, stripping the leading
/// `<name>/<version>/` components.
pub fn extract_bottle(bottle_file: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(bottle_file)
        .map_err(|e| VeloError::ExtractionFailed(format!(
            "cannot open {}: {e}",
            bottle_file.display()
        )))?;
    let decompressor = GzDecoder::new(file);
    let mut archive = Archive::new(decompressor);

    fs::create_dir_all(dest)?;

    let entries = archive
        .entries()
        .map_err(|e| VeloError::ExtractionFailed(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| VeloError::ExtractionFailed(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| VeloError::ExtractionFailed(e.to_string()))?
            .into_owned();

        // Bottles nest everything under <name>/<version>/.
        let stripped: PathBuf = path.components().skip(2).collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }

        let target = dest.join(&stripped);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&target)
            .map_err(|e| VeloError::ExtractionFailed(format!(
                "{}: {e}",
                stripped.display()
            )))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tempfile::TempDir;

    /// Build a bottle archive with the standard two leading components.
    fn make_bottle(dir: &Path, name: &str, version: &str, files: &[(&str, &str)]) -> PathBuf {
        let bottle_path = dir.join(format!("{name}-{version}.bottle.tar.gz"));
        let file = fs::File::create(&bottle_path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for (relative, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(
                    &mut header,
                    format!("{name}/{version}/{relative}"),
                    contents.as_bytes(),
                )
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
        bottle_path
    }

    fn installer() -> (TempDir, Installer) {
        let tmp = TempDir::new().unwrap();
        let prefix = Prefix::new(tmp.path().join("prefix"));
        prefix.ensure_skeleton().unwrap();
        (tmp, Installer::new(prefix))
    }

    fn formula(name: &str, version: &str) -> Formula {
        Formula {
            name: name.to_string(),
            version: version.to_string(),
            description: None,
            homepage: None,
            dependencies: vec![],
            bottles: vec![],
            source_sha256: None,
            tap: None,
        }
    }

    #[test]
    fn extract_strips_two_components() {
        let (tmp, installer) = installer();
        let bottle = make_bottle(
            tmp.path(),
            "tool",
            "1.0.0",
            &[("bin/tool", "#!/bin/sh\necho tool\n"), ("share/doc/README", "docs")],
        );

        let dest = installer.prefix.package_dir("tool", "1.0.0");
        extract_bottle(&bottle, &dest).unwrap();
        assert!(dest.join("bin/tool").is_file());
        assert!(dest.join("share/doc/README").is_file());
        // No nested tool/1.0.0 left behind.
        assert!(!dest.join("tool").exists());
    }

    #[test]
    fn install_links_binaries_and_opt() {
        let (tmp, installer) = installer();
        let bottle = make_bottle(tmp.path(), "tool", "1.0.0", &[("bin/tool", "#!/bin/sh\n")]);

        let outcome = installer
            .install(&formula("tool", "1.0.0"), &bottle, &InstallOptions::default())
            .unwrap();

        assert!(installer.prefix.symlink_path("tool").symlink_metadata().is_ok());
        assert!(
            installer
                .prefix
                .versioned_symlink_path("tool", "1.0.0")
                .symlink_metadata()
                .is_ok()
        );
        assert!(installer.prefix.opt_path("tool").symlink_metadata().is_ok());
        assert_eq!(outcome.symlinks_created.len(), 2);
        assert!(installer.prefix.is_installed("tool"));
    }

    #[test]
    fn reinstall_without_force_is_already_installed() {
        let (tmp, installer) = installer();
        let bottle = make_bottle(tmp.path(), "tool", "1.0.0", &[("bin/tool", "x")]);
        let f = formula("tool", "1.0.0");

        installer.install(&f, &bottle, &InstallOptions::default()).unwrap();
        let err = installer
            .install(&f, &bottle, &InstallOptions::default())
            .unwrap_err();
        assert!(matches!(err, VeloError::AlreadyInstalled { .. }));

        // Force replaces in place.
        installer
            .install(
                &f,
                &bottle,
                &InstallOptions {
                    force: true,
                    create_symlinks: true,
                },
            )
            .unwrap();
    }

    #[test]
    fn failed_extraction_rolls_back_to_absent() {
        let (tmp, installer) = installer();
        let bogus = tmp.path().join("bogus.tar.gz");
        fs::write(&bogus, "not a tarball").unwrap();

        let err = installer
            .install(&formula("tool", "1.0.0"), &bogus, &InstallOptions::default())
            .unwrap_err();
        assert!(matches!(err, VeloError::ExtractionFailed(_)));
        assert!(!installer.prefix.package_dir("tool", "1.0.0").exists());
        assert!(!installer.prefix.is_installed("tool"));
    }

    #[test]
    fn skip_symlinks_option_installs_unlinked() {
        let (tmp, installer) = installer();
        let bottle = make_bottle(tmp.path(), "tool", "1.0.0", &[("bin/tool", "x")]);

        let outcome = installer
            .install(
                &formula("tool", "1.0.0"),
                &bottle,
                &InstallOptions {
                    force: false,
                    create_symlinks: false,
                },
            )
            .unwrap();
        assert!(outcome.symlinks_created.is_empty());
        assert!(installer.prefix.symlink_path("tool").symlink_metadata().is_err());
        assert!(installer.prefix.is_installed("tool"));
    }

    #[test]
    fn uninstall_removes_everything() {
        let (tmp, installer) = installer();
        let bottle = make_bottle(tmp.path(), "tool", "1.0.0", &[("bin/tool", "x")]);
        installer
            .install(&formula("tool", "1.0.0"), &bottle, &InstallOptions::default())
            .unwrap();

        installer.uninstall("tool").unwrap();
        assert!(!installer.prefix.cellar().join("tool").exists());
        assert!(installer.prefix.symlink_path("tool").symlink_metadata().is_err());
        assert!(installer.prefix.opt_path("tool").symlink_metadata().is_err());
    }

    #[test]
    fn uninstall_version_repoints_to_next_highest() {
        let (tmp, installer) = installer();
        for version in ["1.0.0", "2.0.0"] {
            let bottle = make_bottle(tmp.path(), "tool", version, &[("bin/tool", "x")]);
            installer
                .install(&formula("tool", version), &bottle, &InstallOptions::default())
                .unwrap();
        }

        installer.uninstall_version("tool", "2.0.0").unwrap();

        assert_eq!(
            installer.prefix.installed_versions("tool").unwrap(),
            vec!["1.0.0"]
        );
        let opt_target = fs::read_link(installer.prefix.opt_path("tool")).unwrap();
        assert!(opt_target.ends_with("Cellar/tool/1.0.0"));
        let default_target = resolved_target(&installer.prefix.symlink_path("tool")).unwrap();
        assert!(default_target.starts_with(installer.prefix.package_dir("tool", "1.0.0")));
        // The versioned entry for the removed version is gone.
        assert!(
            installer
                .prefix
                .versioned_symlink_path("tool", "2.0.0")
                .symlink_metadata()
                .is_err()
        );
    }

    #[test]
    fn uninstall_last_version_drops_opt_link() {
        let (tmp, installer) = installer();
        let bottle = make_bottle(tmp.path(), "tool", "1.0.0", &[("bin/tool", "x")]);
        installer
            .install(&formula("tool", "1.0.0"), &bottle, &InstallOptions::default())
            .unwrap();

        installer.uninstall_version("tool", "1.0.0").unwrap();
        assert!(installer.prefix.opt_path("tool").symlink_metadata().is_err());
        assert!(!installer.prefix.is_installed("tool"));
    }

    #[test]
    fn foreign_symlink_is_not_removed_on_uninstall() {
        let (tmp, installer) = installer();
        let tool_bottle = make_bottle(tmp.path(), "tool", "1.0.0", &[("bin/shared", "x")]);
        let other_bottle = make_bottle(tmp.path(), "other", "1.0.0", &[("bin/shared", "x")]);

        installer
            .install(&formula("tool", "1.0.0"), &tool_bottle, &InstallOptions::default())
            .unwrap();
        installer
            .install(
                &formula("other", "1.0.0"),
                &other_bottle,
                &InstallOptions::default(),
            )
            .unwrap();

        // "shared" is owned by tool; other's attempt was skipped.
        installer.uninstall("other").unwrap();
        assert!(installer.prefix.symlink_path("shared").symlink_metadata().is_ok());
        assert_eq!(
            installer
                .prefix
                .symlink_owner(&installer.prefix.symlink_path("shared"))
                .as_deref(),
            Some("tool")
        );
    }

    #[test]
    fn framework_binaries_get_wrapper_scripts() {
        let (tmp, installer) = installer();
        let bottle = make_bottle(
            tmp.path(),
            "python@3.12",
            "3.12.4",
            &[
                (
                    "Frameworks/Python.framework/Versions/3.12/bin/python3.12",
                    "binary",
                ),
                ("bin/idle3", "#!/bin/sh\n"),
            ],
        );

        installer
            .install(
                &formula("python@3.12", "3.12.4"),
                &bottle,
                &InstallOptions::default(),
            )
            .unwrap();

        let wrapper = installer.prefix.symlink_path("python3.12");
        let body = fs::read_to_string(&wrapper).unwrap();
        assert!(body.starts_with("#!/bin/bash"));
        assert!(body.contains("DYLD_FRAMEWORK_PATH"));
        assert!(body.contains("PYTHONHOME"));
        assert!(body.contains("Frameworks/Python.framework/Versions/3.12"));

        // Non-framework binary is an ordinary symlink.
        let idle = installer.prefix.symlink_path("idle3");
        assert!(idle.symlink_metadata().unwrap().file_type().is_symlink());

        // Uninstall removes wrappers too.
        installer.uninstall("python@3.12").unwrap();
        assert!(wrapper.symlink_metadata().is_err());
    }
}
