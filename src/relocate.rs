//! Bottle relocation — rewrite embedded paths after extraction.
//!
//! Bottles carry placeholders (`@@HOMEBREW_PREFIX@@`, `@@HOMEBREW_CELLAR@@`)
//! and sometimes hard-coded absolute prefixes. Binaries get their load
//! commands rewritten to `@rpath`-relative forms so nothing outside the
//! prefix is ever consulted; text scripts get the tokens substituted with the
//! live prefix.
//!
//! Mach-O mutation is delegated to the platform tools (`otool`,
//! `install_name_tool`, `codesign`, `xattr`); what matters is the
//! post-condition, not the tool. Re-signing failures are warnings, never
//! fatal.

use crate::error::{Result, VeloError};
use crate::prefix::Prefix;
use crate::equivalence;
use rayon::prelude::*;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

pub const PLACEHOLDER_PREFIX: &str = "@@HOMEBREW_PREFIX@@";
pub const PLACEHOLDER_CELLAR: &str = "@@HOMEBREW_CELLAR@@";

/// Hard-coded prefixes rewritten in text scripts.
const ABSOLUTE_PREFIXES: &[&str] = &["/opt/homebrew", "/usr/local"];

/// Extensions that are never placeholder carriers; skipped cheaply.
const SKIP_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "ico", "icns", "pdf", "zip", "gz", "xz", "bz2", "zst", "tar",
    "jar", "class", "woff", "woff2", "ttf", "otf", "pyc", "pyo", "a", "o",
];

struct RelocationContext {
    prefix: Prefix,
    package: String,
    version: String,
}

/// Rewrite every regular file under `Cellar/<package>/<version>`.
///
/// Mach-O files get load-command rewrites plus portable `@rpath` entries;
/// placeholder-bearing text files get token substitution. Symlinks are left
/// alone.
pub fn relocate_package(prefix: &Prefix, package: &str, version: &str) -> Result<()> {
    let package_dir = prefix.package_dir(package, version);
    if !package_dir.exists() {
        return Err(VeloError::PathNotFound(package_dir));
    }

    let context = RelocationContext {
        prefix: prefix.clone(),
        package: package.to_string(),
        version: version.to_string(),
    };

    let files = collect_candidate_files(&package_dir);

    let failures: Vec<VeloError> = files
        .par_iter()
        .filter_map(|path| {
            let result = if is_macho(path) {
                rewrite_macho(&context, path)
            } else {
                rewrite_text(&context, path).map(|_| ())
            };
            result.err()
        })
        .collect();

    if let Some(first) = failures.into_iter().next() {
        return Err(first);
    }
    Ok(())
}

/// Regular files worth inspecting, with cheap extension-based skips applied.
fn collect_candidate_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .follow_links(false)
        .max_open(64)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            !path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| SKIP_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        })
        .collect()
}

/// Mach-O detection by magic number, reading only the first four bytes.
pub fn is_macho(path: &Path) -> bool {
    let Ok(mut file) = fs::File::open(path) else {
        return false;
    };
    let mut bytes = [0u8; 4];
    if file.read_exact(&mut bytes).is_err() {
        return false;
    }
    let magic = u32::from_ne_bytes(bytes);
    matches!(magic, 0xfeedface | 0xfeedfacf | 0xcefaedfe | 0xcffaedfe)
}

/// Whether this file is a shared library whose first `otool -L` entry is its
/// own install-name id.
fn is_shared_library(path: &Path) -> bool {
    let by_extension = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| ext == "dylib" || ext == "so");
    let in_framework = path
        .components()
        .any(|c| c.as_os_str().to_string_lossy().ends_with(".framework"));
    by_extension || in_framework
}

fn is_framework_resident(path: &Path) -> bool {
    path.components()
        .any(|c| c.as_os_str().to_string_lossy().ends_with(".framework"))
}

fn rewrite_macho(context: &RelocationContext, path: &Path) -> Result<()> {
    let entries = load_command_entries(path)?;
    let rpaths = rpath_entries(path)?;

    let needs_rewrite = entries.iter().any(|e| contains_placeholder(e))
        || rpaths.iter().any(|r| contains_placeholder(r));
    if !needs_rewrite {
        return Ok(());
    }

    prepare_for_mutation(path);

    let shared = is_shared_library(path);
    for (index, old) in entries.iter().enumerate() {
        if !contains_placeholder(old) {
            continue;
        }
        let new = context.rewrite_load_path(old);
        let args: Vec<&str> = if index == 0 && shared {
            vec!["-id", new.as_str()]
        } else {
            vec!["-change", old.as_str(), new.as_str()]
        };
        run_install_name_tool(path, &args)?;
    }

    for old in &rpaths {
        if !contains_placeholder(old) {
            continue;
        }
        let new = context.rewrite_rpath(old);
        run_install_name_tool(path, &["-delete_rpath", old.as_str()])?;
        run_install_name_tool(path, &["-add_rpath", new.as_str()])?;
    }

    // Portable rpaths so the binary resolves @rpath/Cellar/… from wherever
    // it is invoked, including through bin/ symlinks.
    let ups = ups_to_prefix_root(&context.prefix, path);
    add_rpath_tolerant(path, &format!("@loader_path/{ups}"));
    add_rpath_tolerant(path, &format!("@executable_path/{ups}"));
    if is_framework_resident(path) {
        add_rpath_tolerant(path, &format!("@loader_path/../../{ups}"));
    }

    resign(path);
    Ok(())
}

/// The dependency dump of `otool -L`: the referenced paths in order, with
/// the file's own header line removed. For a shared library the first entry
/// is the install-name id.
fn load_command_entries(path: &Path) -> Result<Vec<String>> {
    let output = run_tool("otool", &["-L", &path.to_string_lossy()])?;
    Ok(output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                return None;
            }
            Some(trimmed.split(" (").next().unwrap_or(trimmed).to_string())
        })
        .collect())
}

/// `LC_RPATH` path values from `otool -l`.
fn rpath_entries(path: &Path) -> Result<Vec<String>> {
    let output = run_tool("otool", &["-l", &path.to_string_lossy()])?;
    let mut rpaths = Vec::new();
    let mut in_rpath_command = false;
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("cmd ") {
            in_rpath_command = trimmed == "cmd LC_RPATH";
        } else if in_rpath_command && trimmed.starts_with("path ") {
            let value = trimmed
                .trim_start_matches("path ")
                .split(" (offset")
                .next()
                .unwrap_or_default()
                .trim();
            if !value.is_empty() {
                rpaths.push(value.to_string());
            }
        }
    }
    Ok(rpaths)
}

fn contains_placeholder(text: &str) -> bool {
    text.contains(PLACEHOLDER_PREFIX) || text.contains(PLACEHOLDER_CELLAR)
}

impl RelocationContext {
    /// Rewrite one load-command path to its `@rpath` form.
    ///
    /// `@@HOMEBREW_PREFIX@@/opt/<pkg>/…` becomes
    /// `@rpath/Cellar/<pkg>/<version>/…`, with the version taken from the
    /// package being installed when `<pkg>` is it (or an equivalent name),
    /// else from the newest installed version of `<pkg>` (dependencies are
    /// installed first, so it is already present).
    fn rewrite_load_path(&self, old: &str) -> String {
        if let Some(rest) = old.strip_prefix(&format!("{PLACEHOLDER_PREFIX}/opt/")) {
            let mut segments = rest.splitn(2, '/');
            let referenced = segments.next().unwrap_or_default();
            let subpath = segments.next().unwrap_or_default();

            let version = if equivalence::are_equivalent(referenced, &self.package) {
                Some(self.version.clone())
            } else {
                self.prefix
                    .latest_installed_version(referenced)
                    .ok()
                    .flatten()
            };

            return match version {
                Some(version) if !subpath.is_empty() => {
                    format!("@rpath/Cellar/{referenced}/{version}/{subpath}")
                }
                Some(version) => format!("@rpath/Cellar/{referenced}/{version}"),
                None => {
                    tracing::warn!(
                        "no installed version of {referenced} to inject into {old}"
                    );
                    format!("@rpath/Cellar/{rest}")
                }
            };
        }
        if old.contains(PLACEHOLDER_CELLAR) {
            return old.replace(PLACEHOLDER_CELLAR, "@rpath/Cellar");
        }
        // Bare prefix references outside opt/ resolve to the live prefix.
        old.replace(PLACEHOLDER_PREFIX, &self.prefix.root().to_string_lossy())
    }

    /// Rewrite an `LC_RPATH` value: placeholders map onto the live prefix.
    fn rewrite_rpath(&self, old: &str) -> String {
        old.replace(
            PLACEHOLDER_CELLAR,
            &self.prefix.cellar().to_string_lossy(),
        )
        .replace(PLACEHOLDER_PREFIX, &self.prefix.root().to_string_lossy())
    }
}

/// `../` chain from the file's directory up to the prefix root.
fn ups_to_prefix_root(prefix: &Prefix, path: &Path) -> String {
    let depth = path
        .parent()
        .and_then(|dir| dir.strip_prefix(prefix.root()).ok())
        .map(|relative| relative.components().count())
        .unwrap_or(1);
    vec![".."; depth.max(1)].join("/")
}

/// Make the file mutable: writable bit, no signature, no xattrs. Failures
/// here are recovered locally.
fn prepare_for_mutation(path: &Path) {
    if let Ok(metadata) = fs::metadata(path) {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = metadata.permissions();
        permissions.set_mode(permissions.mode() | 0o200);
        let _ = fs::set_permissions(path, permissions);
    }
    let _ = Command::new("codesign")
        .args(["--remove-signature", &path.to_string_lossy()])
        .output();
    let _ = Command::new("xattr")
        .args(["-c", &path.to_string_lossy()])
        .output();
}

/// Ad-hoc re-sign after mutation; failure is a warning, not fatal.
fn resign(path: &Path) {
    match Command::new("codesign")
        .args(["--force", "-s", "-", &path.to_string_lossy()])
        .output()
    {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            tracing::warn!(
                "re-signing {} failed: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Err(e) => tracing::warn!("could not run codesign for {}: {e}", path.display()),
    }
}

fn run_install_name_tool(path: &Path, args: &[&str]) -> Result<()> {
    let mut full_args: Vec<&str> = args.to_vec();
    let path_str = path.to_string_lossy();
    full_args.push(path_str.as_ref());

    let output = Command::new("install_name_tool")
        .args(&full_args)
        .output()
        .map_err(|e| VeloError::LibraryPathRewriteFailed {
            path: path.to_path_buf(),
            reason: format!("could not run install_name_tool: {e}"),
        })?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    // Signature warnings are expected after --remove-signature.
    if stderr.contains("warning:") && !stderr.contains("error:") {
        return Ok(());
    }
    Err(VeloError::LibraryPathRewriteFailed {
        path: path.to_path_buf(),
        reason: stderr.trim().to_string(),
    })
}

/// `-add_rpath` that tolerates the entry already existing.
fn add_rpath_tolerant(path: &Path, rpath: &str) {
    if let Err(e) = run_install_name_tool(path, &["-add_rpath", rpath]) {
        tracing::debug!("rpath {rpath} not added to {}: {e}", path.display());
    }
}

fn run_tool(tool: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .map_err(|e| VeloError::ProcessError {
            command: tool.to_string(),
            exit_code: -1,
            stderr: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(VeloError::ProcessError {
            command: format!("{tool} {}", args.join(" ")),
            exit_code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Token substitution for text scripts. Returns whether the file changed.
fn rewrite_text(context: &RelocationContext, path: &Path) -> Result<bool> {
    if !is_text_rewrite_candidate(path) {
        return Ok(false);
    }

    let bytes = fs::read(path)?;
    let Ok(contents) = String::from_utf8(bytes) else {
        return Ok(false);
    };

    let rewritten = substitute_text_tokens(&contents, &context.prefix);
    if rewritten == contents {
        return Ok(false);
    }

    fs::write(path, rewritten)?;
    Ok(true)
}

/// A file qualifies when its first 512 bytes are NUL-free valid UTF-8 and it
/// either starts with a shebang or mentions a rewritable token.
fn is_text_rewrite_candidate(path: &Path) -> bool {
    let Ok(mut file) = fs::File::open(path) else {
        return false;
    };
    let mut head = [0u8; 512];
    let n = match file.read(&mut head) {
        Ok(n) if n > 0 => n,
        _ => return false,
    };
    let head = &head[..n];

    if head.contains(&0) {
        return false;
    }
    let text = match std::str::from_utf8(head) {
        Ok(text) => text,
        // A multi-byte sequence may straddle the 512-byte boundary.
        Err(e) if e.error_len().is_none() => {
            std::str::from_utf8(&head[..e.valid_up_to()]).unwrap_or("")
        }
        Err(_) => return false,
    };

    text.starts_with("#!")
        || text.contains(PLACEHOLDER_PREFIX)
        || text.contains(PLACEHOLDER_CELLAR)
        || ABSOLUTE_PREFIXES.iter().any(|p| text.contains(p))
}

/// Replace every rewritable token with its live-prefix form.
fn substitute_text_tokens(contents: &str, prefix: &Prefix) -> String {
    let root = prefix.root().to_string_lossy().to_string();
    let cellar = prefix.cellar().to_string_lossy().to_string();
    let opt = prefix.opt().to_string_lossy().to_string();

    // Longest tokens first so `/usr/local/Cellar` is not eaten by the plain
    // `/usr/local` rule.
    contents
        .replace(PLACEHOLDER_CELLAR, &cellar)
        .replace(PLACEHOLDER_PREFIX, &root)
        .replace("/usr/local/Cellar", &cellar)
        .replace("/usr/local/opt", &opt)
        .replace("/opt/homebrew", &root)
        .replace("/usr/local", &root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context() -> (TempDir, RelocationContext) {
        let tmp = TempDir::new().unwrap();
        let prefix = Prefix::new(tmp.path());
        prefix.ensure_skeleton().unwrap();
        let context = RelocationContext {
            prefix,
            package: "foo".to_string(),
            version: "1.2.3".to_string(),
        };
        (tmp, context)
    }

    #[test]
    fn opt_reference_to_own_package_gets_version_injected() {
        let (_tmp, context) = context();
        let new = context
            .rewrite_load_path("@@HOMEBREW_PREFIX@@/opt/foo/lib/libfoo.1.dylib");
        assert_eq!(new, "@rpath/Cellar/foo/1.2.3/lib/libfoo.1.dylib");
    }

    #[test]
    fn opt_reference_to_installed_dependency_uses_its_version() {
        let (_tmp, context) = context();
        let dir = context.prefix.package_dir("openssl@3", "3.3.1");
        fs::create_dir_all(dir.join("lib")).unwrap();
        fs::write(dir.join("lib/libssl.dylib"), "x").unwrap();

        let new = context
            .rewrite_load_path("@@HOMEBREW_PREFIX@@/opt/openssl@3/lib/libssl.3.dylib");
        assert_eq!(new, "@rpath/Cellar/openssl@3/3.3.1/lib/libssl.3.dylib");
    }

    #[test]
    fn cellar_placeholder_maps_to_rpath_cellar() {
        let (_tmp, context) = context();
        let new = context.rewrite_load_path("@@HOMEBREW_CELLAR@@/zlib/1.3/lib/libz.dylib");
        assert_eq!(new, "@rpath/Cellar/zlib/1.3/lib/libz.dylib");
    }

    #[test]
    fn rpath_placeholders_map_to_live_prefix() {
        let (_tmp, context) = context();
        let new = context.rewrite_rpath("@@HOMEBREW_PREFIX@@/lib");
        assert_eq!(
            new,
            format!("{}/lib", context.prefix.root().to_string_lossy())
        );
    }

    #[test]
    fn ups_chain_matches_package_depth() {
        let (_tmp, context) = context();
        let binary = context.prefix.package_dir("foo", "1.2.3").join("bin/foo");
        assert_eq!(ups_to_prefix_root(&context.prefix, &binary), "../../../..");
    }

    #[test]
    fn shebang_scripts_are_candidates() {
        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("tool");
        fs::write(&script, "#!/bin/sh\necho hi\n").unwrap();
        assert!(is_text_rewrite_candidate(&script));
    }

    #[test]
    fn binary_content_is_not_a_candidate() {
        let tmp = TempDir::new().unwrap();
        let blob = tmp.path().join("data");
        fs::write(&blob, [0x00u8, 0x01, 0x02, 0xff]).unwrap();
        assert!(!is_text_rewrite_candidate(&blob));
    }

    #[test]
    fn plain_text_without_tokens_is_not_a_candidate() {
        let tmp = TempDir::new().unwrap();
        let readme = tmp.path().join("README");
        fs::write(&readme, "just words\n").unwrap();
        assert!(!is_text_rewrite_candidate(&readme));
    }

    #[test]
    fn token_substitution_handles_overlapping_prefixes() {
        let (_tmp, context) = context();
        let root = context.prefix.root().to_string_lossy().to_string();

        let input = "A=@@HOMEBREW_PREFIX@@\nB=/usr/local/Cellar/x\nC=/usr/local/opt/x\nD=/usr/local/share\nE=/opt/homebrew/etc\n";
        let output = substitute_text_tokens(input, &context.prefix);
        assert_eq!(
            output,
            format!(
                "A={root}\nB={root}/Cellar/x\nC={root}/opt/x\nD={root}/share\nE={root}/etc\n"
            )
        );
    }

    #[test]
    fn rewrite_text_updates_placeholder_scripts_in_place() {
        let (_tmp, context) = context();
        let dir = context.prefix.package_dir("foo", "1.2.3").join("bin");
        fs::create_dir_all(&dir).unwrap();
        let script = dir.join("foo-config");
        fs::write(&script, "#!/bin/sh\nPREFIX=@@HOMEBREW_PREFIX@@\n").unwrap();

        assert!(rewrite_text(&context, &script).unwrap());
        let contents = fs::read_to_string(&script).unwrap();
        assert!(contents.contains(&context.prefix.root().to_string_lossy().to_string()));
        assert!(!contents.contains(PLACEHOLDER_PREFIX));

        // A second pass is a no-op.
        assert!(!rewrite_text(&context, &script).unwrap());
    }

    #[test]
    fn macho_magic_detection() {
        let tmp = TempDir::new().unwrap();
        let macho = tmp.path().join("bin");
        fs::write(&macho, 0xfeedfacf_u32.to_ne_bytes()).unwrap();
        assert!(is_macho(&macho));

        let script = tmp.path().join("script");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        assert!(!is_macho(&script));
    }

    #[test]
    fn skip_extensions_filtered_from_candidates() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("image.png"), "x").unwrap();
        fs::write(tmp.path().join("module.pyc"), "x").unwrap();
        fs::write(tmp.path().join("tool"), "#!/bin/sh\n").unwrap();

        let files = collect_candidate_files(tmp.path());
        let names: Vec<_> = files
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(names, vec!["tool"]);
    }
}
