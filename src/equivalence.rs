//! Package-name equivalence classes.
//!
//! Version-suffixed packages appear in taps under several spellings:
//! `python@3.12`, `python3.12`, and `python312` all describe one package. The
//! resolver and the symlink conflict policy must treat those spellings as a
//! single identity, so equivalence is computed here from a bundled synonym
//! table plus a dynamic rule for the version-sensitive base names.
//!
//! The canonical form of a class is `base@M.m`. A patch segment in the input
//! (`python3.12.4`) selects the same class as `python3.12`.

use regex::Regex;
use std::sync::LazyLock;

/// Base names whose versioned spellings are folded into one class.
const VERSION_SENSITIVE_BASES: &[&str] = &[
    "python",
    "node",
    "ruby",
    "java",
    "php",
    "perl",
    "go",
    "rust",
    "mysql",
    "postgresql",
    "redis",
    "mongodb",
    "openssl",
    "llvm",
    "gcc",
    "clang",
];

/// Bundled alias table: alternative base spellings folded into the canonical
/// base before the dynamic rule runs.
const BASE_SYNONYMS: &[(&str, &str)] = &[
    ("postgres", "postgresql"),
    ("nodejs", "node"),
    ("node.js", "node"),
    ("golang", "go"),
];

static VERSION_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@?(\d+)\.(\d+)(?:\.\d+)?$").expect("static pattern"));

static CONCAT_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d)(\d+)$").expect("static pattern"));

/// The `(base, major, minor)` class of a versioned package name, if any.
fn versioned_class(name: &str) -> Option<(&'static str, u64, u64)> {
    let lower = name.to_ascii_lowercase();

    let (base, rest) = split_base(&lower)?;
    if rest.is_empty() {
        return None;
    }

    if let Some(caps) = VERSION_SUFFIX.captures(rest) {
        let major = caps[1].parse().ok()?;
        let minor = caps[2].parse().ok()?;
        return Some((base, major, minor));
    }
    // Concatenated form: first digit is the major, the rest the minor
    // (`python312` means 3.12, not 31.2).
    if let Some(caps) = CONCAT_SUFFIX.captures(rest) {
        let major = caps[1].parse().ok()?;
        let minor = caps[2].parse().ok()?;
        return Some((base, major, minor));
    }
    None
}

/// Split a lowercased name into a known base and its version remainder.
///
/// Synonym prefixes are checked first, and longer bases win over shorter ones
/// (`postgresql16` must not parse as `postgres` + `ql16`).
fn split_base(lower: &str) -> Option<(&'static str, &str)> {
    let mut candidates: Vec<(&'static str, &str)> = Vec::new();

    for &(alias, canonical) in BASE_SYNONYMS {
        if let Some(rest) = lower.strip_prefix(alias) {
            candidates.push((canonical, rest));
        }
    }
    for &base in VERSION_SENSITIVE_BASES {
        if let Some(rest) = lower.strip_prefix(base) {
            candidates.push((base, rest));
        }
    }

    candidates.into_iter().min_by_key(|(_, rest)| rest.len())
}

/// The canonical spelling of `name` within its equivalence class.
///
/// Names outside every class canonicalise to themselves.
pub fn canonical_name(name: &str) -> String {
    match versioned_class(name) {
        Some((base, major, minor)) => format!("{base}@{major}.{minor}"),
        None => name.to_string(),
    }
}

/// All spellings equivalent to `name`, canonical form first.
pub fn equivalent_names(name: &str) -> Vec<String> {
    match versioned_class(name) {
        Some((base, major, minor)) => vec![
            format!("{base}@{major}.{minor}"),
            format!("{base}{major}.{minor}"),
            format!("{base}{major}{minor}"),
        ],
        None => vec![name.to_string()],
    }
}

/// Whether two names identify the same package.
pub fn are_equivalent(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    canonical_name(a) == canonical_name(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_spellings_share_one_class() {
        assert_eq!(canonical_name("python@3.12"), "python@3.12");
        assert_eq!(canonical_name("python3.12"), "python@3.12");
        assert_eq!(canonical_name("python312"), "python@3.12");
        assert!(are_equivalent("python@3.12", "python312"));
    }

    #[test]
    fn equivalent_names_lists_all_three_forms() {
        let names = equivalent_names("python3.12");
        assert_eq!(names, vec!["python@3.12", "python3.12", "python312"]);
    }

    #[test]
    fn patch_segment_selects_the_same_class() {
        assert_eq!(canonical_name("python@3.12.4"), "python@3.12");
    }

    #[test]
    fn concatenated_major_is_single_digit() {
        assert_eq!(canonical_name("python312"), "python@3.12");
        assert_eq!(canonical_name("node20.1"), "node@20.1");
    }

    #[test]
    fn synonyms_fold_into_canonical_base() {
        assert_eq!(canonical_name("postgres16.2"), "postgresql@16.2");
        assert_eq!(canonical_name("postgresql@16.2"), "postgresql@16.2");
        assert_eq!(canonical_name("nodejs18.2"), "node@18.2");
    }

    #[test]
    fn longest_base_wins() {
        // Must not parse as postgres + "ql16.2".
        assert_eq!(canonical_name("postgresql16.2"), "postgresql@16.2");
    }

    #[test]
    fn unversioned_names_are_their_own_class() {
        assert_eq!(canonical_name("wget"), "wget");
        assert_eq!(canonical_name("python"), "python");
        assert_eq!(canonical_name("openssl@3"), "openssl@3");
        assert_eq!(equivalent_names("wget"), vec!["wget"]);
    }

    #[test]
    fn distinct_versions_are_distinct_classes() {
        assert!(!are_equivalent("python@3.12", "python@3.11"));
        assert!(!are_equivalent("python312", "python311"));
    }
}
