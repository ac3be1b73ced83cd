//! Version parsing, ordering, and constraint evaluation.
//!
//! Formula versions follow a semver-ish format:
//! - Basic: `1.2.3`, optionally with a leading `v` which is stripped on parse
//! - With prerelease: `1.2.3-beta1`
//! - With build metadata: `1.2.3+abc` (ignored for ordering)
//!
//! Comparison rules:
//! - The `(major, minor, patch)` triple compares numerically: `1.10.0 > 1.9.0`
//! - A release outranks a prerelease with the same triple: `1.0.0 > 1.0.0-rc1`
//! - Prereleases compare as raw strings: `1.0.0-beta < 1.0.0-rc`
//!
//! Strings outside the `^v?\d+\.\d+\.\d+(-…)?(+…)?` subset are unparsable;
//! constraint evaluation stays total by falling back to raw string
//! comparison for them.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A parsed `major.minor.patch` version with optional prerelease and build.
#[derive(Debug, Clone)]
pub struct SemanticVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<String>,
    pub build: Option<String>,
}

impl SemanticVersion {
    /// Parse a version string, stripping a single leading `v`.
    ///
    /// Returns `None` for anything that is not three dot-separated numeric
    /// components followed by optional `-prerelease` and `+build` parts.
    pub fn parse(input: &str) -> Option<Self> {
        let s = input.trim();
        let s = s.strip_prefix('v').unwrap_or(s);
        if s.is_empty() {
            return None;
        }

        // Split off build metadata, then prerelease.
        let (rest, build) = match s.split_once('+') {
            Some((r, b)) if !b.is_empty() => (r, Some(b.to_string())),
            Some(_) => return None,
            None => (s, None),
        };
        let (triple, prerelease) = match rest.split_once('-') {
            Some((t, p)) if !p.is_empty() => (t, Some(p.to_string())),
            Some(_) => return None,
            None => (rest, None),
        };

        let mut parts = triple.split('.');
        let major = parts.next()?.parse::<u64>().ok()?;
        let minor = parts.next()?.parse::<u64>().ok()?;
        let patch = parts.next()?.parse::<u64>().ok()?;
        if parts.next().is_some() {
            return None;
        }

        Some(SemanticVersion {
            major,
            minor,
            patch,
            prerelease,
            build,
        })
    }

    fn triple(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }
}

impl fmt::Display for SemanticVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.prerelease {
            write!(f, "-{}", pre)?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{}", build)?;
        }
        Ok(())
    }
}

impl Ord for SemanticVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.triple().cmp(&other.triple()) {
            Ordering::Equal => {}
            other => return other,
        }
        // Equal triples: a release outranks any prerelease.
        match (&self.prerelease, &other.prerelease) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for SemanticVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SemanticVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SemanticVersion {}

/// Compare two version strings, parsing them as [`SemanticVersion`] where
/// possible and falling back to raw string ordering otherwise.
pub fn compare_version_strings(a: &str, b: &str) -> Ordering {
    match (SemanticVersion::parse(a), SemanticVersion::parse(b)) {
        (Some(va), Some(vb)) => va.cmp(&vb),
        _ => a.cmp(b),
    }
}

/// Comparison operator of a version constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintOp {
    /// Exact match.
    Eq,
    /// Strictly newer.
    Gt,
    /// At least.
    Ge,
    /// Strictly older.
    Lt,
    /// At most.
    Le,
    /// Pessimistic: `~>X.Y.Z` means `>=X.Y.Z` and `<X.(Y+1).0`.
    Compatible,
    /// Caret: `^X.Y.Z` means `>=X.Y.Z` and `<(X+1).0.0`.
    Caret,
}

impl fmt::Display for ConstraintOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConstraintOp::Eq => "==",
            ConstraintOp::Gt => ">",
            ConstraintOp::Ge => ">=",
            ConstraintOp::Lt => "<",
            ConstraintOp::Le => "<=",
            ConstraintOp::Compatible => "~>",
            ConstraintOp::Caret => "^",
        };
        f.write_str(s)
    }
}

/// A single operator + version requirement, e.g. `>=3.1.0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionConstraint {
    pub op: ConstraintOp,
    pub version: String,
}

impl VersionConstraint {
    pub fn new(op: ConstraintOp, version: impl Into<String>) -> Self {
        VersionConstraint {
            op,
            version: version.into(),
        }
    }

    /// Parse a constraint string such as `>=1.2.3` or `~>2.0.0`.
    ///
    /// A bare version with no operator is an exact (`==`) requirement.
    pub fn parse(input: &str) -> Option<Self> {
        let s = input.trim();
        if s.is_empty() {
            return None;
        }
        // Longest operators first so ">=" is not read as ">" + "=1.2.3".
        for (text, op) in [
            ("==", ConstraintOp::Eq),
            (">=", ConstraintOp::Ge),
            ("<=", ConstraintOp::Le),
            ("~>", ConstraintOp::Compatible),
            (">", ConstraintOp::Gt),
            ("<", ConstraintOp::Lt),
            ("^", ConstraintOp::Caret),
            ("=", ConstraintOp::Eq),
        ] {
            if let Some(rest) = s.strip_prefix(text) {
                let version = rest.trim();
                if version.is_empty() {
                    return None;
                }
                return Some(VersionConstraint::new(op, version));
            }
        }
        Some(VersionConstraint::new(ConstraintOp::Eq, s))
    }

    /// Whether a concrete version satisfies this constraint.
    ///
    /// Total over arbitrary input: when either side is unparsable the
    /// comparison falls back to raw strings (exact equality for `==`, `~>`
    /// and `^`; lexicographic ordering for the relational operators).
    pub fn satisfied_by(&self, candidate: &str) -> bool {
        let bound = SemanticVersion::parse(&self.version);
        let actual = SemanticVersion::parse(candidate);

        match (actual, bound) {
            (Some(v), Some(c)) => match self.op {
                ConstraintOp::Eq => v == c,
                ConstraintOp::Gt => v > c,
                ConstraintOp::Ge => v >= c,
                ConstraintOp::Lt => v < c,
                ConstraintOp::Le => v <= c,
                ConstraintOp::Compatible => {
                    let upper = SemanticVersion {
                        major: c.major,
                        minor: c.minor + 1,
                        patch: 0,
                        prerelease: None,
                        build: None,
                    };
                    v >= c && v < upper
                }
                ConstraintOp::Caret => {
                    let upper = SemanticVersion {
                        major: c.major + 1,
                        minor: 0,
                        patch: 0,
                        prerelease: None,
                        build: None,
                    };
                    v >= c && v < upper
                }
            },
            _ => match self.op {
                ConstraintOp::Eq | ConstraintOp::Compatible | ConstraintOp::Caret => {
                    candidate.trim() == self.version.trim()
                }
                ConstraintOp::Gt => candidate > self.version.as_str(),
                ConstraintOp::Ge => candidate >= self.version.as_str(),
                ConstraintOp::Lt => candidate < self.version.as_str(),
                ConstraintOp::Le => candidate <= self.version.as_str(),
            },
        }
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op, self.version)
    }
}

/// Conjunction of constraints collected from every requirement edge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionConstraintSet {
    pub constraints: Vec<VersionConstraint>,
}

impl VersionConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, constraint: VersionConstraint) {
        if !self.constraints.contains(&constraint) {
            self.constraints.push(constraint);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// A version satisfies the set iff it satisfies every member.
    pub fn satisfied_by(&self, candidate: &str) -> bool {
        self.constraints.iter().all(|c| c.satisfied_by(candidate))
    }
}

/// A requested package, optionally pinned to a version: `name@version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    pub version: Option<String>,
}

impl PackageSpec {
    /// Parse `name@version` syntax.
    ///
    /// `wget` yields no version; `python@3.11` yields `("python", "3.11")`;
    /// a bare `@` yields empty name and empty version.
    pub fn parse(input: &str) -> Self {
        let s = input.trim();
        match s.split_once('@') {
            Some((name, version)) => PackageSpec {
                name: name.to_string(),
                version: Some(version.to_string()),
            },
            None => PackageSpec {
                name: s.to_string(),
                version: None,
            },
        }
    }

    /// The normalised `name@version` (or bare `name`) form.
    pub fn full_specification(&self) -> String {
        match &self.version {
            Some(v) => format!("{}@{}", self.name, v),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_specification())
    }
}
