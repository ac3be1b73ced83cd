//! Formula records — the package descriptions all other subsystems consume.
//!
//! A [`Formula`] is an immutable description of one package: its version, its
//! typed dependency edges, and the prebuilt bottles available for it. Records
//! are produced by a [`FormulaParser`](crate::parser::FormulaParser)
//! implementation and memoised by the cache (§`cache`), so the shapes here are
//! `serde`-friendly with defaults for every optional field.

use crate::version::VersionConstraintSet;
use serde::{Deserialize, Serialize};

/// Kind of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyType {
    /// Needed at runtime; always followed by the resolver.
    Required,
    /// Opt-in feature dependency; never followed automatically.
    Optional,
    /// Needed only to build from source.
    Build,
    /// Needed only by the formula's test block.
    Test,
}

impl Default for DependencyType {
    fn default() -> Self {
        DependencyType::Required
    }
}

/// One dependency edge of a formula.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    #[serde(default, rename = "type")]
    pub dep_type: DependencyType,
    #[serde(default)]
    pub version_constraints: VersionConstraintSet,
}

impl Dependency {
    pub fn required(name: impl Into<String>) -> Self {
        Dependency {
            name: name.into(),
            dep_type: DependencyType::Required,
            version_constraints: VersionConstraintSet::new(),
        }
    }
}

/// A prebuilt binary archive for one platform tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bottle {
    /// Platform tag such as `arm64_sonoma`, or `all` for universal bottles.
    pub platform_tag: String,
    pub sha256: String,
    /// Fully resolved download URL, when the tap records one.
    #[serde(default)]
    pub url: Option<String>,
    /// Root URL template; combined with name/version/tag when `url` is absent.
    #[serde(default)]
    pub root_url: Option<String>,
    /// Archive size in bytes, when the tap metadata carries it.
    #[serde(default)]
    pub size: Option<u64>,
}

impl Bottle {
    /// The concrete download URL for this bottle of `name` at `version`.
    pub fn resolved_url(&self, name: &str, version: &str) -> Option<String> {
        if let Some(url) = &self.url {
            return Some(url.clone());
        }
        self.root_url.as_ref().map(|root| {
            format!(
                "{}/{}-{}.{}.bottle.tar.gz",
                root.trim_end_matches('/'),
                name,
                version,
                self.platform_tag
            )
        })
    }
}

/// Immutable description of one package, as parsed from a tap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formula {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub bottles: Vec<Bottle>,
    /// Upstream SHA-256 of the source tarball, when declared.
    #[serde(default)]
    pub source_sha256: Option<String>,
    /// The `org/repo` tap this record came from.
    #[serde(default)]
    pub tap: Option<String>,
}

impl Formula {
    /// Dependencies the resolver follows (type `required` only).
    pub fn required_dependencies(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies
            .iter()
            .filter(|d| d.dep_type == DependencyType::Required)
    }

    /// The first bottle usable on `platform_tag`.
    ///
    /// Fallback order: exact platform match, then a universal `all` bottle,
    /// then none.
    pub fn preferred_bottle(&self, platform_tag: &str) -> Option<&Bottle> {
        self.bottles
            .iter()
            .find(|b| b.platform_tag == platform_tag)
            .or_else(|| self.bottles.iter().find(|b| b.platform_tag == "all"))
    }

    /// Whether any bottle exists for `platform_tag` (including universal).
    pub fn has_bottle_for(&self, platform_tag: &str) -> bool {
        self.preferred_bottle(platform_tag).is_some()
    }
}
