//! Formula parsing seam.
//!
//! The Ruby formula syntax is an external collaborator's concern: the core
//! only depends on the [`FormulaParser`] contract, a pure function from
//! formula source to a [`Formula`] record. The bundled [`RubyFormulaParser`]
//! covers the declarative subset that bottled formulas actually use (`desc`,
//! `homepage`, `url`/`version`, `sha256`, `bottle do` blocks, typed
//! `depends_on` lines); anything it cannot extract a version or name from is
//! a [`FormulaParseError`](crate::error::VeloError::FormulaParseError).

use crate::error::{Result, VeloError};
use crate::formula::{Bottle, Dependency, DependencyType, Formula};
use crate::version::{VersionConstraint, VersionConstraintSet};
use regex::Regex;
use std::sync::{Arc, LazyLock};

/// Pure `source → Formula` contract.
///
/// `name` is the formula's file stem within its tap, which is authoritative
/// for the package name (Homebrew derives class names from it, not the other
/// way around).
pub trait FormulaParser: Send + Sync {
    fn parse(&self, name: &str, source: &str) -> Result<Formula>;
}

/// The default parser used by the tap manager.
pub fn default_parser() -> Arc<dyn FormulaParser> {
    Arc::new(RubyFormulaParser)
}

static QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([^"]*)""#).expect("static pattern"));

static BOTTLE_SHA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"sha256\s+(?:cellar:\s*:?\S+,\s*)?([A-Za-z0-9_]+):\s*"([0-9a-f]{64})""#)
        .expect("static pattern")
});

static PLAIN_SHA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^sha256\s+"([0-9a-f]{64})"$"#).expect("static pattern"));

static URL_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)+)").expect("static pattern"));

static DEPENDS_CONSTRAINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"=>\s*"([^"]+)""#).expect("static pattern")
});

/// Line-based extractor for the declarative formula subset.
pub struct RubyFormulaParser;

impl FormulaParser for RubyFormulaParser {
    fn parse(&self, name: &str, source: &str) -> Result<Formula> {
        let parse_error = |reason: &str| VeloError::FormulaParseError {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if !source
            .lines()
            .any(|l| l.trim_start().starts_with("class ") && l.contains("< Formula"))
        {
            return Err(parse_error("missing `class … < Formula` declaration"));
        }

        let mut description = None;
        let mut homepage = None;
        let mut url = None;
        let mut explicit_version = None;
        let mut source_sha256 = None;
        let mut root_url = None;
        let mut bottles: Vec<Bottle> = Vec::new();
        let mut dependencies: Vec<Dependency> = Vec::new();
        let mut in_bottle_block = false;

        for raw_line in source.lines() {
            let line = raw_line.trim();

            if line.starts_with("bottle do") {
                in_bottle_block = true;
                continue;
            }
            if in_bottle_block {
                if line == "end" {
                    in_bottle_block = false;
                } else if line.starts_with("root_url") {
                    root_url = first_quoted(line);
                } else if let Some(caps) = BOTTLE_SHA.captures(line) {
                    bottles.push(Bottle {
                        platform_tag: caps[1].to_string(),
                        sha256: caps[2].to_string(),
                        url: None,
                        root_url: None,
                        size: None,
                    });
                }
                continue;
            }

            if line.starts_with("desc ") {
                description = first_quoted(line);
            } else if line.starts_with("homepage ") {
                homepage = first_quoted(line);
            } else if line.starts_with("url ") && url.is_none() {
                url = first_quoted(line);
            } else if line.starts_with("version ") {
                explicit_version = first_quoted(line);
            } else if let Some(caps) = PLAIN_SHA.captures(line) {
                if source_sha256.is_none() {
                    source_sha256 = Some(caps[1].to_string());
                }
            } else if line.starts_with("depends_on ") {
                if let Some(dep) = parse_depends_on(line) {
                    dependencies.push(dep);
                }
            }
        }

        let version = explicit_version
            .or_else(|| url.as_deref().and_then(version_from_url))
            .ok_or_else(|| parse_error("no version declared and none derivable from url"))?;

        // The bottle block's root_url applies to every tag it lists.
        for bottle in &mut bottles {
            bottle.root_url = root_url.clone();
        }

        Ok(Formula {
            name: name.to_string(),
            version,
            description,
            homepage,
            dependencies,
            bottles,
            source_sha256,
            tap: None,
        })
    }
}

fn first_quoted(line: &str) -> Option<String> {
    QUOTED.captures(line).map(|c| c[1].to_string())
}

/// `depends_on "name"`, optionally with `=> :build`-style type markers or a
/// `=> "constraint"` version requirement.
fn parse_depends_on(line: &str) -> Option<Dependency> {
    let name = first_quoted(line)?;

    let dep_type = if line.contains(":build") {
        DependencyType::Build
    } else if line.contains(":test") {
        DependencyType::Test
    } else if line.contains(":optional") || line.contains(":recommended") {
        DependencyType::Optional
    } else {
        DependencyType::Required
    };

    let mut version_constraints = VersionConstraintSet::new();
    if let Some(caps) = DEPENDS_CONSTRAINT.captures(line) {
        // `depends_on "foo" => ">= 1.2.3"` — skip the quoted name itself.
        if caps[1] != name {
            if let Some(constraint) = VersionConstraint::parse(&caps[1]) {
                version_constraints.push(constraint);
            }
        }
    }

    Some(Dependency {
        name,
        dep_type,
        version_constraints,
    })
}

/// Derive a version from the last versioned segment of a source url.
fn version_from_url(url: &str) -> Option<String> {
    let basename = url.rsplit('/').next()?;
    URL_VERSION
        .captures_iter(basename)
        .last()
        .map(|caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const WGET_RB: &str = r#"
class Wget < Formula
  desc "Internet file retriever"
  homepage "https://www.gnu.org/software/wget/"
  url "https://ftp.gnu.org/gnu/wget/wget-1.24.5.tar.gz"
  sha256 "fa2dc35bab5184ecbc46a9ef83def2aaaa3f4c9f3c97d4bd19dcb07d4da637de"

  bottle do
    root_url "https://bottles.example.com/core"
    sha256 cellar: :any, arm64_sonoma: "1111111111111111111111111111111111111111111111111111111111111111"
    sha256 cellar: :any, arm64_sequoia: "2222222222222222222222222222222222222222222222222222222222222222"
    sha256 all: "3333333333333333333333333333333333333333333333333333333333333333"
  end

  depends_on "libidn2"
  depends_on "openssl@3"
  depends_on "pkg-config" => :build
  depends_on "python@3.12" => :optional
end
"#;

    #[test]
    fn parses_complete_formula() {
        let formula = RubyFormulaParser.parse("wget", WGET_RB).unwrap();
        assert_eq!(formula.name, "wget");
        assert_eq!(formula.version, "1.24.5");
        assert_eq!(formula.description.as_deref(), Some("Internet file retriever"));
        assert_eq!(
            formula.source_sha256.as_deref(),
            Some("fa2dc35bab5184ecbc46a9ef83def2aaaa3f4c9f3c97d4bd19dcb07d4da637de")
        );
    }

    #[test]
    fn bottle_block_yields_tagged_bottles_with_root_url() {
        let formula = RubyFormulaParser.parse("wget", WGET_RB).unwrap();
        assert_eq!(formula.bottles.len(), 3);

        let sonoma = formula.preferred_bottle("arm64_sonoma").unwrap();
        assert_eq!(sonoma.sha256, "1".repeat(64));
        assert_eq!(
            sonoma.resolved_url("wget", "1.24.5").unwrap(),
            "https://bottles.example.com/core/wget-1.24.5.arm64_sonoma.bottle.tar.gz"
        );

        // Unknown platform falls back to the universal bottle.
        let universal = formula.preferred_bottle("x86_64_linux").unwrap();
        assert_eq!(universal.platform_tag, "all");
    }

    #[test]
    fn depends_on_types_are_classified() {
        let formula = RubyFormulaParser.parse("wget", WGET_RB).unwrap();
        let types: Vec<_> = formula
            .dependencies
            .iter()
            .map(|d| (d.name.as_str(), d.dep_type))
            .collect();
        assert_eq!(
            types,
            vec![
                ("libidn2", DependencyType::Required),
                ("openssl@3", DependencyType::Required),
                ("pkg-config", DependencyType::Build),
                ("python@3.12", DependencyType::Optional),
            ]
        );

        let required: Vec<_> = formula.required_dependencies().map(|d| d.name.as_str()).collect();
        assert_eq!(required, vec!["libidn2", "openssl@3"]);
    }

    #[test]
    fn version_constraint_on_dependency_is_recorded() {
        let source = r#"
class Demo < Formula
  url "https://example.com/demo-1.0.0.tar.gz"
  depends_on "openssl@3" => ">=3.1.0"
end
"#;
        let formula = RubyFormulaParser.parse("demo", source).unwrap();
        let dep = &formula.dependencies[0];
        assert!(dep.version_constraints.satisfied_by("3.2.0"));
        assert!(!dep.version_constraints.satisfied_by("3.0.0"));
    }

    #[test]
    fn explicit_version_overrides_url_derivation() {
        let source = r#"
class Demo < Formula
  url "https://example.com/demo-20240101.tar.gz"
  version "2.5.0"
end
"#;
        let formula = RubyFormulaParser.parse("demo", source).unwrap();
        assert_eq!(formula.version, "2.5.0");
    }

    #[test]
    fn rejects_non_formula_source() {
        let err = RubyFormulaParser.parse("junk", "puts 'hello'").unwrap_err();
        assert!(matches!(err, VeloError::FormulaParseError { .. }));
    }

    #[test]
    fn rejects_formula_without_version() {
        let source = "class Demo < Formula\n  desc \"No version here\"\nend\n";
        let err = RubyFormulaParser.parse("demo", source).unwrap_err();
        assert!(matches!(err, VeloError::FormulaParseError { .. }));
    }
}
