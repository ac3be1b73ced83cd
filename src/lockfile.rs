//! `velo.lock` — reproducible reinstallation records.
//!
//! The lockfile pins every resolved package to the exact version, bottle URL
//! and digest that an orchestration produced. The dependencies map is keyed
//! and serialized in sorted order so repeated writes are byte-identical.

use crate::cache::TapMetadataStore;
use crate::error::Result;
use crate::resolver::InstallPlan;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const LOCKFILE_NAME: &str = "velo.lock";
const LOCKFILE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedDependency {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedTap {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lockfile {
    pub lockfile_version: u32,
    pub dependencies: BTreeMap<String, LockedDependency>,
    pub taps: BTreeMap<String, LockedTap>,
}

impl Default for Lockfile {
    fn default() -> Self {
        Lockfile {
            lockfile_version: LOCKFILE_VERSION,
            dependencies: BTreeMap::new(),
            taps: BTreeMap::new(),
        }
    }
}

impl Lockfile {
    /// Pin every node of a resolved plan, recording the bottle that would be
    /// (or was) used on `platform_tag` and the current tap commits.
    pub fn from_plan(
        plan: &InstallPlan,
        platform_tag: &str,
        tap_metadata: &TapMetadataStore,
    ) -> Self {
        let mut lockfile = Lockfile::default();

        for (name, node) in &plan.graph.nodes {
            let bottle = node.formula.preferred_bottle(platform_tag);
            let deps: Vec<String> = plan
                .graph
                .depends_on
                .get(name)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();

            lockfile.dependencies.insert(
                name.clone(),
                LockedDependency {
                    version: node.formula.version.clone(),
                    resolved_url: bottle
                        .and_then(|b| b.resolved_url(&node.formula.name, &node.formula.version)),
                    sha256: bottle.map(|b| b.sha256.clone()),
                    tap: node.formula.tap.clone(),
                    deps,
                },
            );

            if let Some(tap) = &node.formula.tap {
                let commit = tap_metadata.get(tap).and_then(|m| m.last_commit);
                lockfile
                    .taps
                    .entry(tap.clone())
                    .or_insert(LockedTap { commit });
            }
        }

        lockfile
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}
