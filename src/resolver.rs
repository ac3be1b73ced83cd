//! Dependency resolution: from root package names to a validated install plan.
//!
//! Resolution proceeds in five phases:
//!
//! 1. **Discovery** — depth-first walk over `required` dependency edges,
//!    with cycle detection on the visiting stack.
//! 2. **Canonicalisation** — discovered names are partitioned into
//!    equivalence classes (`python@3.12` ≡ `python3.12` ≡ `python312`).
//! 3. **Constraint collection** — every alias edge's version constraints are
//!    unioned per canonical package.
//! 4. **Conflict detection** — a constraint set none of its mentioned
//!    versions can satisfy is reported, not fatal; the orchestrator decides.
//! 5. **Materialisation** — nodes and canonicalised edges are built, and
//!    installed state is read through the prefix layout.
//!
//! The install order comes from Kahn's algorithm over the canonical edge
//! set, with `BTreeSet` seeds so the order is deterministic for a graph.
//! Nodes reference each other by canonical name resolved through the node
//! map; there are no shared owning references.

use crate::equivalence;
use crate::error::{Result, VeloError};
use crate::formula::Formula;
use crate::prefix::Prefix;
use crate::version::{VersionConstraint, VersionConstraintSet};
use std::collections::{BTreeMap, BTreeSet};

/// Fallback estimate when a bottle does not record its size.
const FALLBACK_BOTTLE_SIZE: u64 = 5 * 1024 * 1024;

/// Anything that can locate formulas by name.
///
/// The tap manager is the production source; tests provide in-memory maps.
pub trait FormulaSource {
    fn find(&self, name: &str) -> Result<Formula>;
}

impl FormulaSource for crate::tap::TapManager {
    fn find(&self, name: &str) -> Result<Formula> {
        self.find_formula(name)
    }
}

impl FormulaSource for BTreeMap<String, Formula> {
    fn find(&self, name: &str) -> Result<Formula> {
        self.get(name)
            .cloned()
            .ok_or_else(|| VeloError::FormulaNotFound(name.to_string()))
    }
}

/// One version requirement placed on a package by a dependent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyRequirement {
    /// The package that stated the requirement.
    pub requested_by: String,
    pub constraints: VersionConstraintSet,
}

/// A requirement that participates in a reported conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictingRequirement {
    pub requested_by: String,
    pub constraint: VersionConstraint,
}

/// A package whose collected constraints cannot agree on a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConflictReport {
    pub package: String,
    pub requirements: Vec<ConflictingRequirement>,
}

impl VersionConflictReport {
    pub fn describe(&self) -> Vec<String> {
        self.requirements
            .iter()
            .map(|r| format!("{} requires {}", r.requested_by, r.constraint))
            .collect()
    }
}

/// One resolved package in the graph. Immutable after materialisation except
/// for the installer's `is_installed` transition.
#[derive(Debug, Clone)]
pub struct DependencyNode {
    pub canonical_name: String,
    pub formula: Formula,
    pub requirements: Vec<DependencyRequirement>,
    pub is_installed: bool,
    pub equivalent_names: Vec<String>,
}

/// The deduplicated dependency DAG plus everything learned building it.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// canonical name → node
    pub nodes: BTreeMap<String, DependencyNode>,
    /// canonical dependent → its canonical prerequisites
    pub depends_on: BTreeMap<String, BTreeSet<String>>,
    pub version_conflicts: Vec<VersionConflictReport>,
}

impl DependencyGraph {
    /// Kahn's algorithm over the canonical edge set.
    ///
    /// Prerequisites precede dependents in the returned order; the seed set
    /// is sorted so the order is deterministic for a given graph. A result
    /// smaller than the node count means the remainder sits on a cycle.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut indegree: BTreeMap<&str, usize> = self
            .nodes
            .keys()
            .map(|name| (name.as_str(), 0))
            .collect();
        let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for (dependent, prerequisites) in &self.depends_on {
            for prerequisite in prerequisites {
                if !self.nodes.contains_key(prerequisite) {
                    continue;
                }
                *indegree.entry(dependent.as_str()).or_insert(0) += 1;
                dependents
                    .entry(prerequisite.as_str())
                    .or_default()
                    .insert(dependent.as_str());
            }
        }

        let mut ready: BTreeSet<&str> = indegree
            .iter()
            .filter_map(|(name, count)| (*count == 0).then_some(*name))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(name) = ready.iter().next().copied() {
            ready.remove(name);
            order.push(name.to_string());
            if let Some(children) = dependents.get(name) {
                for child in children {
                    if let Some(count) = indegree.get_mut(child) {
                        *count -= 1;
                        if *count == 0 {
                            ready.insert(child);
                        }
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let chain: Vec<String> = indegree
                .into_iter()
                .filter_map(|(name, count)| (count > 0).then(|| name.to_string()))
                .collect();
            return Err(VeloError::CircularDependency { chain });
        }

        Ok(order)
    }
}

/// The validated plan handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct InstallPlan {
    /// Canonicalised root names, in request order.
    pub roots: Vec<String>,
    /// Canonical names that need installing.
    pub new: Vec<String>,
    /// Canonical names already present under the prefix.
    pub already_installed: Vec<String>,
    /// Permutation of all node names; prerequisites first.
    pub install_order: Vec<String>,
    /// Bottle sizes where known, a flat fallback otherwise.
    pub estimated_download_bytes: u64,
    pub graph: DependencyGraph,
}

impl InstallPlan {
    pub fn node(&self, name: &str) -> Option<&DependencyNode> {
        self.graph.nodes.get(name)
    }

    pub fn new_nodes(&self) -> impl Iterator<Item = &DependencyNode> {
        self.new.iter().filter_map(|name| self.node(name))
    }

    pub fn has_conflicts(&self) -> bool {
        !self.graph.version_conflicts.is_empty()
    }

    /// Direct dependents of `name` within the plan.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.graph
            .depends_on
            .iter()
            .filter(|(_, prerequisites)| prerequisites.contains(name))
            .map(|(dependent, _)| dependent.clone())
            .collect()
    }
}

/// Raw edge recorded during discovery, before canonicalisation.
#[derive(Debug, Clone)]
struct RawRequirement {
    dependent: String,
    target: String,
    constraints: VersionConstraintSet,
}

/// Builds install plans from root package names.
pub struct Resolver<'a, S: FormulaSource> {
    source: &'a S,
    prefix: &'a Prefix,
    platform_tag: String,
}

impl<'a, S: FormulaSource> Resolver<'a, S> {
    pub fn new(source: &'a S, prefix: &'a Prefix, platform_tag: impl Into<String>) -> Self {
        Resolver {
            source,
            prefix,
            platform_tag: platform_tag.into(),
        }
    }

    /// Resolve roots into a validated plan.
    pub fn resolve(&self, roots: &[String]) -> Result<InstallPlan> {
        let graph = self.build_graph(roots)?;
        let install_order = graph.topological_order()?;

        let mut new = Vec::new();
        let mut already_installed = Vec::new();
        for name in &install_order {
            let node = &graph.nodes[name];
            if node.is_installed {
                already_installed.push(name.clone());
            } else {
                new.push(name.clone());
            }
        }

        let estimated_download_bytes = new
            .iter()
            .map(|name| {
                graph.nodes[name]
                    .formula
                    .preferred_bottle(&self.platform_tag)
                    .and_then(|b| b.size)
                    .unwrap_or(FALLBACK_BOTTLE_SIZE)
            })
            .sum();

        let canonical_roots: Vec<String> = roots
            .iter()
            .map(|r| equivalence::canonical_name(r))
            .collect();

        Ok(InstallPlan {
            roots: canonical_roots,
            new,
            already_installed,
            install_order,
            estimated_download_bytes,
            graph,
        })
    }

    /// Phases 1–5: discover, canonicalise, collect, detect, materialise.
    pub fn build_graph(&self, roots: &[String]) -> Result<DependencyGraph> {
        // Phase 1 — discovery.
        let mut formulas: BTreeMap<String, Formula> = BTreeMap::new();
        let mut requirements: Vec<RawRequirement> = Vec::new();
        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut visiting: Vec<String> = Vec::new();

        for root in roots {
            self.discover(root, true, &mut formulas, &mut requirements, &mut visited, &mut visiting)?;
        }

        // Phase 2 — canonicalisation.
        let mut alias_to_canonical: BTreeMap<String, String> = BTreeMap::new();
        let mut classes: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for name in formulas.keys() {
            let canonical = equivalence::canonical_name(name);
            alias_to_canonical.insert(name.clone(), canonical.clone());
            classes.entry(canonical).or_default().insert(name.clone());
        }

        // Phase 3 — constraint collection per canonical package.
        let mut collected: BTreeMap<String, Vec<DependencyRequirement>> = BTreeMap::new();
        for requirement in &requirements {
            let canonical = equivalence::canonical_name(&requirement.target);
            collected
                .entry(canonical)
                .or_default()
                .push(DependencyRequirement {
                    requested_by: equivalence::canonical_name(&requirement.dependent),
                    constraints: requirement.constraints.clone(),
                });
        }

        // Phase 4 — conflict detection. Surfaced, not fatal.
        let mut version_conflicts = Vec::new();
        for (canonical, reqs) in &collected {
            if let Some(conflict) = detect_conflict(canonical, reqs) {
                version_conflicts.push(conflict);
            }
        }

        // Phase 5 — materialisation.
        let mut nodes: BTreeMap<String, DependencyNode> = BTreeMap::new();
        for (canonical, members) in &classes {
            // Prefer the canonical spelling's formula, else the first member.
            let formula = formulas
                .get(canonical)
                .or_else(|| members.iter().next().and_then(|m| formulas.get(m)))
                .cloned()
                .ok_or_else(|| VeloError::DependencyNotFound(canonical.clone()))?;

            let mut equivalent_names: Vec<String> = equivalence::equivalent_names(canonical);
            for member in members {
                if !equivalent_names.contains(member) {
                    equivalent_names.push(member.clone());
                }
            }

            let is_installed = equivalent_names
                .iter()
                .any(|name| self.prefix.is_installed(name));

            nodes.insert(
                canonical.clone(),
                DependencyNode {
                    canonical_name: canonical.clone(),
                    formula,
                    requirements: collected.get(canonical).cloned().unwrap_or_default(),
                    is_installed,
                    equivalent_names,
                },
            );
        }

        let mut depends_on: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for name in nodes.keys() {
            depends_on.insert(name.clone(), BTreeSet::new());
        }
        for requirement in &requirements {
            let dependent = &alias_to_canonical[&requirement.dependent];
            let Some(target) = alias_to_canonical.get(&requirement.target) else {
                continue; // skipped missing dependency
            };
            if dependent == target {
                continue; // alias edge inside one class
            }
            depends_on
                .get_mut(dependent)
                .expect("dependent was materialised")
                .insert(target.clone());
        }

        Ok(DependencyGraph {
            nodes,
            depends_on,
            version_conflicts,
        })
    }

    fn discover(
        &self,
        name: &str,
        is_root: bool,
        formulas: &mut BTreeMap<String, Formula>,
        requirements: &mut Vec<RawRequirement>,
        visited: &mut BTreeSet<String>,
        visiting: &mut Vec<String>,
    ) -> Result<()> {
        if let Some(position) = visiting.iter().position(|n| n == name) {
            return Err(VeloError::CircularDependency {
                chain: visiting[position..].to_vec(),
            });
        }
        if visited.contains(name) {
            return Ok(());
        }

        let formula = match self.lookup_with_aliases(name) {
            Ok(formula) => formula,
            Err(VeloError::FormulaNotFound(_)) if !is_root => {
                // Dependencies without formulas (platform-provided libraries)
                // are skipped; roots must exist.
                tracing::warn!("skipping unavailable dependency '{name}'");
                visited.insert(name.to_string());
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        visiting.push(name.to_string());
        for dependency in formula.required_dependencies() {
            requirements.push(RawRequirement {
                dependent: name.to_string(),
                target: dependency.name.clone(),
                constraints: dependency.version_constraints.clone(),
            });
            self.discover(
                &dependency.name,
                false,
                formulas,
                requirements,
                visited,
                visiting,
            )?;
        }
        visiting.pop();

        visited.insert(name.to_string());
        formulas.insert(name.to_string(), formula);
        Ok(())
    }

    /// Locate a formula under any spelling of its equivalence class.
    fn lookup_with_aliases(&self, name: &str) -> Result<Formula> {
        match self.source.find(name) {
            Ok(formula) => Ok(formula),
            Err(VeloError::FormulaNotFound(_)) => {
                for alias in equivalence::equivalent_names(name) {
                    if alias != name {
                        if let Ok(formula) = self.source.find(&alias) {
                            return Ok(formula);
                        }
                    }
                }
                Err(VeloError::FormulaNotFound(name.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

/// A constraint set conflicts when none of the versions it mentions
/// satisfies the whole conjunction.
fn detect_conflict(
    package: &str,
    requirements: &[DependencyRequirement],
) -> Option<VersionConflictReport> {
    let constraints: Vec<(&str, &VersionConstraint)> = requirements
        .iter()
        .flat_map(|req| {
            req.constraints
                .constraints
                .iter()
                .map(move |c| (req.requested_by.as_str(), c))
        })
        .collect();

    let mentioned: BTreeSet<&str> = constraints.iter().map(|(_, c)| c.version.as_str()).collect();
    if mentioned.len() < 2 {
        return None;
    }

    let satisfiable = mentioned
        .iter()
        .any(|version| constraints.iter().all(|(_, c)| c.satisfied_by(version)));
    if satisfiable {
        return None;
    }

    Some(VersionConflictReport {
        package: package.to_string(),
        requirements: constraints
            .into_iter()
            .map(|(requested_by, constraint)| ConflictingRequirement {
                requested_by: requested_by.to_string(),
                constraint: constraint.clone(),
            })
            .collect(),
    })
}
