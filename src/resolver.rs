//! Dependency Resolver
//!
//! Builds a directed "depends-on" graph over the discovered modules and turns
//! it into an installation order where every dependency precedes its
//! dependents.
//!
//! # Design
//!
//! - **Pure logic**: no I/O; input is module paths plus declared dependencies
//! - **Fail closed**: any cycle refuses the whole resolution
//! - **Deterministic**: roots are visited in insertion (discovery) order and
//!   dependencies in declared order, so a fixed discovery set always yields
//!   the same plan
//! - **Missing targets warn**: a dependency outside the discovery set is
//!   reported but does not stop resolution

use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::discovery::DiscoverySet;
use crate::types::ModulePath;

/// Resolution refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The chain starts and ends with the same module, e.g. `a -> b -> a`
    #[error("circular dependency: {}", format_chain(.chain))]
    Cycle { chain: Vec<ModulePath> },
}

fn format_chain(chain: &[ModulePath]) -> String {
    chain
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl From<ResolveError> for crate::error::ModhostError {
    fn from(err: ResolveError) -> Self {
        crate::error::ModhostError::Resolve(err.to_string())
    }
}

/// A declared dependency that is not part of the discovery set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingDependency {
    pub module: ModulePath,
    pub dependency: ModulePath,
}

/// Successful resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Dependencies first
    pub order: Vec<ModulePath>,
    pub missing: Vec<MissingDependency>,
}

/// DFS node colouring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    /// On the current DFS stack
    InProgress,
    Done,
}

/// Directed graph, edges point from dependent to dependency
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<ModulePath>,
    edges: HashMap<ModulePath, Vec<ModulePath>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph for every module in a discovery set
    pub fn from_discovery(set: &DiscoverySet) -> Self {
        let mut graph = Self::new();
        for module in set.iter() {
            graph.add_module(module.path.clone(), module.dependencies().to_vec());
        }
        graph
    }

    /// Add a node with its dependencies. Re-adding a node replaces its edges
    /// but keeps its original position.
    pub fn add_module(&mut self, path: ModulePath, dependencies: Vec<ModulePath>) {
        if !self.edges.contains_key(&path) {
            self.nodes.push(path.clone());
        }
        self.edges.insert(path, dependencies);
    }

    pub fn contains(&self, path: &ModulePath) -> bool {
        self.edges.contains_key(path)
    }

    /// Declared dependencies of `path` (including ones outside the graph)
    pub fn dependencies(&self, path: &ModulePath) -> &[ModulePath] {
        self.edges.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Dependencies that reference modules not present in the graph
    pub fn missing_dependencies(&self) -> Vec<MissingDependency> {
        self.nodes
            .iter()
            .flat_map(|node| {
                self.dependencies(node)
                    .iter()
                    .filter(|dep| !self.contains(dep))
                    .map(move |dep| MissingDependency {
                        module: node.clone(),
                        dependency: dep.clone(),
                    })
            })
            .collect()
    }

    /// Topologically sort the graph.
    ///
    /// Output is the DFS post-order: a node is emitted only after all of its
    /// present dependencies.
    pub fn resolve(&self) -> Result<Resolution, ResolveError> {
        let missing = self.missing_dependencies();
        for m in &missing {
            warn!(
                "{} depends on {}, which is not available; installing without it",
                m.module, m.dependency
            );
        }

        let mut marks: HashMap<&ModulePath, Mark> = HashMap::with_capacity(self.nodes.len());
        let mut stack: Vec<&ModulePath> = Vec::new();
        let mut order: Vec<ModulePath> = Vec::with_capacity(self.nodes.len());

        for node in &self.nodes {
            if !marks.contains_key(node) {
                self.visit(node, &mut marks, &mut stack, &mut order)?;
            }
        }

        debug!("Dependency resolution complete: {:?}", order);
        Ok(Resolution { order, missing })
    }

    fn visit<'a>(
        &'a self,
        node: &'a ModulePath,
        marks: &mut HashMap<&'a ModulePath, Mark>,
        stack: &mut Vec<&'a ModulePath>,
        order: &mut Vec<ModulePath>,
    ) -> Result<(), ResolveError> {
        marks.insert(node, Mark::InProgress);
        stack.push(node);

        for dep in self.dependencies(node) {
            if !self.contains(dep) {
                continue;
            }
            match marks.get(dep) {
                Some(Mark::Done) => {}
                Some(Mark::InProgress) => {
                    let start = stack.iter().position(|p| *p == dep).unwrap_or(0);
                    let mut chain: Vec<ModulePath> =
                        stack[start..].iter().map(|p| (*p).clone()).collect();
                    chain.push(dep.clone());
                    return Err(ResolveError::Cycle { chain });
                }
                None => self.visit(dep, marks, stack, order)?,
            }
        }

        stack.pop();
        marks.insert(node, Mark::Done);
        order.push(node.clone());
        Ok(())
    }
}

/// Resolve an installation order for a discovery set
pub fn resolve(set: &DiscoverySet) -> Result<Resolution, ResolveError> {
    DependencyGraph::from_discovery(set).resolve()
}

/// Why a module is part of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRole {
    /// Named by the operator (or part of "all")
    Target,
    /// Pulled in because a target depends on it
    Dependency,
}

/// One entry of an installation plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub path: ModulePath,
    pub role: StepRole,
    /// Dependency already installed from identical source; nothing to do
    pub satisfied: bool,
}

/// Dependency-ordered sequence of modules for one operation. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationPlan {
    pub steps: Vec<PlanStep>,
    pub missing: Vec<MissingDependency>,
}

impl InstallationPlan {
    /// Resolve `set` and annotate each step.
    ///
    /// `targets == None` means every module is a target. `is_satisfied` is
    /// only consulted for dependency steps; targets always run.
    pub fn build(
        set: &DiscoverySet,
        targets: Option<&[ModulePath]>,
        is_satisfied: impl Fn(&ModulePath) -> bool,
    ) -> Result<Self, ResolveError> {
        let resolution = resolve(set)?;
        let steps = resolution
            .order
            .into_iter()
            .map(|path| {
                let role = match targets {
                    Some(targets) if !targets.contains(&path) => StepRole::Dependency,
                    _ => StepRole::Target,
                };
                let satisfied = role == StepRole::Dependency && is_satisfied(&path);
                PlanStep {
                    path,
                    role,
                    satisfied,
                }
            })
            .collect();
        Ok(Self {
            steps,
            missing: resolution.missing,
        })
    }

    pub fn paths(&self) -> Vec<ModulePath> {
        self.steps.iter().map(|s| s.path.clone()).collect()
    }

    /// Steps that will actually run
    pub fn pending(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(|s| !s.satisfied)
    }
}
