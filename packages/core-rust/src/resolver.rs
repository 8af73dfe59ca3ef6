//! Dependency resolution for resource start ordering.
//!
//! Turns a dependency graph (`name -> names it requires`) into a total order in
//! which every node appears after all of its dependencies. The algorithm is a
//! repeated scan: every pass appends each node whose remaining dependency set is
//! empty and strikes it from all other sets. A pass that orders nothing means the
//! graph contains a cycle or a reference to an undeclared node.
//!
//! The scan is quadratic, which is fine for the tens of resources a service
//! declares. Among nodes that become ready in the same pass the order follows the
//! iteration order of the graph and must not be relied upon.

use std::collections::{BTreeMap, BTreeSet};

/// Errors produced while ordering a dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// No further node could be ordered: a cycle or an undeclared dependency.
    #[error("unsolvable dependency graph, unresolved nodes: {}", format_unresolved(.unresolved))]
    Unsolvable {
        /// Nodes left unordered, with the dependencies they were still waiting on.
        unresolved: BTreeMap<String, BTreeSet<String>>,
    },
}

fn format_unresolved(unresolved: &BTreeMap<String, BTreeSet<String>>) -> String {
    unresolved
        .iter()
        .map(|(node, deps)| {
            let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
            format!("{node} -> [{}]", deps.join(", "))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Orders `graph` so that every node follows all of its dependencies.
///
/// `graph` maps a node name to the names it depends on. Dependencies must
/// themselves be keys of the graph.
///
/// # Errors
///
/// Returns [`ResolveError::Unsolvable`] if the graph contains a cycle or a node
/// depends on a name that is not declared. A partial order is never returned.
pub fn resolve<I, N, D>(graph: I) -> Result<Vec<String>, ResolveError>
where
    I: IntoIterator<Item = (N, D)>,
    N: Into<String>,
    D: IntoIterator,
    D::Item: Into<String>,
{
    // Keep declaration order so ties are stable for a given input.
    let mut pending: Vec<(String, BTreeSet<String>)> = Vec::new();
    for (node, deps) in graph {
        let node = node.into();
        let deps: BTreeSet<String> = deps.into_iter().map(Into::into).collect();
        if let Some(existing) = pending.iter_mut().find(|(name, _)| *name == node) {
            existing.1.extend(deps);
        } else {
            pending.push((node, deps));
        }
    }

    let total = pending.len();
    let mut ordered: Vec<String> = Vec::with_capacity(total);

    loop {
        let mut solved_something = false;
        let mut index = 0;
        while index < pending.len() {
            if pending[index].1.is_empty() {
                let (node, _) = pending.remove(index);
                for (_, deps) in &mut pending {
                    deps.remove(&node);
                }
                ordered.push(node);
                solved_something = true;
            } else {
                index += 1;
            }
        }

        if ordered.len() == total {
            return Ok(ordered);
        }
        if !solved_something {
            return Err(ResolveError::Unsolvable {
                unresolved: pending.into_iter().collect(),
            });
        }
    }
}

/// Incrementally built dependency graph.
///
/// Convenience wrapper over [`resolve`] for callers that discover nodes one at
/// a time (e.g. a service descriptor collecting resources).
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<(String, BTreeSet<String>)>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `node` with its dependencies. Re-declaring a node extends its
    /// dependency set.
    pub fn add<N, D>(&mut self, node: N, depends_on: D) -> &mut Self
    where
        N: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        let node = node.into();
        let deps = depends_on.into_iter().map(Into::into);
        if let Some(entry) = self.nodes.iter_mut().find(|(name, _)| *name == node) {
            entry.1.extend(deps);
        } else {
            self.nodes.push((node, deps.collect()));
        }
        self
    }

    /// Returns `true` if `node` has been declared.
    #[must_use]
    pub fn contains(&self, node: &str) -> bool {
        self.nodes.iter().any(|(name, _)| name == node)
    }

    /// Number of declared nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if no node has been declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Resolves the start order of the declared nodes.
    ///
    /// # Errors
    ///
    /// See [`resolve`].
    pub fn resolve(&self) -> Result<Vec<String>, ResolveError> {
        resolve(self.nodes.iter().cloned())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
