//! Dependency planning for job graphs.

use std::collections::{BTreeMap, BTreeSet};

use shipyard_core::{Dag, JobNode};

/// A job graph that cannot be submitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DependencyError {
    /// A job names an upstream job that is not part of the graph
    #[error("job '{job}' depends on unknown job '{upstream}'")]
    UnknownUpstream {
        /// Job declaring the dependency
        job: String,
        /// Missing upstream name
        upstream: String,
    },

    /// The graph has a cycle
    #[error("dependency cycle between jobs: {}", .jobs.join(", "))]
    Cycle {
        /// Jobs that could not be ordered
        jobs: Vec<String>,
    },
}

/// Dependency graph over the jobs of a [`Dag`].
pub struct DepGraph<'a> {
    dag: &'a Dag,
    /// job -> [dependents]
    reverse: BTreeMap<&'a str, Vec<&'a str>>,
}

impl<'a> DepGraph<'a> {
    /// Build the graph, rejecting upstream names the DAG does not define.
    pub fn build(dag: &'a Dag) -> Result<Self, DependencyError> {
        let mut reverse: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for node in dag.nodes() {
            for upstream in &node.upstream {
                if !dag.contains(upstream) {
                    return Err(DependencyError::UnknownUpstream {
                        job: node.name.clone(),
                        upstream: upstream.clone(),
                    });
                }
                reverse.entry(upstream.as_str()).or_default().push(node.name.as_str());
            }
        }
        Ok(Self { dag, reverse })
    }

    /// Jobs in an order where every job follows all of its upstream jobs.
    ///
    /// Among jobs that are ready at the same time, names are taken in
    /// lexical order, so the result is stable for a given DAG.
    pub fn topological_sort(&self) -> Result<Vec<&'a JobNode>, DependencyError> {
        let mut pending: BTreeMap<&str, usize> = self
            .dag
            .nodes()
            .map(|node| (node.name.as_str(), node.upstream.len()))
            .collect();
        let mut ready: BTreeSet<&str> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut sorted = Vec::with_capacity(self.dag.len());
        while let Some(name) = ready.pop_first() {
            pending.remove(name);
            if let Some(node) = self.dag.get(name) {
                sorted.push(node);
            }

            for dependent in self.reverse.get(name).into_iter().flatten() {
                if let Some(count) = pending.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if !pending.is_empty() {
            return Err(DependencyError::Cycle {
                jobs: pending.keys().map(|name| name.to_string()).collect(),
            });
        }
        Ok(sorted)
    }
}

/// Order the jobs of `dag` for submission.
pub fn plan(dag: &Dag) -> Result<Vec<&JobNode>, DependencyError> {
    DepGraph::build(dag)?.topological_sort()
}
