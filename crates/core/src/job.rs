//! Job graph model - the DAG handed to the remote scheduler.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::id::RemoteJobId;

/// A node of the job graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNode {
    /// Job name, unique within the DAG
    pub name: String,

    /// Jobs that must finish before this one starts
    pub upstream: BTreeSet<String>,
}

/// A mapping of job name to its upstream job names.
///
/// Serialized as a plain JSON/YAML object: `{"fit": ["clean"], "clean": []}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, BTreeSet<String>>", into = "BTreeMap<String, BTreeSet<String>>")]
pub struct Dag {
    nodes: BTreeMap<String, JobNode>,
}

impl Dag {
    /// Create an empty DAG.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a node.
    pub fn add<I, S>(&mut self, name: impl Into<String>, upstream: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let node = JobNode {
            name: name.clone(),
            upstream: upstream.into_iter().map(Into::into).collect(),
        };
        self.nodes.insert(name, node);
        self
    }

    /// Builder-style [`Dag::add`].
    pub fn with<I, S>(mut self, name: impl Into<String>, upstream: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add(name, upstream);
        self
    }

    /// Look up a node by name.
    pub fn get(&self, name: &str) -> Option<&JobNode> {
        self.nodes.get(name)
    }

    /// Whether a job with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Nodes in name order.
    pub fn nodes(&self) -> impl Iterator<Item = &JobNode> {
        self.nodes.values()
    }

    /// Number of jobs.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if the DAG has no jobs.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl From<BTreeMap<String, BTreeSet<String>>> for Dag {
    fn from(map: BTreeMap<String, BTreeSet<String>>) -> Self {
        let nodes = map
            .into_iter()
            .map(|(name, upstream)| (name.clone(), JobNode { name, upstream }))
            .collect();
        Self { nodes }
    }
}

impl From<Dag> for BTreeMap<String, BTreeSet<String>> {
    fn from(dag: Dag) -> Self {
        dag.nodes
            .into_iter()
            .map(|(name, node)| (name, node.upstream))
            .collect()
    }
}

/// A job accepted by the remote scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedJob {
    /// Job name from the DAG
    pub name: String,

    /// Identifier assigned by the scheduler
    pub remote_job_id: RemoteJobId,
}

/// Container properties for a job definition.
///
/// Only `image` is interpreted; every other key is forwarded verbatim to
/// the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Image reference the jobs run in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Remaining scheduler-specific properties (vcpus, memory, ...)
    #[serde(flatten)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl ContainerSpec {
    /// Return a copy pointing at `image`.
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }
}

/// A registered job definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinitionRef {
    /// Definition name
    pub name: String,

    /// Fully qualified reference used when submitting jobs
    pub arn: String,

    /// Revision created by this registration, if reported
    #[serde(default)]
    pub revision: Option<u64>,
}
