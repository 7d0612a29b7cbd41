//! Job graph submission.
//!
//! Registers one job definition for the image, then submits every DAG node
//! with the remote ids of its upstream jobs as dependencies. A job is never
//! submitted before all of its upstream jobs have an id.

use std::collections::BTreeMap;
use std::sync::Arc;

use shipyard_core::{ContainerSpec, Dag, JobNode, RemoteJobId, SubmittedJob};
use tracing::info;

use crate::dependency::{plan, DependencyError};
use crate::scheduler::{JobScheduler, JobSubmission, SchedulerError};

/// Errors raised while submitting a job graph.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The DAG cannot be ordered; nothing was submitted
    #[error(transparent)]
    Dependency(#[from] DependencyError),

    /// Registering the job definition failed
    #[error("failed to register job definition '{name}': {source}")]
    Register {
        /// Definition name
        name: String,
        /// Underlying error
        source: SchedulerError,
    },

    /// Submitting a job failed; jobs submitted before it keep running
    #[error("failed to submit job '{job}' ({} jobs already submitted): {source}", .submitted.len())]
    Submit {
        /// Job that failed
        job: String,
        /// Jobs accepted before the failure
        submitted: Vec<SubmittedJob>,
        /// Underlying error
        source: SchedulerError,
    },
}

/// What to submit and where.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Name of the job definition to register
    pub job_definition: String,
    /// Container properties; the image is set from `image`
    pub container: ContainerSpec,
    /// Already-pushed image reference
    pub image: String,
    /// Queue the jobs go to
    pub queue: String,
    /// Command template; `{name}` is replaced by the job name
    pub command: Vec<String>,
}

impl SubmitRequest {
    /// Command override for `job`.
    pub fn command_for(&self, job: &str) -> Vec<String> {
        self.command.iter().map(|part| part.replace("{name}", job)).collect()
    }
}

/// Submits job graphs to a [`JobScheduler`].
pub struct JobGraphSubmitter {
    scheduler: Arc<dyn JobScheduler>,
}

impl JobGraphSubmitter {
    /// Create a submitter.
    pub fn new(scheduler: Arc<dyn JobScheduler>) -> Self {
        Self { scheduler }
    }

    /// Submit every job of `dag` and return the remote id of each.
    ///
    /// The DAG is ordered before any remote call, so an unknown upstream
    /// or a cycle causes no side effects. The first failing submission
    /// aborts the batch.
    pub async fn submit(&self, dag: &Dag, request: &SubmitRequest) -> Result<BTreeMap<String, RemoteJobId>, SubmitError> {
        let order = plan(dag)?;

        info!("Registering job definition {}", request.job_definition);
        let container = request.container.clone().with_image(request.image.clone());
        let definition = self
            .scheduler
            .register_job_definition(&request.job_definition, &container)
            .await
            .map_err(|source| SubmitError::Register {
                name: request.job_definition.clone(),
                source,
            })?;

        let mut registry: BTreeMap<String, RemoteJobId> = BTreeMap::new();
        let mut submitted = Vec::with_capacity(order.len());

        for node in order {
            let depends_on = upstream_ids(node, &registry)?;
            let submission = JobSubmission {
                name: node.name.clone(),
                queue: request.queue.clone(),
                definition: definition.clone(),
                depends_on,
                command: request.command_for(&node.name),
            };

            match self.scheduler.submit_job(&submission).await {
                Ok(remote_job_id) => {
                    info!("Submitted task {} with job id {}", node.name, remote_job_id);
                    registry.insert(node.name.clone(), remote_job_id.clone());
                    submitted.push(SubmittedJob {
                        name: node.name.clone(),
                        remote_job_id,
                    });
                }
                Err(source) => {
                    return Err(SubmitError::Submit {
                        job: node.name.clone(),
                        submitted,
                        source,
                    })
                }
            }
        }

        Ok(registry)
    }
}

/// Remote ids of the upstream jobs of `node`, all of which must already be submitted.
fn upstream_ids(node: &JobNode, registry: &BTreeMap<String, RemoteJobId>) -> Result<Vec<RemoteJobId>, DependencyError> {
    node.upstream
        .iter()
        .map(|upstream| {
            registry
                .get(upstream)
                .cloned()
                .ok_or_else(|| DependencyError::UnknownUpstream {
                    job: node.name.clone(),
                    upstream: upstream.clone(),
                })
        })
        .collect()
}
