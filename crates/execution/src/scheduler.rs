//! Remote job schedulers.
//!
//! [`AwsCliScheduler`] drives AWS Batch through the `aws` command line
//! tool; [`DryRunScheduler`] only logs what would be submitted.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use shipyard_core::{ContainerSpec, JobDefinitionRef, RemoteJobId};
use tokio::process::Command;
use tracing::{debug, info};

/// Errors raised while talking to a scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The scheduler command could not be started
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// Program that failed to start
        program: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// The scheduler command exited unsuccessfully
    #[error("{command} failed (exit code {code:?}): {stderr}")]
    CommandFailed {
        /// Sub-command that failed
        command: String,
        /// Exit code, if the process exited normally
        code: Option<i32>,
        /// Captured standard error
        stderr: String,
    },

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The scheduler rejected the request
    #[error("scheduler rejected job '{job}': {reason}")]
    Rejected {
        /// Job name
        job: String,
        /// Reason given by the scheduler
        reason: String,
    },
}

/// One job submission request.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSubmission {
    /// Job name
    pub name: String,
    /// Queue to submit to
    pub queue: String,
    /// Definition the job runs
    pub definition: JobDefinitionRef,
    /// Jobs that must succeed first
    pub depends_on: Vec<RemoteJobId>,
    /// Container command override
    pub command: Vec<String>,
}

/// A remote job scheduler.
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Register (a new revision of) a job definition.
    async fn register_job_definition(
        &self,
        name: &str,
        container: &ContainerSpec,
    ) -> Result<JobDefinitionRef, SchedulerError>;

    /// Submit one job and return the identifier the scheduler assigned.
    async fn submit_job(&self, job: &JobSubmission) -> Result<RemoteJobId, SchedulerError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterOutput {
    job_definition_name: String,
    job_definition_arn: String,
    #[serde(default)]
    revision: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitOutput {
    job_id: String,
}

/// AWS Batch scheduler backed by the `aws` CLI.
pub struct AwsCliScheduler {
    program: String,
    region: Option<String>,
}

impl AwsCliScheduler {
    /// Use the `aws` program found on `PATH`.
    pub fn new(region: Option<String>) -> Self {
        Self {
            program: "aws".to_string(),
            region,
        }
    }

    /// Use a different executable (e.g. a wrapper script).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Arguments for `register-job-definition`.
    pub fn register_args(&self, name: &str, container: &ContainerSpec) -> Result<Vec<String>, SchedulerError> {
        let mut args = self.base_args("register-job-definition");
        args.extend([
            "--job-definition-name".to_string(),
            name.to_string(),
            "--type".to_string(),
            "container".to_string(),
            "--container-properties".to_string(),
            serde_json::to_string(container)?,
        ]);
        Ok(args)
    }

    /// Arguments for `submit-job`.
    pub fn submit_args(&self, job: &JobSubmission) -> Result<Vec<String>, SchedulerError> {
        let mut args = self.base_args("submit-job");
        args.extend([
            "--job-name".to_string(),
            job.name.clone(),
            "--job-queue".to_string(),
            job.queue.clone(),
            "--job-definition".to_string(),
            job.definition.arn.clone(),
        ]);
        if !job.depends_on.is_empty() {
            let depends_on: Vec<_> = job
                .depends_on
                .iter()
                .map(|id| json!({ "jobId": id.as_str() }))
                .collect();
            args.push("--depends-on".to_string());
            args.push(serde_json::to_string(&depends_on)?);
        }
        args.push("--container-overrides".to_string());
        args.push(serde_json::to_string(&json!({ "command": job.command }))?);
        Ok(args)
    }

    fn base_args(&self, command: &str) -> Vec<String> {
        let mut args = vec!["batch".to_string(), command.to_string(), "--output".to_string(), "json".to_string()];
        if let Some(region) = &self.region {
            args.push("--region".to_string());
            args.push(region.clone());
        }
        args
    }

    async fn run(&self, args: &[String]) -> Result<String, SchedulerError> {
        let command = args.get(1).cloned().unwrap_or_default();
        debug!("Running {} {}", self.program, args.join(" "));

        let output = Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|source| SchedulerError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(SchedulerError::CommandFailed {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl JobScheduler for AwsCliScheduler {
    async fn register_job_definition(
        &self,
        name: &str,
        container: &ContainerSpec,
    ) -> Result<JobDefinitionRef, SchedulerError> {
        let stdout = self.run(&self.register_args(name, container)?).await?;
        let out: RegisterOutput = serde_json::from_str(&stdout)?;
        Ok(JobDefinitionRef {
            name: out.job_definition_name,
            arn: out.job_definition_arn,
            revision: out.revision,
        })
    }

    async fn submit_job(&self, job: &JobSubmission) -> Result<RemoteJobId, SchedulerError> {
        let stdout = self.run(&self.submit_args(job)?).await?;
        let out: SubmitOutput = serde_json::from_str(&stdout)?;
        Ok(RemoteJobId::new(out.job_id))
    }
}

/// Scheduler that submits nothing and hands out synthetic job ids.
#[derive(Default)]
pub struct DryRunScheduler {
    submitted: Mutex<Vec<JobSubmission>>,
}

impl DryRunScheduler {
    /// Create a dry-run scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Submissions seen so far.
    pub fn submissions(&self) -> Vec<JobSubmission> {
        self.submitted.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl JobScheduler for DryRunScheduler {
    async fn register_job_definition(
        &self,
        name: &str,
        container: &ContainerSpec,
    ) -> Result<JobDefinitionRef, SchedulerError> {
        info!(
            "[dry run] register job definition {} with image {}",
            name,
            container.image.as_deref().unwrap_or("<none>")
        );
        Ok(JobDefinitionRef {
            name: name.to_string(),
            arn: format!("dry-run:job-definition/{name}"),
            revision: None,
        })
    }

    async fn submit_job(&self, job: &JobSubmission) -> Result<RemoteJobId, SchedulerError> {
        let id = RemoteJobId::new(format!("dry-run-{}", ulid::Ulid::new()));
        info!(
            "[dry run] submit {} as {} (depends on: {:?}, command: {:?})",
            job.name,
            id,
            job.depends_on.iter().map(RemoteJobId::as_str).collect::<Vec<_>>(),
            job.command
        );
        if let Ok(mut submitted) = self.submitted.lock() {
            submitted.push(job.clone());
        }
        Ok(id)
    }
}
