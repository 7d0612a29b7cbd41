//! Execution layer - dependency planning and remote job submission.

#![warn(missing_docs)]

pub mod dependency;
pub mod scheduler;
pub mod submitter;

pub use dependency::{plan, DepGraph, DependencyError};
pub use scheduler::{AwsCliScheduler, DryRunScheduler, JobScheduler, JobSubmission, SchedulerError};
pub use submitter::{JobGraphSubmitter, SubmitError, SubmitRequest};
