//! shipyard CLI - package a project and ship it to storage or AWS Batch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use shipyard_core::{Dag, Provider, ShipyardConfig, StorageConfig};
use shipyard_execution::{AwsCliScheduler, DryRunScheduler, JobGraphSubmitter, JobScheduler, SubmitRequest};
use shipyard_source::{compress, GitOracle, SelectionWarning, Selector};
use shipyard_storage::{BoxStore, LocalStore, ObjectStore, TransferEngine, TransferProgress};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(about = "Package a project and ship it to remote storage or AWS Batch", long_about = None)]
struct Cli {
    /// Project root
    #[arg(short = 'C', long, default_value = ".", global = true)]
    project: PathBuf,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Select project files and compress them into an artifact
    Package {
        /// Artifact name (defaults to the project directory name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Upload files or directories to the configured storage
    Upload {
        /// Paths to upload
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Replace remote files and folders that already exist
        #[arg(long)]
        replace: bool,
        /// Remote folder path (defaults to the rendered storage path)
        #[arg(long)]
        target: Option<String>,
    },
    /// Submit a job graph to AWS Batch
    Submit {
        /// DAG file (JSON or YAML): job name -> upstream job names
        #[arg(long)]
        dag: PathBuf,
        /// Image reference (defaults to <repository>:<tag>)
        #[arg(long)]
        image: Option<String>,
        /// Tag appended to the configured repository
        #[arg(long, default_value = "latest")]
        tag: String,
        /// Job definition name override
        #[arg(long)]
        job_definition: Option<String>,
        /// Log submissions instead of calling AWS
        #[arg(long)]
        dry_run: bool,
    },
    /// Validate the configuration and print the resolved settings
    Check,
}

/// Logs upload progress.
struct LogProgress;

impl TransferProgress for LogProgress {
    fn advance(&self, item: &str, bytes: u64) {
        debug!("{}: +{} bytes", item, bytes);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let project = cli.project.clone();
    let config = ShipyardConfig::load(&project)
        .with_context(|| format!("Invalid configuration in {}", project.display()))?;

    match cli.command {
        Commands::Package { name } => {
            let warnings = package(&project, &config, name)?;
            // warn on exit
            for warning in warnings {
                eprintln!("Warning: {warning}");
            }
        }
        Commands::Upload { paths, replace, target } => {
            upload(&project, &config.storage, &paths, replace, target).await?;
        }
        Commands::Submit {
            dag,
            image,
            tag,
            job_definition,
            dry_run,
        } => {
            let Some(batch) = &config.batch else {
                bail!("No 'batch' section in the configuration");
            };
            let raw = std::fs::read_to_string(&dag).with_context(|| format!("Failed to read {}", dag.display()))?;
            let dag: Dag = serde_yaml::from_str(&raw).with_context(|| format!("Invalid DAG in {}", dag.display()))?;

            let request = SubmitRequest {
                job_definition: job_definition
                    .or_else(|| batch.job_definition.clone())
                    .unwrap_or_else(|| artifact_name(&project, &config, None)),
                container: batch.container_properties.clone(),
                image: image.unwrap_or_else(|| format!("{}:{}", batch.repository, tag)),
                queue: batch.job_queue.clone(),
                command: batch.command.clone(),
            };

            let scheduler: Arc<dyn JobScheduler> = if dry_run {
                Arc::new(DryRunScheduler::new())
            } else {
                Arc::new(AwsCliScheduler::new(batch.region_name.clone()))
            };

            let ids = JobGraphSubmitter::new(scheduler).submit(&dag, &request).await?;
            println!("Submitted {} jobs", ids.len());
            for (name, id) in ids {
                println!("  {name} | {id}");
            }
        }
        Commands::Check => {
            let hash = GitOracle::head_commit(&project);
            println!("{}", serde_yaml::to_string(&config)?);
            println!("Artifact name: {}", artifact_name(&project, &config, None));
            println!("Git commit: {}", hash.as_deref().unwrap_or("<none>"));
            println!("Storage path: {}", config.storage.render_path(hash.as_deref(), chrono::Utc::now()));
        }
    }

    Ok(())
}

fn artifact_name(project: &Path, config: &ShipyardConfig, name: Option<String>) -> String {
    name.or_else(|| config.source.name.clone())
        .or_else(|| {
            project
                .canonicalize()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        })
        .unwrap_or_else(|| "artifact".to_string())
}

fn package(project: &Path, config: &ShipyardConfig, name: Option<String>) -> Result<Vec<SelectionWarning>> {
    let policy = config.source.policy()?;
    let name = artifact_name(project, config, name);
    // relative to the project root
    let staging = config.source.destination.join(&name);

    // earlier artifacts and the local store live inside the project
    let selection = Selector::git()
        .skipping(&config.source.destination)
        .skipping(&config.storage.local_root)
        .select(project, &staging, &policy)?;
    let archive = project.join(&config.source.destination).join(format!("{name}.tar.gz"));
    compress(&project.join(&staging), &archive)?;

    info!("Packaged {} files", selection.files.len());
    println!("Artifact: {}", archive.display());
    Ok(selection.warnings)
}

async fn upload(
    project: &Path,
    storage: &StorageConfig,
    paths: &[PathBuf],
    replace: bool,
    target: Option<String>,
) -> Result<()> {
    let store: Arc<dyn ObjectStore> = match storage.provider {
        Some(Provider::Box) => {
            let Some(credentials) = storage.credentials_path() else {
                bail!("The box provider needs 'storage.credentials'");
            };
            Arc::new(BoxStore::from_credentials_file(&credentials).with_context(|| {
                format!("Failed to load Box credentials from {}", credentials.display())
            })?)
        }
        Some(Provider::Local) => Arc::new(LocalStore::new(project.join(&storage.local_root)).await?),
        None => bail!("No storage provider configured"),
    };

    let target = target.unwrap_or_else(|| {
        storage.render_path(GitOracle::head_commit(project).as_deref(), chrono::Utc::now())
    });

    let engine = TransferEngine::new(store)
        .with_chunk_threshold(storage.chunk_threshold)
        .with_progress(Arc::new(LogProgress));
    let folder = engine.resolve_folder(&target).await?;
    let report = engine.upload(paths, &folder, replace || storage.replace).await?;

    println!(
        "Uploaded {} files ({} bytes) and {} folders to {}",
        report.files.len(),
        report.bytes,
        report.folders.len(),
        target
    );
    Ok(())
}
