//! taskbroker - command-line entry point.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use taskbroker::{
    artifacts::{ArtifactProvider, FilesystemProvider},
    broker::{ArtifactBinding, Broker, CommandExecutor, JobPlan},
    config::BrokerConfig,
    error::BrokerError,
    observability::{Observer, create_observer},
    orchestrator::JobContext,
};

#[derive(Parser, Debug)]
#[command(name = "taskbroker")]
#[command(about = "Runs an orchestrated job and reports its status")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Broker a single job
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Job message (JSON) as delivered by the orchestrator
    #[arg(long)]
    job: PathBuf,

    /// Directory whose contents are staged into the workspace
    #[arg(long)]
    inputs: PathBuf,

    /// Working directory for the job command
    #[arg(long)]
    workspace: PathBuf,

    /// Directory the workspace is published to once the command finishes
    #[arg(long)]
    outputs: PathBuf,

    /// Do not send any mutating call to the orchestrator
    #[arg(long, env = "TASKBROKER_DRY_RUN")]
    dry_run: bool,

    /// Command to run, followed by its arguments
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("taskbroker=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<ExitCode> {
    let config = BrokerConfig::from_env()?;
    let observer: Arc<dyn Observer> = Arc::from(create_observer(&config.observability));
    tracing::info!(observer = observer.name(), "Loaded configuration");

    let raw = tokio::fs::read_to_string(&args.job)
        .await
        .with_context(|| format!("Failed to read job message {}", args.job.display()))?;
    let ctx = JobContext::from_json(&raw)?;
    let executor = CommandExecutor::new(args.command)?;

    let provider = |root: &PathBuf| -> Arc<dyn ArtifactProvider> {
        Arc::new(
            FilesystemProvider::new(root.clone())
                .with_directory_cache(config.artifacts.directory_cache),
        )
    };
    let workspace = provider(&args.workspace);
    let plan = JobPlan {
        inputs: vec![ArtifactBinding::new(
            "inputs",
            provider(&args.inputs),
            Arc::clone(&workspace),
        )],
        outputs: vec![ArtifactBinding::new(
            "outputs",
            workspace,
            provider(&args.outputs),
        )],
        workspace: args.workspace.clone(),
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, cancelling job");
            signal_cancel.cancel();
        }
    });

    let broker = Broker::connect(&ctx, &config, Arc::clone(&observer), args.dry_run);
    let outcome = broker.run(&ctx, &plan, &executor, &cancel).await;
    observer.flush();

    match outcome {
        Ok(report) => {
            tracing::info!(
                passed = report.passed,
                inputs = report.inputs.files,
                outputs = report.outputs.files,
                "{}",
                report.message
            );
            Ok(if report.passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Err(BrokerError::Cancelled { job_id }) => {
            tracing::warn!(job_id = %job_id, "Job cancelled");
            Ok(ExitCode::from(130))
        }
        Err(e) => Err(e.into()),
    }
}
