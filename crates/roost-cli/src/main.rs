use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use roost_adapters::{PageSource, ScriptedPageSource};
use roost_collect::{
    load_job_registry, run_registry, CollectConfig, Collector, JobSpec,
};
use roost_core::{Scope, TaskKind};

#[derive(Debug, Parser)]
#[command(name = "roost-cli")]
#[command(about = "Roost social graph collector")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Work through every enabled job in the registry.
    Run {
        #[arg(long, default_value = "jobs.yaml")]
        registry: PathBuf,
    },
    /// Run one job to its total target.
    Job {
        #[arg(long)]
        task: TaskKind,
        #[arg(long)]
        target: String,
        #[arg(long)]
        total: usize,
        #[arg(long, default_value_t = 200)]
        session_limit: usize,
    },
    /// Run one bounded session against a scope.
    Session {
        #[arg(long)]
        task: TaskKind,
        #[arg(long)]
        target: String,
        #[arg(long)]
        limit: Option<usize>,
    },
}

/// The real browser driver is an external collaborator; until one is wired
/// in, sessions run against a scripted page file.
fn page_source_from_env() -> Result<Box<dyn PageSource>> {
    match std::env::var("ROOST_FIXTURE") {
        Ok(path) => Ok(Box::new(ScriptedPageSource::from_script_file(path)?)),
        Err(_) => bail!("no page driver configured; set ROOST_FIXTURE to a scripted page file"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let collector = Collector::new(CollectConfig::from_env()).await?;
    let mut page = page_source_from_env()?;

    match cli.command {
        Commands::Run { registry } => {
            let registry = load_job_registry(&registry).await?;
            let reports = run_registry(&collector, page.as_mut(), &registry).await?;
            for report in &reports {
                println!(
                    "job {}: committed={} sessions={} completed={}",
                    report.scope.job_name(),
                    report.total_committed,
                    report.sessions_run,
                    report.completed
                );
            }
        }
        Commands::Job {
            task,
            target,
            total,
            session_limit,
        } => {
            let spec = JobSpec {
                task,
                target,
                total_target: total,
                session_limit,
            };
            let report = collector.run_job(page.as_mut(), &spec).await?;
            println!(
                "job {}: committed={} sessions={} completed={}",
                report.scope.job_name(),
                report.total_committed,
                report.sessions_run,
                report.completed
            );
        }
        Commands::Session { task, target, limit } => {
            let scope = Scope::new(task, target);
            let report = collector.run_session(page.as_mut(), &scope, limit).await?;
            println!(
                "session {}: collected={} end={:?}",
                report.scope.job_name(),
                report.new_records.len(),
                report.end
            );
        }
    }

    Ok(())
}
