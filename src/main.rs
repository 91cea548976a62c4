use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use pnpjob::cli::{Cli, Command};
use pnpjob::config::ProcessorConfig;
use pnpjob::demo::{self, DemoOptions};
use pnpjob::machine::sim::MachineSpec;
use pnpjob::model::Job;
use pnpjob::processor::{Fanout, JobProcessor, TracingTelemetry, transition_graph};
use pnpjob::ui::JobProgress;
use pnpjob::worker::JobWorker;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ProcessorConfig::load_from(path)?,
        None => ProcessorConfig::load()?,
    };
    if let Some(retries) = cli.feed_retries {
        config.feed_retry_count = retries;
    }
    init_tracing(&config, cli.verbose);

    match cli.command {
        Command::Run { job, machine } => run_job(config, &job, &machine).await,
        Command::Graph => {
            print!("{}", transition_graph());
            Ok(())
        }
        Command::Demo { feed_failures } => run_demo(&config, feed_failures),
    }
}

fn init_tracing(config: &ProcessorConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run_job(config: ProcessorConfig, job_path: &Path, machine_path: &Path) -> Result<()> {
    let job = Job::load(job_path)
        .with_context(|| format!("failed to load job from {}", job_path.display()))?;
    let (machine, _log) = MachineSpec::load(machine_path)
        .with_context(|| format!("failed to load machine from {}", machine_path.display()))?
        .build(config.feed_retry_count)?;

    let progress = Arc::new(JobProgress::start(&job.name));
    let telemetry = Fanout::new()
        .with(progress.clone())
        .with(Arc::new(TracingTelemetry));
    let processor = JobProcessor::new(machine, config, Arc::new(telemetry));

    let handle = JobWorker::spawn(processor, job);
    let controller = handle.controller();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting job");
            controller.abort();
        }
    });

    let run = handle.join().await?;
    progress.complete(run.report.as_ref().map(|r| &r.outcome), &run.result);
    if let Some(report) = &run.report {
        progress.print_report(report);
    }
    Ok(run.result?)
}

fn run_demo(config: &ProcessorConfig, feed_failures: u32) -> Result<()> {
    let run = demo::run(DemoOptions {
        feed_failures,
        feed_retries: config.feed_retry_count,
        align_retries: config.align_retry_count,
    });
    for step in &run.transcript {
        println!("{step}");
    }
    let calls = run.result?;
    println!("done after {calls} calls");
    Ok(())
}
