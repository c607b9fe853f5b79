use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use env_logger::Builder;
use futures::future::join_all;
use log::{LevelFilter, debug, error, info, warn};

use phylo_pipelines::cli::{self, Arguments};
use phylo_pipelines::config::defs::{PipelineError, SequenceType, Tool};
use phylo_pipelines::config::settings::Settings;
use phylo_pipelines::pipelines::ingest::{accept_fasta_file, accept_hmm_file};
use phylo_pipelines::pipelines::orchestrator::{Orchestrator, TreeFormat};
use phylo_pipelines::pipelines::queue::JobQueue;
use phylo_pipelines::utils::command::check_version;
use phylo_pipelines::utils::paths::init_data_dir;


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = cli::parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    let settings = match load_settings(&args) {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            error!("Bad settings: {}", e);
            std::process::exit(1);
        }
    };
    debug!("Data directory is {}", settings.data_path.display());

    let module = args.module.clone();
    if let Err(e) = match module.as_str() {
        "ingest" => ingest_run(&args, &settings),
        "hmm" => hmm_run(&args, &settings).await,
        "calculate" => calculate_run(&args, Arc::clone(&settings)).await,
        "status" => status_run(&args, settings),
        "log" => log_run(&args, settings),
        "alignment" => alignment_run(&args, settings),
        "tree" => tree_run(&args, settings),
        "families" => families_run(settings),
        "delete" => delete_run(&args, settings),
        "check_tools" => check_tools_run(&settings).await,
        "config" => config_run(&settings),
        _ => Err(PipelineError::InvalidConfig(format!("Invalid module: {}", module))),
    } {
        error!("{} failed ({}): {} at {} milliseconds.", module, e.http_status(), e, run_start.elapsed().as_millis());
        std::process::exit(1);
    }

    debug!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}


/// Settings from file and environment, then command-line overrides.
fn load_settings(args: &Arguments) -> Result<Settings, PipelineError> {
    let mut settings = Settings::load(args.config.as_deref().map(Path::new))?;
    if let Some(data) = &args.data_path {
        settings.data_path = PathBuf::from(data);
    }
    if let Some(threads) = args.threads {
        settings.threads = threads;
    }
    settings.validate()?;
    init_data_dir(&settings.data_path, settings.dir_mode)?;
    Ok(settings)
}

fn required<'a>(value: &'a Option<String>, flag: &str) -> Result<&'a str, PipelineError> {
    value
        .as_deref()
        .ok_or_else(|| PipelineError::InvalidConfig(format!("--{} is required for this module", flag)))
}

fn required_tool(args: &Arguments) -> Result<Tool, PipelineError> {
    Tool::from_tag(required(&args.tool, "tool")?)
}

fn orchestrator(settings: Arc<Settings>) -> Orchestrator {
    Orchestrator::new(settings, Arc::new(JobQueue::new()))
}

fn ingest_run(args: &Arguments, settings: &Settings) -> Result<(), PipelineError> {
    let input = PathBuf::from(required(&args.input, "input")?);
    let summary = accept_fasta_file(
        settings,
        required(&args.collection, "collection")?,
        args.subcollection.as_deref(),
        SequenceType::from(&args.seq_type),
        &args.data_name,
        &input,
    )?;
    let json = serde_json::to_string_pretty(&summary).map_err(|e| PipelineError::IOError(e.to_string()))?;
    println!("{}", json);
    Ok(())
}

async fn hmm_run(args: &Arguments, settings: &Settings) -> Result<(), PipelineError> {
    let input = PathBuf::from(required(&args.input, "input")?);
    let stats = accept_hmm_file(settings, required(&args.collection, "collection")?, &input).await?;
    let json = serde_json::to_string(&stats).map_err(|e| PipelineError::IOError(e.to_string()))?;
    println!("{}", json);
    Ok(())
}

/// Queues the calculation and serves the queues until every job is done.
async fn calculate_run(args: &Arguments, settings: Arc<Settings>) -> Result<(), PipelineError> {
    let queue = Arc::new(JobQueue::new());
    queue
        .start(&[settings.alignment_queue.as_str(), settings.tree_queue.as_str()], settings.workers_per_queue)
        .await;
    let orchestrator = Orchestrator::new(Arc::clone(&settings), Arc::clone(&queue));

    let submitted = orchestrator
        .submit(
            required(&args.collection, "collection")?,
            args.subcollection.as_deref(),
            required(&args.calculation, "calculation")?,
        )
        .await?;
    println!("{}", submitted.to_json()?);

    queue.join_idle().await?;
    let mut failed = 0;
    for job in queue.jobs().await {
        match &job.error {
            Some(e) => {
                failed += 1;
                error!("{}: {}", job.description, e);
            }
            None => info!("{}: {}", job.description, job.status),
        }
    }
    queue.shutdown().await;
    if failed > 0 {
        return Err(PipelineError::ToolExecution {
            tool: required(&args.calculation, "calculation")?.to_string(),
            error: format!("{} job(s) failed", failed),
        });
    }
    Ok(())
}

fn status_run(args: &Arguments, settings: Arc<Settings>) -> Result<(), PipelineError> {
    let status = orchestrator(settings).stage_status(
        required(&args.collection, "collection")?,
        args.subcollection.as_deref(),
        required_tool(args)?,
    )?;
    match status {
        Some(code) => println!("{}", code),
        None => println!("not run"),
    }
    Ok(())
}

fn log_run(args: &Arguments, settings: Arc<Settings>) -> Result<(), PipelineError> {
    let text = orchestrator(settings).run_log(
        required(&args.collection, "collection")?,
        args.subcollection.as_deref(),
        required_tool(args)?,
    )?;
    print!("{}", text);
    Ok(())
}

fn alignment_run(args: &Arguments, settings: Arc<Settings>) -> Result<(), PipelineError> {
    let (seq_type, text) = orchestrator(settings).alignment(
        required(&args.collection, "collection")?,
        args.subcollection.as_deref(),
    )?;
    debug!("Alignment is {}", seq_type);
    print!("{}", text);
    Ok(())
}

fn tree_run(args: &Arguments, settings: Arc<Settings>) -> Result<(), PipelineError> {
    let text = orchestrator(settings).tree(
        required(&args.collection, "collection")?,
        args.subcollection.as_deref(),
        required_tool(args)?,
        TreeFormat::from(&args.format),
    )?;
    print!("{}", text);
    Ok(())
}

fn families_run(settings: Arc<Settings>) -> Result<(), PipelineError> {
    let names = orchestrator(settings).list_collections()?;
    let json = serde_json::to_string(&names).map_err(|e| PipelineError::IOError(e.to_string()))?;
    println!("{}", json);
    Ok(())
}

fn delete_run(args: &Arguments, settings: Arc<Settings>) -> Result<(), PipelineError> {
    orchestrator(settings).delete_subcollection(
        required(&args.collection, "collection")?,
        required(&args.subcollection, "subcollection")?,
    )
}

async fn check_tools_run(settings: &Settings) -> Result<(), PipelineError> {
    let results = join_all(Tool::ALL.iter().map(|&tool| check_version(tool, settings))).await;
    let mut missing = Vec::new();
    for (tool, result) in Tool::ALL.into_iter().zip(results) {
        match result {
            Ok(version) => info!("{} version {}", tool, version),
            Err(e @ PipelineError::UnrecognizedToolOutput { .. }) => warn!("{}", e),
            Err(e) => {
                error!("{}", e);
                missing.push(tool.to_string());
            }
        }
    }
    if !missing.is_empty() {
        return Err(PipelineError::ToolExecution {
            tool: missing.join(", "),
            error: "not runnable".to_string(),
        });
    }
    Ok(())
}

fn config_run(settings: &Settings) -> Result<(), PipelineError> {
    print!("{}", settings.to_yaml()?);
    Ok(())
}
