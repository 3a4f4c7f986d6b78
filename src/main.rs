use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use dubflow::cli::{Cli, Commands, ConfigAction};
use dubflow::config::{CONFIG_TEMPLATE, Config};
use dubflow::job::{FileJobStore, Job, JobId, JobStore, Status};
use dubflow::logging::init_tracing;
use dubflow::orchestrator::{JobRequest, Orchestrator, OrchestratorSettings};
use dubflow::providers::ProviderRegistry;
use dubflow::{FfmpegToolkit, ResourceManager};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Commands that must work without a valid configuration.
    match &cli.command {
        Commands::Completions { shell } => {
            clap_complete::generate(*shell, &mut Cli::command(), "dubflow", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Config { action } => {
            return handle_config_command(action, cli.config.as_deref());
        }
        _ => {}
    }

    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging, cli.log_filter())?;

    match cli.command {
        Commands::Run {
            inputs,
            target,
            deadline,
            output,
        } => {
            let ok = run_jobs(config, inputs, target, deadline, output, cli.quiet).await?;
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::Status { id, json } => {
            let store = read_store(&config).await?;
            let job = store.get(parse_id(&id)?).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&job)?);
            } else {
                print_job(&job);
            }
        }
        Commands::List => {
            let store = read_store(&config).await?;
            let jobs = store.list().await?;
            if jobs.is_empty() {
                println!("No jobs recorded");
            }
            for job in &jobs {
                println!(
                    "{}  {:<10} {:<13} {} -> {}",
                    job.id,
                    status_label(job.status),
                    job.stage.to_string(),
                    job.source.display(),
                    job.target_language
                );
            }
        }
        Commands::Delete { id } => {
            let store = open_store(&config).await?;
            let id = parse_id(&id)?;
            let job = store.get(id).await?;
            if !job.is_terminal() {
                anyhow::bail!("job {} is still {}; wait for it to finish", id, job.status);
            }
            if job.unreleased_resources().next().is_some() {
                eprintln!(
                    "{}",
                    "Warning: job has unreleased objects; run `dubflow sweep` to remove them"
                        .yellow()
                );
            }
            store.delete(id).await?;
            println!("Deleted job {}", id);
        }
        Commands::Sweep { prefix, max_age } => {
            let storage = build_storage(&config)?;
            let prefix = prefix.unwrap_or_else(|| storage.prefix().to_string());
            let report = storage.sweep(&prefix, max_age).await?;
            println!(
                "Swept {}: {} found, {} deleted, {} failed",
                prefix, report.found, report.deleted, report.failed
            );
            if report.failed > 0 {
                std::process::exit(1);
            }
        }
        Commands::Providers => {
            handle_providers(&config);
        }
        Commands::Config { .. } | Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config)
/// 2. Default config path (~/.config/dubflow/config.toml)
/// 3. Built-in defaults with environment variable overrides
fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = match custom_path {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => match Config::default_path() {
            Some(path) => Config::load_or_default(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => Config::default(),
        },
    };
    Ok(config.with_env_overrides())
}

fn config_path(custom_path: Option<&Path>) -> Result<PathBuf> {
    custom_path
        .map(Path::to_path_buf)
        .or_else(Config::default_path)
        .context("no configuration directory on this system; pass --config")
}

fn parse_id(id: &str) -> Result<JobId> {
    Ok(id.parse::<JobId>()?)
}

fn job_store_path(config: &Config) -> Result<PathBuf> {
    config
        .jobs
        .store_path
        .clone()
        .or_else(Config::default_job_store_path)
        .context("no data directory on this system; set jobs.store_path")
}

/// Open the job store for writing. Only one process may hold it.
async fn open_store(config: &Config) -> Result<Arc<dyn JobStore>> {
    let path = job_store_path(config)?;
    let store = FileJobStore::open(&path)
        .await
        .with_context(|| format!("failed to open job store {}", path.display()))?;
    Ok(Arc::new(store))
}

/// Snapshot of the job store that works while a run holds the lock.
async fn read_store(config: &Config) -> Result<Arc<dyn JobStore>> {
    let path = job_store_path(config)?;
    let store = FileJobStore::open_read_only(&path)
        .await
        .with_context(|| format!("failed to read job store {}", path.display()))?;
    Ok(Arc::new(store))
}

fn build_storage(config: &Config) -> Result<Arc<ResourceManager>> {
    let storage = ResourceManager::from_config(&config.storage)?.with_operation_timeout(
        Duration::from_secs(config.orchestrator.operation_timeout_secs),
    );
    Ok(Arc::new(storage))
}

async fn run_jobs(
    config: Config,
    inputs: Vec<PathBuf>,
    target: String,
    deadline: Option<Duration>,
    output: Option<PathBuf>,
    quiet: bool,
) -> Result<bool> {
    let providers = ProviderRegistry::new(&config);
    let issues = providers.validate_configuration();
    if !issues.is_empty() {
        for issue in &issues {
            eprintln!("{} {}", "Config:".red(), issue);
        }
        anyhow::bail!("configuration is incomplete; run `dubflow providers` for details");
    }

    let mut settings = OrchestratorSettings::from(&config.orchestrator);
    if let Some(output) = output {
        settings.output_dir = output;
    }
    let orchestrator = Orchestrator::new(
        open_store(&config).await?,
        build_storage(&config)?,
        Arc::new(providers),
        Arc::new(FfmpegToolkit::default()),
        settings,
    );

    let recovered = orchestrator.recover().await?;
    if recovered.jobs > 0 && !quiet {
        println!(
            "Recovered {} interrupted job(s): {} object(s) deleted, {} failed",
            recovered.jobs, recovered.released, recovered.failed
        );
    }

    let mut ids = Vec::with_capacity(inputs.len());
    for input in inputs {
        let mut request = JobRequest::new(&input, target.clone());
        request.deadline = deadline;
        let id = orchestrator.submit(request).await?;
        if !quiet {
            println!("{} {} ({})", "Queued".dimmed(), input.display(), id);
        }
        ids.push(id);
    }

    let interrupt = orchestrator.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Interrupted, cancelling jobs...".yellow());
            interrupt.cancel_all();
        }
    });

    let mut all_ok = true;
    for id in ids {
        let job = orchestrator.wait(id).await?;
        all_ok &= job.status == Status::Succeeded;
        if !quiet || job.status != Status::Succeeded {
            print_job(&job);
        }
    }
    ctrl_c.abort();
    Ok(all_ok)
}

fn status_label(status: Status) -> String {
    match status {
        Status::Succeeded => status.to_string().green().to_string(),
        Status::Failed => status.to_string().red().to_string(),
        Status::Cancelled => status.to_string().yellow().to_string(),
        _ => status.to_string().dimmed().to_string(),
    }
}

fn print_job(job: &Job) {
    println!("{} {}", "Job".bold(), job.id);
    println!("  {}    {}", "Status:".dimmed(), status_label(job.status));
    println!("  {}    {}", "Source:".dimmed(), job.source.display());
    println!("  {}    {}", "Target:".dimmed(), job.target_language);
    if let Some(duration) = job.source_duration_secs {
        println!("  {}  {:.1}s", "Duration:".dimmed(), duration);
    }
    for record in &job.stages {
        let outcome = record
            .outcome
            .map(|o| format!("{:?}", o).to_lowercase())
            .unwrap_or_else(|| "running".to_string());
        let retries = if record.retries > 0 {
            format!(" ({} retries)", record.retries)
        } else {
            String::new()
        };
        println!("  {} {:<13} {}{}", "-".dimmed(), record.stage.to_string(), outcome, retries);
    }
    if job.degraded {
        println!(
            "  {}",
            "Degraded: transcription used a placeholder".yellow()
        );
    }
    if let Some(output) = &job.output_path {
        println!("  {}    {}", "Output:".dimmed(), output.display());
    }
    if let Some(error) = &job.error {
        println!(
            "  {}     {} at {}: {}",
            "Error:".dimmed(),
            error.kind,
            error.stage,
            error.message.red()
        );
    }
}

fn handle_providers(config: &Config) {
    let registry = ProviderRegistry::new(config);
    let available = ProviderRegistry::available();

    println!("Bindings:");
    for binding in registry.bindings() {
        let options = available
            .get(&binding.capability)
            .map(|names| names.join(", "))
            .unwrap_or_default();
        println!(
            "  {:<10} {} {}",
            binding.capability,
            binding.backend.green(),
            format!("(available: {})", options).dimmed()
        );
    }

    let issues = registry.validate_configuration();
    println!();
    if issues.is_empty() {
        println!("{}", "Configuration OK".green());
        return;
    }
    println!("Issues:");
    for issue in &issues {
        println!("  {} {}", "✗".red(), issue);
    }
}

fn handle_config_command(action: &ConfigAction, custom_path: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(custom_path)?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Path => {
            println!("{}", config_path(custom_path)?.display());
        }
        ConfigAction::Init { force } => {
            let path = config_path(custom_path)?;
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists; pass --force to overwrite",
                    path.display()
                );
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, CONFIG_TEMPLATE)?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}
