use anyhow::Result;
use clap::Parser;
use pacs_relay::audit::SqliteAuditStore;
use pacs_relay::config::RelayConfig;
use pacs_relay::engine::CommandAnonymizer;
use pacs_relay::hooks::{HookRegistry, NoOpHook};
use pacs_relay::pipeline::{Pipeline, RunOptions};
use pacs_relay::repo::SqliteReviewRepository;
use pacs_relay::runner::ShellRunner;
use pacs_relay::scanner::DumpScanner;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pacs-relay")]
#[command(version, about = "Publish de-identified imaging studies from staging to production")]
struct Cli {
    /// Re-run the last pipeline instead of starting a fresh run
    #[arg(short, long)]
    runlast: bool,

    /// Maximum number of studies to run through the pipeline
    #[arg(short = 'm', long, default_value = "10")]
    max: usize,

    /// Don't modify the database or push to production
    #[arg(short, long)]
    practice: bool,

    /// Verbosity, 1-10
    #[arg(short, long, default_value = "5")]
    verbosity: u8,

    /// Comma separated list of allowed modality types
    #[arg(short, long, default_value = "mr,ct")]
    allowed_modalities: String,

    /// Do not push studies to production (stop after the post-processing hook)
    #[arg(short, long)]
    no_push: bool,

    /// Override the data directory from the config file
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Path to the config file (defaults to ./relay.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0..=2 => "error",
        3..=4 => "warn",
        5..=6 => "info",
        7..=8 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pacs_relay={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbosity);

    let mut config = match &cli.config {
        Some(path) => RelayConfig::load_from(path)?,
        None => RelayConfig::load_or_default(&std::env::current_dir()?)?,
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    let modalities: Vec<String> = cli
        .allowed_modalities
        .to_lowercase()
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect();

    let opts = RunOptions {
        limit: cli.max,
        practice: cli.practice,
        no_push: cli.no_push,
        resume: cli.runlast,
        modalities,
    };

    let runner = Arc::new(ShellRunner);
    let repo = Arc::new(SqliteReviewRepository::open(&config.registry_db)?);
    let audit = Arc::new(SqliteAuditStore::open(&config.audit_db)?);
    let engine = Arc::new(CommandAnonymizer::new(
        runner.clone(),
        config.engine_cmd.clone(),
    ));
    let scanner = Arc::new(DumpScanner::new(runner.clone(), config.dump_cmd.clone()));

    // Deployment-specific hooks register here; the built-in no-op hook is the
    // registry default, so an unconfigured deployment still completes.
    let mut hooks = HookRegistry::new();
    hooks.register(Arc::new(NoOpHook), None)?;

    let mut pipeline = Pipeline::new(config, opts, repo, audit, engine, scanner, runner, hooks);

    match pipeline.run().await {
        Ok(ctx) => {
            tracing::info!(run_dir = %ctx.dir().display(), "pipeline finished");
            Ok(())
        }
        Err(e) => {
            tracing::error!("pipeline halted: {e}");
            std::process::exit(1);
        }
    }
}
