use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use snapflow::metrics::save_to_file;
use snapflow::{
    AppConfig, ConfigError, ErrorPolicy, FieldIdConverter, HttpBulkClient, InterruptHandle, LogFormat, LogLevel,
    PassthroughTransform, SyncEngine, init_logging, run_etl,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};

/// Exit code for invalid configuration or input layout.
const EXIT_CONFIG: i32 = 2;
/// Exit code after a Ctrl-C.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "snapflow", version, about = "Snapshot ETL and bulk index sync")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "SNAPFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Disable progress bars
    #[arg(long, global = true)]
    no_progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract, transform and clean up a snapshot directory
    Transform(TransformArgs),
    /// Bulk-upsert Parquet tables into an index
    Sync(SyncArgs),
}

#[derive(Args)]
struct TransformArgs {
    /// Snapshot directory
    #[arg(long)]
    in_dir: Option<PathBuf>,

    /// Output directory (extracted files and parquets/)
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Name of the output table
    #[arg(long, default_value = "records")]
    table: String,

    /// Files per batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Stop after this many batches
    #[arg(long)]
    max_batches: Option<usize>,

    #[arg(long)]
    extract_workers: Option<usize>,

    #[arg(long)]
    transform_workers: Option<usize>,

    /// Read JSON in small batches
    #[arg(long)]
    low_memory: bool,

    /// Stop the whole run at the first failed batch
    #[arg(long)]
    abort_on_error: bool,

    /// Write per-stage counters to this JSON file
    #[arg(long)]
    metrics_out: Option<PathBuf>,
}

#[derive(Args)]
struct SyncArgs {
    /// Target index
    index: String,

    /// Directory searched recursively for *.parquet
    in_dir: PathBuf,

    /// Column holding the document id
    #[arg(long, default_value = "id")]
    id_field: String,

    /// Read only these columns (comma separated)
    #[arg(long, value_delimiter = ',')]
    columns: Vec<String>,

    /// Index service URL
    #[arg(long, env = "SNAPFLOW_URL")]
    url: Option<String>,

    #[arg(long, env = "SNAPFLOW_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "SNAPFLOW_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[arg(long)]
    workers: Option<usize>,

    /// Actions per bulk request
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Delay worker N's start by N times the stagger delay
    #[arg(long)]
    staggered_start: bool,

    /// Convert and chunk, but send nothing
    #[arg(long, conflicts_with = "measure_chunk_size")]
    dry_run: bool,

    /// Report serialized chunk sizes instead of sending
    #[arg(long)]
    measure_chunk_size: bool,
}

fn main() {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match AppConfig::from_toml_file(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Error: {e}");
                process::exit(EXIT_CONFIG);
            }
        },
        None => AppConfig::default(),
    };
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    if cli.json_logs {
        config.log.format = LogFormat::Json;
    }
    if cli.no_progress {
        config.etl.progress = false;
        config.sync.progress = false;
    }

    if let Err(e) = init_logging(&config.log) {
        eprintln!("Failed to initialize logging: {e}");
        process::exit(1);
    }

    let interrupt = InterruptHandle::new();
    if let Err(e) = install_ctrl_c(interrupt.clone()) {
        warn!(error = %e, "Ctrl-C handler not installed");
    }

    let result = match cli.command {
        Commands::Transform(args) => transform(config, args, &interrupt),
        Commands::Sync(args) => sync(config, args, &interrupt),
    };

    match result {
        Ok(true) => {}
        Ok(false) if interrupt.is_triggered() => process::exit(EXIT_INTERRUPTED),
        Ok(false) => process::exit(1),
        Err(e) => {
            error!(error = %format!("{e:#}"), "Command failed");
            eprintln!("Error: {e:#}");
            let code = if e.downcast_ref::<ConfigError>().is_some() { EXIT_CONFIG } else { 1 };
            process::exit(code);
        }
    }
}

/// The first Ctrl-C asks every worker to stop; a second one exits immediately.
fn install_ctrl_c(interrupt: InterruptHandle) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    thread::Builder::new()
        .name("signal".into())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                warn!("interrupt received, finishing in-flight work (Ctrl-C again to exit now)");
                interrupt.trigger();
                if tokio::signal::ctrl_c().await.is_ok() {
                    process::exit(EXIT_INTERRUPTED);
                }
            });
        })
        .context("spawn signal thread")?;
    Ok(())
}

fn transform(mut config: AppConfig, args: TransformArgs, interrupt: &InterruptHandle) -> Result<bool> {
    let etl = &mut config.etl;
    if let Some(dir) = args.in_dir {
        etl.in_dir = dir;
    }
    if let Some(dir) = args.out_dir {
        etl.out_dir = dir;
    }
    if let Some(n) = args.batch_size {
        etl.batch_size = n;
    }
    if args.max_batches.is_some() {
        etl.max_batches = args.max_batches;
    }
    if let Some(n) = args.extract_workers {
        etl.extract.workers = n;
    }
    if let Some(n) = args.transform_workers {
        etl.transform.workers = n;
    }
    etl.low_memory |= args.low_memory;
    if args.abort_on_error {
        etl.error_policy = ErrorPolicy::Abort;
    }

    let schema = config.schema.to_arrow()?;
    if schema.fields().is_empty() {
        return Err(ConfigError::OutOfRange {
            field: "schema.fields",
            reason: "declare at least one field".into(),
        }
        .into());
    }
    let transform = Arc::new(PassthroughTransform::new(args.table, schema));
    let summary = run_etl(&config.etl, transform, interrupt.clone())?;

    info!(
        total = summary.total,
        completed = summary.completed.len(),
        failed = summary.failures.len(),
        dropped = summary.dropped,
        elapsed_secs = summary.elapsed.as_secs_f64(),
        "transform finished"
    );
    for f in &summary.failures {
        warn!(stage = %f.stage, batch = f.batch_index, error = %f.error, "failed batch");
    }
    if let Some(path) = args.metrics_out {
        save_to_file(&summary.stages, summary.elapsed, &path)?;
        info!(path = %path.display(), "wrote stage metrics");
    }
    Ok(summary.is_success())
}

fn sync(mut config: AppConfig, args: SyncArgs, interrupt: &InterruptHandle) -> Result<bool> {
    if let Some(url) = args.url {
        config.client.url = url;
    }
    if args.username.is_some() {
        config.client.username = args.username;
    }
    if args.password.is_some() {
        config.client.password = args.password;
    }
    let sync = &mut config.sync;
    if let Some(n) = args.workers {
        sync.workers = n;
    }
    if let Some(n) = args.chunk_size {
        sync.chunk_size = n;
    }
    sync.staggered_start |= args.staggered_start;
    sync.dry_run |= args.dry_run;
    sync.measure_chunk_size |= args.measure_chunk_size;

    config.client.validate()?;
    let client = Arc::new(HttpBulkClient::new(&config.client)?);
    let mut converter = FieldIdConverter::new(args.id_field);
    if !args.columns.is_empty() {
        converter = converter.with_columns(args.columns);
    }
    let engine = SyncEngine::new(config.sync, client, Arc::new(converter)).interrupt(interrupt.clone());
    let summary = engine.sync_dir(&args.index, &args.in_dir)?;
    println!("{summary}");
    Ok(summary.is_success())
}
