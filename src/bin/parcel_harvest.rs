use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use parcel_harvest::config::{ConfigLoader, ResolvedConfig};
use parcel_harvest::domain::{OutputFormat, Source};
use parcel_harvest::error::HarvestError;
use parcel_harvest::fetch::{BatchFetcher, FetchOptions, LogProgress, RetryPolicy};
use parcel_harvest::output::{JsonOutput, output_path};
use parcel_harvest::pipeline::{
    AdapterFactory, HttpAdapterFactory, Pipeline, RunAction, RunOptions, RunReport, StatusEntry,
    list_sources,
};
use parcel_harvest::store::CacheStore;

#[derive(Parser)]
#[command(name = "parcel-harvest")]
#[command(about = "Fetch paginated GIS feature layers into a local cache and write GeoJSON")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true, help = "Print machine-readable JSON to stdout")]
    json: bool,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Fetch sources, serving fresh ones from cache")]
    Fetch(FetchArgs),
    #[command(about = "Show cache state per source")]
    Status,
    #[command(about = "List configured sources")]
    Sources,
    #[command(about = "Remove a source from the cache")]
    Clear(ClearArgs),
}

#[derive(Args)]
struct FetchArgs {
    sources: Vec<String>,

    #[arg(long, conflicts_with = "sources")]
    all: bool,

    #[arg(long, help = "Refetch even when the cache is fresh")]
    force: bool,

    #[arg(long, value_enum)]
    format: Option<OutputFormat>,

    #[arg(long)]
    output_dir: Option<Utf8PathBuf>,

    #[arg(long)]
    max_age_hours: Option<u64>,

    #[arg(long)]
    concurrency: Option<usize>,

    #[arg(long)]
    batch_size: Option<u64>,

    #[arg(long)]
    max_batches: Option<usize>,
}

#[derive(Args)]
struct ClearArgs {
    source: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<HarvestError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &HarvestError) -> u8 {
    match error {
        HarvestError::UnknownSource(_) | HarvestError::MissingConfig => 2,
        HarvestError::FetchFailed { .. }
        | HarvestError::MalformedResponse { .. }
        | HarvestError::ArcgisHttp(_) => 3,
        HarvestError::CacheCorruption { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Command::Fetch(args) => run_fetch(args, &config, cli.json),
        Command::Status => run_status(&config, cli.json),
        Command::Sources => {
            let sources = list_sources(&config.registry);
            if cli.json {
                JsonOutput::print_sources(&sources).map_err(into_output)?;
            } else {
                for source in &sources {
                    println!("{:<24} {:<8} {}", source.id, source.api, source.name);
                }
            }
            Ok(())
        }
        Command::Clear(args) => {
            config.registry.get(&args.source)?;
            let store = CacheStore::open(config.settings.cache_dir.clone())?;
            let pipeline = Pipeline::new(&config.registry, &store, NopAdapters);
            let result = pipeline.clear(&args.source)?;
            if cli.json {
                JsonOutput::print_clear(&result).map_err(into_output)?;
            } else if result.cleared {
                println!("cleared {}", result.source_id);
            } else {
                println!("{} was not cached", result.source_id);
            }
            Ok(())
        }
    }
}

fn run_fetch(args: FetchArgs, config: &ResolvedConfig, json: bool) -> miette::Result<()> {
    let settings = &config.settings;
    let source_ids: Vec<String> = if args.all {
        config.registry.ids().map(str::to_string).collect()
    } else {
        args.sources
    };
    if source_ids.is_empty() {
        return Err(miette::Report::msg(
            "no sources given (pass source ids or --all)",
        ));
    }
    for source_id in &source_ids {
        config.registry.get(source_id)?;
    }

    let format = args.format.unwrap_or_default();
    let output_dir = args.output_dir.unwrap_or_else(|| settings.output_dir.clone());
    let options = RunOptions {
        max_age_hours: args.max_age_hours.unwrap_or(settings.max_age_hours),
        force: args.force,
        format,
        fetch: FetchOptions {
            concurrency: args.concurrency.unwrap_or(settings.concurrency),
            batch_size: args.batch_size.unwrap_or(settings.batch_size),
            max_batches: args.max_batches.unwrap_or(settings.max_batches),
            retry: RetryPolicy {
                max_retries: settings.max_retries,
                base_delay: settings.retry_delay,
            },
        },
    };

    let store = CacheStore::open(settings.cache_dir.clone())?;
    let pipeline = Pipeline::new(&config.registry, &store, HttpAdapterFactory::new()?);

    let mut reports = Vec::new();
    for source_id in &source_ids {
        let path = output_path(&output_dir, source_id, format);
        let sink = LogProgress {
            source_id: source_id.as_str(),
        };
        reports.push(pipeline.run(source_id, &path, &options, &sink)?);
    }
    store.flush()?;

    if json {
        JsonOutput::print_runs(&reports).map_err(into_output)?;
    } else {
        print_run_summary(&reports);
    }
    Ok(())
}

fn run_status(config: &ResolvedConfig, json: bool) -> miette::Result<()> {
    let store = CacheStore::open(config.settings.cache_dir.clone())?;
    let pipeline = Pipeline::new(&config.registry, &store, NopAdapters);
    let entries = pipeline.status(config.settings.max_age_hours);
    if json {
        JsonOutput::print_status(&entries).map_err(into_output)?;
    } else {
        print_status(&entries);
    }
    Ok(())
}

fn print_run_summary(reports: &[RunReport]) {
    for report in reports {
        let action = match report.action {
            RunAction::Cache => "cache",
            RunAction::Fetched => "fetched",
        };
        println!(
            "{} ({action}): {} features -> {}",
            report.source_id, report.record_count, report.output_path
        );
        if report.truncated {
            println!("   truncated at the batch ceiling; the next run will refetch");
        }
    }
}

fn print_status(entries: &[StatusEntry]) {
    for entry in entries {
        let fetched = entry
            .last_fetched
            .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "never".to_string());
        let state = if entry.needs_refresh { "stale" } else { "fresh" };
        println!(
            "{:<24} {:>8} features  {state:<5}  last fetched {fetched}{}",
            entry.source_id,
            entry.cached_features,
            if entry.truncated { "  (truncated)" } else { "" }
        );
    }
}

fn into_output(err: std::io::Error) -> HarvestError {
    HarvestError::Output(err.to_string())
}

/// Used by commands that never touch the network.
struct NopAdapters;

impl AdapterFactory for NopAdapters {
    fn adapter(&self, source: &Source) -> Result<Box<dyn BatchFetcher>, HarvestError> {
        Err(HarvestError::ArcgisHttp(format!(
            "no HTTP client configured for {}",
            source.id
        )))
    }
}
