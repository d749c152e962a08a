use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sdbatch_contracts::catalog::Catalog;
use sdbatch_contracts::config::BatchConfig;
use sdbatch_contracts::errors::find_coded_error;
use sdbatch_contracts::runs::cache::ImageMetaCache;
use sdbatch_engine::{BatchEngine, DryrunDispatcher, HttpDispatcher, LocalFiles, QueryDispatcher};

const EXIT_INVALID_INPUT: i32 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "sdbatch",
    version,
    about = "Batch request generator for AUTOMATIC1111-compatible backends"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Expand the configuration and send every query to the backend.
    Run(RunArgs),
    /// Print the resolved drafts as JSON without building queries.
    Expand(ExpandArgs),
}

#[derive(Debug, Args)]
struct InputArgs {
    #[arg(long)]
    config: PathBuf,
    #[arg(long)]
    catalog: PathBuf,
    /// Pick one random value per field instead of the full cross-product.
    #[arg(long)]
    random: bool,
    #[arg(long)]
    image_cache: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    input: InputArgs,
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    api_base: Option<String>,
}

#[derive(Debug, Args)]
struct ExpandArgs {
    #[command(flatten)]
    input: InputArgs,
    #[arg(long)]
    events: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            if let Some(coded) = find_coded_error(&err) {
                if let Ok(envelope) = serde_json::to_string(&coded.envelope()) {
                    eprintln!("{envelope}");
                }
            }
            eprintln!("sdbatch error: {err:#}");
            std::process::exit(exit_code(&err));
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_batch(args),
        Command::Expand(args) => run_expand(args),
    }
}

fn run_batch(args: RunArgs) -> Result<i32> {
    let Some((config, catalog)) = load_inputs(&args.input) else {
        return Ok(EXIT_INVALID_INPUT);
    };
    let engine = BatchEngine::new(
        catalog,
        Box::new(local_files(args.input.image_cache.as_deref())),
        args.out.clone(),
        args.events.clone(),
    )?;

    let dispatcher: Box<dyn QueryDispatcher> = if args.dry_run {
        Box::new(DryrunDispatcher::new())
    } else {
        Box::new(HttpDispatcher::new(args.api_base.clone()))
    };
    let report = engine.run(&config, dispatcher.as_ref(), args.dry_run)?;
    print_notices(&report.notices);

    let summary = &report.summary;
    println!(
        "{}: {} drafts ({} txt2img, {} img2img), {} dispatched via {}",
        summary.run_id,
        summary.total_drafts,
        summary.txt2img,
        summary.img2img,
        summary.dispatched,
        dispatcher.name()
    );
    if let Some(out) = engine.out_dir() {
        println!("Run output in {}", out.display());
    }
    Ok(0)
}

fn run_expand(args: ExpandArgs) -> Result<i32> {
    let Some((config, catalog)) = load_inputs(&args.input) else {
        return Ok(EXIT_INVALID_INPUT);
    };
    let engine = BatchEngine::new(
        catalog,
        Box::new(local_files(args.input.image_cache.as_deref())),
        None,
        args.events.clone(),
    )?;
    let expansion = engine.expand(&config)?;
    print_notices(&expansion.notices);
    let rendered = serde_json::to_string_pretty(&expansion.drafts)
        .context("failed serializing drafts")?;
    println!("{rendered}");
    Ok(0)
}

/// `None` after reporting a config or catalog that fails to load.
fn load_inputs(input: &InputArgs) -> Option<(BatchConfig, Catalog)> {
    let loaded = BatchConfig::load(&input.config)
        .and_then(|config| Ok((config, Catalog::load(&input.catalog)?)));
    match loaded {
        Ok((mut config, catalog)) => {
            config.random_selection |= input.random;
            Some((config, catalog))
        }
        Err(err) => {
            eprintln!("sdbatch error: {err:#}");
            None
        }
    }
}

fn local_files(image_cache: Option<&Path>) -> LocalFiles {
    match image_cache {
        Some(path) => LocalFiles::new(ImageMetaCache::new(path)),
        None => LocalFiles::uncached(),
    }
}

fn print_notices(notices: &[String]) {
    for notice in notices {
        eprintln!("notice: {notice}");
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    find_coded_error(err)
        .map(|coded| coded.exit_code())
        .unwrap_or(1)
}
