//! Command-line front end for the embedded engine.
//!
//! `prepare` unpacks the engine binaries into the shared cache and prints
//! the extraction directory. `run` starts an engine, prints its connection
//! URL, and stops it when a line (or end of input) arrives on stdin.
//! Settings come from `EPG_*` environment variables, overridden by flags.
//! The binary exits with status code `0` on success and `1` on error.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Context, Result, eyre};
use pg_embed_local::{
    ArchiveFileResolver, BinaryPreparer, BinaryResolver, EmbeddedPgCfg, EmbeddedServer,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pg-embed-local", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Unpack the engine binaries and print the extraction directory.
    Prepare(PrepareArgs),
    /// Start an engine and stop it when stdin yields a line.
    Run(RunArgs),
}

#[derive(Debug, Args)]
struct SourceArgs {
    /// Engine archive to use instead of the bundled resources.
    #[arg(long)]
    archive: Option<PathBuf>,
    /// Root of the shared binary cache.
    #[arg(long)]
    working_dir: Option<Utf8PathBuf>,
}

#[derive(Debug, Args)]
struct PrepareArgs {
    #[command(flatten)]
    source: SourceArgs,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    source: SourceArgs,
    /// Engine port; `0` selects a free port.
    #[arg(long)]
    port: Option<u16>,
    /// Storage directory for the engine's data files.
    #[arg(long)]
    data_dir: Option<Utf8PathBuf>,
    /// Engine parameter as `key=value`; may be repeated.
    #[arg(short = 'c', long = "parameter", value_name = "KEY=VALUE")]
    parameters: Vec<String>,
    /// Remove the data directory after stopping.
    #[arg(long)]
    clean_after_stop: bool,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
    if let Err(err) = color_eyre::install() {
        tracing::debug!("color_eyre already installed: {err}");
    }

    let cli = Cli::parse();
    let cfg = EmbeddedPgCfg::load().context("failed to load configuration via OrthoConfig")?;
    match cli.command {
        Command::Prepare(args) => prepare(&cfg, &args),
        Command::Run(args) => run(&cfg, &args),
    }
}

fn resolver(cfg: &EmbeddedPgCfg, source: &SourceArgs) -> Box<dyn BinaryResolver> {
    source.archive.as_ref().map_or_else(
        || Box::new(cfg.resolver()) as Box<dyn BinaryResolver>,
        |path| Box::new(ArchiveFileResolver::new(path.clone())),
    )
}

fn prepare(cfg: &EmbeddedPgCfg, args: &PrepareArgs) -> Result<()> {
    let working_dir = args
        .source
        .working_dir
        .as_deref()
        .or(cfg.working_dir.as_deref());
    let dir = BinaryPreparer::process_shared()
        .prepare(&resolver(cfg, &args.source), working_dir)?;
    writeln!(io::stdout().lock(), "{dir}").context("failed to write extraction directory")?;
    Ok(())
}

fn run(cfg: &EmbeddedPgCfg, args: &RunArgs) -> Result<()> {
    if cfg.skip_requested() {
        tracing::info!("skipping embedded PostgreSQL provisioning");
        return Ok(());
    }

    let mut builder = cfg.to_builder();
    if let Some(port) = args.port {
        builder = builder.port(port);
    }
    if let Some(ref dir) = args.data_dir {
        builder = builder.data_dir(dir.clone());
    }
    if let Some(ref dir) = args.source.working_dir {
        builder = builder.working_dir(dir.clone());
    }
    if args.clean_after_stop {
        builder = builder.clean_after_stop(true);
    }
    for parameter in &args.parameters {
        let (key, value) = parameter
            .split_once('=')
            .ok_or_else(|| eyre!("engine parameter {parameter:?} is not key=value"))?;
        builder = builder.parameter(key, value);
    }
    let server = EmbeddedServer::builder(builder.build()?)
        .resolver(resolver(cfg, &args.source))
        .build()?;
    let handle = server.start()?;
    writeln!(io::stdout().lock(), "{}", handle.database_url())
        .context("failed to write connection URL")?;

    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read from stdin")?;
    server.close();
    Ok(())
}
