use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_dataset_store::app::App;
use kira_dataset_store::config::{ConfigLoader, Settings};
use kira_dataset_store::error::KiraError;
use kira_dataset_store::output::JsonOutput;

#[derive(Parser)]
#[command(name = "kira-ds")]
#[command(about = "Hierarchical research datasets: row discovery, column matching and cached remote access")]
#[command(version, author)]
struct Cli {
    /// Dataset configuration (defaults to ./kira-ds.json)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "List the rows of the dataset")]
    Rows(RowsArgs),
    #[command(about = "Match a column in every row of its frequency")]
    Match(MatchArgs),
    #[command(about = "Fetch a column's item for one row")]
    Get(GetArgs),
    #[command(about = "Compare two provenance records")]
    ProvDiff(ProvDiffArgs),
    #[command(about = "Remove every cached remote item")]
    CacheClear,
}

#[derive(Args)]
struct RowsArgs {
    #[arg(long)]
    frequency: Option<String>,
}

#[derive(Args)]
struct MatchArgs {
    column: String,
}

#[derive(Args)]
struct GetArgs {
    column: String,

    /// Row ID; omit for dataset-level columns
    #[arg(long)]
    id: Option<String>,
}

#[derive(Args)]
struct ProvDiffArgs {
    recorded: Utf8PathBuf,
    expected: Utf8PathBuf,

    #[arg(long)]
    include: Vec<String>,

    #[arg(long)]
    exclude: Vec<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(kira) = report.downcast_ref::<KiraError>() {
            return ExitCode::from(map_exit_code(kira));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::DatasetNotFound(_)
        | KiraError::MissingConfig
        | KiraError::RowNotFound { .. }
        | KiraError::UnknownColumn(_) => 2,
        KiraError::Remote(_) | KiraError::CacheTimeout { .. } | KiraError::ChecksumMismatch { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Rows(args) => {
            let mut app = dataset_app(cli.config.as_deref())?;
            let result = app.rows(args.frequency.as_deref())?;
            JsonOutput::print_rows(&result).into_diagnostic()
        }
        Command::Match(args) => {
            let mut app = dataset_app(cli.config.as_deref())?;
            let result = app.match_column(&args.column)?;
            JsonOutput::print_match(&result).into_diagnostic()
        }
        Command::Get(args) => {
            let mut app = dataset_app(cli.config.as_deref())?;
            let result = app.get(&args.column, args.id.as_deref())?;
            JsonOutput::print_get(&result).into_diagnostic()
        }
        Command::ProvDiff(args) => {
            let app = settings_app(cli.config.as_deref())?;
            let include = args.include.iter().map(String::as_str).collect::<Vec<_>>();
            let exclude = args.exclude.iter().map(String::as_str).collect::<Vec<_>>();
            let result = app.prov_diff(&args.recorded, &args.expected, &include, &exclude)?;
            JsonOutput::print_prov_diff(&result).into_diagnostic()
        }
        Command::CacheClear => {
            let app = settings_app(cli.config.as_deref())?;
            let result = app.clear_cache()?;
            JsonOutput::print_clear(&result).into_diagnostic()
        }
    }
}

fn dataset_app(config: Option<&str>) -> Result<App, KiraError> {
    let resolved = ConfigLoader::resolve(config)?;
    App::from_config(&resolved)
}

/// Commands that only need settings run without a config file too.
fn settings_app(config: Option<&str>) -> Result<App, KiraError> {
    match ConfigLoader::resolve(config) {
        Ok(resolved) => Ok(App::new(resolved.settings)),
        Err(KiraError::MissingConfig) => Ok(App::new(Settings::new()?)),
        Err(err) => Err(err),
    }
}
