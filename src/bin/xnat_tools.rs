use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use xnat_tools::archive::XnatClient;
use xnat_tools::batch::BatchProcessor;
use xnat_tools::config::{ConfigLoader, ResolvedConfig};
use xnat_tools::error::XnatError;
use xnat_tools::metadata::collect_metadata;
use xnat_tools::output::JsonOutput;
use xnat_tools::prompt::resolve_credentials;

const EXIT_SUBJECT_FAILED: u8 = 4;

#[derive(Parser)]
#[command(name = "xnat-tools")]
#[command(about = "Batch-run commands over scans downloaded from an XNAT archive")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download scans per subject and run the configured command on each")]
    Batch(BatchArgs),
    #[command(about = "Collect scan attribute values for a project into a JSON file")]
    Metadata(MetadataArgs),
}

#[derive(Args)]
struct SessionArgs {
    /// Path to the JSON config file
    config: PathBuf,

    /// XNAT user; with XNAT_USER it overrides the config file
    #[arg(long, env = "XNAT_USER")]
    user: Option<String>,

    /// XNAT password; prompted for when a user is set but no password is
    #[arg(long, env = "XNAT_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[derive(Args)]
struct BatchArgs {
    #[command(flatten)]
    session: SessionArgs,
}

#[derive(Args)]
struct MetadataArgs {
    #[command(flatten)]
    session: SessionArgs,

    /// Where to write the collected metadata
    output: PathBuf,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<XnatError>() {
                return ExitCode::from(map_exit_code(err));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &XnatError) -> u8 {
    match error {
        XnatError::UnknownProject(_)
        | XnatError::UnknownSubject { .. }
        | XnatError::ConfigRead(_)
        | XnatError::ConfigParse(_)
        | XnatError::InvalidConfig(_)
        | XnatError::InvalidPattern { .. } => 2,
        XnatError::ArchiveHttp(_)
        | XnatError::ArchiveStatus { .. }
        | XnatError::ArchiveResponse(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<u8> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Batch(args) => run_batch(args),
        Commands::Metadata(args) => run_metadata(args),
    }
}

fn connect(args: &SessionArgs, config: &ResolvedConfig) -> miette::Result<XnatClient> {
    let user = args.user.clone().or_else(|| config.user.clone());
    let credentials = resolve_credentials(user, args.password.clone())?;
    let client = XnatClient::connect(&config.url, credentials.as_ref(), config.request_timeout)?;
    Ok(client)
}

fn run_batch(args: BatchArgs) -> miette::Result<u8> {
    let config = ConfigLoader::resolve(&args.session.config)?;
    let processor = BatchProcessor::new(config.batch_options()?)?;
    let cancel = processor.cancel_token();
    ctrlc::set_handler(move || {
        warn!("interrupted, cancelling remaining work");
        cancel.cancel();
    })
    .into_diagnostic()?;
    let client = connect(&args.session, &config)?;
    let report = processor.run(&client, &config.project)?;
    JsonOutput::print_batch(&report).into_diagnostic()?;

    if report.is_success() {
        return Ok(0);
    }
    for subject in report.failed() {
        warn!(subject = %subject.label, state = ?subject.state, "subject did not complete");
    }
    Ok(EXIT_SUBJECT_FAILED)
}

fn run_metadata(args: MetadataArgs) -> miette::Result<u8> {
    let config = ConfigLoader::resolve(&args.session.config)?;
    let client = connect(&args.session, &config)?;
    let summary = collect_metadata(
        &client,
        &config.project,
        config.subjects.as_deref(),
        config.mapping.as_ref(),
        &config.exclusions,
    )?;
    JsonOutput::write_metadata(&summary, &args.output)?;
    Ok(0)
}
