// oisrecon - match officer-involved shooting records between two datasets

mod exit_codes;
mod recon;

use std::process::ExitCode;

use clap::Parser;
use ois_recon::MatchError;
use tracing_subscriber::EnvFilter;

use exit_codes::{recon_exit_code, EXIT_SUCCESS};

#[derive(Parser)]
#[command(name = "oisrecon")]
#[command(about = "Reconcile officer-involved shooting records across a canonical dataset and an agency dataset")]
#[command(long_version = long_version())]
#[command(version)]
struct Cli {
    /// Log every matching decision (debug level). RUST_LOG takes precedence.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: recon::ReconCommands,
}

fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (", env!("OISRECON_COMMIT"), ")",
        "\nengine:  ois-recon ", env!("CARGO_PKG_VERSION"),
        "\nbuild:   ", env!("OISRECON_PROFILE"),
        "\ntarget:  ", env!("OISRECON_TARGET"),
    )
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match recon::cmd_recon(cli.command) {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    /// Engine error with its registry exit code and, where one helps, a hint.
    pub fn recon(err: MatchError) -> Self {
        let hint = match &err {
            MatchError::AmbiguousMatch { .. } | MatchError::UnresolvedMatch { .. } => {
                Some("rerun with --lenient to leave these records unmatched".to_string())
            }
            MatchError::MissingColumn { .. } => {
                Some("check the [canonical.columns] / [candidate.columns] mapping".to_string())
            }
            MatchError::UnknownAgencyType { .. } => {
                Some("set strictness = \"lenient\" to use the whole agency name".to_string())
            }
            _ => None,
        };
        Self {
            code: recon_exit_code(&err),
            message: err.to_string(),
            hint,
        }
    }
}
