//! `oisrecon run` and `oisrecon validate`: config-driven record matching.

use std::path::{Path, PathBuf};

use clap::Subcommand;
use serde::Serialize;

use ois_recon::config::{ReconConfig, SourceConfig, Strictness};
use ois_recon::diagnostics::Tee;
use ois_recon::model::{RecordSet, ReconInput, ReconResult};
use ois_recon::{load_csv_records, CollectingSink, DiagnosticEvent, StreetTagger, TracingSink};

use crate::exit_codes::{EXIT_ERROR, EXIT_RECON_INPUT, EXIT_RECON_INVALID_CONFIG};
use crate::CliError;

#[derive(Subcommand)]
pub enum ReconCommands {
    /// Match the candidate table against the canonical table
    #[command(after_help = "\
Examples:
  oisrecon run phoenix.recon.toml
  oisrecon run phoenix.recon.toml --json
  oisrecon run phoenix.recon.toml --lenient --output result.json")]
    Run {
        /// Path to the .recon.toml config file
        config: PathBuf,

        /// Output JSON to stdout instead of only the human summary
        #[arg(long)]
        json: bool,

        /// Write JSON output to file
        #[arg(long)]
        output: Option<PathBuf>,

        /// Leave ambiguous or unresolved records unmatched instead of failing
        #[arg(long)]
        lenient: bool,
    },

    /// Validate a recon config without running
    #[command(after_help = "\
Examples:
  oisrecon validate phoenix.recon.toml")]
    Validate {
        /// Path to the .recon.toml config file
        config: PathBuf,
    },
}

pub fn cmd_recon(cmd: ReconCommands) -> Result<(), CliError> {
    match cmd {
        ReconCommands::Run {
            config,
            json,
            output,
            lenient,
        } => cmd_recon_run(config, json, output, lenient),
        ReconCommands::Validate { config } => cmd_recon_validate(config),
    }
}

/// JSON report: the engine result plus every diagnostic event, in order.
#[derive(Serialize)]
struct Report<'a> {
    #[serde(flatten)]
    result: &'a ReconResult,
    diagnostics: &'a [DiagnosticEvent],
}

fn recon_err(code: u8, msg: impl Into<String>) -> CliError {
    CliError {
        code,
        message: msg.into(),
        hint: None,
    }
}

fn load_config(path: &Path) -> Result<ReconConfig, CliError> {
    let config_str = std::fs::read_to_string(path)
        .map_err(|e| recon_err(EXIT_RECON_INVALID_CONFIG, format!("cannot read config: {e}")))?;
    ReconConfig::from_toml(&config_str).map_err(CliError::recon)
}

/// Source files resolve relative to the config file's directory.
fn load_source(base_dir: &Path, name: &str, source: &SourceConfig) -> Result<RecordSet, CliError> {
    let csv_path = base_dir.join(&source.file);
    tracing::debug!(source = name, path = %csv_path.display(), "reading source");
    let csv_data = std::fs::read_to_string(&csv_path).map_err(|e| {
        recon_err(EXIT_RECON_INPUT, format!("cannot read {}: {e}", csv_path.display()))
    })?;
    load_csv_records(name, &csv_data, source).map_err(CliError::recon)
}

fn cmd_recon_run(
    config_path: PathBuf,
    json_output: bool,
    output_file: Option<PathBuf>,
    lenient: bool,
) -> Result<(), CliError> {
    let mut config = load_config(&config_path)?;
    if lenient {
        config.matching.strictness = Strictness::Lenient;
    }

    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let input = ReconInput {
        canonical: load_source(base_dir, "canonical", &config.canonical)?,
        candidates: load_source(base_dir, "candidate", &config.candidate)?,
    };

    let mut log = TracingSink;
    let mut collected = CollectingSink::default();
    let result = ois_recon::run(
        &config,
        &input,
        &StreetTagger,
        &mut Tee(&mut log, &mut collected),
    )
    .map_err(CliError::recon)?;

    if json_output || output_file.is_some() {
        let report = Report {
            result: &result,
            diagnostics: &collected.events,
        };
        let json_str = serde_json::to_string_pretty(&report)
            .map_err(|e| recon_err(EXIT_ERROR, format!("JSON serialization error: {e}")))?;

        if let Some(ref path) = output_file {
            std::fs::write(path, &json_str)
                .map_err(|e| recon_err(EXIT_ERROR, format!("cannot write output: {e}")))?;
            eprintln!("wrote {}", path.display());
        }
        if json_output {
            println!("{json_str}");
        }
    }

    print_summary(&result);
    Ok(())
}

/// Human summary to stderr.
fn print_summary(result: &ReconResult) {
    let s = &result.summary;
    eprintln!(
        "recon '{}' ({}): {} canonical, {} candidate rows; {} matched, {} canonical unmatched, {} candidate unmatched",
        result.meta.config_name,
        result.meta.strictness,
        s.canonical_total,
        s.candidate_total,
        s.matched,
        s.canonical_unmatched,
        s.candidate_unmatched,
    );
    if !s.by_pass.is_empty() {
        let passes: Vec<String> = s.by_pass.iter().map(|(pass, n)| format!("{pass}={n}")).collect();
        eprintln!("by pass: {}", passes.join(", "));
    }
    if s.corrections > 0 || s.age_differences > 0 {
        eprintln!(
            "corrections: {} demographic, {} age",
            s.corrections, s.age_differences
        );
    }
    if s.cross_agency > 0 {
        eprintln!("cross-agency: {} candidate row(s) filed under another agency", s.cross_agency);
    }
    if s.ambiguous_skipped > 0 {
        eprintln!("ambiguous: {} record(s) left unmatched", s.ambiguous_skipped);
    }
    if !result.meta.candidate_known_fatal {
        eprintln!("note: candidate source has no fatality column; rows were not filtered on it");
    }
}

fn cmd_recon_validate(config_path: PathBuf) -> Result<(), CliError> {
    let config = load_config(&config_path)?;
    let matching = &config.matching;
    eprintln!(
        "valid: recon '{}' ({}) with {} date-first stage(s), {} exception(s), cross-agency {}",
        config.name,
        matching.strictness,
        matching.date_first.len(),
        matching.exceptions.len(),
        if matching.cross_agency.enabled { "on" } else { "off" },
    );
    if let Some(agency) = &config.agency {
        eprintln!(
            "agency: {} ({})",
            agency.name,
            matching.state.as_deref().unwrap_or("?")
        );
    }
    Ok(())
}
