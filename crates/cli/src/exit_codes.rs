//! CLI Exit Code Registry
//!
//! This is the single source of truth for all `oisrecon` exit codes.
//! Scripts rely on them; unmatched rows are a normal result, not a failure.
//!
//! | Code | Meaning                                                   |
//! |------|-----------------------------------------------------------|
//! | 0    | Success (matched or not)                                  |
//! | 1    | General error (unspecified)                               |
//! | 2    | CLI usage error (bad args)                                |
//! | 3    | Config could not be read, parsed, or validated            |
//! | 4    | Input file unreadable, missing column, or bad date        |
//! | 5    | Strict run stopped on an ambiguous match                  |
//! | 6    | Strict run stopped on evidence no rule resolves           |
//! | 7    | Data outside the comparison model (never downgraded)      |

use ois_recon::MatchError;

/// Success - command completed without errors.
pub const EXIT_SUCCESS: u8 = 0;

/// General error - unspecified failure.
pub const EXIT_ERROR: u8 = 1;

/// Config file unreadable, malformed TOML, or failed validation.
pub const EXIT_RECON_INVALID_CONFIG: u8 = 3;

/// Input CSV unreadable, a required column missing, or an unparseable date.
pub const EXIT_RECON_INPUT: u8 = 4;

/// More than one equally plausible match (strict mode).
pub const EXIT_RECON_AMBIGUOUS: u8 = 5;

/// Conflicting evidence left unresolved (strict mode).
pub const EXIT_RECON_UNRESOLVED: u8 = 6;

/// Value combination or address shape the comparison rules do not cover.
pub const EXIT_RECON_DATA_MODEL: u8 = 7;

/// Map an engine error to its exit code.
pub fn recon_exit_code(err: &MatchError) -> u8 {
    match err {
        MatchError::ConfigParse(_) | MatchError::ConfigValidation(_) => EXIT_RECON_INVALID_CONFIG,
        MatchError::MissingColumn { .. } | MatchError::DateParse { .. } | MatchError::Io(_) => {
            EXIT_RECON_INPUT
        }
        MatchError::AmbiguousMatch { .. } => EXIT_RECON_AMBIGUOUS,
        MatchError::UnresolvedMatch { .. } => EXIT_RECON_UNRESOLVED,
        MatchError::UnhandledComparison { .. }
        | MatchError::SizeMismatch { .. }
        | MatchError::ParseFailure { .. }
        | MatchError::UnknownAgencyType { .. } => EXIT_RECON_DATA_MODEL,
    }
}
