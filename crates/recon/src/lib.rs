//! `ois-recon`: reconciliation engine for officer-involved-shooting records.
//!
//! Pure engine crate: receives loaded records, returns matches, leftovers,
//! and corrections. No CLI dependencies; file IO stays with the caller.

pub mod address;
pub mod agency;
pub mod clean;
pub mod config;
pub mod dates;
pub mod dedup;
pub mod demographics;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod matcher;
pub mod model;
pub mod text;

pub use address::{AddressParser, StreetTagger};
pub use config::{MatchConfig, ReconConfig, Strictness};
pub use diagnostics::{CollectingSink, DiagnosticEvent, DiagnosticsSink, NullSink, TracingSink};
pub use engine::{load_csv_records, run};
pub use error::MatchError;
pub use matcher::Orchestrator;
pub use model::{MatchOutcome, Record, RecordSet, ReconInput, ReconResult};
