//! Structured events emitted while matching.
//!
//! The orchestrator reports every decision it makes without resolving to a
//! match (and every match) through a [`DiagnosticsSink`]. Callers choose
//! whether events become log lines, get collected for inspection, or vanish.

use serde::Serialize;

use crate::model::RecordId;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DiagnosticEvent {
    /// Several equally plausible matches. `accepted` when the pass matched
    /// anyway (known exception, or greedy name matching); otherwise left unmatched.
    AmbiguousMatch {
        pass: &'static str,
        record: RecordId,
        candidates: Vec<RecordId>,
        accepted: bool,
    },
    /// Canonical record had an unknown demographic the candidate fills in.
    UnknownAsymmetry {
        canonical: RecordId,
        candidate: RecordId,
    },
    /// Races differ but the stage allowed it.
    RaceDiff {
        canonical: RecordId,
        candidate: RecordId,
    },
    /// An address without a street name, tolerated in lenient mode.
    ParseFailure {
        pass: &'static str,
        address: String,
    },
    /// Date hits existed but none matched on demographics.
    DemographicsMismatch {
        pass: &'static str,
        record: RecordId,
        date_hits: Vec<RecordId>,
    },
    /// Conflicting evidence the pass could not settle; left unmatched.
    Unresolved {
        pass: &'static str,
        record: RecordId,
        reason: String,
    },
    Matched {
        pass: &'static str,
        canonical: RecordId,
        candidate: RecordId,
    },
}

pub trait DiagnosticsSink {
    fn emit(&mut self, event: DiagnosticEvent);
}

/// Forwards events to `tracing`: matches at debug, anomalies at info,
/// skipped ambiguity and parse failures at warn.
#[derive(Debug, Default)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn emit(&mut self, event: DiagnosticEvent) {
        match &event {
            DiagnosticEvent::Matched {
                pass,
                canonical,
                candidate,
            } => tracing::debug!(%pass, %canonical, %candidate, "matched"),
            DiagnosticEvent::UnknownAsymmetry { canonical, candidate } => {
                tracing::info!(
                    %canonical,
                    %candidate,
                    "canonical demographic unknown, candidate known"
                )
            }
            DiagnosticEvent::RaceDiff { canonical, candidate } => {
                tracing::info!(%canonical, %candidate, "matched with differing race")
            }
            DiagnosticEvent::DemographicsMismatch {
                pass,
                record,
                date_hits,
            } => {
                let hits = date_hits.len();
                tracing::debug!(%pass, %record, hits, "date hits failed demographics")
            }
            DiagnosticEvent::AmbiguousMatch {
                pass,
                record,
                candidates,
                accepted,
            } => tracing::warn!(
                %pass,
                %record,
                candidates = ?candidates,
                accepted,
                "ambiguous match"
            ),
            DiagnosticEvent::ParseFailure { pass, address } => {
                tracing::warn!(%pass, %address, "no street name in address")
            }
            DiagnosticEvent::Unresolved { pass, record, reason } => {
                tracing::warn!(%pass, %record, %reason, "unresolved match skipped")
            }
        }
    }
}

/// Keeps every event in order. Used by tests and `--json` output.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub events: Vec<DiagnosticEvent>,
}

impl CollectingSink {
    pub fn count(&self, pred: impl Fn(&DiagnosticEvent) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }
}

impl DiagnosticsSink for CollectingSink {
    fn emit(&mut self, event: DiagnosticEvent) {
        self.events.push(event);
    }
}

#[derive(Debug, Default)]
pub struct NullSink;

impl DiagnosticsSink for NullSink {
    fn emit(&mut self, _event: DiagnosticEvent) {}
}

/// Fans events out to two sinks.
pub struct Tee<'a, A: ?Sized, B: ?Sized>(pub &'a mut A, pub &'a mut B);

impl<A, B> DiagnosticsSink for Tee<'_, A, B>
where
    A: DiagnosticsSink + ?Sized,
    B: DiagnosticsSink + ?Sized,
{
    fn emit(&mut self, event: DiagnosticEvent) {
        self.0.emit(event.clone());
        self.1.emit(event);
    }
}
