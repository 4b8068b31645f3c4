use std::collections::BTreeMap;

use crate::matcher::PASS_CROSS_AGENCY;
use crate::model::{MatchOutcome, ReconSummary};

/// Compute summary statistics from a matching outcome.
pub fn compute_summary(
    outcome: &MatchOutcome,
    canonical_total: usize,
    candidate_total: usize,
) -> ReconSummary {
    let mut by_pass: BTreeMap<String, usize> = BTreeMap::new();
    for pass in outcome.matched_by.values() {
        *by_pass.entry(pass.to_string()).or_insert(0) += 1;
    }
    if !outcome.cross_agency.is_empty() {
        by_pass.insert(PASS_CROSS_AGENCY.to_string(), outcome.cross_agency.len());
    }

    ReconSummary {
        canonical_total,
        candidate_total,
        matched: outcome.matched_count(),
        canonical_unmatched: outcome.remaining_canonical.len(),
        candidate_unmatched: outcome.remaining_candidates.len(),
        corrections: outcome.corrections.len(),
        age_differences: outcome.age_diff.len(),
        cross_agency: outcome.cross_agency.len(),
        by_pass,
        ambiguous_skipped: outcome.ambiguous_skipped,
    }
}
