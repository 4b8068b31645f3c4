//! Error taxonomy shared by the engine, the loaders, and the config layer.

use thiserror::Error;

use crate::model::RecordId;

#[derive(Debug, Error)]
pub enum MatchError {
    /// More than one equally plausible match where uniqueness is assumed.
    #[error("{pass}: record {record} has {} equally plausible matches: {}", .candidates.len(), join_ids(.candidates))]
    AmbiguousMatch {
        pass: &'static str,
        record: RecordId,
        candidates: Vec<RecordId>,
    },

    /// A field-value combination outside the comparison rules. Never downgraded.
    #[error("unhandled {field} comparison: candidate {candidate:?} vs reference {reference:?}{}", describe_ids(.candidate_id, .reference_id))]
    UnhandledComparison {
        field: &'static str,
        candidate: String,
        reference: String,
        candidate_id: Option<RecordId>,
        reference_id: Option<RecordId>,
    },

    /// Address did not yield a street name.
    #[error("no street name found in address {address:?}{}", describe_ids(.candidate_id, .reference_id))]
    ParseFailure {
        address: String,
        candidate_id: Option<RecordId>,
        reference_id: Option<RecordId>,
    },

    /// Paired vectors of incompatible length.
    #[error("date inputs are different sizes: {left} vs {right}")]
    SizeMismatch { left: usize, right: usize },

    /// Evidence conflicts in a way none of the pass rules resolve.
    #[error("{pass}: record {record}: {reason}")]
    UnresolvedMatch {
        pass: &'static str,
        record: RecordId,
        reason: String,
    },

    #[error("cannot determine the agency type of '{agency}'")]
    UnknownAgencyType { agency: String },

    /// TOML parse / deserialization error.
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// Config validation error (bad threshold, empty alias list, etc.).
    #[error("config validation error: {0}")]
    ConfigValidation(String),

    /// None of a field's column aliases were found in the input header.
    #[error("source '{source_name}': missing column '{column}'")]
    MissingColumn { source_name: String, column: String },

    #[error("source '{source_name}', row {row}: cannot parse date '{value}'")]
    DateParse {
        source_name: String,
        row: usize,
        value: String,
    },

    #[error("IO error: {0}")]
    Io(String),
}

impl MatchError {
    /// Attach record ids to a comparison failure raised below the row level.
    /// `candidate` is the candidate-table record, `reference` the canonical one.
    /// Ids already attached are kept.
    pub(crate) fn with_records(mut self, candidate: RecordId, reference: RecordId) -> Self {
        if let Self::UnhandledComparison {
            candidate_id,
            reference_id,
            ..
        }
        | Self::ParseFailure {
            candidate_id,
            reference_id,
            ..
        } = &mut self
        {
            candidate_id.get_or_insert(candidate);
            reference_id.get_or_insert(reference);
        }
        self
    }
}

fn join_ids(ids: &[RecordId]) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ")
}

fn describe_ids(candidate: &Option<RecordId>, reference: &Option<RecordId>) -> String {
    match (candidate, reference) {
        (Some(c), Some(r)) => format!(" (candidate record {c}, reference record {r})"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ambiguous_lists_candidates() {
        let err = MatchError::AmbiguousMatch {
            pass: "date_first",
            record: RecordId(3),
            candidates: vec![RecordId(7), RecordId(9)],
        };
        assert_eq!(
            err.to_string(),
            "date_first: record #3 has 2 equally plausible matches: #7, #9"
        );
    }

    #[test]
    fn with_records_fills_comparison_and_parse_errors() {
        let err = MatchError::UnhandledComparison {
            field: "age",
            candidate: "20-29".into(),
            reference: "30-39".into(),
            candidate_id: None,
            reference_id: None,
        }
        .with_records(RecordId(1), RecordId(2));
        assert!(err.to_string().contains("candidate record #1, reference record #2"));

        let err = MatchError::ParseFailure {
            address: "Walmart".into(),
            candidate_id: None,
            reference_id: None,
        }
        .with_records(RecordId(4), RecordId(0))
        .with_records(RecordId(9), RecordId(9));
        assert_eq!(
            err.to_string(),
            "no street name found in address \"Walmart\" (candidate record #4, reference record #0)"
        );

        let err = MatchError::SizeMismatch { left: 1, right: 2 }.with_records(RecordId(1), RecordId(2));
        assert!(matches!(err, MatchError::SizeMismatch { left: 1, right: 2 }));
    }
}
