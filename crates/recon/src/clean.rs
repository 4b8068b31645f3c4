//! Candidate-table preparation before matching.

use std::collections::HashSet;

use crate::config::CleanConfig;
use crate::dedup::{drop_duplicates, duplicate_check_key, DedupOptions};
use crate::model::{IncidentDate, KeyField, RecordSet, Role};
use crate::text::normalize_category;

/// Result of [`clean_records`].
#[derive(Debug, Clone)]
pub struct Cleaned {
    pub records: RecordSet,
    /// False when the source has no fatality column and rows were kept anyway.
    pub known_fatal: bool,
    /// Fields compared when collapsing duplicate rows.
    pub duplicate_key: Vec<KeyField>,
}

/// Prepare a candidate table for matching against a fatal-only canonical set:
/// drop officer rows, drop non-fatal rows, drop rows before `min_date`, and
/// collapse duplicate rows of one subject.
///
/// Fatality comes from the fatal column, or from the injury column when the
/// source has none. A source with neither yields an empty set unless
/// `include_unknown_fatal` is set. Without a configured `key` the duplicate
/// key is chosen from the rows that survive the filters.
pub fn clean_records(set: &RecordSet, config: &CleanConfig, key: Option<&[KeyField]>) -> Cleaned {
    let mut records = set.clone();
    if set.schema.role {
        records = records.filtered(|r| r.role == Some(Role::Subject));
    }

    let mut known_fatal = true;
    if set.schema.fatal {
        let mut accepted = vec!["YES"];
        if config.include_unknown_fatal {
            accepted.push("UNSPECIFIED");
        }
        if config.keep_self_inflicted {
            accepted.push("SELF-INFLICTED FATAL");
        }
        records = records.filtered(|r| {
            r.fatal
                .as_deref()
                .is_some_and(|f| accepted.contains(&normalize_category(f).as_str()))
        });
    } else if set.schema.injury {
        tracing::debug!(source = %set.source, "no fatality column; reading injuries");
        records = records.filtered(|r| {
            r.injury
                .as_deref()
                .is_some_and(|i| normalize_category(i) == "FATAL")
        });
    } else if config.include_unknown_fatal {
        known_fatal = false;
    } else {
        tracing::debug!(source = %set.source, "no fatality column; nothing kept");
        return Cleaned {
            records: set.filtered(|_| false),
            known_fatal: false,
            duplicate_key: key.map(<[KeyField]>::to_vec).unwrap_or_default(),
        };
    }

    if let Some(min_date) = config.min_date {
        let min = min_date.and_time(chrono::NaiveTime::MIN);
        records = records.filtered(|r| match r.date {
            IncidentDate::Instant(dt) => dt >= min,
            IncidentDate::Period { start, .. } => start >= min,
        });
    }

    let duplicate_key = match key {
        Some(key) => key.to_vec(),
        None => duplicate_check_key(&records),
    };
    tracing::debug!(source = %set.source, key = ?duplicate_key, "duplicate key");

    let refs: Vec<_> = records.records.iter().collect();
    let kept: HashSet<_> = drop_duplicates(&refs, &duplicate_key, DedupOptions::default())
        .into_iter()
        .map(|r| r.id)
        .collect();
    let records = records.filtered(|r| kept.contains(&r.id));

    Cleaned {
        records,
        known_fatal,
        duplicate_key,
    }
}
