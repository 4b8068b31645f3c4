//! Duplicate-row reduction and the choice of columns that identify a subject.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::{KeyField, Record, RecordSet};
use crate::text::split_words;

static AMPERSAND: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s?&\s?").unwrap());

/// Extra key columns carrying part of a date ("INCIDENT_MONTH", "HOUR").
const PARTIAL_DATE_TERMS: &[&str] = &["month", "year", "day", "hour"];

/// Column-name fragments of values that differ between rows of one subject:
/// officer details, narratives, record numbers, weapons and force.
const PER_ROW_TERMS: &[&str] = &[
    "officer", "narrative", "objectid", "incnum", "text", " hash", "firearm", "longitude",
    "latitude", "rank", "globalid", "rin", "description", "force", "ofc", "sworn", "emp",
    "weapon", "shots", "reason", "perceived", "armed", "nature", "level", "number",
    "resistance",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupOptions {
    /// Rows equal on every field both have are duplicates; keep the fuller one.
    pub ignore_null: bool,
    /// With a date in the key, ignore columns holding parts of a date.
    pub ignore_date_errors: bool,
}

/// Collapse rows describing the same incident. Survivors keep input order.
///
/// Dates compare at day granularity. Without `ignore_null` only rows equal on
/// every key field (after case and `&`/`and` normalization) collapse, keeping
/// the first.
pub fn drop_duplicates<'r>(
    records: &[&'r Record],
    key: &[KeyField],
    options: DedupOptions,
) -> Vec<&'r Record> {
    let key = effective_key(key, options.ignore_date_errors);
    let rows: Vec<Vec<Option<String>>> = records
        .iter()
        .map(|r| key.iter().map(|f| r.key_value(f).map(|v| normalize(&v))).collect())
        .collect();

    let mut dup = vec![false; rows.len()];
    for k in 1..rows.len() {
        dup[k] = (0..k).any(|j| !dup[j] && rows[j] == rows[k]);
    }

    if options.ignore_null {
        let rows: Vec<Vec<Option<String>>> = rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|v| v.filter(|s| s != "unspecified"))
                    .collect()
            })
            .collect();
        for j in 0..rows.len() {
            for k in j + 1..rows.len() {
                if dup[j] {
                    break;
                }
                if dup[k] {
                    continue;
                }
                if agree_where_present(&rows[j], &rows[k]) {
                    // Ties drop the earlier row.
                    if null_count(&rows[j]) >= null_count(&rows[k]) {
                        dup[j] = true;
                    } else {
                        dup[k] = true;
                    }
                }
            }
        }
    }

    records
        .iter()
        .zip(dup)
        .filter(|(_, d)| !d)
        .map(|(r, _)| *r)
        .collect()
}

/// Duplicate key for a source with none configured.
///
/// The date and every subject field the source carries are always part of
/// it. Location fields and extra columns join only when no row leaves them
/// blank, and extra columns never do when their name marks an id, an
/// officer, a time of day, or another per-row detail.
pub fn duplicate_check_key(set: &RecordSet) -> Vec<KeyField> {
    let schema = set.schema;
    let records = &set.records;
    let everywhere = |value: fn(&Record) -> bool| records.iter().all(value);

    let mut key = vec![KeyField::Date];
    let subject = [
        (schema.name, KeyField::Name),
        (schema.race, KeyField::Race),
        (schema.race_only, KeyField::RaceOnly),
        (schema.gender, KeyField::Gender),
        (schema.age, KeyField::Age),
        (schema.fatal, KeyField::Fatal),
    ];
    key.extend(subject.into_iter().filter(|(present, _)| *present).map(|(_, f)| f));

    if !records.is_empty() {
        if everywhere(|r| r.agency.is_some()) {
            key.push(KeyField::Agency);
        }
        if everywhere(|r| r.state.is_some()) {
            key.push(KeyField::State);
        }
        if schema.address && everywhere(|r| r.address.is_some()) {
            key.push(KeyField::Address);
        }
        if schema.zip && everywhere(|r| r.zip.is_some()) {
            key.push(KeyField::Zip);
        }
    }

    let columns: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.extra.keys().map(String::as_str))
        .collect();
    key.extend(
        columns
            .into_iter()
            .filter(|c| !varies_per_row(c))
            .filter(|c| records.iter().all(|r| r.extra.contains_key(*c)))
            .map(|c| KeyField::Extra(c.to_string())),
    );
    key
}

fn varies_per_row(column: &str) -> bool {
    let lower = column.to_lowercase();
    let words: Vec<String> = split_words(column).iter().map(|w| w.to_uppercase()).collect();
    words.iter().any(|w| matches!(w.as_str(), "ID" | "TIME" | "DATETIME"))
        || lower.starts_with("off")
        || lower.starts_with("raw_")
        || PER_ROW_TERMS.iter().any(|t| lower.contains(t))
}

fn effective_key(key: &[KeyField], ignore_date_errors: bool) -> Vec<KeyField> {
    let has_date = key
        .iter()
        .any(|f| *f == KeyField::Date || f.name().to_lowercase().contains("date"));
    if !(ignore_date_errors && has_date) {
        return key.to_vec();
    }
    key.iter()
        .filter(|f| {
            let name = f.name().to_lowercase();
            !PARTIAL_DATE_TERMS.iter().any(|t| name.contains(t))
        })
        .cloned()
        .collect()
}

fn normalize(value: &str) -> String {
    AMPERSAND.replace_all(value, " and ").to_lowercase()
}

fn null_count(row: &[Option<String>]) -> usize {
    row.iter().filter(|v| v.is_none()).count()
}

fn agree_where_present(a: &[Option<String>], b: &[Option<String>]) -> bool {
    a.iter().zip(b).all(|pair| match pair {
        (Some(x), Some(y)) => x == y,
        _ => true,
    })
}
