//! Loading CSV sources into record sets and running one reconciliation.

use std::collections::BTreeMap;

use crate::address::AddressParser;
use crate::agency::AgencyFilter;
use crate::clean::clean_records;
use crate::config::{ReconConfig, SourceConfig};
use crate::diagnostics::DiagnosticsSink;
use crate::error::MatchError;
use crate::evidence::compute_summary;
use crate::matcher::Orchestrator;
use crate::model::{
    Age, IncidentDate, Record, RecordSet, ReconInput, ReconMeta, ReconResult, Role, Schema,
};

/// Run reconciliation per config: narrow the canonical table to the agency,
/// clean the candidate table, run the pass cascade, and summarize.
pub fn run(
    config: &ReconConfig,
    input: &ReconInput,
    parser: &dyn AddressParser,
    sink: &mut dyn DiagnosticsSink,
) -> Result<ReconResult, MatchError> {
    let mut matching = config.matching.clone();

    let mut canonical = match &config.agency {
        Some(agency) => {
            let state = matching.state.as_deref().ok_or_else(|| {
                MatchError::ConfigValidation("[agency] requires 'state'".into())
            })?;
            let filter = AgencyFilter::from_config(agency, state, matching.strictness)?;
            tracing::debug!(
                agency = %agency.name,
                place = %filter.split.partial,
                "filtering canonical table"
            );
            filter.apply(&input.canonical)
        }
        None => input.canonical.clone(),
    };
    if let Some(min_date) = config.clean.min_date {
        let min = min_date.and_time(chrono::NaiveTime::MIN);
        canonical = canonical.filtered(|r| match r.date {
            IncidentDate::Instant(dt) => dt >= min,
            IncidentDate::Period { end, .. } => end >= min,
        });
    }

    let (candidates, known_fatal) = if config.clean.enabled {
        let cleaned =
            clean_records(&input.candidates, &config.clean, matching.duplicate_key.as_deref());
        matching.duplicate_key = Some(cleaned.duplicate_key);
        (cleaned.records, cleaned.known_fatal)
    } else {
        (input.candidates.clone(), input.candidates.schema.fatal)
    };
    tracing::info!(
        canonical = canonical.len(),
        candidates = candidates.len(),
        dropped = input.candidates.len() - candidates.len(),
        "inputs prepared"
    );

    let outcome = Orchestrator::new(&matching, parser).run(
        &canonical,
        &candidates,
        Some(&input.canonical),
        sink,
    )?;
    let summary = compute_summary(&outcome, canonical.len(), candidates.len());

    Ok(ReconResult {
        meta: ReconMeta {
            config_name: config.name.clone(),
            strictness: matching.strictness.to_string(),
            candidate_known_fatal: known_fatal,
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            run_at: chrono::Utc::now().to_rfc3339(),
        },
        summary,
        outcome,
    })
}

/// Load CSV rows into a [`RecordSet`], resolving the column mapping against the header.
///
/// The date column is required. Other mapped fields are optional: when none
/// of a field's aliases is present the field is left out of the schema.
/// Unmapped columns are kept in [`Record::extra`].
pub fn load_csv_records(
    source_name: &str,
    csv_data: &str,
    source: &SourceConfig,
) -> Result<RecordSet, MatchError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(csv_data.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| MatchError::Io(e.to_string()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let col = &source.columns;
    let date_idx = col.date.resolve(&headers).ok_or_else(|| MatchError::MissingColumn {
        source_name: source_name.into(),
        column: col.date.0.join(" | "),
    })?;

    let optional = |field: &str, aliases: &crate::config::Aliases| {
        let idx = aliases.resolve(&headers);
        if idx.is_none() && !aliases.is_empty() {
            tracing::debug!(
                source = source_name,
                field,
                aliases = ?aliases.0,
                "mapped column not present"
            );
        }
        idx
    };
    let agency_idx = optional("agency", &col.agency);
    let state_idx = optional("state", &col.state);
    let county_idx = optional("county", &col.county);
    let address_idx = optional("address", &col.address);
    let zip_idx = optional("zip", &col.zip);
    let name_idx = optional("name", &col.name);
    let race_idx = optional("race", &col.race);
    let race_only_idx = optional("race_only", &col.race_only);
    let gender_idx = optional("gender", &col.gender);
    let age_idx = optional("age", &col.age);
    let fatal_idx = optional("fatal", &col.fatal);
    let injury_idx = optional("injury", &col.injury);
    let role_idx = optional("role", &col.role);

    let mapped: Vec<usize> = [
        Some(date_idx),
        agency_idx,
        state_idx,
        county_idx,
        address_idx,
        zip_idx,
        name_idx,
        race_idx,
        race_only_idx,
        gender_idx,
        age_idx,
        fatal_idx,
        injury_idx,
        role_idx,
    ]
    .into_iter()
    .flatten()
    .collect();

    let schema = Schema {
        race: race_idx.is_some(),
        race_only: race_only_idx.is_some(),
        gender: gender_idx.is_some(),
        age: age_idx.is_some(),
        zip: zip_idx.is_some(),
        address: address_idx.is_some(),
        name: name_idx.is_some(),
        summary: headers.iter().any(|h| h.to_lowercase().contains("summary")),
        fatal: fatal_idx.is_some(),
        injury: injury_idx.is_some(),
        role: role_idx.is_some(),
    };

    let mut records = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|e| MatchError::Io(e.to_string()))?;
        let cell = |idx: Option<usize>| -> Option<String> {
            idx.and_then(|i| record.get(i))
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        };

        let date_str = record.get(date_idx).unwrap_or("");
        let date = IncidentDate::parse(date_str).ok_or_else(|| MatchError::DateParse {
            source_name: source_name.into(),
            row,
            value: date_str.into(),
        })?;

        let mut r = Record::new(row, date);
        r.agency = cell(agency_idx);
        r.state = cell(state_idx);
        r.county = cell(county_idx);
        r.address = cell(address_idx);
        r.zip = cell(zip_idx);
        r.name = cell(name_idx);
        r.demographics.race = cell(race_idx);
        r.demographics.race_only = cell(race_only_idx);
        r.demographics.gender = cell(gender_idx);
        r.demographics.age = cell(age_idx).and_then(|a| Age::parse(&a));
        r.fatal = cell(fatal_idx);
        r.injury = cell(injury_idx);
        r.role = cell(role_idx).and_then(|v| Role::parse(&v));

        let mut extra = BTreeMap::new();
        for (i, h) in headers.iter().enumerate() {
            if mapped.contains(&i) {
                continue;
            }
            if let Some(val) = record.get(i).map(str::trim).filter(|v| !v.is_empty()) {
                extra.insert(h.clone(), val.to_string());
            }
        }
        r.extra = extra;
        records.push(r);
    }

    tracing::debug!(source = source_name, rows = records.len(), ?schema, "loaded records");
    Ok(RecordSet::new(source_name, schema, records))
}
