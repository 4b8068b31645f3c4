//! Agency-name handling: splitting names into place and type, and narrowing a
//! multi-agency table down to the rows of one agency.

use std::collections::{BTreeMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{AgencyConfig, Strictness};
use crate::error::MatchError;
use crate::model::{Record, RecordId, RecordSet};
use crate::text::split_words;

/// Agency type suffixes, longest first so the most specific wins.
static AGENCY_TYPES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    let mut types = vec![
        "Area Rapid Transit Police Department",
        "Police Department",
        "Crisis Response Team",
        "Sheriff's Office",
        "Township Police Department",
        "Sheriff's Department",
        "Sheriff's Dept.",
        "Police Bureau",
        "State University Department of Public Safety",
        "Housing Authority Police Department",
        "Marshal Service",
        "Drug Enforcement Administration",
        "Probation Department",
        "Highway Patrol",
        "District Attorney's Office",
        "State Police",
    ];
    types.sort_by_key(|t| std::cmp::Reverse(t.len()));
    types
});

static DEPARTMENT_OF: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^department of .+").unwrap());
static COUNTY_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\scounty\b").unwrap());

const STATES: &[(&str, &str)] = &[
    ("Alabama", "AL"),
    ("Alaska", "AK"),
    ("Arizona", "AZ"),
    ("Arkansas", "AR"),
    ("California", "CA"),
    ("Colorado", "CO"),
    ("Connecticut", "CT"),
    ("Delaware", "DE"),
    ("District of Columbia", "DC"),
    ("Florida", "FL"),
    ("Georgia", "GA"),
    ("Hawaii", "HI"),
    ("Idaho", "ID"),
    ("Illinois", "IL"),
    ("Indiana", "IN"),
    ("Iowa", "IA"),
    ("Kansas", "KS"),
    ("Kentucky", "KY"),
    ("Louisiana", "LA"),
    ("Maine", "ME"),
    ("Maryland", "MD"),
    ("Massachusetts", "MA"),
    ("Michigan", "MI"),
    ("Minnesota", "MN"),
    ("Mississippi", "MS"),
    ("Missouri", "MO"),
    ("Montana", "MT"),
    ("Nebraska", "NE"),
    ("Nevada", "NV"),
    ("New Hampshire", "NH"),
    ("New Jersey", "NJ"),
    ("New Mexico", "NM"),
    ("New York", "NY"),
    ("North Carolina", "NC"),
    ("North Dakota", "ND"),
    ("Ohio", "OH"),
    ("Oklahoma", "OK"),
    ("Oregon", "OR"),
    ("Pennsylvania", "PA"),
    ("Puerto Rico", "PR"),
    ("Rhode Island", "RI"),
    ("South Carolina", "SC"),
    ("South Dakota", "SD"),
    ("Tennessee", "TN"),
    ("Texas", "TX"),
    ("Utah", "UT"),
    ("Vermont", "VT"),
    ("Virginia", "VA"),
    ("Washington", "WA"),
    ("West Virginia", "WV"),
    ("Wisconsin", "WI"),
    ("Wyoming", "WY"),
];

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

fn lookup(state: &str) -> Option<(&'static str, &'static str)> {
    let state = state.trim();
    STATES
        .iter()
        .find(|(name, abbrev)| name.eq_ignore_ascii_case(state) || abbrev.eq_ignore_ascii_case(state))
        .copied()
}

/// Two-letter code for a state name or code.
pub fn state_abbrev(state: &str) -> Option<&'static str> {
    lookup(state).map(|(_, abbrev)| abbrev)
}

pub fn full_state_name(state: &str) -> Option<&'static str> {
    lookup(state).map(|(name, _)| name)
}

/// Same state, whether written as a name or a code.
pub fn state_equals(a: &str, b: &str) -> bool {
    if a.trim().eq_ignore_ascii_case(b.trim()) {
        return true;
    }
    matches!((lookup(a), lookup(b)), (Some(x), Some(y)) if x == y)
}

/// Rows recorded in `state`. Rows without a state are dropped.
pub fn filter_by_state(table: &RecordSet, state: &str) -> RecordSet {
    table.filtered(|r| r.state.as_deref().is_some_and(|s| state_equals(s, state)))
}

// ---------------------------------------------------------------------------
// Agency names
// ---------------------------------------------------------------------------

/// An agency name split into its place ("Phoenix") and type ("Police Department").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgencyName {
    pub partial: String,
    pub kind: String,
}

/// Split a full agency name. Names whose type cannot be found are returned
/// whole with an empty type, or rejected in strict mode.
pub fn split_agency_name(
    agency: &str,
    state: &str,
    strictness: Strictness,
) -> Result<AgencyName, MatchError> {
    let agency = agency.trim();
    let lower = agency.to_ascii_lowercase();
    let unknown = || {
        if strictness.is_strict() {
            Err(MatchError::UnknownAgencyType {
                agency: agency.to_string(),
            })
        } else {
            Ok(AgencyName {
                partial: agency.to_string(),
                kind: String::new(),
            })
        }
    };

    if let Some(kind) = AGENCY_TYPES
        .iter()
        .find(|t| lower.ends_with(&t.to_ascii_lowercase()))
    {
        let partial = agency[..agency.len() - kind.len()].trim();
        return Ok(AgencyName {
            partial: partial.to_string(),
            kind: agency[agency.len() - kind.len()..].to_string(),
        });
    }
    if DEPARTMENT_OF.is_match(agency) {
        return Ok(AgencyName {
            partial: String::new(),
            kind: agency.to_string(),
        });
    }

    // "Arizona Department of Public Safety ..." or "AZ State Police ...":
    // keep everything up to the end of the type as the place name.
    let full = full_state_name(state);
    let abbrev = state_abbrev(state);
    let expanded = match (full, abbrev) {
        (Some(full), _) if lower.starts_with(&format!("{} ", full.to_ascii_lowercase())) => {
            agency.to_string()
        }
        (Some(full), Some(abbrev))
            if lower.starts_with(&format!("{} ", abbrev.to_ascii_lowercase())) =>
        {
            format!("{full}{}", &agency[abbrev.len()..])
        }
        _ => return unknown(),
    };
    let expanded_lower = expanded.to_ascii_lowercase();
    let Some((idx, kind)) = AGENCY_TYPES.iter().find_map(|t| {
        expanded_lower
            .find(&t.to_ascii_lowercase())
            .map(|idx| (idx, *t))
    }) else {
        return unknown();
    };
    Ok(AgencyName {
        partial: expanded[..idx + kind.len()].to_string(),
        kind: String::new(),
    })
}

// ---------------------------------------------------------------------------
// Agency filter
// ---------------------------------------------------------------------------

/// Selects the rows of one agency from a table covering many.
#[derive(Debug, Clone)]
pub struct AgencyFilter {
    pub name: String,
    pub split: AgencyName,
    pub state: String,
    pub merge_county: bool,
    pub cross_references: Vec<String>,
    pub exact: bool,
    /// Separator inside cells that list several agencies.
    pub delimiter: char,
}

impl AgencyFilter {
    pub fn from_config(
        config: &AgencyConfig,
        state: &str,
        strictness: Strictness,
    ) -> Result<Self, MatchError> {
        Ok(Self {
            name: config.name.clone(),
            split: split_agency_name(&config.name, state, strictness)?,
            state: state.to_string(),
            merge_county: config.merge_county,
            cross_references: config.cross_references.clone(),
            exact: config.exact,
            delimiter: ',',
        })
    }

    /// Rows likely belonging to the agency, in table order.
    ///
    /// A row qualifies when its agency cell (or one entry of a delimited
    /// cell) equals the full or place name, or starts with the place name's
    /// words. Rows without a state are not excluded on state.
    pub fn apply(&self, table: &RecordSet) -> RecordSet {
        let normalize = |s: &str| s.trim().to_lowercase().replace('&', "and");
        let name = normalize(&self.name);
        let mut partial = normalize(&self.split.partial);
        if self.merge_county {
            partial = COUNTY_WORD.replace_all(&partial, "").trim().to_string();
        }
        let full = full_state_name(&self.state).map(str::to_lowercase);
        let abbrev = state_abbrev(&self.state).map(str::to_lowercase);

        let row_agency = |r: &Record| -> Option<String> {
            let a = normalize(r.agency.as_deref()?);
            match (&abbrev, &full) {
                (Some(ab), Some(full)) if a.starts_with(&format!("{ab} ")) => {
                    Some(format!("{full}{}", &a[ab.len()..]))
                }
                _ => Some(a),
            }
        };
        let in_state = |r: &Record| r.state.as_deref().map_or(true, |s| state_equals(s, &self.state));

        let mut keep: HashSet<RecordId> = HashSet::new();
        let candidates = table
            .records
            .iter()
            .filter(|r| in_state(r))
            .filter_map(|r| row_agency(r).map(|a| (r, a)))
            .filter(|(_, a)| a.contains(&partial));

        if partial.is_empty() {
            let prefixes: Vec<&String> = [&abbrev, &full].into_iter().flatten().collect();
            for (r, a) in candidates {
                if a.ends_with(&name) && prefixes.iter().any(|p| a.starts_with(p.as_str())) {
                    keep.insert(r.id);
                }
            }
        } else {
            let words = split_words(&partial);
            for (r, a) in candidates {
                if self.agency_cell_matches(&a, &name, &partial, &words) {
                    keep.insert(r.id);
                }
            }
        }

        if keep.is_empty() {
            tracing::debug!(agency = %self.name, "no rows found for agency");
        }

        if self.merge_county && !keep.is_empty() {
            let kept: Vec<&Record> = table.records.iter().filter(|r| keep.contains(&r.id)).collect();
            let county = mode(kept.iter().filter_map(|r| r.county.as_deref()));
            let state = mode(kept.iter().filter_map(|r| r.state.as_deref()));
            if let (Some(county), Some(state)) = (county, state) {
                for r in &table.records {
                    if r.county.as_deref() == Some(county.as_str())
                        && r.state.as_deref() == Some(state.as_str())
                    {
                        keep.insert(r.id);
                    }
                }
            }
        }

        for alias in &self.cross_references {
            let alias = normalize(alias);
            for r in table.records.iter().filter(|r| in_state(r)) {
                if row_agency(r).is_some_and(|a| a.contains(&alias)) {
                    keep.insert(r.id);
                }
            }
        }

        table.filtered(|r| keep.contains(&r.id))
    }

    fn agency_cell_matches(&self, cell: &str, name: &str, partial: &str, words: &[String]) -> bool {
        if cell == name || cell == partial {
            return true;
        }
        let cell = cell.strip_prefix('"').unwrap_or(cell);
        let cell = cell.strip_suffix('"').unwrap_or(cell);
        cell.split(self.delimiter).map(str::trim).any(|entry| {
            if entry == name || entry == partial {
                return true;
            }
            if self.exact {
                return false;
            }
            let entry_words = split_words(entry);
            entry_words.len() >= words.len() && entry_words[..words.len()] == *words
        })
    }
}

/// Most frequent value; ties go to the smallest.
fn mode<'a>(values: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for v in values {
        *counts.entry(v).or_default() += 1;
    }
    let mut best: Option<(&str, usize)> = None;
    for (value, count) in counts {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((value, count));
        }
    }
    best.map(|(v, _)| v.to_string())
}
