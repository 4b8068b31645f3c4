use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Serialize, Serializer};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stable row identity: the 0-based data-row index in the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RecordId(pub usize);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

/// Incident date: a single instant, or a coarse span such as a month.
///
/// Timezones are dropped at load time; comparisons use wall-clock values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentDate {
    Instant(NaiveDateTime),
    /// Inclusive bounds: `end` is the last instant of the span.
    Period { start: NaiveDateTime, end: NaiveDateTime },
}

impl IncidentDate {
    pub fn day(date: NaiveDate) -> Self {
        Self::Instant(date.and_time(NaiveTime::MIN))
    }

    /// Whole calendar month as a period.
    pub fn month(year: i32, month: u32) -> Option<Self> {
        let first = NaiveDate::from_ymd_opt(year, month, 1)?;
        let next = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)?
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)?
        };
        let start = first.and_time(NaiveTime::MIN);
        let end = next.and_time(NaiveTime::MIN) - Duration::nanoseconds(1);
        Some(Self::Period { start, end })
    }

    /// Whole calendar year as a period.
    pub fn year(year: i32) -> Option<Self> {
        let start = NaiveDate::from_ymd_opt(year, 1, 1)?.and_time(NaiveTime::MIN);
        let end = NaiveDate::from_ymd_opt(year + 1, 1, 1)?.and_time(NaiveTime::MIN)
            - Duration::nanoseconds(1);
        Some(Self::Period { start, end })
    }

    /// Parse the date shapes found in the source datasets.
    ///
    /// `YYYY-MM` and `YYYY` become periods; everything else is an instant.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value) {
            return Some(Self::Instant(dt.naive_local()));
        }
        for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M", "%m/%d/%Y %H:%M"] {
            if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
                return Some(Self::Instant(dt));
            }
        }
        for fmt in ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"] {
            if let Ok(d) = NaiveDate::parse_from_str(value, fmt) {
                return Some(Self::day(d));
            }
        }
        if let Some(caps) = PERIOD_MONTH.captures(value) {
            let year = caps[1].parse().ok()?;
            let month = caps[2].parse().ok()?;
            return Self::month(year, month);
        }
        if PERIOD_YEAR.is_match(value) {
            return Self::year(value.parse().ok()?);
        }
        None
    }

    pub fn is_period(&self) -> bool {
        matches!(self, Self::Period { .. })
    }

    /// Calendar day of an instant. Periods have no single day.
    pub fn calendar_day(&self) -> Option<NaiveDate> {
        match self {
            Self::Instant(dt) => Some(dt.date()),
            Self::Period { .. } => None,
        }
    }

    /// Instant with the time of day zeroed; periods unchanged.
    pub fn truncate_to_day(&self) -> Self {
        match self {
            Self::Instant(dt) => Self::day(dt.date()),
            other => *other,
        }
    }
}

static PERIOD_MONTH: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{4})-(\d{1,2})$").unwrap());
static PERIOD_YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}$").unwrap());

impl fmt::Display for IncidentDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instant(dt) if dt.time() == NaiveTime::MIN => write!(f, "{}", dt.date()),
            Self::Instant(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S")),
            Self::Period { start, end } => {
                let month_end = Self::month(start.year(), start.month());
                if start.day() == 1
                    && start.hour() == 0
                    && month_end == Some(Self::Period { start: *start, end: *end })
                {
                    write!(f, "{}", start.format("%Y-%m"))
                } else {
                    write!(f, "{}..{}", start.format("%Y-%m-%d"), end.format("%Y-%m-%d"))
                }
            }
        }
    }
}

impl Serialize for IncidentDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ---------------------------------------------------------------------------
// Demographics
// ---------------------------------------------------------------------------

/// Subject age as recorded: a point age, a bracket, or free text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Age {
    Years(u32),
    Range { min: u32, max: u32 },
    Text(String),
}

static AGE_RANGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)\s*-\s*(\d+)$").unwrap());

impl Age {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        if let Ok(years) = value.parse::<u32>() {
            return Some(Self::Years(years));
        }
        // Spreadsheet exports write whole ages as floats.
        if let Ok(years) = value.parse::<f64>() {
            if years >= 0.0 && years.fract() == 0.0 {
                return Some(Self::Years(years as u32));
            }
        }
        if let Some(caps) = AGE_RANGE.captures(value) {
            if let (Ok(min), Ok(max)) = (caps[1].parse(), caps[2].parse()) {
                return Some(Self::Range { min, max });
            }
        }
        Some(Self::Text(value.to_uppercase()))
    }
}

impl fmt::Display for Age {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Years(y) => write!(f, "{y}"),
            Self::Range { min, max } => write!(f, "{min}-{max}"),
            Self::Text(t) => write!(f, "{t}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Demographics {
    /// Combined race/ethnicity value. May hold several comma-separated values.
    pub race: Option<String>,
    /// Race without ethnicity, when the source carries both.
    pub race_only: Option<String>,
    pub gender: Option<String>,
    pub age: Option<Age>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Subject,
    Officer,
}

impl Role {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "SUBJECT" | "CIVILIAN" => Some(Self::Subject),
            "OFFICER" => Some(Self::Officer),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One incident row, normalized at load time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub id: RecordId,
    pub date: IncidentDate,
    pub agency: Option<String>,
    pub state: Option<String>,
    pub county: Option<String>,
    pub address: Option<String>,
    pub zip: Option<String>,
    pub name: Option<String>,
    pub demographics: Demographics,
    pub fatal: Option<String>,
    /// Subject injury ("FATAL", "SERIOUS", ...). Stands in for `fatal` when that is absent.
    pub injury: Option<String>,
    pub role: Option<Role>,
    /// Free-text and unmapped columns, keyed by header.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl Record {
    pub fn new(id: usize, date: IncidentDate) -> Self {
        Self {
            id: RecordId(id),
            date,
            agency: None,
            state: None,
            county: None,
            address: None,
            zip: None,
            name: None,
            demographics: Demographics::default(),
            fatal: None,
            injury: None,
            role: None,
            extra: BTreeMap::new(),
        }
    }

    /// Free-text summary columns (any extra column whose name mentions "summary").
    pub fn summaries(&self) -> Vec<(&str, &str)> {
        self.extra
            .iter()
            .filter(|(k, _)| k.to_lowercase().contains("summary"))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }

    /// Value of a key field as compared by the duplicate reducer. Dates are day-truncated.
    pub fn key_value(&self, field: &KeyField) -> Option<String> {
        match field {
            KeyField::Date => Some(self.date.truncate_to_day().to_string()),
            KeyField::Agency => self.agency.clone(),
            KeyField::State => self.state.clone(),
            KeyField::Address => self.address.clone(),
            KeyField::Zip => self.zip.clone(),
            KeyField::Name => self.name.clone(),
            KeyField::Race => self.demographics.race.clone(),
            KeyField::RaceOnly => self.demographics.race_only.clone(),
            KeyField::Gender => self.demographics.gender.clone(),
            KeyField::Age => self.demographics.age.as_ref().map(|a| a.to_string()),
            KeyField::Fatal => self.fatal.clone(),
            KeyField::Role => self.role.map(|r| format!("{r:?}")),
            KeyField::Extra(name) => self.extra.get(name).cloned(),
        }
    }
}

/// Column used as part of a duplicate-detection key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyField {
    Date,
    Agency,
    State,
    Address,
    Zip,
    Name,
    Race,
    RaceOnly,
    Gender,
    Age,
    Fatal,
    Role,
    Extra(String),
}

impl KeyField {
    pub fn name(&self) -> &str {
        match self {
            Self::Date => "date",
            Self::Agency => "agency",
            Self::State => "state",
            Self::Address => "address",
            Self::Zip => "zip",
            Self::Name => "name",
            Self::Race => "race",
            Self::RaceOnly => "race_only",
            Self::Gender => "gender",
            Self::Age => "age",
            Self::Fatal => "fatal",
            Self::Role => "role",
            Self::Extra(name) => name,
        }
    }

    /// The default duplicate key: every typed incident field.
    pub fn default_key() -> Vec<KeyField> {
        vec![
            Self::Date,
            Self::Agency,
            Self::Address,
            Self::Zip,
            Self::Name,
            Self::Race,
            Self::Gender,
            Self::Age,
            Self::Fatal,
        ]
    }
}

/// Which logical fields a source carries. Bound once from the column mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Schema {
    pub race: bool,
    pub race_only: bool,
    pub gender: bool,
    pub age: bool,
    pub zip: bool,
    pub address: bool,
    pub name: bool,
    pub summary: bool,
    pub fatal: bool,
    pub injury: bool,
    pub role: bool,
}

impl Schema {
    pub fn all() -> Self {
        Self {
            race: true,
            race_only: true,
            gender: true,
            age: true,
            zip: true,
            address: true,
            name: true,
            summary: true,
            fatal: true,
            injury: true,
            role: true,
        }
    }

    /// Fields both sources carry; only these are compared.
    pub fn intersect(&self, other: &Schema) -> Schema {
        Schema {
            race: self.race && other.race,
            race_only: self.race_only && other.race_only,
            gender: self.gender && other.gender,
            age: self.age && other.age,
            zip: self.zip && other.zip,
            address: self.address && other.address,
            name: self.name && other.name,
            summary: self.summary && other.summary,
            fatal: self.fatal && other.fatal,
            injury: self.injury && other.injury,
            role: self.role && other.role,
        }
    }
}

/// Ordered records from one source. The engine never mutates a set.
#[derive(Debug, Clone, Serialize)]
pub struct RecordSet {
    pub source: String,
    pub schema: Schema,
    pub records: Vec<Record>,
    #[serde(skip)]
    index: HashMap<RecordId, usize>,
}

impl RecordSet {
    pub fn new(source: impl Into<String>, schema: Schema, records: Vec<Record>) -> Self {
        let index = records.iter().enumerate().map(|(i, r)| (r.id, i)).collect();
        Self {
            source: source.into(),
            schema,
            records,
            index,
        }
    }

    pub fn get(&self, id: RecordId) -> Option<&Record> {
        self.index.get(&id).map(|&i| &self.records[i])
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Same source and schema, keeping only records accepted by `keep`, in order.
    pub fn filtered(&self, mut keep: impl FnMut(&Record) -> bool) -> RecordSet {
        let records = self.records.iter().filter(|r| keep(r)).cloned().collect();
        RecordSet::new(self.source.clone(), self.schema, records)
    }
}

// ---------------------------------------------------------------------------
// Comparison results
// ---------------------------------------------------------------------------

/// Demographic comparison of one candidate against a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MatchResult {
    pub is_match: bool,
    /// Reference holds an unknown sentinel where the candidate has a value.
    pub is_unknown: bool,
    /// Both races known and different, tolerated by `allow_race_diff`.
    pub is_diff_race: bool,
}

impl MatchResult {
    pub const MATCH: MatchResult = MatchResult {
        is_match: true,
        is_unknown: false,
        is_diff_race: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionKind {
    /// Canonical record has an unknown demographic the candidate fills in.
    UnknownDemographic,
    /// Races differ but were allowed to.
    RaceDifference,
    /// Matched on street and date only; demographics must differ.
    ImpliedDemographic,
    /// Matched with an age tolerance.
    AgeDifference,
}

/// A matched canonical record and the candidate row it matched.
#[derive(Debug, Clone, Serialize)]
pub struct Correction {
    pub canonical_id: RecordId,
    pub candidate_id: RecordId,
    pub kind: CorrectionKind,
    pub pass: &'static str,
    pub candidate: Record,
}

/// Terminal output of a matching run.
#[derive(Debug, Clone, Serialize)]
pub struct MatchOutcome {
    pub remaining_canonical: Vec<Record>,
    pub remaining_candidates: Vec<Record>,
    /// Matched flag for every canonical record, in canonical order.
    pub matched: Vec<(RecordId, bool)>,
    pub corrections: BTreeMap<RecordId, Correction>,
    pub age_diff: BTreeMap<RecordId, Correction>,
    /// Candidate rows matched to a canonical row filed under another agency.
    pub cross_agency: Vec<CrossAgencyMatch>,
    /// Pass that matched each matched canonical record.
    pub matched_by: BTreeMap<RecordId, &'static str>,
    /// Ambiguous hits left unmatched in lenient mode.
    pub ambiguous_skipped: usize,
}

impl MatchOutcome {
    pub fn matched_count(&self) -> usize {
        self.matched.iter().filter(|(_, m)| *m).count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CrossAgencyMatch {
    pub candidate_id: RecordId,
    pub canonical_id: RecordId,
    pub canonical_agency: Option<String>,
}

// ---------------------------------------------------------------------------
// Summary + Output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconSummary {
    pub canonical_total: usize,
    pub candidate_total: usize,
    pub matched: usize,
    pub canonical_unmatched: usize,
    pub candidate_unmatched: usize,
    pub corrections: usize,
    pub age_differences: usize,
    pub cross_agency: usize,
    /// Matches per pass name.
    pub by_pass: BTreeMap<String, usize>,
    pub ambiguous_skipped: usize,
}

/// Both tables as loaded, before agency filtering and cleaning.
#[derive(Debug, Clone)]
pub struct ReconInput {
    pub canonical: RecordSet,
    pub candidates: RecordSet,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconResult {
    pub meta: ReconMeta,
    pub summary: ReconSummary,
    pub outcome: MatchOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconMeta {
    pub config_name: String,
    pub strictness: String,
    /// False when the candidate source has no fatality column.
    pub candidate_known_fatal: bool,
    pub engine_version: String,
    pub run_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_date_shapes() {
        let d = IncidentDate::parse("2020-01-05").unwrap();
        assert_eq!(d.calendar_day(), NaiveDate::from_ymd_opt(2020, 1, 5));

        let d = IncidentDate::parse("2020-01-05T13:45:00-07:00").unwrap();
        assert_eq!(d.to_string(), "2020-01-05T13:45:00");

        let d = IncidentDate::parse("2021-02").unwrap();
        assert!(d.is_period());
        assert_eq!(d.to_string(), "2021-02");
        if let IncidentDate::Period { end, .. } = d {
            assert_eq!(end.date(), NaiveDate::from_ymd_opt(2021, 2, 28).unwrap());
        }

        assert!(IncidentDate::parse("").is_none());
        assert!(IncidentDate::parse("last tuesday").is_none());
    }

    #[test]
    fn parse_ages() {
        assert_eq!(Age::parse("34"), Some(Age::Years(34)));
        assert_eq!(Age::parse("34.0"), Some(Age::Years(34)));
        assert_eq!(Age::parse("20-29"), Some(Age::Range { min: 20, max: 29 }));
        assert_eq!(Age::parse("unknown"), Some(Age::Text("UNKNOWN".into())));
        assert_eq!(Age::parse("  "), None);
    }

    #[test]
    fn key_value_truncates_date() {
        let dt = NaiveDate::from_ymd_opt(2020, 3, 1)
            .unwrap()
            .and_hms_opt(18, 30, 0)
            .unwrap();
        let r = Record::new(0, IncidentDate::Instant(dt));
        assert_eq!(r.key_value(&KeyField::Date).as_deref(), Some("2020-03-01"));
        assert_eq!(r.key_value(&KeyField::Race), None);
    }

    #[test]
    fn record_set_lookup_by_id() {
        let day = IncidentDate::parse("2020-01-01").unwrap();
        let set = RecordSet::new(
            "test",
            Schema::all(),
            vec![Record::new(4, day), Record::new(9, day)],
        );
        assert_eq!(set.get(RecordId(9)).map(|r| r.id), Some(RecordId(9)));
        assert!(set.get(RecordId(5)).is_none());
        let only = set.filtered(|r| r.id == RecordId(4));
        assert_eq!(only.len(), 1);
        assert!(only.contains(RecordId(4)));
    }
}
