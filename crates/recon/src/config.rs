use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::MatchError;
use crate::model::KeyField;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// A full run: where the two datasets come from plus the matching tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconConfig {
    pub name: String,
    pub canonical: SourceConfig,
    pub candidate: SourceConfig,
    #[serde(default)]
    pub agency: Option<AgencyConfig>,
    #[serde(default)]
    pub clean: CleanConfig,
    #[serde(flatten)]
    pub matching: MatchConfig,
}

/// Everything the orchestrator needs besides the records themselves.
#[derive(Debug, Clone, Deserialize)]
pub struct MatchConfig {
    #[serde(default)]
    pub strictness: Strictness,
    /// City or region name passed to the address parser as a hint.
    #[serde(default)]
    pub location: Option<String>,
    /// State of the agency. Required by the cross-agency pass.
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub taxonomy: Taxonomy,
    #[serde(default = "default_date_first")]
    pub date_first: Vec<DateStage>,
    #[serde(default)]
    pub zip_pass: ZipPassConfig,
    #[serde(default)]
    pub cross_agency: CrossAgencyConfig,
    #[serde(default)]
    pub exceptions: Vec<AmbiguityException>,
    /// Key used to decide whether rows describe the same incident. Chosen
    /// from the candidate columns when unset.
    #[serde(default)]
    pub duplicate_key: Option<Vec<KeyField>>,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            strictness: Strictness::default(),
            location: None,
            state: None,
            thresholds: Thresholds::default(),
            taxonomy: Taxonomy::default(),
            date_first: default_date_first(),
            zip_pass: ZipPassConfig::default(),
            cross_agency: CrossAgencyConfig::default(),
            exceptions: Vec::new(),
            duplicate_key: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Strictness
// ---------------------------------------------------------------------------

/// Whether unanticipated data shapes abort the run or degrade to "no match".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    #[default]
    Strict,
    Lenient,
}

impl Strictness {
    pub fn is_strict(self) -> bool {
        self == Self::Strict
    }
}

impl std::fmt::Display for Strictness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::Lenient => write!(f, "lenient"),
        }
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub file: String,
    pub columns: ColumnMapping,
}

/// Column names per logical field. Every field accepts one name or a list of
/// aliases; the first alias present in the header wins.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ColumnMapping {
    pub date: Aliases,
    #[serde(default)]
    pub agency: Aliases,
    #[serde(default)]
    pub state: Aliases,
    #[serde(default)]
    pub address: Aliases,
    #[serde(default)]
    pub zip: Aliases,
    #[serde(default)]
    pub name: Aliases,
    #[serde(default)]
    pub race: Aliases,
    #[serde(default)]
    pub race_only: Aliases,
    #[serde(default)]
    pub gender: Aliases,
    #[serde(default)]
    pub age: Aliases,
    #[serde(default)]
    pub fatal: Aliases,
    /// Subject injury; read for fatality when `fatal` is unmapped or absent.
    #[serde(default)]
    pub injury: Aliases,
    #[serde(default)]
    pub role: Aliases,
    #[serde(default)]
    pub county: Aliases,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "OneOrMany")]
pub struct Aliases(pub Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl From<OneOrMany> for Aliases {
    fn from(value: OneOrMany) -> Self {
        match value {
            OneOrMany::One(s) => Aliases(vec![s]),
            OneOrMany::Many(v) => Aliases(v),
        }
    }
}

impl Aliases {
    /// Index of the first alias present in `headers`.
    pub fn resolve(&self, headers: &[String]) -> Option<usize> {
        self.0
            .iter()
            .find_map(|alias| headers.iter().position(|h| h == alias))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Agency + cleaning
// ---------------------------------------------------------------------------

/// Narrows the canonical table to one agency before matching.
#[derive(Debug, Clone, Deserialize)]
pub struct AgencyConfig {
    /// Full agency name, e.g. "Phoenix Police Department".
    pub name: String,
    /// Include other rows from the same county.
    #[serde(default)]
    pub merge_county: bool,
    /// Other agency names whose rows belong to this agency's data.
    #[serde(default)]
    pub cross_references: Vec<String>,
    /// Require the agency cell to equal the name instead of starting with it.
    #[serde(default)]
    pub exact: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanConfig {
    #[serde(default)]
    pub min_date: Option<NaiveDate>,
    #[serde(default)]
    pub include_unknown_fatal: bool,
    #[serde(default)]
    pub keep_self_inflicted: bool,
    /// Apply cleaning to the candidate set (the canonical set is assumed clean).
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CleanConfig {
    fn default() -> Self {
        Self {
            min_date: None,
            include_unknown_fatal: false,
            keep_self_inflicted: false,
            enabled: true,
        }
    }
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Tuned constants. Calibrated against real datasets; change only with new evidence.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Thresholds {
    /// Token-sort similarity (0–100) that makes a name match on its own.
    pub name_similarity: f64,
    /// Weak similarity accepted when enough name tokens are shared.
    pub name_similarity_weak: f64,
    pub name_min_shared_tokens: usize,
    pub name_date_window_days: i64,

    /// Demographics-first: window that singles out one of several hits.
    pub demo_close_days: i64,
    /// Demographics-first without addresses: hits all this far away are skipped.
    pub demo_far_days_no_address: i64,
    /// Demographics-first with addresses: street hits all this far away are skipped.
    pub demo_far_days_with_address: i64,
    /// Single hit without addresses: accepted outright within this window.
    pub demo_single_days: i64,
    /// Single hit without addresses: accepted with an equal zip within this window.
    pub demo_single_zip_days: i64,
    /// Single hit without addresses: skipped when at least this far away.
    pub demo_single_far_days: i64,
    /// Single hit with addresses: accepted outright within this window.
    pub demo_very_close_days: i64,
    /// Single hit with addresses: month-typo band, `[min, max]` days apart.
    pub demo_month_typo_min_days: i64,
    pub demo_month_typo_max_days: i64,
    /// Single street hit closer than this that no rule accepted is a conflict.
    pub demo_conflict_days: i64,

    pub address_window_days: i64,

    pub zip_window_days: i64,
    pub zip_match_days: i64,
    pub zip_max_age_diff: u32,

    pub cross_agency_window_days: i64,
    pub cross_agency_match_days: i64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            name_similarity: 70.0,
            name_similarity_weak: 0.6,
            name_min_shared_tokens: 2,
            name_date_window_days: 1,
            demo_close_days: 3,
            demo_far_days_no_address: 9,
            demo_far_days_with_address: 300,
            demo_single_days: 2,
            demo_single_zip_days: 11,
            demo_single_far_days: 30,
            demo_very_close_days: 1,
            demo_month_typo_min_days: 30,
            demo_month_typo_max_days: 31,
            demo_conflict_days: 32,
            address_window_days: 3,
            zip_window_days: 5,
            zip_match_days: 4,
            zip_max_age_diff: 5,
            cross_agency_window_days: 30,
            cross_agency_match_days: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Taxonomy
// ---------------------------------------------------------------------------

/// Demographic vocabularies. Values are compared after `normalize_category`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Taxonomy {
    /// Specific race categories; two different ones are a real difference.
    pub races: Vec<String>,
    /// Specific gender categories; two different ones are a hard mismatch.
    pub genders: Vec<String>,
    /// Sentinels meaning "not recorded".
    pub unknown: Vec<String>,
    /// Always rewritten before comparing.
    pub always_replace: BTreeMap<String, String>,
    /// Separator for cells holding several race values.
    pub race_delimiter: char,
    pub female: String,
    pub male: String,
}

impl Default for Taxonomy {
    fn default() -> Self {
        let s = |v: &[&str]| v.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        Self {
            races: s(&[
                "ASIAN / PACIFIC ISLANDER",
                "ASIAN",
                "BLACK",
                "HAWAIIAN / PACIFIC ISLANDER",
                "HISPANIC / LATINO",
                "INDIGENOUS",
                "MIDDLE EASTERN",
                "SOUTH ASIAN",
                "WHITE",
            ]),
            genders: s(&[
                "MALE",
                "FEMALE",
                "TRANSGENDER MAN",
                "TRANSGENDER WOMAN",
                "TRANSGENDER",
                "GENDER NONCONFORMING",
            ]),
            unknown: s(&["UNKNOWN", "UNSPECIFIED", "OTHER", "PENDING RELEASE"]),
            always_replace: BTreeMap::from([(
                "ASIAN".to_string(),
                "ASIAN / PACIFIC ISLANDER".to_string(),
            )]),
            race_delimiter: ',',
            female: "FEMALE".into(),
            male: "MALE".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Comparison options + stages
// ---------------------------------------------------------------------------

/// Groups of values that may be interchanged without failing a match.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Replacements {
    pub race: Vec<Vec<String>>,
    pub gender: Vec<Vec<String>>,
}

/// Knobs of one demographic comparison.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComparisonOptions {
    /// Allowed age difference. Stages that set it record their matches as age differences.
    pub max_age_diff: Option<u32>,
    pub allowed_replacements: Replacements,
    /// Compare race-only columns when the combined race/ethnicity differs.
    pub check_race_only: bool,
    /// Candidate age is a decade estimate (30 matches 30–39).
    pub inexact_age: bool,
    /// Different known races still match, flagged `is_diff_race`.
    pub allow_race_diff: bool,
    /// Zip codes must be equal.
    pub zip_match: bool,
}

/// One round of the date-first pass.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DateStage {
    #[serde(default)]
    pub max_diff_days: Option<i64>,
    #[serde(default)]
    pub allow_month_error: bool,
    #[serde(default)]
    pub compare: ComparisonOptions,
}

fn default_date_first() -> Vec<DateStage> {
    let race_only = ComparisonOptions {
        check_race_only: true,
        ..Default::default()
    };
    vec![
        DateStage::default(),
        DateStage {
            compare: race_only.clone(),
            ..Default::default()
        },
        DateStage {
            allow_month_error: true,
            compare: race_only.clone(),
            ..Default::default()
        },
        DateStage {
            max_diff_days: Some(1),
            compare: race_only.clone(),
            ..Default::default()
        },
        DateStage {
            compare: ComparisonOptions {
                max_age_diff: Some(2),
                check_race_only: true,
                ..Default::default()
            },
            ..Default::default()
        },
        DateStage {
            compare: ComparisonOptions {
                allow_race_diff: true,
                check_race_only: true,
                ..Default::default()
            },
            ..Default::default()
        },
        DateStage {
            compare: ComparisonOptions {
                inexact_age: true,
                ..Default::default()
            },
            ..Default::default()
        },
    ]
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ZipPassConfig {
    pub allowed_replacements: Replacements,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossAgencyKey {
    Address,
    Zip,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrossAgencyConfig {
    pub enabled: bool,
    /// Search the other agencies' rows by subject name before the location keys.
    pub by_name: bool,
    /// Corroborating location evidence, tried in order.
    pub match_types: Vec<CrossAgencyKey>,
    pub allowed_replacements: Replacements,
}

impl Default for CrossAgencyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            by_name: false,
            match_types: vec![CrossAgencyKey::Address, CrossAgencyKey::Zip],
            allowed_replacements: Replacements {
                race: vec![vec!["ASIAN".into(), "ASIAN / PACIFIC ISLANDER".into()]],
                gender: Vec::new(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Known exceptions
// ---------------------------------------------------------------------------

/// A documented dataset idiosyncrasy under which an ambiguous date-first hit is
/// accepted as one incident recorded several times.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AmbiguityException {
    /// Applies only when the run's location equals this value.
    #[serde(default)]
    pub location: Option<String>,
    pub field: KeyField,
    /// Substring that must appear in `field` of at least one ambiguous row.
    pub contains: String,
    #[serde(default)]
    pub note: Option<String>,
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl ReconConfig {
    pub fn from_toml(input: &str) -> Result<Self, MatchError> {
        let config: ReconConfig =
            toml::from_str(input).map_err(|e| MatchError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MatchError> {
        for (label, source) in [("canonical", &self.canonical), ("candidate", &self.candidate)] {
            if source.columns.date.is_empty() {
                return Err(MatchError::ConfigValidation(format!(
                    "{label}: a date column is required"
                )));
            }
        }
        if self.agency.is_some() && self.matching.state.is_none() {
            return Err(MatchError::ConfigValidation(
                "[agency] requires 'state'".into(),
            ));
        }
        if self.matching.cross_agency.enabled && self.agency.is_none() {
            return Err(MatchError::ConfigValidation(
                "cross_agency requires an [agency] section".into(),
            ));
        }
        self.matching.validate()
    }
}

impl MatchConfig {
    pub fn validate(&self) -> Result<(), MatchError> {
        let t = &self.thresholds;
        let percent = 0.0..=100.0;
        if !percent.contains(&t.name_similarity) || !percent.contains(&t.name_similarity_weak) {
            return Err(MatchError::ConfigValidation(
                "name similarity thresholds must be within 0-100".into(),
            ));
        }
        let windows = [
            ("name_date_window_days", t.name_date_window_days),
            ("demo_close_days", t.demo_close_days),
            ("demo_far_days_no_address", t.demo_far_days_no_address),
            ("demo_far_days_with_address", t.demo_far_days_with_address),
            ("demo_single_days", t.demo_single_days),
            ("demo_single_zip_days", t.demo_single_zip_days),
            ("demo_single_far_days", t.demo_single_far_days),
            ("demo_very_close_days", t.demo_very_close_days),
            ("demo_month_typo_min_days", t.demo_month_typo_min_days),
            ("demo_month_typo_max_days", t.demo_month_typo_max_days),
            ("demo_conflict_days", t.demo_conflict_days),
            ("address_window_days", t.address_window_days),
            ("zip_window_days", t.zip_window_days),
            ("zip_match_days", t.zip_match_days),
            ("cross_agency_window_days", t.cross_agency_window_days),
            ("cross_agency_match_days", t.cross_agency_match_days),
        ];
        if let Some((name, _)) = windows.iter().find(|(_, v)| *v < 0) {
            return Err(MatchError::ConfigValidation(format!(
                "{name} must not be negative"
            )));
        }
        if t.demo_month_typo_min_days > t.demo_month_typo_max_days {
            return Err(MatchError::ConfigValidation(
                "demo_month_typo_min_days exceeds demo_month_typo_max_days".into(),
            ));
        }
        if t.zip_match_days > t.zip_window_days {
            return Err(MatchError::ConfigValidation(
                "zip_match_days exceeds zip_window_days".into(),
            ));
        }
        for (i, stage) in self.date_first.iter().enumerate() {
            if stage.max_diff_days.is_some_and(|d| d < 0) {
                return Err(MatchError::ConfigValidation(format!(
                    "date_first[{i}]: max_diff_days must not be negative"
                )));
            }
        }
        for exc in &self.exceptions {
            if exc.contains.trim().is_empty() {
                return Err(MatchError::ConfigValidation(
                    "exception 'contains' must not be empty".into(),
                ));
            }
        }
        if self.cross_agency.enabled && self.state.is_none() {
            return Err(MatchError::ConfigValidation(
                "cross_agency requires 'state'".into(),
            ));
        }
        if self.duplicate_key.as_ref().is_some_and(Vec::is_empty) {
            return Err(MatchError::ConfigValidation(
                "duplicate_key must name at least one field".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
name = "Example PD"
location = "Example City"
state = "AZ"

[canonical]
file = "mpv.csv"
[canonical.columns]
date = "date"
agency = "agency"
address = "street_address"
race = ["race_ethnicity", "race"]
gender = "gender"
age = "age"

[candidate]
file = "opd.csv"
[candidate.columns]
date = ["DATE", "DATETIME"]
address = "ADDRESS"
race = "RE_GROUP_SUBJECT"
gender = "GENDER_SUBJECT"
age = ["AGE_SUBJECT", "AGE_RANGE_SUBJECT"]
"#;

    #[test]
    fn parse_minimal_with_defaults() {
        let config = ReconConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.name, "Example PD");
        assert_eq!(config.matching.strictness, Strictness::Strict);
        assert_eq!(config.matching.location.as_deref(), Some("Example City"));
        assert_eq!(config.matching.thresholds.name_similarity, 70.0);
        assert_eq!(config.matching.thresholds.zip_window_days, 5);
        assert_eq!(config.matching.date_first.len(), 7);
        assert!(!config.matching.cross_agency.enabled);
        assert_eq!(
            config.canonical.columns.race,
            Aliases(vec!["race_ethnicity".into(), "race".into()])
        );
        assert_eq!(config.candidate.columns.date.0.len(), 2);
        assert!(config.clean.enabled);
    }

    #[test]
    fn parse_overrides_and_stages() {
        let input = format!(
            r#"strictness = "lenient"
{MINIMAL}
[thresholds]
address_window_days = 4

[[date_first]]
max_diff_days = 1
[date_first.compare]
max_age_diff = 3
allowed_replacements = {{ race = [["HISPANIC / LATINO", "INDIGENOUS"]] }}

[[exceptions]]
location = "Example City"
field = {{ extra = "HUNDRED_BLOCK" }}
contains = "65XX S 3RD ST"
"#
        );
        let config = ReconConfig::from_toml(&input).unwrap();
        assert_eq!(config.matching.strictness, Strictness::Lenient);
        assert_eq!(config.matching.thresholds.address_window_days, 4);
        assert_eq!(config.matching.thresholds.zip_window_days, 5);
        assert_eq!(config.matching.date_first.len(), 1);
        let stage = &config.matching.date_first[0];
        assert_eq!(stage.max_diff_days, Some(1));
        assert_eq!(stage.compare.max_age_diff, Some(3));
        assert_eq!(stage.compare.allowed_replacements.race.len(), 1);
        let exc = &config.matching.exceptions[0];
        assert_eq!(exc.field, KeyField::Extra("HUNDRED_BLOCK".into()));
    }

    #[test]
    fn reject_unknown_replacement_field() {
        let input = format!(
            r#"{MINIMAL}
[[date_first]]
[date_first.compare]
allowed_replacements = {{ age = [["20", "21"]] }}
"#
        );
        assert!(ReconConfig::from_toml(&input).is_err());
    }

    #[test]
    fn reject_missing_date_column() {
        let input = MINIMAL.replace("date = \"date\"\n", "date = []\n");
        let err = ReconConfig::from_toml(&input).unwrap_err();
        assert!(err.to_string().contains("canonical: a date column is required"));
    }

    #[test]
    fn reject_inverted_month_typo_band() {
        let input = format!(
            "{MINIMAL}\n[thresholds]\ndemo_month_typo_min_days = 40\n"
        );
        let err = ReconConfig::from_toml(&input).unwrap_err();
        assert!(err.to_string().contains("demo_month_typo_min_days"));
    }

    #[test]
    fn cross_agency_needs_agency_section() {
        let input = format!("{MINIMAL}\n[cross_agency]\nenabled = true\n");
        let err = ReconConfig::from_toml(&input).unwrap_err();
        assert!(err.to_string().contains("[agency]"));
    }

    #[test]
    fn aliases_resolve_first_present() {
        let aliases = Aliases(vec!["AGE_SUBJECT".into(), "AGE_RANGE_SUBJECT".into()]);
        let headers = vec!["DATE".to_string(), "AGE_RANGE_SUBJECT".to_string()];
        assert_eq!(aliases.resolve(&headers), Some(1));
        assert_eq!(Aliases::default().resolve(&headers), None);
    }
}
