//! Demographic comparison between a reference record and a set of candidates.
//!
//! Each of race, gender, and age is compared pairwise; the first applicable
//! rule decides the field:
//!
//! 1. both null, or equal after normalization: match
//! 2. reference is an unknown sentinel, candidate has a value: match, flagged `is_unknown`
//! 3. both values in one caller-supplied equivalence class: match
//! 4. race-only value agrees with the other side (`check_race_only`): match
//! 5. numeric ages: `|diff| <= max_age_diff`, or decade agreement with `inexact_age`
//! 6. age bracket vs point age: point within the bracket widened by `max_age_diff`
//! 7. two known, different races: mismatch, or `is_diff_race` with `allow_race_diff`
//! 8. two known, different genders: mismatch
//! 9. anything else: [`MatchError::UnhandledComparison`]
//!
//! A candidate with no usable value against a known reference is tolerated.

use crate::config::{ComparisonOptions, Taxonomy};
use crate::error::MatchError;
use crate::model::{Age, MatchResult, Record, Schema};
use crate::text::normalize_category;

/// Outcome of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldOutcome {
    Match,
    /// Reference unknown, candidate known.
    Unknown,
    /// Allowed difference (equivalence class, candidate-side unknown).
    Tolerated,
    RaceDiff,
    Mismatch,
}

/// Result of one value pair inside a multi-valued field.
enum PairOutcome {
    Decided(FieldOutcome),
    Tolerated,
    RaceDiff,
    NotEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Race,
    Gender,
}

impl Category {
    fn name(self) -> &'static str {
        match self {
            Self::Race => "race",
            Self::Gender => "gender",
        }
    }
}

/// Compares demographics under one taxonomy, restricted to fields both sources carry.
pub struct DemographicComparator<'a> {
    taxonomy: &'a Taxonomy,
    fields: Schema,
}

impl<'a> DemographicComparator<'a> {
    pub fn new(taxonomy: &'a Taxonomy, fields: Schema) -> Self {
        Self { taxonomy, fields }
    }

    /// One [`MatchResult`] per candidate, in candidate order.
    pub fn check_for_match(
        &self,
        candidates: &[&Record],
        reference: &Record,
        options: &ComparisonOptions,
    ) -> Result<Vec<MatchResult>, MatchError> {
        candidates
            .iter()
            .map(|c| {
                self.compare(c, reference, options)
                    .map_err(|e| e.with_records(c.id, reference.id))
            })
            .collect()
    }

    fn compare(
        &self,
        candidate: &Record,
        reference: &Record,
        options: &ComparisonOptions,
    ) -> Result<MatchResult, MatchError> {
        let mut result = MatchResult::MATCH;

        if options.zip_match {
            let same_zip = matches!(
                (&candidate.zip, &reference.zip),
                (Some(a), Some(b)) if a.trim() == b.trim()
            );
            if !same_zip {
                result.is_match = false;
            }
        }

        let mut outcomes = Vec::with_capacity(3);
        if self.fields.race {
            outcomes.push(self.compare_category(Category::Race, candidate, reference, options)?);
        }
        if self.fields.gender {
            outcomes.push(self.compare_category(Category::Gender, candidate, reference, options)?);
        }
        if self.fields.age {
            outcomes.push(self.compare_age(
                candidate.demographics.age.as_ref(),
                reference.demographics.age.as_ref(),
                options,
            )?);
        }

        for outcome in outcomes {
            match outcome {
                FieldOutcome::Match | FieldOutcome::Tolerated => {}
                FieldOutcome::Unknown => result.is_unknown = true,
                FieldOutcome::RaceDiff => result.is_diff_race = true,
                FieldOutcome::Mismatch => result.is_match = false,
            }
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Race + gender
    // -----------------------------------------------------------------------

    fn compare_category(
        &self,
        category: Category,
        candidate: &Record,
        reference: &Record,
        options: &ComparisonOptions,
    ) -> Result<FieldOutcome, MatchError> {
        let (cand_raw, ref_raw) = match category {
            Category::Race => (&candidate.demographics.race, &reference.demographics.race),
            Category::Gender => (&candidate.demographics.gender, &reference.demographics.gender),
        };
        let cand_values = self.split_values(category, cand_raw.as_deref());
        let ref_values = self.split_values(category, ref_raw.as_deref());
        let race_only = (
            self.normalize_opt(candidate.demographics.race_only.as_deref()),
            self.normalize_opt(reference.demographics.race_only.as_deref()),
        );

        let mut tolerated = false;
        let mut race_diff = false;
        let mut not_equal = false;
        for c in &cand_values {
            for r in &ref_values {
                match self.compare_pair(category, c.as_deref(), r.as_deref(), &race_only, options)? {
                    PairOutcome::Decided(outcome) => return Ok(outcome),
                    PairOutcome::Tolerated => tolerated = true,
                    PairOutcome::RaceDiff => race_diff = true,
                    PairOutcome::NotEqual => not_equal = true,
                }
            }
        }

        Ok(if tolerated {
            FieldOutcome::Tolerated
        } else if race_diff {
            FieldOutcome::RaceDiff
        } else if not_equal {
            FieldOutcome::Mismatch
        } else {
            // Every pair decides or sets a flag, so this means no pairs at all.
            FieldOutcome::Match
        })
    }

    fn compare_pair(
        &self,
        category: Category,
        cand: Option<&str>,
        reference: Option<&str>,
        race_only: &(Option<String>, Option<String>),
        options: &ComparisonOptions,
    ) -> Result<PairOutcome, MatchError> {
        // Rule 1
        if cand == reference {
            return Ok(PairOutcome::Decided(FieldOutcome::Match));
        }

        let cand_unknown = cand.map_or(true, |c| self.is_unknown(c));
        let ref_unknown = reference.map_or(true, |r| self.is_unknown(r));

        // Rule 2
        if ref_unknown {
            return Ok(PairOutcome::Decided(if cand_unknown {
                FieldOutcome::Match
            } else {
                FieldOutcome::Unknown
            }));
        }

        let (Some(c), Some(r)) = (cand, reference) else {
            // Candidate null, reference known.
            return Ok(PairOutcome::Tolerated);
        };

        // Rule 3
        let classes = match category {
            Category::Race => &options.allowed_replacements.race,
            Category::Gender => &options.allowed_replacements.gender,
        };
        let in_class = |v: &str, class: &Vec<String>| {
            class.iter().any(|x| self.normalize(x) == v)
        };
        if classes.iter().any(|class| in_class(c, class) && in_class(r, class)) {
            return Ok(PairOutcome::Tolerated);
        }

        // Rule 4
        if category == Category::Race && options.check_race_only {
            let (cand_ro, ref_ro) = race_only;
            let agrees = cand_ro.as_deref() == Some(r)
                || ref_ro.as_deref() == Some(c)
                || (cand_ro.is_some() && cand_ro == ref_ro);
            if agrees {
                return Ok(PairOutcome::Decided(FieldOutcome::Match));
            }
        }

        // Rules 7 + 8
        let known = match category {
            Category::Race => &self.taxonomy.races,
            Category::Gender => &self.taxonomy.genders,
        };
        let is_known = |v: &str| known.iter().any(|k| self.normalize(k) == v);
        if is_known(c) && is_known(r) {
            return Ok(match category {
                Category::Race if options.allow_race_diff => PairOutcome::RaceDiff,
                _ => PairOutcome::NotEqual,
            });
        }
        if cand_unknown {
            return Ok(PairOutcome::Tolerated);
        }

        // Rule 9
        Err(MatchError::UnhandledComparison {
            field: category.name(),
            candidate: c.to_string(),
            reference: r.to_string(),
            candidate_id: None,
            reference_id: None,
        })
    }

    /// Normalized values of a cell; race cells may hold a delimited list.
    fn split_values(&self, category: Category, raw: Option<&str>) -> Vec<Option<String>> {
        let Some(raw) = raw.filter(|v| !v.trim().is_empty()) else {
            return vec![None];
        };
        match category {
            Category::Race => raw
                .split(self.taxonomy.race_delimiter)
                .map(|v| self.normalize_opt(Some(v)))
                .collect(),
            Category::Gender => vec![self.normalize_opt(Some(raw))],
        }
    }

    fn normalize_opt(&self, value: Option<&str>) -> Option<String> {
        value
            .map(|v| self.normalize(v))
            .filter(|v| !v.is_empty())
    }

    fn normalize(&self, value: &str) -> String {
        let v = normalize_category(value);
        match self.taxonomy.always_replace.get(&v) {
            Some(replacement) => normalize_category(replacement),
            None => v,
        }
    }

    fn is_unknown(&self, value: &str) -> bool {
        self.taxonomy
            .unknown
            .iter()
            .any(|u| normalize_category(u) == value)
    }

    // -----------------------------------------------------------------------
    // Age
    // -----------------------------------------------------------------------

    fn compare_age(
        &self,
        cand: Option<&Age>,
        reference: Option<&Age>,
        options: &ComparisonOptions,
    ) -> Result<FieldOutcome, MatchError> {
        let unknown_text = |a: Option<&Age>| match a {
            None => true,
            Some(Age::Text(t)) => self.is_unknown(t),
            Some(_) => false,
        };
        // Rule 1
        if cand == reference {
            return Ok(FieldOutcome::Match);
        }
        // Rule 2
        if unknown_text(reference) {
            return Ok(if unknown_text(cand) {
                FieldOutcome::Match
            } else {
                FieldOutcome::Unknown
            });
        }
        if unknown_text(cand) {
            return Ok(FieldOutcome::Tolerated);
        }

        let max_diff = options.max_age_diff.unwrap_or(0);
        let unhandled = || MatchError::UnhandledComparison {
            field: "age",
            candidate: cand.map(|a| a.to_string()).unwrap_or_default(),
            reference: reference.map(|a| a.to_string()).unwrap_or_default(),
            candidate_id: None,
            reference_id: None,
        };
        let (Some(cand), Some(reference)) = (cand, reference) else {
            return Err(unhandled());
        };
        match (cand, reference) {
            // Rule 5
            (Age::Years(c), Age::Years(r)) => {
                let hit = if options.inexact_age {
                    *c == r / 10 * 10
                } else {
                    c.abs_diff(*r) <= max_diff
                };
                Ok(if hit { FieldOutcome::Match } else { FieldOutcome::Mismatch })
            }
            // Rule 6
            (Age::Range { min, max }, Age::Years(point)) | (Age::Years(point), Age::Range { min, max }) => {
                let low = min.saturating_sub(max_diff);
                let high = max + max_diff;
                Ok(if (low..=high).contains(point) {
                    FieldOutcome::Match
                } else {
                    FieldOutcome::Mismatch
                })
            }
            // Rule 9
            _ => Err(unhandled()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Replacements;
    use crate::model::{Demographics, IncidentDate};
    use proptest::prelude::*;

    fn person(id: usize, race: Option<&str>, gender: Option<&str>, age: Option<&str>) -> Record {
        let mut r = Record::new(id, IncidentDate::parse("2020-01-05").unwrap());
        r.demographics = Demographics {
            race: race.map(Into::into),
            race_only: None,
            gender: gender.map(Into::into),
            age: age.and_then(Age::parse),
        };
        r
    }

    fn check(
        cand: &Record,
        reference: &Record,
        options: &ComparisonOptions,
    ) -> Result<MatchResult, MatchError> {
        let taxonomy = Taxonomy::default();
        let cmp = DemographicComparator::new(&taxonomy, Schema::all());
        cmp.check_for_match(&[cand], reference, options).map(|v| v[0])
    }

    fn opts() -> ComparisonOptions {
        ComparisonOptions::default()
    }

    #[test]
    fn identical_records_match_without_flags() {
        let a = person(0, Some("BLACK"), Some("MALE"), Some("31"));
        let b = person(1, Some("black"), Some("Male"), Some("31"));
        assert_eq!(check(&a, &b, &opts()).unwrap(), MatchResult::MATCH);
    }

    #[test]
    fn age_range_widened_by_tolerance() {
        let reference = person(0, None, None, Some("20-29"));
        let cand = person(1, None, None, Some("32"));
        let wide = ComparisonOptions {
            max_age_diff: Some(3),
            ..opts()
        };
        assert!(check(&cand, &reference, &wide).unwrap().is_match);
        assert!(!check(&cand, &reference, &opts()).unwrap().is_match);
    }

    #[test]
    fn unknown_reference_flags_asymmetry() {
        let reference = person(0, Some("UNKNOWN"), Some("MALE"), Some("40"));
        let cand = person(1, Some("WHITE"), Some("MALE"), Some("40"));
        let r = check(&cand, &reference, &opts()).unwrap();
        assert!(r.is_match);
        assert!(r.is_unknown);
        assert!(!r.is_diff_race);
    }

    #[test]
    fn unknown_candidate_is_tolerated() {
        let reference = person(0, Some("WHITE"), Some("MALE"), Some("40"));
        let cand = person(1, Some("Unspecified"), None, None);
        assert_eq!(check(&cand, &reference, &opts()).unwrap(), MatchResult::MATCH);
    }

    #[test]
    fn equivalence_class_matches_silently() {
        let reference = person(0, Some("INDIGENOUS"), Some("MALE"), None);
        let cand = person(1, Some("HISPANIC / LATINO"), Some("MALE"), None);
        assert!(!check(&cand, &reference, &opts()).unwrap().is_match);
        let options = ComparisonOptions {
            allowed_replacements: Replacements {
                race: vec![vec!["HISPANIC / LATINO".into(), "INDIGENOUS".into()]],
                gender: Vec::new(),
            },
            ..opts()
        };
        assert_eq!(check(&cand, &reference, &options).unwrap(), MatchResult::MATCH);
    }

    #[test]
    fn asian_always_normalized() {
        let reference = person(0, Some("ASIAN / PACIFIC ISLANDER"), Some("FEMALE"), None);
        let cand = person(1, Some("Asian"), Some("FEMALE"), None);
        assert_eq!(check(&cand, &reference, &opts()).unwrap(), MatchResult::MATCH);
    }

    #[test]
    fn race_only_column_rescues_combined_difference() {
        let mut reference = person(0, Some("WHITE"), Some("MALE"), None);
        let mut cand = person(1, Some("HISPANIC / LATINO"), Some("MALE"), None);
        cand.demographics.race_only = Some("WHITE".into());
        reference.demographics.race_only = None;
        assert!(!check(&cand, &reference, &opts()).unwrap().is_match);
        let options = ComparisonOptions {
            check_race_only: true,
            ..opts()
        };
        assert!(check(&cand, &reference, &options).unwrap().is_match);
    }

    #[test]
    fn race_difference_allowed_is_flagged() {
        let reference = person(0, Some("WHITE"), Some("MALE"), Some("25"));
        let cand = person(1, Some("BLACK"), Some("MALE"), Some("25"));
        assert!(!check(&cand, &reference, &opts()).unwrap().is_match);
        let options = ComparisonOptions {
            allow_race_diff: true,
            ..opts()
        };
        let r = check(&cand, &reference, &options).unwrap();
        assert!(r.is_match);
        assert!(r.is_diff_race);
    }

    #[test]
    fn gender_difference_is_hard_mismatch() {
        let reference = person(0, Some("WHITE"), Some("MALE"), Some("25"));
        let cand = person(1, Some("WHITE"), Some("FEMALE"), Some("25"));
        let options = ComparisonOptions {
            allow_race_diff: true,
            ..opts()
        };
        assert!(!check(&cand, &reference, &options).unwrap().is_match);
    }

    #[test]
    fn inexact_age_uses_candidate_decade() {
        let reference = person(0, None, None, Some("34"));
        let cand = person(1, None, None, Some("30"));
        let options = ComparisonOptions {
            inexact_age: true,
            ..opts()
        };
        assert!(check(&cand, &reference, &options).unwrap().is_match);
        let cand = person(1, None, None, Some("40"));
        assert!(!check(&cand, &reference, &options).unwrap().is_match);
    }

    #[test]
    fn multi_valued_race_matches_any_pair() {
        let reference = person(0, Some("BLACK"), Some("MALE"), None);
        let cand = person(1, Some("WHITE, BLACK"), Some("MALE"), None);
        assert!(check(&cand, &reference, &opts()).unwrap().is_match);
    }

    #[test]
    fn zip_precondition() {
        let mut reference = person(0, Some("BLACK"), Some("MALE"), None);
        let mut cand = person(1, Some("BLACK"), Some("MALE"), None);
        reference.zip = Some("85003".into());
        cand.zip = Some("85004".into());
        let options = ComparisonOptions {
            zip_match: true,
            ..opts()
        };
        assert!(!check(&cand, &reference, &options).unwrap().is_match);
        cand.zip = Some("85003".into());
        assert!(check(&cand, &reference, &options).unwrap().is_match);
    }

    #[test]
    fn unanticipated_values_fail_fast() {
        let reference = person(3, Some("WHITE"), Some("MALE"), None);
        let cand = person(8, Some("WHITE"), Some("NOT A GENDER"), None);
        let err = check(&cand, &reference, &opts()).unwrap_err();
        match err {
            MatchError::UnhandledComparison {
                field,
                candidate_id,
                reference_id,
                ..
            } => {
                assert_eq!(field, "gender");
                assert_eq!(candidate_id.map(|id| id.0), Some(8));
                assert_eq!(reference_id.map(|id| id.0), Some(3));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn two_brackets_that_differ_are_unhandled() {
        let reference = person(0, None, None, Some("20-29"));
        let cand = person(1, None, None, Some("30-39"));
        assert!(check(&cand, &reference, &opts()).is_err());
    }

    #[test]
    fn fields_missing_from_either_schema_are_skipped() {
        let taxonomy = Taxonomy::default();
        let fields = Schema {
            gender: false,
            ..Schema::all()
        };
        let cmp = DemographicComparator::new(&taxonomy, fields);
        let reference = person(0, Some("WHITE"), Some("MALE"), None);
        let cand = person(1, Some("WHITE"), Some("FEMALE"), None);
        let r = cmp.check_for_match(&[&cand], &reference, &opts()).unwrap();
        assert!(r[0].is_match);
    }

    proptest! {
        #[test]
        fn identical_demographics_always_match(
            race in prop::sample::select(vec!["WHITE", "BLACK", "ASIAN", "HISPANIC / LATINO", "UNKNOWN"]),
            gender in prop::sample::select(vec!["MALE", "FEMALE"]),
            age in 0u32..100,
        ) {
            let age = age.to_string();
            let a = person(0, Some(race), Some(gender), Some(&age));
            let b = person(1, Some(race), Some(gender), Some(&age));
            prop_assert_eq!(check(&a, &b, &opts()).unwrap(), MatchResult::MATCH);
        }
    }
}
