//! The matching cascade.
//!
//! [`Orchestrator::run`] applies six passes in a fixed order: name similarity,
//! date-first (one round per configured [`DateStage`]), demographics-first,
//! address-first, zip+date, and the optional cross-agency pass. Each pass sees
//! the records neither it nor an earlier pass has claimed.
//!
//! Input order is load-bearing. Canonical-driven passes visit canonical
//! records in input order; candidate-driven passes visit candidates in input
//! order; when a lenient run resolves a tie greedily, the earliest row wins.
//! Reordering either set can change the outcome.

use std::collections::{BTreeMap, HashSet};

use chrono::Duration;

use crate::address::{AddressMatcher, AddressParser, StreetMatchOptions};
use crate::agency::filter_by_state;
use crate::config::{ComparisonOptions, CrossAgencyKey, DateStage, MatchConfig};
use crate::dates::{self, DateMatcher, DateWindow};
use crate::dedup::{drop_duplicates, duplicate_check_key, DedupOptions};
use crate::demographics::DemographicComparator;
use crate::diagnostics::{DiagnosticEvent, DiagnosticsSink};
use crate::error::MatchError;
use crate::model::{
    Correction, CorrectionKind, CrossAgencyMatch, KeyField, MatchOutcome, MatchResult, Record,
    RecordId, RecordSet, Schema,
};
use crate::text::{clean_name, normalize_category, shared_tokens, split_words, token_sort_ratio};

pub const PASS_NAME: &str = "name";
pub const PASS_DATE_FIRST: &str = "date_first";
pub const PASS_DEMOGRAPHICS_FIRST: &str = "demographics_first";
pub const PASS_ADDRESS_FIRST: &str = "address_first";
pub const PASS_ZIP_DATE: &str = "zip_date";
pub const PASS_CROSS_AGENCY: &str = "cross_agency";

/// Canonical names that stand in for a withheld subject name.
const WITHHELD_NAMES: &[&str] = &["", "NAME WITHHELD"];

/// Runs the pass cascade for one agency.
pub struct Orchestrator<'a> {
    config: &'a MatchConfig,
    parser: &'a dyn AddressParser,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a MatchConfig, parser: &'a dyn AddressParser) -> Self {
        Self { config, parser }
    }

    /// Match `candidates` against `canonical`, both already filtered to one
    /// agency and period. `full_canonical` is the unfiltered canonical table
    /// the cross-agency pass searches; without it that pass is skipped.
    ///
    /// Neither set is modified. Strict runs stop at the first ambiguity or
    /// unresolved conflict; lenient runs skip the record and report it to `sink`.
    pub fn run(
        &self,
        canonical: &RecordSet,
        candidates: &RecordSet,
        full_canonical: Option<&RecordSet>,
        sink: &mut dyn DiagnosticsSink,
    ) -> Result<MatchOutcome, MatchError> {
        tracing::info!(
            canonical = canonical.len(),
            candidates = candidates.len(),
            strictness = %self.config.strictness,
            "matching started"
        );
        let mut run = Run::new(self.config, self.parser, canonical, candidates, sink);

        run.name_pass()?;
        for stage in &self.config.date_first {
            run.date_first(stage)?;
        }
        run.demographics_first()?;
        run.address_first()?;
        run.zip_date()?;

        if self.config.cross_agency.enabled {
            match (full_canonical, self.config.state.as_deref()) {
                (Some(full), Some(state)) => run.cross_agency(full, state)?,
                _ => tracing::warn!(
                    "cross-agency pass needs the full canonical table and a state; skipped"
                ),
            }
        }

        let outcome = run.finish();
        tracing::info!(
            matched = outcome.matched_count(),
            canonical_left = outcome.remaining_canonical.len(),
            candidates_left = outcome.remaining_candidates.len(),
            "matching finished"
        );
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ZipCompare {
    Equal,
    /// Both sources carry zip codes, but these two differ or one is blank.
    Different,
    /// At least one source has no zip column.
    Unavailable,
}

/// Table the driving record of a street comparison comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Canonical,
    Candidate,
}

/// Immutable input snapshots plus the evolving exclusion sets.
struct Run<'r, 's> {
    config: &'r MatchConfig,
    canonical: &'r RecordSet,
    candidates: &'r RecordSet,
    fields: Schema,
    duplicate_key: Vec<KeyField>,
    comparator: DemographicComparator<'r>,
    addresses: AddressMatcher<'r>,
    sink: &'s mut dyn DiagnosticsSink,

    matched: HashSet<RecordId>,
    consumed: HashSet<RecordId>,
    matched_by: BTreeMap<RecordId, &'static str>,
    corrections: BTreeMap<RecordId, Correction>,
    age_diff: BTreeMap<RecordId, Correction>,
    cross_agency: Vec<CrossAgencyMatch>,
    ambiguous_skipped: usize,
}

impl<'r, 's> Run<'r, 's> {
    fn new(
        config: &'r MatchConfig,
        parser: &'r dyn AddressParser,
        canonical: &'r RecordSet,
        candidates: &'r RecordSet,
        sink: &'s mut dyn DiagnosticsSink,
    ) -> Self {
        let fields = canonical.schema.intersect(&candidates.schema);
        Self {
            config,
            canonical,
            candidates,
            fields,
            duplicate_key: config
                .duplicate_key
                .clone()
                .unwrap_or_else(|| duplicate_check_key(candidates)),
            comparator: DemographicComparator::new(&config.taxonomy, fields),
            addresses: AddressMatcher::new(parser, config.location.as_deref()),
            sink,
            matched: HashSet::new(),
            consumed: HashSet::new(),
            matched_by: BTreeMap::new(),
            corrections: BTreeMap::new(),
            age_diff: BTreeMap::new(),
            cross_agency: Vec::new(),
            ambiguous_skipped: 0,
        }
    }

    fn strict(&self) -> bool {
        self.config.strictness.is_strict()
    }

    fn unmatched_canonical(&self) -> Vec<&'r Record> {
        let canonical: &'r RecordSet = self.canonical;
        canonical
            .records
            .iter()
            .filter(|r| !self.matched.contains(&r.id))
            .collect()
    }

    fn remaining_candidates(&self) -> Vec<&'r Record> {
        let candidates: &'r RecordSet = self.candidates;
        candidates
            .records
            .iter()
            .filter(|r| !self.consumed.contains(&r.id))
            .collect()
    }

    fn consume(&mut self, pass: &'static str, canonical: &Record, candidate: &Record) {
        self.matched.insert(canonical.id);
        self.consumed.insert(candidate.id);
        self.matched_by.insert(canonical.id, pass);
        self.sink.emit(DiagnosticEvent::Matched {
            pass,
            canonical: canonical.id,
            candidate: candidate.id,
        });
    }

    /// Several hits and nothing to choose between them.
    fn ambiguous(
        &mut self,
        pass: &'static str,
        record: RecordId,
        candidates: Vec<RecordId>,
    ) -> Result<(), MatchError> {
        if self.strict() {
            return Err(MatchError::AmbiguousMatch {
                pass,
                record,
                candidates,
            });
        }
        self.ambiguous_skipped += 1;
        self.sink.emit(DiagnosticEvent::AmbiguousMatch {
            pass,
            record,
            candidates,
            accepted: false,
        });
        Ok(())
    }

    fn unresolved(
        &mut self,
        pass: &'static str,
        record: RecordId,
        reason: impl Into<String>,
    ) -> Result<(), MatchError> {
        let reason = reason.into();
        if self.strict() {
            return Err(MatchError::UnresolvedMatch {
                pass,
                record,
                reason,
            });
        }
        self.sink
            .emit(DiagnosticEvent::Unresolved { pass, record, reason });
        Ok(())
    }

    fn street_options(&self) -> StreetMatchOptions {
        StreetMatchOptions::new(self.config.strictness)
    }

    /// Street match of `reference` against `others`, reporting tolerated parse failures.
    /// `side` names the table `reference` comes from, so failures carry the pair's ids.
    fn street_match(
        &mut self,
        pass: &'static str,
        side: Side,
        reference: &Record,
        others: &[&Record],
        options: StreetMatchOptions,
    ) -> Result<Vec<bool>, MatchError> {
        let mut hits = Vec::with_capacity(others.len());
        let mut unparsed: Vec<String> = Vec::new();
        for other in others {
            let report = self
                .addresses
                .street_match_report(
                    reference.address.as_deref(),
                    &[other.address.as_deref()],
                    options,
                )
                .map_err(|e| match side {
                    Side::Canonical => e.with_records(other.id, reference.id),
                    Side::Candidate => e.with_records(reference.id, other.id),
                })?;
            hits.extend(report.hits);
            for address in report.unparsed {
                if !unparsed.contains(&address) {
                    unparsed.push(address);
                }
            }
        }
        for address in unparsed {
            self.sink.emit(DiagnosticEvent::ParseFailure { pass, address });
        }
        Ok(hits)
    }

    fn zip_compare(&self, a: &Record, b: &Record) -> ZipCompare {
        if !self.fields.zip {
            return ZipCompare::Unavailable;
        }
        match (a.zip.as_deref().map(str::trim), b.zip.as_deref().map(str::trim)) {
            (Some(x), Some(y)) if !x.is_empty() && x == y => ZipCompare::Equal,
            _ => ZipCompare::Different,
        }
    }

    /// Remember demographic discrepancies of a date-first match. A canonical
    /// record takes at most one age difference.
    fn record_corrections(
        &mut self,
        pass: &'static str,
        canonical: &Record,
        candidate: &Record,
        result: MatchResult,
        options: &ComparisonOptions,
    ) -> Result<(), MatchError> {
        if result.is_unknown {
            self.sink.emit(DiagnosticEvent::UnknownAsymmetry {
                canonical: canonical.id,
                candidate: candidate.id,
            });
        }
        if result.is_diff_race {
            self.sink.emit(DiagnosticEvent::RaceDiff {
                canonical: canonical.id,
                candidate: candidate.id,
            });
        }
        let kind = if result.is_diff_race {
            Some(CorrectionKind::RaceDifference)
        } else if result.is_unknown {
            Some(CorrectionKind::UnknownDemographic)
        } else {
            None
        };
        if let Some(kind) = kind {
            self.corrections
                .insert(canonical.id, correction(pass, canonical, candidate, kind));
        }
        if options.max_age_diff.is_some() {
            if let Some(previous) = self.age_diff.get(&canonical.id) {
                let age = |r: &Record| {
                    r.demographics.age.as_ref().map(|a| a.to_string()).unwrap_or_default()
                };
                return Err(MatchError::UnhandledComparison {
                    field: "age",
                    candidate: age(candidate),
                    reference: age(&previous.candidate),
                    candidate_id: Some(candidate.id),
                    reference_id: Some(canonical.id),
                });
            }
            self.age_diff.insert(
                canonical.id,
                correction(pass, canonical, candidate, CorrectionKind::AgeDifference),
            );
        }
        Ok(())
    }

    fn finish(self) -> MatchOutcome {
        let remaining_canonical = self
            .canonical
            .records
            .iter()
            .filter(|r| !self.matched.contains(&r.id))
            .cloned()
            .collect();
        let remaining_candidates = self
            .candidates
            .records
            .iter()
            .filter(|r| !self.consumed.contains(&r.id))
            .cloned()
            .collect();
        let matched = self
            .canonical
            .records
            .iter()
            .map(|r| (r.id, self.matched.contains(&r.id)))
            .collect();
        MatchOutcome {
            remaining_canonical,
            remaining_candidates,
            matched,
            corrections: self.corrections,
            age_diff: self.age_diff,
            cross_agency: self.cross_agency,
            matched_by: self.matched_by,
            ambiguous_skipped: self.ambiguous_skipped,
        }
    }

    // -----------------------------------------------------------------------
    // Pass 1: names
    // -----------------------------------------------------------------------

    /// Fuzzy subject-name match corroborated by a close date.
    fn name_pass(&mut self) -> Result<(), MatchError> {
        if !self.fields.name {
            return Ok(());
        }
        for candidate in self.remaining_candidates() {
            let pool = self.unmatched_canonical();
            if pool.is_empty() {
                break;
            }
            if let Some(canonical) = self.name_hit(PASS_NAME, candidate, &pool)? {
                self.consume(PASS_NAME, canonical, candidate);
            }
        }
        Ok(())
    }

    /// The record in `pool` naming the same subject as `candidate`, if any.
    fn name_hit<'p>(
        &mut self,
        pass: &'static str,
        candidate: &Record,
        pool: &[&'p Record],
    ) -> Result<Option<&'p Record>, MatchError> {
        let config = self.config;
        let t = &config.thresholds;
        let window = Duration::days(t.name_date_window_days);

        let Some(name) = candidate.name.as_deref().map(clean_name) else {
            return Ok(None);
        };
        if name.is_empty() {
            return Ok(None);
        }

        let scored: Vec<(&'p Record, f64)> = pool
            .iter()
            .filter_map(|c| {
                let other = clean_name(c.name.as_deref()?);
                let score = token_sort_ratio(&name, &other);
                let strong = score >= t.name_similarity;
                let weak = score > t.name_similarity_weak
                    && shared_tokens(&name, &other) >= t.name_min_shared_tokens;
                (strong || weak).then_some((*c, score))
            })
            .collect();

        if !scored.is_empty() {
            let mut dated = Vec::new();
            for (c, _) in &scored {
                if near(candidate, c, window)? || dates::month_typo(&c.date, &candidate.date) {
                    dated.push(*c);
                }
            }
            return match dated.as_slice() {
                [] if self.strict() => Err(MatchError::UnresolvedMatch {
                    pass,
                    record: candidate.id,
                    reason: format!(
                        "name matches {} but the dates do not",
                        listed(scored.iter().map(|(c, _)| *c))
                    ),
                }),
                [] => {
                    // Same name, different date: trust the name.
                    let mut best = scored[0];
                    for &(c, score) in &scored[1..] {
                        if score > best.1 {
                            best = (c, score);
                        }
                    }
                    Ok(Some(best.0))
                }
                [only] => Ok(Some(*only)),
                [first, ..] => {
                    let first = *first;
                    self.greedy(pass, candidate.id, &dated)?;
                    Ok(Some(first))
                }
            };
        }

        // Same day and a shared name word.
        let words: Vec<String> = split_words(&name);
        let same_day: Vec<&'p Record> = pool
            .iter()
            .filter(|c| dates::same_day(&c.date, &candidate.date))
            .filter(|c| {
                c.name.as_deref().is_some_and(|other| {
                    split_words(&other.to_uppercase())
                        .iter()
                        .any(|w| words.contains(w))
                })
            })
            .copied()
            .collect();
        if let Some(first) = same_day.first().copied() {
            if same_day.len() > 1 {
                self.greedy(pass, candidate.id, &same_day)?;
            }
            return Ok(Some(first));
        }

        // Name withheld in the canonical record; date and race agree.
        let mut close = Vec::new();
        for c in pool {
            if near(candidate, c, window)? {
                close.push(*c);
            }
        }
        if self.fields.race {
            let race = candidate.demographics.race.as_deref().map(normalize_category);
            let withheld = close.iter().copied().find(|c| {
                let name = c.name.as_deref().map(normalize_category).unwrap_or_default();
                WITHHELD_NAMES.contains(&name.as_str())
                    && race.is_some()
                    && c.demographics.race.as_deref().map(normalize_category) == race
            });
            if withheld.is_some() {
                return Ok(withheld);
            }
        }

        if !close.is_empty() && self.strict() {
            return Err(MatchError::UnresolvedMatch {
                pass,
                record: candidate.id,
                reason: format!(
                    "no name agrees with records within a day: {}",
                    listed(close.iter().copied())
                ),
            });
        }
        Ok(None)
    }

    /// Several hits where the first is taken: fatal in strict mode, reported otherwise.
    fn greedy(
        &mut self,
        pass: &'static str,
        record: RecordId,
        hits: &[&Record],
    ) -> Result<(), MatchError> {
        let candidates: Vec<RecordId> = hits.iter().map(|r| r.id).collect();
        if self.strict() {
            return Err(MatchError::AmbiguousMatch {
                pass,
                record,
                candidates,
            });
        }
        self.sink.emit(DiagnosticEvent::AmbiguousMatch {
            pass,
            record,
            candidates,
            accepted: true,
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pass 2: date first
    // -----------------------------------------------------------------------

    /// One round: date hits first, then demographics, then tie-breaks.
    fn date_first(&mut self, stage: &DateStage) -> Result<(), MatchError> {
        let matcher = DateMatcher::from_stage(stage.max_diff_days, stage.allow_month_error);

        for reference in self.unmatched_canonical() {
            let pool = self.remaining_candidates();
            if pool.is_empty() {
                break;
            }
            let mut hits = Vec::new();
            for c in pool {
                if matcher
                    .matches_one(&c.date, &reference.date)
                    .map_err(|e| e.with_records(c.id, reference.id))?
                {
                    hits.push(c);
                }
            }
            if hits.is_empty() {
                continue;
            }

            let results = self
                .comparator
                .check_for_match(&hits, reference, &stage.compare)?;
            let mut chosen: Vec<(&'r Record, MatchResult)> = hits
                .iter()
                .zip(&results)
                .filter(|(_, r)| r.is_match)
                .map(|(c, r)| (*c, *r))
                .collect();
            if chosen.is_empty() {
                self.sink.emit(DiagnosticEvent::DemographicsMismatch {
                    pass: PASS_DATE_FIRST,
                    record: reference.id,
                    date_hits: ids(hits.iter().copied()),
                });
                continue;
            }

            if chosen.len() > 1 {
                let survivors: Vec<&'r Record> = chosen.iter().map(|(c, _)| *c).collect();
                match self.disambiguate(reference, &survivors, &hits)? {
                    Some(keep) => chosen.retain(|(c, _)| keep.contains(&c.id)),
                    None if self.exception_applies(&hits) => {
                        self.sink.emit(DiagnosticEvent::AmbiguousMatch {
                            pass: PASS_DATE_FIRST,
                            record: reference.id,
                            candidates: ids(survivors.iter().copied()),
                            accepted: true,
                        });
                    }
                    None => {
                        let tied = ids(survivors.iter().copied());
                        self.ambiguous(PASS_DATE_FIRST, reference.id, tied)?;
                        continue;
                    }
                }
            }

            for (candidate, result) in chosen {
                self.consume(PASS_DATE_FIRST, reference, candidate);
                self.record_corrections(
                    PASS_DATE_FIRST,
                    reference,
                    candidate,
                    result,
                    &stage.compare,
                )?;
            }
        }
        Ok(())
    }

    /// Pick among several demographic survivors. `Some` holds the ids to
    /// consume (more than one when the survivors are the same incident).
    fn disambiguate(
        &mut self,
        reference: &Record,
        survivors: &[&'r Record],
        hits: &[&'r Record],
    ) -> Result<Option<Vec<RecordId>>, MatchError> {
        let options = self.street_options();

        if self.fields.address {
            // Rows identical apart from a differently written address.
            let reduced: Vec<KeyField> = self
                .duplicate_key
                .iter()
                .filter(|f| **f != KeyField::Address)
                .filter(|f| {
                    !(matches!(f, KeyField::Extra(_))
                        && f.name().to_lowercase().contains("summary"))
                })
                .cloned()
                .collect();
            let dedup = DedupOptions {
                ignore_null: true,
                ignore_date_errors: true,
            };
            if drop_duplicates(survivors, &reduced, dedup).len() == 1 {
                let same = self.street_match(
                    PASS_DATE_FIRST,
                    Side::Candidate,
                    survivors[0],
                    &survivors[1..],
                    options,
                )?;
                if same.iter().all(|m| *m) {
                    return Ok(Some(ids(survivors.iter().copied())));
                }
            }

            let street =
                self.street_match(PASS_DATE_FIRST, Side::Canonical, reference, survivors, options)?;
            let on_street: Vec<&'r Record> = survivors
                .iter()
                .zip(&street)
                .filter(|(_, m)| **m)
                .map(|(r, _)| *r)
                .collect();
            if on_street.len() == 1 {
                return Ok(Some(vec![on_street[0].id]));
            }
            let exact: Vec<&'r Record> = on_street
                .into_iter()
                .filter(|r| !r.date.is_period())
                .collect();
            if exact.len() == 1 {
                return Ok(Some(vec![exact[0].id]));
            }
        } else {
            let zip_equal: Vec<&'r Record> = survivors
                .iter()
                .copied()
                .filter(|r| self.zip_compare(reference, r) == ZipCompare::Equal)
                .collect();
            if zip_equal.len() == 1 {
                return Ok(Some(vec![zip_equal[0].id]));
            }
        }

        // The same narrative recorded several times.
        if self.candidates.schema.summary && identical_summaries(hits) {
            return Ok(Some(ids(survivors.iter().copied())));
        }
        Ok(None)
    }

    fn exception_applies(&self, hits: &[&Record]) -> bool {
        let location = self.config.location.as_deref();
        self.config.exceptions.iter().any(|exc| {
            let here = match (&exc.location, location) {
                (None, _) => true,
                (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                (Some(_), None) => false,
            };
            here && hits.iter().any(|r| {
                r.key_value(&exc.field)
                    .is_some_and(|v| v.contains(exc.contains.as_str()))
            })
        })
    }

    // -----------------------------------------------------------------------
    // Pass 3: demographics first
    // -----------------------------------------------------------------------

    /// Exact demographic hits regardless of date, settled by date windows and streets.
    fn demographics_first(&mut self) -> Result<(), MatchError> {
        let config = self.config;
        let t = &config.thresholds;
        let exact = ComparisonOptions::default();
        let with_address = self.fields.address;
        let options = self.street_options();
        let days = Duration::days;

        for reference in self.unmatched_canonical() {
            let pool = self.remaining_candidates();
            if pool.is_empty() {
                break;
            }
            let results = self.comparator.check_for_match(&pool, reference, &exact)?;
            let hits: Vec<&'r Record> = pool
                .iter()
                .zip(&results)
                .filter(|(_, r)| r.is_match)
                .map(|(c, _)| *c)
                .collect();

            match hits.as_slice() {
                [] => {}
                [hit] if !with_address => {
                    if near(hit, reference, days(t.demo_single_days))? {
                        self.consume(PASS_DEMOGRAPHICS_FIRST, reference, hit);
                    } else if near(hit, reference, days(t.demo_single_zip_days))? {
                        match self.zip_compare(reference, hit) {
                            ZipCompare::Equal => {
                                self.consume(PASS_DEMOGRAPHICS_FIRST, reference, hit)
                            }
                            ZipCompare::Different => {}
                            ZipCompare::Unavailable => self.unresolved(
                                PASS_DEMOGRAPHICS_FIRST,
                                reference.id,
                                "demographics agree, dates close, no zip code to confirm",
                            )?,
                        }
                    } else if !(apart(hit, reference, days(t.demo_single_far_days))?
                        || self.zip_compare(reference, hit) == ZipCompare::Different)
                    {
                        self.unresolved(
                            PASS_DEMOGRAPHICS_FIRST,
                            reference.id,
                            "demographics agree but the date is neither close nor far",
                        )?;
                    }
                }
                [hit] => {
                    let very_close = near(hit, reference, days(t.demo_very_close_days))?;
                    let close = near(hit, reference, days(t.demo_close_days))?;
                    let street = self
                        .street_match(
                            PASS_DEMOGRAPHICS_FIRST,
                            Side::Canonical,
                            reference,
                            &[*hit],
                            options,
                        )?
                        .contains(&true);
                    let month_typo = in_band(
                        hit,
                        reference,
                        DateWindow::between_days(
                            t.demo_month_typo_min_days,
                            t.demo_month_typo_max_days,
                        ),
                    )?;
                    if very_close || (close && street) || (street && month_typo) {
                        self.consume(PASS_DEMOGRAPHICS_FIRST, reference, hit);
                    } else if street
                        && !apart(hit, reference, days(t.demo_conflict_days))?
                    {
                        self.unresolved(
                            PASS_DEMOGRAPHICS_FIRST,
                            reference.id,
                            format!(
                                "street and demographics agree with {} but the dates do not",
                                hit.id
                            ),
                        )?;
                    }
                }
                _ => {
                    let mut close = Vec::with_capacity(hits.len());
                    for hit in &hits {
                        close.push(near(hit, reference, days(t.demo_close_days))?);
                    }
                    let street = if with_address {
                        self.street_match(
                            PASS_DEMOGRAPHICS_FIRST,
                            Side::Canonical,
                            reference,
                            &hits,
                            options,
                        )?
                    } else {
                        vec![true; hits.len()]
                    };
                    let close_hits: Vec<usize> = (0..hits.len()).filter(|&i| close[i]).collect();

                    if let [i] = close_hits.as_slice() {
                        let i = *i;
                        if street[i] {
                            self.consume(PASS_DEMOGRAPHICS_FIRST, reference, hits[i]);
                            continue;
                        }
                    }
                    let far = if with_address {
                        days(t.demo_far_days_with_address)
                    } else {
                        days(t.demo_far_days_no_address)
                    };
                    let mut all_far = true;
                    let mut any_street = false;
                    for (hit, on_street) in hits.iter().zip(&street) {
                        if *on_street {
                            any_street = true;
                            all_far &= apart(hit, reference, far)?;
                        }
                    }
                    if (with_address && !any_street) || all_far {
                        continue;
                    }
                    let tied = ids(hits.iter().copied());
                    self.ambiguous(PASS_DEMOGRAPHICS_FIRST, reference.id, tied)?;
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pass 4: address first
    // -----------------------------------------------------------------------

    /// Same street within a few days; the demographics must have been recorded differently.
    fn address_first(&mut self) -> Result<(), MatchError> {
        if !self.fields.address {
            return Ok(());
        }
        let window = Duration::days(self.config.thresholds.address_window_days);
        let options = self.street_options();

        for candidate in self.remaining_candidates() {
            let pool = self.unmatched_canonical();
            if pool.is_empty() {
                break;
            }
            let street =
                self.street_match(PASS_ADDRESS_FIRST, Side::Candidate, candidate, &pool, options)?;
            let mut close = Vec::new();
            for (c, on_street) in pool.iter().zip(&street) {
                if *on_street && near(candidate, c, window)? {
                    close.push(*c);
                }
            }
            match close.as_slice() {
                [] => {}
                [canonical] => {
                    self.corrections.insert(
                        canonical.id,
                        correction(
                            PASS_ADDRESS_FIRST,
                            canonical,
                            candidate,
                            CorrectionKind::ImpliedDemographic,
                        ),
                    );
                    self.consume(PASS_ADDRESS_FIRST, canonical, candidate);
                }
                _ => self.ambiguous(PASS_ADDRESS_FIRST, candidate.id, ids(close.iter().copied()))?,
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pass 5: zip + date
    // -----------------------------------------------------------------------

    /// Equal zip code, close date, demographics within an age tolerance.
    fn zip_date(&mut self) -> Result<(), MatchError> {
        if !self.fields.zip {
            return Ok(());
        }
        let config = self.config;
        let t = &config.thresholds;
        let options = ComparisonOptions {
            max_age_diff: Some(t.zip_max_age_diff),
            allowed_replacements: config.zip_pass.allowed_replacements.clone(),
            ..Default::default()
        };

        for candidate in self.remaining_candidates() {
            if candidate.date.is_period() {
                continue;
            }
            let pool = self.unmatched_canonical();
            if pool.is_empty() {
                break;
            }
            let mut nearby = Vec::new();
            for c in pool {
                if near(candidate, c, Duration::days(t.zip_window_days))? {
                    nearby.push(c);
                }
            }
            if nearby.is_empty() {
                continue;
            }
            let same_zip: Vec<&'r Record> = nearby
                .iter()
                .copied()
                .filter(|c| self.zip_compare(c, candidate) == ZipCompare::Equal)
                .collect();
            if same_zip.is_empty() {
                continue;
            }

            let mut tight = Vec::new();
            for c in same_zip {
                if near(candidate, c, Duration::days(t.zip_match_days))? {
                    tight.push(c);
                }
            }
            if !tight.is_empty() {
                let results = self.comparator.check_for_match(&tight, candidate, &options)?;
                let hits: Vec<&'r Record> = tight
                    .iter()
                    .zip(&results)
                    .filter(|(_, r)| r.is_match)
                    .map(|(c, _)| *c)
                    .collect();
                if let [canonical] = hits.as_slice() {
                    self.age_diff.insert(
                        canonical.id,
                        correction(
                            PASS_ZIP_DATE,
                            canonical,
                            candidate,
                            CorrectionKind::AgeDifference,
                        ),
                    );
                    self.consume(PASS_ZIP_DATE, canonical, candidate);
                    continue;
                }
                if self.female_among_males(candidate, &nearby) {
                    continue;
                }
            }
            self.unresolved(
                PASS_ZIP_DATE,
                candidate.id,
                format!(
                    "zip code and date agree with {} but nothing settles it",
                    listed(nearby.iter().copied())
                ),
            )?;
        }
        Ok(())
    }

    /// Candidate recorded female while every nearby canonical record is male.
    fn female_among_males(&self, candidate: &Record, near: &[&Record]) -> bool {
        if !self.fields.gender {
            return false;
        }
        let taxonomy = &self.config.taxonomy;
        let is = |r: &Record, value: &str| {
            r.demographics
                .gender
                .as_deref()
                .is_some_and(|g| normalize_category(g) == normalize_category(value))
        };
        is(candidate, taxonomy.female.as_str())
            && near.iter().all(|c| is(*c, taxonomy.male.as_str()))
    }

    // -----------------------------------------------------------------------
    // Pass 6: cross agency
    // -----------------------------------------------------------------------

    /// Candidates recorded under another agency of the same state in the canonical table.
    fn cross_agency(&mut self, full: &RecordSet, state: &str) -> Result<(), MatchError> {
        let config = self.config;
        let t = &config.thresholds;
        let in_state = filter_by_state(full, state);
        let others: Vec<&Record> = in_state
            .records
            .iter()
            .filter(|r| !self.canonical.contains(r.id))
            .collect();
        let options = ComparisonOptions {
            allowed_replacements: config.cross_agency.allowed_replacements.clone(),
            ..Default::default()
        };
        let street_options = StreetMatchOptions {
            match_col_null: false,
            ..self.street_options()
        };
        let mut claimed: HashSet<RecordId> = HashSet::new();
        tracing::debug!(pool = others.len(), %state, "cross-agency pass");

        if config.cross_agency.by_name && self.fields.name {
            for candidate in self.remaining_candidates() {
                let pool: Vec<&Record> = others
                    .iter()
                    .copied()
                    .filter(|r| !claimed.contains(&r.id))
                    .collect();
                if pool.is_empty() {
                    break;
                }
                if let Some(canonical) = self.name_hit(PASS_CROSS_AGENCY, candidate, &pool)? {
                    claimed.insert(canonical.id);
                    self.claim_cross_agency(candidate, canonical);
                }
            }
        }

        for key in &config.cross_agency.match_types {
            if *key == CrossAgencyKey::Address && !self.fields.address {
                continue;
            }
            for candidate in self.remaining_candidates() {
                let pool: Vec<&Record> = others
                    .iter()
                    .copied()
                    .filter(|r| !claimed.contains(&r.id))
                    .collect();
                if pool.is_empty() {
                    break;
                }
                let located: Vec<bool> = match key {
                    CrossAgencyKey::Address => {
                        self.street_match(
                            PASS_CROSS_AGENCY,
                            Side::Candidate,
                            candidate,
                            &pool,
                            street_options,
                        )?
                    }
                    CrossAgencyKey::Zip => pool
                        .iter()
                        .map(|r| self.zip_compare(candidate, r) == ZipCompare::Equal)
                        .collect(),
                };
                let mut month = Vec::new();
                let mut day = Vec::new();
                for (r, hit) in pool.iter().zip(&located) {
                    if !*hit {
                        continue;
                    }
                    if near(candidate, r, Duration::days(t.cross_agency_window_days))? {
                        month.push(*r);
                        if near(candidate, r, Duration::days(t.cross_agency_match_days))? {
                            day.push(*r);
                        }
                    }
                }
                if month.is_empty() {
                    continue;
                }
                if day.is_empty() {
                    self.unresolved(
                        PASS_CROSS_AGENCY,
                        candidate.id,
                        format!(
                            "location agrees with {} under another agency but the dates do not",
                            listed(month.iter().copied())
                        ),
                    )?;
                    continue;
                }
                let results = self.comparator.check_for_match(&day, candidate, &options)?;
                let hit = day.iter().zip(&results).find(|(_, r)| r.is_match).map(|(c, _)| *c);
                match hit {
                    Some(canonical) => {
                        claimed.insert(canonical.id);
                        self.claim_cross_agency(candidate, canonical);
                    }
                    None => self.unresolved(
                        PASS_CROSS_AGENCY,
                        candidate.id,
                        format!(
                            "location and date agree with {} but demographics do not",
                            listed(day.iter().copied())
                        ),
                    )?,
                }
            }
        }
        Ok(())
    }

    fn claim_cross_agency(&mut self, candidate: &Record, canonical: &Record) {
        self.consumed.insert(candidate.id);
        self.cross_agency.push(CrossAgencyMatch {
            candidate_id: candidate.id,
            canonical_id: canonical.id,
            canonical_agency: canonical.agency.clone(),
        });
        self.sink.emit(DiagnosticEvent::Matched {
            pass: PASS_CROSS_AGENCY,
            canonical: canonical.id,
            candidate: candidate.id,
        });
    }
}

fn correction(
    pass: &'static str,
    canonical: &Record,
    candidate: &Record,
    kind: CorrectionKind,
) -> Correction {
    Correction {
        canonical_id: canonical.id,
        candidate_id: candidate.id,
        kind,
        pass,
        candidate: candidate.clone(),
    }
}

/// Date comparisons of a candidate/canonical pair. Failures carry both ids.
fn near(candidate: &Record, canonical: &Record, max: Duration) -> Result<bool, MatchError> {
    dates::within(&candidate.date, &canonical.date, max)
        .map_err(|e| e.with_records(candidate.id, canonical.id))
}

fn apart(candidate: &Record, canonical: &Record, min: Duration) -> Result<bool, MatchError> {
    dates::at_least(&candidate.date, &canonical.date, min)
        .map_err(|e| e.with_records(candidate.id, canonical.id))
}

fn in_band(candidate: &Record, canonical: &Record, window: DateWindow) -> Result<bool, MatchError> {
    dates::in_window(&candidate.date, &canonical.date, window)
        .map_err(|e| e.with_records(candidate.id, canonical.id))
}

fn ids<'x>(records: impl IntoIterator<Item = &'x Record>) -> Vec<RecordId> {
    records.into_iter().map(|r| r.id).collect()
}

fn listed<'x>(records: impl IntoIterator<Item = &'x Record>) -> String {
    let ids: Vec<String> = records.into_iter().map(|r| r.id.to_string()).collect();
    ids.join(", ")
}

fn identical_summaries(hits: &[&Record]) -> bool {
    let Some(first) = hits.first().map(|r| r.summaries()) else {
        return false;
    };
    !first.is_empty()
        && first.iter().all(|(_, v)| !v.trim().is_empty())
        && hits[1..].iter().all(|r| r.summaries() == first)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::StreetTagger;
    use crate::config::{AmbiguityException, Strictness};
    use crate::diagnostics::{CollectingSink, NullSink};
    use crate::model::{Age, IncidentDate};

    fn row(id: usize, date: &str, race: &str, gender: &str, age: u32) -> Record {
        let mut r = Record::new(id, IncidentDate::parse(date).unwrap());
        r.demographics.race = Some(race.into());
        r.demographics.gender = Some(gender.into());
        r.demographics.age = Some(Age::Years(age));
        r
    }

    fn at(mut r: Record, address: &str) -> Record {
        r.address = Some(address.into());
        r
    }

    fn demo_schema() -> Schema {
        Schema {
            race: true,
            gender: true,
            age: true,
            ..Schema::default()
        }
    }

    fn with_address() -> Schema {
        Schema {
            address: true,
            ..demo_schema()
        }
    }

    fn set(source: &str, schema: Schema, records: Vec<Record>) -> RecordSet {
        RecordSet::new(source, schema, records)
    }

    fn lenient() -> MatchConfig {
        MatchConfig {
            strictness: Strictness::Lenient,
            ..MatchConfig::default()
        }
    }

    fn run(
        config: &MatchConfig,
        canonical: &RecordSet,
        candidates: &RecordSet,
    ) -> Result<(MatchOutcome, CollectingSink), MatchError> {
        let mut sink = CollectingSink::default();
        let outcome = Orchestrator::new(config, &StreetTagger).run(canonical, candidates, None, &mut sink)?;
        Ok((outcome, sink))
    }

    fn ids_of(records: &[Record]) -> Vec<usize> {
        records.iter().map(|r| r.id.0).collect()
    }

    #[test]
    fn zero_overlap_leaves_inputs_untouched() {
        let canonical = set(
            "mpv",
            with_address(),
            vec![
                at(row(0, "2021-01-10", "WHITE", "MALE", 30), "100 N Main St"),
                at(row(1, "2021-03-02", "BLACK", "FEMALE", 41), "12 W Elm Ave"),
            ],
        );
        let candidates = set(
            "opd",
            with_address(),
            vec![
                at(row(0, "2021-06-20", "HISPANIC / LATINO", "MALE", 19), "900 S Oak Rd"),
                at(row(1, "2021-09-01", "ASIAN", "FEMALE", 52), "45 E Pine Dr"),
            ],
        );
        let (outcome, _) = run(&MatchConfig::default(), &canonical, &candidates).unwrap();
        assert_eq!(ids_of(&outcome.remaining_canonical), vec![0, 1]);
        assert_eq!(ids_of(&outcome.remaining_candidates), vec![0, 1]);
        assert!(outcome.corrections.is_empty());
        assert!(outcome.age_diff.is_empty());
        assert_eq!(outcome.matched_count(), 0);
    }

    #[test]
    fn exact_row_matches_in_date_first() {
        let canonical = set(
            "mpv",
            with_address(),
            vec![at(row(0, "2021-01-10", "WHITE", "MALE", 30), "100 N Main St")],
        );
        let candidates = set(
            "opd",
            with_address(),
            vec![at(row(7, "2021-01-10T22:15:00", "WHITE", "MALE", 30), "100 N Main St")],
        );
        let (outcome, sink) = run(&MatchConfig::default(), &canonical, &candidates).unwrap();
        assert_eq!(outcome.matched, vec![(RecordId(0), true)]);
        assert!(outcome.remaining_candidates.is_empty());
        assert_eq!(outcome.matched_by.get(&RecordId(0)), Some(&PASS_DATE_FIRST));
        assert_eq!(
            sink.count(|e| matches!(e, DiagnosticEvent::Matched { pass, .. } if *pass == PASS_DATE_FIRST)),
            1
        );
    }

    #[test]
    fn equal_candidates_are_ambiguous() {
        let canonical = set("mpv", demo_schema(), vec![row(0, "2021-01-10", "WHITE", "MALE", 30)]);
        let candidates = set(
            "opd",
            demo_schema(),
            vec![
                row(0, "2021-01-10", "WHITE", "MALE", 30),
                row(1, "2021-01-10", "WHITE", "MALE", 30),
            ],
        );
        let err = run(&MatchConfig::default(), &canonical, &candidates).unwrap_err();
        match err {
            MatchError::AmbiguousMatch { pass, record, candidates } => {
                assert_eq!(pass, PASS_DATE_FIRST);
                assert_eq!(record, RecordId(0));
                assert_eq!(candidates, vec![RecordId(0), RecordId(1)]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let (outcome, sink) = run(&lenient(), &canonical, &candidates).unwrap();
        assert_eq!(outcome.matched_count(), 0);
        assert_eq!(outcome.remaining_candidates.len(), 2);
        assert!(outcome.ambiguous_skipped >= 1);
        assert!(sink.count(|e| matches!(e, DiagnosticEvent::AmbiguousMatch { accepted: false, .. })) >= 1);
    }

    #[test]
    fn street_settles_date_first_tie() {
        let canonical = set(
            "mpv",
            with_address(),
            vec![at(row(0, "2021-01-10", "WHITE", "MALE", 30), "100 N Main St")],
        );
        let candidates = set(
            "opd",
            with_address(),
            vec![
                at(row(0, "2021-01-10", "WHITE", "MALE", 30), "2200 W Camelback Rd"),
                at(row(1, "2021-01-10", "WHITE", "MALE", 30), "100 block of N Main Street"),
            ],
        );
        let (outcome, _) = run(&MatchConfig::default(), &canonical, &candidates).unwrap();
        assert_eq!(outcome.matched_count(), 1);
        assert_eq!(ids_of(&outcome.remaining_candidates), vec![0]);
    }

    #[test]
    fn zip_settles_date_first_tie_without_addresses() {
        let schema = Schema {
            zip: true,
            ..demo_schema()
        };
        let mut reference = row(0, "2021-01-10", "WHITE", "MALE", 30);
        reference.zip = Some("85009".into());
        let mut a = row(0, "2021-01-10", "WHITE", "MALE", 30);
        a.zip = Some("85041".into());
        let mut b = row(1, "2021-01-10", "WHITE", "MALE", 30);
        b.zip = Some("85009".into());
        let canonical = set("mpv", schema, vec![reference]);
        let candidates = set("opd", schema, vec![a, b]);
        let (outcome, _) = run(&MatchConfig::default(), &canonical, &candidates).unwrap();
        assert_eq!(ids_of(&outcome.remaining_candidates), vec![0]);
    }

    #[test]
    fn identical_summaries_consume_all_hits() {
        let schema = Schema {
            summary: true,
            ..demo_schema()
        };
        let canonical = set("mpv", schema, vec![row(0, "2021-01-10", "WHITE", "MALE", 30)]);
        let rows = (0..2)
            .map(|i| {
                let mut r = row(i, "2021-01-10", "WHITE", "MALE", 30);
                r.extra.insert("SUMMARY".into(), "Officers responded to a call".into());
                r
            })
            .collect();
        let candidates = set("opd", schema, rows);
        let (outcome, _) = run(&MatchConfig::default(), &canonical, &candidates).unwrap();
        assert_eq!(outcome.matched_count(), 1);
        assert!(outcome.remaining_candidates.is_empty());
    }

    #[test]
    fn known_exception_accepts_ambiguity() {
        let schema = demo_schema();
        let canonical = set("mpv", schema, vec![row(0, "2021-01-10", "WHITE", "MALE", 30)]);
        let rows = (0..2)
            .map(|i| {
                let mut r = row(i, "2021-01-10", "WHITE", "MALE", 30);
                r.extra.insert("HUNDRED_BLOCK".into(), format!("65XX S 3RD ST {i}"));
                r
            })
            .collect();
        let candidates = set("opd", schema, rows);
        let config = MatchConfig {
            location: Some("Phoenix".into()),
            exceptions: vec![AmbiguityException {
                location: Some("Phoenix".into()),
                field: KeyField::Extra("HUNDRED_BLOCK".into()),
                contains: "65XX S 3RD ST".into(),
                note: None,
            }],
            ..MatchConfig::default()
        };
        let (outcome, sink) = run(&config, &canonical, &candidates).unwrap();
        assert!(outcome.remaining_candidates.is_empty());
        assert_eq!(sink.count(|e| matches!(e, DiagnosticEvent::AmbiguousMatch { accepted: true, .. })), 1);

        let elsewhere = MatchConfig {
            location: Some("Tucson".into()),
            ..config
        };
        assert!(run(&elsewhere, &canonical, &candidates).is_err());
    }

    #[test]
    fn unknown_race_recorded_as_correction() {
        let canonical = set("mpv", demo_schema(), vec![row(0, "2021-01-10", "UNKNOWN", "MALE", 30)]);
        let candidates = set("opd", demo_schema(), vec![row(3, "2021-01-10", "BLACK", "MALE", 30)]);
        let (outcome, sink) = run(&MatchConfig::default(), &canonical, &candidates).unwrap();
        let correction = &outcome.corrections[&RecordId(0)];
        assert_eq!(correction.kind, CorrectionKind::UnknownDemographic);
        assert_eq!(correction.candidate_id, RecordId(3));
        assert_eq!(sink.count(|e| matches!(e, DiagnosticEvent::UnknownAsymmetry { .. })), 1);
    }

    #[test]
    fn age_tolerant_stage_records_age_diff() {
        let canonical = set("mpv", demo_schema(), vec![row(0, "2021-01-10", "WHITE", "MALE", 30)]);
        let candidates = set("opd", demo_schema(), vec![row(0, "2021-01-10", "WHITE", "MALE", 32)]);
        let (outcome, _) = run(&MatchConfig::default(), &canonical, &candidates).unwrap();
        assert_eq!(outcome.matched_count(), 1);
        assert_eq!(outcome.age_diff[&RecordId(0)].kind, CorrectionKind::AgeDifference);
    }

    #[test]
    fn demographics_first_accepts_close_single_hit() {
        let canonical = set("mpv", demo_schema(), vec![row(0, "2021-01-10", "WHITE", "MALE", 30)]);
        let candidates = set("opd", demo_schema(), vec![row(0, "2021-01-12", "WHITE", "MALE", 30)]);
        let config = MatchConfig {
            date_first: Vec::new(),
            ..MatchConfig::default()
        };
        let (outcome, _) = run(&config, &canonical, &candidates).unwrap();
        assert_eq!(outcome.matched_by.get(&RecordId(0)), Some(&PASS_DEMOGRAPHICS_FIRST));
    }

    #[test]
    fn demographics_first_month_typo_on_same_street() {
        let canonical = set(
            "mpv",
            with_address(),
            vec![at(row(0, "2021-02-10", "WHITE", "MALE", 30), "100 N Main St")],
        );
        let candidates = set(
            "opd",
            with_address(),
            vec![at(row(0, "2021-03-12", "WHITE", "MALE", 30), "100 N Main St")],
        );
        let (outcome, _) = run(&MatchConfig::default(), &canonical, &candidates).unwrap();
        assert_eq!(outcome.matched_by.get(&RecordId(0)), Some(&PASS_DEMOGRAPHICS_FIRST));
    }

    #[test]
    fn demographics_first_conflict_is_unresolved() {
        let canonical = set(
            "mpv",
            with_address(),
            vec![at(row(0, "2021-02-10", "WHITE", "MALE", 30), "100 N Main St")],
        );
        let candidates = set(
            "opd",
            with_address(),
            vec![at(row(0, "2021-02-20", "WHITE", "MALE", 30), "100 N Main St")],
        );
        let err = run(&MatchConfig::default(), &canonical, &candidates).unwrap_err();
        assert!(matches!(err, MatchError::UnresolvedMatch { pass, .. } if pass == PASS_DEMOGRAPHICS_FIRST));

        let (outcome, sink) = run(&lenient(), &canonical, &candidates).unwrap();
        assert_eq!(outcome.matched_count(), 0);
        assert_eq!(sink.count(|e| matches!(e, DiagnosticEvent::Unresolved { .. })), 1);
    }

    #[test]
    fn address_first_implies_demographic_correction() {
        let canonical = set(
            "mpv",
            with_address(),
            vec![at(row(0, "2021-01-10", "WHITE", "MALE", 30), "100 N Main St")],
        );
        let candidates = set(
            "opd",
            with_address(),
            vec![at(row(4, "2021-01-12", "BLACK", "FEMALE", 30), "100 N Main St")],
        );
        let (outcome, _) = run(&MatchConfig::default(), &canonical, &candidates).unwrap();
        assert_eq!(outcome.matched_by.get(&RecordId(0)), Some(&PASS_ADDRESS_FIRST));
        assert_eq!(outcome.corrections[&RecordId(0)].kind, CorrectionKind::ImpliedDemographic);
    }

    #[test]
    fn zip_pass_tolerates_age() {
        let schema = Schema {
            zip: true,
            ..demo_schema()
        };
        let mut canonical_row = row(0, "2021-01-10", "WHITE", "MALE", 30);
        canonical_row.zip = Some("85009".into());
        let mut candidate_row = row(0, "2021-01-13", "WHITE", "MALE", 34);
        candidate_row.zip = Some("85009".into());
        let canonical = set("mpv", schema, vec![canonical_row]);
        let candidates = set("opd", schema, vec![candidate_row]);
        let (outcome, _) = run(&MatchConfig::default(), &canonical, &candidates).unwrap();
        assert_eq!(outcome.matched_by.get(&RecordId(0)), Some(&PASS_ZIP_DATE));
        assert_eq!(outcome.age_diff[&RecordId(0)].kind, CorrectionKind::AgeDifference);
    }

    #[test]
    fn zip_pass_skips_female_among_males() {
        let schema = Schema {
            zip: true,
            ..demo_schema()
        };
        let mut canonical_row = row(0, "2021-01-10", "WHITE", "MALE", 30);
        canonical_row.zip = Some("85009".into());
        let mut candidate_row = row(0, "2021-01-13", "WHITE", "FEMALE", 50);
        candidate_row.zip = Some("85009".into());
        let canonical = set("mpv", schema, vec![canonical_row]);
        let candidates = set("opd", schema, vec![candidate_row]);
        let (outcome, _) = run(&MatchConfig::default(), &canonical, &candidates).unwrap();
        assert_eq!(outcome.matched_count(), 0);
        assert_eq!(outcome.remaining_candidates.len(), 1);
    }

    #[test]
    fn name_pass_matches_reordered_name() {
        let schema = Schema {
            name: true,
            ..demo_schema()
        };
        let mut canonical_row = row(0, "2021-01-10", "WHITE", "MALE", 30);
        canonical_row.name = Some("John A. Smith".into());
        let mut candidate_row = row(2, "2021-01-11", "BLACK", "MALE", 31);
        candidate_row.name = Some("SMITH, JOHN A".into());
        let canonical = set("mpv", schema, vec![canonical_row]);
        let candidates = set("opd", schema, vec![candidate_row]);
        let (outcome, _) = run(&MatchConfig::default(), &canonical, &candidates).unwrap();
        assert_eq!(outcome.matched_by.get(&RecordId(0)), Some(&PASS_NAME));
        assert!(outcome.corrections.is_empty());
    }

    #[test]
    fn name_without_date_is_fatal_when_strict() {
        let schema = Schema {
            name: true,
            ..demo_schema()
        };
        let mut canonical_row = row(0, "2021-01-10", "WHITE", "MALE", 30);
        canonical_row.name = Some("John Smith".into());
        let mut candidate_row = row(0, "2021-05-20", "WHITE", "MALE", 30);
        candidate_row.name = Some("John Smith".into());
        let canonical = set("mpv", schema, vec![canonical_row]);
        let candidates = set("opd", schema, vec![candidate_row]);
        let err = run(&MatchConfig::default(), &canonical, &candidates).unwrap_err();
        assert!(matches!(err, MatchError::UnresolvedMatch { pass, .. } if pass == PASS_NAME));

        let (outcome, _) = run(&lenient(), &canonical, &candidates).unwrap();
        assert_eq!(outcome.matched_by.get(&RecordId(0)), Some(&PASS_NAME));
    }

    #[test]
    fn cross_agency_finds_neighbor_agency_row() {
        let schema = with_address();
        let mut own = at(row(0, "2021-01-10", "WHITE", "MALE", 30), "100 N Main St");
        own.state = Some("AZ".into());
        own.agency = Some("Phoenix Police Department".into());
        let mut neighbor = at(row(1, "2021-06-02", "BLACK", "MALE", 25), "2200 W Camelback Rd");
        neighbor.state = Some("Arizona".into());
        neighbor.agency = Some("Maricopa County Sheriff's Office".into());
        let full = set("mpv", schema, vec![own.clone(), neighbor]);
        let canonical = set("mpv", schema, vec![own]);
        let candidates = set(
            "opd",
            schema,
            vec![at(row(0, "2021-06-02", "BLACK", "MALE", 25), "2200 W Camelback Road")],
        );
        let config = MatchConfig {
            state: Some("AZ".into()),
            cross_agency: crate::config::CrossAgencyConfig {
                enabled: true,
                ..Default::default()
            },
            ..MatchConfig::default()
        };
        let outcome = Orchestrator::new(&config, &StreetTagger)
            .run(&canonical, &candidates, Some(&full), &mut NullSink)
            .unwrap();
        assert_eq!(outcome.cross_agency.len(), 1);
        assert_eq!(outcome.cross_agency[0].canonical_id, RecordId(1));
        assert!(outcome.remaining_candidates.is_empty());
        assert_eq!(outcome.matched, vec![(RecordId(0), false)]);
    }

    #[test]
    fn matched_canonical_is_not_reused() {
        let canonical = set("mpv", demo_schema(), vec![row(0, "2021-01-10", "WHITE", "MALE", 30)]);
        let candidates = set(
            "opd",
            demo_schema(),
            vec![
                row(0, "2021-01-10", "WHITE", "MALE", 30),
                row(1, "2021-01-11", "WHITE", "MALE", 30),
            ],
        );
        let config = MatchConfig {
            date_first: vec![DateStage::default()],
            ..MatchConfig::default()
        };
        let (outcome, sink) = run(&config, &canonical, &candidates).unwrap();
        assert_eq!(ids_of(&outcome.remaining_candidates), vec![1]);
        assert_eq!(sink.count(|e| matches!(e, DiagnosticEvent::Matched { .. })), 1);
    }

    #[test]
    fn period_pair_error_names_both_records() {
        let schema = Schema {
            race: true,
            ..Schema::default()
        };
        let mut reference = Record::new(0, IncidentDate::parse("2021-01").unwrap());
        reference.demographics.race = Some("WHITE".into());
        let mut candidate = Record::new(3, IncidentDate::parse("2021-02").unwrap());
        candidate.demographics.race = Some("WHITE".into());
        let canonical = set("mpv", schema, vec![reference]);
        let candidates = set("opd", schema, vec![candidate]);
        let err = run(&MatchConfig::default(), &canonical, &candidates).unwrap_err();
        match err {
            MatchError::UnhandledComparison {
                field,
                candidate_id,
                reference_id,
                ..
            } => {
                assert_eq!(field, "date");
                assert_eq!(candidate_id, Some(RecordId(3)));
                assert_eq!(reference_id, Some(RecordId(0)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn exact_stage_matches_day_inside_month_reference() {
        let canonical = set("mpv", demo_schema(), vec![row(0, "2021-01", "WHITE", "MALE", 30)]);
        let candidates = set("opd", demo_schema(), vec![row(5, "2021-01-10", "WHITE", "MALE", 30)]);
        let (outcome, _) = run(&MatchConfig::default(), &canonical, &candidates).unwrap();
        assert_eq!(outcome.matched_by.get(&RecordId(0)), Some(&PASS_DATE_FIRST));
        assert!(outcome.remaining_candidates.is_empty());
    }

    #[test]
    fn second_age_difference_for_one_record_is_fatal() {
        let schema = Schema {
            summary: true,
            ..demo_schema()
        };
        let canonical = set("mpv", schema, vec![row(0, "2021-01-10", "WHITE", "MALE", 30)]);
        let rows = (0..2)
            .map(|i| {
                let mut r = row(i, "2021-01-10", "WHITE", "MALE", 32);
                r.extra.insert("SUMMARY".into(), "Officers responded to a call".into());
                r
            })
            .collect();
        let candidates = set("opd", schema, rows);
        let err = run(&lenient(), &canonical, &candidates).unwrap_err();
        match err {
            MatchError::UnhandledComparison {
                field,
                candidate_id,
                reference_id,
                ..
            } => {
                assert_eq!(field, "age");
                assert_eq!(candidate_id, Some(RecordId(1)));
                assert_eq!(reference_id, Some(RecordId(0)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn demographics_first_street_picks_the_close_hit() {
        let canonical = set(
            "mpv",
            with_address(),
            vec![at(row(0, "2021-01-10", "WHITE", "MALE", 30), "100 N Main St")],
        );
        let candidates = set(
            "opd",
            with_address(),
            vec![
                at(row(0, "2021-06-01", "WHITE", "MALE", 30), "2200 W Camelback Rd"),
                at(row(1, "2021-01-12", "WHITE", "MALE", 30), "100 N Main St"),
            ],
        );
        let (outcome, _) = run(&MatchConfig::default(), &canonical, &candidates).unwrap();
        assert_eq!(outcome.matched_by.get(&RecordId(0)), Some(&PASS_DEMOGRAPHICS_FIRST));
        assert_eq!(ids_of(&outcome.remaining_candidates), vec![0]);
    }

    #[test]
    fn demographics_first_skips_hits_all_far_away() {
        let canonical = set("mpv", demo_schema(), vec![row(0, "2021-01-10", "WHITE", "MALE", 30)]);
        let candidates = set(
            "opd",
            demo_schema(),
            vec![
                row(0, "2021-03-01", "WHITE", "MALE", 30),
                row(1, "2021-05-01", "WHITE", "MALE", 30),
            ],
        );
        let (outcome, sink) = run(&MatchConfig::default(), &canonical, &candidates).unwrap();
        assert_eq!(outcome.matched_count(), 0);
        assert_eq!(outcome.remaining_candidates.len(), 2);
        assert_eq!(sink.count(|e| matches!(e, DiagnosticEvent::AmbiguousMatch { .. })), 0);
    }

    #[test]
    fn demographics_first_middle_distance_hits_are_ambiguous() {
        let canonical = set("mpv", demo_schema(), vec![row(0, "2021-01-10", "WHITE", "MALE", 30)]);
        let candidates = set(
            "opd",
            demo_schema(),
            vec![
                row(0, "2021-01-15", "WHITE", "MALE", 30),
                row(1, "2021-01-16", "WHITE", "MALE", 30),
            ],
        );
        let err = run(&MatchConfig::default(), &canonical, &candidates).unwrap_err();
        match err {
            MatchError::AmbiguousMatch { pass, record, candidates } => {
                assert_eq!(pass, PASS_DEMOGRAPHICS_FIRST);
                assert_eq!(record, RecordId(0));
                assert_eq!(candidates, vec![RecordId(0), RecordId(1)]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let (outcome, _) = run(&lenient(), &canonical, &candidates).unwrap();
        assert_eq!(outcome.matched_count(), 0);
        assert_eq!(outcome.ambiguous_skipped, 1);
    }

    #[test]
    fn demographics_first_zip_confirms_week_old_hit() {
        let schema = Schema {
            zip: true,
            ..demo_schema()
        };
        let zipped = |r: Record, zip: &str| Record {
            zip: Some(zip.into()),
            ..r
        };
        let week_later = |zip| zipped(row(0, "2021-01-17", "WHITE", "MALE", 30), zip);
        let canonical = set(
            "mpv",
            schema,
            vec![zipped(row(0, "2021-01-10", "WHITE", "MALE", 30), "85009")],
        );

        let same = set("opd", schema, vec![week_later("85009")]);
        let (outcome, _) = run(&MatchConfig::default(), &canonical, &same).unwrap();
        assert_eq!(outcome.matched_by.get(&RecordId(0)), Some(&PASS_DEMOGRAPHICS_FIRST));

        let other = set("opd", schema, vec![week_later("85041")]);
        let (outcome, _) = run(&MatchConfig::default(), &canonical, &other).unwrap();
        assert_eq!(outcome.matched_count(), 0);

        // No zip column to confirm with.
        let canonical = set("mpv", demo_schema(), vec![row(0, "2021-01-10", "WHITE", "MALE", 30)]);
        let bare = set("opd", demo_schema(), vec![row(0, "2021-01-17", "WHITE", "MALE", 30)]);
        let err = run(&MatchConfig::default(), &canonical, &bare).unwrap_err();
        assert!(matches!(err, MatchError::UnresolvedMatch { pass, .. } if pass == PASS_DEMOGRAPHICS_FIRST));
    }

    #[test]
    fn address_first_two_close_rows_are_ambiguous() {
        let canonical = set(
            "mpv",
            with_address(),
            vec![
                at(row(0, "2021-01-10", "WHITE", "MALE", 30), "100 N Main St"),
                at(row(1, "2021-01-12", "WHITE", "MALE", 45), "100 N Main St"),
            ],
        );
        let candidates = set(
            "opd",
            with_address(),
            vec![at(row(6, "2021-01-11", "BLACK", "FEMALE", 20), "100 N Main St")],
        );
        let err = run(&MatchConfig::default(), &canonical, &candidates).unwrap_err();
        match err {
            MatchError::AmbiguousMatch { pass, record, candidates } => {
                assert_eq!(pass, PASS_ADDRESS_FIRST);
                assert_eq!(record, RecordId(6));
                assert_eq!(candidates, vec![RecordId(0), RecordId(1)]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zip_pass_unsettled_is_unresolved() {
        let schema = Schema {
            zip: true,
            ..demo_schema()
        };
        let mut canonical_row = row(0, "2021-01-10", "WHITE", "MALE", 30);
        canonical_row.zip = Some("85009".into());
        let mut candidate_row = row(2, "2021-01-13", "WHITE", "MALE", 50);
        candidate_row.zip = Some("85009".into());
        let canonical = set("mpv", schema, vec![canonical_row]);
        let candidates = set("opd", schema, vec![candidate_row]);
        let err = run(&MatchConfig::default(), &canonical, &candidates).unwrap_err();
        match err {
            MatchError::UnresolvedMatch { pass, record, .. } => {
                assert_eq!(pass, PASS_ZIP_DATE);
                assert_eq!(record, RecordId(2));
            }
            other => panic!("unexpected error: {other}"),
        }

        let (outcome, sink) = run(&lenient(), &canonical, &candidates).unwrap();
        assert_eq!(outcome.matched_count(), 0);
        assert_eq!(
            sink.count(|e| matches!(e, DiagnosticEvent::Unresolved { pass, .. } if *pass == PASS_ZIP_DATE)),
            1
        );
    }

    #[test]
    fn cross_agency_by_name_searches_the_state() {
        let schema = Schema {
            name: true,
            ..demo_schema()
        };
        let mut own = row(0, "2021-01-10", "WHITE", "MALE", 30);
        own.name = Some("Jane Roe".into());
        own.state = Some("AZ".into());
        own.agency = Some("Phoenix Police Department".into());
        let mut neighbor = row(1, "2021-06-02", "BLACK", "MALE", 25);
        neighbor.name = Some("John A. Smith".into());
        neighbor.state = Some("Arizona".into());
        neighbor.agency = Some("Maricopa County Sheriff's Office".into());
        let full = set("mpv", schema, vec![own.clone(), neighbor]);
        let canonical = set("mpv", schema, vec![own]);
        let mut candidate = row(0, "2021-06-02", "BLACK", "MALE", 25);
        candidate.name = Some("SMITH, JOHN A".into());
        let candidates = set("opd", schema, vec![candidate]);

        let mut config = MatchConfig {
            state: Some("AZ".into()),
            cross_agency: crate::config::CrossAgencyConfig {
                enabled: true,
                by_name: true,
                ..Default::default()
            },
            ..MatchConfig::default()
        };
        let outcome = Orchestrator::new(&config, &StreetTagger)
            .run(&canonical, &candidates, Some(&full), &mut NullSink)
            .unwrap();
        assert_eq!(outcome.cross_agency.len(), 1);
        assert_eq!(outcome.cross_agency[0].canonical_id, RecordId(1));
        assert!(outcome.remaining_candidates.is_empty());

        config.cross_agency.by_name = false;
        let outcome = Orchestrator::new(&config, &StreetTagger)
            .run(&canonical, &candidates, Some(&full), &mut NullSink)
            .unwrap();
        assert!(outcome.cross_agency.is_empty());
        assert_eq!(outcome.remaining_candidates.len(), 1);
    }
}
