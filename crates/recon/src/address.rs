//! Street-level address comparison.
//!
//! Addresses are tagged by an [`AddressParser`] and compared on their street
//! name tokens only; house numbers, suffixes and directionals may differ.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::config::Strictness;
use crate::error::MatchError;
use crate::text::split_words;

// ---------------------------------------------------------------------------
// Parsed form
// ---------------------------------------------------------------------------

/// Coarse classification of one parsed address component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    StreetAddress,
    /// One street of a multi-street location ("A and B").
    Intersection,
    Coordinates,
    PlusCode,
    Building,
    County,
    /// The address is just the city or region.
    Region,
    Null,
}

impl AddressKind {
    /// Kinds that legitimately carry no street name.
    fn is_streetless(self) -> bool {
        matches!(self, Self::Coordinates | Self::PlusCode | Self::County | Self::Region | Self::Null)
    }

    /// Kinds a candidate may carry that say nothing about the street.
    fn is_uninformative(self) -> bool {
        matches!(self, Self::Null | Self::Coordinates | Self::Building | Self::PlusCode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AddressTag {
    AddressNumber,
    StreetNamePreDirectional,
    StreetNamePreType,
    StreetName,
    StreetNamePostType,
    StreetNamePostDirectional,
    OccupancyIdentifier,
    PlaceName,
    CountyName,
    BuildingName,
    Coordinates,
    PlusCode,
}

/// One address component: ordered `(tag, token)` pairs plus a coarse kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaggedAddress {
    pub kind: AddressKind,
    pub tags: Vec<(AddressTag, String)>,
}

impl TaggedAddress {
    fn new(kind: AddressKind) -> Self {
        Self {
            kind,
            tags: Vec::new(),
        }
    }

    fn push(&mut self, tag: AddressTag, value: impl Into<String>) {
        self.tags.push((tag, value.into()));
    }

    pub fn get(&self, tag: AddressTag) -> Option<&str> {
        self.tags.iter().find(|(t, _)| *t == tag).map(|(_, v)| v.as_str())
    }

    pub fn street_names(&self) -> Vec<&str> {
        self.tags
            .iter()
            .filter(|(t, _)| *t == AddressTag::StreetName)
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

/// Tags a raw address. Must be total and deterministic: malformed input
/// yields a component without street names rather than an error.
pub trait AddressParser {
    fn tag(&self, address: &str, location: Option<&str>) -> Vec<TaggedAddress>;
}

// ---------------------------------------------------------------------------
// Default parser
// ---------------------------------------------------------------------------

static COORDINATES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(?\s*-?\d{1,3}\.\d+\s*,\s*-?\d{1,3}\.\d+\s*\)?$").unwrap());
static PLUS_CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[23456789CFGHJMPQRVWX]{4,8}\+[23456789CFGHJMPQRVWX]{2,3}\b").unwrap()
});
static COUNTY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^(.+?)\s+county$").unwrap());
static INTERSECTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s+(?:and|at)\s+|\s*[&/@]\s*").unwrap());
static HOUSE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:\d+[a-z]?(?:-\d+)?|\d+x+)$").unwrap());

const NULL_WORDS: &[&str] = &["NULL", "NONE", "N/A", "NA", "UNKNOWN", "UNDISCLOSED", "NOT AVAILABLE"];
const DIRECTIONALS: &[&str] = &[
    "N", "S", "E", "W", "NE", "NW", "SE", "SW", "NORTH", "SOUTH", "EAST", "WEST", "NORTHEAST",
    "NORTHWEST", "SOUTHEAST", "SOUTHWEST",
];
const STREET_TYPES: &[&str] = &[
    "ST", "STREET", "AVE", "AV", "AVENUE", "BLVD", "BOULEVARD", "RD", "ROAD", "DR", "DRIVE", "LN",
    "LANE", "WAY", "CT", "COURT", "PL", "PLACE", "PKWY", "PARKWAY", "HWY", "HIGHWAY", "TER",
    "TERRACE", "CIR", "CIRCLE", "TRL", "TRAIL", "LOOP", "FWY", "FREEWAY", "EXPY", "EXPRESSWAY",
    "PIKE", "ROW", "SQ", "SQUARE", "ALY", "ALLEY", "PLZ", "PLAZA",
];
const PRE_TYPES: &[&str] = &[
    "HWY", "HIGHWAY", "ROUTE", "RT", "SR", "US", "I", "INTERSTATE", "CR",
];
const BLOCK_WORDS: &[&str] = &["BLOCK", "BLK"];
const UNIT_WORDS: &[&str] = &["APT", "UNIT", "STE", "SUITE", "#", "LOT", "SPACE", "RM", "ROOM"];

/// Rule-based tagger for US street addresses, intersections, and block notation.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreetTagger;

impl AddressParser for StreetTagger {
    fn tag(&self, address: &str, location: Option<&str>) -> Vec<TaggedAddress> {
        let trimmed = address.trim();
        let upper = trimmed.to_uppercase();
        if upper.is_empty() || NULL_WORDS.contains(&upper.as_str()) {
            return vec![TaggedAddress::new(AddressKind::Null)];
        }
        if COORDINATES.is_match(trimmed) {
            let mut t = TaggedAddress::new(AddressKind::Coordinates);
            t.push(AddressTag::Coordinates, trimmed);
            return vec![t];
        }
        if let Some(m) = PLUS_CODE.find(trimmed) {
            let mut t = TaggedAddress::new(AddressKind::PlusCode);
            t.push(AddressTag::PlusCode, m.as_str());
            return vec![t];
        }

        // Street part is whatever precedes the first comma; the rest is place.
        let (street, place) = match trimmed.split_once(',') {
            Some((s, p)) => (s.trim(), Some(p.trim())),
            None => (trimmed, None),
        };
        if location.is_some_and(|loc| loc.trim().eq_ignore_ascii_case(street)) {
            let mut t = TaggedAddress::new(AddressKind::Region);
            t.push(AddressTag::PlaceName, street);
            return vec![t];
        }
        if let Some(caps) = COUNTY.captures(street) {
            let mut t = TaggedAddress::new(AddressKind::County);
            t.push(AddressTag::CountyName, &caps[1]);
            return vec![t];
        }

        let parts: Vec<&str> = INTERSECTION
            .split(street)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        let mut components: Vec<TaggedAddress> = if parts.len() > 1 {
            parts
                .into_iter()
                .map(|p| {
                    let mut t = tag_street(p);
                    if t.kind == AddressKind::StreetAddress || t.kind == AddressKind::Building {
                        // A bare word between "and"s is still a street.
                        t.kind = AddressKind::Intersection;
                        for (tag, _) in t.tags.iter_mut() {
                            if *tag == AddressTag::BuildingName {
                                *tag = AddressTag::StreetName;
                            }
                        }
                    }
                    t
                })
                .collect()
        } else {
            vec![tag_street(street)]
        };

        if let Some(place) = place.filter(|p| !p.is_empty()) {
            if let Some(last) = components.last_mut() {
                last.push(AddressTag::PlaceName, place);
            }
        }
        components
    }
}

fn tag_street(street: &str) -> TaggedAddress {
    let tokens: Vec<String> = street
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| c == '.' || c == ',').to_string())
        .filter(|t| !t.is_empty())
        .collect();
    let upper: Vec<String> = tokens.iter().map(|t| t.to_uppercase()).collect();

    let mut tagged = TaggedAddress::new(AddressKind::StreetAddress);
    if tokens.is_empty() {
        tagged.kind = AddressKind::Null;
        return tagged;
    }
    let mut start = 0;
    let mut end = tokens.len();

    if let Some(unit) = upper
        .iter()
        .position(|t| UNIT_WORDS.contains(&t.as_str()) || t.starts_with('#'))
    {
        if unit > 0 {
            end = unit;
        }
    }

    let mut has_marker = false;
    // "37 Street" is a numbered street, not a house number.
    let numbered_street = end - start == 2 && STREET_TYPES.contains(&upper[start + 1].as_str());
    if end - start > 1 && !numbered_street && HOUSE_NUMBER.is_match(&tokens[start]) {
        tagged.push(AddressTag::AddressNumber, &tokens[start]);
        start += 1;
        has_marker = true;
        // "100 block of Main St"
        if start < end && BLOCK_WORDS.contains(&upper[start].as_str()) {
            start += 1;
            if start < end && upper[start] == "OF" {
                start += 1;
            }
        }
    }
    if end - start > 1 && DIRECTIONALS.contains(&upper[start].as_str()) {
        tagged.push(AddressTag::StreetNamePreDirectional, &tokens[start]);
        start += 1;
        has_marker = true;
    }
    if end - start > 1 && PRE_TYPES.contains(&upper[start].as_str()) {
        tagged.push(AddressTag::StreetNamePreType, &tokens[start]);
        start += 1;
        has_marker = true;
    }

    let mut suffix = Vec::new();
    if end - start > 1 && DIRECTIONALS.contains(&upper[end - 1].as_str()) {
        suffix.push((AddressTag::StreetNamePostDirectional, tokens[end - 1].clone()));
        end -= 1;
        has_marker = true;
    }
    if end - start > 1 && STREET_TYPES.contains(&upper[end - 1].as_str()) {
        suffix.push((AddressTag::StreetNamePostType, tokens[end - 1].clone()));
        end -= 1;
        has_marker = true;
    }

    if start < end {
        let name = tokens[start..end].join(" ");
        if has_marker {
            tagged.push(AddressTag::StreetName, name);
        } else {
            tagged.kind = AddressKind::Building;
            tagged.push(AddressTag::BuildingName, name);
        }
    }
    tagged.tags.extend(suffix.into_iter().rev());

    let occupancy = tokens[end.max(start)..]
        .iter()
        .skip_while(|t| !UNIT_WORDS.contains(&t.to_uppercase().as_str()) && !t.starts_with('#'))
        .cloned()
        .collect::<Vec<_>>();
    if !occupancy.is_empty() {
        tagged.push(AddressTag::OccupancyIdentifier, occupancy.join(" "));
    }
    tagged
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// `37th` ≈ `37`: equal words, or words whose leading digit groups agree.
pub fn match_street_word(a: &str, b: &str) -> bool {
    static ORDINAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^(\d+)[a-z]*$").unwrap());
    if a == b {
        return true;
    }
    match (ORDINAL.captures(a), ORDINAL.captures(b)) {
        (Some(x), Some(y)) => x[1] == y[1],
        _ => false,
    }
}

/// True if the words of any `needle` appear contiguously, in order, in any `haystack`.
pub fn address_match(needles: &[&str], haystacks: &[&str]) -> bool {
    needles.iter().any(|needle| {
        let words1 = split_words(&needle.to_lowercase());
        if words1.is_empty() {
            return false;
        }
        haystacks.iter().any(|hay| {
            let words2 = split_words(&hay.to_lowercase());
            words2.windows(words1.len()).any(|window| {
                window
                    .iter()
                    .zip(&words1)
                    .all(|(w2, w1)| match_street_word(w2, w1))
            })
        })
    })
}

/// Null handling for [`street_match`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreetMatchOptions {
    pub strictness: Strictness,
    /// Result for every candidate when the reference has no street name.
    pub match_addr_null: bool,
    /// Result for a candidate with no usable address.
    pub match_col_null: bool,
}

impl StreetMatchOptions {
    pub fn new(strictness: Strictness) -> Self {
        Self {
            strictness,
            match_addr_null: false,
            match_col_null: true,
        }
    }
}

/// Per-candidate flags plus the addresses that yielded no street name
/// (collected in lenient mode only; strict mode fails instead).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreetMatchReport {
    pub hits: Vec<bool>,
    pub unparsed: Vec<String>,
}

/// Street-level comparison of one reference address against many candidates.
pub struct AddressMatcher<'a> {
    parser: &'a dyn AddressParser,
    location: Option<&'a str>,
}

impl<'a> AddressMatcher<'a> {
    pub fn new(parser: &'a dyn AddressParser, location: Option<&'a str>) -> Self {
        Self { parser, location }
    }

    /// One flag per candidate. A missing reference matches nothing.
    pub fn street_match(
        &self,
        reference: Option<&str>,
        candidates: &[Option<&str>],
        options: StreetMatchOptions,
    ) -> Result<Vec<bool>, MatchError> {
        self.street_match_report(reference, candidates, options)
            .map(|report| report.hits)
    }

    pub fn street_match_report(
        &self,
        reference: Option<&str>,
        candidates: &[Option<&str>],
        options: StreetMatchOptions,
    ) -> Result<StreetMatchReport, MatchError> {
        let mut report = StreetMatchReport {
            hits: vec![false; candidates.len()],
            unparsed: Vec::new(),
        };
        let Some(reference) = reference else {
            return Ok(report);
        };
        // An intersection matches if either street does.
        for component in self.parser.tag(reference, self.location) {
            let unparsed = &mut report.unparsed;
            let hits =
                self.match_component(reference, &component, candidates, options, unparsed)?;
            for (m, hit) in report.hits.iter_mut().zip(hits) {
                *m |= hit;
            }
        }
        Ok(report)
    }

    fn match_component(
        &self,
        reference: &str,
        component: &TaggedAddress,
        candidates: &[Option<&str>],
        options: StreetMatchOptions,
        unparsed: &mut Vec<String>,
    ) -> Result<Vec<bool>, MatchError> {
        if component.kind == AddressKind::Null {
            return Ok(vec![false; candidates.len()]);
        }
        let streets = component.street_names();
        if streets.is_empty() {
            if !component.kind.is_streetless() {
                if options.strictness.is_strict() {
                    return Err(MatchError::ParseFailure {
                        address: reference.to_string(),
                        candidate_id: None,
                        reference_id: None,
                    });
                }
                unparsed.push(reference.to_string());
            }
            return Ok(vec![options.match_addr_null; candidates.len()]);
        }

        candidates
            .iter()
            .map(|candidate| self.match_candidate(&streets, *candidate, options, unparsed))
            .collect()
    }

    fn match_candidate(
        &self,
        streets: &[&str],
        candidate: Option<&str>,
        options: StreetMatchOptions,
        unparsed: &mut Vec<String>,
    ) -> Result<bool, MatchError> {
        let Some(candidate) = candidate.filter(|c| !c.trim().is_empty()) else {
            return Ok(options.match_col_null);
        };
        // Cheap prefilter on the raw string before tagging.
        if !address_match(streets, &[candidate]) {
            return Ok(false);
        }
        for component in self.parser.tag(candidate, self.location) {
            if component.kind.is_uninformative() {
                if options.match_col_null {
                    return Ok(true);
                }
                continue;
            }
            let candidate_streets = component.street_names();
            if candidate_streets.is_empty() {
                if options.strictness.is_strict() {
                    return Err(MatchError::ParseFailure {
                        address: candidate.to_string(),
                        candidate_id: None,
                        reference_id: None,
                    });
                }
                unparsed.push(candidate.to_string());
                continue;
            }
            if address_match(streets, &candidate_streets) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
