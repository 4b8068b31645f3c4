//! Date proximity: calendar-day equality, tolerance windows, and month-typo tolerance.

use chrono::{Datelike, Duration, NaiveDateTime};

use crate::error::MatchError;
use crate::model::IncidentDate;

/// How close two incident dates must be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateMatcher {
    /// `None`: same calendar day. Otherwise: within this distance.
    pub max_diff: Option<Duration>,
    /// Also accept same year and day with the month off by one. Never for periods.
    pub allow_month_error: bool,
}

impl DateMatcher {
    pub fn exact() -> Self {
        Self::default()
    }

    pub fn within_days(days: i64) -> Self {
        Self {
            max_diff: Some(Duration::days(days)),
            allow_month_error: false,
        }
    }

    pub fn from_stage(max_diff_days: Option<i64>, allow_month_error: bool) -> Self {
        Self {
            max_diff: max_diff_days.map(Duration::days),
            allow_month_error,
        }
    }

    /// One flag per date in `dates`.
    pub fn matches(
        &self,
        dates: &[IncidentDate],
        reference: &IncidentDate,
    ) -> Result<Vec<bool>, MatchError> {
        dates.iter().map(|d| self.matches_one(d, reference)).collect()
    }

    pub fn matches_one(
        &self,
        date: &IncidentDate,
        reference: &IncidentDate,
    ) -> Result<bool, MatchError> {
        let mut hit = match self.max_diff {
            Some(max) => within(date, reference, max)?,
            None => same_day(date, reference),
        };
        if !hit && self.allow_month_error {
            hit = month_typo(date, reference);
        }
        Ok(hit)
    }
}

/// Calendar-day equality, ignoring time of day. An instant matches a period
/// containing it, from either side; two periods match only when identical.
pub fn same_day(date: &IncidentDate, reference: &IncidentDate) -> bool {
    match (date.calendar_day(), reference.calendar_day()) {
        (Some(a), Some(b)) => a == b,
        (Some(day), None) => contains(reference, day),
        (None, Some(day)) => contains(date, day),
        (None, None) => date == reference,
    }
}

fn contains(period: &IncidentDate, day: chrono::NaiveDate) -> bool {
    match period {
        IncidentDate::Period { start, end } => start.date() <= day && day <= end.date(),
        IncidentDate::Instant(dt) => dt.date() == day,
    }
}

/// Same year and day of month, months one apart (a likely typo in the month).
pub fn month_typo(date: &IncidentDate, reference: &IncidentDate) -> bool {
    match (date, reference) {
        (IncidentDate::Instant(a), IncidentDate::Instant(b)) => {
            a.year() == b.year()
                && a.day() == b.day()
                && (a.month() as i32 - b.month() as i32).abs() == 1
        }
        _ => false,
    }
}

/// Upper and lower distance bounds for `in_date_range`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateWindow {
    /// No farther apart than this.
    pub max_delta: Option<Duration>,
    /// No closer than this. Rules out near-matches that would be ambiguous.
    pub min_delta: Option<Duration>,
}

impl DateWindow {
    pub fn max_days(days: i64) -> Self {
        Self {
            max_delta: Some(Duration::days(days)),
            min_delta: None,
        }
    }

    pub fn min_days(days: i64) -> Self {
        Self {
            max_delta: None,
            min_delta: Some(Duration::days(days)),
        }
    }

    pub fn between_days(min: i64, max: i64) -> Self {
        Self {
            max_delta: Some(Duration::days(max)),
            min_delta: Some(Duration::days(min)),
        }
    }
}

/// Element-wise window test. A length-1 side is broadcast against the other.
pub fn in_date_range(
    d1: &[IncidentDate],
    d2: &[IncidentDate],
    window: DateWindow,
) -> Result<Vec<bool>, MatchError> {
    let n = match (d1.len(), d2.len()) {
        (a, b) if a == b => a,
        (1, b) => b,
        (a, 1) => a,
        (a, b) => return Err(MatchError::SizeMismatch { left: a, right: b }),
    };
    (0..n)
        .map(|i| {
            let a = if d1.len() == 1 { &d1[0] } else { &d1[i] };
            let b = if d2.len() == 1 { &d2[0] } else { &d2[i] };
            in_window(a, b, window)
        })
        .collect()
}

/// Scalar form of [`in_date_range`].
pub fn in_window(a: &IncidentDate, b: &IncidentDate, window: DateWindow) -> Result<bool, MatchError> {
    let mut hit = true;
    if let Some(max) = window.max_delta {
        hit = within(a, b, max)?;
    }
    if let Some(min) = window.min_delta {
        hit = hit && at_least(a, b, min)?;
    }
    Ok(hit)
}

/// Reference instant and test date within `max` of each other.
pub fn within(a: &IncidentDate, b: &IncidentDate, max: Duration) -> Result<bool, MatchError> {
    Ok(match instant_and_other(a, b)? {
        (x, IncidentDate::Instant(y)) => abs_diff(x, *y) <= max,
        (x, IncidentDate::Period { start, end }) => {
            (*start <= x && x <= *end) || abs_diff(*end, x) <= max || abs_diff(*start, x) <= max
        }
    })
}

/// At least `min` apart. An instant inside a period also counts.
pub fn at_least(a: &IncidentDate, b: &IncidentDate, min: Duration) -> Result<bool, MatchError> {
    Ok(match instant_and_other(a, b)? {
        (x, IncidentDate::Instant(y)) => abs_diff(x, *y) >= min,
        (x, IncidentDate::Period { start, end }) => {
            (*start <= x && x <= *end) || abs_diff(*end, x) >= min || abs_diff(*start, x) >= min
        }
    })
}

fn instant_and_other<'a>(
    a: &'a IncidentDate,
    b: &'a IncidentDate,
) -> Result<(NaiveDateTime, &'a IncidentDate), MatchError> {
    match (a, b) {
        (IncidentDate::Instant(x), other) => Ok((*x, other)),
        (other, IncidentDate::Instant(y)) => Ok((*y, other)),
        _ => Err(MatchError::UnhandledComparison {
            field: "date",
            candidate: a.to_string(),
            reference: b.to_string(),
            candidate_id: None,
            reference_id: None,
        }),
    }
}

fn abs_diff(a: NaiveDateTime, b: NaiveDateTime) -> Duration {
    let d = a - b;
    if d < Duration::zero() {
        -d
    } else {
        d
    }
}
