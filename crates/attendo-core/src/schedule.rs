//! Weekly course schedules and their concrete occurrences.
//!
//! Session times are local wall-clock times in the configured timezone.
//! All week arithmetic is done on local calendar dates and only the final
//! instant is converted to UTC, so a Monday 10:00 session stays at 10:00
//! across daylight-saving changes.

use chrono::{
    DateTime, Datelike, Days, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::types::CourseId;

/// One weekly slot of a course, e.g. "Monday 10:00".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OccurrenceSpec {
    /// Day of the week the session starts on.
    pub weekday: Weekday,
    /// Local start time.
    pub time: NaiveTime,
}

/// A recurring course as supplied by the enrollment system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    /// Course identifier.
    pub id: CourseId,
    /// Display name.
    pub name: String,
    /// Weekly start slots.
    pub sessions: Vec<OccurrenceSpec>,
    /// Length of each session in minutes.
    pub duration_minutes: u32,
    /// Minutes of presence required to count a session as attended.
    pub min_attend_minutes: u32,
    /// First local date on which sessions take place.
    pub start_date: NaiveDate,
    /// Local date from which sessions no longer take place (exclusive).
    pub end_date: Option<NaiveDate>,
}

/// One concrete session of a course.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Occurrence {
    /// Session start (UTC).
    pub start: DateTime<Utc>,
    /// Session end (UTC), exclusive.
    pub end: DateTime<Utc>,
    /// The weekly slot this occurrence realises.
    pub spec: OccurrenceSpecKey,
}

/// Orderable stand-in for [`OccurrenceSpec`] inside [`Occurrence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OccurrenceSpecKey {
    /// Days from Monday, 0..=6.
    pub weekday: u32,
    /// Local start time.
    pub time: NaiveTime,
}

impl From<OccurrenceSpec> for OccurrenceSpecKey {
    fn from(spec: OccurrenceSpec) -> Self {
        Self {
            weekday: spec.weekday.num_days_from_monday(),
            time: spec.time,
        }
    }
}

impl Occurrence {
    /// Whether `at` falls inside `[start, end)`.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// Length of the overlap between `[from, to)` and this occurrence.
    #[must_use]
    pub fn overlap(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
        let lo = from.max(self.start);
        let hi = to.min(self.end);
        (hi - lo).max(Duration::zero())
    }
}

impl Course {
    /// Session length.
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::minutes(i64::from(self.duration_minutes))
    }

    /// Required presence per session.
    #[must_use]
    pub fn min_attend(&self) -> Duration {
        Duration::minutes(i64::from(self.min_attend_minutes))
    }

    /// Whether the course has enough data to produce occurrences.
    #[must_use]
    pub fn has_valid_schedule(&self) -> bool {
        !self.sessions.is_empty()
            && self.duration_minutes > 0
            && self.end_date.map_or(true, |end| end > self.start_date)
    }

    /// Whether a session starting at `start` lies in the validity window.
    #[must_use]
    pub fn is_valid_start(&self, start: DateTime<Utc>, tz: Tz) -> bool {
        let date = start.with_timezone(&tz).date_naive();
        date >= self.start_date && self.end_date.map_or(true, |end| date < end)
    }

    fn occurrence(&self, spec: OccurrenceSpec, start: DateTime<Utc>) -> Occurrence {
        Occurrence {
            start,
            end: start
                .checked_add_signed(self.duration())
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            spec: spec.into(),
        }
    }

    /// The occurrence in progress at `now`, if any.
    ///
    /// Looks at the latest start not after `now` for each weekly slot, so a
    /// session that runs past midnight or into the next week is still found.
    #[must_use]
    pub fn is_ongoing(&self, now: DateTime<Utc>, tz: Tz) -> Option<Occurrence> {
        if self.duration_minutes == 0 {
            return None;
        }
        self.sessions
            .iter()
            .filter_map(|spec| {
                let start = previous_occurrence(*spec, now, tz);
                let occ = self.occurrence(*spec, start);
                (occ.contains(now) && self.is_valid_start(start, tz)).then_some(occ)
            })
            .min()
    }

    /// Earliest occurrence that has not yet ended at `now`.
    #[must_use]
    pub fn next_occurrence(&self, now: DateTime<Utc>, tz: Tz) -> Option<Occurrence> {
        if let Some(current) = self.is_ongoing(now, tz) {
            return Some(current);
        }
        let from = now.with_timezone(&tz).date_naive().max(self.start_date);
        let from = local_midnight(tz, from).max(now);
        self.sessions
            .iter()
            .filter_map(|spec| {
                let start = next_occurrence(*spec, from, tz);
                self.is_valid_start(start, tz)
                    .then(|| self.occurrence(*spec, start))
            })
            .min()
    }

    /// All occurrences starting in `[from, to)`, in chronological order,
    /// restricted to the course's validity window.
    #[must_use]
    pub fn occurrences_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        tz: Tz,
    ) -> Vec<Occurrence> {
        if !self.has_valid_schedule() {
            return Vec::new();
        }
        let window_start = local_midnight(tz, self.start_date).max(from);
        let window_end = self
            .end_date
            .map_or(to, |end| local_midnight(tz, end).min(to));

        let mut all: Vec<Occurrence> = self
            .sessions
            .iter()
            .flat_map(|spec| {
                enumerate_occurrences_since(*spec, window_start, window_end, tz)
                    .map(|start| self.occurrence(*spec, start))
            })
            .collect();
        all.sort();
        all.dedup();
        all
    }
}

/// Resolves a local wall-clock time to UTC.
///
/// Ambiguous times (clocks going back) resolve to the earlier instant;
/// non-existent times (clocks going forward) are pushed past the gap.
#[must_use]
pub fn resolve_local(tz: Tz, local: NaiveDateTime) -> DateTime<Utc> {
    tz.from_local_datetime(&local)
        .earliest()
        .or_else(|| {
            local
                .checked_add_signed(Duration::hours(1))
                .and_then(|shifted| tz.from_local_datetime(&shifted).earliest())
        })
        .map_or_else(
            || Utc.from_utc_datetime(&local),
            |dt| dt.with_timezone(&Utc),
        )
}

fn local_midnight(tz: Tz, date: NaiveDate) -> DateTime<Utc> {
    resolve_local(tz, date.and_time(NaiveTime::MIN))
}

fn shift_days(date: NaiveDate, days: i64) -> NaiveDate {
    let magnitude = Days::new(days.unsigned_abs());
    let shifted = if days >= 0 {
        date.checked_add_days(magnitude)
    } else {
        date.checked_sub_days(magnitude)
    };
    shifted.unwrap_or(date)
}

/// Local date of the slot's weekday in the same Monday-based week as
/// `reference`.
fn same_week_date(spec: OccurrenceSpec, reference: DateTime<Utc>, tz: Tz) -> NaiveDate {
    let date = reference.with_timezone(&tz).date_naive();
    let diff = i64::from(spec.weekday.num_days_from_monday())
        - i64::from(date.weekday().num_days_from_monday());
    shift_days(date, diff)
}

/// The slot's start nearest to, and not before, `reference`.
#[must_use]
pub fn next_occurrence(spec: OccurrenceSpec, reference: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let mut date = same_week_date(spec, reference, tz);
    let mut start = resolve_local(tz, date.and_time(spec.time));
    while start < reference {
        let Some(next) = date.checked_add_days(Days::new(7)) else {
            break;
        };
        date = next;
        start = resolve_local(tz, date.and_time(spec.time));
    }
    start
}

/// The slot's latest start not after `reference`.
#[must_use]
pub fn previous_occurrence(spec: OccurrenceSpec, reference: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let mut date = same_week_date(spec, reference, tz);
    let mut start = resolve_local(tz, date.and_time(spec.time));
    while start > reference {
        let Some(prev) = date.checked_sub_days(Days::new(7)) else {
            break;
        };
        date = prev;
        start = resolve_local(tz, date.and_time(spec.time));
    }
    start
}

/// Lazy, finite sequence of a slot's starts in `[from, to)`.
///
/// Holds no borrowed state; call [`enumerate_occurrences_since`] again to
/// restart from the beginning.
#[derive(Debug, Clone)]
pub struct Occurrences {
    spec: OccurrenceSpec,
    tz: Tz,
    next_date: Option<NaiveDate>,
    end: DateTime<Utc>,
}

impl Iterator for Occurrences {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        let date = self.next_date?;
        let start = resolve_local(self.tz, date.and_time(self.spec.time));
        if start >= self.end {
            self.next_date = None;
            return None;
        }
        self.next_date = date.checked_add_days(Days::new(7));
        Some(start)
    }
}

/// Starts of `spec` from the first one on or after `from`, advancing by
/// seven local days, up to (excluding) `to`.
#[must_use]
pub fn enumerate_occurrences_since(
    spec: OccurrenceSpec,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    tz: Tz,
) -> Occurrences {
    let first = next_occurrence(spec, from, tz);
    Occurrences {
        spec,
        tz,
        next_date: Some(first.with_timezone(&tz).date_naive()),
        end: to,
    }
}
