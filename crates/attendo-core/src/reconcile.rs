//! Interval reconciliation: turns arrival/departure signals into
//! per-occurrence attendance.
//!
//! Each person owns a [`Ledger`] of [`AttendanceRecord`]s. A record opens
//! when a linked device is present during a scheduled occurrence and closes
//! on departure, with its time clipped to the occurrence window. Several
//! presence cycles within one occurrence produce several records whose
//! times add up.
//!
//! Re-applying the same signal never creates a second open record and never
//! counts time twice.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::schedule::{Course, Occurrence};
use crate::types::{CourseId, MacAddress, PersonId};

/// Reasons reconciliation is skipped for a signal or a course.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// The device is not linked to any person.
    #[error("device {0} is not linked to a person")]
    UnlinkedDevice(MacAddress),

    /// The course has no usable occurrence data.
    #[error("course {0} has no valid schedule")]
    InvalidSchedule(CourseId),
}

/// One presence interval of a person within one course occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    /// Record identifier (time-ordered).
    pub id: Uuid,
    /// Attending person.
    pub person: PersonId,
    /// Course the occurrence belongs to.
    pub course: CourseId,
    /// Occurrence start (UTC).
    pub occurrence_start: DateTime<Utc>,
    /// Occurrence end (UTC), exclusive.
    pub occurrence_end: DateTime<Utc>,
    /// Start of presence within the occurrence.
    pub arrival: DateTime<Utc>,
    /// End of presence; `None` while the record is open.
    pub departure: Option<DateTime<Utc>>,
    /// Seconds present, clipped to the occurrence. Zero while open.
    pub seconds_present: i64,
}

impl AttendanceRecord {
    /// Whether the record is still waiting for a departure.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.departure.is_none()
    }

    fn belongs_to(&self, course: CourseId, occurrence_start: DateTime<Utc>) -> bool {
        self.course == course && self.occurrence_start == occurrence_start
    }

    fn covers(&self, at: DateTime<Utc>) -> bool {
        self.arrival == at || (self.arrival <= at && self.departure.map_or(true, |d| at <= d))
    }

    fn clipped(&self, to: DateTime<Utc>) -> i64 {
        let lo = self.arrival.max(self.occurrence_start);
        let hi = to.min(self.occurrence_end);
        (hi - lo).num_seconds().max(0)
    }

    /// Seconds present as of `reference`. Open records count up to it.
    #[must_use]
    pub fn seconds_as_of(&self, reference: DateTime<Utc>) -> i64 {
        if self.is_open() {
            self.clipped(reference)
        } else {
            self.seconds_present
        }
    }
}

/// Attendance verdict for one occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    /// At least the required time.
    Sufficient,
    /// At least half the required time.
    Marginal,
    /// Less than half the required time.
    Insufficient,
}

impl AttendanceStatus {
    /// Classifies `seconds` against the required presence.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn classify(seconds: i64, required: Duration) -> Self {
        let required = required.num_seconds();
        if required <= 0 {
            return Self::Sufficient;
        }
        let ratio = seconds as f64 / required as f64;
        if ratio >= 1.0 {
            Self::Sufficient
        } else if ratio >= 0.5 {
            Self::Marginal
        } else {
            Self::Insufficient
        }
    }
}

/// Attendance summary of one occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccurrenceAttendance {
    /// Course.
    pub course: CourseId,
    /// Local calendar date of the occurrence.
    pub occurrence_date: NaiveDate,
    /// Occurrence start (UTC).
    pub occurrence_start: DateTime<Utc>,
    /// Occurrence end (UTC).
    pub occurrence_end: DateTime<Utc>,
    /// Total seconds present across all records.
    pub seconds_present: i64,
    /// Verdict against the course minimum.
    pub status: AttendanceStatus,
    /// Whether a record of this occurrence is still open.
    pub provisional: bool,
}

/// All attendance records of one person.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    /// Owner.
    pub person: PersonId,
    records: Vec<AttendanceRecord>,
}

impl Ledger {
    /// An empty ledger.
    #[must_use]
    pub const fn new(person: PersonId) -> Self {
        Self {
            person,
            records: Vec::new(),
        }
    }

    /// Records in creation order.
    #[must_use]
    pub fn records(&self) -> &[AttendanceRecord] {
        &self.records
    }

    /// Whether any record is open.
    #[must_use]
    pub fn has_open(&self) -> bool {
        self.records.iter().any(AttendanceRecord::is_open)
    }

    /// The open record of an occurrence, if any.
    #[must_use]
    pub fn open_record(
        &self,
        course: CourseId,
        occurrence_start: DateTime<Utc>,
    ) -> Option<&AttendanceRecord> {
        self.records
            .iter()
            .find(|r| r.is_open() && r.belongs_to(course, occurrence_start))
    }

    /// Opens a record for `occurrence` starting at `arrival`.
    ///
    /// Returns `None` when the arrival is a replay: an open record already
    /// exists for the occurrence, or an existing record starts at or covers
    /// `arrival`.
    pub fn open(
        &mut self,
        course: CourseId,
        occurrence: &Occurrence,
        arrival: DateTime<Utc>,
    ) -> Option<&AttendanceRecord> {
        let arrival = arrival.max(occurrence.start);
        if arrival >= occurrence.end {
            return None;
        }
        let replay = self
            .records
            .iter()
            .filter(|r| r.belongs_to(course, occurrence.start))
            .any(|r| r.is_open() || r.covers(arrival));
        if replay {
            return None;
        }
        self.records.push(AttendanceRecord {
            id: Uuid::now_v7(),
            person: self.person,
            course,
            occurrence_start: occurrence.start,
            occurrence_end: occurrence.end,
            arrival,
            departure: None,
            seconds_present: 0,
        });
        self.records.last()
    }

    /// Closes every open record whose arrival is not after `departure`.
    ///
    /// Returns the records that were closed. Closing is idempotent: a
    /// repeated departure finds nothing open.
    pub fn close_open(&mut self, departure: DateTime<Utc>) -> Vec<AttendanceRecord> {
        let mut closed = Vec::new();
        for record in self
            .records
            .iter_mut()
            .filter(|r| r.is_open() && r.arrival <= departure)
        {
            record.departure = Some(departure);
            record.seconds_present = record.clipped(departure);
            closed.push(record.clone());
        }
        closed
    }

    /// Seconds present in one occurrence as of `reference`.
    #[must_use]
    pub fn seconds_for(
        &self,
        course: CourseId,
        occurrence_start: DateTime<Utc>,
        reference: DateTime<Utc>,
    ) -> i64 {
        self.records
            .iter()
            .filter(|r| r.belongs_to(course, occurrence_start))
            .map(|r| r.seconds_as_of(reference))
            .sum()
    }
}

fn check_schedule(course: &Course) -> Result<(), ReconcileError> {
    if course.has_valid_schedule() {
        Ok(())
    } else {
        Err(ReconcileError::InvalidSchedule(course.id))
    }
}

/// Opens records for every course ongoing at `now` while the person has
/// been present since `present_since`.
///
/// For a live arrival both instants are the arrival time. The sweep calls
/// it with an older `present_since` to catch up on sessions that began
/// while the person was already in the room. Courses without a usable
/// schedule are skipped with a warning.
pub fn reconcile_arrival(
    ledger: &mut Ledger,
    courses: &[Course],
    present_since: DateTime<Utc>,
    now: DateTime<Utc>,
    tz: Tz,
) -> Vec<AttendanceRecord> {
    let person = ledger.person;
    let mut opened = Vec::new();
    for course in courses {
        if let Err(e) = check_schedule(course) {
            tracing::warn!(person = %person, error = %e, "Skipping course");
            continue;
        }
        let Some(occurrence) = course.is_ongoing(now, tz) else {
            continue;
        };
        if let Some(record) = ledger.open(course.id, &occurrence, present_since) {
            tracing::info!(
                person = %person,
                course = %course.id,
                arrival = %record.arrival,
                occurrence_start = %occurrence.start,
                "Attendance record opened"
            );
            opened.push(record.clone());
        }
    }
    opened
}

/// Closes the person's open records at `departure`.
pub fn reconcile_departure(ledger: &mut Ledger, departure: DateTime<Utc>) -> Vec<AttendanceRecord> {
    let closed = ledger.close_open(departure);
    for record in &closed {
        tracing::info!(
            person = %ledger.person,
            course = %record.course,
            seconds_present = record.seconds_present,
            "Attendance record closed"
        );
    }
    closed
}

/// Lists every occurrence of `course` from its start date up to
/// `reference`, with the time present and its verdict.
///
/// Occurrences already started but not finished are included; their open
/// records count provisionally up to `reference`.
///
/// # Errors
///
/// Returns [`ReconcileError::InvalidSchedule`] if the course cannot produce
/// occurrences.
pub fn get_attendance(
    ledger: &Ledger,
    course: &Course,
    reference: DateTime<Utc>,
    tz: Tz,
) -> Result<Vec<OccurrenceAttendance>, ReconcileError> {
    check_schedule(course)?;
    let until = reference
        .checked_add_signed(Duration::seconds(1))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    Ok(course
        .occurrences_between(DateTime::<Utc>::MIN_UTC, until, tz)
        .into_iter()
        .filter(|occ| occ.start <= reference)
        .map(|occ| {
            let seconds = ledger.seconds_for(course.id, occ.start, reference);
            OccurrenceAttendance {
                course: course.id,
                occurrence_date: occ.start.with_timezone(&tz).date_naive(),
                occurrence_start: occ.start,
                occurrence_end: occ.end,
                seconds_present: seconds,
                status: AttendanceStatus::classify(seconds, course.min_attend()),
                provisional: ledger.open_record(course.id, occ.start).is_some(),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::OccurrenceSpec;
    use chrono::{NaiveTime, TimeZone, Weekday};

    const TZ: Tz = chrono_tz::UTC;

    fn course() -> Course {
        Course {
            id: CourseId(1),
            name: "Distributed Systems".to_string(),
            sessions: vec![OccurrenceSpec {
                weekday: Weekday::Mon,
                time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            }],
            duration_minutes: 90,
            min_attend_minutes: 45,
            start_date: NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
            end_date: None,
        }
    }

    // 2025-03-10 is a Monday.
    fn mon(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn test_continuous_presence_counts_exact_seconds() {
        let mut ledger = Ledger::new(PersonId(7));
        let courses = [course()];

        let opened = reconcile_arrival(&mut ledger, &courses, mon(10, 5), mon(10, 5), TZ);
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].arrival, mon(10, 5));

        let closed = reconcile_departure(&mut ledger, mon(10, 55));
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].seconds_present, 3000);

        let report = get_attendance(&ledger, &courses[0], mon(12, 0), TZ).unwrap();
        let today = report.last().unwrap();
        assert_eq!(today.occurrence_date, NaiveDate::from_ymd_opt(2025, 3, 10).unwrap());
        assert_eq!(today.seconds_present, 3000);
        assert_eq!(today.status, AttendanceStatus::Sufficient);
        assert!(!today.provisional);
    }

    #[test]
    fn test_status_boundaries() {
        let min = Duration::minutes(45);
        assert_eq!(AttendanceStatus::classify(2700, min), AttendanceStatus::Sufficient);
        assert_eq!(AttendanceStatus::classify(2699, min), AttendanceStatus::Marginal);
        assert_eq!(AttendanceStatus::classify(1350, min), AttendanceStatus::Marginal);
        assert_eq!(AttendanceStatus::classify(1349, min), AttendanceStatus::Insufficient);
        assert_eq!(AttendanceStatus::classify(0, min), AttendanceStatus::Insufficient);
        assert_eq!(
            AttendanceStatus::classify(0, Duration::zero()),
            AttendanceStatus::Sufficient
        );
    }

    #[test]
    fn test_replayed_arrival_creates_one_record() {
        let mut ledger = Ledger::new(PersonId(7));
        let courses = [course()];
        reconcile_arrival(&mut ledger, &courses, mon(10, 5), mon(10, 5), TZ);
        let again = reconcile_arrival(&mut ledger, &courses, mon(10, 5), mon(10, 5), TZ);
        assert!(again.is_empty());
        assert_eq!(ledger.records().len(), 1);
    }

    #[test]
    fn test_replay_after_close_is_ignored() {
        let mut ledger = Ledger::new(PersonId(7));
        let courses = [course()];
        reconcile_arrival(&mut ledger, &courses, mon(10, 5), mon(10, 5), TZ);
        reconcile_departure(&mut ledger, mon(10, 30));

        assert!(reconcile_arrival(&mut ledger, &courses, mon(10, 5), mon(10, 5), TZ).is_empty());
        assert!(reconcile_arrival(&mut ledger, &courses, mon(10, 20), mon(10, 20), TZ).is_empty());
        assert!(reconcile_departure(&mut ledger, mon(10, 30)).is_empty());
        assert_eq!(ledger.seconds_for(CourseId(1), mon(10, 0), mon(12, 0)), 1500);
    }

    #[test]
    fn test_multiple_cycles_add_up() {
        let mut ledger = Ledger::new(PersonId(7));
        let courses = [course()];
        reconcile_arrival(&mut ledger, &courses, mon(10, 0), mon(10, 0), TZ);
        reconcile_departure(&mut ledger, mon(10, 20));
        reconcile_arrival(&mut ledger, &courses, mon(10, 40), mon(10, 40), TZ);
        reconcile_departure(&mut ledger, mon(11, 5));

        assert_eq!(ledger.records().len(), 2);
        assert_eq!(ledger.seconds_for(CourseId(1), mon(10, 0), mon(12, 0)), 45 * 60);
    }

    #[test]
    fn test_departure_after_session_is_clipped() {
        let mut ledger = Ledger::new(PersonId(7));
        let courses = [course()];
        reconcile_arrival(&mut ledger, &courses, mon(11, 0), mon(11, 0), TZ);
        let closed = reconcile_departure(&mut ledger, mon(14, 0));
        assert_eq!(closed[0].seconds_present, 30 * 60);
    }

    #[test]
    fn test_arrival_outside_session_opens_nothing() {
        let mut ledger = Ledger::new(PersonId(7));
        let courses = [course()];
        assert!(reconcile_arrival(&mut ledger, &courses, mon(9, 0), mon(9, 0), TZ).is_empty());
        assert!(reconcile_arrival(&mut ledger, &courses, mon(11, 30), mon(11, 30), TZ).is_empty());
        assert!(!ledger.has_open());
    }

    #[test]
    fn test_catch_up_clips_arrival_to_session_start() {
        let mut ledger = Ledger::new(PersonId(7));
        let courses = [course()];
        let opened = reconcile_arrival(&mut ledger, &courses, mon(9, 40), mon(10, 1), TZ);
        assert_eq!(opened[0].arrival, mon(10, 0));
    }

    #[test]
    fn test_invalid_course_is_skipped() {
        let mut ledger = Ledger::new(PersonId(7));
        let mut broken = course();
        broken.id = CourseId(2);
        broken.sessions.clear();
        let courses = [broken.clone(), course()];

        let opened = reconcile_arrival(&mut ledger, &courses, mon(10, 5), mon(10, 5), TZ);
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].course, CourseId(1));
        assert_eq!(
            get_attendance(&ledger, &broken, mon(12, 0), TZ),
            Err(ReconcileError::InvalidSchedule(CourseId(2)))
        );
    }

    #[test]
    fn test_attendance_lists_every_occurrence() {
        let mut ledger = Ledger::new(PersonId(7));
        let courses = [course()];
        reconcile_arrival(&mut ledger, &courses, mon(10, 30), mon(10, 30), TZ);

        // Course started 2025-03-03; the second session is in progress.
        let report = get_attendance(&ledger, &courses[0], mon(11, 0), TZ).unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].seconds_present, 0);
        assert_eq!(report[0].status, AttendanceStatus::Insufficient);
        assert!(report[1].provisional);
        assert_eq!(report[1].seconds_present, 30 * 60);
        assert_eq!(report[1].status, AttendanceStatus::Marginal);
    }

    #[test]
    fn test_attendance_before_course_start_is_empty() {
        let ledger = Ledger::new(PersonId(7));
        let early = Utc.with_ymd_and_hms(2025, 1, 6, 10, 0, 0).unwrap();
        assert!(get_attendance(&ledger, &course(), early, TZ).unwrap().is_empty());
    }

    #[test]
    fn test_attendance_at_latest_instant() {
        let mut ledger = Ledger::new(PersonId(7));
        let mut bounded = course();
        bounded.end_date = NaiveDate::from_ymd_opt(2025, 3, 17);
        reconcile_arrival(&mut ledger, &[bounded.clone()], mon(10, 30), mon(10, 30), TZ);

        let report = get_attendance(&ledger, &bounded, DateTime::<Utc>::MAX_UTC, TZ).unwrap();
        assert_eq!(report.len(), 2);
        assert_eq!(report[1].seconds_present, 60 * 60);
    }

    #[test]
    fn test_ledger_serialization() {
        let mut ledger = Ledger::new(PersonId(7));
        reconcile_arrival(&mut ledger, &[course()], mon(10, 5), mon(10, 5), TZ);
        let json = serde_json::to_string(&ledger).unwrap();
        let back: Ledger = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ledger);
    }
}
