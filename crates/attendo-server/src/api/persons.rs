//! Per-person attendance and presence endpoints.
//!
//! Every query takes an optional `at` instant so callers can ask about the
//! past; it defaults to the receiver clock.

use attendo_core::{
    AttendanceStatus, CourseId, OccurrenceAttendance, OccurrenceSightings, PersonId,
    PresenceState, PresenceTracker,
};
use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::api::error::ApiResult;
use crate::state::SharedState;

/// Creates the persons router with all endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/{id}/courses/{course_id}/attendance", get(get_attendance))
        .route("/{id}/courses/{course_id}/sightings", get(get_sightings))
        .route("/{id}/ongoing", get(get_ongoing))
        .route("/{id}/presence", get(get_presence))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Reference instant for a query.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
pub struct AtQuery {
    /// Instant to evaluate at, RFC 3339. Defaults to now. May not lie
    /// further ahead than the tolerated sensor clock skew.
    #[param(example = "2025-03-03T11:30:00Z")]
    pub at: Option<DateTime<Utc>>,
}

impl AtQuery {
    fn resolve(&self, tracker: &PresenceTracker, now: DateTime<Utc>) -> ApiResult<DateTime<Utc>> {
        let at = self.at.unwrap_or(now);
        Ok(tracker.check_reference(at, now)?)
    }
}

/// Attendance of one course occurrence.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "date": "2025-03-03",
    "start_utc": "2025-03-03T10:00:00+00:00",
    "end_utc": "2025-03-03T11:30:00+00:00",
    "seconds_present": 3000,
    "status": "sufficient",
    "provisional": false
}))]
pub struct OccurrenceAttendanceResponse {
    /// Local calendar date of the session.
    #[schema(example = "2025-03-03")]
    pub date: String,

    /// Session start.
    pub start_utc: String,

    /// Session end.
    pub end_utc: String,

    /// Seconds the person was counted present.
    #[schema(example = 3000, minimum = 0)]
    pub seconds_present: i64,

    /// Verdict against the course minimum.
    pub status: AttendanceStatus,

    /// Whether the person is still present, so the total may grow.
    pub provisional: bool,
}

impl From<OccurrenceAttendance> for OccurrenceAttendanceResponse {
    fn from(occ: OccurrenceAttendance) -> Self {
        Self {
            date: occ.occurrence_date.to_string(),
            start_utc: occ.occurrence_start.to_rfc3339(),
            end_utc: occ.occurrence_end.to_rfc3339(),
            seconds_present: occ.seconds_present,
            status: occ.status,
            provisional: occ.provisional,
        }
    }
}

/// Attendance history of a person in a course.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AttendanceResponse {
    /// Person queried.
    #[schema(example = 7)]
    pub person_id: u64,

    /// Course queried.
    #[schema(example = 1)]
    pub course_id: u64,

    /// Course display name.
    #[schema(example = "Distributed Systems")]
    pub course_name: String,

    /// Minutes required per session.
    #[schema(example = 45)]
    pub min_attend_minutes: u32,

    /// Reference instant of the report.
    pub reference_utc: String,

    /// Sessions started on or before the reference, oldest first.
    pub occurrences: Vec<OccurrenceAttendanceResponse>,
}

/// Sightings recorded during one course occurrence.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "date": "2025-03-03",
    "start_utc": "2025-03-03T10:00:00+00:00",
    "end_utc": "2025-03-03T11:30:00+00:00",
    "count": 3,
    "offsets_minutes": [2, 14, 27]
}))]
pub struct OccurrenceSightingsResponse {
    /// Local calendar date of the session.
    pub date: String,

    /// Session start.
    pub start_utc: String,

    /// Session end.
    pub end_utc: String,

    /// Sightings in the session.
    pub count: usize,

    /// Whole minutes after the start at which each sighting arrived.
    pub offsets_minutes: Vec<i64>,
}

impl From<OccurrenceSightings> for OccurrenceSightingsResponse {
    fn from(occ: OccurrenceSightings) -> Self {
        Self {
            date: occ.occurrence_date.to_string(),
            start_utc: occ.occurrence_start.to_rfc3339(),
            end_utc: occ.occurrence_end.to_rfc3339(),
            count: occ.offsets_minutes.len(),
            offsets_minutes: occ.offsets_minutes,
        }
    }
}

/// Sighting history of a person's device in a course.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SightingsResponse {
    /// Person queried.
    #[schema(example = 7)]
    pub person_id: u64,

    /// Course queried.
    #[schema(example = 1)]
    pub course_id: u64,

    /// Session length in minutes, the upper bound of every offset.
    #[schema(example = 90)]
    pub duration_minutes: u32,

    /// Reference instant of the report.
    pub reference_utc: String,

    /// Sessions started on or before the reference, oldest first.
    pub occurrences: Vec<OccurrenceSightingsResponse>,
}

/// Ongoing courses of a person.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "person_id": 7,
    "at_utc": "2025-03-03T10:30:00+00:00",
    "course_ids": [1]
}))]
pub struct OngoingResponse {
    /// Person queried.
    pub person_id: u64,

    /// Instant evaluated.
    pub at_utc: String,

    /// Enrolled courses in session at that instant.
    pub course_ids: Vec<u64>,
}

/// Live presence of a person.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "person_id": 7,
    "device": "A4:5E:60:D2:11:0B",
    "state": "arrival",
    "present": true,
    "ongoing_course_ids": [1],
    "attending_course_ids": [1]
}))]
pub struct PresenceResponse {
    /// Person queried.
    pub person_id: u64,

    /// Registered device, if any.
    pub device: Option<String>,

    /// Presence state of that device; absent if never seen.
    pub state: Option<PresenceState>,

    /// Whether the device counts as present.
    pub present: bool,

    /// Enrolled courses in session.
    pub ongoing_course_ids: Vec<u64>,

    /// In-session courses with an open attendance record.
    pub attending_course_ids: Vec<u64>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Get per-session attendance of a person in a course.
#[utoipa::path(
    get,
    path = "/persons/{id}/courses/{course_id}/attendance",
    tag = "attendance",
    operation_id = "getAttendance",
    summary = "Get course attendance",
    description = "Lists every session of the course from its start date up to `at`, \
        with seconds present and a sufficient / marginal / insufficient verdict. \
        Sessions with a still-open record are marked provisional and counted up to `at`.",
    params(
        ("id" = u64, Path, description = "Person id"),
        ("course_id" = u64, Path, description = "Course id"),
        AtQuery
    ),
    responses(
        (status = 200, description = "Attendance computed", body = AttendanceResponse),
        (status = 400, description = "Reference instant too far ahead", body = super::error::ErrorResponse),
        (status = 404, description = "Unknown person or course", body = super::error::ErrorResponse),
        (status = 409, description = "Person not enrolled in course", body = super::error::ErrorResponse),
        (status = 422, description = "Course has no valid schedule", body = super::error::ErrorResponse)
    )
)]
pub async fn get_attendance(
    State(state): State<SharedState>,
    Path((id, course_id)): Path<(u64, u64)>,
    Query(query): Query<AtQuery>,
) -> ApiResult<Json<AttendanceResponse>> {
    let reference = query.resolve(state.tracker(), Utc::now())?;
    let (person, course) = (PersonId(id), CourseId(course_id));
    let occurrences = state
        .tracker()
        .get_attendance(person, course, reference)
        .await?;
    let (course_name, min_attend_minutes) = state
        .directory()
        .course(course)
        .map(|c| (c.name, c.min_attend_minutes))
        .unwrap_or_default();

    Ok(Json(AttendanceResponse {
        person_id: id,
        course_id,
        course_name,
        min_attend_minutes,
        reference_utc: reference.to_rfc3339(),
        occurrences: occurrences.into_iter().map(Into::into).collect(),
    }))
}

/// Get the sightings of a person's device per course session.
#[utoipa::path(
    get,
    path = "/persons/{id}/courses/{course_id}/sightings",
    tag = "attendance",
    operation_id = "getCourseSightings",
    summary = "Get course sightings",
    description = "Lists every session of the course from its start date up to `at`, \
        with the minute offsets at which the person's registered device was sighted.",
    params(
        ("id" = u64, Path, description = "Person id"),
        ("course_id" = u64, Path, description = "Course id"),
        AtQuery
    ),
    responses(
        (status = 200, description = "Sightings collected", body = SightingsResponse),
        (status = 400, description = "Reference instant too far ahead", body = super::error::ErrorResponse),
        (status = 404, description = "Unknown person or course", body = super::error::ErrorResponse),
        (status = 409, description = "Person not enrolled in course", body = super::error::ErrorResponse),
        (status = 422, description = "Course has no valid schedule", body = super::error::ErrorResponse)
    )
)]
pub async fn get_sightings(
    State(state): State<SharedState>,
    Path((id, course_id)): Path<(u64, u64)>,
    Query(query): Query<AtQuery>,
) -> ApiResult<Json<SightingsResponse>> {
    let reference = query.resolve(state.tracker(), Utc::now())?;
    let course = CourseId(course_id);
    let occurrences = state
        .tracker()
        .get_occurrence_sightings(PersonId(id), course, reference)?;
    let duration_minutes = state
        .directory()
        .course(course)
        .map(|c| c.duration_minutes)
        .unwrap_or_default();

    Ok(Json(SightingsResponse {
        person_id: id,
        course_id,
        duration_minutes,
        reference_utc: reference.to_rfc3339(),
        occurrences: occurrences.into_iter().map(Into::into).collect(),
    }))
}

/// Get a person's courses in session.
#[utoipa::path(
    get,
    path = "/persons/{id}/ongoing",
    tag = "attendance",
    operation_id = "getOngoingCourses",
    summary = "Get ongoing courses",
    description = "Returns the ids of the person's enrolled courses that are in session at `at`.",
    params(
        ("id" = u64, Path, description = "Person id"),
        AtQuery
    ),
    responses(
        (status = 200, description = "Ongoing courses", body = OngoingResponse),
        (status = 400, description = "Reference instant too far ahead", body = super::error::ErrorResponse),
        (status = 404, description = "Unknown person", body = super::error::ErrorResponse)
    )
)]
pub async fn get_ongoing(
    State(state): State<SharedState>,
    Path(id): Path<u64>,
    Query(query): Query<AtQuery>,
) -> ApiResult<Json<OngoingResponse>> {
    let at = query.resolve(state.tracker(), Utc::now())?;
    let ids = state.tracker().get_ongoing_course_ids(PersonId(id), at)?;

    Ok(Json(OngoingResponse {
        person_id: id,
        at_utc: at.to_rfc3339(),
        course_ids: ids.into_iter().map(|c| c.0).collect(),
    }))
}

/// Get a person's live presence.
#[utoipa::path(
    get,
    path = "/persons/{id}/presence",
    tag = "attendance",
    operation_id = "getPresence",
    summary = "Get live presence",
    description = "Reports whether the person's registered device is present and in which \
        in-session courses they are currently being counted.",
    params(
        ("id" = u64, Path, description = "Person id"),
        AtQuery
    ),
    responses(
        (status = 200, description = "Presence computed", body = PresenceResponse),
        (status = 400, description = "Reference instant too far ahead", body = super::error::ErrorResponse),
        (status = 404, description = "Unknown person", body = super::error::ErrorResponse)
    )
)]
pub async fn get_presence(
    State(state): State<SharedState>,
    Path(id): Path<u64>,
    Query(query): Query<AtQuery>,
) -> ApiResult<Json<PresenceResponse>> {
    let at = query.resolve(state.tracker(), Utc::now())?;
    let view = state.tracker().get_presence(PersonId(id), at).await?;

    Ok(Json(PresenceResponse {
        person_id: id,
        device: view.device.map(|d| d.to_string()),
        state: view.state,
        present: view.present,
        ongoing_course_ids: view.ongoing_courses.iter().map(|c| c.0).collect(),
        attending_course_ids: view.attending_courses.iter().map(|c| c.0).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use attendo_core::{MemoryStore, Roster, TrackerSettings};
    use chrono::{Duration, NaiveDate, TimeZone};
    use std::sync::Arc;

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(
            TrackerSettings::default(),
            Arc::new(Roster::default()),
            Arc::new(MemoryStore::new()),
        )
    }

    #[test]
    fn test_at_query_parses_rfc3339() {
        let now = Utc.with_ymd_and_hms(2025, 3, 3, 12, 0, 0).unwrap();
        let query: AtQuery = serde_json::from_str(r#"{"at": "2025-03-03T11:30:00Z"}"#).unwrap();
        assert_eq!(
            query.resolve(&tracker(), now).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 3, 11, 30, 0).unwrap()
        );
        assert_eq!(AtQuery::default().resolve(&tracker(), now).unwrap(), now);
    }

    #[test]
    fn test_at_query_rejects_far_future() {
        let now = Utc.with_ymd_and_hms(2025, 3, 3, 12, 0, 0).unwrap();
        let query = AtQuery {
            at: Some(now + Duration::days(1)),
        };
        assert!(matches!(
            query.resolve(&tracker(), now),
            Err(crate::api::error::ApiError::BadRequest { .. })
        ));
    }

    #[test]
    fn test_sightings_conversion_counts_offsets() {
        let occ = OccurrenceSightings {
            course: CourseId(1),
            occurrence_date: NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
            occurrence_start: Utc.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).unwrap(),
            occurrence_end: Utc.with_ymd_and_hms(2025, 3, 3, 11, 30, 0).unwrap(),
            offsets_minutes: vec![2, 14, 27],
        };
        let response = OccurrenceSightingsResponse::from(occ);
        assert_eq!(response.count, 3);
        assert_eq!(response.offsets_minutes, vec![2, 14, 27]);
    }

    #[test]
    fn test_occurrence_conversion() {
        let occ = OccurrenceAttendance {
            course: CourseId(1),
            occurrence_date: NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
            occurrence_start: Utc.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).unwrap(),
            occurrence_end: Utc.with_ymd_and_hms(2025, 3, 3, 11, 30, 0).unwrap(),
            seconds_present: 3000,
            status: AttendanceStatus::Sufficient,
            provisional: false,
        };
        let response = OccurrenceAttendanceResponse::from(occ);
        assert_eq!(response.date, "2025-03-03");
        assert_eq!(response.seconds_present, 3000);
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"sufficient\""));
    }
}
