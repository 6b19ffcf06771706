//! OpenAPI specification for the attendo API.
//!
//! Served at `/api/openapi.json`, rendered by Swagger UI at `/docs`, and
//! written to the workspace root by the `gen-openapi` binary.

use attendo_core::{AttendanceStatus, PresenceState};
use axum::Json;
use utoipa::OpenApi;

use super::devices::DeviceResponse;
use super::error::ErrorResponse;
use super::health::HealthResponse;
use super::persons::{
    AttendanceResponse, OccurrenceAttendanceResponse, OccurrenceSightingsResponse,
    OngoingResponse, PresenceResponse, SightingsResponse,
};
use super::sightings::{SightingRequest, SightingResponse};
use super::system::{SweepReportResponse, SystemStatusResponse};

/// Serve the OpenAPI specification as JSON.
pub async fn get_openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Returns the OpenAPI specification as pretty JSON.
///
/// # Errors
///
/// Returns an error if the document cannot be serialized.
pub fn get_openapi_json() -> Result<String, serde_json::Error> {
    ApiDoc::openapi().to_pretty_json()
}

/// Main OpenAPI document structure for attendo.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "attendo API",
        version = "0.1.0",
        description = r#"
# attendo API

attendo infers who is in the room from the WiFi probe requests their phones
broadcast, and turns that presence into per-session course attendance.

## Overview

1. **Sightings**: sensors post every captured probe request
2. **Presence**: each device runs a state machine that confirms arrivals
   after two probes close together and departures after a silence longer
   than its learned probe interval
3. **Attendance**: arrivals and departures of registered devices open and
   close records against the sessions of the owner's courses

A background sweep drives departures of devices that have gone quiet.
"#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "/api", description = "Local attendo server")
    ),
    tags(
        (name = "system", description = "Health checks and system status"),
        (name = "sightings", description = "Probe request ingestion"),
        (name = "devices", description = "Per-device presence state"),
        (name = "attendance", description = "Per-person presence and course attendance")
    ),
    paths(
        super::health::health_check,
        super::sightings::submit_sighting,
        super::devices::get_device,
        super::persons::get_attendance,
        super::persons::get_sightings,
        super::persons::get_ongoing,
        super::persons::get_presence,
        super::system::get_status,
    ),
    components(
        schemas(
            ErrorResponse,
            HealthResponse,
            PresenceState,
            AttendanceStatus,
            SightingRequest,
            SightingResponse,
            DeviceResponse,
            AttendanceResponse,
            OccurrenceAttendanceResponse,
            SightingsResponse,
            OccurrenceSightingsResponse,
            OngoingResponse,
            PresenceResponse,
            SweepReportResponse,
            SystemStatusResponse,
        )
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_spec_generation() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "attendo API");
        assert!(spec.paths.paths.contains_key("/sightings"));
        assert!(spec
            .paths
            .paths
            .contains_key("/persons/{id}/courses/{course_id}/attendance"));
        assert!(spec
            .paths
            .paths
            .contains_key("/persons/{id}/courses/{course_id}/sightings"));
    }

    #[test]
    fn test_openapi_json_serialization() {
        let json = get_openapi_json().unwrap();
        assert!(json.contains("\"openapi\":"));
        assert!(json.contains("\"attendo API\""));
    }
}
