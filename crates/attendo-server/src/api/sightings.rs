//! Sighting ingestion endpoint.
//!
//! Sensors post every probe request they capture. A sighting only ever
//! advances the device's presence machine; attendance records follow from
//! the arrival and departure it may produce.

use attendo_core::{PresenceState, SightingInput, SightingReceipt};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use utoipa::ToSchema;

use crate::api::error::ApiResult;
use crate::state::SharedState;

/// Creates the sightings router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/", post(submit_sighting))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// One captured probe request.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[schema(example = json!({
    "device": "a4:5e:60:d2:11:0b",
    "timestamp": "2025-03-03T10:05:12.250Z",
    "rssi": -61,
    "ssid": "eduroam"
}))]
pub struct SightingRequest {
    /// Transmitter hardware address, colon, dash or bare hex.
    #[schema(example = "a4:5e:60:d2:11:0b")]
    pub device: String,

    /// Capture time. Defaults to the receiver clock when omitted.
    #[schema(example = "2025-03-03T10:05:12.250Z")]
    pub timestamp: Option<DateTime<Utc>>,

    /// Received signal strength in dBm.
    #[schema(example = -61)]
    pub rssi: Option<i16>,

    /// Network name probed for; absent or empty for a wildcard probe.
    #[schema(example = "eduroam")]
    pub ssid: Option<String>,

    /// Raw frame bytes as hex, kept for audit only.
    pub raw: Option<String>,
}

/// Outcome of an accepted sighting.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "device": "A4:5E:60:D2:11:0B",
    "state": "arrival",
    "person_id": 7,
    "arrived": true,
    "departed": false,
    "records_opened": 1,
    "records_closed": 0
}))]
pub struct SightingResponse {
    /// Canonical device address.
    #[schema(example = "A4:5E:60:D2:11:0B")]
    pub device: String,

    /// Presence state after the sighting.
    pub state: PresenceState,

    /// Person the device is registered to, if any.
    #[schema(example = 7)]
    pub person_id: Option<u64>,

    /// Whether this sighting confirmed an arrival.
    pub arrived: bool,

    /// Whether this sighting closed out a pending departure.
    pub departed: bool,

    /// Attendance records opened as a result.
    pub records_opened: usize,

    /// Attendance records closed as a result.
    pub records_closed: usize,
}

impl From<SightingReceipt> for SightingResponse {
    fn from(receipt: SightingReceipt) -> Self {
        Self {
            device: receipt.device.to_string(),
            state: receipt.state,
            person_id: receipt.person.map(|p| p.0),
            arrived: receipt.arrived,
            departed: receipt.departed,
            records_opened: receipt.records_opened,
            records_closed: receipt.records_closed,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Submit a probe sighting.
#[utoipa::path(
    post,
    path = "/sightings",
    tag = "sightings",
    operation_id = "submitSighting",
    summary = "Submit a probe sighting",
    description = "Feeds one captured probe request into the device's presence machine. \
        Sightings from devices not registered to any person are still tracked but never \
        produce attendance. Timestamps further in the future than the configured clock \
        skew are rejected.",
    request_body = SightingRequest,
    responses(
        (status = 201, description = "Sighting accepted", body = SightingResponse),
        (status = 400, description = "Malformed sighting", body = super::error::ErrorResponse)
    )
)]
pub async fn submit_sighting(
    State(state): State<SharedState>,
    Json(request): Json<SightingRequest>,
) -> ApiResult<(StatusCode, Json<SightingResponse>)> {
    let now = Utc::now();
    let input = SightingInput {
        device: request.device,
        timestamp: request.timestamp.unwrap_or(now),
        rssi: request.rssi,
        ssid: request.ssid,
        raw: request.raw,
    };

    let receipt = state.tracker().submit_sighting(input, now).await?;
    debug!(device = %receipt.device, state = ?receipt.state, "Sighting accepted");

    Ok((StatusCode::CREATED, Json(SightingResponse::from(receipt))))
}
