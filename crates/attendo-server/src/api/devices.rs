//! Device inspection endpoint.

use attendo_core::{AttendoError, DeviceIdentity, MacAddress, PresenceState};
use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::ApiResult;
use crate::state::SharedState;

/// Creates the devices router.
pub fn router() -> Router<SharedState> {
    Router::new().route("/{address}", get(get_device))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Snapshot of one device's presence machine.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "address": "A4:5E:60:D2:11:0B",
    "state": "arrival",
    "present": true,
    "person_id": 7,
    "first_seen": "2025-03-03T09:58:01Z",
    "last_seen": "2025-03-03T10:41:12Z",
    "present_since": "2025-03-03T09:58:31Z",
    "withdrawn_at": null,
    "sighting_count": 88,
    "burst_interval_secs": 300.0,
    "burst_samples": 9
}))]
pub struct DeviceResponse {
    /// Canonical device address.
    #[schema(example = "A4:5E:60:D2:11:0B")]
    pub address: String,

    /// Current presence state.
    pub state: PresenceState,

    /// Whether the device counts as present.
    pub present: bool,

    /// Person the device is registered to.
    pub person_id: Option<u64>,

    /// First sighting ever recorded.
    pub first_seen: String,

    /// Latest sighting of the current cycle.
    pub last_seen: Option<String>,

    /// Confirmation time of the current presence cycle.
    pub present_since: Option<String>,

    /// When the device crossed its withdrawal threshold.
    pub withdrawn_at: Option<String>,

    /// Accepted sightings.
    pub sighting_count: u64,

    /// Burst interval in force, in seconds.
    #[schema(example = 300.0)]
    pub burst_interval_secs: f64,

    /// Inter-burst gaps the estimate is built from.
    pub burst_samples: u64,
}

// ============================================================================
// Handlers
// ============================================================================

/// Get a device's presence machine.
#[utoipa::path(
    get,
    path = "/devices/{address}",
    tag = "devices",
    operation_id = "getDevice",
    summary = "Inspect a device",
    description = "Returns the current presence state, timestamps and burst interval \
        estimate of a device. The address may use colons, dashes or bare hex.",
    params(
        ("address" = String, Path, description = "Device hardware address", example = "a4:5e:60:d2:11:0b")
    ),
    responses(
        (status = 200, description = "Device found", body = DeviceResponse),
        (status = 400, description = "Malformed address", body = super::error::ErrorResponse),
        (status = 404, description = "Device never seen", body = super::error::ErrorResponse)
    )
)]
pub async fn get_device(
    State(state): State<SharedState>,
    Path(address): Path<String>,
) -> ApiResult<Json<DeviceResponse>> {
    let address: MacAddress = address.parse()?;
    let tracker = state.tracker();
    let device = tracker
        .device_snapshot(&address)
        .await
        .ok_or_else(|| AttendoError::DeviceNotFound(address.to_string()))?;

    let person = state.directory().person_for_device(&address);
    let thresholds = tracker.settings().thresholds;
    Ok(Json(device_response(&device, person.map(|p| p.0), &thresholds)))
}

#[allow(clippy::cast_precision_loss)]
fn device_response(
    device: &DeviceIdentity,
    person_id: Option<u64>,
    thresholds: &attendo_core::Thresholds,
) -> DeviceResponse {
    let machine = &device.machine;
    let interval = machine.interval(thresholds);
    DeviceResponse {
        address: device.address.to_string(),
        state: machine.state,
        present: machine.state.is_present(),
        person_id,
        first_seen: device.first_seen.to_rfc3339(),
        last_seen: machine.last_seen.map(|t| t.to_rfc3339()),
        present_since: machine.present_since.map(|t| t.to_rfc3339()),
        withdrawn_at: machine.withdrawn_at.map(|t| t.to_rfc3339()),
        sighting_count: device.sighting_count,
        burst_interval_secs: interval.num_milliseconds() as f64 / 1000.0,
        burst_samples: machine.burst.count(),
    }
}
