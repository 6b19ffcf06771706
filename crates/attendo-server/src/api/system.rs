//! System API endpoints.
//!
//! Reports uptime, tracker size and the outcome of the latest sweep.

use std::sync::OnceLock;
use std::time::Instant;

use attendo_core::SweepReport;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::error::ApiResult;
use crate::state::SharedState;

/// Creates the system router with all endpoints.
pub fn router() -> Router<SharedState> {
    Router::new().route("/status", get(get_status))
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Summary of one sweep pass.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "at": "2025-03-03T11:02:30Z",
    "scanned": 40,
    "transitions": 3,
    "departures": 1,
    "records_opened": 0,
    "records_closed": 1,
    "busy": 0,
    "cancelled": false
}))]
pub struct SweepReportResponse {
    /// Receiver time the pass ran at.
    #[schema(example = "2025-03-03T11:02:30Z")]
    pub at: Option<String>,

    /// Devices examined.
    pub scanned: usize,

    /// Machine transitions taken.
    pub transitions: usize,

    /// Departures confirmed.
    pub departures: usize,

    /// Attendance records opened, from catch-up of sessions that started
    /// while a device was already present.
    pub records_opened: usize,

    /// Attendance records closed by departures.
    pub records_closed: usize,

    /// Devices skipped because a sighting held their lock.
    pub busy: usize,

    /// Whether the pass stopped early for shutdown.
    pub cancelled: bool,
}

impl From<SweepReport> for SweepReportResponse {
    fn from(report: SweepReport) -> Self {
        Self {
            at: report.at.map(|at| at.to_rfc3339()),
            scanned: report.scanned,
            transitions: report.transitions,
            departures: report.departures,
            records_opened: report.records_opened,
            records_closed: report.records_closed,
            busy: report.busy,
            cancelled: report.cancelled,
        }
    }
}

/// System status response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "version": "0.1.0",
    "uptime_secs": 3600,
    "timezone": "Europe/Berlin",
    "sweep_interval_secs": 15,
    "devices_tracked": 40,
    "devices_present": 12,
    "last_sweep": null
}))]
pub struct SystemStatusResponse {
    /// Server version.
    #[schema(example = "0.1.0")]
    pub version: String,

    /// Server uptime in seconds.
    #[schema(example = 3600)]
    pub uptime_secs: u64,

    /// Timezone schedules are evaluated in.
    #[schema(example = "Europe/Berlin")]
    pub timezone: String,

    /// Seconds between sweep passes.
    #[schema(example = 15)]
    pub sweep_interval_secs: u64,

    /// Devices ever seen.
    #[schema(example = 40)]
    pub devices_tracked: usize,

    /// Devices currently in `arrival` or `potential_departure`.
    #[schema(example = 12)]
    pub devices_present: usize,

    /// Latest completed sweep, if any has run.
    #[schema(nullable)]
    pub last_sweep: Option<SweepReportResponse>,
}

// ============================================================================
// Static state for uptime tracking
// ============================================================================

static SERVER_START_TIME: OnceLock<Instant> = OnceLock::new();

/// Initialize the server start time. Call this once at startup.
pub fn init_start_time() {
    SERVER_START_TIME.get_or_init(Instant::now);
}

/// Get server uptime in seconds.
fn get_uptime_secs() -> u64 {
    SERVER_START_TIME
        .get()
        .map_or(0, |start| start.elapsed().as_secs())
}

// ============================================================================
// Handlers
// ============================================================================

/// Get system status.
#[utoipa::path(
    get,
    path = "/system/status",
    tag = "system",
    operation_id = "getSystemStatus",
    summary = "Get system status",
    description = "Returns version, uptime, how many devices are tracked and present, \
        and the report of the latest sweep pass.",
    responses(
        (status = 200, description = "System status retrieved", body = SystemStatusResponse)
    )
)]
pub async fn get_status(State(state): State<SharedState>) -> ApiResult<Json<SystemStatusResponse>> {
    let tracker = state.tracker();
    let config = state.config();

    Ok(Json(SystemStatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: get_uptime_secs(),
        timezone: config.schedule.timezone.clone(),
        sweep_interval_secs: config.sweep.interval_secs,
        devices_tracked: tracker.device_count().await,
        devices_present: tracker.present_count().await,
        last_sweep: tracker.last_sweep().await.map(SweepReportResponse::from),
    }))
}
