//! HTTP API routes and handlers.
//!
//! This module contains all HTTP endpoint implementations organized by domain:
//! - `sightings` - Probe sighting ingestion
//! - `devices` - Device presence snapshots
//! - `persons` - Attendance, ongoing courses and live presence
//! - `health` - Service health checks
//! - `system` - Uptime and sweep status
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::get;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::state::SharedState;

pub mod devices;
pub mod error;
pub mod health;
pub mod openapi;
pub mod persons;
pub mod sightings;
pub mod system;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                                          - Health check
/// /docs                                            - Swagger UI
/// /api
/// ├── /sightings                                   - Sighting ingestion
/// ├── /devices/{address}                           - Device snapshot
/// ├── /persons/{id}/courses/{course_id}/attendance - Course attendance
/// ├── /persons/{id}/ongoing                        - Courses in session
/// ├── /persons/{id}/presence                       - Live presence
/// ├── /system/status                               - Uptime and last sweep
/// └── /openapi.json                                - OpenAPI specification
/// ```
pub fn create_router(state: SharedState) -> Router {
    // Initialize server start time for uptime tracking
    system::init_start_time();

    Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi::ApiDoc::openapi()))
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .route("/openapi.json", get(openapi::get_openapi_spec))
                .nest("/health", health::router())
                .nest("/sightings", sightings::router())
                .nest("/devices", devices::router())
                .nest("/persons", persons::router())
                .nest("/system", system::router()),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
