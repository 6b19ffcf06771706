//! # attendo-core
//!
//! Core business logic for passive presence detection from WiFi probe
//! requests and course attendance reconciliation.
//!
//! This crate provides:
//! - A per-device presence state machine fed by probe sightings
//! - An online estimate of each device's probe burst interval
//! - Weekly schedule arithmetic for recurring course sessions
//! - Reconciliation of arrivals and departures into per-session attendance
//! - A periodic sweep that advances silent devices
//!
//! ## Architecture
//!
//! - [`presence`] - Presence state machine as a pure transition function
//! - [`burst`] - Running mean and variance of inter-burst gaps
//! - [`schedule`] - Course schedules and their concrete occurrences
//! - [`reconcile`] - Attendance ledgers and per-occurrence verdicts
//! - [`tracker`] - Per-device locking, ingestion and queries
//! - [`sweep`] - Background loop driving timer transitions
//! - [`roster`] - Read-only enrollment directory
//! - [`config`] - Application configuration loading and validation
//! - [`storage`] - JSON file and in-memory persistence
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Hardware addresses, identifiers and sightings

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod burst;
pub mod config;
pub mod error;
pub mod presence;
pub mod reconcile;
pub mod roster;
pub mod schedule;
pub mod storage;
pub mod sweep;
pub mod tracker;
pub mod types;

// Re-export primary types for convenience
pub use burst::BurstEstimator;
pub use config::{is_valid_mac_address, is_valid_timezone, Config, ConfigError, ConfigResult};
pub use error::{AttendoError, Result};
pub use presence::{Effect, Event, Machine, PreconditionNotMet, PresenceState, Thresholds};
pub use reconcile::{
    AttendanceRecord, AttendanceStatus, Ledger, OccurrenceAttendance, ReconcileError,
};
pub use roster::{Directory, Person, Roster, RosterError};
pub use schedule::{Course, Occurrence, OccurrenceSpec};
pub use storage::{default_data_dir, JsonStore, MemoryStore, StorageError, Store};
pub use tracker::{
    DeviceIdentity, MalformedSighting, OccurrenceSightings, PresenceTracker, PresenceView,
    SightingInput, SightingReceipt, SweepReport, TrackerSettings,
};
pub use types::{AddressError, CourseId, MacAddress, PersonId, Sighting};
