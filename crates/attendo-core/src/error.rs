//! Unified error types for the attendo core library.
//!
//! This module provides a unified error type [`AttendoError`] that covers all
//! failure modes surfaced by the core. Each module also has its own specific
//! error type (ConfigError, StorageError, RosterError, ReconcileError,
//! MalformedSighting) for internal use.
//!
//! Expected machine conditions ([`crate::presence::PreconditionNotMet`]) are
//! routed inside the tracker and never become an `AttendoError`.
//!
//! # Example
//!
//! ```rust
//! use attendo_core::error::{AttendoError, Result};
//! use attendo_core::types::PersonId;
//!
//! fn require_person(known: bool, id: PersonId) -> Result<()> {
//!     if !known {
//!         return Err(AttendoError::PersonNotFound(id));
//!     }
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

use crate::types::{CourseId, PersonId};

/// The unified error type for all attendo operations.
#[derive(Debug, Error)]
pub enum AttendoError {
    // =========================================================================
    // TRACKING ERRORS
    // =========================================================================
    /// A sighting failed validation and was not ingested.
    #[error("Malformed sighting: {0}")]
    MalformedSighting(String),

    /// No device with this address has been seen.
    #[error("Device not found: '{0}'. It has not been seen by any sensor yet.")]
    DeviceNotFound(String),

    /// The device is not linked to any person.
    #[error("Device '{0}' is not linked to a person")]
    UnlinkedDevice(String),

    /// A query instant lies beyond what the receiver clock allows.
    #[error("Reference time {0} is too far in the future")]
    InvalidReference(String),

    // =========================================================================
    // ENROLLMENT ERRORS
    // =========================================================================
    /// No person with this id is enrolled anywhere.
    #[error("Person {0} not found")]
    PersonNotFound(PersonId),

    /// No course with this id exists.
    #[error("Course {0} not found")]
    CourseNotFound(CourseId),

    /// The person exists but does not take this course.
    #[error("Person {person} is not enrolled in course {course}")]
    NotEnrolled {
        /// Person queried.
        person: PersonId,
        /// Course queried.
        course: CourseId,
    },

    /// The course has no usable schedule.
    #[error("Course {0} has no valid schedule")]
    InvalidSchedule(CourseId),

    /// The roster could not be loaded.
    #[error("Roster error: {0}")]
    RosterError(String),

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// An error occurred while persisting or reading data.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for attendo operations.
pub type Result<T> = std::result::Result<T, AttendoError>;

impl AttendoError {
    /// Returns `true` if this error concerns sighting ingestion or device state.
    #[inline]
    #[must_use]
    pub const fn is_tracking_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedSighting(_)
                | Self::DeviceNotFound(_)
                | Self::UnlinkedDevice(_)
                | Self::InvalidReference(_)
        )
    }

    /// Returns `true` if this error concerns enrollment data.
    #[inline]
    #[must_use]
    pub const fn is_enrollment_error(&self) -> bool {
        matches!(
            self,
            Self::PersonNotFound(_)
                | Self::CourseNotFound(_)
                | Self::NotEnrolled { .. }
                | Self::InvalidSchedule(_)
                | Self::RosterError(_)
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is related to I/O or persistence.
    #[inline]
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(self, Self::PersistenceError(_) | Self::IoError(_))
    }

    /// Returns `true` if this error represents an expected operational state
    /// rather than a failure.
    ///
    /// Unlinked devices are observed legitimately before registration.
    #[inline]
    #[must_use]
    pub const fn is_expected_state(&self) -> bool {
        matches!(self, Self::UnlinkedDevice(_))
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - malformed input
            Self::MalformedSighting(_) | Self::InvalidReference(_) => 400,

            // 404 Not Found
            Self::DeviceNotFound(_)
            | Self::PersonNotFound(_)
            | Self::CourseNotFound(_)
            | Self::ConfigNotFound(_) => 404,

            // 409 Conflict - valid request, incompatible state
            Self::NotEnrolled { .. } | Self::UnlinkedDevice(_) => 409,

            // 422 Unprocessable Entity - semantic errors
            Self::InvalidSchedule(_)
            | Self::RosterError(_)
            | Self::ConfigParseError(_)
            | Self::ConfigValidationError(_) => 422,

            // 500 Internal Server Error - server-side issues
            Self::PersistenceError(_) | Self::IoError(_) => 500,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::MalformedSighting(_) => "MALFORMED_SIGHTING",
            Self::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            Self::UnlinkedDevice(_) => "UNLINKED_DEVICE",
            Self::InvalidReference(_) => "INVALID_REFERENCE",
            Self::PersonNotFound(_) => "PERSON_NOT_FOUND",
            Self::CourseNotFound(_) => "COURSE_NOT_FOUND",
            Self::NotEnrolled { .. } => "NOT_ENROLLED",
            Self::InvalidSchedule(_) => "INVALID_SCHEDULE",
            Self::RosterError(_) => "ROSTER_ERROR",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for AttendoError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path.into()),
            ConfigError::ReadError { path, source } => {
                Self::PersistenceError(format!("Failed to read {path}: {source}"))
            }
            ConfigError::WriteError { path, source } => {
                Self::PersistenceError(format!("Failed to write {path}: {source}"))
            }
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::storage::StorageError> for AttendoError {
    fn from(err: crate::storage::StorageError) -> Self {
        Self::PersistenceError(err.to_string())
    }
}

impl From<crate::roster::RosterError> for AttendoError {
    fn from(err: crate::roster::RosterError) -> Self {
        Self::RosterError(err.to_string())
    }
}

impl From<crate::reconcile::ReconcileError> for AttendoError {
    fn from(err: crate::reconcile::ReconcileError) -> Self {
        use crate::reconcile::ReconcileError;
        match err {
            ReconcileError::UnlinkedDevice(device) => Self::UnlinkedDevice(device.to_string()),
            ReconcileError::InvalidSchedule(course) => Self::InvalidSchedule(course),
        }
    }
}

impl From<crate::tracker::MalformedSighting> for AttendoError {
    fn from(err: crate::tracker::MalformedSighting) -> Self {
        Self::MalformedSighting(err.to_string())
    }
}

impl From<crate::types::AddressError> for AttendoError {
    fn from(err: crate::types::AddressError) -> Self {
        Self::MalformedSighting(err.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoErr, ErrorKind};

    #[test]
    fn test_tracking_error_classification() {
        assert!(AttendoError::MalformedSighting("bad".into()).is_tracking_error());
        assert!(AttendoError::DeviceNotFound("AA:BB:CC:DD:EE:FF".into()).is_tracking_error());
        assert!(AttendoError::UnlinkedDevice("AA:BB:CC:DD:EE:FF".into()).is_tracking_error());

        assert!(!AttendoError::PersonNotFound(PersonId(1)).is_tracking_error());
    }

    #[test]
    fn test_enrollment_error_classification() {
        assert!(AttendoError::PersonNotFound(PersonId(1)).is_enrollment_error());
        assert!(AttendoError::CourseNotFound(CourseId(1)).is_enrollment_error());
        assert!(AttendoError::NotEnrolled {
            person: PersonId(1),
            course: CourseId(2)
        }
        .is_enrollment_error());
        assert!(!AttendoError::ConfigParseError("x".into()).is_enrollment_error());
    }

    #[test]
    fn test_config_error_classification() {
        assert!(AttendoError::ConfigNotFound(PathBuf::from("/test")).is_config_error());
        assert!(AttendoError::ConfigParseError("syntax error".into()).is_config_error());
        assert!(AttendoError::ConfigValidationError("invalid value".into()).is_config_error());

        assert!(!AttendoError::PersonNotFound(PersonId(1)).is_config_error());
    }

    #[test]
    fn test_io_error_classification() {
        assert!(AttendoError::PersistenceError("disk full".into()).is_io_error());
        assert!(AttendoError::IoError(IoErr::new(ErrorKind::NotFound, "test")).is_io_error());

        assert!(!AttendoError::MalformedSighting("bad".into()).is_io_error());
    }

    #[test]
    fn test_expected_state() {
        assert!(AttendoError::UnlinkedDevice("AA:BB:CC:DD:EE:FF".into()).is_expected_state());
        assert!(!AttendoError::PersistenceError("x".into()).is_expected_state());
    }

    #[test]
    fn test_http_status_codes() {
        assert_eq!(AttendoError::MalformedSighting("bad".into()).http_status_code(), 400);
        assert_eq!(
            AttendoError::InvalidReference("+262142-12-31T23:59:59Z".into()).http_status_code(),
            400
        );
        assert_eq!(AttendoError::PersonNotFound(PersonId(1)).http_status_code(), 404);
        assert_eq!(
            AttendoError::NotEnrolled {
                person: PersonId(1),
                course: CourseId(2)
            }
            .http_status_code(),
            409
        );
        assert_eq!(AttendoError::InvalidSchedule(CourseId(2)).http_status_code(), 422);
        assert_eq!(AttendoError::PersistenceError("x".into()).http_status_code(), 500);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            AttendoError::MalformedSighting("bad".into()).error_code(),
            "MALFORMED_SIGHTING"
        );
        assert_eq!(
            AttendoError::CourseNotFound(CourseId(3)).error_code(),
            "COURSE_NOT_FOUND"
        );
    }

    #[test]
    fn test_from_module_errors() {
        let err: AttendoError = crate::reconcile::ReconcileError::InvalidSchedule(CourseId(4)).into();
        assert!(matches!(err, AttendoError::InvalidSchedule(CourseId(4))));

        let err: AttendoError = crate::types::AddressError::Unspecified.into();
        assert!(err.is_tracking_error());

        let err: AttendoError = crate::config::ConfigError::MultipleValidationErrors(vec![
            crate::config::ConfigError::ValidationError {
                field: "a".into(),
                message: "bad".into(),
            },
            crate::config::ConfigError::ValidationError {
                field: "b".into(),
                message: "worse".into(),
            },
        ])
        .into();
        match err {
            AttendoError::ConfigValidationError(msg) => {
                assert!(msg.contains("a: bad"));
                assert!(msg.contains("; "));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_from_io_error() {
        let io_err = IoErr::new(ErrorKind::NotFound, "file not found");
        let err: AttendoError = io_err.into();
        assert!(matches!(err, AttendoError::IoError(_)));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<AttendoError>();
        assert_sync::<AttendoError>();
    }
}
