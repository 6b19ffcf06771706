//! Application configuration management.
//!
//! Handles loading and validating attendo configuration including:
//! - HTTP listener settings
//! - Presence tracking thresholds
//! - Sweep cadence
//! - Schedule timezone and roster location
//! - Data directory
//!
//! Values come from built-in defaults, overlaid by an optional TOML file,
//! overlaid by `ATTENDO_*` environment variables (`__` separates nested
//! keys, e.g. `ATTENDO_TRACKING__ARRIVAL_WINDOW_SECS=45`).

use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::burst::{DEFAULT_BURST_CUTOFF, DEFAULT_BURST_INTERVAL};
use crate::presence::{Thresholds, ARRIVAL_CONFIRM_WINDOW, DEFAULT_DEPARTURE_CONFIRM_RATIO};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "ATTENDO";

static MAC_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:[0-9A-Fa-f]{2}(?::[0-9A-Fa-f]{2}){5}|[0-9A-Fa-f]{2}(?:-[0-9A-Fa-f]{2}){5}|[0-9A-Fa-f]{4}(?:\.[0-9A-Fa-f]{4}){2}|[0-9A-Fa-f]{12})$",
    )
    .unwrap_or_else(|_| unreachable!("static pattern"))
});

/// Whether `s` is a 48-bit hardware address in colon, dash, dotted or bare
/// hex notation. Separators may not be mixed.
#[must_use]
pub fn is_valid_mac_address(s: &str) -> bool {
    MAC_ADDRESS_RE.is_match(s)
}

/// Whether `s` names an IANA timezone.
#[must_use]
pub fn is_valid_timezone(s: &str) -> bool {
    s.parse::<Tz>().is_ok()
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly requested configuration file does not exist.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// The configuration file could not be read.
    #[error("Failed to read {path}: {source}")]
    ReadError {
        /// Path that was read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be written.
    #[error("Failed to write {path}: {source}")]
    WriteError {
        /// Path that was written.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Layered sources could not be merged or deserialized.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] ::config::ConfigError),

    /// The configuration could not be rendered as TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A single field holds an invalid value.
    #[error("Invalid value for {field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields hold invalid values.
    #[error("{} configuration errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listener.
    pub server: ServerConfig,
    /// Presence machine thresholds.
    pub tracking: TrackingConfig,
    /// Periodic sweep.
    pub sweep: SweepConfig,
    /// Course schedule settings.
    pub schedule: ScheduleConfig,
    /// Persistence.
    pub storage: StorageConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Production logging and paths.
    pub production: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            production: false,
        }
    }
}

/// Presence tracking thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Window in which a second sighting confirms an arrival.
    pub arrival_window_secs: u64,
    /// Gaps below this are treated as one burst.
    pub burst_cutoff_millis: u64,
    /// Burst interval assumed before any gap was observed.
    pub default_burst_interval_secs: u64,
    /// Share of the burst interval that confirms a departure.
    pub departure_confirm_ratio: f64,
    /// How far into the future a sighting timestamp may lie.
    pub max_clock_skew_secs: u64,
}

impl Default for TrackingConfig {
    #[allow(clippy::cast_sign_loss)]
    fn default() -> Self {
        Self {
            arrival_window_secs: ARRIVAL_CONFIRM_WINDOW.num_seconds() as u64,
            burst_cutoff_millis: DEFAULT_BURST_CUTOFF.num_milliseconds() as u64,
            default_burst_interval_secs: DEFAULT_BURST_INTERVAL.num_seconds() as u64,
            departure_confirm_ratio: DEFAULT_DEPARTURE_CONFIRM_RATIO,
            max_clock_skew_secs: 300,
        }
    }
}

/// Periodic sweep configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Seconds between sweeps.
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { interval_secs: 15 }
    }
}

/// Course schedule configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// IANA timezone the weekly session times are expressed in.
    pub timezone: String,
    /// Enrollment roster file. Defaults to `roster.toml` in the data directory.
    pub roster_path: Option<PathBuf>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            roster_path: None,
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory. Defaults to the platform data directory.
    pub data_dir: Option<PathBuf>,
}

fn clamp_secs(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000)
}

impl Config {
    /// Loads configuration from defaults, `path` and the environment, then
    /// validates it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, a source cannot be
    /// parsed, or the merged values fail validation.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut builder = ::config::Config::builder()
            .add_source(::config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.display().to_string()));
            }
            let content =
                std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
                    path: path.display().to_string(),
                    source,
                })?;
            builder = builder.add_source(::config::File::from_str(
                &content,
                ::config::FileFormat::Toml,
            ));
        }

        let config: Self = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Loads from `path` when it exists, otherwise from defaults and the
    /// environment only.
    ///
    /// # Errors
    ///
    /// See [`Config::load`].
    pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(Some(path))
        } else {
            tracing::info!(path = %path.display(), "No configuration file, using defaults");
            Self::load(None)
        }
    }

    /// Writes the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        let write_err = |source| ConfigError::WriteError {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(write_err)
    }

    /// Checks every field and reports all problems at once.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for a single problem and
    /// [`ConfigError::MultipleValidationErrors`] for several.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut invalid = |field: &str, message: &str| {
            errors.push(ConfigError::ValidationError {
                field: field.to_string(),
                message: message.to_string(),
            });
        };

        if self.server.port == 0 {
            invalid("server.port", "must be non-zero");
        }
        if self.tracking.arrival_window_secs == 0 {
            invalid("tracking.arrival_window_secs", "must be positive");
        }
        if self.tracking.burst_cutoff_millis == 0 {
            invalid("tracking.burst_cutoff_millis", "must be positive");
        }
        if self.tracking.default_burst_interval_secs.saturating_mul(1000)
            < self.tracking.burst_cutoff_millis
        {
            invalid(
                "tracking.default_burst_interval_secs",
                "must not be shorter than the burst cutoff",
            );
        }
        let ratio = self.tracking.departure_confirm_ratio;
        if !ratio.is_finite() || ratio <= 0.0 {
            invalid("tracking.departure_confirm_ratio", "must be a positive number");
        }
        if self.sweep.interval_secs == 0 {
            invalid("sweep.interval_secs", "must be positive");
        }
        if !is_valid_timezone(&self.schedule.timezone) {
            invalid("schedule.timezone", "must be an IANA timezone name");
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Machine thresholds derived from the tracking section.
    #[must_use]
    pub fn thresholds(&self) -> Thresholds {
        let t = &self.tracking;
        Thresholds {
            arrival_window: chrono::Duration::seconds(clamp_secs(t.arrival_window_secs)),
            burst_cutoff: chrono::Duration::milliseconds(clamp_secs(t.burst_cutoff_millis)),
            default_interval: chrono::Duration::seconds(clamp_secs(t.default_burst_interval_secs)),
            departure_ratio: t.departure_confirm_ratio,
        }
    }

    /// Maximum tolerated future skew of sighting timestamps.
    #[must_use]
    pub fn max_clock_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(clamp_secs(self.tracking.max_clock_skew_secs))
    }

    /// Sweep period.
    #[must_use]
    pub const fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep.interval_secs)
    }

    /// Schedule timezone. Falls back to UTC for an unvalidated bad name.
    #[must_use]
    pub fn timezone(&self) -> Tz {
        self.schedule.timezone.parse().unwrap_or(chrono_tz::UTC)
    }

    /// Data directory in force.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.storage
            .data_dir
            .clone()
            .unwrap_or_else(crate::storage::default_data_dir)
    }

    /// Roster file in force.
    #[must_use]
    pub fn roster_path(&self) -> PathBuf {
        self.schedule
            .roster_path
            .clone()
            .unwrap_or_else(|| self.data_dir().join("roster.toml"))
    }
}

/// Default location of the configuration file.
///
/// On Linux: `/etc/attendo/config.toml`.
/// Elsewhere: the platform config directory.
#[must_use]
pub fn default_config_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/etc/attendo/config.toml")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "attendo")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("./config.toml"))
    }
}
