//! Persistent storage for device state, attendance ledgers and sightings.
//!
//! [`JsonStore`] lays data out as:
//!
//! ```text
//! <data_dir>/
//! ├── devices/<aabbccddeeff>.json      one snapshot per device
//! ├── attendance/<person>.json          one ledger per person
//! └── sightings/<yyyy>/<mm>.jsonl       append-only probe log
//! ```
//!
//! Snapshots are written to a temporary file and renamed into place, so a
//! crash leaves either the old or the new version of a key.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Datelike, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::reconcile::Ledger;
use crate::tracker::DeviceIdentity;
use crate::types::{MacAddress, PersonId, Sighting};

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A file could not be read.
    #[error("Failed to read {}: {source}", path.display())]
    ReadError {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A file could not be written.
    #[error("Failed to write {}: {source}", path.display())]
    WriteError {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A file holds invalid JSON.
    #[error("Failed to parse {}: {source}", path.display())]
    ParseError {
        /// File path.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A value could not be encoded.
    #[error("Failed to serialize: {0}")]
    SerializeError(#[from] serde_json::Error),

    /// A directory could not be created.
    #[error("Failed to create directory {}: {source}", path.display())]
    CreateDirError {
        /// Directory path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Result alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Persistence seam of the tracker.
pub trait Store: Send + Sync {
    /// All persisted device snapshots.
    ///
    /// # Errors
    ///
    /// Returns an error if a snapshot cannot be read or decoded.
    fn load_devices(&self) -> StorageResult<Vec<DeviceIdentity>>;

    /// Replaces the snapshot of one device.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    fn save_device(&self, device: &DeviceIdentity) -> StorageResult<()>;

    /// All persisted attendance ledgers.
    ///
    /// # Errors
    ///
    /// Returns an error if a ledger cannot be read or decoded.
    fn load_ledgers(&self) -> StorageResult<Vec<Ledger>>;

    /// Replaces the ledger of one person.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be written.
    fn save_ledger(&self, ledger: &Ledger) -> StorageResult<()>;

    /// Appends an accepted sighting to the probe log.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be written.
    fn append_sighting(&self, sighting: &Sighting) -> StorageResult<()>;

    /// Logged sightings of `device` stamped within `[from, to]`, oldest
    /// first.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read or decoded.
    fn sightings_between(
        &self,
        device: &MacAddress,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Sighting>>;
}

/// Default data directory.
///
/// On Linux: `/var/lib/attendo/`.
/// Elsewhere: the platform data directory.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/lib/attendo")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "attendo")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("./data"))
    }
}

/// File-backed store using JSON documents.
#[derive(Debug, Clone)]
pub struct JsonStore {
    data_dir: PathBuf,
}

impl JsonStore {
    /// Create a store rooted at `data_dir`. Nothing is touched until the
    /// first write.
    #[must_use]
    pub const fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    /// Root directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn device_path(&self, address: &MacAddress) -> PathBuf {
        self.data_dir
            .join("devices")
            .join(format!("{}.json", address.to_compact()))
    }

    fn ledger_path(&self, person: PersonId) -> PathBuf {
        self.data_dir
            .join("attendance")
            .join(format!("{person}.json"))
    }

    fn sightings_path(&self, year: i32, month: u32) -> PathBuf {
        self.data_dir
            .join("sightings")
            .join(format!("{year}"))
            .join(format!("{month:02}.jsonl"))
    }

    fn read_sightings(&self, year: i32, month: u32) -> StorageResult<Vec<Sighting>> {
        let path = self.sightings_path(year, month);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path).map_err(|source| StorageError::ReadError {
            path: path.clone(),
            source,
        })?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|source| StorageError::ParseError {
                    path: path.clone(),
                    source,
                })
            })
            .collect()
    }

    fn load_all<T: DeserializeOwned>(&self, dir: &str) -> StorageResult<Vec<T>> {
        let dir = self.data_dir.join(dir);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&dir).map_err(|source| StorageError::ReadError {
            path: dir.clone(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        paths.iter().map(|p| read_json(p)).collect()
    }
}

fn ensure_parent(path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| StorageError::CreateDirError {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> StorageResult<T> {
    let content = std::fs::read_to_string(path).map_err(|source| StorageError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| StorageError::ParseError {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StorageResult<()> {
    ensure_parent(path)?;
    let content = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    let write_err = |source| StorageError::WriteError {
        path: path.to_path_buf(),
        source,
    };
    std::fs::write(&tmp, content).map_err(write_err)?;
    std::fs::rename(&tmp, path).map_err(write_err)
}

impl Store for JsonStore {
    fn load_devices(&self) -> StorageResult<Vec<DeviceIdentity>> {
        self.load_all("devices")
    }

    fn save_device(&self, device: &DeviceIdentity) -> StorageResult<()> {
        write_json_atomic(&self.device_path(&device.address), device)
    }

    fn load_ledgers(&self) -> StorageResult<Vec<Ledger>> {
        self.load_all("attendance")
    }

    fn save_ledger(&self, ledger: &Ledger) -> StorageResult<()> {
        write_json_atomic(&self.ledger_path(ledger.person), ledger)
    }

    fn append_sighting(&self, sighting: &Sighting) -> StorageResult<()> {
        let ts = sighting.timestamp;
        let path = self.sightings_path(ts.year(), ts.month());
        ensure_parent(&path)?;
        let mut line = serde_json::to_string(sighting)?;
        line.push('\n');
        let write_err = |source| StorageError::WriteError {
            path: path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(write_err)?;
        file.write_all(line.as_bytes()).map_err(write_err)
    }

    fn sightings_between(
        &self,
        device: &MacAddress,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Sighting>> {
        let mut found = Vec::new();
        for (year, month) in months_spanning(from, to) {
            found.extend(
                self.read_sightings(year, month)?
                    .into_iter()
                    .filter(|s| s.device == *device && s.timestamp >= from && s.timestamp <= to),
            );
        }
        found.sort_by_key(|s| s.timestamp);
        Ok(found)
    }
}

/// Calendar months (UTC) touched by `[from, to]`, in order.
fn months_spanning(from: DateTime<Utc>, to: DateTime<Utc>) -> impl Iterator<Item = (i32, u32)> {
    let end = (to.year(), to.month());
    let mut next = (from <= to).then_some((from.year(), from.month()));
    std::iter::from_fn(move || {
        let current = next?;
        next = (current < end).then(|| {
            if current.1 == 12 {
                (current.0 + 1, 1)
            } else {
                (current.0, current.1 + 1)
            }
        });
        Some(current)
    })
}

/// In-process store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: Mutex<HashMap<MacAddress, DeviceIdentity>>,
    ledgers: Mutex<HashMap<PersonId, Ledger>>,
    sightings: Mutex<Vec<Sighting>>,
}

impl MemoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sightings appended so far, in order.
    #[must_use]
    pub fn sightings(&self) -> Vec<Sighting> {
        self.sightings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Store for MemoryStore {
    fn load_devices(&self) -> StorageResult<Vec<DeviceIdentity>> {
        let devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(devices.values().cloned().collect())
    }

    fn save_device(&self, device: &DeviceIdentity) -> StorageResult<()> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(device.address, device.clone());
        Ok(())
    }

    fn load_ledgers(&self) -> StorageResult<Vec<Ledger>> {
        let ledgers = self.ledgers.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(ledgers.values().cloned().collect())
    }

    fn save_ledger(&self, ledger: &Ledger) -> StorageResult<()> {
        self.ledgers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ledger.person, ledger.clone());
        Ok(())
    }

    fn append_sighting(&self, sighting: &Sighting) -> StorageResult<()> {
        self.sightings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sighting.clone());
        Ok(())
    }

    fn sightings_between(
        &self,
        device: &MacAddress,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Sighting>> {
        let mut found: Vec<Sighting> = self
            .sightings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.device == *device && s.timestamp >= from && s.timestamp <= to)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.timestamp);
        Ok(found)
    }
}
