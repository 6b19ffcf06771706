//! Per-device presence tracking and attendance bookkeeping.
//!
//! [`PresenceTracker`] owns every device's presence machine and every
//! person's attendance ledger. Each device sits behind its own async mutex,
//! held for one transition plus its reconciliation write, so sightings of
//! different devices proceed in parallel while sightings and sweeps of the
//! same device are serialized. Ledger locks are always taken after the
//! device lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{AttendoError, Result};
use crate::presence::{Effect, Event, Machine, Outcome, PresenceState, Thresholds};
use crate::reconcile::{self, AttendanceRecord, Ledger, OccurrenceAttendance, ReconcileError};
use crate::roster::Directory;
use crate::schedule::Course;
use crate::storage::{StorageResult, Store};
use crate::types::{
    AddressError, CourseId, MacAddress, PersonId, Sighting, MAX_RAW_LENGTH, MAX_SSID_LENGTH,
};

/// Persisted state of one hardware identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Canonical address.
    pub address: MacAddress,
    /// Presence machine snapshot, including the burst estimate.
    pub machine: Machine,
    /// First accepted sighting.
    pub first_seen: DateTime<Utc>,
    /// Accepted sightings so far.
    pub sighting_count: u64,
}

impl DeviceIdentity {
    fn new(address: MacAddress, first_seen: DateTime<Utc>) -> Self {
        Self {
            address,
            machine: Machine::default(),
            first_seen,
            sighting_count: 0,
        }
    }
}

/// A sighting as delivered by a sensor, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SightingInput {
    /// Hardware address in any accepted notation.
    pub device: String,
    /// Capture time.
    pub timestamp: DateTime<Utc>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Probed network name.
    pub ssid: Option<String>,
    /// Raw frame payload.
    pub raw: Option<String>,
}

/// Why a sighting was rejected at ingestion.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MalformedSighting {
    /// The device address failed normalization.
    #[error(transparent)]
    Address(#[from] AddressError),

    /// The timestamp lies too far in the future.
    #[error("timestamp {timestamp} is more than {max_skew_secs}s ahead of the receiver clock")]
    FutureTimestamp {
        /// Offending timestamp.
        timestamp: DateTime<Utc>,
        /// Tolerated skew.
        max_skew_secs: i64,
    },

    /// The network name exceeds the 802.11 limit.
    #[error("network name is {0} bytes long, at most {MAX_SSID_LENGTH} are allowed")]
    SsidTooLong(usize),

    /// The raw payload is too large.
    #[error("raw payload is {0} characters long, at most {MAX_RAW_LENGTH} are allowed")]
    RawTooLong(usize),
}

/// Result of an accepted sighting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SightingReceipt {
    /// Canonical address.
    pub device: MacAddress,
    /// Machine state after the sighting.
    pub state: PresenceState,
    /// Linked person, if any.
    pub person: Option<PersonId>,
    /// Whether the sighting confirmed an arrival.
    pub arrived: bool,
    /// Whether the sighting closed a stale presence cycle.
    pub departed: bool,
    /// Attendance records opened.
    pub records_opened: usize,
    /// Attendance records closed.
    pub records_closed: usize,
}

/// Summary of one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Reference instant of the pass.
    pub at: Option<DateTime<Utc>>,
    /// Devices in a timed state that were evaluated.
    pub scanned: usize,
    /// State changes driven by the pass.
    pub transitions: usize,
    /// Departures confirmed.
    pub departures: usize,
    /// Attendance records opened by presence catch-up.
    pub records_opened: usize,
    /// Attendance records closed by departures.
    pub records_closed: usize,
    /// Devices skipped because a sighting held their lock.
    pub busy: usize,
    /// Whether the pass stopped early on cancellation.
    pub cancelled: bool,
}

/// Live presence of a person.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceView {
    /// Person queried.
    pub person: PersonId,
    /// Registered device.
    pub device: Option<MacAddress>,
    /// Device state, if the device was ever seen.
    pub state: Option<PresenceState>,
    /// Whether the device is currently present.
    pub present: bool,
    /// Enrolled courses in session right now.
    pub ongoing_courses: Vec<CourseId>,
    /// Ongoing courses with an open attendance record.
    pub attending_courses: Vec<CourseId>,
}

/// Logged sightings of a person's device during one course occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccurrenceSightings {
    /// Course of the occurrence.
    pub course: CourseId,
    /// Local calendar date of the occurrence.
    pub occurrence_date: NaiveDate,
    /// Occurrence start.
    pub occurrence_start: DateTime<Utc>,
    /// Occurrence end (exclusive).
    pub occurrence_end: DateTime<Utc>,
    /// Whole minutes from the start to each sighting, in order.
    pub offsets_minutes: Vec<i64>,
}

/// Tunables consumed by the tracker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerSettings {
    /// Presence machine thresholds.
    pub thresholds: Thresholds,
    /// Timezone of the weekly schedules.
    pub timezone: Tz,
    /// Tolerated future skew of sighting timestamps.
    pub max_clock_skew: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            timezone: chrono_tz::UTC,
            max_clock_skew: Duration::minutes(5),
        }
    }
}

impl From<&Config> for TrackerSettings {
    fn from(config: &Config) -> Self {
        Self {
            thresholds: config.thresholds(),
            timezone: config.timezone(),
            max_clock_skew: config.max_clock_skew(),
        }
    }
}

type Shared<T> = Arc<Mutex<T>>;

/// Presence machines and attendance ledgers behind per-key locks.
pub struct PresenceTracker {
    settings: TrackerSettings,
    directory: Arc<dyn Directory>,
    store: Arc<dyn Store>,
    devices: RwLock<HashMap<MacAddress, Shared<DeviceIdentity>>>,
    ledgers: RwLock<HashMap<PersonId, Shared<Ledger>>>,
    sweep_lock: Mutex<()>,
    last_sweep: RwLock<Option<SweepReport>>,
}

impl std::fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Reconciled {
    opened: Vec<AttendanceRecord>,
    closed: Vec<AttendanceRecord>,
}

impl PresenceTracker {
    /// An empty tracker.
    #[must_use]
    pub fn new(
        settings: TrackerSettings,
        directory: Arc<dyn Directory>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            settings,
            directory,
            store,
            devices: RwLock::new(HashMap::new()),
            ledgers: RwLock::new(HashMap::new()),
            sweep_lock: Mutex::new(()),
            last_sweep: RwLock::new(None),
        }
    }

    /// Loads persisted devices and ledgers. Returns how many of each were
    /// restored.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn restore(&self) -> StorageResult<(usize, usize)> {
        let devices = self.store.load_devices()?;
        let ledgers = self.store.load_ledgers()?;
        let counts = (devices.len(), ledgers.len());

        let mut device_map = self.devices.write().await;
        for device in devices {
            device_map.insert(device.address, Arc::new(Mutex::new(device)));
        }
        let mut ledger_map = self.ledgers.write().await;
        for ledger in ledgers {
            ledger_map.insert(ledger.person, Arc::new(Mutex::new(ledger)));
        }

        info!(devices = counts.0, ledgers = counts.1, "Restored tracker state");
        Ok(counts)
    }

    /// Settings in force.
    #[must_use]
    pub const fn settings(&self) -> &TrackerSettings {
        &self.settings
    }

    /// Validates a raw sighting against the receiver clock `now`.
    ///
    /// # Errors
    ///
    /// Returns why the sighting is malformed.
    pub fn validate(
        &self,
        input: SightingInput,
        now: DateTime<Utc>,
    ) -> std::result::Result<Sighting, MalformedSighting> {
        let device: MacAddress = input.device.parse()?;
        if input.timestamp > now + self.settings.max_clock_skew {
            return Err(MalformedSighting::FutureTimestamp {
                timestamp: input.timestamp,
                max_skew_secs: self.settings.max_clock_skew.num_seconds(),
            });
        }
        if let Some(ssid) = &input.ssid {
            if ssid.len() > MAX_SSID_LENGTH {
                return Err(MalformedSighting::SsidTooLong(ssid.len()));
            }
        }
        if let Some(raw) = &input.raw {
            let len = raw.chars().count();
            if len > MAX_RAW_LENGTH {
                return Err(MalformedSighting::RawTooLong(len));
            }
        }
        Ok(Sighting {
            device,
            timestamp: input.timestamp,
            rssi: input.rssi,
            ssid: input.ssid.filter(|s| !s.is_empty()),
            raw: input.raw,
        })
    }

    /// Checks a query instant against the receiver clock `now`.
    ///
    /// Queries may look back arbitrarily far but forward only as far as a
    /// sighting could be stamped.
    ///
    /// # Errors
    ///
    /// Returns [`AttendoError::InvalidReference`] if `reference` lies more
    /// than the allowed clock skew after `now`.
    pub fn check_reference(
        &self,
        reference: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let limit = now
            .checked_add_signed(self.settings.max_clock_skew)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if reference > limit {
            return Err(AttendoError::InvalidReference(reference.to_rfc3339()));
        }
        Ok(reference)
    }

    /// Ingests one probe sighting.
    ///
    /// Runs the device's machine and any resulting reconciliation under the
    /// device lock. Reconciliation and persistence problems are logged and
    /// never reject the sighting.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedSighting`] if the sighting fails validation; it
    /// then never reaches the machine.
    #[tracing::instrument(skip(self, input), fields(device = %input.device))]
    pub async fn submit_sighting(
        &self,
        input: SightingInput,
        now: DateTime<Utc>,
    ) -> std::result::Result<SightingReceipt, MalformedSighting> {
        let sighting = self.validate(input, now)?;
        let entry = self.device_entry(sighting.device, sighting.timestamp).await;
        let mut device = entry.lock().await;

        let outcome = device
            .machine
            .advance(Event::Sighting(sighting.timestamp), &self.settings.thresholds);
        let reconciled = match outcome.effect {
            Some(effect) => self.reconcile_effect(device.address, effect).await,
            None => Reconciled::default(),
        };

        // No await between here and the end: the sighting is either fully
        // applied or not at all.
        device.sighting_count += 1;
        device.machine = outcome.machine;
        log_transitions(device.address, &outcome);
        let person = self.directory.person_for_device(&device.address);

        if let Err(e) = self.store.append_sighting(&sighting) {
            error!(device = %device.address, error = %e, "Failed to append sighting");
        }
        if let Err(e) = self.store.save_device(&device) {
            error!(device = %device.address, error = %e, "Failed to persist device");
        }

        Ok(SightingReceipt {
            device: device.address,
            state: device.machine.state,
            person,
            arrived: matches!(outcome.effect, Some(Effect::Arrived(_))),
            departed: matches!(outcome.effect, Some(Effect::Departed(_))),
            records_opened: reconciled.opened.len(),
            records_closed: reconciled.closed.len(),
        })
    }

    /// Drives timer transitions of every silent device at `now`.
    ///
    /// Only one pass runs at a time; an overlapping call returns `None`.
    /// Devices whose lock is held by a live sighting are skipped and picked
    /// up by the next pass. The pass stops between devices once `cancel`
    /// fires.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn sweep(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> Option<SweepReport> {
        let Ok(_run) = self.sweep_lock.try_lock() else {
            warn!("Sweep already running, skipping");
            return None;
        };

        let entries: Vec<Shared<DeviceIdentity>> =
            self.devices.read().await.values().cloned().collect();
        let mut report = SweepReport {
            at: Some(now),
            ..SweepReport::default()
        };

        for entry in entries {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let Ok(mut device) = entry.try_lock() else {
                report.busy += 1;
                continue;
            };
            if !device.machine.state.is_timed() {
                continue;
            }
            report.scanned += 1;

            let outcome = device
                .machine
                .advance(Event::Tick(now), &self.settings.thresholds);

            // The machine is committed only once its effect is in the
            // ledger, so a pass dropped at an await leaves the device as it
            // was and the next pass derives the same effect again.
            if let Some(effect) = outcome.effect {
                let reconciled = self.reconcile_effect(device.address, effect).await;
                if matches!(effect, Effect::Departed(_)) {
                    report.departures += 1;
                }
                report.records_opened += reconciled.opened.len();
                report.records_closed += reconciled.closed.len();
            }

            report.transitions += outcome.transitions.len();
            log_transitions(device.address, &outcome);
            if device.machine != outcome.machine {
                device.machine = outcome.machine;
                if let Err(e) = self.store.save_device(&device) {
                    error!(device = %device.address, error = %e, "Failed to persist device");
                }
            }

            if device.machine.state.is_present() {
                if let Some(since) = device.machine.present_since {
                    report.records_opened += self.catch_up(device.address, since, now).await;
                }
            }
        }

        debug!(?report, "Sweep finished");
        *self.last_sweep.write().await = Some(report.clone());
        Some(report)
    }

    /// Report of the latest completed sweep.
    pub async fn last_sweep(&self) -> Option<SweepReport> {
        self.last_sweep.read().await.clone()
    }

    /// Number of devices ever seen.
    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }

    /// Number of devices currently present.
    pub async fn present_count(&self) -> usize {
        let entries: Vec<Shared<DeviceIdentity>> =
            self.devices.read().await.values().cloned().collect();
        let mut present = 0;
        for entry in entries {
            if entry.lock().await.machine.state.is_present() {
                present += 1;
            }
        }
        present
    }

    /// Snapshot of one device.
    pub async fn device_snapshot(&self, address: &MacAddress) -> Option<DeviceIdentity> {
        let entry = self.devices.read().await.get(address).cloned()?;
        let device = entry.lock().await;
        Some(device.clone())
    }

    /// Per-occurrence attendance of `person` in `course` up to `reference`.
    ///
    /// # Errors
    ///
    /// Returns an error if the person or course is unknown, the person is
    /// not enrolled, or the course has no valid schedule.
    pub async fn get_attendance(
        &self,
        person: PersonId,
        course: CourseId,
        reference: DateTime<Utc>,
    ) -> Result<Vec<OccurrenceAttendance>> {
        let course = self.enrolled_course(person, course)?;
        let entry = self.ledgers.read().await.get(&person).cloned();
        let ledger = match entry {
            Some(entry) => entry.lock().await.clone(),
            None => Ledger::new(person),
        };
        Ok(reconcile::get_attendance(
            &ledger,
            &course,
            reference,
            self.settings.timezone,
        )?)
    }

    /// Raw sightings of the person's device per occurrence of `course`,
    /// for every occurrence started on or before `reference`.
    ///
    /// A person without a registered device gets the occurrences with no
    /// sightings.
    ///
    /// # Errors
    ///
    /// Returns an error if the person or course is unknown, the person is
    /// not enrolled, the course has no valid schedule, or the sighting log
    /// cannot be read.
    pub fn get_occurrence_sightings(
        &self,
        person: PersonId,
        course: CourseId,
        reference: DateTime<Utc>,
    ) -> Result<Vec<OccurrenceSightings>> {
        let course = self.enrolled_course(person, course)?;
        if !course.has_valid_schedule() {
            return Err(ReconcileError::InvalidSchedule(course.id).into());
        }
        let tz = self.settings.timezone;
        let until = reference
            .checked_add_signed(Duration::seconds(1))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let occurrences: Vec<_> = course
            .occurrences_between(DateTime::<Utc>::MIN_UTC, until, tz)
            .into_iter()
            .filter(|occ| occ.start <= reference)
            .collect();

        let device = self.directory.device_for_person(person);
        let sightings = match (device, occurrences.first(), occurrences.last()) {
            (Some(device), Some(first), Some(last)) => {
                self.store
                    .sightings_between(&device, first.start, last.end.min(reference))?
            }
            _ => Vec::new(),
        };
        debug!(
            person = %person,
            course = %course.id,
            occurrences = occurrences.len(),
            sightings = sightings.len(),
            "Collected occurrence sightings"
        );

        Ok(occurrences
            .into_iter()
            .map(|occ| OccurrenceSightings {
                course: course.id,
                occurrence_date: occ.start.with_timezone(&tz).date_naive(),
                occurrence_start: occ.start,
                occurrence_end: occ.end,
                offsets_minutes: sightings
                    .iter()
                    .filter(|s| {
                        s.timestamp >= occ.start && s.timestamp < occ.end && s.timestamp <= reference
                    })
                    .map(|s| (s.timestamp - occ.start).num_minutes())
                    .collect(),
            })
            .collect())
    }

    /// Ids of the person's courses in session at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`AttendoError::PersonNotFound`] for an unknown person.
    pub fn get_ongoing_course_ids(
        &self,
        person: PersonId,
        now: DateTime<Utc>,
    ) -> Result<BTreeSet<CourseId>> {
        if !self.directory.has_person(person) {
            return Err(AttendoError::PersonNotFound(person));
        }
        Ok(self
            .directory
            .courses_for_person(person)
            .iter()
            .filter(|c| c.is_ongoing(now, self.settings.timezone).is_some())
            .map(|c| c.id)
            .collect())
    }

    /// Whether the person's registered device is present, and in which of
    /// the ongoing courses they are being counted.
    ///
    /// # Errors
    ///
    /// Returns [`AttendoError::PersonNotFound`] for an unknown person.
    pub async fn get_presence(&self, person: PersonId, now: DateTime<Utc>) -> Result<PresenceView> {
        let ongoing = self.get_ongoing_course_ids(person, now)?;
        let device = self.directory.device_for_person(person);
        let state = match &device {
            Some(address) => self
                .device_snapshot(address)
                .await
                .map(|d| d.machine.state),
            None => None,
        };

        let mut attending = Vec::new();
        let entry = self.ledgers.read().await.get(&person).cloned();
        if let Some(entry) = entry {
            let ledger = entry.lock().await;
            for course in self.directory.courses_for_person(person) {
                if let Some(occ) = course.is_ongoing(now, self.settings.timezone) {
                    if ledger.open_record(course.id, occ.start).is_some() {
                        attending.push(course.id);
                    }
                }
            }
        }

        Ok(PresenceView {
            person,
            device,
            state,
            present: state.is_some_and(PresenceState::is_present),
            ongoing_courses: ongoing.into_iter().collect(),
            attending_courses: attending,
        })
    }

    fn enrolled_course(&self, person: PersonId, course: CourseId) -> Result<Course> {
        if !self.directory.has_person(person) {
            return Err(AttendoError::PersonNotFound(person));
        }
        self.directory
            .courses_for_person(person)
            .into_iter()
            .find(|c| c.id == course)
            .ok_or_else(|| {
                if self.directory.course(course).is_some() {
                    AttendoError::NotEnrolled { person, course }
                } else {
                    AttendoError::CourseNotFound(course)
                }
            })
    }

    async fn device_entry(&self, address: MacAddress, at: DateTime<Utc>) -> Shared<DeviceIdentity> {
        if let Some(entry) = self.devices.read().await.get(&address) {
            return Arc::clone(entry);
        }
        let mut devices = self.devices.write().await;
        Arc::clone(devices.entry(address).or_insert_with(|| {
            debug!(device = %address, "New device");
            Arc::new(Mutex::new(DeviceIdentity::new(address, at)))
        }))
    }

    async fn ledger_entry(&self, person: PersonId) -> Shared<Ledger> {
        if let Some(entry) = self.ledgers.read().await.get(&person) {
            return Arc::clone(entry);
        }
        let mut ledgers = self.ledgers.write().await;
        Arc::clone(
            ledgers
                .entry(person)
                .or_insert_with(|| Arc::new(Mutex::new(Ledger::new(person)))),
        )
    }

    fn linked_person(&self, address: MacAddress) -> Option<PersonId> {
        let person = self.directory.person_for_device(&address);
        if person.is_none() {
            debug!(error = %ReconcileError::UnlinkedDevice(address), "Skipping reconciliation");
        }
        person
    }

    /// Applies an arrival or departure signal to the linked person's ledger.
    ///
    /// Only the lock acquisitions await; once the ledger is held the
    /// update and its persistence run to completion.
    async fn reconcile_effect(&self, address: MacAddress, effect: Effect) -> Reconciled {
        match effect {
            Effect::Arrived(at) => info!(device = %address, %at, "Arrival confirmed"),
            Effect::Departed(at) => info!(device = %address, %at, "Departure confirmed"),
        }
        let Some(person) = self.linked_person(address) else {
            return Reconciled::default();
        };

        let entry = self.ledger_entry(person).await;
        let mut ledger = entry.lock().await;
        let reconciled = match effect {
            Effect::Arrived(at) => {
                let courses = self.directory.courses_for_person(person);
                Reconciled {
                    opened: reconcile::reconcile_arrival(
                        &mut ledger,
                        &courses,
                        at,
                        at,
                        self.settings.timezone,
                    ),
                    closed: Vec::new(),
                }
            }
            Effect::Departed(at) => Reconciled {
                opened: Vec::new(),
                closed: reconcile::reconcile_departure(&mut ledger, at),
            },
        };

        if !reconciled.opened.is_empty() || !reconciled.closed.is_empty() {
            self.persist_ledger(&ledger);
        }
        reconciled
    }

    /// Opens records for sessions that began while the device was present.
    async fn catch_up(&self, address: MacAddress, since: DateTime<Utc>, now: DateTime<Utc>) -> usize {
        let Some(person) = self.directory.person_for_device(&address) else {
            return 0;
        };
        let courses = self.directory.courses_for_person(person);
        if courses.is_empty() {
            return 0;
        }
        let entry = self.ledger_entry(person).await;
        let mut ledger = entry.lock().await;
        let opened =
            reconcile::reconcile_arrival(&mut ledger, &courses, since, now, self.settings.timezone);
        if !opened.is_empty() {
            self.persist_ledger(&ledger);
        }
        opened.len()
    }

    fn persist_ledger(&self, ledger: &Ledger) {
        if let Err(e) = self.store.save_ledger(ledger) {
            error!(person = %ledger.person, error = %e, "Failed to persist attendance");
        }
    }
}

fn log_transitions(address: MacAddress, outcome: &Outcome) {
    for t in &outcome.transitions {
        debug!(device = %address, from = ?t.from, to = ?t.to, "Transition");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::{Person, Roster};
    use crate::schedule::OccurrenceSpec;
    use crate::storage::MemoryStore;
    use chrono::{NaiveDate, NaiveTime, TimeZone, Weekday};

    const ADA_DEVICE: &str = "AA:BB:CC:DD:EE:02";
    const STRANGER: &str = "AA:BB:CC:DD:EE:04";

    fn roster() -> Roster {
        let mut roster = Roster::default();
        roster
            .insert_course(Course {
                id: CourseId(1),
                name: "Distributed Systems".into(),
                sessions: vec![OccurrenceSpec {
                    weekday: Weekday::Mon,
                    time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                }],
                duration_minutes: 90,
                min_attend_minutes: 45,
                start_date: NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
                end_date: None,
            })
            .unwrap();
        roster
            .insert_course(Course {
                id: CourseId(2),
                name: "Compilers".into(),
                sessions: vec![OccurrenceSpec {
                    weekday: Weekday::Tue,
                    time: NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
                }],
                duration_minutes: 90,
                min_attend_minutes: 45,
                start_date: NaiveDate::from_ymd_opt(2025, 3, 3).unwrap(),
                end_date: None,
            })
            .unwrap();
        roster
            .insert_person(Person {
                id: PersonId(7),
                name: "Ada".into(),
                device: Some(ADA_DEVICE.parse().unwrap()),
                courses: vec![CourseId(1)],
            })
            .unwrap();
        roster
    }

    fn tracker() -> (PresenceTracker, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let tracker = PresenceTracker::new(
            TrackerSettings {
                thresholds: Thresholds {
                    default_interval: Duration::minutes(10),
                    ..Thresholds::default()
                },
                ..TrackerSettings::default()
            },
            Arc::new(roster()),
            store.clone(),
        );
        (tracker, store)
    }

    // 2025-03-10 is a Monday.
    fn mon(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, h, m, s).unwrap()
    }

    fn input(device: &str, at: DateTime<Utc>) -> SightingInput {
        SightingInput {
            device: device.into(),
            timestamp: at,
            rssi: Some(-58),
            ssid: None,
            raw: None,
        }
    }

    async fn see(tracker: &PresenceTracker, device: &str, at: DateTime<Utc>) -> SightingReceipt {
        tracker.submit_sighting(input(device, at), at).await.unwrap()
    }

    /// Confirms an arrival at `at` with a sub-second pair, leaving the burst
    /// estimate untouched.
    async fn arrive(tracker: &PresenceTracker, device: &str, at: DateTime<Utc>) -> SightingReceipt {
        see(tracker, device, at - Duration::milliseconds(500)).await;
        see(tracker, device, at).await
    }

    #[tokio::test]
    async fn test_arrival_opens_record() {
        let (tracker, store) = tracker();
        let first = see(&tracker, ADA_DEVICE, mon(10, 5, 0)).await;
        assert_eq!(first.state, PresenceState::PotentialArrival);
        assert!(!first.arrived);

        let second = see(&tracker, ADA_DEVICE, mon(10, 5, 30)).await;
        assert_eq!(second.state, PresenceState::Arrival);
        assert!(second.arrived);
        assert_eq!(second.person, Some(PersonId(7)));
        assert_eq!(second.records_opened, 1);

        assert_eq!(store.sightings().len(), 2);
        assert_eq!(store.load_ledgers().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_confirming_sighting_opens_one_record() {
        let (tracker, _) = tracker();
        see(&tracker, ADA_DEVICE, mon(10, 5, 0)).await;
        let a = see(&tracker, ADA_DEVICE, mon(10, 5, 30)).await;
        let b = see(&tracker, ADA_DEVICE, mon(10, 5, 30)).await;
        assert_eq!(a.records_opened, 1);
        assert_eq!(b.records_opened, 0);

        let report = tracker
            .get_attendance(PersonId(7), CourseId(1), mon(10, 6, 0))
            .await
            .unwrap();
        assert_eq!(report.last().unwrap().seconds_present, 30);
    }

    #[tokio::test]
    async fn test_unlinked_device_is_tracked_without_attendance() {
        let (tracker, store) = tracker();
        see(&tracker, STRANGER, mon(10, 5, 0)).await;
        let receipt = see(&tracker, STRANGER, mon(10, 5, 10)).await;
        assert!(receipt.arrived);
        assert_eq!(receipt.person, None);
        assert_eq!(receipt.records_opened, 0);
        assert!(store.load_ledgers().unwrap().is_empty());
        assert_eq!(tracker.device_count().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_sightings_are_rejected() {
        let (tracker, _) = tracker();
        let now = mon(10, 0, 0);
        assert!(matches!(
            tracker.submit_sighting(input("nope", now), now).await,
            Err(MalformedSighting::Address(_))
        ));
        assert!(matches!(
            tracker
                .submit_sighting(input(ADA_DEVICE, now + Duration::hours(1)), now)
                .await,
            Err(MalformedSighting::FutureTimestamp { .. })
        ));
        let mut long = input(ADA_DEVICE, now);
        long.ssid = Some("x".repeat(33));
        assert!(matches!(
            tracker.submit_sighting(long, now).await,
            Err(MalformedSighting::SsidTooLong(33))
        ));
        assert_eq!(tracker.device_count().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_confirms_departure_and_closes_record() {
        let (tracker, _) = tracker();
        let cancel = CancellationToken::new();
        let receipt = arrive(&tracker, ADA_DEVICE, mon(10, 5, 0)).await;
        assert_eq!(receipt.records_opened, 1);

        // Bursts every five minutes settle the interval at 300s.
        for minute in (10..=55).step_by(5) {
            let receipt = see(&tracker, ADA_DEVICE, mon(10, minute, 0)).await;
            assert_eq!(receipt.state, PresenceState::Arrival);
        }

        let report = tracker.sweep(mon(11, 0, 0), &cancel).await.unwrap();
        assert_eq!(report.transitions, 1);
        assert_eq!(report.departures, 0);

        let report = tracker.sweep(mon(11, 2, 30), &cancel).await.unwrap();
        assert_eq!(report.departures, 1);
        assert_eq!(report.records_closed, 1);

        let device = tracker
            .device_snapshot(&ADA_DEVICE.parse().unwrap())
            .await
            .unwrap();
        assert_eq!(device.machine.state, PresenceState::Initial);

        let attendance = tracker
            .get_attendance(PersonId(7), CourseId(1), mon(12, 0, 0))
            .await
            .unwrap();
        let today = attendance.last().unwrap();
        assert_eq!(today.seconds_present, 3000);
        assert_eq!(today.status, reconcile::AttendanceStatus::Sufficient);
    }

    #[tokio::test]
    async fn test_sweep_twice_is_noop() {
        let (tracker, _) = tracker();
        let cancel = CancellationToken::new();
        arrive(&tracker, ADA_DEVICE, mon(10, 5, 0)).await;

        let first = tracker.sweep(mon(10, 15, 0), &cancel).await.unwrap();
        assert_eq!(first.transitions, 1);
        let second = tracker.sweep(mon(10, 15, 0), &cancel).await.unwrap();
        assert_eq!(second.transitions, 0);
        assert_eq!(second.departures, 0);
        assert_eq!(second.records_opened, 0);
        assert_eq!(tracker.last_sweep().await, Some(second));
    }

    #[tokio::test]
    async fn test_sweep_catches_up_on_session_start() {
        let (tracker, _) = tracker();
        let cancel = CancellationToken::new();
        let receipt = arrive(&tracker, ADA_DEVICE, mon(9, 55, 0)).await;
        assert!(receipt.arrived);
        assert_eq!(receipt.records_opened, 0);
        see(&tracker, ADA_DEVICE, mon(10, 0, 30)).await;

        let report = tracker.sweep(mon(10, 1, 0), &cancel).await.unwrap();
        assert_eq!(report.records_opened, 1);
        let again = tracker.sweep(mon(10, 1, 15), &cancel).await.unwrap();
        assert_eq!(again.records_opened, 0);

        let view = tracker.get_presence(PersonId(7), mon(10, 2, 0)).await.unwrap();
        assert!(view.present);
        assert_eq!(view.ongoing_courses, vec![CourseId(1)]);
        assert_eq!(view.attending_courses, vec![CourseId(1)]);
    }

    #[tokio::test]
    async fn test_cancelled_sweep_stops_before_first_device() {
        let (tracker, _) = tracker();
        see(&tracker, ADA_DEVICE, mon(10, 5, 0)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = tracker.sweep(mon(11, 0, 0), &cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.scanned, 0);
    }

    #[tokio::test]
    async fn test_sweep_skips_busy_device() {
        let (tracker, _) = tracker();
        see(&tracker, ADA_DEVICE, mon(10, 5, 0)).await;
        let entry = tracker
            .device_entry(ADA_DEVICE.parse().unwrap(), mon(10, 5, 0))
            .await;
        let _held = entry.lock().await;
        let report = tracker
            .sweep(mon(11, 0, 0), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.busy, 1);
        assert_eq!(report.scanned, 0);
    }

    #[tokio::test]
    async fn test_sensor_clock_ahead_still_confirms_arrival() {
        let (tracker, _) = tracker();
        let cancel = CancellationToken::new();
        let receiver = mon(10, 5, 0);
        let sensor = receiver + Duration::seconds(120);

        let first = tracker
            .submit_sighting(input(ADA_DEVICE, sensor), receiver)
            .await
            .unwrap();
        assert_eq!(first.state, PresenceState::PotentialArrival);

        tracker
            .sweep(receiver + Duration::seconds(15), &cancel)
            .await
            .unwrap();
        let device = tracker
            .device_snapshot(&ADA_DEVICE.parse().unwrap())
            .await
            .unwrap();
        assert_eq!(device.machine.state, PresenceState::PotentialArrival);

        let second = tracker
            .submit_sighting(
                input(ADA_DEVICE, sensor + Duration::seconds(30)),
                receiver + Duration::seconds(30),
            )
            .await
            .unwrap();
        assert!(second.arrived);
        assert_eq!(second.records_opened, 1);
    }

    #[tokio::test]
    async fn test_dropped_sweep_leaves_departure_pending() {
        let (tracker, _) = tracker();
        let cancel = CancellationToken::new();
        arrive(&tracker, ADA_DEVICE, mon(10, 5, 0)).await;
        for minute in (10..=55).step_by(5) {
            see(&tracker, ADA_DEVICE, mon(10, minute, 0)).await;
        }
        tracker.sweep(mon(11, 0, 0), &cancel).await.unwrap();

        let ledger = tracker.ledger_entry(PersonId(7)).await;
        let held = ledger.lock().await;
        let dropped = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            tracker.sweep(mon(11, 2, 30), &cancel),
        )
        .await;
        assert!(dropped.is_err());

        let device = tracker
            .device_snapshot(&ADA_DEVICE.parse().unwrap())
            .await
            .unwrap();
        assert_eq!(device.machine.state, PresenceState::PotentialDeparture);
        assert!(held.has_open());
        drop(held);

        let report = tracker.sweep(mon(11, 2, 30), &cancel).await.unwrap();
        assert_eq!(report.departures, 1);
        assert_eq!(report.records_closed, 1);
        let attendance = tracker
            .get_attendance(PersonId(7), CourseId(1), mon(12, 0, 0))
            .await
            .unwrap();
        assert_eq!(attendance.last().unwrap().seconds_present, 3000);
    }

    #[test]
    fn test_reference_bounded_by_clock_skew() {
        let (tracker, _) = tracker();
        let now = mon(10, 0, 0);
        assert_eq!(tracker.check_reference(now, now).unwrap(), now);
        let early = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
        assert!(tracker.check_reference(early, now).is_ok());
        assert!(tracker.check_reference(now + Duration::minutes(5), now).is_ok());
        assert!(matches!(
            tracker.check_reference(now + Duration::minutes(6), now),
            Err(AttendoError::InvalidReference(_))
        ));
        assert!(matches!(
            tracker.check_reference(DateTime::<Utc>::MAX_UTC, now),
            Err(AttendoError::InvalidReference(_))
        ));
    }

    #[tokio::test]
    async fn test_occurrence_sightings_per_session() {
        let (tracker, _) = tracker();
        see(&tracker, ADA_DEVICE, mon(9, 50, 0)).await;
        see(&tracker, ADA_DEVICE, mon(10, 5, 30)).await;
        see(&tracker, ADA_DEVICE, mon(10, 6, 0)).await;
        see(&tracker, ADA_DEVICE, mon(11, 29, 59)).await;
        see(&tracker, STRANGER, mon(10, 7, 0)).await;

        // Course 1 started on 2025-03-03; that session saw nothing.
        let report = tracker
            .get_occurrence_sightings(PersonId(7), CourseId(1), mon(12, 0, 0))
            .unwrap();
        assert_eq!(report.len(), 2);
        assert!(report[0].offsets_minutes.is_empty());
        assert_eq!(report[1].occurrence_start, mon(10, 0, 0));
        assert_eq!(report[1].occurrence_date, NaiveDate::from_ymd_opt(2025, 3, 10).unwrap());
        assert_eq!(report[1].offsets_minutes, vec![5, 6, 89]);

        // Sightings after the reference are left out.
        let partial = tracker
            .get_occurrence_sightings(PersonId(7), CourseId(1), mon(10, 5, 45))
            .unwrap();
        assert_eq!(partial[1].offsets_minutes, vec![5]);
    }

    #[tokio::test]
    async fn test_occurrence_sightings_lookup_errors() {
        let (tracker, _) = tracker();
        let at = mon(12, 0, 0);
        assert!(matches!(
            tracker.get_occurrence_sightings(PersonId(7), CourseId(2), at),
            Err(AttendoError::NotEnrolled { .. })
        ));
        assert!(matches!(
            tracker.get_occurrence_sightings(PersonId(8), CourseId(1), at),
            Err(AttendoError::PersonNotFound(PersonId(8)))
        ));
    }

    #[tokio::test]
    async fn test_ongoing_course_ids() {
        let (tracker, _) = tracker();
        let ongoing = tracker
            .get_ongoing_course_ids(PersonId(7), mon(10, 30, 0))
            .unwrap();
        assert_eq!(ongoing.into_iter().collect::<Vec<_>>(), vec![CourseId(1)]);
        assert!(tracker
            .get_ongoing_course_ids(PersonId(7), mon(12, 0, 0))
            .unwrap()
            .is_empty());
        assert!(matches!(
            tracker.get_ongoing_course_ids(PersonId(99), mon(10, 30, 0)),
            Err(AttendoError::PersonNotFound(PersonId(99)))
        ));
    }

    #[tokio::test]
    async fn test_attendance_lookup_errors() {
        let (tracker, _) = tracker();
        let at = mon(12, 0, 0);
        assert!(matches!(
            tracker.get_attendance(PersonId(7), CourseId(2), at).await,
            Err(AttendoError::NotEnrolled { .. })
        ));
        assert!(matches!(
            tracker.get_attendance(PersonId(7), CourseId(9), at).await,
            Err(AttendoError::CourseNotFound(CourseId(9)))
        ));
        assert!(matches!(
            tracker.get_attendance(PersonId(8), CourseId(1), at).await,
            Err(AttendoError::PersonNotFound(PersonId(8)))
        ));
    }

    #[tokio::test]
    async fn test_restore_from_store() {
        let (tracker, store) = tracker();
        see(&tracker, ADA_DEVICE, mon(10, 5, 0)).await;
        see(&tracker, ADA_DEVICE, mon(10, 5, 30)).await;

        let restored = PresenceTracker::new(TrackerSettings::default(), Arc::new(roster()), store);
        assert_eq!(restored.restore().await.unwrap(), (1, 1));
        let device = restored
            .device_snapshot(&ADA_DEVICE.parse().unwrap())
            .await
            .unwrap();
        assert_eq!(device.machine.state, PresenceState::Arrival);
        assert_eq!(device.sighting_count, 2);
    }
}
