//! Read-only view of the enrollment system.
//!
//! Course management lives in an external CRUD application. The core only
//! needs three answers from it: which person a device belongs to, which
//! courses a person attends, and what those courses' schedules are. The
//! [`Directory`] trait is that boundary; [`Roster`] serves it from a TOML
//! export.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::schedule::{Course, OccurrenceSpec};
use crate::types::{AddressError, CourseId, MacAddress, PersonId};

/// Enrollment lookups consumed by reconciliation.
pub trait Directory: Send + Sync {
    /// Person linked to a device, if the device is registered.
    fn person_for_device(&self, device: &MacAddress) -> Option<PersonId>;

    /// Registered device of a person, if any.
    fn device_for_person(&self, person: PersonId) -> Option<MacAddress>;

    /// Whether the person is known at all.
    fn has_person(&self, person: PersonId) -> bool;

    /// Courses the person is enrolled in.
    fn courses_for_person(&self, person: PersonId) -> Vec<Course>;

    /// A single course.
    fn course(&self, id: CourseId) -> Option<Course>;
}

/// Errors raised while loading a roster.
#[derive(Debug, Error)]
pub enum RosterError {
    /// The roster file could not be read.
    #[error("Failed to read roster {}: {source}", path.display())]
    ReadError {
        /// Path that was read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The roster is not valid TOML or has the wrong shape.
    #[error("Failed to parse roster: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Two courses share an id.
    #[error("Duplicate course id {0}")]
    DuplicateCourse(CourseId),

    /// Two persons share an id.
    #[error("Duplicate person id {0}")]
    DuplicatePerson(PersonId),

    /// A person is enrolled in a course that does not exist.
    #[error("Person {person} is enrolled in unknown course {course}")]
    UnknownCourse {
        /// Enrolled person.
        person: PersonId,
        /// Missing course.
        course: CourseId,
    },

    /// A person's device address is invalid.
    #[error("Person {person} has an invalid device address: {source}")]
    InvalidDevice {
        /// Person with the bad address.
        person: PersonId,
        /// Parse failure.
        #[source]
        source: AddressError,
    },

    /// The same device is linked to two persons.
    #[error("Device {device} is linked to both person {first} and person {second}")]
    DuplicateDevice {
        /// Shared device.
        device: MacAddress,
        /// First owner.
        first: PersonId,
        /// Second owner.
        second: PersonId,
    },
}

#[derive(Debug, Deserialize)]
struct RawRoster {
    #[serde(default)]
    courses: Vec<RawCourse>,
    #[serde(default)]
    persons: Vec<RawPerson>,
}

#[derive(Debug, Deserialize)]
struct RawCourse {
    id: CourseId,
    name: String,
    #[serde(default = "default_duration")]
    duration_minutes: u32,
    #[serde(default = "default_min_attend")]
    min_attend_minutes: u32,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
    #[serde(default)]
    sessions: Vec<RawSession>,
}

#[derive(Debug, Deserialize)]
struct RawSession {
    weekday: Weekday,
    #[serde(deserialize_with = "deserialize_time")]
    time: NaiveTime,
}

#[derive(Debug, Deserialize)]
struct RawPerson {
    id: PersonId,
    #[serde(default)]
    name: String,
    device: Option<String>,
    #[serde(default)]
    courses: Vec<CourseId>,
}

const fn default_duration() -> u32 {
    90
}

const fn default_min_attend() -> u32 {
    45
}

fn deserialize_time<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    NaiveTime::parse_from_str(&s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M"))
        .map_err(serde::de::Error::custom)
}

/// A person known to the roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Person {
    /// Identifier.
    pub id: PersonId,
    /// Display name.
    pub name: String,
    /// Registered device, if any.
    pub device: Option<MacAddress>,
    /// Enrolled courses.
    pub courses: Vec<CourseId>,
}

/// In-memory enrollment directory.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    courses: BTreeMap<CourseId, Course>,
    persons: BTreeMap<PersonId, Person>,
    devices: HashMap<MacAddress, PersonId>,
}

impl Roster {
    /// Loads and validates a roster file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RosterError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| RosterError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Loads the roster, or an empty one when `path` does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file is invalid.
    pub fn load_or_empty(path: impl AsRef<Path>) -> Result<Self, RosterError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::warn!(path = %path.display(), "Roster not found, starting with an empty directory");
            Ok(Self::default())
        }
    }

    /// Parses and validates a roster from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed input or inconsistent references.
    pub fn from_toml(content: &str) -> Result<Self, RosterError> {
        let raw: RawRoster = toml::from_str(content)?;
        let mut roster = Self::default();

        for c in raw.courses {
            let course = Course {
                id: c.id,
                name: c.name,
                sessions: c
                    .sessions
                    .into_iter()
                    .map(|s| OccurrenceSpec {
                        weekday: s.weekday,
                        time: s.time,
                    })
                    .collect(),
                duration_minutes: c.duration_minutes,
                min_attend_minutes: c.min_attend_minutes,
                start_date: c.start_date,
                end_date: c.end_date,
            };
            roster.insert_course(course)?;
        }

        for p in raw.persons {
            let device = p
                .device
                .as_deref()
                .map(str::parse::<MacAddress>)
                .transpose()
                .map_err(|source| RosterError::InvalidDevice {
                    person: p.id,
                    source,
                })?;
            roster.insert_person(Person {
                id: p.id,
                name: p.name,
                device,
                courses: p.courses,
            })?;
        }

        Ok(roster)
    }

    /// Adds a course.
    ///
    /// # Errors
    ///
    /// Returns [`RosterError::DuplicateCourse`] if the id is taken.
    pub fn insert_course(&mut self, course: Course) -> Result<(), RosterError> {
        if self.courses.contains_key(&course.id) {
            return Err(RosterError::DuplicateCourse(course.id));
        }
        if !course.has_valid_schedule() {
            tracing::warn!(course = %course.id, "Course has no usable schedule and will never be ongoing");
        }
        self.courses.insert(course.id, course);
        Ok(())
    }

    /// Adds a person and their device link.
    ///
    /// # Errors
    ///
    /// Rejects duplicate ids, unknown courses and devices already linked
    /// to someone else.
    pub fn insert_person(&mut self, person: Person) -> Result<(), RosterError> {
        if self.persons.contains_key(&person.id) {
            return Err(RosterError::DuplicatePerson(person.id));
        }
        if let Some(course) = person.courses.iter().find(|c| !self.courses.contains_key(c)) {
            return Err(RosterError::UnknownCourse {
                person: person.id,
                course: *course,
            });
        }
        if let Some(device) = person.device {
            if let Some(first) = self.devices.get(&device) {
                return Err(RosterError::DuplicateDevice {
                    device,
                    first: *first,
                    second: person.id,
                });
            }
            self.devices.insert(device, person.id);
        }
        self.persons.insert(person.id, person);
        Ok(())
    }

    /// Number of courses.
    #[must_use]
    pub fn course_count(&self) -> usize {
        self.courses.len()
    }

    /// Number of persons.
    #[must_use]
    pub fn person_count(&self) -> usize {
        self.persons.len()
    }
}

impl Directory for Roster {
    fn person_for_device(&self, device: &MacAddress) -> Option<PersonId> {
        self.devices.get(device).copied()
    }

    fn device_for_person(&self, person: PersonId) -> Option<MacAddress> {
        self.persons.get(&person).and_then(|p| p.device)
    }

    fn has_person(&self, person: PersonId) -> bool {
        self.persons.contains_key(&person)
    }

    fn courses_for_person(&self, person: PersonId) -> Vec<Course> {
        self.persons
            .get(&person)
            .map(|p| {
                p.courses
                    .iter()
                    .filter_map(|id| self.courses.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn course(&self, id: CourseId) -> Option<Course> {
        self.courses.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROSTER: &str = r#"
[[courses]]
id = 1
name = "Distributed Systems"
duration_minutes = 90
min_attend_minutes = 45
start_date = "2025-03-03"
end_date = "2025-07-01"
sessions = [
    { weekday = "Mon", time = "10:00" },
    { weekday = "Thu", time = "14:15:00" },
]

[[courses]]
id = 2
name = "Compilers"
start_date = "2025-03-03"

[[persons]]
id = 7
name = "Ada"
device = "aa-bb-cc-dd-ee-02"
courses = [1, 2]

[[persons]]
id = 8
name = "Grace"
courses = [1]
"#;

    #[test]
    fn test_parses_roster() {
        let roster = Roster::from_toml(ROSTER).unwrap();
        assert_eq!(roster.course_count(), 2);
        assert_eq!(roster.person_count(), 2);

        let device: MacAddress = "AA:BB:CC:DD:EE:02".parse().unwrap();
        assert_eq!(roster.person_for_device(&device), Some(PersonId(7)));
        assert_eq!(roster.device_for_person(PersonId(7)), Some(device));
        assert_eq!(roster.device_for_person(PersonId(8)), None);

        let course = roster.course(CourseId(1)).unwrap();
        assert_eq!(course.sessions.len(), 2);
        assert_eq!(course.sessions[1].weekday, Weekday::Thu);
        assert_eq!(course.sessions[1].time, NaiveTime::from_hms_opt(14, 15, 0).unwrap());

        let defaults = roster.course(CourseId(2)).unwrap();
        assert_eq!(defaults.duration_minutes, 90);
        assert_eq!(defaults.min_attend_minutes, 45);
        assert!(!defaults.has_valid_schedule());

        let ids: Vec<_> = roster
            .courses_for_person(PersonId(7))
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![CourseId(1), CourseId(2)]);
        assert!(roster.courses_for_person(PersonId(99)).is_empty());
        assert!(roster.has_person(PersonId(8)));
        assert!(!roster.has_person(PersonId(99)));
    }

    #[test]
    fn test_rejects_unknown_course() {
        let err = Roster::from_toml(
            r#"
[[persons]]
id = 1
courses = [42]
"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RosterError::UnknownCourse {
                course: CourseId(42),
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_duplicate_device() {
        let err = Roster::from_toml(
            r#"
[[persons]]
id = 1
device = "AA:BB:CC:DD:EE:02"

[[persons]]
id = 2
device = "aabbccddee02"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, RosterError::DuplicateDevice { .. }));
    }

    #[test]
    fn test_rejects_invalid_device() {
        let err = Roster::from_toml(
            r#"
[[persons]]
id = 1
device = "not-a-mac"
"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RosterError::InvalidDevice {
                person: PersonId(1),
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let err = Roster::from_toml(
            r#"
[[courses]]
id = 1
name = "A"
start_date = "2025-03-03"

[[courses]]
id = 1
name = "B"
start_date = "2025-03-03"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, RosterError::DuplicateCourse(CourseId(1))));
    }

    #[test]
    fn test_load_or_empty_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let roster = Roster::load_or_empty(dir.path().join("missing.toml")).unwrap();
        assert_eq!(roster.person_count(), 0);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.toml");
        std::fs::write(&path, ROSTER).unwrap();
        let roster = Roster::load(&path).unwrap();
        assert_eq!(roster.course_count(), 2);
    }
}
