//! Per-device presence state machine.
//!
//! ```text
//!   INITIAL ──sighting──▶ POTENTIAL_ARRIVAL ──sighting within window──▶ ARRIVAL
//!      ▲                        │ window exceeded                       │  ▲
//!      │                        ▼                          silence ≥ I  │  │ sighting
//!      └──────────────────── INITIAL                                    ▼  │
//!      ▲                                                     POTENTIAL_DEPARTURE
//!      │                                                                │
//!      └──────────── DEPARTURE ◀──── silence ≥ I + ratio·I ─────────────┘
//! ```
//!
//! `I` is the device's burst interval estimate. The machine is a plain value:
//! [`Machine::apply`] performs exactly one guarded transition and reports an
//! unmet guard as [`PreconditionNotMet`]; [`Machine::advance`] routes those
//! outcomes to the alternate transitions and runs timer catch-up. Nothing in
//! here reads the clock or touches storage.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::burst::{BurstEstimator, DEFAULT_BURST_CUTOFF, DEFAULT_BURST_INTERVAL};

/// Fixed window in which a second sighting confirms an arrival.
pub const ARRIVAL_CONFIRM_WINDOW: Duration = Duration::seconds(60);

/// Default fraction of the burst interval used to confirm a departure.
pub const DEFAULT_DEPARTURE_CONFIRM_RATIO: f64 = 0.5;

/// Presence state of a single device.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    /// No recent activity.
    #[default]
    Initial,
    /// One sighting seen, waiting for confirmation.
    PotentialArrival,
    /// Confirmed present.
    Arrival,
    /// Silent for longer than the burst interval.
    PotentialDeparture,
    /// Confirmed absent; resets to `Initial` immediately.
    Departure,
}

impl PresenceState {
    /// Whether the device counts as physically present.
    #[must_use]
    pub const fn is_present(self) -> bool {
        matches!(self, Self::Arrival | Self::PotentialDeparture)
    }

    /// Whether time alone can still move the machine (the sweep's work set).
    #[must_use]
    pub const fn is_timed(self) -> bool {
        matches!(
            self,
            Self::PotentialArrival | Self::Arrival | Self::PotentialDeparture
        )
    }
}

/// An input to the machine. Every event carries its own timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A probe from this device captured at the given instant.
    Sighting(DateTime<Utc>),
    /// A timer evaluation at the given instant, with no new probe.
    Tick(DateTime<Utc>),
}

impl Event {
    /// Timestamp carried by the event.
    #[must_use]
    pub const fn at(&self) -> DateTime<Utc> {
        match self {
            Self::Sighting(at) | Self::Tick(at) => *at,
        }
    }
}

/// Signal for the reconciliation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Presence confirmed at the given instant.
    Arrived(DateTime<Utc>),
    /// Absence confirmed; carries the last instant the device was seen.
    Departed(DateTime<Utc>),
}

/// A guard that did not hold. Expected, never fatal.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum PreconditionNotMet {
    /// The confirming sighting came too late, or the window ran out.
    #[error("arrival confirmation window exceeded")]
    ArrivalWindowExceeded,

    /// Not silent long enough to confirm a departure.
    #[error("departure threshold not reached")]
    DepartureThresholdNotReached,

    /// Not silent long enough to suspect a departure.
    #[error("withdrawal threshold not reached")]
    WithdrawalThresholdNotReached,
}

/// Tunable thresholds of the machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Window in which a second sighting confirms an arrival.
    pub arrival_window: Duration,
    /// Gaps below this are intra-burst and do not feed the estimator.
    pub burst_cutoff: Duration,
    /// Burst interval assumed on cold start.
    pub default_interval: Duration,
    /// Fraction of the burst interval that confirms a suspected departure.
    ///
    /// The confirm window starts when the withdrawal threshold is crossed,
    /// one interval after the last sighting. A departure therefore needs
    /// `interval * (1 + departure_ratio)` of silence in total.
    pub departure_ratio: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            arrival_window: ARRIVAL_CONFIRM_WINDOW,
            burst_cutoff: DEFAULT_BURST_CUTOFF,
            default_interval: DEFAULT_BURST_INTERVAL,
            departure_ratio: DEFAULT_DEPARTURE_CONFIRM_RATIO,
        }
    }
}

impl Thresholds {
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn departure_window(&self, interval: Duration) -> Duration {
        let millis = interval.num_milliseconds() as f64 * self.departure_ratio;
        Duration::milliseconds(millis.round() as i64)
    }
}

/// Snapshot of one device's machine. Cheap to copy, safe to persist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    /// Current state.
    pub state: PresenceState,
    /// Latest accepted sighting of the current cycle.
    pub last_seen: Option<DateTime<Utc>>,
    /// When the current presence cycle was confirmed.
    pub present_since: Option<DateTime<Utc>>,
    /// When the withdrawal threshold was crossed (potential departure only).
    pub withdrawn_at: Option<DateTime<Utc>>,
    /// Burst interval estimate; survives across cycles.
    pub burst: BurstEstimator,
}

/// A single state change, kept for logging and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before.
    pub from: PresenceState,
    /// State after.
    pub to: PresenceState,
}

/// Result of feeding one event through [`Machine::advance`].
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Machine after the event.
    pub machine: Machine,
    /// Arrival or departure signal, if any.
    pub effect: Option<Effect>,
    /// Every state change in order, including pass-through states.
    pub transitions: Vec<Transition>,
}

impl Machine {
    /// Burst interval currently in force.
    #[must_use]
    pub fn interval(&self, thresholds: &Thresholds) -> Duration {
        self.burst.interval_or(thresholds.default_interval)
    }

    /// Performs the single guarded transition `event` asks for in the
    /// current state.
    ///
    /// # Errors
    ///
    /// Returns the guard that failed. The caller decides the alternate
    /// transition; [`Machine::advance`] implements the standard routing.
    pub fn apply(
        self,
        event: Event,
        thresholds: &Thresholds,
    ) -> Result<(Self, Option<Effect>), PreconditionNotMet> {
        match (self.state, event) {
            (PresenceState::Initial, Event::Sighting(at)) => Ok((
                Self {
                    state: PresenceState::PotentialArrival,
                    last_seen: Some(at),
                    present_since: None,
                    withdrawn_at: None,
                    burst: self.burst,
                },
                None,
            )),
            (PresenceState::Initial, Event::Tick(_)) => Ok((self, None)),

            (PresenceState::PotentialArrival, event) => {
                let last = self.last_seen.unwrap_or_else(|| event.at());
                // A sighting may arrive out of order; a tick before `last`
                // comes from a receiver clock behind the sensor's.
                let distance = match event {
                    Event::Sighting(at) => (at - last).abs(),
                    Event::Tick(at) => at - last,
                };
                if distance > thresholds.arrival_window {
                    return Err(PreconditionNotMet::ArrivalWindowExceeded);
                }
                match event {
                    Event::Tick(_) => Ok((self, None)),
                    Event::Sighting(at) => {
                        let mut next = self.record(at, thresholds);
                        let arrived = next.last_seen.unwrap_or(at);
                        next.state = PresenceState::Arrival;
                        next.present_since = Some(arrived);
                        Ok((next, Some(Effect::Arrived(arrived))))
                    }
                }
            }

            (PresenceState::Arrival, event) => {
                let Some(last) = self.last_seen else {
                    return Err(PreconditionNotMet::WithdrawalThresholdNotReached);
                };
                let interval = self.interval(thresholds);
                if event.at() - last < interval {
                    return Err(PreconditionNotMet::WithdrawalThresholdNotReached);
                }
                Ok((
                    Self {
                        state: PresenceState::PotentialDeparture,
                        withdrawn_at: Some(last + interval),
                        ..self
                    },
                    None,
                ))
            }

            (PresenceState::PotentialDeparture, event) => {
                let last = self.last_seen.unwrap_or_else(|| event.at());
                let withdrawn = self
                    .withdrawn_at
                    .unwrap_or_else(|| last + self.interval(thresholds));
                let window = thresholds.departure_window(self.interval(thresholds));
                if event.at() - withdrawn < window {
                    return Err(PreconditionNotMet::DepartureThresholdNotReached);
                }
                Ok((
                    Self {
                        state: PresenceState::Departure,
                        ..self
                    },
                    Some(Effect::Departed(last)),
                ))
            }

            (PresenceState::Departure, _) => Ok((self.reset(), None)),
        }
    }

    /// Feeds one event, routing unmet guards to their alternate transition.
    ///
    /// Timer conditions are evaluated at the event's timestamp first, so a
    /// sighting after a long silence closes the previous cycle before it is
    /// counted; the sighting that confirms a departure then opens a new one.
    #[must_use]
    pub fn advance(self, event: Event, thresholds: &Thresholds) -> Outcome {
        let mut machine = self;
        let mut effect = None;
        let mut transitions = Vec::new();

        loop {
            let from = machine.state;
            let result = machine.apply(event, thresholds);
            let (next, consumed) = match (from, result) {
                (PresenceState::Initial | PresenceState::PotentialArrival, Ok((next, eff))) => {
                    effect = effect.or(eff);
                    (next, true)
                }
                (PresenceState::PotentialArrival, Err(_)) => (machine.reset(), true),
                (PresenceState::Arrival, Ok((next, _))) => (next, false),
                (PresenceState::Arrival, Err(_)) => match event {
                    Event::Sighting(at) => (machine.record(at, thresholds), true),
                    Event::Tick(_) => (machine, true),
                },
                (PresenceState::PotentialDeparture, Ok((next, eff))) => {
                    effect = effect.or(eff);
                    (next, false)
                }
                (PresenceState::PotentialDeparture, Err(_)) => match event {
                    Event::Sighting(at) => (machine.resume(at, thresholds), true),
                    Event::Tick(_) => (machine, true),
                },
                (PresenceState::Departure, Ok((next, _))) => {
                    (next, matches!(event, Event::Tick(_)))
                }
                (_, Err(_)) => (machine, true),
            };

            if next.state != from {
                transitions.push(Transition {
                    from,
                    to: next.state,
                });
            }
            machine = next;
            if consumed {
                break;
            }
        }

        Outcome {
            machine,
            effect,
            transitions,
        }
    }

    /// Accepts a sighting in the current state: moves `last_seen` forward
    /// and feeds the gap to the estimator.
    fn record(self, at: DateTime<Utc>, thresholds: &Thresholds) -> Self {
        let mut next = self;
        match self.last_seen {
            Some(last) => {
                next.burst.observe(at - last, thresholds.burst_cutoff);
                next.last_seen = Some(last.max(at));
            }
            None => next.last_seen = Some(at),
        }
        next
    }

    /// False departure: the device spoke again before departure was confirmed.
    fn resume(self, at: DateTime<Utc>, thresholds: &Thresholds) -> Self {
        let mut next = self.record(at, thresholds);
        next.state = PresenceState::Arrival;
        next.withdrawn_at = None;
        next
    }

    /// Back to `Initial`, keeping only the burst estimate.
    fn reset(self) -> Self {
        Self {
            burst: self.burst,
            ..Self::default()
        }
    }
}
