//! Background driver of time-based presence transitions.
//!
//! A device that stops transmitting produces no further sightings, so only
//! this loop can move it from `ARRIVAL` towards `DEPARTURE`.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::tracker::PresenceTracker;

/// Time allowed for a single pass before it stops at the next device.
const SWEEP_TIMEOUT: Duration = Duration::from_secs(60);

/// Runs a sweep every `period` until `cancel_token` fires.
///
/// Each pass gets a child token that a watchdog cancels after
/// [`SWEEP_TIMEOUT`]. A slow pass therefore stops between devices, never
/// inside one.
pub async fn sweep_loop(
    tracker: Arc<PresenceTracker>,
    period: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(period_secs = period.as_secs(), "Sweep loop started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let pass_token = cancel_token.child_token();
                let watchdog = tokio::spawn({
                    let pass_token = pass_token.clone();
                    async move {
                        tokio::time::sleep(SWEEP_TIMEOUT).await;
                        pass_token.cancel();
                    }
                });
                let report = tracker.sweep(Utc::now(), &pass_token).await;
                watchdog.abort();

                match report {
                    Some(report) if report.cancelled && !cancel_token.is_cancelled() => {
                        warn!(
                            timeout_secs = SWEEP_TIMEOUT.as_secs(),
                            scanned = report.scanned,
                            "Sweep timed out, resuming next tick"
                        );
                    }
                    Some(report) if report.departures > 0 || report.records_opened > 0 => {
                        info!(
                            departures = report.departures,
                            records_opened = report.records_opened,
                            records_closed = report.records_closed,
                            "Sweep changed attendance"
                        );
                    }
                    _ => {}
                }
            }
            () = cancel_token.cancelled() => {
                info!("Sweep loop shutting down");
                break;
            }
        }
    }
}

/// Spawns [`sweep_loop`] on the current runtime.
#[must_use]
pub fn spawn(
    tracker: Arc<PresenceTracker>,
    period: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(sweep_loop(tracker, period, cancel_token))
}
