//! Application state shared across handlers.

use std::sync::Arc;

use attendo_core::{Config, Directory, JsonStore, PresenceTracker, Roster, Store, TrackerSettings};
use tracing::info;

/// Shared application state.
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    directory: Arc<dyn Directory>,
    tracker: Arc<PresenceTracker>,
}

impl SharedState {
    /// Builds state from configuration: opens the JSON store under the
    /// data directory, loads the roster and restores persisted devices and
    /// ledgers.
    ///
    /// # Errors
    ///
    /// Returns an error if the roster is invalid or the store cannot be read.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let store = JsonStore::new(config.data_dir());
        let roster = Roster::load_or_empty(&config.roster_path())?;
        info!(
            courses = roster.course_count(),
            persons = roster.person_count(),
            "Roster loaded"
        );

        let state = Self::with_parts(config, Arc::new(roster), Arc::new(store));
        let (devices, ledgers) = state.tracker().restore().await?;
        info!(devices, ledgers, "Restored persisted state");
        Ok(state)
    }

    /// Builds state around an arbitrary directory and store.
    #[must_use]
    pub fn with_parts(config: Config, directory: Arc<dyn Directory>, store: Arc<dyn Store>) -> Self {
        let tracker =
            PresenceTracker::new(TrackerSettings::from(&config), directory.clone(), store);
        Self {
            inner: Arc::new(AppStateInner {
                config,
                directory,
                tracker: Arc::new(tracker),
            }),
        }
    }

    /// Loaded configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Enrollment directory.
    #[must_use]
    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.inner.directory
    }

    /// The presence tracker.
    #[must_use]
    pub fn tracker(&self) -> &Arc<PresenceTracker> {
        &self.inner.tracker
    }
}
