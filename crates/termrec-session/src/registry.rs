//! In-memory tables of live recordings and replays.
//!
//! One `Registry` is shared (via `Arc`) by the recorder and the replay
//! manager. The two maps are locked independently so a long recorder
//! append never blocks replay control and vice versa.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use termrec_core::{TermrecError, TermrecResult};

use crate::recorder::ActiveRecording;
use crate::replay::ReplayHandle;

#[derive(Default)]
pub struct Registry {
    /// Keyed by backend session id.
    recordings: Mutex<HashMap<String, ActiveRecording>>,
    /// Keyed by replay id.
    replays: Mutex<HashMap<String, ReplayHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn recordings(
        &self,
    ) -> TermrecResult<MutexGuard<'_, HashMap<String, ActiveRecording>>> {
        self.recordings
            .lock()
            .map_err(|_| TermrecError::Other("recording table lock poisoned".into()))
    }

    pub(crate) fn replays(&self) -> TermrecResult<MutexGuard<'_, HashMap<String, ReplayHandle>>> {
        self.replays
            .lock()
            .map_err(|_| TermrecError::Other("replay table lock poisoned".into()))
    }

    /// Number of replays currently running.
    pub fn replay_count(&self) -> usize {
        self.replays().map(|m| m.len()).unwrap_or(0)
    }
}
