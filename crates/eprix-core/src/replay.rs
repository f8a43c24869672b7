//! Minimal deterministic replay record: which event kinds fired on which
//! ticks, against which car. Together with the config and seed this is enough
//! to reconstruct the full event ordering of a run.

use serde::{Deserialize, Serialize};

use crate::events::EventKind;

/// One fired event, reduced to its ordering key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayEntry {
    /// Tick index the event fired on.
    pub step: u64,
    pub kind: EventKind,
    /// Dense index of the subject car; `None` for race-wide events.
    pub subject: Option<u32>,
}

/// Append-only log of every event fired during a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayLog {
    entries: Vec<ReplayEntry>,
}

impl ReplayLog {
    /// Empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&mut self, step: u64, kind: EventKind, subject: Option<u32>) {
        self.entries.push(ReplayEntry {
            step,
            kind,
            subject,
        });
    }

    /// All recorded entries in firing order.
    #[must_use]
    pub fn entries(&self) -> &[ReplayEntry] {
        &self.entries
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing has fired yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
