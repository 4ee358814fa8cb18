//! Freshness rules.
//!
//! Invalidation never deletes: it bumps the entity revision, and any entry
//! computed against an older revision (or by an older runner) stops being
//! fresh. Stale entries stay readable as last-known results.

use serde::{Deserialize, Serialize};

use super::entry::CacheEntry;
use crate::jobs::Revision;

/// Why an entry is or is not fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    /// The entity was invalidated after the entry was computed.
    RevisionChanged { entry: Revision, current: Revision },
    /// The runner for this job type has been upgraded since.
    RunnerOutdated { entry: u32, current: u32 },
}

impl Freshness {
    /// Evaluate an entry against the entity's current revision and the job
    /// type's current runner version.
    pub fn evaluate(entry: &CacheEntry, current_revision: Revision, current_runner: u32) -> Self {
        if entry.revision != current_revision {
            Self::RevisionChanged {
                entry: entry.revision,
                current: current_revision,
            }
        } else if entry.runner_version < current_runner {
            Self::RunnerOutdated {
                entry: entry.runner_version,
                current: current_runner,
            }
        } else {
            Self::Fresh
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh)
    }
}
