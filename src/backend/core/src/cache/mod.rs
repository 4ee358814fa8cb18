//! Results cache.
//!
//! This module stores the last outcome computed for each job key and decides
//! whether it can be served as fresh:
//!
//! - **Backend Abstraction**: in-memory and Postgres backends behind [`CacheBackend`]
//! - **Entries**: success payloads and error payloads with a retryable flag
//! - **Invalidation**: per-entity revision bumps, see [`Freshness`]
//! - **Read-before-compute**: [`ResultCache::get_or_schedule`] enqueues a job when
//!   no fresh entry exists
//!
//! # Usage
//!
//! ```rust,ignore
//! use dsq_core::cache::{GetOrSchedule, ResultCache};
//!
//! match cache.get_or_schedule(&queue, key, params, size, priority).await? {
//!     GetOrSchedule::Fresh(entry) => serve(entry),
//!     GetOrSchedule::Pending { last_known, .. } => serve_pending(last_known),
//! }
//! ```

pub mod backend;
pub mod entry;
pub mod invalidation;

pub use backend::{CacheBackend, CacheFilter, InMemoryCacheBackend};
pub use entry::{CacheCount, CacheEntry, CacheOutcome};
pub use invalidation::Freshness;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::error::Result;
use crate::jobs::{
    CapabilityTable, EnqueueOutcome, JobKey, JobPriority, JobQueue, Revision, WorkerSizeClass,
};

/// A cache entry with its freshness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub entry: CacheEntry,
    pub fresh: bool,
}

/// Result of a read-before-compute lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GetOrSchedule {
    /// A fresh entry exists; nothing was enqueued.
    Fresh { entry: CacheEntry },
    /// No fresh entry. A job was enqueued (or was already pending).
    Pending {
        last_known: Option<CacheEntry>,
        enqueue: EnqueueOutcome,
    },
}

impl GetOrSchedule {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh { .. })
    }
}

/// The results cache facade.
#[derive(Clone)]
pub struct ResultCache {
    backend: Arc<dyn CacheBackend>,
    capabilities: Arc<CapabilityTable>,
}

impl ResultCache {
    /// Create a cache over the given backend.
    pub fn new(backend: Arc<dyn CacheBackend>, capabilities: Arc<CapabilityTable>) -> Self {
        Self {
            backend,
            capabilities,
        }
    }

    /// Create a new in-memory cache with the built-in capability table.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryCacheBackend::new()),
            Arc::new(CapabilityTable::builtin()),
        )
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Evaluate an entry against current revision and runner version.
    pub async fn freshness(&self, entry: &CacheEntry) -> Result<Freshness> {
        let current = self.backend.current_revision(&entry.key.entity_id).await?;
        Ok(Freshness::evaluate(
            entry,
            current,
            self.capabilities.runner_version(entry.job_type()),
        ))
    }

    /// Get the entry for a key, with its freshness.
    #[instrument(skip(self), fields(entity = %key.entity_id, job_type = %key.job_type))]
    pub async fn get(&self, key: &JobKey) -> Result<Option<CachedResponse>> {
        match self.backend.get(key).await? {
            Some(entry) => {
                let fresh = self.freshness(&entry).await?.is_fresh();
                Ok(Some(CachedResponse { entry, fresh }))
            }
            None => Ok(None),
        }
    }

    /// Write an outcome for a key, overwriting any previous entry.
    #[instrument(skip(self, parameters, outcome), fields(entity = %key.entity_id, job_type = %key.job_type, kind = outcome.kind_label()))]
    pub async fn put(
        &self,
        key: JobKey,
        parameters: serde_json::Value,
        outcome: CacheOutcome,
        revision: Revision,
        runner_version: u32,
        attempts: u32,
    ) -> Result<CacheEntry> {
        let entry = CacheEntry {
            key,
            parameters,
            outcome,
            revision,
            runner_version,
            attempts,
            updated_at: Utc::now(),
        };
        self.backend.put(entry.clone()).await?;
        Ok(entry)
    }

    /// Mark every entry of an entity as stale by bumping its revision.
    #[instrument(skip(self))]
    pub async fn invalidate(&self, entity_id: &str) -> Result<Revision> {
        let revision = self.backend.bump_revision(entity_id).await?;
        info!(entity = %entity_id, revision, "Entity invalidated");
        Ok(revision)
    }

    pub async fn current_revision(&self, entity_id: &str) -> Result<Revision> {
        self.backend.current_revision(entity_id).await
    }

    /// Return the fresh entry for a key, or enqueue a job to compute it.
    #[instrument(skip(self, queue, parameters), fields(entity = %key.entity_id, job_type = %key.job_type))]
    pub async fn get_or_schedule(
        &self,
        queue: &JobQueue,
        key: JobKey,
        parameters: serde_json::Value,
        worker_size: WorkerSizeClass,
        priority: JobPriority,
    ) -> Result<GetOrSchedule> {
        let last_known = match self.get(&key).await? {
            Some(CachedResponse { entry, fresh: true }) => {
                return Ok(GetOrSchedule::Fresh { entry });
            }
            Some(CachedResponse { entry, fresh: false }) => Some(entry),
            None => None,
        };

        let enqueue = queue.enqueue(key, parameters, priority, worker_size).await?;
        debug!(
            created = enqueue.is_created(),
            has_last_known = last_known.is_some(),
            "Cache miss, job scheduled"
        );
        Ok(GetOrSchedule::Pending {
            last_known,
            enqueue,
        })
    }

    /// Entry counts by job type and outcome kind.
    pub async fn counts(&self) -> Result<Vec<CacheCount>> {
        self.backend.counts().await
    }

    /// Paged scan in key order.
    pub async fn scan(
        &self,
        filter: &CacheFilter,
        after: Option<&JobKey>,
        limit: usize,
    ) -> Result<Vec<CacheEntry>> {
        self.backend.scan(filter, after, limit).await
    }
}
