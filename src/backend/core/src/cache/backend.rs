//! Cache backend abstraction and the in-memory implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::entry::{CacheCount, CacheEntry};
use crate::error::Result;
use crate::jobs::{JobKey, JobType, Revision};

/// Filter for paged scans over the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheFilter {
    #[serde(default)]
    pub job_type: Option<JobType>,
    #[serde(default)]
    pub entity_id: Option<String>,
    /// Only error entries with this code.
    #[serde(default)]
    pub error_code: Option<String>,
    /// Only error entries with `retryable = true`.
    #[serde(default)]
    pub retryable_only: bool,
}

impl CacheFilter {
    pub fn matches(&self, entry: &CacheEntry) -> bool {
        if let Some(job_type) = self.job_type {
            if entry.job_type() != job_type {
                return false;
            }
        }
        if let Some(entity_id) = &self.entity_id {
            if &entry.key.entity_id != entity_id {
                return false;
            }
        }
        if let Some(code) = &self.error_code {
            if entry.outcome.error_code() != Some(code.as_str()) {
                return false;
            }
        }
        !self.retryable_only || entry.outcome.is_retryable_error()
    }
}

/// Trait for cache backends.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get the entry for a key.
    async fn get(&self, key: &JobKey) -> Result<Option<CacheEntry>>;

    /// Insert or overwrite the entry for its key.
    async fn put(&self, entry: CacheEntry) -> Result<()>;

    /// Current revision of an entity (0 if never invalidated).
    async fn current_revision(&self, entity_id: &str) -> Result<Revision>;

    /// Increment the entity revision and return the new value.
    async fn bump_revision(&self, entity_id: &str) -> Result<Revision>;

    /// Up to `limit` matching entries with key strictly after `after`, in key order.
    async fn scan(
        &self,
        filter: &CacheFilter,
        after: Option<&JobKey>,
        limit: usize,
    ) -> Result<Vec<CacheEntry>>;

    /// Entry counts by job type and outcome kind.
    async fn counts(&self) -> Result<Vec<CacheCount>>;

    /// Get the backend name.
    fn name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct InMemoryState {
    // Ordered by JobKey so scans page in key order.
    entries: BTreeMap<JobKey, CacheEntry>,
    revisions: HashMap<String, Revision>,
}

/// In-memory cache backend for tests and single-node development.
#[derive(Clone, Default)]
pub struct InMemoryCacheBackend {
    state: Arc<RwLock<InMemoryState>>,
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, key: &JobKey) -> Result<Option<CacheEntry>> {
        Ok(self.state.read().await.entries.get(key).cloned())
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        self.state
            .write()
            .await
            .entries
            .insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn current_revision(&self, entity_id: &str) -> Result<Revision> {
        Ok(self
            .state
            .read()
            .await
            .revisions
            .get(entity_id)
            .copied()
            .unwrap_or(0))
    }

    async fn bump_revision(&self, entity_id: &str) -> Result<Revision> {
        let mut state = self.state.write().await;
        let revision = state.revisions.entry(entity_id.to_string()).or_insert(0);
        *revision += 1;
        Ok(*revision)
    }

    async fn scan(
        &self,
        filter: &CacheFilter,
        after: Option<&JobKey>,
        limit: usize,
    ) -> Result<Vec<CacheEntry>> {
        use std::ops::Bound;

        let state = self.state.read().await;
        let lower = match after {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };
        Ok(state
            .entries
            .range((lower, Bound::Unbounded))
            .map(|(_, entry)| entry)
            .filter(|entry| filter.matches(entry))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn counts(&self) -> Result<Vec<CacheCount>> {
        let state = self.state.read().await;
        let mut counts: HashMap<(JobType, &'static str), u64> = HashMap::new();
        for entry in state.entries.values() {
            *counts
                .entry((entry.job_type(), entry.outcome.kind_label()))
                .or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((job_type, kind), count)| CacheCount {
                job_type,
                kind: kind.to_string(),
                count,
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
