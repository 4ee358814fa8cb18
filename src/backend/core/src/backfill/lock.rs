//! Leader election for backfill runs.
//!
//! A run takes a named lock with a TTL before scanning. Production uses a
//! Redis `SET NX PX` lock shared by every process; single-node deployments
//! and tests use the in-process lock.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::{DsqError, ErrorCode, Result};

/// Proof of ownership for a held lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(pub String);

impl LockToken {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// A named, expiring mutual-exclusion lock.
#[async_trait]
pub trait LeaderLock: Send + Sync {
    /// Try to take the lock. `None` when another holder owns it.
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>>;

    /// Release the lock if `token` still owns it.
    async fn release(&self, name: &str, token: &LockToken) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Process Lock
// ═══════════════════════════════════════════════════════════════════════════════

/// Lock held in process memory.
#[derive(Debug, Default)]
pub struct InProcessLock {
    holders: DashMap<String, (LockToken, Instant)>,
}

impl InProcessLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaderLock for InProcessLock {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let now = Instant::now();
        match self.holders.entry(name.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().1 > now {
                    return Ok(None);
                }
                let token = LockToken::generate();
                held.insert((token.clone(), now + ttl));
                Ok(Some(token))
            }
            Entry::Vacant(slot) => {
                let token = LockToken::generate();
                slot.insert((token.clone(), now + ttl));
                Ok(Some(token))
            }
        }
    }

    async fn release(&self, name: &str, token: &LockToken) -> Result<()> {
        self.holders.remove_if(name, |_, (held, _)| held == token);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Lock
// ═══════════════════════════════════════════════════════════════════════════════

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Lock stored in Redis, shared across processes.
pub struct RedisLeaderLock {
    client: redis::Client,
    prefix: String,
}

impl RedisLeaderLock {
    /// # Arguments
    /// * `client` - A Redis client
    /// * `prefix` - Key prefix (e.g. `"dsq:lock:"`)
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                DsqError::with_internal(
                    ErrorCode::RedisConnectionFailed,
                    "Failed to get Redis connection for leader lock",
                    e.to_string(),
                )
            })
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

#[async_trait]
impl LeaderLock for RedisLeaderLock {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let token = LockToken::generate();
        let mut conn = self.get_conn().await?;

        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.key(name))
            .arg(&token.0)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        tracing::debug!(lock = %name, acquired = acquired.is_some(), "Leader lock attempt");
        Ok(acquired.map(|_| token))
    }

    async fn release(&self, name: &str, token: &LockToken) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.key(name))
            .arg(&token.0)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
