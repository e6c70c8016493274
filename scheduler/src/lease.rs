//! Single-flight guard for the reconciliation command.
//!
//! A holder that crashes never blocks later cycles for longer than the TTL.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Proof of holding a named lease until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGuard {
    name: String,
    token: Uuid,
    expires_at: Instant,
}

impl LeaseGuard {
    fn new(name: &str, ttl: Duration) -> Self {
        Self {
            name: name.to_string(),
            token: Uuid::new_v4(),
            expires_at: Instant::now() + ttl,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[async_trait]
pub trait CycleLease: Send + Sync {
    /// Takes the lease unless someone else holds an unexpired one.
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LeaseGuard>, LeaseError>;

    /// Gives the lease back. Does nothing if it expired and was taken over.
    async fn release(&self, guard: LeaseGuard) -> Result<(), LeaseError>;
}

/// Lease for a single scheduler instance.
#[derive(Default)]
pub struct InProcessLease {
    held: Mutex<HashMap<String, (Uuid, Instant)>>,
}

impl InProcessLease {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CycleLease for InProcessLease {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LeaseGuard>, LeaseError> {
        let mut held = self.held.lock().await;
        if let Some((_, expires_at)) = held.get(name) {
            if Instant::now() < *expires_at {
                return Ok(None);
            }
        }

        let guard = LeaseGuard::new(name, ttl);
        held.insert(name.to_string(), (guard.token, guard.expires_at));
        Ok(Some(guard))
    }

    async fn release(&self, guard: LeaseGuard) -> Result<(), LeaseError> {
        let mut held = self.held.lock().await;
        if held.get(&guard.name).is_some_and(|(token, _)| *token == guard.token) {
            held.remove(&guard.name);
        }
        Ok(())
    }
}

static RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

pub fn to_lease_key(name: &str) -> String {
    format!("lease:{name}")
}

/// Lease shared by several scheduler instances through Redis.
#[derive(Clone)]
pub struct RedisLease {
    redis: redis::aio::ConnectionManager,
}

impl RedisLease {
    pub fn new(redis: redis::aio::ConnectionManager) -> Self {
        Self { redis }
    }

    pub async fn connect(url: &str) -> Result<Self, LeaseError> {
        let client = redis::Client::open(url)?;
        let redis = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self::new(redis))
    }
}

#[async_trait]
impl CycleLease for RedisLease {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<Option<LeaseGuard>, LeaseError> {
        let mut redis = self.redis.clone();
        let guard = LeaseGuard::new(name, ttl);
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let acquired: Option<String> = redis::cmd("SET")
            .arg(to_lease_key(name))
            .arg(guard.token.to_string())
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut redis)
            .await?;

        Ok(acquired.map(|_| guard))
    }

    async fn release(&self, guard: LeaseGuard) -> Result<(), LeaseError> {
        let mut redis = self.redis.clone();
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(to_lease_key(&guard.name))
            .arg(guard.token.to_string())
            .invoke_async(&mut redis)
            .await?;
        Ok(())
    }
}
