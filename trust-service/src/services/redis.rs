use async_trait::async_trait;
use dashmap::DashMap;
use redis::{aio::ConnectionManager, Client};
use std::time::{Duration, Instant};

/// Shared list of revoked credentials. Keys are namespaced by the caller
/// (`impersonation:{sid}`, `session:{sid}`) and expire after their TTL.
#[async_trait]
pub trait RevocationList: Send + Sync {
    async fn revoke(&self, key: &str, ttl_seconds: i64) -> Result<(), anyhow::Error>;
    async fn is_revoked(&self, key: &str) -> Result<bool, anyhow::Error>;
    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

pub fn impersonation_key(session_id: &uuid::Uuid) -> String {
    format!("impersonation:{}", session_id)
}

pub fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

#[derive(Clone)]
pub struct RedisService {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisService {
    pub async fn new(config: &crate::config::RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }
}

#[async_trait]
impl RevocationList for RedisService {
    async fn revoke(&self, key: &str, ttl_seconds: i64) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(format!("revoked:{}", key))
            .arg("1")
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to revoke {}: {}", key, e))
    }

    async fn is_revoked(&self, key: &str) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(format!("revoked:{}", key))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to check revocation: {}", e))?;
        Ok(exists)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}

/// Process-local revocation list. Only correct for a single instance.
#[derive(Default)]
pub struct MemoryRevocationList {
    entries: DashMap<String, Instant>,
}

impl MemoryRevocationList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops expired keys.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, until| *until > now);
    }
}

#[async_trait]
impl RevocationList for MemoryRevocationList {
    async fn revoke(&self, key: &str, ttl_seconds: i64) -> Result<(), anyhow::Error> {
        let ttl = Duration::from_secs(ttl_seconds.max(1) as u64);
        self.purge_expired();
        self.entries.insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn is_revoked(&self, key: &str) -> Result<bool, anyhow::Error> {
        let live = match self.entries.get(key) {
            Some(until) => *until > Instant::now(),
            None => return Ok(false),
        };
        if !live {
            self.entries.remove(key);
        }
        Ok(live)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn revoked_keys_are_reported_until_purged() {
        let list = MemoryRevocationList::new();
        let sid = uuid::Uuid::new_v4();

        assert!(!list.is_revoked(&impersonation_key(&sid)).await.unwrap());
        list.revoke(&impersonation_key(&sid), 60).await.unwrap();
        assert!(list.is_revoked(&impersonation_key(&sid)).await.unwrap());
        assert!(!list.is_revoked(&session_key(&sid.to_string())).await.unwrap());

        list.purge_expired();
        assert!(list.is_revoked(&impersonation_key(&sid)).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires running Redis
    async fn redis_revocation_round_trip() {
        let service = RedisService::new(&crate::config::RedisConfig {
            url: "redis://127.0.0.1:6379".to_string(),
        })
        .await
        .unwrap();
        let key = session_key(&uuid::Uuid::new_v4().to_string());

        service.revoke(&key, 5).await.unwrap();
        assert!(service.is_revoked(&key).await.unwrap());
    }
}
