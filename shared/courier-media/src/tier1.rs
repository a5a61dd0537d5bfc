use async_trait::async_trait;
use courier_core::{CourierError, Result};
use dashmap::DashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// The distributed-hash tier: `source-URL -> provider-media-id` under key
/// `media:<channel-uuid>`, 24h TTL.
#[async_trait]
pub trait Tier1Store: Send + Sync {
    async fn get(&self, channel_uuid: Uuid, src_url: &str) -> Result<Option<String>>;
    async fn set(
        &self,
        channel_uuid: Uuid,
        src_url: &str,
        media_id: &str,
        ttl: Duration,
    ) -> Result<()>;
}

/// Valkey/Redis-protocol backed tier 1, production implementation.
pub struct RedisTier1Store {
    pool: deadpool_redis::Pool,
}

impl RedisTier1Store {
    pub fn new(pool: deadpool_redis::Pool) -> Self {
        Self { pool }
    }

    fn key(channel_uuid: Uuid) -> String {
        format!("media:{}", channel_uuid)
    }
}

#[async_trait]
impl Tier1Store for RedisTier1Store {
    async fn get(&self, channel_uuid: Uuid, src_url: &str) -> Result<Option<String>> {
        use redis::AsyncCommands;
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CourierError::Media(e.to_string()))?;
        let value: Option<String> = conn
            .hget(Self::key(channel_uuid), src_url)
            .await
            .map_err(|e| CourierError::Media(e.to_string()))?;
        Ok(value)
    }

    async fn set(
        &self,
        channel_uuid: Uuid,
        src_url: &str,
        media_id: &str,
        ttl: Duration,
    ) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CourierError::Media(e.to_string()))?;
        let key = Self::key(channel_uuid);
        let _: () = conn
            .hset(&key, src_url, media_id)
            .await
            .map_err(|e| CourierError::Media(e.to_string()))?;
        let _: () = conn
            .expire(&key, ttl.as_secs() as i64)
            .await
            .map_err(|e| CourierError::Media(e.to_string()))?;
        Ok(())
    }
}

/// In-memory tier 1 for tests and single-process deployments. Entries expire
/// lazily on read, matching the semantics a real TTL-backed hash would show.
#[derive(Default)]
pub struct InMemoryTier1Store {
    entries: DashMap<(Uuid, String), (String, Instant)>,
}

impl InMemoryTier1Store {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Tier1Store for InMemoryTier1Store {
    async fn get(&self, channel_uuid: Uuid, src_url: &str) -> Result<Option<String>> {
        let key = (channel_uuid, src_url.to_string());
        if let Some(entry) = self.entries.get(&key) {
            let (media_id, expires_at) = entry.value().clone();
            if Instant::now() < expires_at {
                return Ok(Some(media_id));
            }
        }
        self.entries.remove(&key);
        Ok(None)
    }

    async fn set(
        &self,
        channel_uuid: Uuid,
        src_url: &str,
        media_id: &str,
        ttl: Duration,
    ) -> Result<()> {
        self.entries.insert(
            (channel_uuid, src_url.to_string()),
            (media_id.to_string(), Instant::now() + ttl),
        );
        Ok(())
    }
}
