use crate::store::{QueueStore, QueueTier};
use async_trait::async_trait;
use courier_core::{CourierError, MsgOut, Result};
use redis::AsyncCommands;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

const THROTTLE_SET: &str = "msgs:throttled";
const MAX_POP_ATTEMPTS: usize = 16;

fn list_key(tier: QueueTier) -> &'static str {
    match tier {
        QueueTier::High => "msgs:active",
        QueueTier::Bulk => "msgs:bulk",
    }
}

/// Valkey/Redis-protocol backed `QueueStore`: `msgs:active` / `msgs:bulk`
/// lists plus a `msgs:throttled` sorted set scored by expiry epoch.
pub struct RedisQueueStore {
    pool: deadpool_redis::Pool,
}

impl RedisQueueStore {
    pub fn new(pool: deadpool_redis::Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| CourierError::Queue(e.to_string()))
    }

    async fn pop_from(
        &self,
        conn: &mut deadpool_redis::Connection,
        tier: QueueTier,
        exclude_channels: &[Uuid],
    ) -> Result<Option<MsgOut>> {
        let key = list_key(tier);
        let mut skipped = Vec::new();
        let mut found = None;

        for _ in 0..MAX_POP_ATTEMPTS {
            let raw: Option<String> = conn
                .lpop(key, None)
                .await
                .map_err(|e| CourierError::Queue(e.to_string()))?;
            let Some(raw) = raw else { break };
            let msg: MsgOut = serde_json::from_str(&raw)
                .map_err(|e| CourierError::Queue(format!("corrupt queue entry: {e}")))?;

            let now_epoch = chrono::Utc::now().timestamp();
            let throttled_score: Option<i64> = conn
                .zscore(THROTTLE_SET, msg.channel_uuid.to_string())
                .await
                .map_err(|e| CourierError::Queue(e.to_string()))?;
            let is_throttled = exclude_channels.contains(&msg.channel_uuid)
                || throttled_score.is_some_and(|expiry| expiry > now_epoch);

            if is_throttled {
                skipped.push(raw);
                continue;
            }

            found = Some(msg);
            break;
        }

        for raw in skipped {
            let _: () = conn
                .rpush(key, raw)
                .await
                .map_err(|e| CourierError::Queue(e.to_string()))?;
        }

        Ok(found)
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    #[instrument(skip(self, msg))]
    async fn push(&self, tier: QueueTier, msg: MsgOut) -> Result<()> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(&msg)
            .map_err(|e| CourierError::Queue(format!("failed to encode MsgOut: {e}")))?;
        let _: () = conn
            .rpush(list_key(tier), payload)
            .await
            .map_err(|e| CourierError::Queue(e.to_string()))?;
        Ok(())
    }

    async fn pop_highest_priority(&self, exclude_channels: &[Uuid]) -> Result<Option<MsgOut>> {
        let mut conn = self.conn().await?;
        if let Some(msg) = self
            .pop_from(&mut conn, QueueTier::High, exclude_channels)
            .await?
        {
            return Ok(Some(msg));
        }
        self.pop_from(&mut conn, QueueTier::Bulk, exclude_channels)
            .await
    }

    async fn throttle(&self, channel_uuid: Uuid, duration: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        let expiry = chrono::Utc::now().timestamp() + duration.as_secs() as i64;
        let _: () = conn
            .zadd(THROTTLE_SET, channel_uuid.to_string(), expiry)
            .await
            .map_err(|e| CourierError::Queue(e.to_string()))?;
        Ok(())
    }

    async fn is_throttled(&self, channel_uuid: Uuid) -> Result<bool> {
        let mut conn = self.conn().await?;
        let score: Option<i64> = conn
            .zscore(THROTTLE_SET, channel_uuid.to_string())
            .await
            .map_err(|e| CourierError::Queue(e.to_string()))?;
        Ok(score.is_some_and(|expiry| expiry > chrono::Utc::now().timestamp()))
    }

    async fn mark_processed(&self, msg_uuid: Uuid) -> Result<()> {
        // The list-backed queue has no in-flight reservation to release; this
        // is a hook for backends (e.g. streams) that need an explicit ack.
        let _ = msg_uuid;
        Ok(())
    }
}
