use crate::store::{QueueStore, QueueTier};
use async_trait::async_trait;
use courier_core::{MsgOut, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// In-memory `QueueStore` for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryQueueStore {
    high: Mutex<VecDeque<MsgOut>>,
    bulk: Mutex<VecDeque<MsgOut>>,
    throttled: DashMap<Uuid, Instant>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_expired_throttle(&self, channel_uuid: Uuid) -> bool {
        match self.throttled.get(&channel_uuid) {
            Some(expires_at) => Instant::now() >= *expires_at.value(),
            None => true,
        }
    }

    fn pop_tier(
        &self,
        tier: &Mutex<VecDeque<MsgOut>>,
        exclude_channels: &[Uuid],
    ) -> Option<MsgOut> {
        let mut queue = tier.lock();
        let len = queue.len();
        for _ in 0..len {
            let msg = queue.pop_front()?;
            let throttled = exclude_channels.contains(&msg.channel_uuid)
                || !self.is_expired_throttle(msg.channel_uuid);
            if throttled {
                queue.push_back(msg);
                continue;
            }
            return Some(msg);
        }
        None
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn push(&self, tier: QueueTier, msg: MsgOut) -> Result<()> {
        match tier {
            QueueTier::High => self.high.lock().push_back(msg),
            QueueTier::Bulk => self.bulk.lock().push_back(msg),
        }
        Ok(())
    }

    async fn pop_highest_priority(&self, exclude_channels: &[Uuid]) -> Result<Option<MsgOut>> {
        if let Some(msg) = self.pop_tier(&self.high, exclude_channels) {
            return Ok(Some(msg));
        }
        Ok(self.pop_tier(&self.bulk, exclude_channels))
    }

    async fn throttle(&self, channel_uuid: Uuid, duration: Duration) -> Result<()> {
        self.throttled.insert(channel_uuid, Instant::now() + duration);
        Ok(())
    }

    async fn is_throttled(&self, channel_uuid: Uuid) -> Result<bool> {
        Ok(match self.throttled.get(&channel_uuid) {
            Some(expires_at) => Instant::now() < *expires_at.value(),
            None => false,
        })
    }

    async fn mark_processed(&self, _msg_uuid: Uuid) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{MsgOrigin, MsgOut};

    fn msg(channel_uuid: Uuid) -> MsgOut {
        MsgOut {
            uuid: Uuid::new_v4(),
            id: 1,
            channel_uuid,
            urn: "whatsapp:250788123123".to_string(),
            urn_auth: None,
            text: "hi".to_string(),
            attachments: vec![],
            quick_replies: vec![],
            templating: None,
            response_to_external_id: None,
            high_priority: false,
            locale: None,
            origin: MsgOrigin::Flow,
            contact_uuid: None,
            flow_uuid: None,
        }
    }

    #[tokio::test]
    async fn high_tier_drains_before_bulk() {
        let store = InMemoryQueueStore::new();
        let channel = Uuid::new_v4();
        store.push(QueueTier::Bulk, msg(channel)).await.unwrap();
        let high_msg = msg(channel);
        let high_uuid = high_msg.uuid;
        store.push(QueueTier::High, high_msg).await.unwrap();

        let popped = store.pop_highest_priority(&[]).await.unwrap().unwrap();
        assert_eq!(popped.uuid, high_uuid);
    }

    #[tokio::test]
    async fn throttled_channel_is_skipped_until_cooldown_expires() {
        let store = InMemoryQueueStore::new();
        let channel = Uuid::new_v4();
        store.push(QueueTier::High, msg(channel)).await.unwrap();
        store
            .throttle(channel, Duration::from_millis(20))
            .await
            .unwrap();

        assert!(store.pop_highest_priority(&[]).await.unwrap().is_none());
        assert!(store.is_throttled(channel).await.unwrap());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!store.is_throttled(channel).await.unwrap());
        assert!(store.pop_highest_priority(&[]).await.unwrap().is_some());
    }
}
