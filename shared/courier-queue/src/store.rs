use async_trait::async_trait;
use courier_core::{MsgOut, Result};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueTier {
    High,
    Bulk,
}

/// `{push(tier, item), popHighestPriority(excludeChannels) -> item?,
/// throttle(channel, duration), isThrottled(channel) -> bool,
/// markProcessed(item)}` per §9.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn push(&self, tier: QueueTier, msg: MsgOut) -> Result<()>;

    /// Pops the highest-priority eligible message: high tier before bulk,
    /// skipping messages whose channel is in `exclude_channels` (callers pass
    /// the currently-throttled channel set; implementations may also consult
    /// their own throttle state directly).
    async fn pop_highest_priority(&self, exclude_channels: &[Uuid]) -> Result<Option<MsgOut>>;

    async fn throttle(&self, channel_uuid: Uuid, duration: Duration) -> Result<()>;

    async fn is_throttled(&self, channel_uuid: Uuid) -> Result<bool>;

    /// Acknowledges successful processing. A no-op for backends without
    /// redelivery tracking; meaningful for backends that need an explicit ack
    /// to release an in-flight reservation.
    async fn mark_processed(&self, msg_uuid: Uuid) -> Result<()>;
}
