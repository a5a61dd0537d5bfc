use crate::channel_log::FinalizedChannelLog;
use async_trait::async_trait;
use courier_core::Result;
use tracing::{info, warn};

/// Destination for finalized channel logs. Separate from the event store and
/// the relational store: production deployments typically point this at a
/// document or object store sized for write-heavy, read-rarely traffic.
#[async_trait]
pub trait LogBackend: Send + Sync {
    async fn write(&self, log: FinalizedChannelLog) -> Result<()>;
}

/// Discards logs. Used in tests and for channels whose `log_policy` is
/// `None`.
pub struct NullLogBackend;

#[async_trait]
impl LogBackend for NullLogBackend {
    async fn write(&self, _log: FinalizedChannelLog) -> Result<()> {
        Ok(())
    }
}

/// Emits the finalized log as a structured `tracing` event so it lines up
/// with the surrounding `#[instrument]` spans for an operator grepping both.
/// The default backend until a document-store-backed one is needed.
pub struct TracingLogBackend;

#[async_trait]
impl LogBackend for TracingLogBackend {
    async fn write(&self, log: FinalizedChannelLog) -> Result<()> {
        if log.errors.is_empty() {
            info!(
                log_uuid = %log.uuid,
                channel_uuid = %log.channel_uuid,
                log_type = ?log.log_type,
                elapsed_ms = log.elapsed.as_millis() as u64,
                http_traces = log.http_traces.len(),
                "channel log"
            );
        } else {
            warn!(
                log_uuid = %log.uuid,
                channel_uuid = %log.channel_uuid,
                log_type = ?log.log_type,
                elapsed_ms = log.elapsed.as_millis() as u64,
                errors = ?log.errors,
                "channel log with errors"
            );
        }
        Ok(())
    }
}
