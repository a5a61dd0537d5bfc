//! OutboundDispatcher (§4.F): a bounded pool of workers draining the
//! priority-tiered queue, handing each message to its handler, and
//! translating the result into a StatusUpdate.

use crate::registry::HandlerRegistry;
use courier_core::{Channel, HandlerError, MessageStatus, Result, SendContext, SendResult, StatusUpdate};
use courier_db::{ChannelResolver, StatusEngine};
use courier_eventstore::Spooler;
use courier_log::{ChannelLog, ChannelLogType, LogBackend};
use courier_queue::QueueStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct DispatcherConfig {
    pub worker_count: usize,
    pub send_timeout: Duration,
    pub throttle_cooldown: Duration,
}

pub struct OutboundDispatcher {
    queue: Arc<dyn QueueStore>,
    registry: Arc<HandlerRegistry>,
    resolver: Arc<ChannelResolver>,
    status_engine: Arc<StatusEngine>,
    spooler: Arc<Spooler>,
    log_backend: Arc<dyn LogBackend>,
    cfg: DispatcherConfig,
    stop: Arc<AtomicBool>,
    handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl OutboundDispatcher {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        registry: Arc<HandlerRegistry>,
        resolver: Arc<ChannelResolver>,
        status_engine: Arc<StatusEngine>,
        spooler: Arc<Spooler>,
        log_backend: Arc<dyn LogBackend>,
        cfg: DispatcherConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            resolver,
            status_engine,
            spooler,
            log_backend,
            cfg,
            stop: Arc::new(AtomicBool::new(false)),
            handles: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Spawns the worker pool. `self` must already be wrapped in an `Arc`.
    pub async fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock().await;
        for worker_id in 0..self.cfg.worker_count {
            let dispatcher = self.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.worker_loop(worker_id).await;
            }));
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "outbound worker started");
        while !self.stop.load(Ordering::Relaxed) {
            match self.queue.pop_highest_priority(&[]).await {
                Ok(Some(msg)) => {
                    self.process_one(msg).await;
                }
                Ok(None) => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) => {
                    warn!(worker_id, error = %e, "queue pop failed");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
        debug!(worker_id, "outbound worker stopped");
    }

    #[instrument(skip(self, msg), fields(msg_uuid = %msg.uuid, channel_uuid = %msg.channel_uuid))]
    async fn process_one(&self, msg: courier_core::MsgOut) {
        let channel = match self.resolver.by_uuid(msg.channel_uuid, None).await {
            Ok(channel) => channel,
            Err(courier_core::CourierError::Expired) => {
                warn!("channel cache entry expired, requeueing message");
                let tier = if msg.high_priority {
                    courier_queue::QueueTier::High
                } else {
                    courier_queue::QueueTier::Bulk
                };
                if let Err(e) = self.queue.push(tier, msg).await {
                    error!(error = %e, "failed to requeue message after cache expiry");
                }
                return;
            }
            Err(e) => {
                error!(error = %e, "cannot resolve channel for queued message, dropping");
                return;
            }
        };

        let Some(descriptor) = self.registry.get(&channel.channel_type) else {
            error!(channel_type = %channel.channel_type, "no handler registered for channel type");
            return;
        };

        let clog = ChannelLog::new(
            ChannelLogType::Send,
            &channel,
            descriptor.handler.redact_values(&channel),
        );

        let deadline = Instant::now() + self.cfg.send_timeout;
        let ctx = SendContext::with_deadline(deadline);
        let mut result = SendResult::new();

        let outcome = descriptor
            .handler
            .send(&ctx, &channel, &msg, &mut result, &clog)
            .await;

        let (status_update, requeue, throttle) =
            self.translate_outcome(&channel, &msg, &clog, outcome, &result);

        if let Some(update) = status_update {
            match self.status_engine.apply_batch(&[update]).await {
                Ok(changes) => {
                    for change in changes {
                        if let Err(e) = self.spooler.submit(change).await {
                            error!(error = %e, "failed to submit status change to spooler");
                        }
                    }
                }
                Err(e) => error!(error = %e, "status engine apply_batch failed"),
            }
        }

        if let Some(cooldown) = throttle {
            if let Err(e) = self.queue.throttle(channel.uuid, cooldown).await {
                error!(error = %e, "failed to mark channel throttled");
            }
        }

        if requeue {
            let tier = if msg.high_priority {
                courier_queue::QueueTier::High
            } else {
                courier_queue::QueueTier::Bulk
            };
            if let Err(e) = self.queue.push(tier, msg).await {
                error!(error = %e, "failed to requeue message");
            }
        } else if let Err(e) = self.queue.mark_processed(msg.uuid).await {
            debug!(error = %e, "mark_processed no-op or failed");
        }

        let finalized = clog.end();
        if let Err(e) = self.log_backend.write(finalized).await {
            error!(error = %e, "failed to write channel log");
        }
    }

    /// Returns `(status_update, requeue, throttle_for)` per the §4.F/§7
    /// translation table.
    fn translate_outcome(
        &self,
        channel: &Channel,
        msg: &courier_core::MsgOut,
        clog: &ChannelLog,
        outcome: std::result::Result<(), HandlerError>,
        result: &SendResult,
    ) -> (Option<StatusUpdate>, bool, Option<Duration>) {
        let base = |status: MessageStatus, external_id: Option<String>| StatusUpdate {
            channel_uuid: channel.uuid,
            channel_id: channel.id,
            msg_uuid: Some(msg.uuid),
            external_id,
            status,
            urn_update: None,
            log_uuid: clog.uuid(),
        };

        match outcome {
            Ok(()) => {
                let external_id = result.first_external_id().map(str::to_string);
                (
                    Some(base(MessageStatus::Wired, external_id)),
                    false,
                    None,
                )
            }
            Err(HandlerError::ChannelConfig(msg_text)) => {
                clog.error("channel_config", "", &msg_text);
                (Some(base(MessageStatus::Errored, None)), false, None)
            }
            Err(HandlerError::ConnectionFailed(msg_text)) => {
                clog.error("connection_failed", "", &msg_text);
                (Some(base(MessageStatus::Errored, None)), true, None)
            }
            Err(HandlerError::ConnectionThrottled { code }) => {
                clog.error(
                    courier_log::codes::EXTERNAL,
                    &code,
                    "provider signaled throttle",
                );
                (None, true, Some(self.cfg.throttle_cooldown))
            }
            Err(HandlerError::ResponseStatus { status }) => {
                clog.error(
                    courier_log::codes::RESPONSE_STATUS_CODE,
                    &status.to_string(),
                    "unexpected response status",
                );
                (Some(base(MessageStatus::Errored, None)), false, None)
            }
            Err(HandlerError::ResponseUnparseable(msg_text)) => {
                clog.error(courier_log::codes::RESPONSE_UNPARSEABLE, "", &msg_text);
                (Some(base(MessageStatus::Errored, None)), false, None)
            }
            Err(HandlerError::ResponseUnexpected(msg_text)) => {
                clog.error(courier_log::codes::RESPONSE_VALUE_MISSING, "", &msg_text);
                (Some(base(MessageStatus::Errored, None)), false, None)
            }
            Err(HandlerError::FailedWithReason { code, message }) => {
                clog.error(courier_log::codes::EXTERNAL, &code, &message);
                (Some(base(MessageStatus::Errored, None)), false, None)
            }
        }
    }

    /// Graceful shutdown: stop popping new messages, wait up to `deadline`
    /// for in-flight sends to finish, then abort any stragglers.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.stop.store(true, Ordering::Relaxed);
        let mut handles = self.handles.lock().await;
        let joined = tokio::time::timeout(
            deadline,
            futures_join_all(handles.drain(..).collect::<Vec<_>>()),
        )
        .await;
        if joined.is_err() {
            warn!("outbound dispatcher shutdown deadline exceeded, aborting stragglers");
        }
        Ok(())
    }
}

async fn futures_join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}
