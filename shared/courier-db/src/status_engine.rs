//! StatusEngine (§4.E): applies a batch of `StatusUpdate`s against the
//! relational store in a single transaction, producing a `StatusChange` per
//! applied row.
//!
//! The transition math lives in `compute_status_change`, a pure function
//! testable without a database connection. The batch is still applied inside
//! one transaction and in submission order; each row is locked with
//! `SELECT ... FOR UPDATE` before its computed change is written, so the
//! per-row loop gives the same atomicity and ordering guarantees a single
//! combined statement would, at the cost of N round trips instead of one.

use crate::pool::CourierDbPool;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use courier_core::{CourierError, Direction, MessageStatus, Result, StatusChange, StatusUpdate};
use tracing::{instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct StatusEngineConfig {
    pub retry_backoff_minutes: i64,
    pub error_threshold: i32,
}

impl Default for StatusEngineConfig {
    fn default() -> Self {
        Self {
            retry_backoff_minutes: 5,
            error_threshold: 2,
        }
    }
}

/// The row state `compute_status_change` needs, read under `FOR UPDATE`
/// before the change is computed.
#[derive(Debug, Clone)]
pub struct ExistingMsgRow {
    pub id: i64,
    pub direction: Direction,
    pub status: MessageStatus,
    pub error_count: i32,
    pub contact_uuid: Uuid,
    pub org_id: i64,
}

/// The computed change for one row, ready to be written with an
/// `UPDATE ... RETURNING`.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedChange {
    pub new_status: MessageStatus,
    pub new_error_count: i32,
    pub next_attempt: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
}

/// Pure transition function (§4.E, §8 invariants). `now` is passed in rather
/// than read from the clock so the 10-minute/15-minute backoff scenarios
/// (S2) are exactly reproducible in tests.
pub fn compute_status_change(
    existing: &ExistingMsgRow,
    incoming_status: MessageStatus,
    cfg: &StatusEngineConfig,
    now: DateTime<Utc>,
) -> Result<Option<ComputedChange>> {
    if existing.direction != Direction::Outbound {
        return Ok(None);
    }

    // Monotonic per invariant 2: a terminal status is never reopened, and a
    // send-progress status never regresses past one already recorded.
    if existing.status == MessageStatus::Failed {
        return Ok(None);
    }
    if existing.status.is_sent_state() && incoming_status.is_sent_state() {
        if rank(incoming_status) <= rank(existing.status) {
            return Ok(None);
        }
    }

    if incoming_status == MessageStatus::Errored {
        let new_error_count = existing.error_count + 1;
        // Promotion looks at the count already on the row before this error,
        // matching `existing.error_count >= 2` in the source formula; only
        // `next_attempt`/`failed_reason` use the post-increment count.
        let promote_to_failed = existing.error_count >= cfg.error_threshold;

        if promote_to_failed {
            return Ok(Some(ComputedChange {
                new_status: MessageStatus::Failed,
                new_error_count,
                next_attempt: None,
                failed_reason: Some("error_limit".to_string()),
            }));
        }

        let backoff_minutes = cfg.retry_backoff_minutes * (new_error_count as i64 + 1);
        return Ok(Some(ComputedChange {
            new_status: MessageStatus::Errored,
            new_error_count,
            next_attempt: Some(now + ChronoDuration::minutes(backoff_minutes)),
            failed_reason: None,
        }));
    }

    Ok(Some(ComputedChange {
        new_status: incoming_status,
        new_error_count: existing.error_count,
        next_attempt: None,
        failed_reason: None,
    }))
}

fn rank(status: MessageStatus) -> u8 {
    match status {
        MessageStatus::Pending => 0,
        MessageStatus::Queued => 1,
        MessageStatus::Wired => 2,
        MessageStatus::Sent => 3,
        MessageStatus::Delivered => 4,
        MessageStatus::Read => 5,
        MessageStatus::Errored => 2,
        MessageStatus::Failed => 6,
    }
}

/// Drives `compute_status_change` against the relational store, one
/// transaction per `apply_batch` call.
pub struct StatusEngine {
    pool: CourierDbPool,
    cfg: StatusEngineConfig,
}

impl StatusEngine {
    pub fn new(pool: CourierDbPool, cfg: StatusEngineConfig) -> Self {
        Self { pool, cfg }
    }

    #[instrument(skip(self, updates))]
    pub async fn apply_batch(&self, updates: &[StatusUpdate]) -> Result<Vec<StatusChange>> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.pool.get().await?;
        let txn = conn
            .transaction()
            .await
            .map_err(|e| CourierError::Database(e.to_string()))?;

        let mut changes = Vec::with_capacity(updates.len());
        let now = Utc::now();

        for update in updates {
            if let Some(urn_update) = &update.urn_update {
                urn_update
                    .validate()
                    .map_err(CourierError::Usage)?;
            }

            let row = txn
                .query_opt(
                    "SELECT m.id, m.direction, m.status, m.error_count, m.contact_uuid, m.org_id \
                     FROM msgs_msg m \
                     WHERE ($1::uuid IS NOT NULL AND m.uuid = $1 AND m.channel_id = $2) \
                        OR ($1::uuid IS NULL AND m.channel_id = $2 AND m.external_id = $3) \
                     FOR UPDATE",
                    &[&update.msg_uuid, &update.channel_id, &update.external_id],
                )
                .await
                .map_err(|e| CourierError::Database(e.to_string()))?;

            let Some(row) = row else {
                warn!(
                    channel_uuid = %update.channel_uuid,
                    external_id = ?update.external_id,
                    "status update for unknown message, skipping"
                );
                continue;
            };

            let existing = ExistingMsgRow {
                id: row.get("id"),
                direction: direction_from_str(row.get("direction")),
                status: status_from_str(row.get("status")),
                error_count: row.get("error_count"),
                contact_uuid: row.get("contact_uuid"),
                org_id: row.get("org_id"),
            };

            let Some(change) = compute_status_change(&existing, update.status, &self.cfg, now)?
            else {
                continue;
            };

            let msg_uuid = txn
                .query_one(
                    "UPDATE msgs_msg SET \
                        status = $1, \
                        error_count = $2, \
                        next_attempt = $3, \
                        failed_reason = COALESCE($4, failed_reason), \
                        external_id = COALESCE($5, external_id), \
                        sent_on = CASE WHEN $6 THEN COALESCE(sent_on, $7) ELSE sent_on END, \
                        log_uuids = array_append(log_uuids, $8) \
                     WHERE id = $9 \
                     RETURNING uuid",
                    &[
                        &status_to_str(change.new_status),
                        &change.new_error_count,
                        &change.next_attempt,
                        &change.failed_reason,
                        &update.external_id,
                        &change.new_status.is_sent_state(),
                        &now,
                        &update.log_uuid,
                        &existing.id,
                    ],
                )
                .await
                .map_err(|e| CourierError::Database(e.to_string()))?;

            changes.push(StatusChange {
                contact_uuid: existing.contact_uuid,
                msg_uuid: msg_uuid.get("uuid"),
                status: change.new_status,
                failed_reason: change.failed_reason,
                org_id: existing.org_id,
                timestamp: now,
                urn_update: update.urn_update.clone(),
            });
        }

        txn.commit()
            .await
            .map_err(|e| CourierError::Database(e.to_string()))?;

        Ok(changes)
    }
}

fn direction_from_str(s: String) -> Direction {
    match s.as_str() {
        "out" | "outbound" => Direction::Outbound,
        _ => Direction::Inbound,
    }
}

fn status_from_str(s: String) -> MessageStatus {
    match s.as_str() {
        "pending" => MessageStatus::Pending,
        "queued" => MessageStatus::Queued,
        "wired" => MessageStatus::Wired,
        "sent" => MessageStatus::Sent,
        "delivered" => MessageStatus::Delivered,
        "read" => MessageStatus::Read,
        "errored" => MessageStatus::Errored,
        _ => MessageStatus::Failed,
    }
}

fn status_to_str(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Pending => "pending",
        MessageStatus::Queued => "queued",
        MessageStatus::Wired => "wired",
        MessageStatus::Sent => "sent",
        MessageStatus::Delivered => "delivered",
        MessageStatus::Read => "read",
        MessageStatus::Errored => "errored",
        MessageStatus::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base_row(status: MessageStatus, error_count: i32) -> ExistingMsgRow {
        ExistingMsgRow {
            id: 1,
            direction: Direction::Outbound,
            status,
            error_count,
            contact_uuid: Uuid::new_v4(),
            org_id: 1,
        }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, minute, 0).unwrap()
    }

    #[test]
    fn inbound_messages_are_never_touched() {
        let mut row = base_row(MessageStatus::Queued, 0);
        row.direction = Direction::Inbound;
        let cfg = StatusEngineConfig::default();
        let result = compute_status_change(&row, MessageStatus::Sent, &cfg, at(0)).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn failed_is_terminal_invariant() {
        let row = base_row(MessageStatus::Failed, 2);
        let cfg = StatusEngineConfig::default();
        let result = compute_status_change(&row, MessageStatus::Sent, &cfg, at(0)).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn sent_progress_never_regresses() {
        let row = base_row(MessageStatus::Delivered, 0);
        let cfg = StatusEngineConfig::default();
        let result = compute_status_change(&row, MessageStatus::Sent, &cfg, at(0)).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn sent_progress_advances_forward() {
        let row = base_row(MessageStatus::Sent, 0);
        let cfg = StatusEngineConfig::default();
        let result = compute_status_change(&row, MessageStatus::Delivered, &cfg, at(0))
            .unwrap()
            .unwrap();
        assert_eq!(result.new_status, MessageStatus::Delivered);
    }

    /// S1: happy path, wired -> sent -> delivered, no errors.
    #[test]
    fn s1_happy_path_wired_to_delivered() {
        let cfg = StatusEngineConfig::default();
        let row = base_row(MessageStatus::Wired, 0);
        let sent = compute_status_change(&row, MessageStatus::Sent, &cfg, at(0))
            .unwrap()
            .unwrap();
        assert_eq!(sent.new_status, MessageStatus::Sent);
        assert_eq!(sent.new_error_count, 0);

        let row = base_row(MessageStatus::Sent, 0);
        let delivered = compute_status_change(&row, MessageStatus::Delivered, &cfg, at(1))
            .unwrap()
            .unwrap();
        assert_eq!(delivered.new_status, MessageStatus::Delivered);
        assert!(delivered.failed_reason.is_none());
    }

    /// S2: two errors then a third promotes to Failed; backoff grows with
    /// each error (10 min after the 1st, 15 min after the 2nd), default
    /// ERROR_THRESHOLD=2 so the third error is the one that fails the message.
    #[test]
    fn s2_three_errors_promote_to_failed_with_growing_backoff() {
        let cfg = StatusEngineConfig::default();
        assert_eq!(cfg.error_threshold, 2);

        let row = base_row(MessageStatus::Wired, 0);
        let first = compute_status_change(&row, MessageStatus::Errored, &cfg, at(0))
            .unwrap()
            .unwrap();
        assert_eq!(first.new_status, MessageStatus::Errored);
        assert_eq!(first.new_error_count, 1);
        assert_eq!(first.next_attempt.unwrap(), at(10));

        let row = base_row(MessageStatus::Errored, 1);
        let second = compute_status_change(&row, MessageStatus::Errored, &cfg, at(10))
            .unwrap()
            .unwrap();
        assert_eq!(second.new_status, MessageStatus::Errored);
        assert_eq!(second.new_error_count, 2);
        assert_eq!(second.next_attempt.unwrap(), at(10 + 15));

        let row = base_row(MessageStatus::Errored, 2);
        let third = compute_status_change(&row, MessageStatus::Errored, &cfg, at(25))
            .unwrap()
            .unwrap();
        assert_eq!(third.new_status, MessageStatus::Failed);
        assert_eq!(third.new_error_count, 3);
        assert_eq!(third.failed_reason.as_deref(), Some("error_limit"));
        assert!(third.next_attempt.is_none());
    }

    /// S5: urn update validation rejects a same-path rewrite before any row
    /// is touched.
    #[test]
    fn s5_urn_update_validation_is_enforced_by_the_type() {
        use courier_core::{Urn, UrnUpdate};
        let update = UrnUpdate {
            old: Urn::parse("whatsapp:+1").unwrap(),
            new: Urn::parse("whatsapp:+1").unwrap(),
        };
        assert!(update.validate().is_err());
    }

    #[test]
    fn error_count_increments_from_existing_not_reset() {
        let cfg = StatusEngineConfig::default();
        let row = base_row(MessageStatus::Errored, 5);
        let result = compute_status_change(&row, MessageStatus::Errored, &cfg, at(0))
            .unwrap()
            .unwrap();
        assert_eq!(result.new_error_count, 6);
    }

    #[test]
    fn non_error_status_does_not_touch_error_count() {
        let cfg = StatusEngineConfig::default();
        let row = base_row(MessageStatus::Errored, 1);
        let result = compute_status_change(&row, MessageStatus::Sent, &cfg, at(0))
            .unwrap()
            .unwrap();
        assert_eq!(result.new_error_count, 1);
        assert_eq!(result.new_status, MessageStatus::Sent);
    }

    /// Invariant 1: after K consecutive Errored updates to one message,
    /// error_count == min(K, ERROR_THRESHOLD+1) and status is Failed iff
    /// K > ERROR_THRESHOLD. Once Failed the row is terminal (§8 invariant 2),
    /// so further updates are no-ops and error_count stays capped.
    #[test]
    fn invariant_one_error_count_and_failed_promotion_over_k_updates() {
        let cfg = StatusEngineConfig::default();
        let threshold = cfg.error_threshold;
        let mut existing_count = 0;
        let mut status = MessageStatus::Wired;

        for k in 1..=5i32 {
            let row = base_row(status, existing_count);
            let applied = compute_status_change(&row, MessageStatus::Errored, &cfg, at(0)).unwrap();

            let expected_count = k.min(threshold + 1);
            match applied {
                Some(change) => {
                    assert_eq!(change.new_error_count, expected_count, "k={k}");
                    assert_eq!(
                        change.new_status == MessageStatus::Failed,
                        k > threshold,
                        "k={k}"
                    );
                    existing_count = change.new_error_count;
                    status = change.new_status;
                }
                None => {
                    // Terminal: message was already Failed, row untouched.
                    assert_eq!(status, MessageStatus::Failed, "k={k}");
                    assert_eq!(existing_count, expected_count, "k={k}");
                }
            }
        }
    }
}
