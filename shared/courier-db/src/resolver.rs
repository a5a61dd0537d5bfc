//! ChannelResolver (§4.B): loads a channel by UUID or by (type, address) with
//! a short-TTL in-process cache.

use crate::pool::CourierDbPool;
use chrono::Utc;
use courier_core::{Channel, ChannelRole, CourierError, LogPolicy, Result};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, instrument};
use uuid::Uuid;

struct CacheEntry {
    channel: Channel,
    cached_at: Instant,
}

/// Single-writer-on-refresh, multi-reader-via-copy-on-read cache in front of
/// the relational store.
pub struct ChannelResolver {
    pool: CourierDbPool,
    cache: DashMap<Uuid, CacheEntry>,
    ttl: Duration,
}

impl ChannelResolver {
    pub fn new(pool: CourierDbPool) -> Self {
        Self::with_ttl(pool, Duration::from_secs(5 * 60))
    }

    pub fn with_ttl(pool: CourierDbPool, ttl: Duration) -> Self {
        Self {
            pool,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// `byUUID(uuid) -> Channel | ErrNotFound | ErrWrongType | ErrExpired`.
    /// `expected_type`, when non-empty, must match the channel's type.
    #[instrument(skip(self))]
    pub async fn by_uuid(&self, uuid: Uuid, expected_type: Option<&str>) -> Result<Channel> {
        if let Some(entry) = self.cache.get(&uuid) {
            if entry.cached_at.elapsed() > self.ttl {
                drop(entry);
                self.cache.remove(&uuid);
                return Err(CourierError::Expired);
            }
            let channel = entry.channel.clone();
            drop(entry);
            check_type(&channel, expected_type)?;
            return Ok(channel);
        }

        let channel = self.load_by_uuid(uuid).await?;
        self.cache.insert(
            uuid,
            CacheEntry {
                channel: channel.clone(),
                cached_at: Instant::now(),
            },
        );
        check_type(&channel, expected_type)?;
        Ok(channel)
    }

    /// `byAddress(channelType, address) -> Channel | ErrNotFound`. Always a
    /// relational lookup; the cache is keyed by UUID, not address.
    #[instrument(skip(self))]
    pub async fn by_address(&self, channel_type: &str, address: &str) -> Result<Channel> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT c.uuid, c.id, c.org_id, c.channel_type, c.name, c.address, c.country, \
                 c.schemes, c.roles, c.config, c.log_policy, o.config AS org_config, o.is_anon \
                 FROM channels_channel c \
                 JOIN orgs_org o ON o.id = c.org_id \
                 WHERE c.channel_type = $1 AND c.address = $2 AND c.is_active",
                &[&channel_type, &address],
            )
            .await
            .map_err(|e| CourierError::Database(e.to_string()))?;

        let row = row.ok_or_else(|| {
            CourierError::NotFound(format!("channel {channel_type}/{address} not found"))
        })?;
        Ok(row_to_channel(&row))
    }

    async fn load_by_uuid(&self, uuid: Uuid) -> Result<Channel> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_opt(
                "SELECT c.uuid, c.id, c.org_id, c.channel_type, c.name, c.address, c.country, \
                 c.schemes, c.roles, c.config, c.log_policy, o.config AS org_config, o.is_anon \
                 FROM channels_channel c \
                 JOIN orgs_org o ON o.id = c.org_id \
                 WHERE c.uuid = $1 AND c.is_active",
                &[&uuid],
            )
            .await
            .map_err(|e| CourierError::Database(e.to_string()))?;

        let row = row
            .ok_or_else(|| CourierError::NotFound(format!("channel {uuid} not found")))?;
        debug!(channel_uuid = %uuid, "loaded channel from relational store");
        Ok(row_to_channel(&row))
    }

    /// Evicts a cache entry, e.g. after a channel config change elsewhere.
    pub fn invalidate(&self, uuid: Uuid) {
        self.cache.remove(&uuid);
    }
}

fn check_type(channel: &Channel, expected_type: Option<&str>) -> Result<()> {
    if let Some(expected) = expected_type {
        if !expected.is_empty() && channel.channel_type != expected {
            return Err(CourierError::WrongChannelType {
                expected: expected.to_string(),
                actual: channel.channel_type.clone(),
            });
        }
    }
    Ok(())
}

fn row_to_channel(row: &tokio_postgres::Row) -> Channel {
    let roles_raw: Vec<String> = row.get("roles");
    let roles: HashSet<ChannelRole> = roles_raw
        .iter()
        .filter_map(|r| match r.as_str() {
            "send" => Some(ChannelRole::Send),
            "receive" => Some(ChannelRole::Receive),
            "call" => Some(ChannelRole::Call),
            "answer" => Some(ChannelRole::Answer),
            _ => None,
        })
        .collect();

    let config_json: serde_json::Value = row.get("config");
    let config: HashMap<String, serde_json::Value> = config_json
        .as_object()
        .map(|m| m.clone().into_iter().collect())
        .unwrap_or_default();

    let org_config_json: serde_json::Value = row.get("org_config");
    let org_config: HashMap<String, serde_json::Value> = org_config_json
        .as_object()
        .map(|m| m.clone().into_iter().collect())
        .unwrap_or_default();

    let log_policy = match row.get::<_, String>("log_policy").as_str() {
        "none" => LogPolicy::None,
        "errors" => LogPolicy::Errors,
        _ => LogPolicy::All,
    };

    Channel {
        uuid: row.get("uuid"),
        id: row.get("id"),
        org_id: row.get("org_id"),
        channel_type: row.get("channel_type"),
        name: row.get("name"),
        address: row.get("address"),
        country: row.get("country"),
        schemes: row.get("schemes"),
        roles,
        config,
        org_config,
        org_is_anonymous: row.get("is_anon"),
        log_policy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn sample_channel(channel_type: &str) -> Channel {
        Channel {
            uuid: Uuid::new_v4(),
            id: 1,
            org_id: 1,
            channel_type: channel_type.to_string(),
            name: "test".to_string(),
            address: "+1555".to_string(),
            country: None,
            schemes: vec!["whatsapp".to_string()],
            roles: HashSet::new(),
            config: StdHashMap::new(),
            org_config: StdHashMap::new(),
            org_is_anonymous: false,
            log_policy: LogPolicy::All,
        }
    }

    #[test]
    fn check_type_accepts_matching_type() {
        let channel = sample_channel("WA");
        assert!(check_type(&channel, Some("WA")).is_ok());
    }

    #[test]
    fn check_type_rejects_mismatched_type() {
        let channel = sample_channel("WA");
        assert!(matches!(
            check_type(&channel, Some("FBA")),
            Err(CourierError::WrongChannelType { .. })
        ));
    }

    #[test]
    fn check_type_skips_check_when_expected_empty() {
        let channel = sample_channel("WA");
        assert!(check_type(&channel, Some("")).is_ok());
        assert!(check_type(&channel, None).is_ok());
    }

    #[test]
    fn cache_entry_expires_after_ttl() {
        let entry = CacheEntry {
            channel: sample_channel("WA"),
            cached_at: Instant::now() - Duration::from_secs(600),
        };
        assert!(entry.cached_at.elapsed() > Duration::from_secs(300));
    }

    #[test]
    #[allow(clippy::no_effect)]
    fn utc_now_is_usable_for_future_sent_on_logic() {
        let _ = Utc::now();
    }
}
