use crate::tier1::Tier1Store;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

const TIER1_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const TIER2_TTL: Duration = Duration::from_secs(15 * 60);

/// Uploads source bytes to a provider's media endpoint, returning the
/// provider-assigned media id. Provider-specific; supplied by the handler.
#[async_trait]
pub trait MediaUploader: Send + Sync {
    async fn upload(&self, bytes: &[u8], content_type: &str) -> Result<String, String>;
}

/// Two-tier media cache: tier 1 is a pluggable distributed hash (Redis in
/// production, in-memory in tests); tier 2 is always an in-process expiring
/// set of known-failed `(channel, url)` pairs, since its only job is to
/// suppress retries within this process during the failure window.
pub struct MediaCache {
    tier1: Box<dyn Tier1Store>,
    tier2_failures: DashMap<(Uuid, String), Instant>,
    http: reqwest::Client,
}

impl MediaCache {
    pub fn new(tier1: Box<dyn Tier1Store>) -> Self {
        Self {
            tier1,
            tier2_failures: DashMap::new(),
            http: reqwest::Client::new(),
        }
    }

    fn tier2_hit(&self, channel_uuid: Uuid, src_url: &str) -> bool {
        let key = (channel_uuid, src_url.to_string());
        if let Some(expires_at) = self.tier2_failures.get(&key).map(|e| *e.value()) {
            if Instant::now() < expires_at {
                return true;
            }
            self.tier2_failures.remove(&key);
        }
        false
    }

    fn mark_tier2_failure(&self, channel_uuid: Uuid, src_url: &str) {
        self.tier2_failures.insert(
            (channel_uuid, src_url.to_string()),
            Instant::now() + TIER2_TTL,
        );
    }

    /// Resolves a provider-media-id for `src_url`, uploading at most once per
    /// TTL window. Returns `""` when the upload should be skipped (tier-2 hit)
    /// or failed, signaling the handler to fall back to link-by-URL.
    #[instrument(skip(self, uploader))]
    pub async fn fetch_media_id(
        &self,
        channel_uuid: Uuid,
        src_url: &str,
        uploader: &dyn MediaUploader,
    ) -> String {
        if let Ok(Some(id)) = self.tier1.get(channel_uuid, src_url).await {
            debug!("media cache tier-1 hit");
            return id;
        }

        if self.tier2_hit(channel_uuid, src_url) {
            debug!("media cache tier-2 hit, skipping upload");
            return String::new();
        }

        let bytes = match self.download(src_url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "media download failed");
                self.mark_tier2_failure(channel_uuid, src_url);
                return String::new();
            }
        };

        let content_type = content_type_for(src_url);
        match uploader.upload(&bytes, &content_type).await {
            Ok(media_id) => {
                if let Err(e) = self
                    .tier1
                    .set(channel_uuid, src_url, &media_id, TIER1_TTL)
                    .await
                {
                    warn!(error = %e, "failed to write media cache tier-1 entry");
                }
                media_id
            }
            Err(e) => {
                warn!(error = %e, "media upload failed");
                self.mark_tier2_failure(channel_uuid, src_url);
                String::new()
            }
        }
    }

    async fn download(&self, src_url: &str) -> Result<Vec<u8>, String> {
        let response = self
            .http
            .get(src_url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("download status {}", response.status()));
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| e.to_string())
    }
}

fn content_type_for(url: &str) -> String {
    let lower = url.to_ascii_lowercase();
    if lower.ends_with(".png") {
        "image/png".to_string()
    } else if lower.ends_with(".gif") {
        "image/gif".to_string()
    } else if lower.ends_with(".mp4") {
        "video/mp4".to_string()
    } else {
        "application/octet-stream".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier1::InMemoryTier1Store;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingUploader {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl MediaUploader for CountingUploader {
        async fn upload(&self, _bytes: &[u8], _content_type: &str) -> Result<String, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err("upload rejected".to_string())
            } else {
                Ok("provider-media-1".to_string())
            }
        }
    }

    #[test]
    fn tier2_suppresses_repeat_uploads_after_failure() {
        let cache = MediaCache::new(Box::new(InMemoryTier1Store::new()));
        let channel = Uuid::new_v4();
        cache.mark_tier2_failure(channel, "https://foo/i.jpg");
        assert!(cache.tier2_hit(channel, "https://foo/i.jpg"));
        assert!(!cache.tier2_hit(channel, "https://foo/other.jpg"));
    }

    #[tokio::test]
    async fn tier1_hit_skips_upload() {
        let tier1 = InMemoryTier1Store::new();
        let channel = Uuid::new_v4();
        tier1
            .set(channel, "https://foo/i.jpg", "cached-id", Duration::from_secs(60))
            .await
            .unwrap();
        let cache = MediaCache::new(Box::new(tier1));
        let calls = Arc::new(AtomicUsize::new(0));
        let uploader = CountingUploader {
            calls: calls.clone(),
            fail: false,
        };

        let id = cache
            .fetch_media_id(channel, "https://foo/i.jpg", &uploader)
            .await;
        assert_eq!(id, "cached-id");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
