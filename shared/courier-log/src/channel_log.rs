use chrono::{DateTime, Utc};
use courier_core::{Channel, HttpTrace, LogError, LogSink};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// The scoped operation a `ChannelLog` was opened for: webhook verification,
/// inbound receive, outbound send, attachment download, token refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelLogType {
    WebhookVerify,
    MultiReceive,
    Send,
    AttachmentDownload,
    TokenRefresh,
}

struct Inner {
    uuid: Uuid,
    log_type: ChannelLogType,
    channel_uuid: Uuid,
    created_on: DateTime<Utc>,
    started: Instant,
    http_traces: Mutex<Vec<HttpTrace>>,
    errors: Mutex<Vec<LogError>>,
    redact_values: Vec<String>,
    has_attachment: std::sync::atomic::AtomicBool,
}

/// Scoped accumulator for a single logical operation. Cloning shares the same
/// underlying buffers (the only mutual-exclusion region in this component is
/// the append to `http_traces`/`errors`, both short critical sections).
#[derive(Clone)]
pub struct ChannelLog {
    inner: Arc<Inner>,
}

const REDACTED: &str = "********";

impl ChannelLog {
    pub fn new(log_type: ChannelLogType, channel: &Channel, redact_values: Vec<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                uuid: Uuid::new_v4(),
                log_type,
                channel_uuid: channel.uuid,
                created_on: Utc::now(),
                started: Instant::now(),
                http_traces: Mutex::new(Vec::new()),
                errors: Mutex::new(Vec::new()),
                redact_values,
                has_attachment: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    pub fn log_type(&self) -> ChannelLogType {
        self.inner.log_type
    }

    pub fn mark_attachment(&self) {
        self.inner
            .has_attachment
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }

    /// Append an HTTP request/response trace.
    pub fn http(&self, trace: HttpTrace) {
        self.inner.http_traces.lock().push(trace);
    }

    /// Append a structured error.
    pub fn error(&self, code: &str, ext_code: &str, message: &str) {
        self.inner.errors.lock().push(LogError {
            code: code.to_string(),
            external_code: ext_code.to_string(),
            message: message.to_string(),
        });
    }

    /// Append the error's string as message with an empty code.
    pub fn raw_error(&self, err: &dyn std::fmt::Display) {
        self.error("", "", &err.to_string());
    }

    /// Record elapsed time and apply redaction to every stored byte slice.
    /// Idempotent: calling `end()` twice does not double-redact or otherwise
    /// corrupt the log, since redaction replaces fixed substrings.
    pub fn end(&self) -> FinalizedChannelLog {
        let elapsed = self.inner.started.elapsed();
        let mut traces: Vec<HttpTrace> = self.inner.http_traces.lock().clone();
        for trace in &mut traces {
            redact_bytes(&mut trace.request, &self.inner.redact_values);
            redact_bytes(&mut trace.response, &self.inner.redact_values);
        }
        let mut errors = self.inner.errors.lock().clone();
        for e in &mut errors {
            e.message = redact_string(&e.message, &self.inner.redact_values);
        }

        FinalizedChannelLog {
            uuid: self.inner.uuid,
            log_type: self.inner.log_type,
            channel_uuid: self.inner.channel_uuid,
            created_on: self.inner.created_on,
            elapsed,
            http_traces: traces,
            errors,
            has_attachment: self
                .inner
                .has_attachment
                .load(std::sync::atomic::Ordering::Relaxed),
        }
    }
}

impl LogSink for ChannelLog {
    fn uuid(&self) -> Uuid {
        ChannelLog::uuid(self)
    }

    fn http(&self, trace: HttpTrace) {
        ChannelLog::http(self, trace);
    }

    fn error(&self, code: &str, ext_code: &str, message: &str) {
        ChannelLog::error(self, code, ext_code, message);
    }
}

/// Error code constructors producing the canonical code vocabulary.
pub mod codes {
    pub const RESPONSE_STATUS_CODE: &str = "response_status_code";
    pub const RESPONSE_UNPARSEABLE: &str = "response_unparseable";
    pub const RESPONSE_VALUE_MISSING: &str = "response_value_missing";
    pub const MEDIA_UNSUPPORTED: &str = "media_unsupported";
    pub const EXTERNAL: &str = "external";
}

fn redact_bytes(data: &mut Vec<u8>, secrets: &[String]) {
    if secrets.is_empty() {
        return;
    }
    let Ok(mut text) = String::from_utf8(data.clone()) else {
        return;
    };
    text = redact_string(&text, secrets);
    *data = text.into_bytes();
}

fn redact_string(input: &str, secrets: &[String]) -> String {
    let mut out = input.to_string();
    for secret in secrets {
        if secret.is_empty() {
            continue;
        }
        out = out.replace(secret.as_str(), REDACTED);
    }
    out
}

/// Finalized, redacted log ready to be handed to a `LogBackend`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizedChannelLog {
    pub uuid: Uuid,
    pub log_type: ChannelLogType,
    pub channel_uuid: Uuid,
    pub created_on: DateTime<Utc>,
    pub elapsed: std::time::Duration,
    pub http_traces: Vec<HttpTrace>,
    pub errors: Vec<LogError>,
    pub has_attachment: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn test_channel() -> Channel {
        Channel {
            uuid: Uuid::new_v4(),
            id: 1,
            org_id: 1,
            channel_type: "WA".to_string(),
            name: "test".to_string(),
            address: "+1555".to_string(),
            country: None,
            schemes: vec!["whatsapp".to_string()],
            roles: HashSet::new(),
            config: HashMap::new(),
            org_config: HashMap::new(),
            org_is_anonymous: false,
            log_policy: courier_core::LogPolicy::All,
        }
    }

    #[test]
    fn redaction_removes_every_secret_occurrence() {
        let channel = test_channel();
        let log = ChannelLog::new(
            ChannelLogType::Send,
            &channel,
            vec!["sekret-token".to_string()],
        );
        log.http(HttpTrace {
            method: "POST".to_string(),
            url: "https://example.com".to_string(),
            status_code: Some(200),
            request: b"Authorization: Bearer sekret-token".to_vec(),
            response: b"{\"token\":\"sekret-token\"}".to_vec(),
            started_at: Utc::now(),
            elapsed: std::time::Duration::from_millis(10),
        });
        log.error("external", "", "failed with sekret-token in message");

        let finalized = log.end();
        for trace in &finalized.http_traces {
            assert!(!String::from_utf8_lossy(&trace.request).contains("sekret-token"));
            assert!(!String::from_utf8_lossy(&trace.response).contains("sekret-token"));
        }
        for err in &finalized.errors {
            assert!(!err.message.contains("sekret-token"));
        }
    }

    #[test]
    fn raw_error_has_empty_code() {
        let channel = test_channel();
        let log = ChannelLog::new(ChannelLogType::Send, &channel, vec![]);
        log.raw_error(&"boom");
        let finalized = log.end();
        assert_eq!(finalized.errors.len(), 1);
        assert_eq!(finalized.errors[0].code, "");
        assert_eq!(finalized.errors[0].message, "boom");
    }
}
