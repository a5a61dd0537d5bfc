//! The uniform contracts that bind the routing, status, dispatch, logging and
//! media subsystems together: `Channel`, `MsgIn`, `MsgOut`, `StatusUpdate`,
//! `StatusChange`, `SendResult`, `Handler`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A routing identity bound to one upstream account on one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub uuid: Uuid,
    pub id: i64,
    pub org_id: i64,
    /// 1-4 letter channel-type code, e.g. "WA", "FBA", "T".
    pub channel_type: String,
    pub name: String,
    /// Primary address: phone number, page id, business id, or empty.
    pub address: String,
    pub country: Option<String>,
    pub schemes: Vec<String>,
    pub roles: HashSet<ChannelRole>,
    pub config: HashMap<String, serde_json::Value>,
    pub org_config: HashMap<String, serde_json::Value>,
    pub org_is_anonymous: bool,
    pub log_policy: LogPolicy,
}

impl Channel {
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(|v| v.as_bool())
    }

    pub fn has_role(&self, role: ChannelRole) -> bool {
        self.roles.contains(&role)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    Send,
    Receive,
    Call,
    Answer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogPolicy {
    None,
    Errors,
    All,
}

/// A `<content-type>:<URL>` attachment descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub content_type: String,
    pub url: String,
}

impl Attachment {
    pub fn parse(raw: &str) -> Option<Self> {
        let (content_type, url) = raw.split_once(':')?;
        if content_type.is_empty() || url.is_empty() {
            return None;
        }
        Some(Self {
            content_type: content_type.to_string(),
            url: url.to_string(),
        })
    }
}

impl std::fmt::Display for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.content_type, self.url)
    }
}

/// An inbound message observed from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgIn {
    pub uuid: Uuid,
    pub channel_uuid: Uuid,
    pub urn: String,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub external_id: Option<String>,
    pub sender_display_name: Option<String>,
    pub received_on: DateTime<Utc>,
}

impl MsgIn {
    pub fn new(channel_uuid: Uuid, urn: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            channel_uuid,
            urn: urn.into(),
            text: text.into(),
            attachments: Vec::new(),
            external_id: None,
            sender_display_name: None,
            received_on: Utc::now(),
        }
    }
}

/// `{text, extra?}`. When defaulted from a bare string, type is implicitly "text".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickReply {
    pub text: String,
    pub extra: Option<String>,
}

impl From<String> for QuickReply {
    fn from(text: String) -> Self {
        Self { text, extra: None }
    }
}

impl From<&str> for QuickReply {
    fn from(text: &str) -> Self {
        Self {
            text: text.to_string(),
            extra: None,
        }
    }
}

/// A pre-approved provider message template referenced by name with filled
/// variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Templating {
    pub name: String,
    pub language: String,
    pub components: Vec<String>,
    pub variables: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgOrigin {
    Flow,
    Broadcast,
    Ticket,
    Chat,
}

/// An outbound message prepared for a provider. Immutable once dequeued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsgOut {
    pub uuid: Uuid,
    pub id: i64,
    pub channel_uuid: Uuid,
    pub urn: String,
    pub urn_auth: Option<String>,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub quick_replies: Vec<QuickReply>,
    pub templating: Option<Templating>,
    pub response_to_external_id: Option<String>,
    pub high_priority: bool,
    pub locale: Option<String>,
    pub origin: MsgOrigin,
    pub contact_uuid: Option<Uuid>,
    pub flow_uuid: Option<Uuid>,
}

/// Uniform Resource Name identifying a remote party within a scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Urn {
    pub scheme: String,
    pub path: String,
}

impl Urn {
    pub fn parse(raw: &str) -> Option<Self> {
        let (scheme, path) = raw.split_once(':')?;
        if scheme.is_empty() || path.is_empty() {
            return None;
        }
        Some(Self {
            scheme: scheme.to_string(),
            path: path.to_string(),
        })
    }
}

impl std::fmt::Display for Urn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scheme, self.path)
    }
}

/// `old` -> `new`, same scheme, different path required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrnUpdate {
    pub old: Urn,
    pub new: Urn,
}

impl UrnUpdate {
    /// Validates the usage invariant from §4.E: old != new, same scheme, different
    /// path. A violation is a handler bug, not a runtime condition.
    pub fn validate(&self) -> Result<(), String> {
        if self.old.scheme != self.new.scheme {
            return Err(format!(
                "urn update scheme mismatch: {} != {}",
                self.old.scheme, self.new.scheme
            ));
        }
        if self.old.path == self.new.path {
            return Err("urn update path unchanged".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Queued,
    Wired,
    Sent,
    Delivered,
    Read,
    Errored,
    Failed,
}

impl MessageStatus {
    pub fn is_sent_state(self) -> bool {
        matches!(
            self,
            Self::Wired | Self::Sent | Self::Delivered | Self::Read
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A pending change submitted to the StatusEngine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub channel_uuid: Uuid,
    pub channel_id: i64,
    /// Message UUID, when known.
    pub msg_uuid: Option<Uuid>,
    /// External id: used to locate the row when `msg_uuid` is absent, and/or
    /// persisted against the row per §4.E.
    pub external_id: Option<String>,
    pub status: MessageStatus,
    pub urn_update: Option<UrnUpdate>,
    pub log_uuid: Uuid,
}

/// The result of applying a `StatusUpdate`. Written to the event store under
/// `PK=con#<contact-uuid>`, `SK=evt#<msg-uuid>#sts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChange {
    pub contact_uuid: Uuid,
    pub msg_uuid: Uuid,
    pub status: MessageStatus,
    pub failed_reason: Option<String>,
    pub org_id: i64,
    pub timestamp: DateTime<Utc>,
    pub urn_update: Option<UrnUpdate>,
}

/// The event shipped to the wide-column event store. The core only emits
/// status-change events; other event kinds are out of scope.
pub type ChannelEvent = StatusChange;

/// Accumulator populated during `Handler::send`: the provider message ids
/// collected over the course of the call (a single MsgOut may fan out into
/// several provider requests, e.g. one per attachment).
#[derive(Debug, Clone, Default)]
pub struct SendResult {
    external_ids: Vec<String>,
}

impl SendResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_external_id(&mut self, id: impl Into<String>) {
        self.external_ids.push(id.into());
    }

    pub fn external_ids(&self) -> &[String] {
        &self.external_ids
    }

    pub fn first_external_id(&self) -> Option<&str> {
        self.external_ids.first().map(String::as_str)
    }
}

/// Error-as-value taxonomy a handler's `send` returns. Pattern-matched at the
/// dispatcher; never a language-specific exception type.
#[derive(Debug, Error, Clone)]
pub enum HandlerError {
    #[error("channel configuration error: {0}")]
    ChannelConfig(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("connection throttled, provider code {code}")]
    ConnectionThrottled { code: String },
    #[error("unexpected response status {status}")]
    ResponseStatus { status: u16 },
    #[error("response unparseable: {0}")]
    ResponseUnparseable(String),
    #[error("response missing required field: {0}")]
    ResponseUnexpected(String),
    #[error("failed with reason {code}: {message}")]
    FailedWithReason { code: String, message: String },
}

/// A single HTTP request/response trace recorded into a `ChannelLog`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTrace {
    pub method: String,
    pub url: String,
    pub status_code: Option<u16>,
    pub request: Vec<u8>,
    pub response: Vec<u8>,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

/// A structured error entry recorded into a `ChannelLog`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogError {
    pub code: String,
    pub external_code: String,
    pub message: String,
}

/// The narrow surface `Handler::send`/`Handler::receive` need from a
/// `ChannelLog` without `courier-core` depending on the `courier-log` crate.
pub trait LogSink: Send + Sync {
    fn uuid(&self) -> Uuid;
    fn http(&self, trace: HttpTrace);
    fn error(&self, code: &str, ext_code: &str, message: &str);
    fn raw_error(&self, message: &str) {
        self.error("", "", message);
    }
}

/// Cooperative cancellation token for a single `send` call: honors
/// `min(remaining-shutdown-budget, per-send-timeout)` per §4.F.
#[derive(Clone)]
pub struct SendContext {
    deadline: Instant,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl SendContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline,
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline || self.is_cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancelled
            .store(true, std::sync::atomic::Ordering::Relaxed);
    }
}

/// A single inbound route a handler answers, concatenated by the Server
/// under `/c/<lowercased-type>/<channel-uuid>/<suffix>` or, when
/// `disable_uuid_routing` is set, `/c/<lowercased-type>/<suffix>` with the
/// channel located from the request body instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteSpec {
    pub method: &'static str,
    pub suffix: &'static str,
    pub log_kind: LogKind,
    pub disable_uuid_routing: bool,
}

/// Mirrors `courier_log::ChannelLogType` without pulling the log crate into
/// this one; the Server maps this back to the concrete type when opening the
/// `ChannelLog` for the route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    WebhookVerify,
    MultiReceive,
}

/// What a `Handler::receive` call produced: the response body's `data` is
/// rendered from `inbound`; any derived status updates (e.g. a provider's
/// delivery-receipt webhook) are handed to the StatusEngine by the Server,
/// not by the handler itself, per the D -> E control-flow boundary.
#[derive(Debug, Clone, Default)]
pub struct ReceiveOutcome {
    pub message: String,
    pub inbound: Vec<MsgIn>,
    pub status_updates: Vec<StatusUpdate>,
}

impl ReceiveOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// A handler satisfies the required part of the uniform contract: channel
/// type identity, secret redaction, and the outbound send call. Inbound
/// routes are optional — a handler with no `routes()` accepts no webhook
/// traffic at all.
#[async_trait]
pub trait Handler: Send + Sync {
    fn channel_type(&self) -> &'static str;

    /// Secrets to strip from logs, read out of the channel's config map.
    fn redact_values(&self, channel: &Channel) -> Vec<String>;

    async fn send(
        &self,
        ctx: &SendContext,
        channel: &Channel,
        msg: &MsgOut,
        result: &mut SendResult,
        clog: &dyn LogSink,
    ) -> Result<(), HandlerError>;

    fn routes(&self) -> Vec<RouteSpec> {
        Vec::new()
    }

    /// Locates `(channel_type, address)` from request content for routes
    /// with `disable_uuid_routing` set. Unused otherwise.
    fn locate_channel(&self, _body: &[u8]) -> Option<(String, String)> {
        None
    }

    /// Handles one inbound HTTP request already routed to `route`. The
    /// default rejects all inbound traffic; handlers that declare routes
    /// must override this.
    async fn receive(
        &self,
        _channel: &Channel,
        _route: &RouteSpec,
        _body: &[u8],
        _clog: &dyn LogSink,
    ) -> Result<ReceiveOutcome, HandlerError> {
        Err(HandlerError::ResponseUnexpected(
            "handler does not accept inbound requests".to_string(),
        ))
    }
}

/// A pre-built, ready-to-send HTTP request for attachment upload, the value
/// returned by the optional `build_attachment_request` capability.
#[derive(Debug, Clone)]
pub struct AttachmentRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

pub type DescribeUrnFn =
    Arc<dyn Fn(&Channel, &Urn) -> BoxFuture<'static, HashMap<String, String>> + Send + Sync>;

pub type BuildAttachmentRequestFn =
    Arc<dyn Fn(&Channel, &str) -> BoxFuture<'static, AttachmentRequest> + Send + Sync>;

/// Per §9 "Polymorphism over channel-type": handler capability is represented
/// as a descriptor with optional function fields populated by the factory,
/// not as runtime type assertions over a trait object.
#[derive(Clone)]
pub struct HandlerDescriptor {
    pub channel_type: &'static str,
    pub handler: Arc<dyn Handler>,
    pub describe_urn: Option<DescribeUrnFn>,
    pub build_attachment_request: Option<BuildAttachmentRequestFn>,
}

impl HandlerDescriptor {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        let channel_type = handler.channel_type();
        Self {
            channel_type,
            handler,
            describe_urn: None,
            build_attachment_request: None,
        }
    }

    pub fn with_describe_urn(mut self, f: DescribeUrnFn) -> Self {
        self.describe_urn = Some(f);
        self
    }

    pub fn with_build_attachment_request(mut self, f: BuildAttachmentRequestFn) -> Self {
        self.build_attachment_request = Some(f);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_parse_roundtrip() {
        let a = Attachment::parse("image/jpeg:https://foo/i.jpg").unwrap();
        assert_eq!(a.content_type, "image/jpeg");
        assert_eq!(a.url, "https://foo/i.jpg");
        assert_eq!(a.to_string(), "image/jpeg:https://foo/i.jpg");
    }

    #[test]
    fn attachment_parse_rejects_malformed() {
        assert!(Attachment::parse("no-colon-here").is_none());
        assert!(Attachment::parse(":missing-type").is_none());
    }

    #[test]
    fn urn_update_rejects_same_path() {
        let update = UrnUpdate {
            old: Urn::parse("whatsapp:+111").unwrap(),
            new: Urn::parse("whatsapp:+111").unwrap(),
        };
        assert!(update.validate().is_err());
    }

    #[test]
    fn urn_update_rejects_scheme_mismatch() {
        let update = UrnUpdate {
            old: Urn::parse("whatsapp:+111").unwrap(),
            new: Urn::parse("facebook:+111").unwrap(),
        };
        assert!(update.validate().is_err());
    }

    #[test]
    fn urn_update_accepts_different_path_same_scheme() {
        let update = UrnUpdate {
            old: Urn::parse("whatsapp:+111").unwrap(),
            new: Urn::parse("whatsapp:+222").unwrap(),
        };
        assert!(update.validate().is_ok());
    }

    #[test]
    fn message_status_sent_states() {
        assert!(MessageStatus::Wired.is_sent_state());
        assert!(MessageStatus::Read.is_sent_state());
        assert!(!MessageStatus::Errored.is_sent_state());
    }
}
