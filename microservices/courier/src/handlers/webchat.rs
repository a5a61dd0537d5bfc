//! Web chat handler ("WC"): delivers outbound messages to an internal
//! callback endpoint rather than a third-party provider, since the chat
//! widget itself long-polls or holds a websocket to that endpoint.

use async_trait::async_trait;
use courier_core::{
    Channel, Handler, HandlerError, HttpTrace, LogKind, LogSink, MsgIn, MsgOut, ReceiveOutcome,
    RouteSpec, SendContext, SendResult,
};
use serde_json::json;

pub struct WebChatHandler {
    http: reqwest::Client,
}

impl WebChatHandler {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for WebChatHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for WebChatHandler {
    fn channel_type(&self) -> &'static str {
        "WC"
    }

    fn redact_values(&self, channel: &Channel) -> Vec<String> {
        channel
            .config_str("secret")
            .map(|s| vec![s.to_string()])
            .unwrap_or_default()
    }

    async fn send(
        &self,
        ctx: &SendContext,
        channel: &Channel,
        msg: &MsgOut,
        result: &mut SendResult,
        clog: &dyn LogSink,
    ) -> Result<(), HandlerError> {
        let callback_domain = channel
            .config_str("callback_domain")
            .ok_or_else(|| HandlerError::ChannelConfig("missing callback_domain".to_string()))?;

        let url = format!("{callback_domain}/deliver/{}", msg.urn);
        let payload = json!({
            "text": msg.text,
            "attachments": msg.attachments,
            "quick_replies": msg.quick_replies,
        });

        let mut request = self.http.post(&url).json(&payload);
        if let Some(secret) = channel.config_str("secret") {
            request = request.bearer_auth(secret);
        }

        let started_at = chrono::Utc::now();
        let response = request
            .timeout(ctx.remaining())
            .send()
            .await
            .map_err(|e| HandlerError::ConnectionFailed(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| HandlerError::ResponseUnparseable(e.to_string()))?;

        clog.http(HttpTrace {
            method: "POST".to_string(),
            url,
            status_code: Some(status.as_u16()),
            request: payload.to_string().into_bytes(),
            response: body.clone().into_bytes(),
            started_at,
            elapsed: std::time::Duration::ZERO,
        });

        if status.is_success() {
            result.add_external_id(msg.uuid.to_string());
            return Ok(());
        }

        if status.is_server_error() {
            return Err(HandlerError::ConnectionFailed(format!("http {status}")));
        }

        Err(HandlerError::ResponseStatus {
            status: status.as_u16(),
        })
    }

    fn routes(&self) -> Vec<RouteSpec> {
        vec![RouteSpec {
            method: "POST",
            suffix: "receive",
            log_kind: LogKind::MultiReceive,
            disable_uuid_routing: false,
        }]
    }

    async fn receive(
        &self,
        channel: &Channel,
        _route: &RouteSpec,
        body: &[u8],
        _clog: &dyn LogSink,
    ) -> Result<ReceiveOutcome, HandlerError> {
        let payload: serde_json::Value = serde_json::from_slice(body)
            .map_err(|_| HandlerError::ResponseUnparseable("unable to parse request JSON".to_string()))?;

        let Some(visitor_id) = payload["visitor_id"].as_str() else {
            return Err(HandlerError::ResponseUnexpected("missing visitor_id".to_string()));
        };
        let text = payload["text"].as_str().unwrap_or("").to_string();

        let mut inbound = MsgIn::new(channel.uuid, format!("webchat:{visitor_id}"), text);
        inbound.external_id = payload["event_id"].as_str().map(str::to_string);

        let mut outcome = ReceiveOutcome::ok("Events Handled");
        outcome.inbound.push(inbound);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::LogPolicy;
    use std::collections::{HashMap, HashSet};
    use uuid::Uuid;

    fn test_channel() -> Channel {
        let mut config = HashMap::new();
        config.insert(
            "callback_domain".to_string(),
            serde_json::json!("https://chat.internal"),
        );
        config.insert("secret".to_string(), serde_json::json!("widget-secret"));
        Channel {
            uuid: Uuid::new_v4(),
            id: 1,
            org_id: 1,
            channel_type: "WC".to_string(),
            name: "test".to_string(),
            address: String::new(),
            country: None,
            schemes: vec!["webchat".to_string()],
            roles: HashSet::new(),
            config,
            org_config: HashMap::new(),
            org_is_anonymous: false,
            log_policy: LogPolicy::All,
        }
    }

    #[test]
    fn redacts_secret() {
        let handler = WebChatHandler::new();
        let channel = test_channel();
        assert_eq!(handler.redact_values(&channel), vec!["widget-secret".to_string()]);
    }

    #[test]
    fn channel_type_is_wc() {
        assert_eq!(WebChatHandler::new().channel_type(), "WC");
    }

    #[tokio::test]
    async fn receive_builds_inbound_message() {
        let channel = test_channel();
        let clog = courier_log::ChannelLog::new(
            courier_log::ChannelLogType::MultiReceive,
            &channel,
            vec![],
        );
        let body = serde_json::json!({ "visitor_id": "v-1", "text": "hello", "event_id": "e-1" });
        let route = RouteSpec {
            method: "POST",
            suffix: "receive",
            log_kind: LogKind::MultiReceive,
            disable_uuid_routing: false,
        };

        let outcome = WebChatHandler::new()
            .receive(&channel, &route, body.to_string().as_bytes(), &clog)
            .await
            .unwrap();
        assert_eq!(outcome.inbound.len(), 1);
        assert_eq!(outcome.inbound[0].urn, "webchat:v-1");
    }
}
