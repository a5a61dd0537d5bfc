//! Generic SMS aggregator handler ("T"): channel config drives the entire
//! request shape rather than a provider-specific payload builder, since
//! aggregators in this tier are interchangeable HTTP-form gateways.

use async_trait::async_trait;
use courier_core::{
    Channel, Handler, HandlerError, HttpTrace, LogKind, LogSink, MsgIn, MsgOut, ReceiveOutcome,
    RouteSpec, SendContext, SendResult,
};

pub struct SmsAggregatorHandler {
    http: reqwest::Client,
}

impl SmsAggregatorHandler {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    fn build_body(&self, channel: &Channel, msg: &MsgOut) -> String {
        let max_length = channel
            .config
            .get("max_length")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        let mut text = msg.text.clone();
        if max_length > 0 && text.len() > max_length {
            text.truncate(max_length);
        }

        match channel.config_str("body") {
            Some(template) => template
                .replace("{{to}}", &msg.urn)
                .replace("{{text}}", &text),
            None => text,
        }
    }
}

impl Default for SmsAggregatorHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for SmsAggregatorHandler {
    fn channel_type(&self) -> &'static str {
        "T"
    }

    fn redact_values(&self, channel: &Channel) -> Vec<String> {
        let mut secrets = Vec::new();
        for key in ["api_key", "auth_token", "password", "secret", "send_authorization"] {
            if let Some(v) = channel.config_str(key) {
                secrets.push(v.to_string());
            }
        }
        secrets
    }

    async fn send(
        &self,
        ctx: &SendContext,
        channel: &Channel,
        msg: &MsgOut,
        result: &mut SendResult,
        clog: &dyn LogSink,
    ) -> Result<(), HandlerError> {
        let send_url = channel
            .config_str("send_url")
            .ok_or_else(|| HandlerError::ChannelConfig("missing send_url".to_string()))?;
        let method = channel.config_str("method").unwrap_or("POST").to_ascii_uppercase();
        let body = self.build_body(channel, msg);

        let mut request = match method.as_str() {
            "GET" => self.http.get(send_url).query(&[("body", &body)]),
            _ => self.http.post(send_url).body(body.clone()),
        };

        if let (Some(user), Some(pass)) = (channel.config_str("username"), channel.config_str("password")) {
            request = request.basic_auth(user, Some(pass));
        } else if let Some(token) = channel.config_str("send_authorization") {
            request = request.bearer_auth(token);
        }

        if let Some(headers) = channel.config.get("headers").and_then(|v| v.as_object()) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }

        let started_at = chrono::Utc::now();
        let response = request
            .timeout(ctx.remaining())
            .send()
            .await
            .map_err(|e| HandlerError::ConnectionFailed(e.to_string()))?;

        let status = response.status();
        let response_body = response
            .text()
            .await
            .map_err(|e| HandlerError::ResponseUnparseable(e.to_string()))?;

        clog.http(HttpTrace {
            method,
            url: send_url.to_string(),
            status_code: Some(status.as_u16()),
            request: body.into_bytes(),
            response: response_body.clone().into_bytes(),
            started_at,
            elapsed: std::time::Duration::ZERO,
        });

        if status.is_success() {
            let external_id = serde_json::from_str::<serde_json::Value>(&response_body)
                .ok()
                .and_then(|v| v["id"].as_str().map(str::to_string))
                .unwrap_or_else(|| response_body.trim().to_string());
            if !external_id.is_empty() {
                result.add_external_id(external_id);
            }
            return Ok(());
        }

        if status.is_server_error() {
            return Err(HandlerError::ConnectionFailed(format!("http {status}")));
        }
        if status.as_u16() == 429 {
            return Err(HandlerError::ConnectionThrottled {
                code: status.as_u16().to_string(),
            });
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
            disable_uuid_routing: true,
        }]
    }

    /// Aggregators deliver inbound SMS without a channel UUID in the path;
    /// the destination number in the payload is the channel's address.
    fn locate_channel(&self, body: &[u8]) -> Option<(String, String)> {
        let payload: serde_json::Value = serde_json::from_slice(body).ok()?;
        let to = payload["to"].as_str()?;
        Some(("T".to_string(), to.to_string()))
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

        let Some(from) = payload["from"].as_str() else {
            return Err(HandlerError::ResponseUnexpected("missing from field".to_string()));
        };
        let text = payload["text"].as_str().unwrap_or("").to_string();

        let mut inbound = MsgIn::new(channel.uuid, format!("tel:{from}"), text);
        inbound.external_id = payload["message_id"].as_str().map(str::to_string);

        let mut outcome = ReceiveOutcome::ok("Events Handled");
        outcome.inbound.push(inbound);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{LogPolicy, MsgOrigin};
    use std::collections::{HashMap, HashSet};
    use uuid::Uuid;

    fn test_channel() -> Channel {
        let mut config = HashMap::new();
        config.insert("send_url".to_string(), serde_json::json!("https://agg.example/send"));
        config.insert("body".to_string(), serde_json::json!("to={{to}}&text={{text}}"));
        config.insert("password".to_string(), serde_json::json!("hunter2"));
        Channel {
            uuid: Uuid::new_v4(),
            id: 1,
            org_id: 1,
            channel_type: "T".to_string(),
            name: "test".to_string(),
            address: String::new(),
            country: None,
            schemes: vec!["tel".to_string()],
            roles: HashSet::new(),
            config,
            org_config: HashMap::new(),
            org_is_anonymous: false,
            log_policy: LogPolicy::All,
        }
    }

    fn test_msg() -> MsgOut {
        MsgOut {
            uuid: Uuid::new_v4(),
            id: 1,
            channel_uuid: Uuid::new_v4(),
            urn: "+15550001111".to_string(),
            urn_auth: None,
            text: "reminder".to_string(),
            attachments: vec![],
            quick_replies: vec![],
            templating: None,
            response_to_external_id: None,
            high_priority: false,
            locale: None,
            origin: MsgOrigin::Broadcast,
            contact_uuid: None,
            flow_uuid: None,
        }
    }

    #[test]
    fn build_body_substitutes_template_placeholders() {
        let handler = SmsAggregatorHandler::new();
        let channel = test_channel();
        let msg = test_msg();
        assert_eq!(handler.build_body(&channel, &msg), "to=+15550001111&text=reminder");
    }

    #[test]
    fn build_body_truncates_to_max_length() {
        let handler = SmsAggregatorHandler::new();
        let mut channel = test_channel();
        channel.config.remove("body");
        channel.config.insert("max_length".to_string(), serde_json::json!(4));
        let msg = test_msg();
        assert_eq!(handler.build_body(&channel, &msg), "remi");
    }

    #[test]
    fn redacts_password() {
        let handler = SmsAggregatorHandler::new();
        let channel = test_channel();
        assert_eq!(handler.redact_values(&channel), vec!["hunter2".to_string()]);
    }

    #[test]
    fn locate_channel_reads_destination_from_body() {
        let handler = SmsAggregatorHandler::new();
        let body = serde_json::json!({ "to": "+15550009999", "from": "+15551112222", "text": "hi" });
        let located = handler.locate_channel(body.to_string().as_bytes()).unwrap();
        assert_eq!(located, ("T".to_string(), "+15550009999".to_string()));
    }

    #[tokio::test]
    async fn receive_builds_inbound_message() {
        let handler = SmsAggregatorHandler::new();
        let channel = test_channel();
        let clog = courier_log::ChannelLog::new(
            courier_log::ChannelLogType::MultiReceive,
            &channel,
            vec![],
        );
        let body = serde_json::json!({
            "to": channel.address,
            "from": "+15551112222",
            "text": "hi",
            "message_id": "agg-1"
        });
        let route = RouteSpec {
            method: "POST",
            suffix: "receive",
            log_kind: LogKind::MultiReceive,
            disable_uuid_routing: true,
        };

        let outcome = handler
            .receive(&channel, &route, body.to_string().as_bytes(), &clog)
            .await
            .unwrap();
        assert_eq!(outcome.inbound.len(), 1);
        assert_eq!(outcome.inbound[0].urn, "tel:+15551112222");
        assert_eq!(outcome.inbound[0].external_id.as_deref(), Some("agg-1"));
    }
}
