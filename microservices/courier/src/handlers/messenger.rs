//! Facebook Messenger handler, posting to the Graph API `/me/messages`
//! endpoint with the page token as a query parameter.

use async_trait::async_trait;
use courier_core::{
    Channel, Handler, HandlerError, HttpTrace, LogKind, LogSink, MsgIn, MsgOut, ReceiveOutcome,
    RouteSpec, SendContext, SendResult,
};
use courier_media::MediaCache;
use serde_json::json;
use std::sync::Arc;

pub struct MessengerHandler {
    #[allow(dead_code)]
    media_cache: Arc<MediaCache>,
    http: reqwest::Client,
}

impl MessengerHandler {
    pub fn new(media_cache: Arc<MediaCache>) -> Self {
        Self {
            media_cache,
            http: reqwest::Client::new(),
        }
    }

    fn base_url<'a>(&self, channel: &'a Channel) -> &'a str {
        channel
            .config_str("base_url")
            .unwrap_or("https://graph.facebook.com/v18.0")
    }

    fn to_payload(&self, msg: &MsgOut) -> Result<serde_json::Value, HandlerError> {
        if let Some(attachment) = msg.attachments.first() {
            let kind = match attachment.content_type.split('/').next() {
                Some("image") => "image",
                Some("video") => "video",
                Some("audio") => "audio",
                _ => "file",
            };
            return Ok(json!({
                "recipient": { "id": msg.urn },
                "message": {
                    "attachment": {
                        "type": kind,
                        "payload": { "url": attachment.url, "is_reusable": true }
                    }
                }
            }));
        }

        if !msg.quick_replies.is_empty() {
            let buttons: Vec<_> = msg
                .quick_replies
                .iter()
                .enumerate()
                .map(|(i, qr)| json!({ "type": "postback", "title": qr.text, "payload": format!("qr-{i}") }))
                .collect();
            return Ok(json!({
                "recipient": { "id": msg.urn },
                "message": {
                    "attachment": {
                        "type": "template",
                        "payload": {
                            "template_type": "button",
                            "text": msg.text,
                            "buttons": buttons
                        }
                    }
                }
            }));
        }

        if msg.text.is_empty() {
            return Err(HandlerError::ChannelConfig(
                "messenger message has no text, attachment or quick replies".to_string(),
            ));
        }

        Ok(json!({
            "recipient": { "id": msg.urn },
            "message": { "text": msg.text }
        }))
    }
}

#[async_trait]
impl Handler for MessengerHandler {
    fn channel_type(&self) -> &'static str {
        "FBA"
    }

    fn redact_values(&self, channel: &Channel) -> Vec<String> {
        channel
            .config_str("auth_token")
            .map(|t| vec![t.to_string()])
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
        let token = channel
            .config_str("auth_token")
            .ok_or_else(|| HandlerError::ChannelConfig("missing auth_token".to_string()))?;

        let payload = self.to_payload(msg)?;
        let url = format!("{}/me/messages", self.base_url(channel));

        let started_at = chrono::Utc::now();
        let response = self
            .http
            .post(&url)
            .query(&[("access_token", token)])
            .json(&payload)
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
            url: url.clone(),
            status_code: Some(status.as_u16()),
            request: payload.to_string().into_bytes(),
            response: body.clone().into_bytes(),
            started_at,
            elapsed: std::time::Duration::ZERO,
        });

        if status.is_success() {
            let parsed: serde_json::Value = serde_json::from_str(&body)
                .map_err(|e| HandlerError::ResponseUnparseable(e.to_string()))?;
            let id = parsed["message_id"]
                .as_str()
                .ok_or_else(|| HandlerError::ResponseUnexpected("missing message_id".to_string()))?;
            result.add_external_id(id);
            return Ok(());
        }

        if status.is_server_error() {
            return Err(HandlerError::ConnectionFailed(format!("http {status}")));
        }

        let error = serde_json::from_str::<serde_json::Value>(&body).ok();
        let code = error
            .as_ref()
            .and_then(|v| v["error"]["code"].as_i64())
            .map(|c| c.to_string());
        let subcode = error
            .as_ref()
            .and_then(|v| v["error"]["error_subcode"].as_i64());

        match (code, subcode) {
            (Some(code), Some(2018022)) => Err(HandlerError::ConnectionThrottled { code }),
            (Some(code), _) => Err(HandlerError::FailedWithReason {
                code,
                message: body,
            }),
            (None, _) => Err(HandlerError::ResponseStatus {
                status: status.as_u16(),
            }),
        }
    }

    fn routes(&self) -> Vec<RouteSpec> {
        vec![
            RouteSpec {
                method: "GET",
                suffix: "",
                log_kind: LogKind::WebhookVerify,
                disable_uuid_routing: false,
            },
            RouteSpec {
                method: "POST",
                suffix: "",
                log_kind: LogKind::MultiReceive,
                disable_uuid_routing: false,
            },
        ]
    }

    async fn receive(
        &self,
        channel: &Channel,
        route: &RouteSpec,
        body: &[u8],
        _clog: &dyn LogSink,
    ) -> Result<ReceiveOutcome, HandlerError> {
        if route.log_kind == LogKind::WebhookVerify {
            return Ok(ReceiveOutcome::ok("Webhook Verified"));
        }

        let payload: serde_json::Value = serde_json::from_slice(body)
            .map_err(|_| HandlerError::ResponseUnparseable("unable to parse request JSON".to_string()))?;

        let mut outcome = ReceiveOutcome::ok("Events Handled");
        let entries = payload["entry"].as_array().into_iter().flatten();
        for entry in entries {
            for event in entry["messaging"].as_array().into_iter().flatten() {
                let Some(sender) = event["sender"]["id"].as_str() else { continue };
                let Some(text) = event["message"]["text"].as_str() else { continue };
                let mut inbound = MsgIn::new(channel.uuid, sender.to_string(), text.to_string());
                inbound.external_id = event["message"]["mid"].as_str().map(str::to_string);
                outcome.inbound.push(inbound);
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{LogPolicy, MsgOrigin};
    use courier_media::InMemoryTier1Store;
    use std::collections::{HashMap, HashSet};
    use uuid::Uuid;

    fn test_channel() -> Channel {
        let mut config = HashMap::new();
        config.insert("auth_token".to_string(), serde_json::json!("page-token"));
        Channel {
            uuid: Uuid::new_v4(),
            id: 1,
            org_id: 1,
            channel_type: "FBA".to_string(),
            name: "test".to_string(),
            address: "112233".to_string(),
            country: None,
            schemes: vec!["facebook".to_string()],
            roles: HashSet::new(),
            config,
            org_config: HashMap::new(),
            org_is_anonymous: false,
            log_policy: LogPolicy::All,
        }
    }

    fn test_msg(channel_uuid: Uuid) -> MsgOut {
        MsgOut {
            uuid: Uuid::new_v4(),
            id: 1,
            channel_uuid,
            urn: "998877".to_string(),
            urn_auth: None,
            text: "hi there".to_string(),
            attachments: vec![],
            quick_replies: vec![],
            templating: None,
            response_to_external_id: None,
            high_priority: false,
            locale: None,
            origin: MsgOrigin::Flow,
            contact_uuid: None,
            flow_uuid: None,
        }
    }

    fn handler() -> MessengerHandler {
        MessengerHandler::new(Arc::new(MediaCache::new(Box::new(InMemoryTier1Store::new()))))
    }

    #[test]
    fn to_payload_uses_plain_text_by_default() {
        let msg = test_msg(Uuid::new_v4());
        let payload = handler().to_payload(&msg).unwrap();
        assert_eq!(payload["message"]["text"], "hi there");
    }

    #[test]
    fn to_payload_prefers_attachment_over_text() {
        let mut msg = test_msg(Uuid::new_v4());
        msg.attachments.push(courier_core::Attachment {
            content_type: "image/jpeg".to_string(),
            url: "https://example.com/i.jpg".to_string(),
        });
        let payload = handler().to_payload(&msg).unwrap();
        assert_eq!(payload["message"]["attachment"]["type"], "image");
    }

    #[test]
    fn to_payload_rejects_empty_message() {
        let mut msg = test_msg(Uuid::new_v4());
        msg.text = String::new();
        assert!(handler().to_payload(&msg).is_err());
    }

    #[test]
    fn redacts_auth_token() {
        let channel = test_channel();
        assert_eq!(handler().redact_values(&channel), vec!["page-token".to_string()]);
    }

    #[tokio::test]
    async fn receive_parses_inbound_text_messages() {
        let channel = test_channel();
        let clog = courier_log::ChannelLog::new(
            courier_log::ChannelLogType::MultiReceive,
            &channel,
            vec![],
        );
        let body = serde_json::json!({
            "entry": [{
                "messaging": [{
                    "sender": { "id": "998877" },
                    "message": { "mid": "m.1", "text": "hello there" }
                }]
            }]
        });
        let route = RouteSpec {
            method: "POST",
            suffix: "",
            log_kind: LogKind::MultiReceive,
            disable_uuid_routing: false,
        };

        let outcome = handler()
            .receive(&channel, &route, body.to_string().as_bytes(), &clog)
            .await
            .unwrap();

        assert_eq!(outcome.inbound.len(), 1);
        assert_eq!(outcome.inbound[0].urn, "998877");
        assert_eq!(outcome.inbound[0].text, "hello there");
    }
}
