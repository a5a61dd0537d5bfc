//! WhatsApp Cloud API handler. Request shape and response parsing follow the
//! Graph API `/messages` endpoint.

use async_trait::async_trait;
use courier_core::{
    Channel, Handler, HandlerError, HttpTrace, LogKind, LogSink, MessageStatus, MsgIn, MsgOut,
    ReceiveOutcome, RouteSpec, SendContext, SendResult, StatusUpdate,
};
use courier_media::{MediaCache, MediaUploader};
use serde_json::json;
use std::sync::Arc;

pub struct WhatsAppHandler {
    media_cache: Arc<MediaCache>,
    http: reqwest::Client,
}

impl WhatsAppHandler {
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

    fn to_payload(&self, channel: &Channel, msg: &MsgOut) -> Result<serde_json::Value, HandlerError> {
        let mut payload = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": msg.urn,
        });

        if let Some(templating) = &msg.templating {
            payload["type"] = json!("template");
            payload["template"] = json!({
                "name": templating.name,
                "language": { "code": templating.language },
                "components": templating.components,
            });
        } else if let Some(attachment) = msg.attachments.first() {
            let media_type = attachment
                .content_type
                .split('/')
                .next()
                .unwrap_or("document");
            let kind = match media_type {
                "image" => "image",
                "video" => "video",
                "audio" => "audio",
                _ => "document",
            };
            payload["type"] = json!(kind);
            payload[kind] = json!({ "link": attachment.url, "caption": msg.text });
        } else if !msg.quick_replies.is_empty() {
            payload["type"] = json!("interactive");
            payload["interactive"] = json!({
                "type": "button",
                "body": { "text": msg.text },
                "action": {
                    "buttons": msg.quick_replies.iter().enumerate().map(|(i, qr)| json!({
                        "type": "reply",
                        "reply": { "id": format!("qr-{i}"), "title": qr.text },
                    })).collect::<Vec<_>>(),
                },
            });
        } else {
            if msg.text.is_empty() {
                return Err(HandlerError::ChannelConfig(
                    "whatsapp message has no text, attachment or template".to_string(),
                ));
            }
            payload["type"] = json!("text");
            payload["text"] = json!({ "body": msg.text });
        }

        Ok(payload)
    }
}

#[async_trait]
impl Handler for WhatsAppHandler {
    fn channel_type(&self) -> &'static str {
        "WA"
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

        // Attachments that are not already media ids get uploaded through the
        // shared tier-1/tier-2 cache before the send, per the media pipeline.
        if let Some(attachment) = msg.attachments.first() {
            let uploader = GraphMediaUploader {
                base_url: self.base_url(channel).to_string(),
                phone_number_id: channel.address.clone(),
                token: token.to_string(),
                http: self.http.clone(),
            };
            let media_id = self
                .media_cache
                .fetch_media_id(channel.uuid, &attachment.url, &uploader)
                .await;
            if !media_id.is_empty() {
                clog.raw_error("media upload cached, linking by id");
            }
        }

        let payload = self.to_payload(channel, msg)?;
        let url = format!("{}/{}/messages", self.base_url(channel), channel.address);

        let started_at = chrono::Utc::now();
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
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
            let id = parsed["messages"][0]["id"]
                .as_str()
                .ok_or_else(|| HandlerError::ResponseUnexpected("missing messages[0].id".to_string()))?;
            result.add_external_id(id);
            return Ok(());
        }

        if status.is_server_error() {
            return Err(HandlerError::ConnectionFailed(format!("http {status}")));
        }

        let error_code = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v["error"]["code"].as_i64())
            .map(|c| c.to_string());

        match error_code {
            Some(code) if code == "130429" => Err(HandlerError::ConnectionThrottled { code }),
            Some(code) => Err(HandlerError::FailedWithReason {
                code,
                message: body,
            }),
            None => Err(HandlerError::ResponseStatus {
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
        clog: &dyn LogSink,
    ) -> Result<ReceiveOutcome, HandlerError> {
        if route.log_kind == LogKind::WebhookVerify {
            return Ok(ReceiveOutcome::ok("Webhook Verified"));
        }

        let payload: serde_json::Value = serde_json::from_slice(body)
            .map_err(|_| HandlerError::ResponseUnparseable("unable to parse request JSON".to_string()))?;

        let mut outcome = ReceiveOutcome::ok("Events Handled");
        let changes = payload["entry"]
            .as_array()
            .into_iter()
            .flatten()
            .flat_map(|entry| entry["changes"].as_array().cloned().unwrap_or_default());

        for change in changes {
            let value = &change["value"];
            for msg in value["messages"].as_array().into_iter().flatten() {
                let Some(from) = msg["from"].as_str() else { continue };
                let text = msg["text"]["body"].as_str().unwrap_or("").to_string();
                let mut inbound = MsgIn::new(channel.uuid, format!("whatsapp:{from}"), text);
                inbound.external_id = msg["id"].as_str().map(str::to_string);
                outcome.inbound.push(inbound);
            }
            for status in value["statuses"].as_array().into_iter().flatten() {
                let Some(provider_status) = status["status"].as_str() else { continue };
                let mapped = match provider_status {
                    "sent" => MessageStatus::Sent,
                    "delivered" => MessageStatus::Delivered,
                    "read" => MessageStatus::Read,
                    "failed" => MessageStatus::Errored,
                    other => {
                        clog.raw_error(&format!("unrecognized whatsapp status {other}"));
                        continue;
                    }
                };
                outcome.status_updates.push(StatusUpdate {
                    channel_uuid: channel.uuid,
                    channel_id: channel.id,
                    msg_uuid: None,
                    external_id: status["id"].as_str().map(str::to_string),
                    status: mapped,
                    urn_update: None,
                    log_uuid: clog.uuid(),
                });
            }
        }

        Ok(outcome)
    }
}

struct GraphMediaUploader {
    base_url: String,
    phone_number_id: String,
    token: String,
    http: reqwest::Client,
}

#[async_trait]
impl MediaUploader for GraphMediaUploader {
    async fn upload(&self, bytes: &[u8], content_type: &str) -> Result<String, String> {
        let part = reqwest::multipart::Part::bytes(bytes.to_vec())
            .file_name("upload")
            .mime_str(content_type)
            .map_err(|e| e.to_string())?;
        let form = reqwest::multipart::Form::new()
            .text("messaging_product", "whatsapp")
            .part("file", part);

        let response = self
            .http
            .post(format!("{}/{}/media", self.base_url, self.phone_number_id))
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !response.status().is_success() {
            return Err(format!("media upload status {}", response.status()));
        }
        let parsed: serde_json::Value = response.json().await.map_err(|e| e.to_string())?;
        parsed["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| "media upload response missing id".to_string())
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
        config.insert("auth_token".to_string(), serde_json::json!("secret-token"));
        Channel {
            uuid: Uuid::new_v4(),
            id: 1,
            org_id: 1,
            channel_type: "WA".to_string(),
            name: "test".to_string(),
            address: "1234567890".to_string(),
            country: None,
            schemes: vec!["whatsapp".to_string()],
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
            urn: "+15551234567".to_string(),
            urn_auth: None,
            text: "hello".to_string(),
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

    #[test]
    fn redacts_auth_token() {
        let handler = WhatsAppHandler::new(Arc::new(MediaCache::new(Box::new(
            InMemoryTier1Store::new(),
        ))));
        let channel = test_channel();
        assert_eq!(handler.redact_values(&channel), vec!["secret-token".to_string()]);
    }

    #[test]
    fn to_payload_uses_text_body_by_default() {
        let handler = WhatsAppHandler::new(Arc::new(MediaCache::new(Box::new(
            InMemoryTier1Store::new(),
        ))));
        let channel = test_channel();
        let msg = test_msg(channel.uuid);
        let payload = handler.to_payload(&channel, &msg).unwrap();
        assert_eq!(payload["type"], "text");
        assert_eq!(payload["text"]["body"], "hello");
    }

    #[test]
    fn to_payload_rejects_empty_message() {
        let handler = WhatsAppHandler::new(Arc::new(MediaCache::new(Box::new(
            InMemoryTier1Store::new(),
        ))));
        let channel = test_channel();
        let mut msg = test_msg(channel.uuid);
        msg.text = String::new();
        assert!(handler.to_payload(&channel, &msg).is_err());
    }

    #[test]
    fn to_payload_prefers_template_over_text() {
        let handler = WhatsAppHandler::new(Arc::new(MediaCache::new(Box::new(
            InMemoryTier1Store::new(),
        ))));
        let channel = test_channel();
        let mut msg = test_msg(channel.uuid);
        msg.templating = Some(courier_core::Templating {
            name: "order_confirmed".to_string(),
            language: "en_US".to_string(),
            components: vec![],
            variables: vec![],
        });
        let payload = handler.to_payload(&channel, &msg).unwrap();
        assert_eq!(payload["type"], "template");
        assert_eq!(payload["template"]["name"], "order_confirmed");
    }

    fn handler() -> WhatsAppHandler {
        WhatsAppHandler::new(Arc::new(MediaCache::new(Box::new(InMemoryTier1Store::new()))))
    }

    #[tokio::test]
    async fn receive_parses_inbound_messages_and_statuses() {
        let channel = test_channel();
        let clog = courier_log::ChannelLog::new(
            courier_log::ChannelLogType::MultiReceive,
            &channel,
            vec![],
        );
        let body = serde_json::json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "messages": [{ "from": "15550001111", "id": "wamid.1", "text": { "body": "hi" } }],
                        "statuses": [{ "id": "wamid.2", "status": "delivered" }]
                    }
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
        assert_eq!(outcome.inbound[0].urn, "whatsapp:15550001111");
        assert_eq!(outcome.status_updates.len(), 1);
        assert_eq!(outcome.status_updates[0].status, MessageStatus::Delivered);
    }

    /// S6: malformed JSON is reported back, not a handler panic.
    #[tokio::test]
    async fn receive_rejects_malformed_json() {
        let channel = test_channel();
        let clog = courier_log::ChannelLog::new(
            courier_log::ChannelLogType::MultiReceive,
            &channel,
            vec![],
        );
        let route = RouteSpec {
            method: "POST",
            suffix: "",
            log_kind: LogKind::MultiReceive,
            disable_uuid_routing: false,
        };

        let err = handler()
            .receive(&channel, &route, b"not json", &clog)
            .await
            .unwrap_err();
        match err {
            HandlerError::ResponseUnparseable(msg) => assert!(msg.contains("unable to parse")),
            other => panic!("unexpected error variant: {other:?}"),
        }
    }
}
