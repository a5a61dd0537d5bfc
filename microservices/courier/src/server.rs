//! HTTP routing layer (§4.D): turns each registered handler's declared
//! `RouteSpec`s into concrete axum routes under `/c/<lowercased-type>/...`,
//! resolves the target channel, opens a `ChannelLog`, calls
//! `Handler::receive`, and feeds any returned status updates into the
//! StatusEngine and Spooler. Also serves the ambient `/healthz`/`/readyz`
//! probes and stamps every response with a request id.

use crate::registry::HandlerRegistry;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, MethodRouter};
use axum::{Json, Router};
use courier_core::{CourierError, LogKind, RouteSpec};
use courier_db::{ChannelResolver, StatusEngine};
use courier_eventstore::Spooler;
use courier_log::{ChannelLog, ChannelLogType, LogBackend};
use courier_queue::QueueStore;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<HandlerRegistry>,
    pub resolver: Arc<ChannelResolver>,
    pub status_engine: Arc<StatusEngine>,
    pub spooler: Arc<Spooler>,
    pub log_backend: Arc<dyn LogBackend>,
    pub queue: Arc<dyn QueueStore>,
    pub db: courier_db::CourierDbPool,
    pub start_time: std::time::Instant,
}

/// Builds the full router: one entry per `(channel_type, RouteSpec)` pair
/// declared by a registered handler, plus the ambient health/readiness pair.
pub fn build_router(state: AppState) -> Router {
    let mut by_path: HashMap<String, MethodRouter<AppState>> = HashMap::new();

    for descriptor in state.registry.iter() {
        let channel_type = descriptor.channel_type;
        for route in descriptor.handler.routes() {
            let path = route_path(channel_type, route);
            let entry = by_path.remove(&path).unwrap_or_else(MethodRouter::new);
            by_path.insert(path, attach_method(entry, channel_type, route));
        }
    }

    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz));

    for (path, method_router) in by_path {
        router = router.route(&path, method_router);
    }

    router
        .layer(middleware::from_fn(request_id_layer))
        .with_state(state)
}

/// `/c/<type>/:channel_uuid/<suffix>`, or without the UUID segment when the
/// route's handler locates the channel from the request body instead.
fn route_path(channel_type: &'static str, route: RouteSpec) -> String {
    let lower = channel_type.to_ascii_lowercase();
    match (route.disable_uuid_routing, route.suffix.is_empty()) {
        (true, true) => format!("/c/{lower}"),
        (true, false) => format!("/c/{lower}/{}", route.suffix),
        (false, true) => format!("/c/{lower}/:channel_uuid"),
        (false, false) => format!("/c/{lower}/:channel_uuid/{}", route.suffix),
    }
}

fn attach_method(
    entry: MethodRouter<AppState>,
    channel_type: &'static str,
    route: RouteSpec,
) -> MethodRouter<AppState> {
    if route.disable_uuid_routing {
        let handler = move |State(state): State<AppState>, body: Bytes| async move {
            dispatch(state, channel_type, route, None, body).await
        };
        match route.method {
            "GET" => entry.get(handler),
            _ => entry.post(handler),
        }
    } else {
        let handler = move |State(state): State<AppState>,
                             Path(channel_uuid): Path<Uuid>,
                             body: Bytes| async move {
            dispatch(state, channel_type, route, Some(channel_uuid), body).await
        };
        match route.method {
            "GET" => entry.get(handler),
            _ => entry.post(handler),
        }
    }
}

/// Per §4.D: inbound webhook responses are always HTTP 200 with a
/// `{"message": ..., "data": [...]}` body; errors (unknown channel, parse
/// failure, handler rejection) are reported in the body, not the status line,
/// since most providers retry aggressively on non-2xx.
#[instrument(skip(state, body), fields(channel_type))]
async fn dispatch(
    state: AppState,
    channel_type: &'static str,
    route: RouteSpec,
    channel_uuid: Option<Uuid>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let Some(descriptor) = state.registry.get(channel_type) else {
        return (StatusCode::OK, Json(json!({ "message": "unknown channel type" })));
    };

    let channel = if route.disable_uuid_routing {
        match descriptor.handler.locate_channel(&body) {
            Some((located_type, address)) => state.resolver.by_address(&located_type, &address).await,
            None => Err(CourierError::Validation(
                "cannot locate channel from request body".to_string(),
            )),
        }
    } else {
        match channel_uuid {
            Some(uuid) => state.resolver.by_uuid(uuid, Some(channel_type)).await,
            None => Err(CourierError::Validation("missing channel uuid".to_string())),
        }
    };

    let channel = match channel {
        Ok(channel) => channel,
        Err(e) => return (StatusCode::OK, Json(json!({ "message": e.to_string() }))),
    };

    let log_type = match route.log_kind {
        LogKind::WebhookVerify => ChannelLogType::WebhookVerify,
        LogKind::MultiReceive => ChannelLogType::MultiReceive,
    };
    let clog = ChannelLog::new(log_type, &channel, descriptor.handler.redact_values(&channel));

    let outcome = descriptor.handler.receive(&channel, &route, &body, &clog).await;

    let response = match outcome {
        Ok(outcome) => {
            if !outcome.status_updates.is_empty() {
                match state.status_engine.apply_batch(&outcome.status_updates).await {
                    Ok(changes) => {
                        for change in changes {
                            if let Err(e) = state.spooler.submit(change).await {
                                error!(error = %e, "failed to submit status change to spooler");
                            }
                        }
                    }
                    Err(e) => error!(error = %e, "status engine apply_batch failed for inbound update"),
                }
            }

            let data: Vec<Value> = outcome
                .inbound
                .iter()
                .map(|m| {
                    json!({
                        "uuid": m.uuid,
                        "urn": m.urn,
                        "text": m.text,
                        "external_id": m.external_id,
                    })
                })
                .collect();
            json!({ "message": outcome.message, "data": data })
        }
        Err(e) => {
            clog.raw_error(&e);
            json!({ "message": e.to_string() })
        }
    };

    let finalized = clog.end();
    if let Err(e) = state.log_backend.write(finalized).await {
        error!(error = %e, "failed to write channel log");
    }

    (StatusCode::OK, Json(response))
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "healthy": true,
        "uptime_seconds": state.start_time.elapsed().as_secs(),
    }))
}

async fn readyz(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let db_ready = state.db.is_healthy().await;
    let queue_ready = state.queue.is_throttled(Uuid::nil()).await.is_ok();

    let ready = db_ready && queue_ready;
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        status,
        Json(json!({
            "ready": ready,
            "dependencies": [
                { "name": "relational_store", "available": db_ready },
                { "name": "queue_store", "available": queue_ready },
            ],
        })),
    )
}

/// Stamps every response with `X-Request-Id`, generating one when the
/// request didn't carry one already, so a caller can correlate a webhook
/// response with the channel log written server-side.
async fn request_id_layer(request: axum::extract::Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{LogKind, RouteSpec};

    #[test]
    fn route_path_uuid_routed_with_suffix() {
        let route = RouteSpec {
            method: "POST",
            suffix: "receive",
            log_kind: LogKind::MultiReceive,
            disable_uuid_routing: false,
        };
        assert_eq!(route_path("WA", route), "/c/wa/:channel_uuid/receive");
    }

    #[test]
    fn route_path_uuid_routed_without_suffix() {
        let route = RouteSpec {
            method: "GET",
            suffix: "",
            log_kind: LogKind::WebhookVerify,
            disable_uuid_routing: false,
        };
        assert_eq!(route_path("FBA", route), "/c/fba/:channel_uuid");
    }

    #[test]
    fn route_path_disables_uuid_routing() {
        let route = RouteSpec {
            method: "POST",
            suffix: "receive",
            log_kind: LogKind::MultiReceive,
            disable_uuid_routing: true,
        };
        assert_eq!(route_path("T", route), "/c/t/receive");
    }
}
