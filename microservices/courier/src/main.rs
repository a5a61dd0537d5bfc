//! Courier — the messaging gateway microservice binary.
//!
//! Wires together the relational store pool, the coordination (queue)
//! store, the wide-column event store and its spool, the media cache, the
//! handler registry, the outbound dispatcher worker pool, and the inbound
//! HTTP routing layer, then runs them under the standard microservice
//! lifecycle.

use courier_core::{CourierService, HealthStatus, MicroserviceRuntime, ReadinessStatus, Result};
use courier_db::{ChannelResolver, CourierDbPool, PoolConfig, StatusEngine, StatusEngineConfig};
use courier_eventstore::{DynamoEventStore, EventStore, InMemoryEventStore, Spooler};
use courier_log::{LogBackend, TracingLogBackend};
use courier_media::{InMemoryTier1Store, MediaCache, RedisTier1Store, Tier1Store};
use courier_queue::{InMemoryQueueStore, QueueStore, RedisQueueStore};
use std::sync::Arc;
use tracing::info;

mod dispatcher;
mod handlers;
mod registry;
mod server;

use dispatcher::{DispatcherConfig, OutboundDispatcher};
use registry::HandlerRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = courier_telemetry::init("courier")
        .map_err(|e| courier_core::CourierError::Config(e.to_string()))?;

    info!("starting courier");

    let service = Arc::new(CourierServiceImpl::new().await?);
    MicroserviceRuntime::run(service).await
}

struct CourierServiceImpl {
    cfg: courier_core::CourierConfig,
    db: CourierDbPool,
    queue: Arc<dyn QueueStore>,
    dispatcher: Arc<OutboundDispatcher>,
    app_state: server::AppState,
    start_time: std::time::Instant,
}

impl CourierServiceImpl {
    async fn new() -> Result<Self> {
        let cfg = courier_core::CourierConfig::from_env()?;

        let db = CourierDbPool::new(PoolConfig {
            url: cfg.db_url.clone(),
            max_size: cfg.max_workers,
        })
        .await?;

        let resolver = Arc::new(ChannelResolver::new(db.clone()));
        let status_engine = Arc::new(StatusEngine::new(
            db.clone(),
            StatusEngineConfig {
                retry_backoff_minutes: cfg.retry_backoff_minutes,
                error_threshold: cfg.error_threshold,
            },
        ));

        let redis_pool = build_redis_pool(&cfg.valkey_url)?;

        let queue: Arc<dyn QueueStore> = if std::env::var("QUEUE_BACKEND").as_deref() == Ok("memory") {
            Arc::new(InMemoryQueueStore::new())
        } else {
            Arc::new(RedisQueueStore::new(redis_pool.clone()))
        };

        let tier1: Box<dyn Tier1Store> =
            if std::env::var("MEDIA_TIER1_BACKEND").as_deref() == Ok("memory") {
                Box::new(InMemoryTier1Store::new())
            } else {
                Box::new(RedisTier1Store::new(redis_pool))
            };
        let media_cache = Arc::new(MediaCache::new(tier1));

        let event_store: Arc<dyn EventStore> =
            if std::env::var("EVENT_STORE_BACKEND").as_deref() == Ok("memory") {
                Arc::new(InMemoryEventStore::new())
            } else {
                let aws_cfg = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                let client = aws_sdk_dynamodb::Client::new(&aws_cfg);
                Arc::new(DynamoEventStore::new(client, &cfg.dynamo_table_prefix))
            };
        let spooler = Arc::new(Spooler::start(event_store, cfg.spool_dir.clone()));

        let log_backend: Arc<dyn LogBackend> = Arc::new(TracingLogBackend);

        let registry = Arc::new(HandlerRegistry::new(handlers::build_handlers(media_cache))?);

        let dispatcher = Arc::new(OutboundDispatcher::new(
            queue.clone(),
            registry.clone(),
            resolver.clone(),
            status_engine.clone(),
            spooler.clone(),
            log_backend.clone(),
            DispatcherConfig {
                worker_count: cfg.max_workers,
                send_timeout: cfg.send_timeout,
                throttle_cooldown: cfg.throttle_cooldown,
            },
        ));

        let app_state = server::AppState {
            registry,
            resolver,
            status_engine,
            spooler,
            log_backend,
            queue: queue.clone(),
            db: db.clone(),
            start_time: std::time::Instant::now(),
        };

        Ok(Self {
            cfg,
            db,
            queue,
            dispatcher,
            app_state,
            start_time: std::time::Instant::now(),
        })
    }
}

fn build_redis_pool(valkey_url: &str) -> Result<deadpool_redis::Pool> {
    let redis_config = deadpool_redis::Config::from_url(valkey_url);
    redis_config
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .map_err(|e| courier_core::CourierError::Config(format!("redis pool: {e}")))
}

#[async_trait::async_trait]
impl CourierService for CourierServiceImpl {
    fn service_id(&self) -> &'static str {
        "courier"
    }

    async fn health(&self) -> HealthStatus {
        HealthStatus {
            healthy: true,
            service_id: self.service_id().to_string(),
            version: self.version().to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    async fn ready(&self) -> ReadinessStatus {
        let db_ready = self.db.is_healthy().await;
        let queue_ready = self.queue.is_throttled(uuid::Uuid::nil()).await.is_ok();

        ReadinessStatus {
            ready: db_ready && queue_ready,
            dependencies: vec![
                courier_core::DependencyStatus {
                    name: "relational_store".to_string(),
                    available: db_ready,
                    latency_ms: None,
                },
                courier_core::DependencyStatus {
                    name: "queue_store".to_string(),
                    available: queue_ready,
                    latency_ms: None,
                },
            ],
        }
    }

    async fn shutdown(&self) -> Result<()> {
        info!("draining outbound dispatcher");
        self.dispatcher.shutdown(self.cfg.shutdown_drain).await
    }

    async fn start(&self) -> Result<()> {
        self.dispatcher.start().await;

        let http_bind = format!("0.0.0.0:{}", self.cfg.http_port);
        info!(bind = %http_bind, "starting courier http server");

        let app = server::build_router(self.app_state.clone());
        let listener = tokio::net::TcpListener::bind(&http_bind)
            .await
            .map_err(|e| courier_core::CourierError::Internal(e.to_string()))?;

        axum::serve(listener, app)
            .await
            .map_err(|e| courier_core::CourierError::Internal(e.to_string()))?;

        Ok(())
    }
}
