use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use courier_core::{ChannelEvent, CourierError, Result};
use parking_lot::Mutex;
use std::io::Write;
use tracing::{debug, instrument, warn};

/// Composite-key wide-column store: `PK = con#<contact-uuid>`, `SK =
/// evt#<msg-uuid>#<evt-type>`. The core only ever writes `StatusChange`
/// events; the sort key is the idempotency boundary for retried writes.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn put_batch(&self, events: &[ChannelEvent]) -> Result<()>;
}

/// DynamoDB-compatible production implementation.
pub struct DynamoEventStore {
    client: Client,
    table: String,
}

impl DynamoEventStore {
    pub fn new(client: Client, table_prefix: &str) -> Self {
        Self {
            client,
            table: format!("{table_prefix}_events"),
        }
    }

    fn item(event: &ChannelEvent) -> Result<std::collections::HashMap<String, AttributeValue>> {
        let data = serde_json::to_string(event)
            .map_err(|e| CourierError::EventStore(format!("encode event: {e}")))?;

        let mut item = std::collections::HashMap::new();
        item.insert(
            "PK".to_string(),
            AttributeValue::S(format!("con#{}", event.contact_uuid)),
        );
        item.insert(
            "SK".to_string(),
            AttributeValue::S(format!("evt#{}#sts", event.msg_uuid)),
        );
        item.insert(
            "OrgID".to_string(),
            AttributeValue::N(event.org_id.to_string()),
        );

        // Gzip the payload when it's large enough that doing so pays off;
        // small payloads keep the plain `Data` attribute for easy scans.
        if data.len() > 2048 {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data.as_bytes())
                .map_err(|e| CourierError::EventStore(format!("gzip event: {e}")))?;
            let compressed = encoder
                .finish()
                .map_err(|e| CourierError::EventStore(format!("gzip event: {e}")))?;
            item.insert("DataGZ".to_string(), AttributeValue::B(compressed.into()));
        } else {
            item.insert("Data".to_string(), AttributeValue::S(data));
        }

        Ok(item)
    }
}

#[async_trait]
impl EventStore for DynamoEventStore {
    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn put_batch(&self, events: &[ChannelEvent]) -> Result<()> {
        for event in events {
            let item = Self::item(event)?;
            self.client
                .put_item()
                .table_name(&self.table)
                .set_item(Some(item))
                .send()
                .await
                .map_err(|e| CourierError::EventStore(e.to_string()))?;
        }
        debug!("wrote events to event store");
        Ok(())
    }
}

/// In-memory event store for tests: records every accepted event so a test
/// can assert on emission order and content.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: Mutex<Vec<ChannelEvent>>,
    fail_next: Mutex<bool>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ChannelEvent> {
        self.events.lock().clone()
    }

    /// Makes the next `put_batch` call fail, to exercise the Spooler's
    /// failure-side spool.
    pub fn fail_next_write(&self) {
        *self.fail_next.lock() = true;
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn put_batch(&self, events: &[ChannelEvent]) -> Result<()> {
        let mut fail = self.fail_next.lock();
        if *fail {
            *fail = false;
            warn!("simulated event store failure");
            return Err(CourierError::EventStore("simulated failure".to_string()));
        }
        drop(fail);
        self.events.lock().extend_from_slice(events);
        Ok(())
    }
}
