use crate::store::EventStore;
use courier_core::{ChannelEvent, CourierError, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_BATCH_SIZE: usize = 1000;
const DRAIN_INTERVAL: Duration = Duration::from_secs(5);

/// Background queue with a failure-side spool: submissions that cannot be
/// flushed to the event store within the flush interval are serialized to
/// disk as newline-delimited JSON; a background task replays the spool when
/// connectivity returns. The event store's sort key provides the dedup
/// boundary, so replay does not need to track what was already written.
pub struct Spooler {
    tx: mpsc::Sender<ChannelEvent>,
}

impl Spooler {
    pub fn start(store: Arc<dyn EventStore>, spool_dir: impl Into<PathBuf>) -> Self {
        Self::start_with(
            store,
            spool_dir.into(),
            DEFAULT_FLUSH_INTERVAL,
            DEFAULT_BATCH_SIZE,
        )
    }

    pub fn start_with(
        store: Arc<dyn EventStore>,
        spool_dir: PathBuf,
        flush_interval: Duration,
        batch_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(10_000);
        let sequence = Arc::new(AtomicU64::new(0));

        tokio::spawn(flush_loop(
            store.clone(),
            spool_dir.clone(),
            flush_interval,
            batch_size,
            rx,
            sequence.clone(),
        ));
        tokio::spawn(drain_loop(store, spool_dir));

        Self { tx }
    }

    pub async fn submit(&self, event: ChannelEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| CourierError::EventStore("spooler shut down".to_string()))
    }
}

async fn flush_loop(
    store: Arc<dyn EventStore>,
    spool_dir: PathBuf,
    flush_interval: Duration,
    batch_size: usize,
    mut rx: mpsc::Receiver<ChannelEvent>,
    sequence: Arc<AtomicU64>,
) {
    let mut buffer = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);

    loop {
        tokio::select! {
            received = rx.recv() => {
                match received {
                    Some(event) => {
                        buffer.push(event);
                        if buffer.len() >= batch_size {
                            flush(&store, &spool_dir, &mut buffer, &sequence).await;
                        }
                    }
                    None => {
                        flush(&store, &spool_dir, &mut buffer, &sequence).await;
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(&store, &spool_dir, &mut buffer, &sequence).await;
                }
            }
        }
    }
}

async fn flush(
    store: &Arc<dyn EventStore>,
    spool_dir: &Path,
    buffer: &mut Vec<ChannelEvent>,
    sequence: &AtomicU64,
) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    if let Err(e) = store.put_batch(&batch).await {
        warn!(error = %e, count = batch.len(), "event store write failed, spooling to disk");
        if let Err(spool_err) = spool_to_disk(spool_dir, &batch, sequence).await {
            error!(error = %spool_err, "failed to spool events to disk, events lost");
        }
    }
}

async fn spool_to_disk(
    spool_dir: &Path,
    batch: &[ChannelEvent],
    sequence: &AtomicU64,
) -> std::io::Result<()> {
    fs::create_dir_all(spool_dir).await?;
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let seq = sequence.fetch_add(1, Ordering::SeqCst);
    let path = spool_dir.join(format!("{millis}-{seq}.spool"));

    let mut contents = String::new();
    for event in batch {
        let line = serde_json::to_string(event)
            .unwrap_or_else(|e| format!("{{\"encode_error\":\"{e}\"}}"));
        contents.push_str(&line);
        contents.push('\n');
    }
    fs::write(path, contents).await
}

async fn drain_loop(store: Arc<dyn EventStore>, spool_dir: PathBuf) {
    let mut ticker = tokio::time::interval(DRAIN_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(e) = drain_once(&store, &spool_dir).await {
            debug!(error = %e, "spool drain pass failed");
        }
    }
}

async fn drain_once(store: &Arc<dyn EventStore>, spool_dir: &Path) -> std::io::Result<()> {
    let mut entries = match fs::read_dir(spool_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.path().extension().and_then(|e| e.to_str()) == Some("spool") {
            files.push(entry.path());
        }
    }
    files.sort();

    for path in files {
        let contents = fs::read_to_string(&path).await?;
        let events: Vec<ChannelEvent> = contents
            .lines()
            .filter(|l| !l.is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();

        if events.is_empty() {
            let _ = fs::remove_file(&path).await;
            continue;
        }

        match store.put_batch(&events).await {
            Ok(()) => {
                fs::remove_file(&path).await?;
                debug!(path = %path.display(), "drained spool file");
            }
            Err(e) => {
                debug!(error = %e, path = %path.display(), "spool drain still failing, leaving file");
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEventStore;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_event() -> ChannelEvent {
        ChannelEvent {
            contact_uuid: Uuid::new_v4(),
            msg_uuid: Uuid::new_v4(),
            status: courier_core::MessageStatus::Wired,
            failed_reason: None,
            org_id: 1,
            timestamp: Utc::now(),
            urn_update: None,
        }
    }

    #[tokio::test]
    async fn flushes_on_batch_threshold() {
        let store = Arc::new(InMemoryEventStore::new());
        let dir = tempfile::tempdir().unwrap();
        let spooler = Spooler::start_with(
            store.clone(),
            dir.path().to_path_buf(),
            Duration::from_secs(60),
            2,
        );

        spooler.submit(sample_event()).await.unwrap();
        spooler.submit(sample_event()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.events().len(), 2);
    }

    #[tokio::test]
    async fn spools_to_disk_on_store_failure_and_drains_later() {
        let store = Arc::new(InMemoryEventStore::new());
        store.fail_next_write();
        let dir = tempfile::tempdir().unwrap();
        let spooler = Spooler::start_with(
            store.clone(),
            dir.path().to_path_buf(),
            Duration::from_millis(20),
            10,
        );

        spooler.submit(sample_event()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let spool_files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert!(!spool_files.is_empty(), "expected a spool file after failed write");

        drain_once(&(store.clone() as Arc<dyn EventStore>), dir.path())
            .await
            .unwrap();
        assert_eq!(store.events().len(), 1);
    }
}
