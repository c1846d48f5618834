//! Queue processor: turns upstream items into pending tasks.
//!
//! Items arrive through a [`Feed`]. Each one is inserted keyed on its
//! `item_id`, so a redelivered or replayed item never creates a second task.
//! An item is acknowledged once its outcome is settled (created, duplicate,
//! or malformed and dropped); a store failure leaves it unacknowledged for
//! the feed to redeliver.

use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{debug, error, info, warn};

use crate::broadcast::Broadcaster;
use crate::clock::Clock;
use crate::config::IngestConfig;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::model::{FieldMap, Task};
use crate::store::TaskStore;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// One upstream record.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub item_id: String,
    /// Field snapshot. Anything other than a JSON object is malformed.
    pub fields: Value,
    receipt: i64,
}

impl FeedItem {
    pub fn new(item_id: impl Into<String>, fields: Value) -> Self {
        Self {
            item_id: item_id.into(),
            fields,
            receipt: 0,
        }
    }

    /// Split a flat `{item_id, field: value, ...}` record.
    pub fn from_record(record: Value) -> Self {
        match record {
            Value::Object(mut map) => {
                let item_id = match map.remove("item_id") {
                    Some(Value::String(s)) => s,
                    Some(Value::Number(n)) => n.to_string(),
                    _ => String::new(),
                };
                Self::new(item_id, Value::Object(map))
            }
            other => Self::new(String::new(), other),
        }
    }

    /// Flatten back into the record form [`FeedItem::from_record`] reads.
    pub fn into_record(self) -> Value {
        let mut map = match self.fields {
            Value::Object(map) => map,
            other => {
                let mut map = FieldMap::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        map.insert("item_id".to_string(), Value::String(self.item_id));
        Value::Object(map)
    }
}

/// Source of upstream items.
pub trait Feed: Send + Sync + 'static {
    /// Up to `max` items, without blocking when none are ready.
    fn next_batch(&self, max: usize) -> impl Future<Output = Result<Vec<FeedItem>>> + Send;

    /// Mark an item as handled so it is not delivered again.
    fn ack(&self, item: &FeedItem) -> impl Future<Output = Result<()>> + Send;
}

// ---------------------------------------------------------------------------
// In-process feed
// ---------------------------------------------------------------------------

/// Feed backed by a tokio mpsc channel. Unacknowledged items are handed out
/// again on the next batch.
pub struct ChannelFeed {
    state: Mutex<ChannelState>,
}

struct ChannelState {
    rx: mpsc::Receiver<FeedItem>,
    next_receipt: i64,
    unacked: VecDeque<FeedItem>,
}

impl ChannelFeed {
    pub fn channel(capacity: usize) -> (mpsc::Sender<FeedItem>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let feed = Self {
            state: Mutex::new(ChannelState {
                rx,
                next_receipt: 0,
                unacked: VecDeque::new(),
            }),
        };
        (tx, feed)
    }

    /// Items delivered but not yet acknowledged.
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.unacked.len()
    }
}

impl Feed for ChannelFeed {
    async fn next_batch(&self, max: usize) -> Result<Vec<FeedItem>> {
        let mut state = self.state.lock().await;
        let mut batch: Vec<FeedItem> = state.unacked.iter().take(max).cloned().collect();
        while batch.len() < max {
            let Ok(mut item) = state.rx.try_recv() else {
                break;
            };
            state.next_receipt += 1;
            item.receipt = state.next_receipt;
            state.unacked.push_back(item.clone());
            batch.push(item);
        }
        Ok(batch)
    }

    async fn ack(&self, item: &FeedItem) -> Result<()> {
        self.state
            .lock()
            .await
            .unacked
            .retain(|pending| pending.receipt != item.receipt);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// pgmq feed
// ---------------------------------------------------------------------------

/// Feed reading flat item records from a pgmq queue. Acknowledging archives
/// the message.
pub struct PgmqFeed {
    db: Arc<Db>,
    queue: String,
    visibility_timeout: i32,
}

impl PgmqFeed {
    pub fn new(db: Arc<Db>, config: &IngestConfig) -> Self {
        Self {
            db,
            queue: config.queue_name.clone(),
            visibility_timeout: i32::try_from(config.visibility_timeout.as_secs()).unwrap_or(i32::MAX),
        }
    }

    /// Create the queue if it does not exist yet.
    pub async fn ensure_queue(&self) -> Result<()> {
        self.db.create_queue(&self.queue).await
    }
}

impl Feed for PgmqFeed {
    async fn next_batch(&self, max: usize) -> Result<Vec<FeedItem>> {
        let qty = i32::try_from(max).unwrap_or(i32::MAX);
        let messages = self
            .db
            .read_from_queue(&self.queue, self.visibility_timeout, qty)
            .await?;
        Ok(messages
            .into_iter()
            .map(|msg| {
                if msg.read_ct > 1 {
                    debug!(msg_id = msg.msg_id, read_ct = msg.read_ct, "redelivered item");
                }
                let mut item = FeedItem::from_record(msg.message);
                item.receipt = msg.msg_id;
                item
            })
            .collect())
    }

    async fn ack(&self, item: &FeedItem) -> Result<()> {
        self.db.archive_message(&self.queue, item.receipt).await
    }
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Created(Task),
    /// A task for this item already exists; nothing changed.
    Duplicate,
}

/// Tally of one processed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub created: usize,
    pub duplicates: usize,
    /// Dropped and acknowledged.
    pub malformed: usize,
    /// Left unacknowledged for redelivery.
    pub failed: usize,
}

pub struct QueueProcessor<S, F> {
    store: Arc<S>,
    feed: Arc<F>,
    events: Arc<Broadcaster>,
    clock: Arc<dyn Clock>,
    config: IngestConfig,
    wake: Arc<Notify>,
    shutdown: Arc<Notify>,
}

impl<S, F> Clone for QueueProcessor<S, F> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            feed: Arc::clone(&self.feed),
            events: Arc::clone(&self.events),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            wake: Arc::clone(&self.wake),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<S: TaskStore, F: Feed> QueueProcessor<S, F> {
    pub fn new(
        store: Arc<S>,
        feed: Arc<F>,
        events: Arc<Broadcaster>,
        clock: Arc<dyn Clock>,
        config: IngestConfig,
    ) -> Self {
        Self {
            store,
            feed,
            events,
            clock,
            config,
            wake: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Process the feed now instead of waiting for the next poll.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Poll the feed until shutdown.
    pub async fn run(&self) -> Result<()> {
        info!(
            poll_secs = self.config.poll_interval.as_secs(),
            batch = self.config.batch_size,
            "queue processor started"
        );
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("queue processor shutting down");
                    return Ok(());
                }
                _ = self.wake.notified() => debug!("queue processor woken"),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            // Drain full batches before sleeping again.
            loop {
                match self.process_batch().await {
                    Ok(report)
                        if report.received > 0
                            && report.received >= self.config.batch_size
                            && report.failed == 0 => {}
                    Ok(report) => {
                        if report.received > 0 {
                            info!(?report, "ingest batch processed");
                        }
                        break;
                    }
                    Err(e) => {
                        error!("ingest batch failed: {e}");
                        break;
                    }
                }
            }
        }
    }

    /// Read one batch from the feed and settle each item.
    pub async fn process_batch(&self) -> Result<BatchReport> {
        let started = Instant::now();
        let items = self.feed.next_batch(self.config.batch_size).await?;
        let mut report = BatchReport {
            received: items.len(),
            ..BatchReport::default()
        };

        for item in &items {
            let settled = match &item.fields {
                Value::Object(fields) if !item.item_id.trim().is_empty() => {
                    match self.ingest(&item.item_id, fields.clone()).await {
                        Ok(IngestOutcome::Created(_)) => {
                            report.created += 1;
                            true
                        }
                        Ok(IngestOutcome::Duplicate) => {
                            report.duplicates += 1;
                            true
                        }
                        Err(e) => {
                            report.failed += 1;
                            metrics::tasks_ingested().add(1, &[KeyValue::new("result", "error")]);
                            warn!(item_id = %item.item_id, "ingest failed, leaving for redelivery: {e}");
                            false
                        }
                    }
                }
                _ => {
                    report.malformed += 1;
                    metrics::tasks_ingested().add(1, &[KeyValue::new("result", "malformed")]);
                    warn!(item_id = %item.item_id, "dropping malformed item");
                    true
                }
            };

            if settled {
                if let Err(e) = self.feed.ack(item).await {
                    warn!(item_id = %item.item_id, "ack failed: {e}");
                }
            }
        }

        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "ingest.batch")],
        );
        Ok(report)
    }

    /// Create a pending task for one item unless it was ingested before.
    pub async fn ingest(&self, item_id: &str, fields: FieldMap) -> Result<IngestOutcome> {
        if item_id.trim().is_empty() {
            return Err(Error::Validation("item_id must not be empty".to_string()));
        }
        let task = Task::new_pending(item_id, fields, self.clock.now());
        if !self.store.insert_if_absent(&task).await? {
            debug!(item_id, "item already ingested, ignoring");
            metrics::tasks_ingested().add(1, &[KeyValue::new("result", "duplicate")]);
            return Ok(IngestOutcome::Duplicate);
        }

        metrics::tasks_ingested().add(1, &[KeyValue::new("result", "created")]);
        self.events.broadcast(EventKind::NewTask {
            task_id: task.id,
            source_ref: task.source_ref.clone(),
        });
        info!(task_id = %task.id, source_ref = %task.source_ref, "task created");
        Ok(IngestOutcome::Created(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_splits_item_id_from_fields() {
        let item = FeedItem::from_record(json!({"item_id": "r-1", "name": "Ada"}));
        assert_eq!(item.item_id, "r-1");
        assert_eq!(item.fields, json!({"name": "Ada"}));

        let numeric = FeedItem::from_record(json!({"item_id": 42}));
        assert_eq!(numeric.item_id, "42");

        let scalar = FeedItem::from_record(json!("nope"));
        assert!(scalar.item_id.is_empty());
    }

    #[tokio::test]
    async fn channel_feed_redelivers_unacked_items() {
        let (tx, feed) = ChannelFeed::channel(8);
        tx.send(FeedItem::new("a", json!({}))).await.unwrap();
        tx.send(FeedItem::new("b", json!({}))).await.unwrap();

        let first = feed.next_batch(10).await.unwrap();
        assert_eq!(first.len(), 2);
        feed.ack(&first[0]).await.unwrap();

        let again = feed.next_batch(10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].item_id, "b");
        feed.ack(&again[0]).await.unwrap();
        assert_eq!(feed.in_flight().await, 0);
    }
}
