//! Per-job progress bus with snapshot replay.
//!
//! Entries are created lazily on first publish or subscribe. Each entry holds
//! a broadcast sender and the latest event (the snapshot). A new subscriber
//! receives the snapshot first, then every event published after it joined.
//!
//! When a [`StatusStore`] is attached, every snapshot is also written to
//! `progress:snapshot:{job_id}` with a TTL and published on
//! `progress:{job_id}`. Entries are released when their last subscriber
//! leaves after a terminal event, or by [`ProgressBus::evict_idle`]; a later
//! subscriber then reloads the snapshot from the store.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use vgen_models::{JobId, ProgressEvent};
use vgen_store::StatusStore;

/// Default per-subscriber buffer.
///
/// A subscriber more than this many events behind skips the oldest ones
/// and resumes from the newest it still holds; a lag is logged and counted
/// in `vgen_progress_lagged_events_total`. Delivery is therefore
/// at-least-once only for readers that keep within the buffer. Use
/// [`ProgressBus::with_capacity`] to change it.
pub const DEFAULT_CAPACITY: usize = 256;

/// Default lifetime of a stored snapshot.
const DEFAULT_SNAPSHOT_TTL: Duration = Duration::from_secs(3600);

fn snapshot_key(job_id: &JobId) -> String {
    format!("progress:snapshot:{}", job_id)
}

fn channel_name(job_id: &JobId) -> String {
    format!("progress:{}", job_id)
}

struct BusEntry {
    sender: broadcast::Sender<ProgressEvent>,
    snapshot: Option<ProgressEvent>,
    last_activity: Instant,
    /// Sequence number of the newest snapshot written to the store.
    /// Held across the store write so writes for one job do not interleave.
    stored_seq: Arc<tokio::sync::Mutex<u64>>,
}

impl BusEntry {
    fn new(capacity: usize, snapshot: Option<ProgressEvent>) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            snapshot,
            last_activity: Instant::now(),
            stored_seq: Arc::new(tokio::sync::Mutex::new(0)),
        }
    }
}

struct BusInner {
    entries: Mutex<HashMap<JobId, BusEntry>>,
    store: Option<Arc<dyn StatusStore>>,
    snapshot_ttl: Duration,
    capacity: usize,
    /// Publish order across the bus, assigned under the entries lock
    next_seq: AtomicU64,
}

impl BusInner {
    /// Drop the entry once nobody listens and the job has finished.
    ///
    /// Only done with a store attached, so the snapshot stays reachable.
    fn release_if_finished(&self, job_id: &JobId) {
        if self.store.is_none() {
            return;
        }
        let mut entries = self.entries.lock();
        let finished = entries.get(job_id).is_some_and(|entry| {
            entry.sender.receiver_count() == 0
                && entry.snapshot.as_ref().is_some_and(ProgressEvent::is_terminal)
        });
        if finished {
            entries.remove(job_id);
            debug!(job_id = %job_id, "Released progress entry");
        }
    }
}

/// Per-job publish/subscribe multiplexer. Cheap to clone.
#[derive(Clone)]
pub struct ProgressBus {
    inner: Arc<BusInner>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    /// Create an in-memory bus.
    pub fn new() -> Self {
        Self::build(None, DEFAULT_SNAPSHOT_TTL)
    }

    /// Create a bus that writes snapshots through to `store`.
    pub fn with_store(store: Arc<dyn StatusStore>, snapshot_ttl: Duration) -> Self {
        Self::build(Some(store), snapshot_ttl)
    }

    fn build(store: Option<Arc<dyn StatusStore>>, snapshot_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                entries: Mutex::new(HashMap::new()),
                store,
                snapshot_ttl,
                capacity: DEFAULT_CAPACITY,
                next_seq: AtomicU64::new(1),
            }),
        }
    }

    /// Set the per-subscriber buffer. Must be called before the bus is
    /// shared; clones made earlier keep the old setting.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.capacity = capacity.max(1);
        } else {
            warn!("Progress bus already shared, keeping capacity {}", self.inner.capacity);
        }
        self
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Publish an event for its job.
    ///
    /// Never blocks on subscribers. Publishing with no subscribers only
    /// updates the snapshot. Store failures are logged, not returned.
    pub async fn publish(&self, event: ProgressEvent) {
        let job_id = event.job_id.clone();
        let (seq, stored_seq) = {
            let mut entries = self.inner.entries.lock();
            let entry = entries
                .entry(job_id.clone())
                .or_insert_with(|| BusEntry::new(self.inner.capacity, None));
            entry.snapshot = Some(event.clone());
            entry.last_activity = Instant::now();
            // Err only means there are no receivers
            let _ = entry.sender.send(event.clone());
            let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
            (seq, Arc::clone(&entry.stored_seq))
        };
        counter!("vgen_progress_events_total", "status" => event.status.as_str()).increment(1);

        if let Some(store) = &self.inner.store {
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(job_id = %job_id, "Failed to serialize progress event: {}", e);
                    return;
                }
            };

            {
                let mut stored = stored_seq.lock().await;
                // A later event already reached the store
                if *stored < seq {
                    match store
                        .set(&snapshot_key(&job_id), &payload, Some(self.inner.snapshot_ttl))
                        .await
                    {
                        Ok(()) => *stored = seq,
                        Err(e) => warn!(job_id = %job_id, "Failed to store progress snapshot: {}", e),
                    }
                } else {
                    debug!(job_id = %job_id, "Skipping stale progress snapshot");
                }
            }

            if let Err(e) = store.publish(&channel_name(&job_id), &payload).await {
                warn!(job_id = %job_id, "Failed to publish progress event: {}", e);
            }
        }
    }

    /// Subscribe to a job's events, starting with its current snapshot.
    pub async fn subscribe(&self, job_id: &JobId) -> ProgressSubscription {
        {
            let mut entries = self.inner.entries.lock();
            if let Some(entry) = entries.get_mut(job_id) {
                entry.last_activity = Instant::now();
                return self.subscription(job_id, entry.snapshot.clone(), entry.sender.subscribe());
            }
        }

        let stored = self.load_snapshot(job_id).await;

        let mut entries = self.inner.entries.lock();
        // A publish may have created the entry while the store was read
        let entry = entries
            .entry(job_id.clone())
            .or_insert_with(|| BusEntry::new(self.inner.capacity, stored));
        entry.last_activity = Instant::now();
        self.subscription(job_id, entry.snapshot.clone(), entry.sender.subscribe())
    }

    fn subscription(
        &self,
        job_id: &JobId,
        snapshot: Option<ProgressEvent>,
        receiver: broadcast::Receiver<ProgressEvent>,
    ) -> ProgressSubscription {
        debug!(job_id = %job_id, has_snapshot = snapshot.is_some(), "New progress subscriber");
        ProgressSubscription {
            job_id: job_id.clone(),
            snapshot,
            events: Some(BroadcastStream::new(receiver)),
            bus: Arc::downgrade(&self.inner),
        }
    }

    async fn load_snapshot(&self, job_id: &JobId) -> Option<ProgressEvent> {
        let store = self.inner.store.as_ref()?;
        match store.get(&snapshot_key(job_id)).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(job_id = %job_id, "Discarding unreadable progress snapshot: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(job_id = %job_id, "Failed to load progress snapshot: {}", e);
                None
            }
        }
    }

    /// Latest event for a job, from memory or the store.
    pub async fn snapshot(&self, job_id: &JobId) -> Option<ProgressEvent> {
        let in_memory = self
            .inner
            .entries
            .lock()
            .get(job_id)
            .and_then(|entry| entry.snapshot.clone());
        match in_memory {
            Some(event) => Some(event),
            None => self.load_snapshot(job_id).await,
        }
    }

    /// Number of live subscribers for a job.
    pub fn subscriber_count(&self, job_id: &JobId) -> usize {
        self.inner
            .entries
            .lock()
            .get(job_id)
            .map_or(0, |entry| entry.sender.receiver_count())
    }

    /// Number of jobs with in-memory bookkeeping.
    pub fn entry_count(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Remove entries with no subscribers and no activity within `max_idle`.
    ///
    /// Returns the number of entries removed.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            entry.sender.receiver_count() > 0
                || now.duration_since(entry.last_activity) < max_idle
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!("Evicted {} idle progress entries", evicted);
        }
        evicted
    }
}

/// Stream of progress events for one job.
///
/// Yields the snapshot taken at subscribe time, then live events in publish
/// order. Dropping it unsubscribes without affecting other subscribers.
pub struct ProgressSubscription {
    job_id: JobId,
    snapshot: Option<ProgressEvent>,
    events: Option<BroadcastStream<ProgressEvent>>,
    bus: Weak<BusInner>,
}

impl ProgressSubscription {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }
}

impl Stream for ProgressSubscription {
    type Item = ProgressEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(snapshot) = this.snapshot.take() {
            return Poll::Ready(Some(snapshot));
        }

        let Some(events) = this.events.as_mut() else {
            return Poll::Ready(None);
        };

        loop {
            match events.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!(job_id = %this.job_id, "Progress subscriber lagged, skipped {} events", skipped);
                    counter!("vgen_progress_lagged_events_total").increment(skipped);
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for ProgressSubscription {
    fn drop(&mut self) {
        // Release the receiver before checking the count
        self.events.take();
        if let Some(inner) = self.bus.upgrade() {
            inner.release_if_finished(&self.job_id);
        }
    }
}
