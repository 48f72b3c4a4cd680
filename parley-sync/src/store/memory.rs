//! In-process document store.
//!
//! Implements [`RemoteStore`] over in-memory collections so the coordinator
//! and gateway can run without a real backend (tests, the demo binary).
//!
//! Every mutation re-evaluates the live queries on the touched collection
//! and pushes each matching subscriber a full snapshot. Snapshots are
//! computed and enqueued under the write lock, so subscribers observe them
//! in mutation order.
//!
//! Fault injection hooks (`set_fail_writes`, `fail_writes_after`,
//! `set_latency`, `push_error`)
//! let tests exercise the failure paths of the sync layer.

use async_trait::async_trait;
use parley_core::{Document, DocumentBatch};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use super::{
    FieldValue, Fields, Query, RemoteStore, SnapshotEvent, StoreError, Subscription,
    SubscriptionHandle,
};

/// Counters for monitoring store activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub writes: u64,
    pub deletes: u64,
    pub snapshots_pushed: u64,
    pub active_subscriptions: usize,
}

struct Subscriber {
    query: Query,
    tx: mpsc::UnboundedSender<SnapshotEvent>,
}

#[derive(Default)]
struct StoreInner {
    /// collection path → document id → fields
    collections: HashMap<String, BTreeMap<String, Map<String, Value>>>,
    subscribers: HashMap<u64, Subscriber>,
}

impl StoreInner {
    fn run_query(&self, query: &Query) -> DocumentBatch {
        self.collections
            .get(&query.collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, fields)| query.predicate.matches(fields))
                    .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Push a fresh snapshot to every subscriber of `collection`.
    /// Subscribers whose receiver is gone are removed.
    fn notify(&mut self, collection: &str) -> u64 {
        let mut pushed = 0;
        let mut closed = Vec::new();
        for (id, sub) in &self.subscribers {
            if sub.query.collection != collection {
                continue;
            }
            let batch = self.run_query(&sub.query);
            if sub.tx.send(SnapshotEvent::Snapshot(batch)).is_err() {
                closed.push(*id);
            } else {
                pushed += 1;
            }
        }
        for id in closed {
            self.subscribers.remove(&id);
        }
        pushed
    }
}

/// In-memory [`RemoteStore`].
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
    next_handle: AtomicU64,
    fail_writes: AtomicBool,
    /// Writes left before every write fails; `u64::MAX` disarms
    writes_until_failure: AtomicU64,
    latency_ms: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    snapshots_pushed: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            next_handle: AtomicU64::new(1),
            fail_writes: AtomicBool::new(false),
            writes_until_failure: AtomicU64::new(u64::MAX),
            latency_ms: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            snapshots_pushed: AtomicU64::new(0),
        }
    }

    /// Make every subsequent `write` and `delete` fail with a transport error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Let the next `n` writes and deletes succeed, then fail the rest with
    /// a transport error.
    pub fn fail_writes_after(&self, n: u64) {
        self.writes_until_failure.store(n, Ordering::Relaxed);
    }

    /// Delay every remote call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::Relaxed);
    }

    /// Deliver an error event to every subscriber of `collection`.
    pub async fn push_error(&self, collection: &str, error: StoreError) -> usize {
        let inner = self.inner.read().await;
        inner
            .subscribers
            .values()
            .filter(|sub| sub.query.collection == collection)
            .filter(|sub| sub.tx.send(SnapshotEvent::Error(error.clone())).is_ok())
            .count()
    }

    /// Fields of a stored document, bypassing latency and fault injection.
    pub async fn get(&self, collection: &str, id: &str) -> Option<Map<String, Value>> {
        let inner = self.inner.read().await;
        inner.collections.get(collection)?.get(id).cloned()
    }

    pub async fn stats(&self) -> StoreStats {
        let inner = self.inner.read().await;
        StoreStats {
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            snapshots_pushed: self.snapshots_pushed.load(Ordering::Relaxed),
            active_subscriptions: inner.subscribers.len(),
        }
    }

    async fn simulate_latency(&self) {
        let millis = self.latency_ms.load(Ordering::Relaxed);
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        let exhausted = self
            .writes_until_failure
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| match left {
                0 | u64::MAX => None,
                left => Some(left - 1),
            })
            .is_err_and(|left| left == 0);
        if exhausted || self.fail_writes.load(Ordering::Relaxed) {
            return Err(StoreError::Transport("write rejected by store".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn query(&self, query: &Query) -> Result<DocumentBatch, StoreError> {
        self.simulate_latency().await;
        Ok(self.inner.read().await.run_query(query))
    }

    async fn fetch(&self, collection: &str, id: &str) -> Result<Document, StoreError> {
        self.simulate_latency().await;
        let inner = self.inner.read().await;
        inner
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|fields| Document::new(id, fields.clone()))
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })
    }

    async fn subscribe(&self, query: &Query) -> Result<Subscription, StoreError> {
        self.simulate_latency().await;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.write().await;
        // Initial snapshot
        let batch = inner.run_query(query);
        tx.send(SnapshotEvent::Snapshot(batch))
            .map_err(|_| StoreError::Closed)?;
        self.snapshots_pushed.fetch_add(1, Ordering::Relaxed);
        inner.subscribers.insert(
            id,
            Subscriber {
                query: query.clone(),
                tx,
            },
        );

        log::debug!("Subscribed #{id} to {}", query.collection);
        Ok(Subscription {
            handle: SubscriptionHandle(id),
            snapshots: rx,
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.subscribers.remove(&handle.0) {
            Some(_) => Ok(()),
            None => Err(StoreError::Closed),
        }
    }

    async fn write(
        &self,
        collection: &str,
        id: Option<&str>,
        fields: Fields,
    ) -> Result<String, StoreError> {
        self.simulate_latency().await;
        self.check_writable()?;

        let doc_id = id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut inner = self.inner.write().await;
        let docs = inner.collections.entry(collection.to_string()).or_default();

        // Apply to a copy so a bad field leaves the document untouched
        let mut updated = docs.get(&doc_id).cloned().unwrap_or_default();
        for (path, value) in fields {
            apply_field(&mut updated, &path, value)?;
        }
        docs.insert(doc_id.clone(), updated);

        self.writes.fetch_add(1, Ordering::Relaxed);
        let pushed = inner.notify(collection);
        self.snapshots_pushed.fetch_add(pushed, Ordering::Relaxed);
        Ok(doc_id)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.simulate_latency().await;
        self.check_writable()?;

        let mut inner = self.inner.write().await;
        let removed = inner
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.remove(id));
        if removed.is_none() {
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }

        self.deletes.fetch_add(1, Ordering::Relaxed);
        let pushed = inner.notify(collection);
        self.snapshots_pushed.fetch_add(pushed, Ordering::Relaxed);
        Ok(())
    }
}

/// Apply one (possibly dotted) field mutation to a document.
fn apply_field(doc: &mut Map<String, Value>, path: &str, value: FieldValue) -> Result<(), StoreError> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(leaf) = segments.pop().filter(|s| !s.is_empty()) else {
        return Err(StoreError::InvalidField(path.to_string()));
    };

    let mut target = doc;
    for segment in segments {
        if segment.is_empty() {
            return Err(StoreError::InvalidField(path.to_string()));
        }
        let slot = target
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        target = match slot {
            Value::Object(map) => map,
            _ => return Err(StoreError::InvalidField(path.to_string())),
        };
    }

    let new_value = match value {
        FieldValue::Set(v) => v,
        FieldValue::Increment(delta) => {
            let current = target.get(leaf).and_then(Value::as_i64).unwrap_or(0);
            Value::from(current.saturating_add(delta))
        }
    };
    target.insert(leaf.to_string(), new_value);
    Ok(())
}
