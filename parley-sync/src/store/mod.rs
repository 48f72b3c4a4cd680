//! Remote store adapter boundary.
//!
//! [`RemoteStore`] is the only seam through which the sync layer reaches
//! the document store. Subscriptions are channels rather than callbacks:
//! each one yields a stream of [`SnapshotEvent`]s, every snapshot holding
//! the full current result set of its query.
//!
//! ```text
//! subscribe(query) ──► Subscription { handle, snapshots }
//!                                        │
//!                 Snapshot(batch) ◄──────┤  after every matching mutation
//!                 Error(StoreError) ◄────┘  on listener failure
//! ```
//!
//! Collections:
//! - `users`
//! - `conversations`
//! - `conversations/{id}/messages`

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use parley_core::{ConversationId, Document, DocumentBatch, UserId};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub const USERS: &str = "users";
pub const CONVERSATIONS: &str = "conversations";

/// Path of a conversation's message sub-collection.
pub fn messages_collection(conversation: &ConversationId) -> String {
    format!("{CONVERSATIONS}/{conversation}/messages")
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
    #[error("document {collection}/{id} not found")]
    NotFound { collection: String, id: String },
    #[error("subscription closed")]
    Closed,
    #[error("invalid field `{0}`")]
    InvalidField(String),
}

/// Document filter evaluated by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    All,
    /// `field` is an array containing `value`
    ArrayContains { field: String, value: Value },
}

impl Predicate {
    pub fn matches(&self, fields: &Map<String, Value>) -> bool {
        match self {
            Predicate::All => true,
            Predicate::ArrayContains { field, value } => fields
                .get(field)
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub predicate: Predicate,
}

impl Query {
    pub fn all(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            predicate: Predicate::All,
        }
    }

    /// Every user document.
    pub fn users() -> Self {
        Self::all(USERS)
    }

    /// Conversations the given user participates in.
    pub fn conversations_of(user: &UserId) -> Self {
        Self {
            collection: CONVERSATIONS.to_string(),
            predicate: Predicate::ArrayContains {
                field: "users".to_string(),
                value: Value::String(user.to_string()),
            },
        }
    }

    pub fn messages_of(conversation: &ConversationId) -> Self {
        Self::all(messages_collection(conversation))
    }
}

/// A single field mutation. Keys of [`Fields`] may be dotted paths
/// (`usersUnreadCountInfo.u1`) addressing nested maps.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Set(Value),
    /// Atomic numeric increment; a missing or non-numeric field counts as 0
    Increment(i64),
}

pub type Fields = BTreeMap<String, FieldValue>;

/// Turn a JSON object into a set of top-level `Set` mutations.
pub fn set_fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map
            .into_iter()
            .map(|(key, value)| (key, FieldValue::Set(value)))
            .collect(),
        _ => Fields::new(),
    }
}

/// Pushed to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotEvent {
    Snapshot(DocumentBatch),
    Error(StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

/// A live query: its handle and the channel its snapshots arrive on.
#[derive(Debug)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub snapshots: mpsc::UnboundedReceiver<SnapshotEvent>,
}

/// The remote document store, as seen by the sync layer.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// One-shot fetch of a query's current result set.
    async fn query(&self, query: &Query) -> Result<DocumentBatch, StoreError>;

    /// One-shot fetch of a single document; `NotFound` if it does not exist.
    async fn fetch(&self, collection: &str, id: &str) -> Result<Document, StoreError>;

    /// Start a live query. The first snapshot is delivered right away.
    async fn subscribe(&self, query: &Query) -> Result<Subscription, StoreError>;

    /// Stop a live query and close its channel.
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), StoreError>;

    /// Create (`id` absent or unknown) or merge-update a document.
    async fn write(
        &self,
        collection: &str,
        id: Option<&str>,
        fields: Fields,
    ) -> Result<String, StoreError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;
}

/// Bound a remote call by `limit`; expiry becomes [`StoreError::Timeout`].
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}
