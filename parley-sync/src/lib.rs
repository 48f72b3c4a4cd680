//! # parley-sync: Live projection of the chat store
//!
//! Keeps the `users` and `conversations` projections current by
//! subscribing to the remote document store and re-running the
//! `parley-core` pipeline on every pushed snapshot.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  SnapshotEvent   ┌──────────────┐   watch    ┌───────────┐
//! │ RemoteStore  │ ───────────────► │ Coordinator  │ ─────────► │ Observers │
//! │ (adapter)    │  (per query)     │ (2 workers)  │ ChatState  └───────────┘
//! └──────▲───────┘                  └──────▲───────┘
//!        │ write / delete                  │ refresh
//!        │                          ┌──────┴───────┐
//!        └───────────────────────── │   Gateway    │
//!                                   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`store`]: Remote store adapter trait and the in-memory store
//! - [`state`]: Published state and per-query subscription states
//! - [`coordinator`]: Subscription workers and publication
//! - [`gateway`]: Write operations
//! - [`config`]: Timeouts and channel sizes

pub mod config;
pub mod store;
pub mod state;
pub mod coordinator;
pub mod gateway;

// Re-exports for convenience
pub use config::SyncConfig;
pub use store::{
    FieldValue, Fields, MemoryStore, Predicate, Query, RemoteStore, SnapshotEvent, StoreError,
    Subscription, SubscriptionHandle,
};
pub use state::{ChatState, QueryKind, SubscriptionState};
pub use coordinator::{SyncCoordinator, SyncError};
pub use gateway::{DraftMessage, GatewayError, MutationGateway};
