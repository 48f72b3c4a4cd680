//! # parley-core: Entity models and projection pipeline for Parley
//!
//! Turns raw document snapshots from the remote store into the resolved,
//! ordered view a chat client renders.
//!
//! ## Pipeline
//!
//! ```text
//! ┌──────────────┐   users batch    ┌──────────────┐
//! │ Remote store │ ───────────────► │  Reconciler  │ ──► UserDirectory
//! │  snapshots   │                  └──────────────┘        │
//! │              │   conversations  ┌──────────────┐        │
//! │              │ ───────────────► │  Projector   │ ◄──────┘
//! └──────────────┘                  └──────┬───────┘
//!                                          │
//!                                          ▼
//!                          ordered Vec<Conversation>
//! ```
//!
//! Everything in this crate is synchronous and side-effect free apart from
//! `log` diagnostics for dropped records.
//!
//! ## Modules
//!
//! - [`model`]: Immutable entity types (User, Message, Conversation, …)
//! - [`document`]: Raw documents and the typed records they decode into
//! - [`display`]: Derived display fields (titles, summary text/subtext)
//! - [`reconcile`]: Batch validation of users and messages
//! - [`projector`]: Conversation resolution and ordering

pub mod model;
pub mod document;
pub mod display;
pub mod reconcile;
pub mod projector;

// Re-exports for convenience
pub use model::{
    Attachment, AttachmentKind, Conversation, ConversationId, LatestMessageSummary, Message,
    MessageId, Recording, Timestamp, User, UserId,
};
pub use document::{
    AttachmentRecord, ConversationRecord, Document, DocumentBatch, MessageRecord, RecordError,
    RecordingRecord, UserRecord,
};
pub use reconcile::{reconcile_messages, reconcile_users, UserDirectory};
pub use projector::{conversation_order, project_conversations, ConversationProjector};
pub use url::Url;
