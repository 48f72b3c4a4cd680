//! Immutable entity types shared by the reconciler, projector and sync layer.
//!
//! Entities are plain data. They are only ever produced by the
//! [`reconcile`](crate::reconcile) and [`projector`](crate::projector)
//! modules, which enforce the invariants documented on each type.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;
use url::Url;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Stable identity of a user document.
    UserId
);
string_id!(
    /// Document id of a conversation.
    ConversationId
);
string_id!(
    /// Document id of a message inside a conversation's sub-collection.
    MessageId
);

// ───────────────────────────────────────────────────────────────────
// Timestamps
// ───────────────────────────────────────────────────────────────────

/// Milliseconds since the Unix epoch, as assigned by the remote store.
///
/// Decodes from either an integer (milliseconds) or the store's native
/// `{ "seconds": …, "nanoseconds": … }` object. Always encodes as an integer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "WireTimestamp", into = "i64")]
pub struct Timestamp(i64);

impl Timestamp {
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(i64::try_from(millis).unwrap_or(i64::MAX))
    }

    pub const fn as_millis(self) -> i64 {
        self.0
    }
}

impl From<Timestamp> for i64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Millis(i64),
    Parts { seconds: i64, nanoseconds: i64 },
}

impl From<WireTimestamp> for Timestamp {
    fn from(wire: WireTimestamp) -> Self {
        match wire {
            WireTimestamp::Millis(ms) => Self(ms),
            WireTimestamp::Parts { seconds, nanoseconds } => {
                Self(seconds.saturating_mul(1_000).saturating_add(nanoseconds / 1_000_000))
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Users
// ───────────────────────────────────────────────────────────────────

/// A chat participant.
///
/// `is_current_user` is never read from the store: the reconciler sets it
/// for the actor supplied by the identity provider and nobody else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub avatar_url: Option<Url>,
    pub is_current_user: bool,
}

impl User {
    pub fn new(id: impl Into<UserId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar_url: None,
            is_current_user: false,
        }
    }

    /// The local actor, as supplied by the identity provider.
    pub fn current(id: impl Into<UserId>, name: impl Into<String>) -> Self {
        Self {
            is_current_user: true,
            ..Self::new(id, name)
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Messages
// ───────────────────────────────────────────────────────────────────

/// Type of media carried by an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Video,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub kind: AttachmentKind,
    pub url: Url,
    pub thumbnail_url: Url,
}

/// A voice recording attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    /// Length in seconds
    pub duration: f64,
    pub waveform_samples: Vec<f64>,
    pub url: Option<Url>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub user_id: UserId,
    pub created_at: Timestamp,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub recording: Option<Recording>,
}

// ───────────────────────────────────────────────────────────────────
// Conversations
// ───────────────────────────────────────────────────────────────────

/// Display-oriented summary of the most recent message in a conversation.
///
/// Only the projector builds these; the sender is resolved to a name at
/// projection time, so a summary with an unknown sender never exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestMessageSummary {
    pub sender_name: String,
    pub created_at: Timestamp,
    /// `None` when the message text was empty
    pub text: Option<String>,
    /// Label for non-text content (attachment kind or voice recording)
    pub subtext: Option<String>,
}

/// A fully resolved conversation as published to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    /// Participants resolved against the current user set, in stored order
    pub users: Vec<User>,
    /// One entry per resolved participant
    pub users_unread_count_info: BTreeMap<UserId, u32>,
    pub is_group: bool,
    pub picture_url: Option<Url>,
    pub title: String,
    pub latest_message: Option<LatestMessageSummary>,
}

impl Conversation {
    /// Unread count for `user`, zero if they are not a participant.
    pub fn unread_count(&self, user: &UserId) -> u32 {
        self.users_unread_count_info.get(user).copied().unwrap_or(0)
    }

    /// Participants other than the local actor.
    pub fn other_users(&self) -> impl Iterator<Item = &User> {
        self.users.iter().filter(|u| !u.is_current_user)
    }

    pub fn has_participant(&self, user: &UserId) -> bool {
        self.users.iter().any(|u| &u.id == user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_from_millis() {
        let ts: Timestamp = serde_json::from_value(serde_json::json!(1_700_000_000_123i64)).unwrap();
        assert_eq!(ts.as_millis(), 1_700_000_000_123);
    }

    #[test]
    fn test_timestamp_from_store_parts() {
        let ts: Timestamp = serde_json::from_value(serde_json::json!({
            "seconds": 1_700_000_000i64,
            "nanoseconds": 123_456_789i64,
        }))
        .unwrap();
        assert_eq!(ts.as_millis(), 1_700_000_000_123);
    }

    #[test]
    fn test_timestamp_encodes_as_integer() {
        let value = serde_json::to_value(Timestamp::from_millis(42)).unwrap();
        assert_eq!(value, serde_json::json!(42));
    }

    #[test]
    fn test_timestamp_rejects_text() {
        let result: Result<Timestamp, _> = serde_json::from_value(serde_json::json!("yesterday"));
        assert!(result.is_err());
    }

    #[test]
    fn test_current_user_flag() {
        assert!(User::current("u1", "Me").is_current_user);
        assert!(!User::new("u2", "Bob").is_current_user);
    }

    #[test]
    fn test_unread_count_defaults_to_zero() {
        let conv = Conversation {
            id: "c1".into(),
            users: vec![User::current("u1", "Me"), User::new("u2", "Bob")],
            users_unread_count_info: BTreeMap::from([(UserId::from("u1"), 3)]),
            is_group: false,
            picture_url: None,
            title: String::new(),
            latest_message: None,
        };
        assert_eq!(conv.unread_count(&"u1".into()), 3);
        assert_eq!(conv.unread_count(&"u2".into()), 0);
        assert_eq!(conv.other_users().count(), 1);
        assert!(conv.has_participant(&"u2".into()));
        assert!(!conv.has_participant(&"u3".into()));
    }
}
