//! Published projection and per-query subscription state.

use parley_core::{Conversation, ConversationId, User};
use std::fmt;
use std::sync::Arc;

/// The two live queries the coordinator owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Users,
    Conversations,
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKind::Users => f.write_str("users"),
            QueryKind::Conversations => f.write_str("conversations"),
        }
    }
}

/// Lifecycle of one live query.
///
/// ```text
/// Unsubscribed ──► Subscribing ──► Active ◄──► Error
///       ▲                            │           │
///       └────────────────────────────┴───────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Active,
    /// Last event was a failure; the previous projection is still published
    Error,
}

/// Immutable view handed to observers.
///
/// Each republish swaps in a new value; the vectors are shared, never
/// mutated in place.
#[derive(Debug, Clone, Default)]
pub struct ChatState {
    /// Everyone except the local actor
    pub users: Arc<Vec<User>>,
    /// Everyone, the local actor first and exactly once
    pub all_users: Arc<Vec<User>>,
    /// Resolved and ordered
    pub conversations: Arc<Vec<Conversation>>,
    /// Bumped on every republish
    pub version: u64,
}

impl ChatState {
    pub(crate) fn initial(actor: &User) -> Self {
        let mut actor = actor.clone();
        actor.is_current_user = true;
        Self {
            all_users: Arc::new(vec![actor]),
            ..Self::default()
        }
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == id)
    }

    pub fn current_user(&self) -> Option<&User> {
        self.all_users.iter().find(|u| u.is_current_user)
    }

    /// Sum of the actor's unread counts across all conversations.
    pub fn total_unread(&self) -> u64 {
        let Some(me) = self.current_user() else {
            return 0;
        };
        self.conversations
            .iter()
            .map(|c| u64::from(c.unread_count(&me.id)))
            .sum()
    }
}
