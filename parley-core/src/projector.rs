//! Conversation projection: raw conversation documents → resolved, ordered
//! conversation list.
//!
//! For each document the projector:
//!
//! 1. decodes a [`ConversationRecord`] (dropping the document on failure),
//! 2. resolves participant ids against the user set, skipping unknown and
//!    repeated ids,
//! 3. normalizes the unread map to one entry per resolved participant,
//! 4. builds a [`LatestMessageSummary`] when the embedded payload decodes and
//!    its sender resolves,
//!
//! then de-duplicates by id (last document wins) and sorts with
//! [`conversation_order`].
//!
//! The projection is rebuilt from scratch for every batch; there is no
//! incremental patching.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::display::{summary_subtext, summary_text};
use crate::document::{ConversationRecord, Document, MessageRecord, RecordError};
use crate::model::{Conversation, ConversationId, LatestMessageSummary, User, UserId};

/// Resolves conversation documents against a fixed user set.
pub struct ConversationProjector<'a> {
    users: HashMap<&'a UserId, &'a User>,
}

impl<'a> ConversationProjector<'a> {
    /// `users` is the full user set, actor included.
    pub fn new(users: &'a [User]) -> Self {
        Self {
            users: users.iter().map(|u| (&u.id, u)).collect(),
        }
    }

    /// Project a full conversations snapshot.
    pub fn project(&self, batch: &[Document]) -> Vec<Conversation> {
        let mut by_id: BTreeMap<ConversationId, Conversation> = BTreeMap::new();

        for doc in batch {
            match self.project_one(doc) {
                Ok(conversation) => {
                    by_id.insert(conversation.id.clone(), conversation);
                }
                Err(e) => log::warn!("Dropping conversation record: {e}"),
            }
        }

        let mut conversations: Vec<Conversation> = by_id.into_values().collect();
        conversations.sort_by(conversation_order);
        conversations
    }

    /// Project a single conversation document.
    pub fn project_one(&self, doc: &Document) -> Result<Conversation, RecordError> {
        let record: ConversationRecord = doc.decode()?;

        let mut seen = HashSet::new();
        let users: Vec<User> = record
            .users
            .iter()
            .filter(|id| seen.insert(*id))
            .filter_map(|id| self.users.get(id).map(|u| (*u).clone()))
            .collect();

        let users_unread_count_info = users
            .iter()
            .map(|u| {
                let stored = record.users_unread_count_info.get(&u.id).copied().unwrap_or(0);
                (u.id.clone(), clamp_count(stored))
            })
            .collect();

        let latest_message = match record.latest_message(&doc.id) {
            None => None,
            Some(Ok(payload)) => self.summarize(&doc.id, payload),
            Some(Err(e)) => {
                log::warn!("Omitting latest message: {e}");
                None
            }
        };

        Ok(Conversation {
            id: ConversationId::new(doc.id.clone()),
            users,
            users_unread_count_info,
            is_group: record.is_group,
            picture_url: record.picture_url(),
            title: record.title,
            latest_message,
        })
    }

    /// Build the summary for an embedded latest-message payload.
    ///
    /// Returns `None` when the sender is unknown or the payload carries
    /// invalid attachment/recording data.
    fn summarize(&self, doc_id: &str, payload: MessageRecord) -> Option<LatestMessageSummary> {
        let Some(sender) = self.users.get(&payload.user_id) else {
            log::warn!(
                "Omitting latest message of {doc_id}: unknown sender {}",
                payload.user_id
            );
            return None;
        };

        let attachments = payload
            .attachments
            .into_iter()
            .map(|a| a.into_attachment(doc_id))
            .collect::<Result<Vec<_>, _>>();
        let recording = payload
            .recording
            .map(|r| r.into_recording(doc_id))
            .transpose();

        match (attachments, recording) {
            (Ok(attachments), Ok(recording)) => Some(LatestMessageSummary {
                sender_name: sender.name.clone(),
                created_at: payload.created_at,
                text: summary_text(&payload.text),
                subtext: summary_subtext(&attachments, recording.as_ref()),
            }),
            (Err(e), _) | (_, Err(e)) => {
                log::warn!("Omitting latest message: {e}");
                None
            }
        }
    }
}

/// Project a conversations snapshot against `users` (actor included).
pub fn project_conversations(users: &[User], batch: &[Document]) -> Vec<Conversation> {
    ConversationProjector::new(users).project(batch)
}

/// Total order for the published conversation list.
///
/// Most recent latest message first; conversations without one go last.
/// Ties (equal timestamps, or both without a message) fall back to the
/// display title, compared case-sensitively, then to the id.
pub fn conversation_order(a: &Conversation, b: &Conversation) -> Ordering {
    let by_date = match (&a.latest_message, &b.latest_message) {
        (Some(x), Some(y)) => y.created_at.cmp(&x.created_at),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_date
        .then_with(|| a.display_title().cmp(b.display_title()))
        .then_with(|| a.id.cmp(&b.id))
}

fn clamp_count(stored: i64) -> u32 {
    u32::try_from(stored.max(0)).unwrap_or(u32::MAX)
}
