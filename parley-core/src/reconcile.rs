//! Entity reconciliation: raw document batches → validated entities.
//!
//! Every function here works at record granularity. A document that fails
//! to decode is logged at `warn` and skipped; the rest of the batch is
//! still returned. Nothing in this module returns an error to its caller.

use std::collections::BTreeMap;

use crate::document::{lenient_url, Document, MessageRecord, RecordError, UserRecord};
use crate::model::{Message, MessageId, User, UserId};

/// The user lists published for one users snapshot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UserDirectory {
    /// Every known user, the actor first and exactly once
    pub all: Vec<User>,
    /// Every known user except the actor
    pub others: Vec<User>,
}

impl UserDirectory {
    /// Directory containing only the actor, used before the first snapshot.
    pub fn with_actor(actor: &User) -> Self {
        let mut actor = actor.clone();
        actor.is_current_user = true;
        Self {
            all: vec![actor],
            others: Vec::new(),
        }
    }
}

/// Decode one `users` document. `is_current_user` is always `false`;
/// only [`reconcile_users`] marks the actor.
pub fn user_from_document(doc: &Document) -> Result<User, RecordError> {
    let record: UserRecord = doc.decode()?;
    Ok(User {
        id: UserId::new(doc.id.clone()),
        name: record.nickname,
        avatar_url: lenient_url(record.avatar_url.as_ref()),
        is_current_user: false,
    })
}

/// Reconcile a full `users` snapshot against the externally supplied actor.
///
/// The actor's own document, when present, refreshes its name and avatar
/// but it is flagged from `actor`, never from the store. Duplicate ids keep
/// the last document in the batch.
pub fn reconcile_users(batch: &[Document], actor: &User) -> UserDirectory {
    let mut by_id: BTreeMap<UserId, User> = BTreeMap::new();
    let mut dropped = 0usize;

    for doc in batch {
        match user_from_document(doc) {
            Ok(user) => {
                by_id.insert(user.id.clone(), user);
            }
            Err(e) => {
                dropped += 1;
                log::warn!("Dropping user record: {e}");
            }
        }
    }

    let mut me = by_id.remove(&actor.id).unwrap_or_else(|| actor.clone());
    me.is_current_user = true;

    let mut others: Vec<User> = by_id.into_values().collect();
    others.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

    let mut all = Vec::with_capacity(others.len() + 1);
    all.push(me);
    all.extend(others.iter().cloned());

    if dropped > 0 {
        log::debug!("Reconciled {} users ({dropped} dropped)", all.len());
    }

    UserDirectory { all, others }
}

/// Decode one message document from a conversation's sub-collection.
pub fn message_from_document(doc: &Document) -> Result<Message, RecordError> {
    let record: MessageRecord = doc.decode()?;
    let attachments = record
        .attachments
        .into_iter()
        .map(|a| a.into_attachment(&doc.id))
        .collect::<Result<Vec<_>, _>>()?;
    let recording = record
        .recording
        .map(|r| r.into_recording(&doc.id))
        .transpose()?;

    Ok(Message {
        id: MessageId::new(doc.id.clone()),
        user_id: record.user_id,
        created_at: record.created_at,
        text: record.text,
        attachments,
        recording,
    })
}

/// Reconcile a message snapshot, oldest first (ties broken by id).
pub fn reconcile_messages(batch: &[Document]) -> Vec<Message> {
    let mut messages: Vec<Message> = batch
        .iter()
        .filter_map(|doc| match message_from_document(doc) {
            Ok(message) => Some(message),
            Err(e) => {
                log::warn!("Dropping message record: {e}");
                None
            }
        })
        .collect();

    messages.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    messages
}
