//! Mutation gateway: write operations against the remote store.
//!
//! Writes never touch the published projection directly. Most operations
//! rely on the push snapshot that follows an acknowledged write; deleting a
//! conversation additionally forces a refresh so the row disappears without
//! waiting on push latency. A failed write is returned to the caller and
//! not retried.
//!
//! Writes address conversations by id only. A conversation the store has
//! acknowledged can be written to before its push reaches the projection.

use parley_core::{
    reconcile_messages, Attachment, AttachmentRecord, Conversation, ConversationId,
    ConversationRecord, Message, MessageId, MessageRecord, RecordError, Recording,
    RecordingRecord, Timestamp, Url, UserId,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::coordinator::{SyncCoordinator, SyncError};
use crate::store::{
    bounded, messages_collection, set_fields, FieldValue, Fields, Query, RemoteStore, StoreError,
    CONVERSATIONS,
};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("conversation {0} does not exist")]
    ConversationNotFound(ConversationId),
    #[error(transparent)]
    Record(#[from] RecordError),
    /// The message was stored but the conversation update failed, so its
    /// latest message and unread counts are stale.
    #[error("message {message_id} stored but conversation update failed: {source}")]
    PartialSend {
        message_id: MessageId,
        source: StoreError,
    },
    #[error("failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A message composed by the local actor, before it is written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DraftMessage {
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub recording: Option<Recording>,
}

impl DraftMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_recording(mut self, recording: Recording) -> Self {
        self.recording = Some(recording);
        self
    }

    fn into_record(self, sender: UserId, created_at: Timestamp) -> MessageRecord {
        MessageRecord {
            user_id: sender,
            created_at,
            text: self.text,
            attachments: self.attachments.iter().map(AttachmentRecord::from).collect(),
            recording: self.recording.as_ref().map(RecordingRecord::from),
        }
    }
}

/// Write operations on behalf of the coordinator's actor.
pub struct MutationGateway {
    coordinator: Arc<SyncCoordinator>,
}

impl MutationGateway {
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Start a conversation between the actor and `participants`.
    ///
    /// A one-to-one conversation that is already projected is reused
    /// without writing.
    pub async fn create_conversation(
        &self,
        participants: &[UserId],
        title: &str,
        picture_url: Option<&Url>,
    ) -> Result<ConversationId, GatewayError> {
        let actor = &self.coordinator.actor().id;
        let mut members = vec![actor.clone()];
        for id in participants {
            if !members.contains(id) {
                members.push(id.clone());
            }
        }
        let is_group = members.len() > 2;

        if !is_group {
            let state = self.coordinator.snapshot();
            if let Some(existing) = state
                .conversations
                .iter()
                .find(|c| !c.is_group && same_members(c, &members))
            {
                log::debug!("Reusing conversation {}", existing.id);
                return Ok(existing.id.clone());
            }
        }

        let unread: BTreeMap<&str, u32> = members.iter().map(|id| (id.as_str(), 0)).collect();
        let mut document = json!({
            "users": members,
            "usersUnreadCountInfo": unread,
            "isGroup": is_group,
            "title": title,
        });
        if let Some(url) = picture_url {
            document["pictureURL"] = Value::String(url.to_string());
        }

        let id = bounded(
            self.timeout(),
            self.store().write(CONVERSATIONS, None, set_fields(document)),
        )
        .await?;
        log::info!("Created conversation {id} with {} members", members.len());
        Ok(ConversationId::new(id))
    }

    /// Append a message and make it the conversation's latest message.
    ///
    /// Every stored participant except the sender gets one more unread
    /// message, whether or not they resolve to a known user. The projection
    /// updates when the store pushes the change.
    ///
    /// The message and the conversation update are two separate writes. If
    /// only the second fails, the message is already stored and
    /// [`GatewayError::PartialSend`] carries its id.
    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        draft: DraftMessage,
    ) -> Result<MessageId, GatewayError> {
        let participants = self.stored_participants(conversation_id).await?;
        let sender = self.coordinator.actor().id.clone();
        let record = draft.into_record(sender.clone(), Timestamp::now());
        let payload = serde_json::to_value(&record)?;

        let message_id = bounded(
            self.timeout(),
            self.store().write(
                &messages_collection(conversation_id),
                None,
                set_fields(payload.clone()),
            ),
        )
        .await
        .map(MessageId::new)?;

        let mut update = Fields::from([("latestMessage".to_string(), FieldValue::Set(payload))]);
        for participant in participants.iter().filter(|id| **id != sender) {
            update.insert(unread_path(participant), FieldValue::Increment(1));
        }
        if let Err(source) = bounded(
            self.timeout(),
            self.store().write(CONVERSATIONS, Some(conversation_id.as_str()), update),
        )
        .await
        {
            log::warn!("Message {message_id} stored but {conversation_id} not updated: {source}");
            return Err(GatewayError::PartialSend { message_id, source });
        }

        log::debug!("Sent message {message_id} to {conversation_id}");
        Ok(message_id)
    }

    /// Delete a conversation and refresh the projection right away.
    ///
    /// Succeeds once the store acknowledges the delete. A failed refresh
    /// is only logged; the next push removes the row.
    pub async fn delete_conversation(&self, conversation_id: &ConversationId) -> Result<(), GatewayError> {
        bounded(
            self.timeout(),
            self.store().delete(CONVERSATIONS, conversation_id.as_str()),
        )
        .await?;
        log::info!("Deleted conversation {conversation_id}");

        if let Err(e) = self.coordinator.refresh_conversations().await {
            log::warn!("Refresh after deleting {conversation_id} failed: {e}");
        }
        Ok(())
    }

    /// Reset the actor's unread count for a conversation.
    pub async fn mark_read(&self, conversation_id: &ConversationId) -> Result<(), GatewayError> {
        let actor = &self.coordinator.actor().id;
        let update = Fields::from([(unread_path(actor), FieldValue::Set(json!(0)))]);

        bounded(
            self.timeout(),
            self.store().write(CONVERSATIONS, Some(conversation_id.as_str()), update),
        )
        .await?;
        Ok(())
    }

    /// Fetch a conversation's messages, oldest first.
    pub async fn load_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, GatewayError> {
        let batch = bounded(
            self.timeout(),
            self.store().query(&Query::messages_of(conversation_id)),
        )
        .await?;
        Ok(reconcile_messages(&batch))
    }

    /// Participant ids as stored, in order and without repeats.
    async fn stored_participants(&self, id: &ConversationId) -> Result<Vec<UserId>, GatewayError> {
        let doc = match bounded(self.timeout(), self.store().fetch(CONVERSATIONS, id.as_str())).await {
            Ok(doc) => doc,
            Err(StoreError::NotFound { .. }) => {
                return Err(GatewayError::ConversationNotFound(id.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        let record: ConversationRecord = doc.decode()?;

        let mut participants: Vec<UserId> = Vec::with_capacity(record.users.len());
        for user in record.users {
            if !participants.contains(&user) {
                participants.push(user);
            }
        }
        Ok(participants)
    }

    fn store(&self) -> &Arc<dyn RemoteStore> {
        self.coordinator.store()
    }

    fn timeout(&self) -> std::time::Duration {
        self.coordinator.config().remote_timeout
    }
}

fn unread_path(user: &UserId) -> String {
    format!("usersUnreadCountInfo.{user}")
}

fn same_members(conversation: &Conversation, members: &[UserId]) -> bool {
    conversation.users.len() == members.len()
        && members.iter().all(|id| conversation.has_participant(id))
}
