//! Raw documents and the typed records they decode into.
//!
//! The remote store hands out loosely typed key/value documents. Each
//! collection has one structural record type here; a document is decoded
//! into it exactly once, at the reconciler/projector boundary, and nothing
//! downstream touches the raw [`serde_json::Value`] again.
//!
//! ```text
//! Document { id, fields: {..} }
//!        │  decode::<R>()
//!        ▼
//! UserRecord / ConversationRecord / MessageRecord
//!        │  validate urls, resolve ids
//!        ▼
//! User / Conversation / Message
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use url::Url;

use crate::model::{Attachment, AttachmentKind, Recording, Timestamp, UserId};

/// Why a single raw document was rejected.
///
/// These are logged and the record skipped; they never fail a batch.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("document {id} is malformed: {source}")]
    Malformed {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("document {id} has an invalid url in `{field}`: {source}")]
    InvalidUrl {
        id: String,
        field: &'static str,
        #[source]
        source: url::ParseError,
    },
}

/// A raw document as returned by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: Map<String, Value>,
}

/// The full result set of a query at one point in time.
pub type DocumentBatch = Vec<Document>;

impl Document {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Build a document from a JSON object literal. Non-object values
    /// produce a document with no fields.
    pub fn from_json(id: impl Into<String>, value: Value) -> Self {
        let fields = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(id, fields)
    }

    /// Decode the document's fields into a structural record.
    pub fn decode<R: DeserializeOwned>(&self) -> Result<R, RecordError> {
        decode_value(&self.id, Value::Object(self.fields.clone()))
    }
}

pub(crate) fn decode_value<R: DeserializeOwned>(id: &str, value: Value) -> Result<R, RecordError> {
    serde_json::from_value(value).map_err(|source| RecordError::Malformed {
        id: id.to_string(),
        source,
    })
}

/// Parse an optional url field leniently: anything that is not an absolute
/// http(s) url degrades to `None`.
pub(crate) fn lenient_url(value: Option<&Value>) -> Option<Url> {
    let raw = value?.as_str()?;
    let url = Url::parse(raw).ok()?;
    matches!(url.scheme(), "http" | "https").then_some(url)
}

// ───────────────────────────────────────────────────────────────────
// Users
// ───────────────────────────────────────────────────────────────────

/// Structural record for a `users` document.
#[derive(Debug, Clone, Deserialize)]
pub struct UserRecord {
    pub nickname: String,
    /// Kept untyped so a bad value degrades to "no avatar" instead of
    /// rejecting the user.
    #[serde(default, rename = "avatarURL")]
    pub avatar_url: Option<Value>,
    #[serde(default, rename = "deviceId")]
    pub device_id: Option<String>,
}

// ───────────────────────────────────────────────────────────────────
// Messages
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub id: String,
    pub url: String,
    #[serde(default, rename = "thumbURL", skip_serializing_if = "Option::is_none")]
    pub thumb_url: Option<String>,
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
}

impl AttachmentRecord {
    /// Validate urls. The thumbnail falls back to the full url.
    pub fn into_attachment(self, doc_id: &str) -> Result<Attachment, RecordError> {
        let url = Url::parse(&self.url).map_err(|source| RecordError::InvalidUrl {
            id: doc_id.to_string(),
            field: "attachments.url",
            source,
        })?;
        let thumbnail_url = match self.thumb_url {
            Some(thumb) => Url::parse(&thumb).map_err(|source| RecordError::InvalidUrl {
                id: doc_id.to_string(),
                field: "attachments.thumbURL",
                source,
            })?,
            None => url.clone(),
        };
        Ok(Attachment {
            id: self.id,
            kind: self.kind,
            url,
            thumbnail_url,
        })
    }
}

impl From<&Attachment> for AttachmentRecord {
    fn from(attachment: &Attachment) -> Self {
        Self {
            id: attachment.id.clone(),
            url: attachment.url.to_string(),
            thumb_url: Some(attachment.thumbnail_url.to_string()),
            kind: attachment.kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingRecord {
    pub duration: f64,
    #[serde(default)]
    pub waveform_samples: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl RecordingRecord {
    pub fn into_recording(self, doc_id: &str) -> Result<Recording, RecordError> {
        let url = self
            .url
            .map(|raw| Url::parse(&raw))
            .transpose()
            .map_err(|source| RecordError::InvalidUrl {
                id: doc_id.to_string(),
                field: "recording.url",
                source,
            })?;
        Ok(Recording {
            duration: self.duration,
            waveform_samples: self.waveform_samples,
            url,
        })
    }
}

impl From<&Recording> for RecordingRecord {
    fn from(recording: &Recording) -> Self {
        Self {
            duration: recording.duration,
            waveform_samples: recording.waveform_samples.clone(),
            url: recording.url.as_ref().map(Url::to_string),
        }
    }
}

/// Structural record for a message, used both for documents in a
/// conversation's `messages` sub-collection and for the `latestMessage`
/// payload embedded in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub user_id: UserId,
    pub created_at: Timestamp,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording: Option<RecordingRecord>,
}

// ───────────────────────────────────────────────────────────────────
// Conversations
// ───────────────────────────────────────────────────────────────────

/// Structural record for a `conversations` document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub users: Vec<UserId>,
    #[serde(default)]
    pub users_unread_count_info: BTreeMap<UserId, i64>,
    pub is_group: bool,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "pictureURL")]
    pub picture_url: Option<Value>,
    /// Decoded separately: a broken payload only drops the summary.
    #[serde(default)]
    pub latest_message: Option<Value>,
}

impl ConversationRecord {
    pub fn picture_url(&self) -> Option<Url> {
        lenient_url(self.picture_url.as_ref())
    }

    /// Decode the embedded latest-message payload, if any.
    pub fn latest_message(&self, doc_id: &str) -> Option<Result<MessageRecord, RecordError>> {
        match &self.latest_message {
            None | Some(Value::Null) => None,
            Some(value) => Some(decode_value(doc_id, value.clone())),
        }
    }
}
