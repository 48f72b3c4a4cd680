//! Derived display fields.
//!
//! Pure functions of the entity model. The projector calls these when it
//! builds summaries and orders conversations; UIs call them when rendering.

use crate::model::{Attachment, AttachmentKind, Conversation, LatestMessageSummary, Recording};

/// Rendered in place of an empty message text.
pub const NO_TEXT: &str = "no text";

/// Subtext for a message carrying only a voice recording.
pub const VOICE_RECORDING_LABEL: &str = "Voice recording";

impl AttachmentKind {
    pub fn label(self) -> &'static str {
        match self {
            AttachmentKind::Image => "Image",
            AttachmentKind::Video => "Video",
        }
    }
}

/// Summary text for a message: empty text collapses to `None`.
pub fn summary_text(text: &str) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Summary subtext: the first attachment's label, else the recording label.
pub fn summary_subtext(attachments: &[Attachment], recording: Option<&Recording>) -> Option<String> {
    if let Some(first) = attachments.first() {
        return Some(first.kind.label().to_string());
    }
    recording.map(|_| VOICE_RECORDING_LABEL.to_string())
}

impl LatestMessageSummary {
    /// Text to render, substituting [`NO_TEXT`] for an empty message.
    pub fn display_text(&self) -> &str {
        self.text.as_deref().unwrap_or(NO_TEXT)
    }
}

impl Conversation {
    /// Title shown in the conversation list.
    ///
    /// A group with a non-empty title uses it; otherwise the first other
    /// participant's name, falling back to the stored title.
    pub fn display_title(&self) -> &str {
        if self.is_group && !self.title.is_empty() {
            return &self.title;
        }
        match self.other_users().next() {
            Some(user) => &user.name,
            None => &self.title,
        }
    }
}
