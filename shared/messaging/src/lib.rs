//! Chat data model shared by the synchronization engine and its collaborators.

pub mod conversation;
pub mod reactions;
pub mod typing;

pub use conversation::{ChatTarget, LocalUser};
pub use reactions::{ReactionChange, ReactionKind, ReactionRecord};
pub use typing::{StopTypingPayload, TypingPayload, TypingSignal};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const TEMP_PREFIX: &str = "temp-";

/// Content shown for an image message sent without a caption.
pub const IMAGE_PLACEHOLDER: &str = "📷 Image";

/// Milliseconds since the Unix epoch.
pub fn timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Identifier assigned to a conversation by the conversation store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Identifier of an account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Message identifier.
///
/// Either a locally generated temporary token (`temp-<timestamp>`) for a message that has not
/// been acknowledged yet, or an opaque id assigned by the message store. Only ids in the
/// hyphenated UUID form count as stable; anything else is never sent to the reaction store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn temporary(timestamp_ms: i64) -> Self {
        Self(format!("{TEMP_PREFIX}{timestamp_ms}"))
    }

    pub fn temporary_image(timestamp_ms: i64) -> Self {
        Self(format!("{TEMP_PREFIX}image-{timestamp_ms}"))
    }

    /// Parse a server-assigned id, rejecting anything that fails the stable-id check.
    pub fn parse_stable(value: &str) -> Result<Self> {
        if is_stable_id(value) {
            Ok(Self(value.to_owned()))
        } else {
            Err(MessagingError::InvalidMessageId(value.to_owned()))
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_PREFIX)
    }

    pub fn is_stable(&self) -> bool {
        is_stable_id(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

fn is_stable_id(value: &str) -> bool {
    // 36 characters rules out the simple, braced and urn spellings `Uuid` also accepts.
    value.len() == 36 && Uuid::try_parse(value).is_ok()
}

/// Local delivery state of a message. Server records carry no status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Failed,
}

/// Why a send ended in the failed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendFailure {
    /// No answer inside the time box; the message may still have been stored.
    Timeout,
    /// The message store refused the message.
    Rejected,
    /// The attachment never made it to the media store.
    Upload,
}

impl SendFailure {
    /// Text shown next to the failed message.
    pub fn advisory(self) -> &'static str {
        match self {
            SendFailure::Timeout => {
                "Sending is taking too long. It might have sent, or you can try again."
            }
            SendFailure::Rejected => "Failed to send message. Please try again.",
            SendFailure::Upload => "Image upload failed. Check your connection and try again.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    System,
}

/// Free-form message metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default)]
    pub kind: MessageKind,
    /// Signed URL of an uploaded image.
    #[serde(default)]
    pub image_url: Option<String>,
    /// Media store path of an uploaded image.
    #[serde(default)]
    pub image_path: Option<String>,
    /// Device-local source of an image; never leaves the client.
    #[serde(default)]
    pub local_uri: Option<String>,
    #[serde(default)]
    pub system_action: Option<String>,
    #[serde(default)]
    pub unsent: bool,
    #[serde(default)]
    pub unsent_by: Option<UserId>,
    #[serde(default)]
    pub unsent_at: Option<i64>,
}

impl MessageMetadata {
    pub fn image(local_uri: impl Into<String>) -> Self {
        let local_uri = local_uri.into();
        Self {
            kind: MessageKind::Image,
            image_url: Some(local_uri.clone()),
            local_uri: Some(local_uri),
            ..Self::default()
        }
    }

    pub fn system(action: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::System,
            system_action: Some(action.into()),
            ..Self::default()
        }
    }

    /// Fill attachment fields the server did not echo back from the local copy.
    pub fn keep_local_attachment(&mut self, local: &MessageMetadata) {
        if local.kind == MessageKind::Image {
            self.kind = MessageKind::Image;
        }
        if self.image_url.is_none() {
            self.image_url = local.image_url.clone();
        }
        if self.image_path.is_none() {
            self.image_path = local.image_path.clone();
        }
        if self.local_uri.is_none() {
            self.local_uri = local.local_uri.clone();
        }
    }

    /// Overlay the fields set in a server update onto this metadata.
    pub fn merge_update(&mut self, update: &MessageMetadata) {
        if update.kind != MessageKind::Text {
            self.kind = update.kind;
        }
        if update.image_url.is_some() {
            self.image_url = update.image_url.clone();
        }
        if update.image_path.is_some() {
            self.image_path = update.image_path.clone();
        }
        if update.system_action.is_some() {
            self.system_action = update.system_action.clone();
        }
        if update.unsent {
            self.unsent = true;
            self.unsent_by = update.unsent_by.clone();
            self.unsent_at = update.unsent_at;
        }
    }
}

/// A chat message as held in the local timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub metadata: MessageMetadata,
    pub created_ms: i64,
    /// Local-only; `None` for a reconciled server record.
    #[serde(default)]
    pub status: Option<DeliveryStatus>,
    /// Local-only; set together with `DeliveryStatus::Failed`.
    #[serde(default)]
    pub failure: Option<SendFailure>,
}

impl Message {
    /// Build a placeholder shown before the message store has answered.
    pub fn optimistic(
        id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: String,
        metadata: MessageMetadata,
    ) -> Self {
        Self {
            id,
            conversation_id,
            sender_id,
            content,
            metadata,
            created_ms: timestamp_ms(),
            status: Some(DeliveryStatus::Sending),
            failure: None,
        }
    }

    pub fn is_optimistic(&self) -> bool {
        self.id.is_temporary()
    }

    pub fn is_unsent(&self) -> bool {
        self.metadata.unsent
    }

    pub fn is_failed(&self) -> bool {
        self.status == Some(DeliveryStatus::Failed)
    }

    /// Effective status; a record without a local status has been delivered.
    pub fn delivery_status(&self) -> DeliveryStatus {
        self.status.unwrap_or(DeliveryStatus::Sent)
    }

    pub fn advisory(&self) -> Option<&'static str> {
        self.failure.map(SendFailure::advisory)
    }

    /// Mark as retracted, keeping the timeline slot.
    pub fn mark_unsent(&mut self, by: UserId, at_ms: i64) {
        self.content.clear();
        self.metadata.unsent = true;
        self.metadata.unsent_by = Some(by);
        self.metadata.unsent_at = Some(at_ms);
    }
}

/// Row-level change on the message table of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageEvent {
    Inserted(Message),
    Updated(Message),
}

impl MessageEvent {
    pub fn message(&self) -> &Message {
        match self {
            MessageEvent::Inserted(message) | MessageEvent::Updated(message) => message,
        }
    }
}

/// Messaging-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("not a stable message id: {0}")]
    InvalidMessageId(String),
}

pub type Result<T> = std::result::Result<T, MessagingError>;
