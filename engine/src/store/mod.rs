//! Collaborators consumed by the engine: message, reaction, media and conversation stores and the
//! realtime bus. Only the contract lives here; `LocalBackend` is a sled-backed implementation of
//! all of them for development and tests.

mod bus;
mod faults;
mod local;

pub use bus::RealtimeHub;
pub use faults::{Fault, FaultPlan, Operation};
pub use local::LocalBackend;

use async_trait::async_trait;
use campus_chat_messaging::{
    ConversationId, Message, MessageEvent, MessageId, MessageMetadata, ReactionChange,
    ReactionKind, ReactionRecord, TypingSignal, UserId,
};
use futures::stream::BoxStream;
use std::sync::Arc;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("rejected by store: {0}")]
    Rejected(String),
    #[error("record already exists")]
    DuplicateConflict,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("channel unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Position in a conversation's history; a page holds messages strictly older than it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryCursor {
    pub created_ms: i64,
    pub message_id: MessageId,
}

impl HistoryCursor {
    pub fn before(message: &Message) -> Self {
        Self {
            created_ms: message.created_ms,
            message_id: message.id.clone(),
        }
    }
}

/// One page of history in chronological order.
#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

/// Result of an attachment upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedMedia {
    pub path: String,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        content: &str,
        metadata: &MessageMetadata,
    ) -> StoreResult<Message>;

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        cursor: Option<&HistoryCursor>,
        limit: usize,
    ) -> StoreResult<MessagePage>;

    async fn mark_read(&self, conversation_id: &ConversationId, user_id: &UserId)
        -> StoreResult<()>;

    /// Retract a message for everyone. Returns the updated record.
    async fn delete_message(&self, message_id: &MessageId, user_id: &UserId)
        -> StoreResult<Message>;
}

#[async_trait]
pub trait ReactionStore: Send + Sync {
    /// Fails with `StoreError::DuplicateConflict` when the reaction already exists.
    async fn add_reaction(&self, record: &ReactionRecord) -> StoreResult<()>;

    async fn remove_reaction(&self, record: &ReactionRecord) -> StoreResult<()>;

    async fn list_reactions(
        &self,
        message_ids: &[MessageId],
        kind: ReactionKind,
    ) -> StoreResult<Vec<ReactionRecord>>;
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn upload(&self, local_uri: &str, owner: &UserId) -> StoreResult<UploadedMedia>;

    async fn signed_url(&self, path: &str) -> StoreResult<String>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Idempotent: the same pair of users always maps to the same conversation.
    async fn find_or_create_direct(&self, user_a: &UserId, user_b: &UserId)
        -> StoreResult<ConversationId>;

    async fn find_group_by_name(&self, name: &str) -> StoreResult<Option<ConversationId>>;

    /// Fails with `StoreError::DuplicateConflict` when a group with that name exists.
    async fn create_group(&self, name: &str, creator: &UserId) -> StoreResult<ConversationId>;

    async fn add_participant(&self, conversation_id: &ConversationId, user_id: &UserId)
        -> StoreResult<()>;

    async fn is_participant(&self, conversation_id: &ConversationId, user_id: &UserId)
        -> StoreResult<bool>;
}

#[async_trait]
pub trait RealtimeBus: Send + Sync {
    /// Typing broadcasts for one conversation, excluding those sent by `local_user`.
    async fn subscribe_typing(
        &self,
        conversation_id: &ConversationId,
        local_user: &UserId,
    ) -> StoreResult<BoxStream<'static, TypingSignal>>;

    async fn broadcast_typing(&self, signal: TypingSignal) -> StoreResult<()>;

    /// Row changes on the reaction table, filtered by kind.
    async fn subscribe_reactions(
        &self,
        kind: ReactionKind,
    ) -> StoreResult<BoxStream<'static, ReactionChange>>;

    /// Row changes on the message table of one conversation.
    async fn subscribe_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> StoreResult<BoxStream<'static, MessageEvent>>;
}

/// The full set of collaborators a session or resolver needs.
#[derive(Clone)]
pub struct Backends {
    pub messages: Arc<dyn MessageStore>,
    pub reactions: Arc<dyn ReactionStore>,
    pub media: Arc<dyn MediaStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub bus: Arc<dyn RealtimeBus>,
}

impl Backends {
    pub fn from_local(backend: Arc<LocalBackend>) -> Self {
        Self {
            messages: backend.clone(),
            reactions: backend.clone(),
            media: backend.clone(),
            conversations: backend.clone(),
            bus: backend,
        }
    }
}
