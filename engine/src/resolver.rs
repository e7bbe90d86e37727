//! Maps a chat target to a conversation id, creating the conversation when needed.

use crate::store::{Backends, StoreError};
use campus_chat_messaging::{ChatTarget, ConversationId, LocalUser, MessageMetadata};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("cannot open a direct chat with yourself")]
    SelfConversation,
    #[error("group name is empty")]
    EmptyGroupName,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Resolves targets on behalf of one local user.
///
/// Concurrent calls for the same logical target share a single lookup, and a resolved id is
/// reused for the lifetime of the resolver. A failed lookup is not cached.
pub struct ConversationResolver {
    backends: Backends,
    user: LocalUser,
    resolved: Mutex<HashMap<ChatTarget, Arc<OnceCell<ConversationId>>>>,
}

impl ConversationResolver {
    pub fn new(backends: Backends, user: LocalUser) -> Self {
        Self {
            backends,
            user,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, target: &ChatTarget) -> Result<ConversationId, ResolveError> {
        let cell = {
            let mut resolved = self.resolved.lock().await;
            resolved.entry(target.dedupe_key()).or_default().clone()
        };
        let id = cell.get_or_try_init(|| self.lookup(target)).await?;
        Ok(id.clone())
    }

    async fn lookup(&self, target: &ChatTarget) -> Result<ConversationId, ResolveError> {
        match target {
            ChatTarget::Direct(peer) => {
                if peer == &self.user.id {
                    return Err(ResolveError::SelfConversation);
                }
                let id = self
                    .backends
                    .conversations
                    .find_or_create_direct(&self.user.id, peer)
                    .await?;
                info!(conversation_id = %id, %peer, "direct conversation resolved");
                Ok(id)
            }
            ChatTarget::Group(name) => self.resolve_group(name).await,
            ChatTarget::Conversation(id) => Ok(id.clone()),
        }
    }

    async fn resolve_group(&self, name: &str) -> Result<ConversationId, ResolveError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ResolveError::EmptyGroupName);
        }

        let conversations = &self.backends.conversations;
        if let Some(id) = conversations.find_group_by_name(name).await? {
            self.ensure_member(&id).await?;
            info!(conversation_id = %id, group = name, "group conversation resolved");
            return Ok(id);
        }

        match conversations.create_group(name, &self.user.id).await {
            Ok(id) => {
                match conversations.add_participant(&id, &self.user.id).await {
                    Ok(()) | Err(StoreError::DuplicateConflict) => {}
                    Err(err) => return Err(err.into()),
                }
                info!(conversation_id = %id, group = name, "group conversation created");
                Ok(id)
            }
            Err(StoreError::DuplicateConflict) => {
                // Someone else created it between our lookup and our create.
                let id = conversations
                    .find_group_by_name(name)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("group {name}")))?;
                self.ensure_member(&id).await?;
                Ok(id)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn ensure_member(&self, id: &ConversationId) -> Result<(), ResolveError> {
        let conversations = &self.backends.conversations;
        if conversations.is_participant(id, &self.user.id).await? {
            return Ok(());
        }
        match conversations.add_participant(id, &self.user.id).await {
            Ok(()) => {}
            Err(StoreError::DuplicateConflict) => {
                debug!(conversation_id = %id, "already a participant");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        let content = format!("{} joined the chat", self.user.display_name());
        if let Err(err) = self
            .backends
            .messages
            .send_message(id, &self.user.id, &content, &MessageMetadata::system("joined"))
            .await
        {
            warn!(%err, conversation_id = %id, "failed to post join message");
        }
        Ok(())
    }
}
