//! Chat targets and the identity of the local user.

use serde::{Deserialize, Serialize};

use crate::{ConversationId, UserId};

/// What the user asked to chat with, before it is mapped to a conversation id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatTarget {
    /// One-to-one chat with another user.
    Direct(UserId),
    /// Group chat keyed by a logical name such as a course section label.
    Group(String),
    /// A conversation that is already known.
    Conversation(ConversationId),
}

impl ChatTarget {
    pub fn group(name: impl Into<String>) -> Self {
        ChatTarget::Group(name.into())
    }

    /// Key under which two requests count as the same logical target.
    ///
    /// Group names are looked up case-insensitively, so `"CS 101"` and `"cs 101 "` collapse.
    pub fn dedupe_key(&self) -> ChatTarget {
        match self {
            ChatTarget::Group(name) => ChatTarget::Group(normalize_group_name(name)),
            other => other.clone(),
        }
    }
}

pub fn normalize_group_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// The account the engine runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    pub id: UserId,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl LocalUser {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            display_name: None,
            avatar_url: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_avatar(mut self, url: impl Into<String>) -> Self {
        self.avatar_url = Some(url.into());
        self
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or("Someone")
    }
}
