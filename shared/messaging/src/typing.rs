//! Typing presence broadcasts.

use serde::{Deserialize, Serialize};

use crate::{ConversationId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub user_id: UserId,
    pub user_name: Option<String>,
    pub user_avatar: Option<String>,
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTypingPayload {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
}

/// Broadcast event on a conversation's typing channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum TypingSignal {
    Typing(TypingPayload),
    StopTyping(StopTypingPayload),
}

impl TypingSignal {
    pub fn typing(
        conversation_id: ConversationId,
        user_id: UserId,
        user_name: Option<String>,
        user_avatar: Option<String>,
    ) -> Self {
        TypingSignal::Typing(TypingPayload {
            user_id,
            user_name,
            user_avatar,
            conversation_id,
        })
    }

    pub fn stop(conversation_id: ConversationId, user_id: UserId) -> Self {
        TypingSignal::StopTyping(StopTypingPayload {
            user_id,
            conversation_id,
        })
    }

    pub fn user_id(&self) -> &UserId {
        match self {
            TypingSignal::Typing(payload) => &payload.user_id,
            TypingSignal::StopTyping(payload) => &payload.user_id,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            TypingSignal::Typing(payload) => &payload.conversation_id,
            TypingSignal::StopTyping(payload) => &payload.conversation_id,
        }
    }
}
