//! Reaction records as exchanged with the reaction store.

use serde::{Deserialize, Serialize};

use crate::{MessageId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReactionKind {
    #[default]
    Heart,
}

impl ReactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReactionKind::Heart => "heart",
        }
    }
}

/// One user's reaction on one message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReactionRecord {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub kind: ReactionKind,
}

impl ReactionRecord {
    pub fn heart(message_id: MessageId, user_id: UserId) -> Self {
        Self {
            message_id,
            user_id,
            kind: ReactionKind::Heart,
        }
    }
}

/// Row-level change on the reaction table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReactionChange {
    Added(ReactionRecord),
    Removed(ReactionRecord),
}

impl ReactionChange {
    pub fn record(&self) -> &ReactionRecord {
        match self {
            ReactionChange::Added(record) | ReactionChange::Removed(record) => record,
        }
    }
}
