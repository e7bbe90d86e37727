use crate::presence::TypingState;
use crate::reactions::ReactionSummary;
use campus_chat_messaging::{ConversationId, Message, MessageId, UserId};
use std::collections::BTreeMap;

/// Read-only snapshot of a chat session, republished after every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatView {
    pub conversation_id: ConversationId,
    pub messages: Vec<Message>,
    pub reactions: BTreeMap<MessageId, ReactionSummary>,
    pub typing: TypingState,
    /// False when the typing channel could not be set up.
    pub typing_available: bool,
    /// True until the first history page has landed.
    pub loading: bool,
    pub has_more_history: bool,
}

impl ChatView {
    pub fn empty(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
            reactions: BTreeMap::new(),
            typing: TypingState::default(),
            typing_available: true,
            loading: true,
            has_more_history: false,
        }
    }

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == id)
    }

    pub fn reaction_count(&self, id: &MessageId) -> usize {
        self.reactions.get(id).map_or(0, ReactionSummary::count)
    }

    pub fn has_reacted(&self, id: &MessageId, user_id: &UserId) -> bool {
        self.reactions
            .get(id)
            .is_some_and(|summary| summary.contains(user_id))
    }

    pub fn failed_messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|message| message.is_failed())
    }

    pub fn typing_label(&self) -> Option<String> {
        if !self.typing.is_other_typing {
            return None;
        }
        let name = self.typing.typing_user_name.as_deref().unwrap_or("Someone");
        Some(format!("{name} is typing..."))
    }
}
