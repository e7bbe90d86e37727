//! Ordered local timeline with the two-phase optimistic helper.

use campus_chat_messaging::{DeliveryStatus, Message, MessageId, SendFailure};

/// Proof that an optimistic entry was inserted; settle it with `commit` or `fail`.
#[must_use]
#[derive(Debug)]
pub struct PendingToken {
    temp_id: MessageId,
}

impl PendingToken {
    pub fn temp_id(&self) -> &MessageId {
        &self.temp_id
    }
}

/// Messages of one conversation in display order.
///
/// Entries keep their slot for life: reconciliation swaps identity in place and failures only
/// flip the status, so acknowledgements arriving out of order never reorder what is shown.
#[derive(Debug, Default)]
pub struct Timeline {
    messages: Vec<Message>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an optimistic entry at the tail.
    pub fn begin(&mut self, message: Message) -> PendingToken {
        let temp_id = message.id.clone();
        self.messages.push(message);
        PendingToken { temp_id }
    }

    /// Replace the optimistic entry with the server record.
    ///
    /// Attachment fields the server did not echo are carried over from the local copy, and a
    /// live copy of the same record that got in first is dropped. Returns `None` if the entry
    /// is gone.
    pub fn commit(&mut self, token: PendingToken, mut server: Message) -> Option<Message> {
        let mut slot = self.position(&token.temp_id)?;
        server
            .metadata
            .keep_local_attachment(&self.messages[slot].metadata);
        server.status = None;
        server.failure = None;

        if let Some(live) = self.position(&server.id) {
            self.messages.remove(live);
            if live < slot {
                slot -= 1;
            }
        }
        self.messages[slot] = server.clone();
        Some(server)
    }

    /// Flag the optimistic entry failed, keeping its content.
    pub fn fail(&mut self, token: PendingToken, failure: SendFailure) -> bool {
        match self.get_mut(&token.temp_id) {
            Some(message) => {
                message.status = Some(DeliveryStatus::Failed);
                message.failure = Some(failure);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == id)
    }

    fn get_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|message| &message.id == id)
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|message| &message.id == id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.position(id).is_some()
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let index = self.position(id)?;
        Some(self.messages.remove(index))
    }

    /// Append a record from the live feed unless it is already present.
    pub fn push_live(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Merge a server update into the existing entry.
    pub fn apply_update(&mut self, update: &Message) -> Option<&Message> {
        let message = self.get_mut(&update.id)?;
        message.content = update.content.clone();
        message.metadata.merge_update(&update.metadata);
        Some(message)
    }

    /// Insert an older history page before everything else, skipping known ids.
    pub fn prepend_page(&mut self, page: Vec<Message>) -> usize {
        let fresh: Vec<Message> = page
            .into_iter()
            .filter(|message| !self.contains(&message.id))
            .collect();
        let added = fresh.len();
        self.messages.splice(0..0, fresh);
        added
    }

    pub fn oldest_stable(&self) -> Option<&Message> {
        self.messages.iter().find(|message| message.id.is_stable())
    }

    pub fn stable_ids(&self) -> impl Iterator<Item = &MessageId> {
        self.messages
            .iter()
            .map(|message| &message.id)
            .filter(|id| id.is_stable())
    }

    /// Point an optimistic image at its uploaded copy.
    pub fn update_attachment(&mut self, id: &MessageId, path: &str, url: &str) -> bool {
        match self.get_mut(id) {
            Some(message) => {
                message.metadata.image_path = Some(path.to_owned());
                message.metadata.image_url = Some(url.to_owned());
                true
            }
            None => false,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
