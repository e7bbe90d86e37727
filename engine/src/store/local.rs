use super::{
    ConversationStore, FaultPlan, HistoryCursor, MediaStore, MessagePage, MessageStore,
    Operation, RealtimeBus, RealtimeHub, ReactionStore, StoreError, StoreResult, UploadedMedia,
};
use anyhow::Context;
use async_trait::async_trait;
use campus_chat_messaging::conversation::normalize_group_name;
use campus_chat_messaging::{
    timestamp_ms, ConversationId, Message, MessageEvent, MessageId, MessageMetadata,
    ReactionChange, ReactionKind, ReactionRecord, TypingSignal, UserId,
};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

const SEPARATOR: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum ConversationKind {
    Direct,
    Group,
}

#[derive(Clone, Serialize, Deserialize)]
struct StoredConversation {
    id: ConversationId,
    kind: ConversationKind,
    name: Option<String>,
    created_by: UserId,
    created_ms: i64,
}

#[derive(Clone, Serialize, Deserialize)]
struct StoredParticipant {
    joined_ms: i64,
    last_read_ms: Option<i64>,
}

/// Sled-backed implementation of every collaborator, with an in-process realtime hub.
pub struct LocalBackend {
    db: sled::Db,
    hub: RealtimeHub,
    faults: FaultPlan,
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Storage(format!("codec: {err}"))
    }
}

impl LocalBackend {
    const CONVERSATIONS: &'static str = "conversations";
    const GROUP_NAMES: &'static str = "group_names";
    const DIRECT_PAIRS: &'static str = "direct_pairs";
    const PARTICIPANTS: &'static str = "participants";
    const MESSAGES: &'static str = "messages";
    const MESSAGE_INDEX: &'static str = "message_index";
    const REACTIONS: &'static str = "reactions";
    const MEDIA: &'static str = "media";

    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create storage directory {:?}", path))?;
        let db = sled::open(path)
            .with_context(|| format!("failed to open sled database at {:?}", path))?;
        Ok(Self::from_db(db))
    }

    /// A throwaway database removed when the backend is dropped.
    pub fn temporary() -> anyhow::Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .context("failed to open temporary sled database")?;
        Ok(Self::from_db(db))
    }

    fn from_db(db: sled::Db) -> Self {
        Self {
            db,
            hub: RealtimeHub::new(),
            faults: FaultPlan::new(),
        }
    }

    pub fn hub(&self) -> &RealtimeHub {
        &self.hub
    }

    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    pub async fn flush(&self) -> StoreResult<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn tree(&self, name: &str) -> StoreResult<sled::Tree> {
        Ok(self.db.open_tree(name)?)
    }

    fn conversation(&self, id: &ConversationId) -> StoreResult<Option<StoredConversation>> {
        let tree = self.tree(Self::CONVERSATIONS)?;
        match tree.get(id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn insert_conversation(&self, record: &StoredConversation) -> StoreResult<()> {
        let tree = self.tree(Self::CONVERSATIONS)?;
        tree.insert(record.id.as_str().as_bytes(), bincode::serialize(record)?)?;
        Ok(())
    }

    /// Returns false when the user already was a participant.
    fn insert_participant(&self, conversation_id: &ConversationId, user_id: &UserId)
        -> StoreResult<bool> {
        let tree = self.tree(Self::PARTICIPANTS)?;
        let record = StoredParticipant {
            joined_ms: timestamp_ms(),
            last_read_ms: None,
        };
        let key = participant_key(conversation_id, user_id);
        let inserted = tree
            .compare_and_swap(key, None::<&[u8]>, Some(bincode::serialize(&record)?))?
            .is_ok();
        Ok(inserted)
    }

    fn participant_exists(&self, conversation_id: &ConversationId, user_id: &UserId)
        -> StoreResult<bool> {
        let tree = self.tree(Self::PARTICIPANTS)?;
        Ok(tree.contains_key(participant_key(conversation_id, user_id))?)
    }

    /// Storage key a page must end before. A cursor message this store never saw falls back
    /// to the first key of its millisecond.
    fn cursor_key(&self, conversation_id: &ConversationId, cursor: &HistoryCursor)
        -> StoreResult<Vec<u8>> {
        let index = self.tree(Self::MESSAGE_INDEX)?;
        match index.get(cursor.message_id.as_str().as_bytes())? {
            Some(key) => Ok(key.to_vec()),
            None => Ok(message_key(conversation_id, cursor.created_ms, 0)),
        }
    }

    fn store_message(&self, message: &Message) -> StoreResult<()> {
        let messages = self.tree(Self::MESSAGES)?;
        let index = self.tree(Self::MESSAGE_INDEX)?;
        let key = message_key(
            &message.conversation_id,
            message.created_ms,
            self.db.generate_id()?,
        );
        messages.insert(key.as_slice(), bincode::serialize(message)?)?;
        index.insert(message.id.as_str().as_bytes(), key)?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for LocalBackend {
    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        sender_id: &UserId,
        content: &str,
        metadata: &MessageMetadata,
    ) -> StoreResult<Message> {
        self.faults.apply(Operation::SendMessage).await?;

        if self.conversation(conversation_id)?.is_none() {
            return Err(StoreError::Rejected(format!(
                "unknown conversation {conversation_id}"
            )));
        }
        if !self.participant_exists(conversation_id, sender_id)? {
            return Err(StoreError::Rejected(
                "sender is not a participant of the conversation".into(),
            ));
        }

        let mut metadata = metadata.clone();
        metadata.local_uri = None;

        let message = Message {
            id: MessageId(Uuid::new_v4().to_string()),
            conversation_id: conversation_id.clone(),
            sender_id: sender_id.clone(),
            content: content.to_owned(),
            metadata,
            created_ms: timestamp_ms(),
            status: None,
            failure: None,
        };
        self.store_message(&message)?;
        self.hub.publish_message(MessageEvent::Inserted(message.clone()))?;
        debug!(message_id = %message.id, %conversation_id, "message stored");
        Ok(message)
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        cursor: Option<&HistoryCursor>,
        limit: usize,
    ) -> StoreResult<MessagePage> {
        self.faults.apply(Operation::FetchMessages).await?;

        let tree = self.tree(Self::MESSAGES)?;
        let start = conversation_prefix(conversation_id);
        let end = match cursor {
            Some(cursor) => self.cursor_key(conversation_id, cursor)?,
            None => conversation_prefix_end(conversation_id),
        };

        let limit = limit.max(1);
        let mut newest_first = Vec::with_capacity(limit);
        let mut has_more = false;
        for entry in tree.range(start..end).rev() {
            let (_key, value) = entry?;
            if newest_first.len() == limit {
                has_more = true;
                break;
            }
            newest_first.push(bincode::deserialize::<Message>(&value)?);
        }
        newest_first.reverse();

        Ok(MessagePage {
            messages: newest_first,
            has_more,
        })
    }

    async fn mark_read(&self, conversation_id: &ConversationId, user_id: &UserId)
        -> StoreResult<()> {
        self.faults.apply(Operation::MarkRead).await?;

        let tree = self.tree(Self::PARTICIPANTS)?;
        let key = participant_key(conversation_id, user_id);
        let Some(existing) = tree.get(&key)? else {
            return Err(StoreError::NotFound(format!(
                "{user_id} in conversation {conversation_id}"
            )));
        };
        let mut record: StoredParticipant = bincode::deserialize(&existing)?;
        record.last_read_ms = Some(timestamp_ms());
        tree.insert(key, bincode::serialize(&record)?)?;
        Ok(())
    }

    async fn delete_message(&self, message_id: &MessageId, user_id: &UserId)
        -> StoreResult<Message> {
        self.faults.apply(Operation::DeleteMessage).await?;

        let index = self.tree(Self::MESSAGE_INDEX)?;
        let messages = self.tree(Self::MESSAGES)?;
        let key = index
            .get(message_id.as_str().as_bytes())?
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
        let stored = messages
            .get(&key)?
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;

        let mut message: Message = bincode::deserialize(&stored)?;
        if &message.sender_id != user_id {
            return Err(StoreError::Rejected(
                "only the sender can unsend a message".into(),
            ));
        }
        message.mark_unsent(user_id.clone(), timestamp_ms());
        messages.insert(key, bincode::serialize(&message)?)?;
        self.hub.publish_message(MessageEvent::Updated(message.clone()))?;
        Ok(message)
    }
}

#[async_trait]
impl ReactionStore for LocalBackend {
    async fn add_reaction(&self, record: &ReactionRecord) -> StoreResult<()> {
        self.faults.apply(Operation::AddReaction).await?;

        let tree = self.tree(Self::REACTIONS)?;
        let key = reaction_key(record);
        let inserted = tree
            .compare_and_swap(key, None::<&[u8]>, Some(bincode::serialize(record)?))?
            .is_ok();
        if !inserted {
            return Err(StoreError::DuplicateConflict);
        }
        self.hub.publish_reaction(ReactionChange::Added(record.clone()));
        Ok(())
    }

    async fn remove_reaction(&self, record: &ReactionRecord) -> StoreResult<()> {
        self.faults.apply(Operation::RemoveReaction).await?;

        let tree = self.tree(Self::REACTIONS)?;
        if tree.remove(reaction_key(record))?.is_some() {
            self.hub.publish_reaction(ReactionChange::Removed(record.clone()));
        }
        Ok(())
    }

    async fn list_reactions(
        &self,
        message_ids: &[MessageId],
        kind: ReactionKind,
    ) -> StoreResult<Vec<ReactionRecord>> {
        self.faults.apply(Operation::ListReactions).await?;

        let tree = self.tree(Self::REACTIONS)?;
        let mut records = Vec::new();
        for message_id in message_ids {
            let prefix = composite_key(&[message_id.as_str().as_bytes(), &[]]);
            for entry in tree.scan_prefix(prefix) {
                let (_key, value) = entry?;
                let record: ReactionRecord = bincode::deserialize(&value)?;
                if record.kind == kind {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl MediaStore for LocalBackend {
    async fn upload(&self, local_uri: &str, owner: &UserId) -> StoreResult<UploadedMedia> {
        self.faults.apply(Operation::Upload).await?;

        if local_uri.trim().is_empty() {
            return Err(StoreError::Rejected("empty upload source".into()));
        }
        let tree = self.tree(Self::MEDIA)?;
        let path = format!("message_media/{owner}/{}.jpg", Uuid::new_v4());
        tree.insert(path.as_bytes(), local_uri.as_bytes())?;
        Ok(UploadedMedia { path })
    }

    async fn signed_url(&self, path: &str) -> StoreResult<String> {
        self.faults.apply(Operation::SignedUrl).await?;

        let tree = self.tree(Self::MEDIA)?;
        if !tree.contains_key(path.as_bytes())? {
            return Err(StoreError::NotFound(format!("media {path}")));
        }
        Ok(format!(
            "local-media://{path}?token={}",
            Uuid::new_v4().simple()
        ))
    }
}

#[async_trait]
impl ConversationStore for LocalBackend {
    async fn find_or_create_direct(&self, user_a: &UserId, user_b: &UserId)
        -> StoreResult<ConversationId> {
        self.faults.apply(Operation::FindOrCreateDirect).await?;

        if user_a == user_b {
            return Err(StoreError::Rejected(
                "a direct chat needs two distinct users".into(),
            ));
        }
        let (low, high) = if user_a <= user_b {
            (user_a, user_b)
        } else {
            (user_b, user_a)
        };

        let pairs = self.tree(Self::DIRECT_PAIRS)?;
        let key = composite_key(&[low.as_str().as_bytes(), high.as_str().as_bytes()]);
        let candidate = ConversationId::new();
        match pairs.compare_and_swap(
            key,
            None::<&[u8]>,
            Some(candidate.as_str().as_bytes()),
        )? {
            Ok(()) => {
                self.insert_conversation(&StoredConversation {
                    id: candidate.clone(),
                    kind: ConversationKind::Direct,
                    name: None,
                    created_by: user_a.clone(),
                    created_ms: timestamp_ms(),
                })?;
                self.insert_participant(&candidate, low)?;
                self.insert_participant(&candidate, high)?;
                debug!(conversation_id = %candidate, "direct conversation created");
                Ok(candidate)
            }
            Err(existing) => match existing.current {
                Some(bytes) => decode_conversation_id(&bytes),
                None => Err(StoreError::Storage("direct pair vanished".into())),
            },
        }
    }

    async fn find_group_by_name(&self, name: &str) -> StoreResult<Option<ConversationId>> {
        self.faults.apply(Operation::FindGroup).await?;

        let tree = self.tree(Self::GROUP_NAMES)?;
        match tree.get(normalize_group_name(name).as_bytes())? {
            Some(bytes) => Ok(Some(decode_conversation_id(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn create_group(&self, name: &str, creator: &UserId) -> StoreResult<ConversationId> {
        self.faults.apply(Operation::CreateGroup).await?;

        let names = self.tree(Self::GROUP_NAMES)?;
        let id = ConversationId::new();
        let claimed = names
            .compare_and_swap(
                normalize_group_name(name).as_bytes(),
                None::<&[u8]>,
                Some(id.as_str().as_bytes()),
            )?
            .is_ok();
        if !claimed {
            return Err(StoreError::DuplicateConflict);
        }

        self.insert_conversation(&StoredConversation {
            id: id.clone(),
            kind: ConversationKind::Group,
            name: Some(name.trim().to_owned()),
            created_by: creator.clone(),
            created_ms: timestamp_ms(),
        })?;
        Ok(id)
    }

    async fn add_participant(&self, conversation_id: &ConversationId, user_id: &UserId)
        -> StoreResult<()> {
        self.faults.apply(Operation::AddParticipant).await?;

        if self.conversation(conversation_id)?.is_none() {
            return Err(StoreError::NotFound(format!("conversation {conversation_id}")));
        }
        if self.insert_participant(conversation_id, user_id)? {
            Ok(())
        } else {
            Err(StoreError::DuplicateConflict)
        }
    }

    async fn is_participant(&self, conversation_id: &ConversationId, user_id: &UserId)
        -> StoreResult<bool> {
        self.participant_exists(conversation_id, user_id)
    }
}

#[async_trait]
impl RealtimeBus for LocalBackend {
    async fn subscribe_typing(
        &self,
        conversation_id: &ConversationId,
        local_user: &UserId,
    ) -> StoreResult<BoxStream<'static, TypingSignal>> {
        self.faults.apply(Operation::SubscribeTyping).await?;
        self.hub.subscribe_typing(conversation_id, local_user)
    }

    async fn broadcast_typing(&self, signal: TypingSignal) -> StoreResult<()> {
        self.faults.apply(Operation::BroadcastTyping).await?;
        self.hub.publish_typing(signal)
    }

    async fn subscribe_reactions(
        &self,
        kind: ReactionKind,
    ) -> StoreResult<BoxStream<'static, ReactionChange>> {
        self.faults.apply(Operation::SubscribeReactions).await?;
        Ok(self.hub.subscribe_reactions(kind))
    }

    async fn subscribe_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> StoreResult<BoxStream<'static, MessageEvent>> {
        self.faults.apply(Operation::SubscribeMessages).await?;
        self.hub.subscribe_messages(conversation_id)
    }
}

fn composite_key(parts: &[&[u8]]) -> Vec<u8> {
    let mut key = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(SEPARATOR);
        }
        key.extend_from_slice(part);
    }
    key
}

fn participant_key(conversation_id: &ConversationId, user_id: &UserId) -> Vec<u8> {
    composite_key(&[conversation_id.as_str().as_bytes(), user_id.as_str().as_bytes()])
}

fn reaction_key(record: &ReactionRecord) -> Vec<u8> {
    composite_key(&[
        record.message_id.as_str().as_bytes(),
        record.user_id.as_str().as_bytes(),
        record.kind.as_str().as_bytes(),
    ])
}

fn conversation_prefix(conversation_id: &ConversationId) -> Vec<u8> {
    composite_key(&[conversation_id.as_str().as_bytes(), &[]])
}

fn conversation_prefix_end(conversation_id: &ConversationId) -> Vec<u8> {
    let mut end = conversation_id.as_str().as_bytes().to_vec();
    end.push(SEPARATOR + 1);
    end
}

// Big-endian timestamp then store sequence: insertion order even within one millisecond.
fn message_key(conversation_id: &ConversationId, created_ms: i64, sequence: u64) -> Vec<u8> {
    let mut key = conversation_prefix(conversation_id);
    key.extend_from_slice(&(created_ms.max(0) as u64).to_be_bytes());
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

fn decode_conversation_id(bytes: &[u8]) -> StoreResult<ConversationId> {
    String::from_utf8(bytes.to_vec())
        .map(ConversationId)
        .map_err(|e| StoreError::Storage(format!("stored conversation id: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend_with_direct_chat() -> (LocalBackend, ConversationId, UserId, UserId) {
        let backend = LocalBackend::temporary().unwrap();
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        let conversation = backend.find_or_create_direct(&alice, &bob).await.unwrap();
        (backend, conversation, alice, bob)
    }

    #[tokio::test]
    async fn direct_chat_is_idempotent_in_both_directions() {
        let (backend, conversation, alice, bob) = backend_with_direct_chat().await;
        let again = backend.find_or_create_direct(&bob, &alice).await.unwrap();
        assert_eq!(conversation, again);
        assert!(backend.is_participant(&conversation, &alice).await.unwrap());
        assert!(backend.is_participant(&conversation, &bob).await.unwrap());
    }

    #[tokio::test]
    async fn second_group_with_same_name_conflicts() {
        let backend = LocalBackend::temporary().unwrap();
        let owner = UserId::from("owner");
        let id = backend.create_group("CS 101", &owner).await.unwrap();

        let err = backend.create_group("cs 101", &owner).await.unwrap_err();
        assert_eq!(err, StoreError::DuplicateConflict);
        assert_eq!(
            backend.find_group_by_name(" CS 101 ").await.unwrap(),
            Some(id)
        );
    }

    #[tokio::test]
    async fn duplicate_reaction_is_a_conflict() {
        let (backend, _conversation, alice, _bob) = backend_with_direct_chat().await;
        let record = ReactionRecord::heart(MessageId(Uuid::new_v4().to_string()), alice);

        backend.add_reaction(&record).await.unwrap();
        assert_eq!(
            backend.add_reaction(&record).await,
            Err(StoreError::DuplicateConflict)
        );

        let listed = backend
            .list_reactions(&[record.message_id.clone()], ReactionKind::Heart)
            .await
            .unwrap();
        assert_eq!(listed, vec![record.clone()]);

        backend.remove_reaction(&record).await.unwrap();
        backend.remove_reaction(&record).await.unwrap();
        let listed = backend
            .list_reactions(&[record.message_id.clone()], ReactionKind::Heart)
            .await
            .unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn history_pages_walk_backwards() {
        let (backend, conversation, alice, _bob) = backend_with_direct_chat().await;
        for i in 0..5 {
            backend
                .send_message(&conversation, &alice, &format!("m{i}"), &MessageMetadata::default())
                .await
                .unwrap();
        }

        let newest = backend.fetch_messages(&conversation, None, 3).await.unwrap();
        assert!(newest.has_more);
        let contents: Vec<_> = newest.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);

        let cursor = HistoryCursor::before(&newest.messages[0]);
        let older = backend
            .fetch_messages(&conversation, Some(&cursor), 3)
            .await
            .unwrap();
        assert!(!older.has_more);
        let contents: Vec<_> = older.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m1"]);
    }

    #[tokio::test]
    async fn burst_within_one_millisecond_keeps_send_order() {
        let (backend, conversation, alice, _bob) = backend_with_direct_chat().await;
        for i in 0..20 {
            backend
                .send_message(&conversation, &alice, &format!("m{i}"), &MessageMetadata::default())
                .await
                .unwrap();
        }

        let page = backend.fetch_messages(&conversation, None, 50).await.unwrap();
        let contents: Vec<_> = page.messages.iter().map(|m| m.content.clone()).collect();
        let expected: Vec<_> = (0..20).map(|i| format!("m{i}")).collect();
        assert_eq!(contents, expected);
    }

    #[tokio::test]
    async fn cursor_for_unknown_message_pages_by_timestamp() {
        let (backend, conversation, alice, _bob) = backend_with_direct_chat().await;
        let stored = backend
            .send_message(&conversation, &alice, "only", &MessageMetadata::default())
            .await
            .unwrap();

        let later = HistoryCursor {
            created_ms: stored.created_ms + 1,
            message_id: MessageId::from("never-stored"),
        };
        let page = backend
            .fetch_messages(&conversation, Some(&later), 10)
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 1);

        let same_ms = HistoryCursor {
            created_ms: stored.created_ms,
            message_id: MessageId::from("never-stored"),
        };
        let page = backend
            .fetch_messages(&conversation, Some(&same_ms), 10)
            .await
            .unwrap();
        assert!(page.messages.is_empty());
    }

    #[tokio::test]
    async fn stored_messages_get_stable_ids_and_drop_device_paths() {
        let (backend, conversation, alice, _bob) = backend_with_direct_chat().await;
        let metadata = MessageMetadata::image("file:///sdcard/cat.jpg");
        let stored = backend
            .send_message(&conversation, &alice, "cat", &metadata)
            .await
            .unwrap();
        assert!(stored.id.is_stable());
        assert_eq!(stored.metadata.local_uri, None);
        assert_eq!(stored.status, None);
    }

    #[tokio::test]
    async fn outsiders_cannot_post_or_unsend() {
        let (backend, conversation, alice, bob) = backend_with_direct_chat().await;
        let mallory = UserId::from("mallory");
        let err = backend
            .send_message(&conversation, &mallory, "hi", &MessageMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));

        let stored = backend
            .send_message(&conversation, &alice, "hi", &MessageMetadata::default())
            .await
            .unwrap();
        let err = backend.delete_message(&stored.id, &bob).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));

        let retracted = backend.delete_message(&stored.id, &alice).await.unwrap();
        assert!(retracted.is_unsent());
        assert!(retracted.content.is_empty());
    }
}
