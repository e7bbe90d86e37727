use super::{StoreError, StoreResult};
use campus_chat_messaging::{
    ConversationId, MessageEvent, ReactionChange, ReactionKind, TypingSignal, UserId,
};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 128;

struct HubInner {
    typing: Mutex<HashMap<ConversationId, broadcast::Sender<TypingSignal>>>,
    messages: Mutex<HashMap<ConversationId, broadcast::Sender<MessageEvent>>>,
    reactions: broadcast::Sender<ReactionChange>,
}

/// In-process publish/subscribe hub standing in for the realtime bus.
///
/// Typing channels are conversation scoped and never hand a subscriber its own broadcasts.
#[derive(Clone)]
pub struct RealtimeHub {
    inner: Arc<HubInner>,
}

impl RealtimeHub {
    pub fn new() -> Self {
        let (reactions, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(HubInner {
                typing: Mutex::new(HashMap::new()),
                messages: Mutex::new(HashMap::new()),
                reactions,
            }),
        }
    }

    pub fn subscribe_typing(
        &self,
        conversation_id: &ConversationId,
        local_user: &UserId,
    ) -> StoreResult<BoxStream<'static, TypingSignal>> {
        let rx = topic(&self.inner.typing, conversation_id)?.subscribe();
        let local_user = local_user.clone();
        Ok(into_stream(rx, move |signal: &TypingSignal| {
            signal.user_id() != &local_user
        }))
    }

    pub fn publish_typing(&self, signal: TypingSignal) -> StoreResult<()> {
        let sender = topic(&self.inner.typing, signal.conversation_id())?;
        let receivers = sender.send(signal).unwrap_or(0);
        debug!(receivers, "typing signal published");
        Ok(())
    }

    pub fn subscribe_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> StoreResult<BoxStream<'static, MessageEvent>> {
        let rx = topic(&self.inner.messages, conversation_id)?.subscribe();
        Ok(into_stream(rx, |_: &MessageEvent| true))
    }

    pub fn publish_message(&self, event: MessageEvent) -> StoreResult<()> {
        let sender = topic(&self.inner.messages, &event.message().conversation_id)?;
        let _ = sender.send(event);
        Ok(())
    }

    pub fn subscribe_reactions(&self, kind: ReactionKind) -> BoxStream<'static, ReactionChange> {
        let rx = self.inner.reactions.subscribe();
        into_stream(rx, move |change: &ReactionChange| change.record().kind == kind)
    }

    pub fn publish_reaction(&self, change: ReactionChange) {
        let _ = self.inner.reactions.send(change);
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

fn topic<T: Clone>(
    topics: &Mutex<HashMap<ConversationId, broadcast::Sender<T>>>,
    conversation_id: &ConversationId,
) -> StoreResult<broadcast::Sender<T>> {
    let mut topics = topics
        .lock()
        .map_err(|_| StoreError::Unavailable("lock poisoned".into()))?;
    let sender = topics
        .entry(conversation_id.clone())
        .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
    Ok(sender.clone())
}

fn into_stream<T, F>(rx: broadcast::Receiver<T>, keep: F) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
    F: Fn(&T) -> bool + Send + 'static,
{
    stream::unfold((rx, keep), |(mut rx, keep)| async move {
        loop {
            match rx.recv().await {
                Ok(item) if keep(&item) => return Some((item, (rx, keep))),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "realtime subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
