//! Optimistic send bookkeeping and the remote calls a send is made of.

use super::{Attachment, PendingToken, SendError, SendRequest, Timeline};
use crate::store::{MediaStore, MessageStore, StoreResult};
use campus_chat_messaging::{
    timestamp_ms, ConversationId, Message, MessageId, MessageKind, MessageMetadata, SendFailure,
    UserId, IMAGE_PLACEHOLDER,
};

/// Where an uploaded attachment ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedAttachment {
    pub path: String,
    pub url: String,
}

/// Owns the timeline of one conversation and every optimistic entry in it.
#[derive(Debug)]
pub struct SendPipeline {
    conversation_id: ConversationId,
    sender: UserId,
    timeline: Timeline,
    last_temp_ms: i64,
}

impl SendPipeline {
    pub fn new(conversation_id: ConversationId, sender: UserId) -> Self {
        Self {
            conversation_id,
            sender,
            timeline: Timeline::new(),
            last_temp_ms: 0,
        }
    }

    /// Validate `request` and append its optimistic entry.
    ///
    /// Rejected requests leave no trace in the timeline.
    pub fn begin(&mut self, request: &SendRequest) -> Result<(PendingToken, Message), SendError> {
        if request.is_empty() {
            return Err(SendError::EmptyMessage);
        }

        // Two sends inside one millisecond still need distinct temporary ids.
        let stamp = timestamp_ms().max(self.last_temp_ms + 1);
        self.last_temp_ms = stamp;

        let text = request.text.trim();
        let (id, content, metadata) = match &request.attachment {
            Some(attachment) => (
                MessageId::temporary_image(stamp),
                if text.is_empty() {
                    IMAGE_PLACEHOLDER.to_owned()
                } else {
                    text.to_owned()
                },
                MessageMetadata::image(attachment.local_uri.clone()),
            ),
            None => (
                MessageId::temporary(stamp),
                text.to_owned(),
                MessageMetadata::default(),
            ),
        };

        let message = Message::optimistic(
            id,
            self.conversation_id.clone(),
            self.sender.clone(),
            content,
            metadata,
        );
        let token = self.timeline.begin(message.clone());
        Ok((token, message))
    }

    pub fn commit(&mut self, token: PendingToken, server: Message) -> Option<Message> {
        self.timeline.commit(token, server)
    }

    pub fn fail(&mut self, token: PendingToken, failure: SendFailure) -> bool {
        self.timeline.fail(token, failure)
    }

    /// Pull a failed entry out of the timeline and rebuild the request that produced it.
    pub fn take_for_retry(&mut self, id: &MessageId) -> Result<SendRequest, SendError> {
        let message = self.discard(id)?;
        let attachment = match message.metadata.kind {
            MessageKind::Image => message
                .metadata
                .local_uri
                .clone()
                .map(|local_uri| Attachment { local_uri }),
            _ => None,
        };
        let text = if attachment.is_some() && message.content == IMAGE_PLACEHOLDER {
            String::new()
        } else {
            message.content
        };
        Ok(SendRequest { text, attachment })
    }

    /// Drop a failed entry.
    pub fn discard(&mut self, id: &MessageId) -> Result<Message, SendError> {
        let failed = self
            .timeline
            .get(id)
            .is_some_and(|message| message.is_optimistic() && message.is_failed());
        if !failed {
            return Err(SendError::NotRetryable(id.clone()));
        }
        self.timeline
            .remove(id)
            .ok_or_else(|| SendError::NotRetryable(id.clone()))
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn timeline_mut(&mut self) -> &mut Timeline {
        &mut self.timeline
    }
}

/// Hand a message to the store. The device-local image path is stripped first.
pub async fn deliver(
    store: &dyn MessageStore,
    conversation_id: &ConversationId,
    sender: &UserId,
    content: &str,
    mut metadata: MessageMetadata,
) -> StoreResult<Message> {
    metadata.local_uri = None;
    store
        .send_message(conversation_id, sender, content, &metadata)
        .await
}

/// Upload a local image and resolve a URL for it.
pub async fn upload_attachment(
    media: &dyn MediaStore,
    local_uri: &str,
    owner: &UserId,
) -> StoreResult<UploadedAttachment> {
    let uploaded = media.upload(local_uri, owner).await?;
    let url = media.signed_url(&uploaded.path).await?;
    Ok(UploadedAttachment {
        path: uploaded.path,
        url,
    })
}
