//! Message send pipeline: the local timeline and the optimistic send helpers around it.

mod pipeline;
mod timeline;

pub use pipeline::{deliver, upload_attachment, SendPipeline, UploadedAttachment};
pub use timeline::{PendingToken, Timeline};

use campus_chat_messaging::MessageId;

/// Errors reported for a send attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("message has no text and no attachment")]
    EmptyMessage,
    #[error("message store did not answer in time")]
    Timeout,
    #[error("message store rejected the message: {0}")]
    RemoteRejected(String),
    /// The attachment never reached the media store; `restored` is what the composer held.
    #[error("attachment upload failed: {reason}")]
    Upload {
        reason: String,
        restored: SendRequest,
    },
    #[error("message {0} is not a failed send")]
    NotRetryable(MessageId),
    #[error("chat session closed")]
    SessionClosed,
}

/// Device-local image attached to a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub local_uri: String,
}

/// What the composer submits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub text: String,
    pub attachment: Option<Attachment>,
}

impl SendRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachment: None,
        }
    }

    pub fn image(local_uri: impl Into<String>, caption: impl Into<String>) -> Self {
        Self {
            text: caption.into(),
            attachment: Some(Attachment {
                local_uri: local_uri.into(),
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.attachment.is_none()
    }
}
