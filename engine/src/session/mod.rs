//! One open conversation: a handle for callers and the task that owns all of its state.

mod runtime;

use crate::config::SyncConfig;
use crate::gesture::TapOutcome;
use crate::messaging::{SendError, SendRequest};
use crate::store::{Backends, StoreError};
use crate::view::ChatView;
use campus_chat_messaging::{ConversationId, LocalUser, Message, MessageId};
use runtime::SessionRuntime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("message {0} is not in this conversation")]
    NotFound(MessageId),
    #[error("message {0} was sent by someone else")]
    NotOwnMessage(MessageId),
    #[error("message {0} has not been acknowledged yet")]
    TemporaryMessage(MessageId),
    #[error("message {0} was unsent")]
    Retracted(MessageId),
    #[error("chat session closed")]
    SessionClosed,
}

pub(crate) type SendOutcome = oneshot::Sender<Result<Message, SendError>>;

pub(crate) enum SessionCommand {
    Send {
        request: SendRequest,
        accepted: oneshot::Sender<Result<MessageId, SendError>>,
        outcome: SendOutcome,
    },
    Retry {
        message_id: MessageId,
        accepted: oneshot::Sender<Result<MessageId, SendError>>,
        outcome: SendOutcome,
    },
    Discard {
        message_id: MessageId,
        responder: oneshot::Sender<Result<(), SendError>>,
    },
    Unsend {
        message_id: MessageId,
        responder: oneshot::Sender<SyncResult<Message>>,
    },
    NotifyTyping,
    Press {
        message_id: MessageId,
        responder: oneshot::Sender<TapOutcome>,
    },
    ToggleReaction {
        message_id: MessageId,
        responder: oneshot::Sender<SyncResult<()>>,
    },
    LoadOlder {
        responder: oneshot::Sender<SyncResult<usize>>,
    },
    MarkRead {
        responder: oneshot::Sender<SyncResult<()>>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// A send that has been accepted and is shown optimistically under `temp_id`.
#[derive(Debug)]
pub struct PendingSend {
    temp_id: MessageId,
    outcome: oneshot::Receiver<Result<Message, SendError>>,
}

impl PendingSend {
    pub fn temp_id(&self) -> &MessageId {
        &self.temp_id
    }

    /// Wait for the acknowledged record, or for the reason the message was flagged failed.
    pub async fn outcome(self) -> Result<Message, SendError> {
        self.outcome.await.map_err(|_| SendError::SessionClosed)?
    }
}

/// Handle to an open conversation.
///
/// Every state change happens inside the session task; this handle only sends commands and
/// reads the published [`ChatView`]. Dropping the handle ends the session.
pub struct ChatSession {
    conversation_id: ConversationId,
    command_tx: mpsc::Sender<SessionCommand>,
    view_rx: watch::Receiver<ChatView>,
    runtime_task: JoinHandle<()>,
}

impl ChatSession {
    /// Subscribe to the conversation's realtime channels and start the session task.
    ///
    /// Subscription failures only disable the affected feature.
    pub async fn open(
        conversation_id: ConversationId,
        user: LocalUser,
        backends: Backends,
        config: SyncConfig,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (view_tx, view_rx) = watch::channel(ChatView::empty(conversation_id.clone()));

        let runtime =
            SessionRuntime::start(conversation_id.clone(), user, backends, config, command_rx, view_tx)
                .await;
        let runtime_task = tokio::spawn(async move { runtime.run().await });

        Self {
            conversation_id,
            command_tx,
            view_rx,
            runtime_task,
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn view(&self) -> watch::Receiver<ChatView> {
        self.view_rx.clone()
    }

    pub fn snapshot(&self) -> ChatView {
        self.view_rx.borrow().clone()
    }

    /// Submit a message. Validation failures come back here, before anything is shown.
    pub async fn send(&self, request: SendRequest) -> Result<PendingSend, SendError> {
        let (accepted, accepted_rx) = oneshot::channel();
        let (outcome, outcome_rx) = oneshot::channel();
        self.command(SessionCommand::Send {
            request,
            accepted,
            outcome,
        })
        .await
        .map_err(|_| SendError::SessionClosed)?;
        let temp_id = accepted_rx.await.map_err(|_| SendError::SessionClosed)??;
        Ok(PendingSend {
            temp_id,
            outcome: outcome_rx,
        })
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<PendingSend, SendError> {
        self.send(SendRequest::text(text)).await
    }

    /// Resend a failed message as a new optimistic entry.
    pub async fn retry(&self, message_id: &MessageId) -> Result<PendingSend, SendError> {
        let (accepted, accepted_rx) = oneshot::channel();
        let (outcome, outcome_rx) = oneshot::channel();
        self.command(SessionCommand::Retry {
            message_id: message_id.clone(),
            accepted,
            outcome,
        })
        .await
        .map_err(|_| SendError::SessionClosed)?;
        let temp_id = accepted_rx.await.map_err(|_| SendError::SessionClosed)??;
        Ok(PendingSend {
            temp_id,
            outcome: outcome_rx,
        })
    }

    pub async fn discard(&self, message_id: &MessageId) -> Result<(), SendError> {
        let (responder, rx) = oneshot::channel();
        self.command(SessionCommand::Discard {
            message_id: message_id.clone(),
            responder,
        })
        .await
        .map_err(|_| SendError::SessionClosed)?;
        rx.await.map_err(|_| SendError::SessionClosed)?
    }

    /// Retract one of the local user's messages for everyone.
    pub async fn unsend(&self, message_id: &MessageId) -> SyncResult<Message> {
        let (responder, rx) = oneshot::channel();
        self.command(SessionCommand::Unsend {
            message_id: message_id.clone(),
            responder,
        })
        .await?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    /// Report a local text change.
    pub async fn notify_typing(&self) -> SyncResult<()> {
        self.command(SessionCommand::NotifyTyping).await
    }

    /// Feed a press on a message to the tap classifier; a double tap toggles the heart.
    pub async fn press(&self, message_id: &MessageId) -> SyncResult<TapOutcome> {
        let (responder, rx) = oneshot::channel();
        self.command(SessionCommand::Press {
            message_id: message_id.clone(),
            responder,
        })
        .await?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    pub async fn toggle_reaction(&self, message_id: &MessageId) -> SyncResult<()> {
        let (responder, rx) = oneshot::channel();
        self.command(SessionCommand::ToggleReaction {
            message_id: message_id.clone(),
            responder,
        })
        .await?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    /// Fetch the page before the oldest loaded message. Returns how many messages were added.
    pub async fn load_older(&self) -> SyncResult<usize> {
        let (responder, rx) = oneshot::channel();
        self.command(SessionCommand::LoadOlder { responder }).await?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    pub async fn mark_read(&self) -> SyncResult<()> {
        let (responder, rx) = oneshot::channel();
        self.command(SessionCommand::MarkRead { responder }).await?;
        rx.await.map_err(|_| SyncError::SessionClosed)?
    }

    /// Stop the session: timers are cancelled and sends still in flight resolve as closed.
    pub async fn close(self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .command_tx
            .send(SessionCommand::Shutdown(done_tx))
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
        let _ = self.runtime_task.await;
    }

    async fn command(&self, command: SessionCommand) -> SyncResult<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SyncError::SessionClosed)
    }
}
