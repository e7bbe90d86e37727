use super::{SendOutcome, SessionCommand, SyncError, SyncResult};
use crate::config::SyncConfig;
use crate::gesture::{TapClassifier, TapOutcome};
use crate::messaging::{
    deliver, upload_attachment, PendingToken, SendError, SendPipeline, SendRequest,
    UploadedAttachment,
};
use crate::presence::{RemoteEffect, TypingPresence};
use crate::reactions::{ReactionOp, ReactionSynchronizer};
use crate::store::{Backends, HistoryCursor, MessagePage, RealtimeBus, StoreResult};
use crate::timers::{TimerKey, TimerRegistry, TimerRole};
use crate::view::ChatView;
use campus_chat_messaging::{
    ConversationId, LocalUser, Message, MessageEvent, MessageId, ReactionChange, ReactionKind,
    ReactionRecord, SendFailure, TypingSignal,
};
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::future;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinError, JoinHandle, JoinSet};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Result of a spawned network call, handed back to the loop.
enum Completion {
    Uploaded {
        temp_id: MessageId,
        result: StoreResult<UploadedAttachment>,
    },
    Delivered {
        temp_id: MessageId,
        result: StoreResult<Message>,
    },
    History {
        initial: bool,
        result: StoreResult<MessagePage>,
        responder: Option<oneshot::Sender<SyncResult<usize>>>,
    },
    ReactionWritten {
        op: ReactionOp,
        record: ReactionRecord,
        result: StoreResult<()>,
    },
    ReactionsFetched {
        generation: u64,
        result: StoreResult<Vec<ReactionRecord>>,
    },
    Unsent {
        result: StoreResult<Message>,
        responder: oneshot::Sender<SyncResult<Message>>,
    },
    ReadMarked {
        result: StoreResult<()>,
        responder: Option<oneshot::Sender<SyncResult<()>>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendStage {
    Uploading,
    Delivering,
}

struct InFlightSend {
    token: PendingToken,
    request: SendRequest,
    stage: SendStage,
    abort: AbortHandle,
    outcome: SendOutcome,
}

/// Owns every piece of state of one open conversation.
pub(super) struct SessionRuntime {
    conversation_id: ConversationId,
    user: LocalUser,
    config: SyncConfig,
    backends: Backends,
    command_rx: mpsc::Receiver<SessionCommand>,
    view_tx: watch::Sender<ChatView>,
    pipeline: SendPipeline,
    presence: TypingPresence,
    reactions: ReactionSynchronizer,
    taps: TapClassifier,
    timers: TimerRegistry,
    tasks: JoinSet<Completion>,
    in_flight: HashMap<MessageId, InFlightSend>,
    typing_events: Option<BoxStream<'static, TypingSignal>>,
    reaction_events: Option<BoxStream<'static, ReactionChange>>,
    message_events: Option<BoxStream<'static, MessageEvent>>,
    typing_tx: Option<mpsc::UnboundedSender<TypingSignal>>,
    broadcaster: Option<JoinHandle<()>>,
    loading: bool,
    has_more_history: bool,
    history_in_flight: bool,
}

impl SessionRuntime {
    pub(super) async fn start(
        conversation_id: ConversationId,
        user: LocalUser,
        backends: Backends,
        config: SyncConfig,
        command_rx: mpsc::Receiver<SessionCommand>,
        view_tx: watch::Sender<ChatView>,
    ) -> Self {
        let bus = backends.bus.clone();
        let mut presence = TypingPresence::new(
            conversation_id.clone(),
            user.clone(),
            config.typing_broadcast_interval,
        );

        let typing_events = match bus.subscribe_typing(&conversation_id, &user.id).await {
            Ok(stream) => Some(stream),
            Err(err) => {
                warn!(%err, %conversation_id, "typing channel unavailable, presence disabled");
                presence.set_available(false);
                None
            }
        };
        let reaction_events = match bus.subscribe_reactions(ReactionKind::Heart).await {
            Ok(stream) => Some(stream),
            Err(err) => {
                warn!(%err, %conversation_id, "reaction feed unavailable, relying on refetch");
                None
            }
        };
        let message_events = match bus.subscribe_messages(&conversation_id).await {
            Ok(stream) => Some(stream),
            Err(err) => {
                warn!(%err, %conversation_id, "live message feed unavailable");
                None
            }
        };

        let (typing_tx, broadcaster) = if presence.is_available() {
            let (tx, handle) = spawn_broadcaster(bus);
            (Some(tx), Some(handle))
        } else {
            (None, None)
        };

        let mut runtime = Self {
            pipeline: SendPipeline::new(conversation_id.clone(), user.id.clone()),
            reactions: ReactionSynchronizer::new(ReactionKind::Heart),
            taps: TapClassifier::new(config.double_tap_window),
            timers: TimerRegistry::new(),
            tasks: JoinSet::new(),
            in_flight: HashMap::new(),
            presence,
            typing_events,
            reaction_events,
            message_events,
            typing_tx,
            broadcaster,
            loading: true,
            has_more_history: false,
            history_in_flight: false,
            conversation_id,
            user,
            config,
            backends,
            command_rx,
            view_tx,
        };

        runtime.timers.arm_after(
            TimerKey::session(TimerRole::ReactionRefetch),
            runtime.config.reaction_refetch_interval,
        );
        runtime.request_history(true, None);
        runtime.publish();
        info!(
            conversation_id = %runtime.conversation_id,
            user_id = %runtime.user.id,
            "chat session opened"
        );
        runtime
    }

    pub(super) async fn run(mut self) {
        let done = loop {
            let deadline = self.timers.next_deadline();
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => {
                            if let ControlFlow::Break(done) = self.handle_command(command) {
                                break Some(done);
                            }
                        }
                        None => break None,
                    }
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.handle_joined(joined);
                }
                signal = next_event(&mut self.typing_events) => {
                    self.on_typing_signal(signal);
                }
                change = next_event(&mut self.reaction_events) => {
                    if self.reactions.apply_change(&change) {
                        debug!(message_id = %change.record().message_id, "reaction change applied");
                    }
                }
                event = next_event(&mut self.message_events) => {
                    self.on_message_event(event);
                }
                _ = sleep_until_deadline(deadline) => {
                    self.on_timers(Instant::now());
                }
            }
            self.publish();
        };

        self.shutdown().await;
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn handle_command(&mut self, command: SessionCommand) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            SessionCommand::Send {
                request,
                accepted,
                outcome,
            } => {
                let result = self.start_send(request, outcome);
                self.respond(accepted, result);
            }
            SessionCommand::Retry {
                message_id,
                accepted,
                outcome,
            } => {
                let result = self
                    .pipeline
                    .take_for_retry(&message_id)
                    .and_then(|request| self.start_send(request, outcome));
                if let Ok(temp_id) = &result {
                    info!(failed = %message_id, %temp_id, "retrying failed message");
                }
                self.respond(accepted, result);
            }
            SessionCommand::Discard {
                message_id,
                responder,
            } => {
                let result = self.pipeline.discard(&message_id).map(|_| ());
                self.respond(responder, result);
            }
            SessionCommand::Unsend {
                message_id,
                responder,
            } => self.start_unsend(message_id, responder),
            SessionCommand::NotifyTyping => self.on_local_typing(),
            SessionCommand::Press {
                message_id,
                responder,
            } => {
                let outcome = self.on_press(&message_id);
                self.respond(responder, outcome);
            }
            SessionCommand::ToggleReaction {
                message_id,
                responder,
            } => {
                let result = match self.pipeline.timeline().get(&message_id) {
                    None => Err(SyncError::NotFound(message_id.clone())),
                    Some(message) if !message.id.is_stable() => {
                        Err(SyncError::TemporaryMessage(message_id.clone()))
                    }
                    Some(message) if message.is_unsent() => {
                        Err(SyncError::Retracted(message_id.clone()))
                    }
                    Some(_) => Ok(()),
                };
                if result.is_ok() {
                    self.toggle_reaction(&message_id);
                }
                self.respond(responder, result);
            }
            SessionCommand::LoadOlder { responder } => self.load_older(responder),
            SessionCommand::MarkRead { responder } => self.spawn_mark_read(Some(responder)),
            SessionCommand::Shutdown(done) => return ControlFlow::Break(done),
        }
        ControlFlow::Continue(())
    }

    fn handle_joined(&mut self, joined: Result<Completion, JoinError>) {
        match joined {
            Ok(completion) => self.on_completion(completion),
            Err(err) if err.is_cancelled() => debug!("aborted session task reaped"),
            Err(err) => warn!(%err, "session task failed"),
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Uploaded { temp_id, result } => self.on_uploaded(temp_id, result),
            Completion::Delivered { temp_id, result } => self.on_delivered(temp_id, result),
            Completion::History {
                initial,
                result,
                responder,
            } => self.on_history(initial, result, responder),
            Completion::ReactionWritten { op, record, result } => {
                self.reactions.on_remote_result(op, &record, &result);
            }
            Completion::ReactionsFetched { generation, result } => match result {
                Ok(records) => {
                    self.reactions.apply_refetch(generation, records);
                }
                Err(err) => warn!(%err, "reaction refetch failed"),
            },
            Completion::Unsent { result, responder } => {
                let result = match result {
                    Ok(server) => {
                        let merged = self.pipeline.timeline_mut().apply_update(&server).cloned();
                        Ok(merged.unwrap_or(server))
                    }
                    Err(err) => {
                        warn!(%err, "unsend failed");
                        Err(SyncError::from(err))
                    }
                };
                self.respond(responder, result);
            }
            Completion::ReadMarked { result, responder } => {
                if let Err(err) = &result {
                    warn!(%err, conversation_id = %self.conversation_id, "mark read failed");
                }
                if let Some(responder) = responder {
                    self.respond(responder, result.map_err(SyncError::from));
                }
            }
        }
    }

    fn start_send(
        &mut self,
        request: SendRequest,
        outcome: SendOutcome,
    ) -> Result<MessageId, SendError> {
        let (token, message) = self.pipeline.begin(&request)?;

        self.timers.cancel(&TimerKey::session(TimerRole::TypingStop));
        if let Some(stop) = self.presence.on_send() {
            self.broadcast(stop);
        }

        let temp_id = token.temp_id().clone();
        let (stage, abort) = match &request.attachment {
            Some(attachment) => {
                let abort = self.spawn_upload(&temp_id, &attachment.local_uri);
                self.timers.arm_after(
                    TimerKey::message(TimerRole::UploadTimeout, temp_id.clone()),
                    self.config.image_upload_timeout,
                );
                (SendStage::Uploading, abort)
            }
            None => {
                let abort = self.spawn_delivery(&message);
                self.timers.arm_after(
                    TimerKey::message(TimerRole::SendTimeout, temp_id.clone()),
                    self.config.text_send_timeout,
                );
                (SendStage::Delivering, abort)
            }
        };

        debug!(%temp_id, ?stage, "send started");
        self.in_flight.insert(
            temp_id.clone(),
            InFlightSend {
                token,
                request,
                stage,
                abort,
                outcome,
            },
        );
        Ok(temp_id)
    }

    fn spawn_upload(&mut self, temp_id: &MessageId, local_uri: &str) -> AbortHandle {
        let media = self.backends.media.clone();
        let owner = self.user.id.clone();
        let local_uri = local_uri.to_owned();
        let temp_id = temp_id.clone();
        self.tasks.spawn(async move {
            let result = upload_attachment(media.as_ref(), &local_uri, &owner).await;
            Completion::Uploaded { temp_id, result }
        })
    }

    fn spawn_delivery(&mut self, message: &Message) -> AbortHandle {
        let store = self.backends.messages.clone();
        let temp_id = message.id.clone();
        let conversation_id = message.conversation_id.clone();
        let sender = message.sender_id.clone();
        let content = message.content.clone();
        let metadata = message.metadata.clone();
        self.tasks.spawn(async move {
            let result = deliver(store.as_ref(), &conversation_id, &sender, &content, metadata).await;
            Completion::Delivered { temp_id, result }
        })
    }

    fn on_uploaded(&mut self, temp_id: MessageId, result: StoreResult<UploadedAttachment>) {
        let Some(mut in_flight) = self.in_flight.remove(&temp_id) else {
            debug!(%temp_id, "upload finished after the send was settled");
            return;
        };
        self.timers
            .cancel(&TimerKey::message(TimerRole::UploadTimeout, temp_id.clone()));

        match result {
            Ok(uploaded) => {
                let timeline = self.pipeline.timeline_mut();
                timeline.update_attachment(&temp_id, &uploaded.path, &uploaded.url);
                let Some(message) = timeline.get(&temp_id).cloned() else {
                    warn!(%temp_id, "optimistic image vanished before delivery");
                    return;
                };
                in_flight.abort = self.spawn_delivery(&message);
                in_flight.stage = SendStage::Delivering;
                self.timers.arm_after(
                    TimerKey::message(TimerRole::SendTimeout, temp_id.clone()),
                    self.config.image_send_timeout,
                );
                debug!(%temp_id, path = %uploaded.path, "attachment uploaded");
                self.in_flight.insert(temp_id, in_flight);
            }
            Err(err) => {
                warn!(%err, %temp_id, "attachment upload failed");
                self.fail_upload(in_flight, err.to_string());
            }
        }
    }

    fn on_delivered(&mut self, temp_id: MessageId, result: StoreResult<Message>) {
        let Some(in_flight) = self.in_flight.remove(&temp_id) else {
            debug!(%temp_id, "acknowledgement for a settled send ignored");
            return;
        };
        self.timers
            .cancel(&TimerKey::message(TimerRole::SendTimeout, temp_id.clone()));

        match result {
            Ok(server) => {
                let committed = self
                    .pipeline
                    .commit(in_flight.token, server.clone())
                    .unwrap_or(server);
                debug!(%temp_id, message_id = %committed.id, "send acknowledged");
                self.refresh_tracked();
                self.respond(in_flight.outcome, Ok(committed));
            }
            Err(err) => {
                warn!(%err, %temp_id, "message store rejected send");
                self.pipeline.fail(in_flight.token, SendFailure::Rejected);
                self.respond(in_flight.outcome, Err(SendError::RemoteRejected(err.to_string())));
            }
        }
    }

    fn on_send_timeout(&mut self, temp_id: MessageId) {
        let Some(in_flight) = self.in_flight.remove(&temp_id) else {
            return;
        };
        in_flight.abort.abort();
        warn!(%temp_id, stage = ?in_flight.stage, "send timed out, outcome unknown");
        self.pipeline.fail(in_flight.token, SendFailure::Timeout);
        self.respond(in_flight.outcome, Err(SendError::Timeout));
    }

    fn on_upload_timeout(&mut self, temp_id: MessageId) {
        let Some(in_flight) = self.in_flight.remove(&temp_id) else {
            return;
        };
        in_flight.abort.abort();
        warn!(%temp_id, "attachment upload timed out");
        self.fail_upload(in_flight, "upload timed out".into());
    }

    fn fail_upload(&mut self, in_flight: InFlightSend, reason: String) {
        self.pipeline.fail(in_flight.token, SendFailure::Upload);
        self.respond(
            in_flight.outcome,
            Err(SendError::Upload {
                reason,
                restored: in_flight.request,
            }),
        );
    }

    fn on_timers(&mut self, now: Instant) {
        for key in self.timers.take_expired(now) {
            match (key.role, key.scope) {
                (TimerRole::SendTimeout, Some(temp_id)) => self.on_send_timeout(temp_id),
                (TimerRole::UploadTimeout, Some(temp_id)) => self.on_upload_timeout(temp_id),
                (TimerRole::TypingStop, _) => {
                    if let Some(stop) = self.presence.on_stop_timer() {
                        debug!("composing went quiet");
                        self.broadcast(stop);
                    }
                }
                (TimerRole::TypingExpiry, _) => {
                    self.presence.on_expiry();
                    debug!("remote typing indicator expired");
                }
                (TimerRole::TapPairing, _) => {
                    self.taps.expire(now);
                }
                (TimerRole::ReactionRefetch, _) => {
                    self.start_refetch();
                    self.timers.arm_after(
                        TimerKey::session(TimerRole::ReactionRefetch),
                        self.config.reaction_refetch_interval,
                    );
                }
                (role, None) => debug!(?role, "send timer without a message ignored"),
            }
        }
    }

    fn on_local_typing(&mut self) {
        if let Some(signal) = self.presence.on_local_input(Instant::now()) {
            debug!("typing broadcast");
            self.broadcast(signal);
        }
        if self.presence.is_composing() {
            self.timers.arm_after(
                TimerKey::session(TimerRole::TypingStop),
                self.config.typing_stop_after,
            );
        }
    }

    fn on_typing_signal(&mut self, signal: TypingSignal) {
        match self.presence.on_remote(&signal) {
            RemoteEffect::Shown => self.timers.arm_after(
                TimerKey::session(TimerRole::TypingExpiry),
                self.config.typing_expiry,
            ),
            RemoteEffect::Cleared => {
                self.timers.cancel(&TimerKey::session(TimerRole::TypingExpiry));
            }
            RemoteEffect::Ignored => {
                debug!(user_id = %signal.user_id(), "typing signal ignored");
            }
        }
    }

    fn broadcast(&self, signal: TypingSignal) {
        if let Some(tx) = &self.typing_tx {
            if tx.send(signal).is_err() {
                debug!("typing broadcaster stopped");
            }
        }
    }

    fn on_press(&mut self, message_id: &MessageId) -> TapOutcome {
        let Some(message) = self.pipeline.timeline().get(message_id) else {
            debug!(%message_id, "press on unknown message");
            return TapOutcome::Ignored;
        };
        let retracted = message.is_unsent();

        let now = Instant::now();
        let outcome = self.taps.on_press(message_id, retracted, now);
        match outcome {
            TapOutcome::Single => {
                if let Some(deadline) = self.taps.deadline() {
                    self.timers
                        .arm(TimerKey::session(TimerRole::TapPairing), deadline);
                }
            }
            TapOutcome::Double => {
                self.timers.cancel(&TimerKey::session(TimerRole::TapPairing));
                self.toggle_reaction(message_id);
            }
            TapOutcome::Ignored => debug!(%message_id, "press on retracted message ignored"),
        }
        outcome
    }

    fn toggle_reaction(&mut self, message_id: &MessageId) {
        let Some((op, record)) = self.reactions.toggle(message_id, &self.user.id) else {
            return;
        };
        let store = self.backends.reactions.clone();
        self.tasks.spawn(async move {
            let result = match op {
                ReactionOp::Add => store.add_reaction(&record).await,
                ReactionOp::Remove => store.remove_reaction(&record).await,
            };
            Completion::ReactionWritten { op, record, result }
        });
    }

    fn start_refetch(&mut self) {
        let Some((generation, ids)) = self.reactions.begin_refetch() else {
            return;
        };
        let store = self.backends.reactions.clone();
        let kind = self.reactions.kind();
        self.tasks.spawn(async move {
            let result = store.list_reactions(&ids, kind).await;
            Completion::ReactionsFetched { generation, result }
        });
    }

    /// Track the stable ids now in the timeline; a changed set triggers a refetch.
    fn refresh_tracked(&mut self) {
        if self
            .reactions
            .set_tracked(self.pipeline.timeline().stable_ids())
        {
            self.start_refetch();
        }
    }

    fn request_history(
        &mut self,
        initial: bool,
        responder: Option<oneshot::Sender<SyncResult<usize>>>,
    ) {
        let cursor = if initial {
            None
        } else {
            self.pipeline
                .timeline()
                .oldest_stable()
                .map(HistoryCursor::before)
        };
        let store = self.backends.messages.clone();
        let conversation_id = self.conversation_id.clone();
        let limit = self.config.history_page_size;
        self.history_in_flight = true;
        self.tasks.spawn(async move {
            let result = store
                .fetch_messages(&conversation_id, cursor.as_ref(), limit)
                .await;
            Completion::History {
                initial,
                result,
                responder,
            }
        });
    }

    fn load_older(&mut self, responder: oneshot::Sender<SyncResult<usize>>) {
        if self.history_in_flight || !self.has_more_history {
            debug!(
                in_flight = self.history_in_flight,
                has_more = self.has_more_history,
                "older history not requested"
            );
            self.respond(responder, Ok(0));
            return;
        }
        self.request_history(false, Some(responder));
    }

    fn on_history(
        &mut self,
        initial: bool,
        result: StoreResult<MessagePage>,
        responder: Option<oneshot::Sender<SyncResult<usize>>>,
    ) {
        self.history_in_flight = false;
        if initial {
            self.loading = false;
        }

        let result = match result {
            Ok(page) => {
                let added = self.pipeline.timeline_mut().prepend_page(page.messages);
                self.has_more_history = page.has_more;
                debug!(added, has_more = page.has_more, "history page loaded");
                self.refresh_tracked();
                if initial {
                    self.spawn_mark_read(None);
                }
                Ok(added)
            }
            Err(err) => {
                warn!(%err, conversation_id = %self.conversation_id, "history fetch failed");
                Err(SyncError::from(err))
            }
        };
        if let Some(responder) = responder {
            self.respond(responder, result);
        }
    }

    fn on_message_event(&mut self, event: MessageEvent) {
        match event {
            MessageEvent::Inserted(message) => {
                if message.conversation_id != self.conversation_id {
                    return;
                }
                let from_other = message.sender_id != self.user.id;
                if self.pipeline.timeline_mut().push_live(message) {
                    self.refresh_tracked();
                    if from_other {
                        self.spawn_mark_read(None);
                    }
                }
            }
            MessageEvent::Updated(message) => {
                if self
                    .pipeline
                    .timeline_mut()
                    .apply_update(&message)
                    .is_none()
                {
                    debug!(message_id = %message.id, "update for a message not loaded");
                }
            }
        }
    }

    fn spawn_mark_read(&mut self, responder: Option<oneshot::Sender<SyncResult<()>>>) {
        let store = self.backends.messages.clone();
        let conversation_id = self.conversation_id.clone();
        let user_id = self.user.id.clone();
        self.tasks.spawn(async move {
            let result = store.mark_read(&conversation_id, &user_id).await;
            Completion::ReadMarked { result, responder }
        });
    }

    fn start_unsend(
        &mut self,
        message_id: MessageId,
        responder: oneshot::Sender<SyncResult<Message>>,
    ) {
        let checked = match self.pipeline.timeline().get(&message_id) {
            None => Err(SyncError::NotFound(message_id.clone())),
            Some(message) if !message.id.is_stable() => {
                Err(SyncError::TemporaryMessage(message_id.clone()))
            }
            Some(message) if message.sender_id != self.user.id => {
                Err(SyncError::NotOwnMessage(message_id.clone()))
            }
            Some(message) if message.is_unsent() => Ok(Some(message.clone())),
            Some(_) => Ok(None),
        };

        match checked {
            Err(err) => self.respond(responder, Err(err)),
            Ok(Some(already)) => self.respond(responder, Ok(already)),
            Ok(None) => {
                let store = self.backends.messages.clone();
                let user_id = self.user.id.clone();
                self.tasks.spawn(async move {
                    let result = store.delete_message(&message_id, &user_id).await;
                    Completion::Unsent { result, responder }
                });
            }
        }
    }

    /// Publish the current view before answering, so callers observe their own effect.
    fn respond<T>(&mut self, responder: oneshot::Sender<T>, value: T) {
        self.publish();
        let _ = responder.send(value);
    }

    fn publish(&mut self) {
        let view = ChatView {
            conversation_id: self.conversation_id.clone(),
            messages: self.pipeline.timeline().messages().to_vec(),
            reactions: self.reactions.summaries().clone(),
            typing: self.presence.state().clone(),
            typing_available: self.presence.is_available(),
            loading: self.loading,
            has_more_history: self.has_more_history,
        };
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }

    async fn shutdown(&mut self) {
        self.timers.cancel_all();
        for (temp_id, in_flight) in self.in_flight.drain() {
            in_flight.abort.abort();
            debug!(%temp_id, "send abandoned by session close");
            let _ = in_flight.outcome.send(Err(SendError::SessionClosed));
        }
        self.tasks.shutdown().await;

        if let Some(stop) = self.presence.on_session_end() {
            self.broadcast(stop);
        }
        self.typing_tx = None;
        if let Some(broadcaster) = self.broadcaster.take() {
            let _ = broadcaster.await;
        }

        self.publish();
        info!(conversation_id = %self.conversation_id, "chat session closed");
    }
}

/// Typing broadcasts go out one at a time, in the order they were produced.
fn spawn_broadcaster(
    bus: Arc<dyn RealtimeBus>,
) -> (mpsc::UnboundedSender<TypingSignal>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<TypingSignal>();
    let handle = tokio::spawn(async move {
        while let Some(signal) = rx.recv().await {
            if let Err(err) = bus.broadcast_typing(signal).await {
                warn!(%err, "typing broadcast failed");
            }
        }
    });
    (tx, handle)
}

/// Next item of an optional subscription; stays pending once it is absent or finished.
async fn next_event<T>(slot: &mut Option<BoxStream<'static, T>>) -> T {
    if let Some(stream) = slot.as_mut() {
        if let Some(item) = stream.next().await {
            return item;
        }
        debug!("realtime subscription ended");
        *slot = None;
    }
    future::pending().await
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}
