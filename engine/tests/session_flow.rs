use campus_chat_engine::store::{ConversationStore, MessageStore, Operation, ReactionStore};
use campus_chat_engine::{
    Backends, ChatSession, ChatView, LocalBackend, SendError, SendRequest, StoreError, SyncConfig,
    SyncError, TapOutcome,
};
use campus_chat_messaging::{
    ConversationId, DeliveryStatus, LocalUser, MessageId, MessageMetadata, ReactionKind,
    SendFailure, TypingSignal, UserId,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

const ALICE_AVATAR: &str = "https://cdn.campus.test/avatars/alice.png";

struct Harness {
    backend: Arc<LocalBackend>,
    conversation: ConversationId,
    alice: LocalUser,
    bob: LocalUser,
}

impl Harness {
    async fn new() -> Self {
        let backend = Arc::new(LocalBackend::temporary().unwrap());
        let alice = LocalUser::new(UserId::from("alice"))
            .with_display_name("Alice")
            .with_avatar(ALICE_AVATAR);
        let bob = LocalUser::new(UserId::from("bob")).with_display_name("Bob");
        let conversation = backend
            .find_or_create_direct(&alice.id, &bob.id)
            .await
            .unwrap();
        Self {
            backend,
            conversation,
            alice,
            bob,
        }
    }

    async fn open(&self, user: &LocalUser) -> ChatSession {
        let session = ChatSession::open(
            self.conversation.clone(),
            user.clone(),
            Backends::from_local(self.backend.clone()),
            SyncConfig::default(),
        )
        .await;
        wait_until(&session, |view| !view.loading).await;
        session
    }
}

async fn wait_until(session: &ChatSession, condition: impl FnMut(&ChatView) -> bool) -> ChatView {
    let mut view = session.view();
    let snapshot = timeout(Duration::from_secs(120), view.wait_for(condition))
        .await
        .expect("view never reached the expected state")
        .expect("session closed")
        .clone();
    snapshot
}

fn contents(view: &ChatView) -> Vec<String> {
    view.messages.iter().map(|m| m.content.clone()).collect()
}

fn labels(range: std::ops::Range<usize>) -> Vec<String> {
    range.map(|i| format!("message {i}")).collect()
}

/// Let spawned work run to completion before looking at the store.
async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn successful_send_replaces_the_optimistic_entry_in_place() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;

    let pending = alice.send_text("hello").await.unwrap();
    let temp_id = pending.temp_id().clone();
    assert!(temp_id.is_temporary());

    let before = alice.snapshot();
    let shown = before.message(&temp_id).unwrap();
    assert_eq!(shown.content, "hello");
    assert_eq!(shown.delivery_status(), DeliveryStatus::Sending);

    let stored = pending.outcome().await.unwrap();
    assert!(stored.id.is_stable());

    let after = wait_until(&alice, |view| view.message(&stored.id).is_some()).await;
    assert!(after.message(&temp_id).is_none());
    assert_eq!(after.messages.len(), 1);
    assert_eq!(after.messages[0].content, "hello");
    assert_eq!(after.messages[0].status, None);
}

#[tokio::test(start_paused = true)]
async fn timed_out_send_stays_visible_as_failed() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;
    h.backend
        .faults()
        .delay_next(Operation::SendMessage, Duration::from_secs(60));

    let started = Instant::now();
    let pending = alice.send_text("are you there?").await.unwrap();
    let temp_id = pending.temp_id().clone();
    assert_eq!(pending.outcome().await.unwrap_err(), SendError::Timeout);
    assert!(started.elapsed() >= Duration::from_secs(45));

    let view = alice.snapshot();
    assert_eq!(view.messages.len(), 1);
    let failed = view.message(&temp_id).unwrap();
    assert!(failed.is_failed());
    assert_eq!(failed.content, "are you there?");
    assert_eq!(failed.failure, Some(SendFailure::Timeout));
    assert!(failed.advisory().unwrap().contains("might have sent"));
}

#[tokio::test(start_paused = true)]
async fn rejected_send_reads_differently_from_a_timeout() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;
    h.backend.faults().fail_next(
        Operation::SendMessage,
        StoreError::Rejected("conversation archived".into()),
    );

    let pending = alice.send_text("hi").await.unwrap();
    let temp_id = pending.temp_id().clone();
    assert!(matches!(
        pending.outcome().await,
        Err(SendError::RemoteRejected(_))
    ));

    let view = alice.snapshot();
    let failed = view.message(&temp_id).unwrap();
    assert_eq!(failed.failure, Some(SendFailure::Rejected));
    assert!(failed.advisory().unwrap().contains("Failed to send"));
}

#[tokio::test(start_paused = true)]
async fn empty_input_is_rejected_without_an_optimistic_entry() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;

    assert_eq!(
        alice.send_text("  ").await.unwrap_err(),
        SendError::EmptyMessage
    );
    assert!(alice.snapshot().messages.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_upload_hands_the_input_back() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;
    h.backend
        .faults()
        .fail_next(Operation::Upload, StoreError::Unavailable("offline".into()));

    let request = SendRequest::image("file:///tmp/cat.jpg", "look");
    let pending = alice.send(request.clone()).await.unwrap();
    let temp_id = pending.temp_id().clone();

    match pending.outcome().await {
        Err(SendError::Upload { restored, .. }) => assert_eq!(restored, request),
        other => panic!("expected an upload error, got {other:?}"),
    }
    let view = alice.snapshot();
    assert_eq!(
        view.message(&temp_id).unwrap().failure,
        Some(SendFailure::Upload)
    );
}

#[tokio::test(start_paused = true)]
async fn stalled_upload_times_out_and_hands_the_input_back() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;
    h.backend
        .faults()
        .delay_next(Operation::Upload, Duration::from_secs(60));

    let request = SendRequest::image("file:///tmp/dog.jpg", "walk?");
    let started = Instant::now();
    let pending = alice.send(request.clone()).await.unwrap();
    let temp_id = pending.temp_id().clone();

    match pending.outcome().await {
        Err(SendError::Upload { restored, .. }) => assert_eq!(restored, request),
        other => panic!("expected an upload error, got {other:?}"),
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(45), "gave up too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(60), "waited for the stalled upload: {elapsed:?}");

    let view = alice.snapshot();
    let failed = view.message(&temp_id).unwrap();
    assert_eq!(failed.failure, Some(SendFailure::Upload));
    assert_eq!(failed.content, "walk?");
}

#[tokio::test(start_paused = true)]
async fn image_message_call_has_its_own_shorter_timeout() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;
    h.backend
        .faults()
        .delay_next(Operation::SendMessage, Duration::from_secs(20));

    let started = Instant::now();
    let pending = alice
        .send(SendRequest::image("file:///tmp/cat.jpg", ""))
        .await
        .unwrap();
    let temp_id = pending.temp_id().clone();

    assert_eq!(pending.outcome().await.unwrap_err(), SendError::Timeout);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(15), "gave up too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(20), "waited for the slow send: {elapsed:?}");

    let view = alice.snapshot();
    let failed = view.message(&temp_id).unwrap();
    assert_eq!(failed.failure, Some(SendFailure::Timeout));
    assert!(failed.metadata.image_path.is_some());
}

#[tokio::test(start_paused = true)]
async fn out_of_order_acknowledgements_keep_send_order() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;
    h.backend
        .faults()
        .delay_next(Operation::SendMessage, Duration::from_secs(2));

    let slow = alice.send_text("first").await.unwrap();
    let fast = alice.send_text("second").await.unwrap();

    let second = fast.outcome().await.unwrap();
    let mid_flight = alice.snapshot();
    assert_eq!(contents(&mid_flight), vec!["first", "second"]);
    assert!(mid_flight.messages[0].is_optimistic());

    let first = slow.outcome().await.unwrap();
    let view = wait_until(&alice, |view| {
        view.messages.iter().all(|message| message.id.is_stable())
    })
    .await;
    assert_eq!(contents(&view), vec!["first", "second"]);
    assert_eq!(view.messages[0].id, first.id);
    assert_eq!(view.messages[1].id, second.id);
}

#[tokio::test(start_paused = true)]
async fn image_send_keeps_the_local_preview_after_reconciliation() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;

    let pending = alice
        .send(SendRequest::image("file:///tmp/cat.jpg", ""))
        .await
        .unwrap();
    assert!(pending.temp_id().as_str().starts_with("temp-image-"));

    let stored = pending.outcome().await.unwrap();
    assert!(stored.metadata.image_path.is_some());
    assert!(stored
        .metadata
        .image_url
        .as_deref()
        .unwrap()
        .starts_with("local-media://"));
    assert_eq!(stored.metadata.local_uri.as_deref(), Some("file:///tmp/cat.jpg"));

    let server_copy = h
        .backend
        .fetch_messages(&h.conversation, None, 10)
        .await
        .unwrap();
    assert_eq!(server_copy.messages[0].metadata.local_uri, None);
}

#[tokio::test(start_paused = true)]
async fn retry_resends_a_failed_message_as_a_new_entry() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;
    h.backend
        .faults()
        .fail_next(Operation::SendMessage, StoreError::Rejected("flaky".into()));

    let first = alice.send_text("second try").await.unwrap();
    let failed_id = first.temp_id().clone();
    assert!(first.outcome().await.is_err());

    let in_flight = alice.send_text("pending").await.unwrap();
    assert!(matches!(
        alice.retry(in_flight.temp_id()).await,
        Err(SendError::NotRetryable(_))
    ));
    in_flight.outcome().await.unwrap();

    let retried = alice.retry(&failed_id).await.unwrap();
    assert_ne!(retried.temp_id(), &failed_id);
    let stored = retried.outcome().await.unwrap();
    assert_eq!(stored.content, "second try");

    let view = alice.snapshot();
    assert!(view.message(&failed_id).is_none());
    assert_eq!(view.failed_messages().count(), 0);
    assert_eq!(view.messages.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn discard_drops_only_failed_messages() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;
    h.backend
        .faults()
        .fail_next(Operation::SendMessage, StoreError::Rejected("nope".into()));

    let pending = alice.send_text("oops").await.unwrap();
    let temp_id = pending.temp_id().clone();
    let _ = pending.outcome().await;

    alice.discard(&temp_id).await.unwrap();
    assert!(alice.snapshot().messages.is_empty());
    assert_eq!(
        alice.discard(&temp_id).await,
        Err(SendError::NotRetryable(temp_id))
    );
}

#[tokio::test(start_paused = true)]
async fn remote_typing_expires_after_three_seconds() {
    let h = Harness::new().await;
    let bob = h.open(&h.bob).await;

    h.backend
        .hub()
        .publish_typing(TypingSignal::typing(
            h.conversation.clone(),
            h.alice.id.clone(),
            Some("Alice".into()),
            None,
        ))
        .unwrap();

    let shown = wait_until(&bob, |view| view.typing.is_other_typing).await;
    assert_eq!(shown.typing_label().as_deref(), Some("Alice is typing..."));

    let shown_at = Instant::now();
    wait_until(&bob, |view| !view.typing.is_other_typing).await;
    let elapsed = shown_at.elapsed();
    assert!(elapsed >= Duration::from_millis(2900), "cleared too early: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(3100), "cleared too late: {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn own_typing_never_shows_locally() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;
    let bob = h.open(&h.bob).await;

    alice.notify_typing().await.unwrap();
    let seen = wait_until(&bob, |view| view.typing.is_other_typing).await;
    assert_eq!(seen.typing.typing_user_id, Some(h.alice.id.clone()));
    assert_eq!(seen.typing.typing_user_avatar.as_deref(), Some(ALICE_AVATAR));

    h.backend
        .hub()
        .publish_typing(TypingSignal::typing(
            h.conversation.clone(),
            h.alice.id.clone(),
            None,
            None,
        ))
        .unwrap();
    settle().await;
    assert!(!alice.snapshot().typing.is_other_typing);
}

#[tokio::test(start_paused = true)]
async fn sending_clears_the_peer_typing_indicator() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;
    let bob = h.open(&h.bob).await;

    alice.notify_typing().await.unwrap();
    wait_until(&bob, |view| view.typing.is_other_typing).await;

    let sent_at = Instant::now();
    alice.send_text("on my way").await.unwrap();
    wait_until(&bob, |view| !view.typing.is_other_typing).await;
    assert!(sent_at.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn every_send_announces_stop_typing() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;
    let mut signals = h
        .backend
        .hub()
        .subscribe_typing(&h.conversation, &UserId::from("carol"))
        .unwrap();

    alice
        .send_text("no typing first")
        .await
        .unwrap()
        .outcome()
        .await
        .unwrap();

    let signal = timeout(Duration::from_secs(1), signals.next())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(signal, TypingSignal::StopTyping(_)));
    assert_eq!(signal.user_id(), &h.alice.id);
}

#[tokio::test(start_paused = true)]
async fn quiet_composer_sends_stop_typing_after_two_seconds() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;
    let bob = h.open(&h.bob).await;

    alice.notify_typing().await.unwrap();
    wait_until(&bob, |view| view.typing.is_other_typing).await;

    let shown_at = Instant::now();
    wait_until(&bob, |view| !view.typing.is_other_typing).await;
    let elapsed = shown_at.elapsed();
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn double_tap_toggles_one_heart() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;
    let bob = h.open(&h.bob).await;

    let stored = alice
        .send_text("like me")
        .await
        .unwrap()
        .outcome()
        .await
        .unwrap();
    wait_until(&bob, |view| view.message(&stored.id).is_some()).await;

    assert_eq!(bob.press(&stored.id).await.unwrap(), TapOutcome::Single);
    assert_eq!(bob.press(&stored.id).await.unwrap(), TapOutcome::Double);
    settle().await;

    let view = bob.snapshot();
    assert!(view.has_reacted(&stored.id, &h.bob.id));
    assert_eq!(view.reaction_count(&stored.id), 1);

    let records = h
        .backend
        .list_reactions(&[stored.id.clone()], ReactionKind::Heart)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);

    wait_until(&alice, |view| view.reaction_count(&stored.id) == 1).await;
}

#[tokio::test(start_paused = true)]
async fn slow_or_split_taps_toggle_nothing() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;

    let first = alice.send_text("one").await.unwrap().outcome().await.unwrap();
    let second = alice.send_text("two").await.unwrap().outcome().await.unwrap();

    assert_eq!(alice.press(&first.id).await.unwrap(), TapOutcome::Single);
    sleep(Duration::from_millis(401)).await;
    assert_eq!(alice.press(&first.id).await.unwrap(), TapOutcome::Single);
    sleep(Duration::from_millis(401)).await;

    assert_eq!(alice.press(&first.id).await.unwrap(), TapOutcome::Single);
    assert_eq!(alice.press(&second.id).await.unwrap(), TapOutcome::Single);
    settle().await;

    let view = alice.snapshot();
    assert_eq!(view.reaction_count(&first.id), 0);
    assert_eq!(view.reaction_count(&second.id), 0);
    let records = h
        .backend
        .list_reactions(&[first.id.clone(), second.id.clone()], ReactionKind::Heart)
        .await
        .unwrap();
    assert!(records.is_empty());
}

#[tokio::test(start_paused = true)]
async fn duplicate_add_is_not_rolled_back() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;
    let stored = alice.send_text("hi").await.unwrap().outcome().await.unwrap();

    h.backend
        .faults()
        .fail_next(Operation::AddReaction, StoreError::DuplicateConflict);
    alice.toggle_reaction(&stored.id).await.unwrap();
    settle().await;

    assert!(alice.snapshot().has_reacted(&stored.id, &h.alice.id));
}

#[tokio::test(start_paused = true)]
async fn rejected_add_is_rolled_back() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;
    let stored = alice.send_text("hi").await.unwrap().outcome().await.unwrap();

    h.backend.faults().fail_next(
        Operation::AddReaction,
        StoreError::Rejected("permission denied".into()),
    );
    alice.toggle_reaction(&stored.id).await.unwrap();
    settle().await;

    assert!(!alice.snapshot().has_reacted(&stored.id, &h.alice.id));
}

#[tokio::test(start_paused = true)]
async fn reactions_on_unacknowledged_messages_are_refused() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;
    h.backend
        .faults()
        .delay_next(Operation::SendMessage, Duration::from_secs(5));

    let pending = alice.send_text("slow").await.unwrap();
    let temp_id = pending.temp_id().clone();
    assert_eq!(
        alice.toggle_reaction(&temp_id).await,
        Err(SyncError::TemporaryMessage(temp_id.clone()))
    );
    pending.outcome().await.unwrap();
    assert!(alice.snapshot().reactions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn periodic_refetch_covers_a_missing_reaction_feed() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;
    let stored = alice.send_text("hi").await.unwrap().outcome().await.unwrap();

    h.backend.faults().fail_next(
        Operation::SubscribeReactions,
        StoreError::Unavailable("realtime down".into()),
    );
    let bob = h.open(&h.bob).await;
    wait_until(&bob, |view| view.message(&stored.id).is_some()).await;

    h.backend
        .add_reaction(&campus_chat_messaging::ReactionRecord::heart(
            stored.id.clone(),
            h.alice.id.clone(),
        ))
        .await
        .unwrap();
    settle().await;
    assert_eq!(bob.snapshot().reaction_count(&stored.id), 0);

    let started = Instant::now();
    wait_until(&bob, |view| view.reaction_count(&stored.id) == 1).await;
    assert!(started.elapsed() <= Duration::from_secs(31));
}

#[tokio::test(start_paused = true)]
async fn unsend_retracts_for_everyone_and_blocks_hearts() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;
    let bob = h.open(&h.bob).await;

    let stored = alice.send_text("oops").await.unwrap().outcome().await.unwrap();
    wait_until(&bob, |view| view.message(&stored.id).is_some()).await;

    assert_eq!(
        bob.unsend(&stored.id).await,
        Err(SyncError::NotOwnMessage(stored.id.clone()))
    );

    let retracted = alice.unsend(&stored.id).await.unwrap();
    assert!(retracted.is_unsent());
    assert!(retracted.content.is_empty());

    let seen = wait_until(&bob, |view| {
        view.message(&stored.id).is_some_and(|message| message.is_unsent())
    })
    .await;
    assert_eq!(seen.messages.len(), 1);

    assert_eq!(bob.press(&stored.id).await.unwrap(), TapOutcome::Ignored);
    assert_eq!(bob.press(&stored.id).await.unwrap(), TapOutcome::Ignored);
    settle().await;
    assert_eq!(bob.snapshot().reaction_count(&stored.id), 0);
}

#[tokio::test(start_paused = true)]
async fn unsent_messages_refuse_explicit_hearts() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;
    let stored = alice.send_text("never mind").await.unwrap().outcome().await.unwrap();
    alice.unsend(&stored.id).await.unwrap();

    assert_eq!(
        alice.toggle_reaction(&stored.id).await,
        Err(SyncError::Retracted(stored.id.clone()))
    );
    settle().await;

    let view = alice.snapshot();
    assert_eq!(view.reaction_count(&stored.id), 0);
    let records = h
        .backend
        .list_reactions(&[stored.id.clone()], ReactionKind::Heart)
        .await
        .unwrap();
    assert!(records.is_empty());
}

#[tokio::test(start_paused = true)]
async fn history_loads_newest_page_first_then_older_pages() {
    let h = Harness::new().await;
    for i in 0..60 {
        h.backend
            .send_message(
                &h.conversation,
                &h.bob.id,
                &format!("message {i}"),
                &MessageMetadata::default(),
            )
            .await
            .unwrap();
    }

    let alice = h.open(&h.alice).await;
    let view = alice.snapshot();
    assert_eq!(contents(&view), labels(10..60));
    assert!(view.has_more_history);

    assert_eq!(alice.load_older().await.unwrap(), 10);
    let view = alice.snapshot();
    assert_eq!(contents(&view), labels(0..60));
    assert!(!view.has_more_history);
    assert_eq!(alice.load_older().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_typing_channel_only_disables_presence() {
    let h = Harness::new().await;
    h.backend.faults().fail_next(
        Operation::SubscribeTyping,
        StoreError::Unavailable("realtime down".into()),
    );
    let alice = h.open(&h.alice).await;
    assert!(!alice.snapshot().typing_available);

    alice.notify_typing().await.unwrap();
    let stored = alice.send_text("still works").await.unwrap().outcome().await;
    assert!(stored.is_ok());
}

#[tokio::test(start_paused = true)]
async fn closing_resolves_sends_still_in_flight() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;
    h.backend
        .faults()
        .delay_next(Operation::SendMessage, Duration::from_secs(30));

    let pending = alice.send_text("bye").await.unwrap();
    alice.close().await;
    assert_eq!(pending.outcome().await.unwrap_err(), SendError::SessionClosed);
}

#[tokio::test(start_paused = true)]
async fn unknown_message_ids_are_reported() {
    let h = Harness::new().await;
    let alice = h.open(&h.alice).await;
    let missing = MessageId::from("not-here");

    assert_eq!(alice.press(&missing).await.unwrap(), TapOutcome::Ignored);
    assert_eq!(
        alice.unsend(&missing).await,
        Err(SyncError::NotFound(missing.clone()))
    );
    assert_eq!(
        alice.toggle_reaction(&missing).await,
        Err(SyncError::NotFound(missing))
    );
}
