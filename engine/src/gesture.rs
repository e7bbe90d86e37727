//! Single/double tap discrimination per message.

use campus_chat_messaging::MessageId;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapOutcome {
    /// First tap of a pairing window.
    Single,
    /// Second tap on the same message inside the window.
    Double,
    /// Press on retracted content.
    Ignored,
}

#[derive(Debug, Clone)]
struct PendingTap {
    message_id: MessageId,
    at: Instant,
}

/// Holds at most one tap awaiting its pair.
#[derive(Debug)]
pub struct TapClassifier {
    window: Duration,
    pending: Option<PendingTap>,
}

impl TapClassifier {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
        }
    }

    pub fn on_press(&mut self, message_id: &MessageId, retracted: bool, now: Instant) -> TapOutcome {
        if retracted {
            return TapOutcome::Ignored;
        }

        let paired = self.pending.as_ref().is_some_and(|pending| {
            &pending.message_id == message_id && now.duration_since(pending.at) < self.window
        });
        if paired {
            self.pending = None;
            return TapOutcome::Double;
        }

        self.pending = Some(PendingTap {
            message_id: message_id.clone(),
            at: now,
        });
        TapOutcome::Single
    }

    /// Deadline after which the pending tap can no longer pair.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|pending| pending.at + self.window)
    }

    /// Drop the pending tap once its window has passed.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    pub fn awaiting(&self) -> Option<&MessageId> {
        self.pending.as_ref().map(|pending| &pending.message_id)
    }
}
