//! Typing presence: outgoing rate limiting and incoming indicator state.
//!
//! This type only decides; the session turns its answers into broadcasts and timers. Outgoing,
//! a "typing" signal goes out at most once per broadcast interval and the caller arms the
//! stop-typing timer whenever [`TypingPresence::is_composing`] holds. Incoming, the caller re-arms
//! the expiry timer on [`RemoteEffect::Shown`] and cancels it on [`RemoteEffect::Cleared`].

use campus_chat_messaging::{ConversationId, LocalUser, TypingSignal, UserId};
use std::time::Duration;
use tokio::time::Instant;

const FALLBACK_NAME: &str = "Someone";

/// What the typing indicator shows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypingState {
    pub is_other_typing: bool,
    pub typing_user_id: Option<UserId>,
    pub typing_user_name: Option<String>,
    pub typing_user_avatar: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteEffect {
    Shown,
    Cleared,
    Ignored,
}

#[derive(Debug)]
pub struct TypingPresence {
    conversation_id: ConversationId,
    local_user: LocalUser,
    broadcast_interval: Duration,
    last_broadcast: Option<Instant>,
    composing: bool,
    available: bool,
    state: TypingState,
}

impl TypingPresence {
    pub fn new(
        conversation_id: ConversationId,
        local_user: LocalUser,
        broadcast_interval: Duration,
    ) -> Self {
        Self {
            conversation_id,
            local_user,
            broadcast_interval,
            last_broadcast: None,
            composing: false,
            available: true,
            state: TypingState::default(),
        }
    }

    /// Called on every local text change. Returns the broadcast to emit, if one is due.
    pub fn on_local_input(&mut self, now: Instant) -> Option<TypingSignal> {
        if !self.available {
            return None;
        }
        let due = self
            .last_broadcast
            .map_or(true, |last| now.duration_since(last) >= self.broadcast_interval);
        if !due {
            return None;
        }

        self.last_broadcast = Some(now);
        self.composing = true;
        Some(TypingSignal::typing(
            self.conversation_id.clone(),
            self.local_user.id.clone(),
            Some(self.local_user.display_name().to_owned()),
            self.local_user.avatar_url.clone(),
        ))
    }

    pub fn is_composing(&self) -> bool {
        self.composing
    }

    /// A send ends the composing session. The stop goes out on every send, and the broadcast
    /// window keeps running so the next keystroke waits out the interval.
    pub fn on_send(&mut self) -> Option<TypingSignal> {
        self.composing = false;
        self.available.then(|| self.stop_signal())
    }

    pub fn on_stop_timer(&mut self) -> Option<TypingSignal> {
        self.finish()
    }

    pub fn on_session_end(&mut self) -> Option<TypingSignal> {
        self.finish()
    }

    fn finish(&mut self) -> Option<TypingSignal> {
        if !std::mem::take(&mut self.composing) || !self.available {
            return None;
        }
        Some(self.stop_signal())
    }

    fn stop_signal(&self) -> TypingSignal {
        TypingSignal::stop(self.conversation_id.clone(), self.local_user.id.clone())
    }

    pub fn on_remote(&mut self, signal: &TypingSignal) -> RemoteEffect {
        if signal.conversation_id() != &self.conversation_id
            || signal.user_id() == &self.local_user.id
        {
            return RemoteEffect::Ignored;
        }

        match signal {
            TypingSignal::Typing(payload) => {
                self.state = TypingState {
                    is_other_typing: true,
                    typing_user_id: Some(payload.user_id.clone()),
                    typing_user_name: Some(
                        payload
                            .user_name
                            .clone()
                            .filter(|name| !name.trim().is_empty())
                            .unwrap_or_else(|| FALLBACK_NAME.to_owned()),
                    ),
                    typing_user_avatar: payload.user_avatar.clone(),
                };
                RemoteEffect::Shown
            }
            TypingSignal::StopTyping(_) => {
                self.state = TypingState::default();
                RemoteEffect::Cleared
            }
        }
    }

    pub fn on_expiry(&mut self) {
        self.state = TypingState::default();
    }

    /// Marks the channel as unusable; presence then never shows and never broadcasts.
    pub fn set_available(&mut self, available: bool) {
        self.available = available;
        if !available {
            self.composing = false;
            self.state = TypingState::default();
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn state(&self) -> &TypingState {
        &self.state
    }
}
