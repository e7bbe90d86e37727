//! Named deadlines owned by a chat session.
//!
//! Every time box in the engine is an entry in one [`TimerRegistry`] keyed by role (and by message
//! for per-send timers). The session loop sleeps until [`TimerRegistry::next_deadline`] and drains
//! whatever [`TimerRegistry::take_expired`] hands back; ending the session cancels them as a unit.

use campus_chat_messaging::MessageId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerRole {
    SendTimeout,
    UploadTimeout,
    TypingStop,
    TypingExpiry,
    TapPairing,
    ReactionRefetch,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub role: TimerRole,
    pub scope: Option<MessageId>,
}

impl TimerKey {
    /// A timer of which a session has at most one.
    pub fn session(role: TimerRole) -> Self {
        Self { role, scope: None }
    }

    pub fn message(role: TimerRole, message_id: MessageId) -> Self {
        Self {
            role,
            scope: Some(message_id),
        }
    }
}

#[derive(Debug, Default)]
pub struct TimerRegistry {
    deadlines: HashMap<TimerKey, Instant>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm or re-arm `key`. Re-arming replaces the previous deadline.
    pub fn arm(&mut self, key: TimerKey, deadline: Instant) {
        self.deadlines.insert(key, deadline);
    }

    pub fn arm_after(&mut self, key: TimerKey, delay: Duration) {
        self.arm(key, Instant::now() + delay);
    }

    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        self.deadlines.remove(key).is_some()
    }

    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.deadlines.contains_key(key)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Remove and return every timer due at `now`, earliest first.
    pub fn take_expired(&mut self, now: Instant) -> Vec<TimerKey> {
        let mut due: Vec<(Instant, TimerKey)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, deadline)| (*deadline, key.clone()))
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.role.cmp(&b.1.role)));

        for (_, key) in &due {
            self.deadlines.remove(key);
        }
        due.into_iter().map(|(_, key)| key).collect()
    }

    pub fn cancel_all(&mut self) {
        self.deadlines.clear();
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}
