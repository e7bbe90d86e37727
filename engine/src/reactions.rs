//! Heart reaction membership with optimistic toggles.
//!
//! Two writers feed the same map: the periodic full refetch, which replaces it wholesale, and the
//! live change feed, which patches single records in between. Neither waits for the other.

use crate::store::{StoreError, StoreResult};
use campus_chat_messaging::{MessageId, ReactionChange, ReactionKind, ReactionRecord, UserId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Users who reacted to one message. Never stored empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReactionSummary {
    pub user_ids: BTreeSet<UserId>,
}

impl ReactionSummary {
    pub fn count(&self) -> usize {
        self.user_ids.len()
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.user_ids.contains(user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionOp {
    Add,
    Remove,
}

#[derive(Debug)]
pub struct ReactionSynchronizer {
    kind: ReactionKind,
    summaries: BTreeMap<MessageId, ReactionSummary>,
    tracked: BTreeSet<MessageId>,
    issued_generation: u64,
    applied_generation: u64,
}

impl ReactionSynchronizer {
    pub fn new(kind: ReactionKind) -> Self {
        Self {
            kind,
            summaries: BTreeMap::new(),
            tracked: BTreeSet::new(),
            issued_generation: 0,
            applied_generation: 0,
        }
    }

    pub fn kind(&self) -> ReactionKind {
        self.kind
    }

    /// Flip `user_id`'s reaction locally and return the remote write that should follow.
    ///
    /// Messages without a stable id have no server record yet, so nothing happens for them.
    pub fn toggle(
        &mut self,
        message_id: &MessageId,
        user_id: &UserId,
    ) -> Option<(ReactionOp, ReactionRecord)> {
        if !message_id.is_stable() {
            warn!(%message_id, "reaction toggle ignored for a message without a stable id");
            return None;
        }

        let record = ReactionRecord {
            message_id: message_id.clone(),
            user_id: user_id.clone(),
            kind: self.kind,
        };
        if self.has_reacted(message_id, user_id) {
            self.remove(&record);
            Some((ReactionOp::Remove, record))
        } else {
            self.insert(&record);
            Some((ReactionOp::Add, record))
        }
    }

    /// Settle an optimistic toggle. Returns true when local state was rolled back.
    pub fn on_remote_result(
        &mut self,
        op: ReactionOp,
        record: &ReactionRecord,
        result: &StoreResult<()>,
    ) -> bool {
        match (op, result) {
            (_, Ok(())) => false,
            (ReactionOp::Add, Err(StoreError::DuplicateConflict)) => {
                debug!(message_id = %record.message_id, "reaction already stored");
                false
            }
            (ReactionOp::Remove, Err(StoreError::NotFound(_))) => false,
            (ReactionOp::Add, Err(err)) => {
                warn!(%err, message_id = %record.message_id, "reaction add failed, rolling back");
                self.remove(record);
                true
            }
            (ReactionOp::Remove, Err(err)) => {
                warn!(%err, message_id = %record.message_id, "reaction remove failed, rolling back");
                if self.tracked.contains(&record.message_id) {
                    self.insert(record);
                }
                true
            }
        }
    }

    /// Patch a single live change. Returns true when the map changed.
    pub fn apply_change(&mut self, change: &ReactionChange) -> bool {
        let record = change.record();
        if record.kind != self.kind || !self.tracked.contains(&record.message_id) {
            return false;
        }
        match change {
            ReactionChange::Added(record) => self.insert(record),
            ReactionChange::Removed(record) => self.remove(record),
        }
    }

    /// Replace the tracked id set. Temporary ids are dropped. Returns true when the set changed.
    pub fn set_tracked<'a>(&mut self, ids: impl IntoIterator<Item = &'a MessageId>) -> bool {
        let tracked: BTreeSet<MessageId> = ids
            .into_iter()
            .filter(|id| id.is_stable())
            .cloned()
            .collect();
        if tracked == self.tracked {
            return false;
        }
        self.summaries.retain(|id, _| tracked.contains(id));
        self.tracked = tracked;
        true
    }

    /// Start a full refetch. `None` means nothing is tracked and state was cleared in place.
    pub fn begin_refetch(&mut self) -> Option<(u64, Vec<MessageId>)> {
        if self.tracked.is_empty() {
            self.summaries.clear();
            return None;
        }
        self.issued_generation += 1;
        Some((self.issued_generation, self.tracked.iter().cloned().collect()))
    }

    /// Install a refetch result unless a newer one has already been applied.
    pub fn apply_refetch(&mut self, generation: u64, records: Vec<ReactionRecord>) -> bool {
        if generation <= self.applied_generation {
            debug!(generation, applied = self.applied_generation, "stale reaction refetch dropped");
            return false;
        }
        self.applied_generation = generation;

        let mut summaries: BTreeMap<MessageId, ReactionSummary> = BTreeMap::new();
        for record in records {
            if record.kind != self.kind || !self.tracked.contains(&record.message_id) {
                continue;
            }
            summaries
                .entry(record.message_id)
                .or_default()
                .user_ids
                .insert(record.user_id);
        }
        self.summaries = summaries;
        true
    }

    pub fn summary(&self, message_id: &MessageId) -> Option<&ReactionSummary> {
        self.summaries.get(message_id)
    }

    pub fn count(&self, message_id: &MessageId) -> usize {
        self.summary(message_id).map_or(0, ReactionSummary::count)
    }

    pub fn has_reacted(&self, message_id: &MessageId, user_id: &UserId) -> bool {
        self.summary(message_id)
            .is_some_and(|summary| summary.contains(user_id))
    }

    pub fn summaries(&self) -> &BTreeMap<MessageId, ReactionSummary> {
        &self.summaries
    }

    pub fn tracked(&self) -> &BTreeSet<MessageId> {
        &self.tracked
    }

    fn insert(&mut self, record: &ReactionRecord) -> bool {
        self.summaries
            .entry(record.message_id.clone())
            .or_default()
            .user_ids
            .insert(record.user_id.clone())
    }

    fn remove(&mut self, record: &ReactionRecord) -> bool {
        let Some(summary) = self.summaries.get_mut(&record.message_id) else {
            return false;
        };
        let removed = summary.user_ids.remove(&record.user_id);
        if summary.user_ids.is_empty() {
            self.summaries.remove(&record.message_id);
        }
        removed
    }
}
