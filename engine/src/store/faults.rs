use super::{StoreError, StoreResult};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Collaborator operations that can be slowed down or failed on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    SendMessage,
    FetchMessages,
    MarkRead,
    DeleteMessage,
    AddReaction,
    RemoveReaction,
    ListReactions,
    Upload,
    SignedUrl,
    FindOrCreateDirect,
    FindGroup,
    CreateGroup,
    AddParticipant,
    SubscribeTyping,
    BroadcastTyping,
    SubscribeReactions,
    SubscribeMessages,
}

#[derive(Debug, Clone)]
pub enum Fault {
    /// Hold the call for this long, then let it through.
    Delay(Duration),
    /// Fail the call without touching storage.
    Fail(StoreError),
}

/// Latency and scripted failures applied in front of every backend call.
///
/// Scripted faults are one-shot and consumed in the order they were pushed.
#[derive(Debug, Default)]
pub struct FaultPlan {
    latency: Mutex<Duration>,
    scripted: Mutex<HashMap<Operation, VecDeque<Fault>>>,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latency added to every call.
    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut current) = self.latency.lock() {
            *current = latency;
        }
    }

    pub fn push(&self, operation: Operation, fault: Fault) {
        if let Ok(mut scripted) = self.scripted.lock() {
            scripted.entry(operation).or_default().push_back(fault);
        }
    }

    pub fn fail_next(&self, operation: Operation, error: StoreError) {
        self.push(operation, Fault::Fail(error));
    }

    pub fn delay_next(&self, operation: Operation, delay: Duration) {
        self.push(operation, Fault::Delay(delay));
    }

    pub(crate) async fn apply(&self, operation: Operation) -> StoreResult<()> {
        let latency = self
            .latency
            .lock()
            .map(|latency| *latency)
            .unwrap_or_default();
        let fault = match self.scripted.lock() {
            Ok(mut scripted) => scripted
                .get_mut(&operation)
                .and_then(VecDeque::pop_front),
            Err(_) => None,
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match fault {
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Some(Fault::Fail(error)) => Err(error),
            None => Ok(()),
        }
    }
}
