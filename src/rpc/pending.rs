use crate::rpc::reply_event::{ReplyPayload, ReplyState};
use std::collections::HashMap;
use std::sync::Weak;
use tokio::sync::Mutex;
use tracing::debug;

/// What happened to one inbound reply message.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    /// Forwarded into a pending event; more replies are expected.
    Delivered,
    /// Forwarded into a pending event which is now terminal; the entry has
    /// been removed from the registry.
    Finished,
    /// No pending entry for this correlation id (late, duplicate, or the
    /// caller dropped its event). The message should be acked and discarded.
    Unknown,
}

/// Correlation id -> pending reply event.
///
/// The registry holds only weak references: the caller that issued the call
/// exclusively owns the event, and an abandoned call must not be kept alive
/// just because a reply might still arrive. Entries are inserted on call
/// issuance and removed on terminal delivery (or lazily, once their weak
/// reference is found dead).
#[derive(Default)]
pub(crate) struct PendingReplies {
    entries: Mutex<HashMap<String, Weak<Mutex<ReplyState>>>>,
}

impl PendingReplies {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a pending event. Correlation ids are caller-generated UUIDs
    /// and never reused while pending, so at most one live entry exists per
    /// id.
    pub(crate) async fn insert(&self, correlation_id: String, state: Weak<Mutex<ReplyState>>) {
        self.entries.lock().await.insert(correlation_id, state);
    }

    /// Route one reply body to the event pending under `correlation_id`.
    pub(crate) async fn dispatch(
        &self,
        correlation_id: &str,
        payload: ReplyPayload,
    ) -> DispatchOutcome {
        let entry = self.entries.lock().await.get(correlation_id).cloned();
        let state = match entry.as_ref().and_then(Weak::upgrade) {
            Some(state) => state,
            None => {
                if entry.is_some() {
                    // the caller dropped its event; reap the dead entry
                    self.entries.lock().await.remove(correlation_id);
                    debug!(correlation_id, "Discarding reply for an abandoned call");
                }
                return DispatchOutcome::Unknown;
            }
        };

        let finished = {
            let mut state = state.lock().await;
            state.apply(payload);
            state.finished()
        };
        if finished {
            self.entries.lock().await.remove(correlation_id);
            DispatchOutcome::Finished
        } else {
            DispatchOutcome::Delivered
        }
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
