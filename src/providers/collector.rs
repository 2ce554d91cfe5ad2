use crate::providers::{Provider, QueueOps};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error};

/// Tracks the set of [`Provider`]s that want to receive messages on a shared
/// connection, and keeps their queues declared on the broker.
///
/// Queue deletion for unregistered providers is deferred: `unregister` only
/// parks the provider, and the queue is actually deleted on the next
/// [`undeclare`](ProviderCollector::undeclare) pass. This lets a provider be
/// removed quiescently, without an extra synchronization point with the
/// broker at unregister time.
#[derive(Default)]
pub struct ProviderCollector {
    active: HashMap<String, Arc<dyn Provider>>,
    pending_undeclare: HashMap<String, Arc<dyn Provider>>,
    /// Queue names already declared through this collector. Cleared by
    /// [`reset_declarations`](ProviderCollector::reset_declarations) so a
    /// reconnect can re-declare everything.
    declared: HashSet<String>,
    providers_registered: bool,
}

impl ProviderCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider to the active set.
    ///
    /// Re-registering an identity that is parked for undeclare revives it:
    /// its queue will not be deleted on the next undeclare pass.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let identity = provider.identity().to_owned();
        self.pending_undeclare.remove(&identity);
        self.active.insert(identity, provider);
        self.providers_registered = true;
    }

    /// Move a provider out of the active set, parking it for deletion on the
    /// next undeclare pass. Unknown identities are ignored.
    pub fn unregister(&mut self, identity: &str) {
        if let Some(provider) = self.active.remove(identity) {
            self.pending_undeclare.insert(identity.to_owned(), provider);
        }
        if self.active.is_empty() {
            self.providers_registered = false;
        }
    }

    /// Whether any provider is currently registered.
    pub fn has_active_providers(&self) -> bool {
        self.providers_registered
    }

    /// Ensure the queue of every active provider exists on the broker.
    ///
    /// Idempotent per collector: a queue already declared through this
    /// collector is skipped, so the call is safe to repeat on every use of a
    /// provider. Declaration itself is create-if-absent on the broker side,
    /// so re-declaring after [`reset_declarations`] cannot fail with a
    /// double-declaration error either.
    ///
    /// [`reset_declarations`]: ProviderCollector::reset_declarations
    pub async fn declare(&mut self, ops: &dyn QueueOps) -> Result<(), anyhow::Error> {
        for provider in self.active.values() {
            let spec = provider.queue_spec();
            if self.declared.contains(&spec.name) {
                continue;
            }
            debug!(queue = %spec.name, "Declaring provider queue");
            ops.declare_queue(&spec).await?;
            self.declared.insert(spec.name);
        }
        Ok(())
    }

    /// Delete the queues of every provider unregistered since the last pass.
    ///
    /// Deletion failures are logged and the provider is dropped anyway: the
    /// queue either no longer exists or will be reaped by its own TTL.
    pub async fn undeclare(&mut self, ops: &dyn QueueOps) {
        for (identity, provider) in self.pending_undeclare.drain() {
            let spec = provider.queue_spec();
            if let Err(e) = ops.delete_queue(&spec.name).await {
                error!(
                    identity = %identity,
                    queue = %spec.name,
                    "Failed to delete queue of unregistered provider: {e:?}",
                );
            }
            self.declared.remove(&spec.name);
        }
    }

    /// Forget which queues have been declared, so the next
    /// [`declare`](ProviderCollector::declare) re-creates them. Meant to be
    /// called after a broker reconnect.
    pub fn reset_declarations(&mut self) {
        self.declared.clear();
    }
}
