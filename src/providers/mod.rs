//! Logical consumers ("providers") and the collector that manages the
//! lifecycle of their queues on the broker.
//!
//! A [`Provider`] names one queue (plus binding and TTL options) and the
//! callback that handles messages arriving on it. Providers outlive any
//! single broker connection: the [`ProviderCollector`] can re-declare their
//! queues after a reconnect, and defers queue deletion for unregistered
//! providers until an explicit undeclare pass.

use amq_protocol_types::{AMQPValue, FieldTable};
use lapin::options::{QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions};
use lapin::{BasicProperties, Channel};
use std::time::Duration;

mod collector;
pub use collector::ProviderCollector;

/// Everything needed to declare one queue and, optionally, bind it to an
/// exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub routing_key: String,
    /// Exchange to bind the queue to. `None` means the queue is addressed
    /// directly through the default exchange (the reply-queue case).
    pub exchange: Option<String>,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Queue-level idle TTL (`x-expires`): the broker deletes the queue if
    /// it goes unused for this window.
    pub idle_ttl: Option<Duration>,
    /// Per-message TTL on the queue (`x-message-ttl`).
    pub message_ttl: Option<Duration>,
}

impl QueueSpec {
    pub(crate) fn queue_arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();
        if let Some(ttl) = self.idle_ttl {
            args.insert("x-expires".into(), AMQPValue::LongInt(ttl_millis(ttl)));
        }
        if let Some(ttl) = self.message_ttl {
            args.insert("x-message-ttl".into(), AMQPValue::LongInt(ttl_millis(ttl)));
        }
        args
    }
}

/// TTL arguments are signed 32-bit on the wire; saturate instead of
/// wrapping for out-of-range durations.
fn ttl_millis(ttl: Duration) -> i32 {
    i32::try_from(ttl.as_millis()).unwrap_or(i32::MAX)
}

/// A logical consumer managed by the [`ProviderCollector`]: one queue plus
/// the callback invoked for every message arriving on it.
#[async_trait::async_trait]
pub trait Provider: Send + Sync + 'static {
    /// Stable identifier used for set membership in the collector.
    fn identity(&self) -> &str;

    /// The queue this provider wants declared.
    fn queue_spec(&self) -> QueueSpec;

    /// Handle one message delivered on the provider's queue.
    async fn handle_message(
        &self,
        properties: &BasicProperties,
        body: &[u8],
    ) -> Result<(), anyhow::Error>;
}

/// The broker-side operations the collector needs. Implemented for
/// [`lapin::Channel`]; a seam for exercising the collector without a broker.
#[async_trait::async_trait]
pub trait QueueOps: Send + Sync {
    /// Ensure the queue exists (create-if-absent) and is bound.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), anyhow::Error>;

    /// Delete the queue.
    async fn delete_queue(&self, name: &str) -> Result<(), anyhow::Error>;
}

#[async_trait::async_trait]
impl QueueOps for Channel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), anyhow::Error> {
        self.queue_declare(
            &spec.name,
            QueueDeclareOptions {
                passive: false,
                durable: false,
                exclusive: spec.exclusive,
                auto_delete: spec.auto_delete,
                nowait: false,
            },
            spec.queue_arguments(),
        )
        .await?;
        if let Some(exchange) = &spec.exchange {
            self.queue_bind(
                &spec.name,
                exchange,
                &spec.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await?;
        }
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), anyhow::Error> {
        self.queue_delete(name, QueueDeleteOptions::default()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_arguments_carry_both_ttls_in_millis() {
        let spec = QueueSpec {
            name: "rpc.reply.abc".into(),
            routing_key: "rpc.reply.abc".into(),
            exchange: None,
            exclusive: true,
            auto_delete: true,
            idle_ttl: Some(Duration::from_secs(30)),
            message_ttl: Some(Duration::from_secs(25)),
        };
        let args = spec.queue_arguments();
        let args = args.inner();
        assert_eq!(args.get("x-expires"), Some(&AMQPValue::LongInt(30_000)));
        assert_eq!(args.get("x-message-ttl"), Some(&AMQPValue::LongInt(25_000)));
    }

    #[test]
    fn oversized_ttls_saturate_instead_of_wrapping() {
        let spec = QueueSpec {
            name: "rpc.reply.abc".into(),
            routing_key: "rpc.reply.abc".into(),
            exchange: None,
            exclusive: true,
            auto_delete: true,
            idle_ttl: Some(Duration::from_secs(u64::MAX / 1_000)),
            message_ttl: None,
        };
        let args = spec.queue_arguments();
        assert_eq!(
            args.inner().get("x-expires"),
            Some(&AMQPValue::LongInt(i32::MAX))
        );
    }
}
