use crate::amqp::configuration::RpcSettings;
use crate::pool::{self, ChannelPool};
use crate::providers::{Provider, QueueSpec};
use crate::rpc::pending::{DispatchOutcome, PendingReplies};
use crate::rpc::reply_event::{ReplyEvent, ReplyPayload, ReplySource, ReplyState};
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicGetOptions};
use lapin::BasicProperties;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, warn};
use uuid::Uuid;

/// Sleep between empty `basic_get` probes while a poll window is open.
const GET_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The single shared reply consumer for one RPC client.
///
/// It owns one exclusive, auto-deleting reply queue (`rpc.reply.<uuid>`,
/// with a bounded idle TTL so the broker reaps it if the process dies) and
/// demultiplexes everything arriving on it by correlation id into the
/// pending events. It is a [`Provider`], so its queue lifecycle is managed
/// by the [`ProviderCollector`](crate::providers::ProviderCollector) like
/// any other consumer's.
///
/// There is no background consumer task: the queue is drained only when a
/// caller pumps it through [`ReplyEvent::refresh`] (or directly via
/// [`refresh_reply_events`](ReplyListener::refresh_reply_events)), one
/// bounded poll window at a time.
pub struct ReplyListener {
    channel_pool: ChannelPool,
    queue: QueueSpec,
    accept: Vec<String>,
    pending: PendingReplies,
}

impl ReplyListener {
    /// Create a listener with a fresh process-unique reply queue. The queue
    /// is declared later, through the provider collector.
    pub fn new(channel_pool: ChannelPool, settings: &RpcSettings) -> Self {
        let routing_key = format!("rpc.reply.{}", Uuid::new_v4());
        // The reply goes through the default exchange: the remote worker
        // publishes directly to the queue named in reply_to, so no binding
        // is needed.
        let queue = QueueSpec {
            name: routing_key.clone(),
            routing_key,
            exchange: None,
            exclusive: true,
            auto_delete: true,
            idle_ttl: Some(Duration::from_secs(settings.reply_queue_ttl_seconds)),
            message_ttl: None,
        };
        Self {
            channel_pool,
            queue,
            accept: settings.accept.clone(),
            pending: PendingReplies::new(),
        }
    }

    /// The name of the reply queue, used as the `reply_to` property on every
    /// outgoing request.
    pub fn queue_name(&self) -> &str {
        &self.queue.name
    }

    /// Allocate a pending [`ReplyEvent`] for `correlation_id`.
    ///
    /// The registry keeps only a weak reference: the returned handle is the
    /// sole owner of the call's state.
    pub async fn get_reply_event(
        self: Arc<Self>,
        correlation_id: String,
        timeout: Duration,
    ) -> ReplyEvent {
        let state = Arc::new(Mutex::new(ReplyState::new(correlation_id.clone(), timeout)));
        self.pending
            .insert(correlation_id.clone(), Arc::downgrade(&state))
            .await;
        ReplyEvent::new(state, self as Arc<dyn ReplySource>, correlation_id)
    }

    /// Drain up to `limit` messages currently available on the reply queue,
    /// waiting at most `poll_timeout` overall.
    ///
    /// Each drained message is dispatched by correlation id and acknowledged
    /// after dispatch (at-least-once at this boundary). Replies without a
    /// matching pending entry are acknowledged and discarded.
    pub async fn refresh_reply_events(
        &self,
        limit: Option<usize>,
        poll_timeout: Duration,
    ) -> Result<(), ListenError> {
        let channel = pool::acquire(&self.channel_pool, true, Some(poll_timeout))
            .await
            .map_err(|e| match e {
                pool::Error::Unavailable => ListenError::Unavailable,
                pool::Error::Backend(e) => ListenError::Broker(e),
            })?;

        let deadline = Instant::now() + poll_timeout;
        let mut drained = 0usize;
        loop {
            if limit.is_some_and(|max| drained >= max) {
                break;
            }
            let message = channel
                .basic_get(&self.queue.name, BasicGetOptions { no_ack: false })
                .await
                .map_err(|e| {
                    // A NOT_FOUND here usually means the queue's idle TTL
                    // fired and the broker deleted it.
                    error!(
                        queue = %self.queue.name,
                        "Failed to poll the reply queue: {e:?}",
                    );
                    ListenError::Broker(e.into())
                })?;
            match message {
                Some(message) => {
                    self.dispatch_delivery(message.delivery).await;
                    drained += 1;
                }
                None => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    tokio::time::sleep(GET_POLL_INTERVAL.min(deadline - now)).await;
                }
            }
        }
        Ok(())
    }

    async fn dispatch_delivery(&self, delivery: Delivery) {
        if let Err(e) = self.handle_message(&delivery.properties, &delivery.data).await {
            warn!("Failed to dispatch reply message: {e:?}");
        }
        // Ack only after dispatch: a crash in between causes redelivery
        // rather than a lost reply.
        if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
            // The broker will reclaim and redeliver the message.
            warn!("Failed to ack reply message: {e:?}");
        }
    }
}

#[async_trait::async_trait]
impl Provider for ReplyListener {
    fn identity(&self) -> &str {
        &self.queue.name
    }

    fn queue_spec(&self) -> QueueSpec {
        self.queue.clone()
    }

    async fn handle_message(
        &self,
        properties: &BasicProperties,
        body: &[u8],
    ) -> Result<(), anyhow::Error> {
        let correlation_id = match properties.correlation_id() {
            Some(id) => id.as_str().to_owned(),
            None => {
                warn!("Discarding reply message without a correlation id");
                return Ok(());
            }
        };
        if let Some(content_type) = properties.content_type() {
            if !self.accept.iter().any(|a| a == content_type.as_str()) {
                warn!(
                    %correlation_id,
                    content_type = %content_type.as_str(),
                    "Discarding reply with an unaccepted content type",
                );
                return Ok(());
            }
        }
        let payload: ReplyPayload = match serde_json::from_slice(body) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%correlation_id, "Discarding malformed reply body: {e}");
                return Ok(());
            }
        };
        if self.pending.dispatch(&correlation_id, payload).await == DispatchOutcome::Unknown {
            warn!(%correlation_id, "Discarding reply with unknown correlation id");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ReplySource for ReplyListener {
    async fn pump(&self, limit: Option<usize>, poll_timeout: Duration) -> Result<(), ListenError> {
        self.refresh_reply_events(limit, poll_timeout).await
    }
}

/// Error returned while polling the reply queue.
#[derive(thiserror::Error, Debug)]
pub enum ListenError {
    /// The channel pool was exhausted for the whole poll window.
    #[error("No pooled channel was available to poll the reply queue")]
    Unavailable,
    #[error("Error while polling the reply queue")]
    Broker(#[source] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::configuration::RabbitMqSettings;
    use crate::amqp::ConnectionFactory;
    use crate::pool::{ChannelManager, ConnectionPool};
    use crate::rpc::reply_event::ReplyStatus;
    use serde_json::json;

    // Pools are lazy: nothing here talks to a broker.
    fn listener() -> Arc<ReplyListener> {
        let factory = ConnectionFactory::new_from_config(&RabbitMqSettings::default()).unwrap();
        let connection_pool = ConnectionPool::builder(factory).max_size(1).build().unwrap();
        let channel_pool = ChannelPool::builder(ChannelManager::new(connection_pool))
            .max_size(1)
            .build()
            .unwrap();
        Arc::new(ReplyListener::new(channel_pool, &RpcSettings::default()))
    }

    fn reply_properties(correlation_id: &str) -> BasicProperties {
        BasicProperties::default().with_correlation_id(correlation_id.into())
    }

    #[test]
    fn reply_queue_is_exclusive_auto_deleting_with_idle_ttl() {
        let listener = listener();
        let spec = listener.queue_spec();
        assert!(spec.name.starts_with("rpc.reply."));
        assert_eq!(spec.routing_key, spec.name);
        assert_eq!(spec.exchange, None);
        assert!(spec.exclusive);
        assert!(spec.auto_delete);
        assert_eq!(spec.idle_ttl, Some(Duration::from_secs(30)));
    }

    #[test]
    fn each_listener_gets_its_own_queue() {
        assert_ne!(listener().queue_name(), listener().queue_name());
    }

    #[tokio::test]
    async fn inbound_replies_reach_the_matching_event() {
        let listener = listener();
        let event = listener
            .clone()
            .get_reply_event("corr-1".into(), Duration::from_secs(5))
            .await;

        let body = serde_json::to_vec(&json!({"status": "STARTED", "result": null})).unwrap();
        let properties = reply_properties("corr-1").with_content_type("application/json".into());
        listener.handle_message(&properties, &body).await.unwrap();

        assert_eq!(event.snapshot().await.status, ReplyStatus::Started);
    }

    #[tokio::test]
    async fn replies_with_an_unaccepted_content_type_are_discarded() {
        let listener = listener();
        let event = listener
            .clone()
            .get_reply_event("corr-1".into(), Duration::from_secs(5))
            .await;

        let body = serde_json::to_vec(&json!({"status": "SUCCESS", "result": 1})).unwrap();
        let properties = reply_properties("corr-1").with_content_type("application/x-pickle".into());
        listener.handle_message(&properties, &body).await.unwrap();

        // Untouched: the reply never reached the event.
        assert_eq!(event.snapshot().await.status, ReplyStatus::Inited);
    }

    #[tokio::test]
    async fn unknown_and_malformed_replies_are_swallowed() {
        let listener = listener();

        let body = serde_json::to_vec(&json!({"status": "SUCCESS"})).unwrap();
        listener
            .handle_message(&reply_properties("nobody"), &body)
            .await
            .unwrap();

        listener
            .handle_message(&reply_properties("corr-1"), b"not json")
            .await
            .unwrap();

        listener
            .handle_message(&BasicProperties::default(), &body)
            .await
            .unwrap();
    }
}
