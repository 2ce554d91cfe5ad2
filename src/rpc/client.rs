use crate::amqp::configuration::{RabbitMqSettings, RpcSettings};
use crate::amqp::ConnectionFactory;
use crate::pool::{ChannelManager, ChannelPool, ConnectionPool};
use crate::providers::ProviderCollector;
use crate::publishers::{CallEnvelope, PublishError, Publisher};
use crate::rpc::reply_event::{ReplyEvent, ReplyPayload, ReplyStatus};
use crate::rpc::reply_listener::ReplyListener;
use anyhow::anyhow;
use lapin::options::ExchangeDeclareOptions;
use lapin::types::{AMQPValue, FieldTable};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// The arguments of one remote method invocation.
///
/// On the wire the body is the three-element array
/// `[args, kwargs, {"callbacks": null, "errbacks": null, "chain": null,
/// "chord": null}]`, which is what the Celery workers on the other side
/// expect to unpack.
#[derive(Debug, Clone, Default)]
pub struct CallPayload {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl CallPayload {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let body = json!([
            self.args,
            self.kwargs,
            {"callbacks": null, "errbacks": null, "chain": null, "chord": null},
        ]);
        serde_json::to_vec(&body)
    }
}

/// The entrypoint for issuing RPC requests to other applications.
///
/// One client owns one connection pool, one confirming publisher, one shared
/// reply listener and the collector tracking the queues it declared. Build
/// it once per process and share it behind an `Arc`.
pub struct RpcClient {
    src_app: String,
    settings: RpcSettings,
    channel_pool: ChannelPool,
    publisher: Publisher,
    listener: Arc<ReplyListener>,
    collector: Mutex<ProviderCollector>,
    topology_ready: AtomicBool,
}

impl RpcClient {
    /// Start building a client for the application named `src_app`. The name
    /// travels in the headers of every request so the remote side can tell
    /// who is calling.
    pub fn builder(src_app: impl Into<String>) -> RpcClientBuilder {
        RpcClientBuilder {
            src_app: src_app.into(),
            rabbitmq: RabbitMqSettings::default(),
            rpc: RpcSettings::default(),
            max_connections: 2,
            max_channels: 8,
            publish_timeout: None,
        }
    }

    /// Declare the exchange and every queue the collector tracks, once.
    ///
    /// Invoked lazily by [`call`](RpcClient::call); safe to invoke eagerly
    /// at startup to fail fast on broker misconfiguration.
    pub async fn ensure_topology(&self) -> Result<(), RpcError> {
        if self.topology_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        // The collector lock serializes concurrent first calls.
        let mut collector = self.collector.lock().await;
        if self.topology_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let channel = crate::pool::acquire(&self.channel_pool, true, None)
            .await
            .map_err(|e| RpcError::Topology(e.into()))?;
        channel
            .exchange_declare(
                &self.settings.exchange_name,
                self.settings.exchange_kind.into(),
                ExchangeDeclareOptions {
                    durable: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RpcError::Topology(e.into()))?;
        collector
            .declare(&*channel)
            .await
            .map_err(RpcError::Topology)?;
        self.topology_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Forget everything declared so far, forcing a full re-declaration on
    /// the next call. Invoke after the broker connection was lost: the
    /// reply queue may have been reaped by its idle TTL in the meantime.
    pub async fn reset_topology(&self) {
        self.topology_ready.store(false, Ordering::Release);
        self.collector.lock().await.reset_declarations();
    }

    /// Issue a request to `method` of the application `dst_app`.
    ///
    /// Publish failures attributable to the broker or the destination are
    /// folded into the returned [`ReplyEvent`] as `FAIL_CONN` /
    /// `FAIL_PUBLISH` terminal states instead of surfacing as errors, so
    /// callers have a single place to look at the outcome. Local failures
    /// (pool exhaustion, serialization, publish timeout) still propagate.
    #[tracing::instrument(
        skip_all,
        fields(rpc.dst_app = %dst_app, rpc.method = %method)
    )]
    pub async fn call(
        &self,
        dst_app: &str,
        method: &str,
        payload: &CallPayload,
    ) -> Result<ReplyEvent, RpcError> {
        self.ensure_topology().await?;

        let correlation_id = Uuid::new_v4().to_string();
        let routing_key = format!("rpc.{dst_app}.{method}");
        let body = payload.to_bytes()?;
        let event = Arc::clone(&self.listener)
            .get_reply_event(
                correlation_id.clone(),
                Duration::from_secs(self.settings.reply_timeout_seconds),
            )
            .await;

        let envelope = CallEnvelope::new(
            body,
            self.settings.exchange_name.clone(),
            routing_key.clone(),
        )
        .with_correlation_id(correlation_id.as_str().into())
        .with_reply_to(self.listener.queue_name().into())
        .with_content_type(self.settings.content_type().into())
        .with_headers(self.request_headers(dst_app, method, &correlation_id));

        match self.publisher.publish(&envelope).await {
            Ok(()) => Ok(event),
            Err(PublishError::Undeliverable {
                exchange,
                routing_key,
            }) => {
                warn!(
                    %correlation_id,
                    %routing_key, "RPC request was unroutable, failing the event"
                );
                event
                    .send(fail_payload(
                        ReplyStatus::FailPublish,
                        &exchange,
                        &routing_key,
                        "The request could not be routed to any queue",
                    ))
                    .await;
                Ok(event)
            }
            Err(e @ PublishError::Connectivity(_)) => {
                warn!(
                    %correlation_id,
                    %routing_key, "Failed to reach the broker, failing the event: {e}"
                );
                event
                    .send(fail_payload(
                        ReplyStatus::FailConn,
                        &self.settings.exchange_name,
                        &routing_key,
                        &e.to_string(),
                    ))
                    .await;
                Ok(event)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the reply queue and tear down tracked declarations. The
    /// client is unusable afterwards.
    pub async fn shutdown(&self) {
        let mut collector = self.collector.lock().await;
        collector.unregister(self.listener.queue_name());
        match crate::pool::acquire(&self.channel_pool, true, Some(Duration::from_secs(3))).await {
            Ok(channel) => collector.undeclare(&*channel).await,
            Err(e) => {
                // The broker reaps the queue through its idle TTL anyway.
                warn!("Could not acquire a channel to undeclare queues: {e}");
            }
        }
        self.topology_ready.store(false, Ordering::Release);
    }

    fn request_headers(&self, dst_app: &str, method: &str, correlation_id: &str) -> FieldTable {
        let mut nested = FieldTable::default();
        nested.insert(
            "src_app".into(),
            AMQPValue::LongString(self.src_app.as_str().into()),
        );
        let mut headers = FieldTable::default();
        headers.insert(
            "id".into(),
            AMQPValue::LongString(correlation_id.into()),
        );
        headers.insert(
            "content_type".into(),
            AMQPValue::LongString(self.settings.content_type().into()),
        );
        // Celery task-protocol routing: the worker resolves the handler
        // from this dotted path.
        headers.insert(
            "task".into(),
            AMQPValue::LongString(format!("{dst_app}.async_tasks.{method}").into()),
        );
        headers.insert("headers".into(), AMQPValue::FieldTable(nested));
        headers
    }
}

fn fail_payload(status: ReplyStatus, exchange: &str, routing_key: &str, error: &str) -> ReplyPayload {
    ReplyPayload {
        status: status.as_str().to_owned(),
        result: Some(json!({
            "exchange": exchange,
            "routing_key": routing_key,
        })),
        error: Some(error.to_owned()),
    }
}

/// A builder for [`RpcClient`]. Use [`RpcClient::builder`] as entrypoint.
pub struct RpcClientBuilder {
    src_app: String,
    rabbitmq: RabbitMqSettings,
    rpc: RpcSettings,
    max_connections: usize,
    max_channels: usize,
    publish_timeout: Option<Duration>,
}

impl RpcClientBuilder {
    pub fn rabbitmq_settings(mut self, settings: RabbitMqSettings) -> Self {
        self.rabbitmq = settings;
        self
    }

    pub fn rpc_settings(mut self, settings: RpcSettings) -> Self {
        self.rpc = settings;
        self
    }

    /// Size of the underlying connection pool.
    pub fn max_connections(mut self, size: usize) -> Self {
        self.max_connections = size;
        self
    }

    /// Size of the channel pool shared by the publisher and the reply
    /// listener.
    pub fn max_channels(mut self, size: usize) -> Self {
        self.max_channels = size;
        self
    }

    /// Deadline on one publish, retries included. When unset it is derived
    /// from the retry policy, so the configured retries always get to run.
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = Some(timeout);
        self
    }

    /// Assemble the client. No broker connection is established here: pools
    /// connect lazily on first use.
    pub fn build(self) -> Result<RpcClient, RpcError> {
        if self.rpc.serializer != "json" {
            return Err(RpcError::Configuration(format!(
                "unsupported serializer `{}`, only `json` is supported",
                self.rpc.serializer
            )));
        }
        let factory =
            ConnectionFactory::new_from_config(&self.rabbitmq).map_err(RpcError::Setup)?;
        let connection_pool = ConnectionPool::builder(factory)
            .max_size(self.max_connections)
            .build()
            .map_err(|e| RpcError::Setup(anyhow!("{e}")))?;
        let channel_pool = ChannelPool::builder(ChannelManager::new(connection_pool))
            .max_size(self.max_channels)
            .build()
            .map_err(|e| RpcError::Setup(anyhow!("{e}")))?;

        let retry = &self.rpc.retry;
        let publish_timeout = self.publish_timeout.unwrap_or_else(|| {
            let backoff: Duration = (1..=retry.max_retries).map(|r| retry.interval(r)).sum();
            backoff + Duration::from_secs(3) * (retry.max_retries + 1)
        });
        let publisher = Publisher::builder(channel_pool.clone())
            .publish_timeout(publish_timeout)
            .retry_policy(self.rpc.retry.clone())
            .build();
        let listener = Arc::new(ReplyListener::new(channel_pool.clone(), &self.rpc));

        let mut collector = ProviderCollector::new();
        collector.register(Arc::clone(&listener) as _);

        Ok(RpcClient {
            src_app: self.src_app,
            settings: self.rpc,
            channel_pool,
            publisher,
            listener,
            collector: Mutex::new(collector),
            topology_ready: AtomicBool::new(false),
        })
    }
}

/// Error returned by [`RpcClient`] operations.
#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    #[error("Invalid RPC configuration: {0}")]
    Configuration(String),
    #[error("Failed to assemble the RPC client")]
    Setup(#[source] anyhow::Error),
    #[error("Failed to declare the RPC topology")]
    Topology(#[source] anyhow::Error),
    #[error("Failed to serialize the request payload")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Publish(#[from] PublishError),
}
