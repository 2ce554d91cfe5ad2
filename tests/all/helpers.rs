use anyhow::Context;
use funnel_cake::amqp::configuration::{RabbitMqSettings, RpcSettings};
use funnel_cake::amqp::ConnectionFactory;
use funnel_cake::rpc::RpcClient;
use lapin::options::{
    BasicGetOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::BasicProperties;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

pub fn get_rabbitmq_settings() -> RabbitMqSettings {
    RabbitMqSettings::default()
}

/// RPC settings with a test-unique exchange, so concurrent tests never see
/// each other's bindings.
pub fn get_rpc_settings() -> RpcSettings {
    RpcSettings {
        exchange_name: unique("rpc-test"),
        ..RpcSettings::default()
    }
}

pub fn get_client(rpc_settings: RpcSettings) -> RpcClient {
    RpcClient::builder("test-app")
        .rabbitmq_settings(get_rabbitmq_settings())
        .rpc_settings(rpc_settings)
        .build()
        .unwrap()
}

pub fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

/// A hand-rolled stand-in for the remote application: one bound request
/// queue, answered with a scripted sequence of reply bodies.
pub struct Responder {
    channel: lapin::Channel,
    queue: String,
}

impl Responder {
    /// Declare the exchange and the request queue for `dst_app.method`, so a
    /// mandatory publish issued afterwards has somewhere to land.
    pub async fn bind(rpc: &RpcSettings, dst_app: &str, method: &str) -> anyhow::Result<Self> {
        let factory = ConnectionFactory::new_from_config(&get_rabbitmq_settings())?;
        let channel = factory.new_connection().await?.create_channel().await?;

        channel
            .exchange_declare(
                &rpc.exchange_name,
                rpc.exchange_kind.into(),
                // must match the client's declaration exactly, or the
                // broker rejects it with PRECONDITION_FAILED
                ExchangeDeclareOptions {
                    durable: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        let queue = format!("rpc.{dst_app}.{method}");
        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &queue,
                &rpc.exchange_name,
                &queue,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(Self { channel, queue })
    }

    /// Wait for one request on the bound queue and answer it with `replies`,
    /// in order, all tagged with the request's correlation id.
    pub async fn reply_once(&self, replies: &[Value]) -> anyhow::Result<Value> {
        let delivery = loop {
            match self
                .channel
                .basic_get(&self.queue, BasicGetOptions { no_ack: true })
                .await?
            {
                Some(message) => break message.delivery,
                None => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        };

        let reply_to = delivery
            .properties
            .reply_to()
            .clone()
            .context("Request carries no reply_to")?;
        let correlation_id = delivery
            .properties
            .correlation_id()
            .clone()
            .context("Request carries no correlation id")?;

        for body in replies {
            self.channel
                .basic_publish(
                    // the reply queue is addressed through the default exchange
                    "",
                    reply_to.as_str(),
                    BasicPublishOptions::default(),
                    &serde_json::to_vec(body)?,
                    BasicProperties::default().with_correlation_id(correlation_id.clone()),
                )
                .await?
                .await?;
        }
        Ok(serde_json::from_slice(&delivery.data)?)
    }
}
