use crate::pool::{self, ChannelPool};
use crate::publishers::{CallEnvelope, RetryPolicy};
use lapin::message::BasicReturnMessage;
use lapin::options::BasicPublishOptions;
use lapin::publisher_confirm::Confirmation;
use lapin::Channel;
use tracing::warn;

/// A confirming publisher for RPC requests.
///
/// # Delivery semantics
///
/// Every publish is `mandatory` and waits for the broker's publisher
/// confirmation, so the caller learns synchronously whether the message was
/// accepted, was unroutable (no queue bound to the routing key - a
/// deployment error, see [`PublishError::Undeliverable`]) or never reached
/// the broker at all ([`PublishError::Connectivity`]).
///
/// # Fault tolerance
///
/// Connectivity failures - and only those - are retried under the configured
/// [`RetryPolicy`]; the whole attempt sequence is additionally bounded by a
/// publish timeout. Channels come from a [`ChannelPool`], so a broken
/// channel is replaced on the next attempt rather than poisoning the
/// publisher.
pub struct Publisher {
    channel_pool: ChannelPool,
    /// Overall deadline on one `publish` call, retries included.
    timeout: std::time::Duration,
    retry: RetryPolicy,
}

impl Publisher {
    /// Start building a [`Publisher`] on top of a channel pool.
    pub fn builder(channel_pool: ChannelPool) -> PublisherBuilder {
        PublisherBuilder::new(channel_pool)
    }

    /// Publish one RPC envelope and wait for the broker to confirm it.
    #[tracing::instrument(
        level = "debug",
        skip(self, envelope),
        fields(exchange = %envelope.exchange_name, routing_key = %envelope.routing_key)
    )]
    pub async fn publish(&self, envelope: &CallEnvelope) -> Result<(), PublishError> {
        let attempts = async {
            let mut retry = 0;
            loop {
                match self.try_publish(envelope).await {
                    Err(e) if e.is_transient() && retry < self.retry.max_retries => {
                        retry += 1;
                        warn!(
                            retry,
                            max_retries = self.retry.max_retries,
                            "Transient failure while publishing RPC request, backing off: {e}",
                        );
                        tokio::time::sleep(self.retry.interval(retry)).await;
                    }
                    outcome => return outcome,
                }
            }
        };
        match tokio::time::timeout(self.timeout, attempts).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PublishError::Timeout),
        }
    }

    async fn try_publish(&self, envelope: &CallEnvelope) -> Result<(), PublishError> {
        let channel = pool::acquire(&self.channel_pool, false, None)
            .await
            .map_err(|e| match e {
                pool::Error::Unavailable => PublishError::Unavailable,
                pool::Error::Backend(e) => PublishError::Connectivity(e),
            })?;
        publish(&channel, envelope).await
    }
}

/// Publish a payload, waiting for publisher confirmation.
///
/// The mandatory flag tells the broker how to react if the message cannot be
/// routed to a queue: with `mandatory: true` the broker hands the message
/// back with a Basic.Return instead of silently dropping it. RPC requests
/// always want that signal - it is the only way to distinguish "destination
/// service is not listening" from "reply is just slow".
async fn publish(channel: &Channel, envelope: &CallEnvelope) -> Result<(), PublishError> {
    let options = BasicPublishOptions {
        mandatory: true,
        // The immediate flag was dropped in RabbitMQ 3.0; setting it would
        // cause a not-supported error.
        immediate: false,
    };
    let confirm = channel
        .basic_publish(
            &envelope.exchange_name,
            &envelope.routing_key,
            options,
            &envelope.payload,
            envelope.properties.clone(),
        )
        .await
        .map_err(classify)?
        .await
        .map_err(classify)?;

    match confirm {
        Confirmation::Ack(ack) => {
            if let Some(return_message) = ack {
                // Reply Code 312 - NO_ROUTE
                // See https://www.rabbitmq.com/amqp-0-9-1-reference.html
                if return_message.reply_code == 312 {
                    return Err(PublishError::Undeliverable {
                        exchange: envelope.exchange_name.clone(),
                        routing_key: envelope.routing_key.clone(),
                    });
                }
            }
            Ok(())
        }
        Confirmation::Nack(nack) => Err(PublishError::NegativeAck(nack)),
        Confirmation::NotRequested => Ok(()),
    }
}

/// Split broker errors into the connectivity class (retried, reported as
/// `FAIL_CONN` upstream) and everything else.
fn classify(e: lapin::Error) -> PublishError {
    match &e {
        lapin::Error::IOError(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::InvalidChannelState(_) => PublishError::Connectivity(e.into()),
        _ => PublishError::Generic(e.into()),
    }
}

/// Error returned when trying to publish an RPC request.
#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    /// No queue is bound to the routing key: the destination app is not
    /// listening, or the deployment is misconfigured. Never retried.
    #[error("Undeliverable message, exchange: {exchange}, routing_key: {routing_key}")]
    Undeliverable {
        exchange: String,
        routing_key: String,
    },
    /// The broker could not be reached. The only transient class.
    #[error("Failed to reach the RabbitMq broker")]
    Connectivity(#[source] anyhow::Error),
    #[error("The RabbitMq broker nacked the publishing of the message: {0:?}")]
    NegativeAck(Option<Box<BasicReturnMessage>>),
    #[error("Generic error encountered when interacting with the RabbitMq broker")]
    Generic(#[source] anyhow::Error),
    /// The channel pool was exhausted.
    #[error("No pooled channel was available to publish the message")]
    Unavailable,
    #[error("The timeout threshold was reached while trying to publish the message")]
    Timeout,
}

impl PublishError {
    fn is_transient(&self) -> bool {
        matches!(self, PublishError::Connectivity(_))
    }
}

/// A builder for [`Publisher`]. Use [`Publisher::builder`] as entrypoint.
pub struct PublisherBuilder {
    channel_pool: ChannelPool,
    timeout: std::time::Duration,
    retry: RetryPolicy,
}

impl PublisherBuilder {
    fn new(channel_pool: ChannelPool) -> Self {
        Self {
            channel_pool,
            timeout: std::time::Duration::from_secs(3),
            retry: RetryPolicy::default(),
        }
    }

    /// Timeout applied to one `publish` call, retries included.
    /// Defaults to 3 seconds if left unspecified.
    #[must_use]
    pub fn publish_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Backoff policy for transient publish failures.
    #[must_use]
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Finalise the builder and get an instance of [`Publisher`].
    pub fn build(self) -> Publisher {
        Publisher {
            channel_pool: self.channel_pool,
            timeout: self.timeout,
            retry: self.retry,
        }
    }
}
