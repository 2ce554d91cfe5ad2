//! Facilities to publish RPC requests to a RabbitMq exchange. Check out
//! [`Publisher`] as a starting point.
mod envelope;
mod publisher;
mod retry;

pub use envelope::CallEnvelope;
pub use publisher::{PublishError, Publisher, PublisherBuilder};
pub use retry::RetryPolicy;
