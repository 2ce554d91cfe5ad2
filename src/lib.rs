//! `funnel-cake` is an RPC runtime built on top of [`lapin`], letting
//! independent services invoke named remote operations on each other through
//! a RabbitMQ broker instead of a direct socket.
//!
//! Request/response correlation, delivery confirmation and remote-failure
//! reporting are all expressed with plain AMQP 0-9-1 primitives (exchanges,
//! queues, `correlation_id`, `reply_to`) - no bespoke wire protocol.
//!
//! [`RpcClient`](crate::rpc::RpcClient) is the best starting point: it owns
//! the pooled connections, the shared reply listener and the confirming
//! publisher, and hands out a [`ReplyEvent`](crate::rpc::ReplyEvent) for each
//! outstanding call. Progress is cooperative: a reply event only advances
//! when some caller polls it via `refresh` - there is no hidden background
//! consumer task.

pub mod providers;
pub mod publishers;
pub mod rpc;

pub mod amqp;
pub mod pool;
