//! The request/reply layer.
//!
//! [`RpcClient`] publishes requests and hands back [`ReplyEvent`] handles;
//! [`ReplyListener`] owns the process-wide reply queue and demultiplexes
//! inbound replies by correlation id. All progress is caller-driven: polling
//! a [`ReplyEvent`] is what drains the reply queue, there is no background
//! consumer task.

mod client;
mod pending;
mod reply_event;
mod reply_listener;

pub use client::{CallPayload, RpcClient, RpcClientBuilder, RpcError};
pub use reply_event::{
    RefreshOptions, ReplyEvent, ReplyPayload, ReplySnapshot, ReplySource, ReplyStatus,
};
pub use reply_listener::{ListenError, ReplyListener};
