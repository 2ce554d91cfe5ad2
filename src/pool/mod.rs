//! Pooling for [`lapin::Channel`] and [`lapin::Connection`] using [`deadpool`].
//!
//! Two guarantees:
//! - Broken channels are disposed of and recreated on demand.
//! - Connection objects are reused across channels to limit overhead.
//!
//! Handles are borrowed for the duration of one publish or one consume cycle
//! and released on scope exit; nothing is cached on the handle across calls.
//!
//! ```rust
//! use funnel_cake::pool::{ChannelManager, ChannelPool, ConnectionPool};
//! use funnel_cake::amqp::ConnectionFactory;
//! use funnel_cake::amqp::configuration::RabbitMqSettings;
//!
//! async fn example() -> anyhow::Result<()> {
//!     let settings = RabbitMqSettings::default();
//!
//!     let connection_pool = ConnectionPool::builder(ConnectionFactory::new_from_config(&settings)?)
//!             .max_size(4)
//!             .build()?;
//!
//!     let pool = ChannelPool::builder(ChannelManager::new(connection_pool))
//!         .max_size(16)
//!         .build()?;
//!
//!     // wait up to two seconds for a free channel.
//!     let channel = funnel_cake::pool::acquire(&pool, true, Some(std::time::Duration::from_secs(2))).await?;
//!     Ok(())
//! }
//! ```

use deadpool::managed::{Manager, Object, Pool};
use std::time::Duration;

mod channel;
mod connection;
mod error;

pub use channel::{ChannelManager, ChannelPool};
pub use connection::ConnectionPool;
pub use error::Error;

/// Borrow a handle from `pool`.
///
/// With `blocking: false` an exhausted pool (every slot handed out) fails
/// immediately with [`Error::Unavailable`], but a free slot is always used,
/// even when filling it means creating the object first. With
/// `blocking: true` the acquire waits up to `timeout` (indefinitely when
/// `None`) and then fails the same way.
pub async fn acquire<M>(
    pool: &Pool<M>,
    blocking: bool,
    timeout: Option<Duration>,
) -> Result<Object<M>, Error>
where
    M: Manager<Error = Error>,
{
    if !blocking {
        let status = pool.status();
        if status.size >= status.max_size && status.available <= 0 {
            return Err(Error::Unavailable);
        }
        return Ok(pool.get().await?);
    }
    match timeout {
        None => Ok(pool.get().await?),
        Some(wait) => match tokio::time::timeout(wait, pool.get()).await {
            Ok(handle) => Ok(handle?),
            Err(_) => Err(Error::Unavailable),
        },
    }
}
