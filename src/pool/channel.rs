//! Implements [`Manager`] for [`Channel`].
use deadpool::managed::{self, Manager};
use lapin::{options::ConfirmSelectOptions, Channel, ChannelState};

use super::connection::ConnectionPool;

/// `ChannelPool` pools [`Channel`]s - our lightweight publish/consume
/// handles - on top of an internal [`ConnectionPool`], so channel setup cost
/// is not paid on every call.
pub type ChannelPool = deadpool::managed::Pool<ChannelManager>;

/// `ChannelManager` implements [`Manager`] to manage a pool of [`Channel`]s.
///
/// It keeps an internal [`ConnectionPool`] in order to reuse connections
/// across channels.
pub struct ChannelManager {
    connection_pool: ConnectionPool,
    pub(crate) publisher_confirms: bool,
}

impl ChannelManager {
    /// Construct a `ChannelManager`.
    ///
    /// By default, all channels will have publisher confirmations enabled:
    /// the RPC publisher relies on confirms to learn about unroutable
    /// messages. You can opt out using
    /// [`ChannelManager::without_publisher_confirmations`].
    pub fn new(connection_pool: ConnectionPool) -> Self {
        Self {
            connection_pool,
            publisher_confirms: true,
        }
    }

    /// Disable publisher confirmations.
    pub fn without_publisher_confirmations(mut self) -> Self {
        self.publisher_confirms = false;
        self
    }
}

#[async_trait::async_trait]
impl Manager for ChannelManager {
    type Type = Channel;
    type Error = super::Error;

    async fn create(&self) -> Result<Channel, super::Error> {
        let connection = self.connection_pool.get().await?;
        let channel = connection.create_channel().await?;
        if self.publisher_confirms {
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await?;
        }
        Ok(channel)
    }

    async fn recycle(&self, obj: &mut Channel) -> managed::RecycleResult<super::Error> {
        match obj.status().state() {
            ChannelState::Connected => Ok(()),
            state => Err(managed::RecycleError::Message(format!(
                "Channel is not in an healthy state {state:?}",
            ))),
        }
    }
}
