use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::types::{ConnectionEvent, ConnectionState};

pub mod irc;
pub mod twitch;

/// Trait defining the interface a chat connection must implement
#[async_trait]
pub trait PlatformConnection: Send + Sync {
    /// Start connecting to `channel` as `account`. Returns once the attempt
    /// has been started; progress is reported through [`subscribe`].
    ///
    /// [`subscribe`]: PlatformConnection::subscribe
    async fn connect(&mut self, channel: &str, account: &str, credential: &str) -> Result<()>;

    /// Get the platform identifier (e.g., "twitch")
    fn platform_name(&self) -> &str;

    /// Current connection state
    async fn state(&self) -> ConnectionState;

    /// Get a receiver for state changes, errors and chat messages
    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Channel joined by the current or last connection, if any
    async fn channel(&self) -> Option<String>;

    /// Stop the keepalive, release the transport and land in Disconnected.
    /// Safe to call from any state.
    async fn disconnect(&mut self) -> Result<()>;
}
