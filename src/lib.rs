//! # First Chat Dock
//!
//! Watches a Twitch channel's chat and surfaces everyone who speaks for
//! the first time today, so the streamer can greet them.
//!
//! ## Features
//!
//! - **Twitch IRC over WebSocket**: tags capability, keepalive and ping replies
//! - **Daily period**: the first-time list resets at the local date boundary
//! - **Acknowledgments**: greeted chatters are remembered across restarts
//! - **Bot filtering**: configurable list, hot-reloaded from the settings file
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use firstchat::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(MemoryStateStore::new());
//!     let clock = Arc::new(SystemClock);
//!     let tracker = ChatterTracker::load(store.clone(), clock.clone(), None, DEFAULT_BOTS);
//!
//!     let settings = TwitchConfig::from_env()?;
//!     let connection = Box::new(TwitchConnection::new());
//!     let mut dock = ChatterDock::new(connection, tracker, settings, store, clock);
//!     dock.connect().await?;
//!     Ok(())
//! }
//! ```

pub mod types;
pub mod platforms;
pub mod bot;
pub mod config;

// Re-export commonly used items
pub mod prelude {
    pub use crate::bot::chatters::{ChatterTracker, Clock, SystemClock};
    pub use crate::bot::console::ConsoleCommand;
    pub use crate::bot::{ChatterDock, ChatterEntry};
    pub use crate::config::store::{JsonStateStore, MemoryStateStore, StateStore};
    pub use crate::config::{ConfigurationManager, DockConfiguration, DEFAULT_BOTS};
    pub use crate::platforms::{
        PlatformConnection,
        twitch::{TwitchConnection, TwitchConfig},
    };
    pub use crate::types::{
        ChatMessage, Classification, ConnectError, ConnectionEvent, ConnectionState,
        NewChatter, TrackerEvent, Username,
    };
    pub use anyhow::Result;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
