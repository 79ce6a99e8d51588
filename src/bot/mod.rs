use anyhow::Result;
use log::{debug, error, info, warn};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Duration;

use crate::config::store::StateStore;
use crate::config::{ConfigChangeEvent, DockConfiguration};
use crate::platforms::twitch::TwitchConfig;
use crate::platforms::PlatformConnection;
use crate::types::{Classification, ConnectError, ConnectionEvent, ConnectionState, NewChatter, Username};

pub mod chatters;
pub mod console;

use chatters::{ChatterTracker, Clock};
use console::{ConsoleCommand, HELP};

/// One row of today's first-time chatters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatterEntry {
    pub username: Username,
    pub display_name: String,
    pub acknowledged: bool,
}

/// Wires a chat connection to the chatter tracker and keeps the list of
/// first-time chatters shown to the operator (newest first).
pub struct ChatterDock {
    connection: Box<dyn PlatformConnection>,
    tracker: ChatterTracker,
    settings: TwitchConfig,
    state: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    chatters: Vec<ChatterEntry>,
}

impl ChatterDock {
    pub fn new(
        connection: Box<dyn PlatformConnection>,
        tracker: ChatterTracker,
        settings: TwitchConfig,
        state: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            connection,
            tracker,
            settings,
            state,
            clock,
            chatters: Vec::new(),
        }
    }

    pub fn tracker(&self) -> &ChatterTracker {
        &self.tracker
    }

    pub fn chatters(&self) -> &[ChatterEntry] {
        &self.chatters
    }

    pub fn settings(&self) -> &TwitchConfig {
        &self.settings
    }

    pub async fn state(&self) -> ConnectionState {
        self.connection.state().await
    }

    /// Disconnect when connected or connecting, connect otherwise
    pub async fn toggle_connection(&mut self) -> Result<()> {
        if self.connection.state().await.is_active() {
            self.disconnect().await
        } else {
            self.connect().await
        }
    }

    /// Refuses with [`ConnectError::ConfigurationRequired`] before touching
    /// the network when channel, username or token is missing.
    pub async fn connect(&mut self) -> Result<()> {
        self.check_period_reset();
        self.settings.validate()?;

        let TwitchConfig { channel, username, oauth_token } = &self.settings;
        self.connection.connect(channel, username, oauth_token).await
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.connection.disconnect().await
    }

    /// Apply the daily boundary; clears the list when the period rolled over
    pub fn check_period_reset(&mut self) -> bool {
        let today = self.clock.today();
        let reset = self.tracker.check_period_reset(today);
        if reset {
            self.chatters.clear();
        }
        reset
    }

    pub fn manual_reset(&mut self) {
        self.tracker.manual_reset();
        self.chatters.clear();
    }

    /// Flip the greeted flag; returns the new state
    pub fn toggle_acknowledged(&mut self, username: &str) -> bool {
        let acknowledged = self.tracker.toggle_acknowledged(username);
        let username = Username::new(username);
        for entry in self.chatters.iter_mut().filter(|e| e.username == username) {
            entry.acknowledged = acknowledged;
        }
        acknowledged
    }

    /// New connection settings take effect on the next connect; a new bot
    /// list takes effect immediately. Fields the file leaves empty fall back
    /// to the state store, then to the settings already in use.
    pub fn apply_settings(&mut self, config: &DockConfiguration) {
        let settings = config
            .resolve_twitch_config(self.state.as_ref())
            .or_fallback(&self.settings);
        self.settings = settings;
        if let Some(bots) = config.bots() {
            self.tracker.update_bot_list(bots);
        }
    }

    pub fn handle_connection_event(&mut self, event: ConnectionEvent) -> Option<NewChatter> {
        match event {
            ConnectionEvent::Message(message) => {
                self.check_period_reset();
                match self.tracker.classify(&message) {
                    Classification::NewChatter(chatter) => {
                        println!(
                            "{} {}",
                            if chatter.already_acknowledged { "✓" } else { "★" },
                            chatter.display_name
                        );
                        self.chatters.insert(
                            0,
                            ChatterEntry {
                                username: chatter.username.clone(),
                                display_name: chatter.display_name.clone(),
                                acknowledged: chatter.already_acknowledged,
                            },
                        );
                        Some(chatter)
                    }
                    Classification::Suppressed(reason) => {
                        debug!("Suppressed {} ({:?})", message.username, reason);
                        None
                    }
                }
            }
            ConnectionEvent::StateChanged(state) => {
                println!("{}", state.indicator());
                None
            }
            ConnectionEvent::Error(message) => {
                warn!("Connection error: {}", message);
                None
            }
        }
    }

    pub fn render_chatters(&self) -> String {
        if self.chatters.is_empty() {
            return "no first-time chatters yet".to_string();
        }

        let mut out = String::new();
        for entry in &self.chatters {
            let mark = if entry.acknowledged { "✓" } else { " " };
            let _ = writeln!(out, "[{}] {} ({})", mark, entry.display_name, entry.username);
        }
        out.trim_end().to_string()
    }

    /// Run one operator command. Returns false when the dock should stop.
    pub async fn execute(&mut self, command: ConsoleCommand) -> bool {
        let result = match command {
            ConsoleCommand::Toggle => self.toggle_connection().await,
            ConsoleCommand::Connect => self.connect().await,
            ConsoleCommand::Disconnect => self.disconnect().await,
            ConsoleCommand::Ack(username) => {
                let acknowledged = self.toggle_acknowledged(&username);
                println!("{} {}", Username::new(&username), if acknowledged { "greeted" } else { "not greeted" });
                Ok(())
            }
            ConsoleCommand::Reset => {
                self.manual_reset();
                println!("chatters cleared");
                Ok(())
            }
            ConsoleCommand::List => {
                println!("{}", self.render_chatters());
                Ok(())
            }
            ConsoleCommand::Status => {
                println!("{}", self.connection.state().await);
                Ok(())
            }
            ConsoleCommand::Help => {
                println!("{}", HELP);
                Ok(())
            }
            ConsoleCommand::Quit => return false,
        };

        if let Err(e) = result {
            match e.downcast_ref::<ConnectError>() {
                Some(ConnectError::ConfigurationRequired { missing }) => {
                    println!("Configuration required: set {} in the settings file", missing.join(", "));
                }
                _ => error!("Command failed: {:#}", e),
            }
        }
        true
    }

    /// Process connection events, operator commands, settings changes and
    /// the periodic reset check until a quit command arrives or the command
    /// channel closes. Disconnects before returning.
    pub async fn run(
        &mut self,
        mut commands: mpsc::Receiver<ConsoleCommand>,
        mut config_changes: broadcast::Receiver<ConfigChangeEvent>,
        reset_check_interval: Duration,
    ) -> Result<()> {
        let mut connection_events = self.connection.subscribe();
        let mut reset_timer = tokio::time::interval(reset_check_interval);
        let mut watching_config = true;
        info!("Chatter dock running");

        loop {
            tokio::select! {
                biased;

                event = connection_events.recv() => match event {
                    Ok(event) => {
                        self.handle_connection_event(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Dropped {} connection events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Connection event stream closed");
                        break;
                    }
                },
                _ = reset_timer.tick() => {
                    self.check_period_reset();
                }
                change = config_changes.recv(), if watching_config => match change {
                    Ok(ConfigChangeEvent::SettingsUpdated(config)) => {
                        info!("Applying updated settings");
                        self.apply_settings(&config);
                    }
                    Ok(ConfigChangeEvent::ValidationError { file, error }) => {
                        warn!("Ignoring invalid {}: {}", file, error);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Settings watcher gone");
                        watching_config = false;
                    }
                },
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.execute(command).await {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        self.disconnect().await?;
        info!("Chatter dock stopped");
        Ok(())
    }
}
