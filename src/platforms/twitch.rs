use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::platforms::irc::{parse_line, IrcLine, IrcMessage};
use crate::platforms::PlatformConnection;
use crate::types::{ChatMessage, ConnectError, ConnectionEvent, ConnectionState, Username};

/// Secure websocket endpoint of Twitch chat
pub const TWITCH_IRC_URL: &str = "wss://irc-ws.chat.twitch.tv:443";

/// How often a PING is sent while connected
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(4 * 60);

const SERVICE_HOST: &str = "tmi.twitch.tv";
const CAPABILITY_REQUEST: &str = "CAP REQ :twitch.tv/tags twitch.tv/commands";

/// Connection settings for Twitch chat
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwitchConfig {
    pub channel: String,
    pub username: String,
    /// Bare token, without the `oauth:` prefix
    pub oauth_token: String,
}

impl TwitchConfig {
    pub fn new(channel: &str, username: &str, oauth_token: &str) -> Self {
        Self {
            channel: channel.trim().to_string(),
            username: username.trim().to_string(),
            oauth_token: normalize_token(oauth_token),
        }
    }

    /// Load Twitch configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let channel = env::var("TWITCH_CHANNEL")
            .context("TWITCH_CHANNEL environment variable not set")?;
        let username = env::var("TWITCH_USERNAME")
            .context("TWITCH_USERNAME environment variable not set")?;
        let oauth_token = env::var("TWITCH_OAUTH_TOKEN")
            .context("TWITCH_OAUTH_TOKEN environment variable not set")?;

        let config = Self::new(&channel, &username, &oauth_token);
        info!("Loaded Twitch config for user '{}' in channel '{}'", config.username, config.channel);
        Ok(config)
    }

    /// Replace fields with any `TWITCH_*` environment variables that are set
    pub fn with_env_overrides(self) -> Self {
        let channel = env::var("TWITCH_CHANNEL").unwrap_or(self.channel);
        let username = env::var("TWITCH_USERNAME").unwrap_or(self.username);
        let oauth_token = env::var("TWITCH_OAUTH_TOKEN").unwrap_or(self.oauth_token);
        Self::new(&channel, &username, &oauth_token)
    }

    /// Fill empty fields from `fallback`
    pub fn or_fallback(self, fallback: &TwitchConfig) -> Self {
        fn pick<'a>(value: &'a str, fallback: &'a str) -> &'a str {
            if value.is_empty() { fallback } else { value }
        }

        Self::new(
            pick(&self.channel, &fallback.channel),
            pick(&self.username, &fallback.username),
            pick(&self.oauth_token, &fallback.oauth_token),
        )
    }

    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.channel.is_empty() {
            missing.push("channel");
        }
        if self.username.is_empty() {
            missing.push("username");
        }
        if self.oauth_token.is_empty() {
            missing.push("oauth_token");
        }
        missing
    }

    pub fn validate(&self) -> std::result::Result<(), ConnectError> {
        let missing = self.missing_fields();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConnectError::ConfigurationRequired { missing })
        }
    }

    /// Channel as it appears on the wire, e.g. `#mychan`
    pub fn irc_channel(&self) -> String {
        normalize_channel(&self.channel)
    }
}

/// Lower-case the channel and make sure it carries a leading `#`
pub fn normalize_channel(channel: &str) -> String {
    let channel = channel.trim().to_lowercase();
    if channel.starts_with('#') {
        channel
    } else {
        format!("#{}", channel)
    }
}

/// Strip a user-supplied `oauth:` prefix (any case) from a token
pub fn normalize_token(token: &str) -> String {
    let token = token.trim();
    match token.get(..6) {
        Some(prefix) if prefix.eq_ignore_ascii_case("oauth:") => token[6..].to_string(),
        _ => token.to_string(),
    }
}

/// Turn a parsed PRIVMSG into a chat message. Anything else, or a PRIVMSG
/// without an identifiable sender, yields `None`.
pub fn extract_chat_message(message: &IrcMessage) -> Option<ChatMessage> {
    if message.command != "PRIVMSG" {
        return None;
    }

    let nick = message.nick()?;
    let display_name = match message.tag("display-name") {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => nick.to_string(),
    };

    Some(ChatMessage {
        channel: message.target().unwrap_or_default().to_string(),
        username: Username::new(nick),
        display_name,
        content: message.trailing.clone().unwrap_or_default(),
        timestamp: chrono::Utc::now(),
    })
}

fn redact(line: &str) -> &str {
    if line.starts_with("PASS ") {
        "PASS oauth:********"
    } else {
        line
    }
}

/// Transport-independent connection state machine.
///
/// Every call coming from a transport carries the epoch handed out by
/// [`begin_connect`]; calls from a superseded attempt are ignored, so nothing
/// can bring the session back to Connected after [`disconnect`].
///
/// [`begin_connect`]: TwitchSession::begin_connect
/// [`disconnect`]: TwitchSession::disconnect
pub struct TwitchSession {
    state: ConnectionState,
    config: TwitchConfig,
    outbox: Option<mpsc::UnboundedSender<String>>,
    keepalive_running: bool,
    epoch: u64,
    last_error: Option<String>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl TwitchSession {
    pub fn new(events: broadcast::Sender<ConnectionEvent>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            config: TwitchConfig::default(),
            outbox: None,
            keepalive_running: false,
            epoch: 0,
            last_error: None,
            events,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn keepalive_running(&self) -> bool {
        self.keepalive_running
    }

    pub fn has_transport(&self) -> bool {
        self.outbox.is_some()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn channel(&self) -> Option<String> {
        if self.config.channel.is_empty() {
            None
        } else {
            Some(self.config.irc_channel())
        }
    }

    /// Disconnected/Error -> Connecting. An active session is torn down
    /// first. Returns the epoch the transport must quote back.
    pub fn begin_connect(&mut self, config: &TwitchConfig) -> std::result::Result<u64, ConnectError> {
        config.validate()?;

        if self.state.is_active() {
            debug!("Connect requested while {:?}, disconnecting first", self.state);
            self.disconnect();
        }

        self.epoch += 1;
        self.config = TwitchConfig {
            channel: config.irc_channel(),
            username: config.username.to_lowercase(),
            oauth_token: config.oauth_token.clone(),
        };
        self.set_state(ConnectionState::Connecting);
        Ok(self.epoch)
    }

    /// Connecting -> Connected: send the handshake, start the keepalive.
    /// Returns false when the attempt was superseded and the transport
    /// should be closed.
    pub fn transport_established(&mut self, epoch: u64, outbox: mpsc::UnboundedSender<String>) -> bool {
        if !self.is_current(epoch) || self.state != ConnectionState::Connecting {
            debug!("Dropping transport for superseded connection attempt {}", epoch);
            return false;
        }

        self.outbox = Some(outbox);
        self.send(CAPABILITY_REQUEST.to_string());
        self.send(format!("PASS oauth:{}", self.config.oauth_token));
        self.send(format!("NICK {}", self.config.username));
        self.send(format!("JOIN {}", self.config.channel));

        self.keepalive_running = true;
        self.set_state(ConnectionState::Connected);
        info!("Joined channel: {}", self.config.channel);
        true
    }

    /// Connecting/Connected -> Error
    pub fn transport_error(&mut self, epoch: u64, description: String) {
        if !self.is_current(epoch) || !self.state.is_active() {
            return;
        }

        error!("Twitch connection error: {}", description);
        self.keepalive_running = false;
        self.outbox = None;
        self.last_error = Some(description.clone());
        self.set_state(ConnectionState::Error(description.clone()));
        let _ = self.events.send(ConnectionEvent::Error(description));
    }

    /// The peer closed the transport
    pub fn transport_closed(&mut self, epoch: u64) {
        if !self.is_current(epoch) || !self.state.is_active() {
            return;
        }

        warn!("Twitch closed the connection");
        self.keepalive_running = false;
        self.outbox = None;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Any state -> Disconnected. Idempotent.
    pub fn disconnect(&mut self) {
        self.epoch += 1;
        self.keepalive_running = false;
        if self.outbox.take().is_some() {
            info!("Disconnected from Twitch");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    pub fn keepalive_tick(&mut self, epoch: u64) {
        if self.is_current(epoch) && self.keepalive_running {
            self.send(format!("PING :{}", SERVICE_HOST));
        }
    }

    /// Handle one websocket text frame, which may hold several lines
    pub fn handle_frame(&mut self, epoch: u64, frame: &str) {
        if !self.is_current(epoch) {
            return;
        }

        for line in frame.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            self.handle_line(line);
        }
    }

    fn handle_line(&mut self, line: &str) {
        debug!("< {}", line);

        let message = match parse_line(line) {
            IrcLine::Ping { .. } => {
                self.send(format!("PONG :{}", SERVICE_HOST));
                return;
            }
            IrcLine::Message(message) => message,
        };

        if message.command == "PING" {
            self.send(format!("PONG :{}", SERVICE_HOST));
            return;
        }

        if message.is_empty() {
            debug!("Dropping line without a command");
            return;
        }

        if let Some(chat) = extract_chat_message(&message) {
            debug!("Parsed message from {}: {}", chat.username, chat.content);
            let _ = self.events.send(ConnectionEvent::Message(chat));
        }
    }

    fn send(&self, line: String) {
        match &self.outbox {
            Some(outbox) => {
                debug!("> {}", redact(&line));
                if outbox.send(line).is_err() {
                    warn!("Transport writer is gone, dropping outgoing line");
                }
            }
            None => debug!("No transport, dropping outgoing line: {}", redact(&line)),
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        let changed = !self.state.same_kind(&state);
        self.state = state;
        if changed {
            info!("Connection state: {}", self.state);
            let _ = self.events.send(ConnectionEvent::StateChanged(self.state.clone()));
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        epoch == self.epoch
    }
}

/// Twitch IRC-over-websocket connection
pub struct TwitchConnection {
    endpoint: String,
    session: Arc<RwLock<TwitchSession>>,
    events: broadcast::Sender<ConnectionEvent>,
    driver: Option<JoinHandle<()>>,
}

impl TwitchConnection {
    pub fn new() -> Self {
        Self::with_endpoint(TWITCH_IRC_URL)
    }

    pub fn with_endpoint(endpoint: &str) -> Self {
        let (tx, _) = broadcast::channel(1000);
        Self {
            endpoint: endpoint.to_string(),
            session: Arc::new(RwLock::new(TwitchSession::new(tx.clone()))),
            events: tx,
            driver: None,
        }
    }

    pub async fn last_error(&self) -> Option<String> {
        self.session.read().await.last_error().map(String::from)
    }
}

impl Default for TwitchConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TwitchConnection {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// Owns the websocket for one connection attempt. All protocol decisions are
/// delegated to the session; this only moves frames.
async fn run_driver(endpoint: Url, session: Arc<RwLock<TwitchSession>>, epoch: u64) {
    let ws_stream = match connect_async(endpoint.as_str()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            session.write().await.transport_error(epoch, format!("Failed to connect: {}", e));
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<String>();

    if !session.write().await.transport_established(epoch, outbox_tx) {
        let _ = write.close().await;
        return;
    }

    let mut keepalive = interval_at(Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);
    info!("Twitch message reader started");

    loop {
        tokio::select! {
            outgoing = outbox_rx.recv() => match outgoing {
                Some(line) => {
                    if let Err(e) = write.send(Message::Text(format!("{}\r\n", line))).await {
                        session.write().await.transport_error(epoch, format!("Failed to send: {}", e));
                        break;
                    }
                }
                // The session released the transport
                None => {
                    let _ = write.close().await;
                    break;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    session.write().await.handle_frame(epoch, &text);
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = write.send(Message::Pong(payload)).await {
                        error!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Close(close_frame))) => {
                    info!("WebSocket connection closed: {:?}", close_frame);
                    session.write().await.transport_closed(epoch);
                    break;
                }
                Some(Ok(_)) => {
                    debug!("Ignoring non-text websocket frame");
                }
                Some(Err(e)) => {
                    session.write().await.transport_error(epoch, format!("WebSocket error: {}", e));
                    break;
                }
                None => {
                    session.write().await.transport_closed(epoch);
                    break;
                }
            },
            _ = keepalive.tick() => {
                session.write().await.keepalive_tick(epoch);
            }
        }
    }

    debug!("Twitch connection handler for attempt {} exited", epoch);
}

#[async_trait]
impl PlatformConnection for TwitchConnection {
    async fn connect(&mut self, channel: &str, account: &str, credential: &str) -> Result<()> {
        let config = TwitchConfig::new(channel, account, credential);
        let url = Url::parse(&self.endpoint)
            .map_err(|e| ConnectError::InvalidEndpoint(format!("{}: {}", self.endpoint, e)))?;

        let epoch = self.session.write().await.begin_connect(&config)?;
        info!("Connecting to Twitch IRC as '{}' for {}...", config.username, config.irc_channel());

        let session = Arc::clone(&self.session);
        self.driver = Some(tokio::spawn(run_driver(url, session, epoch)));
        Ok(())
    }

    fn platform_name(&self) -> &str {
        "twitch"
    }

    async fn state(&self) -> ConnectionState {
        self.session.read().await.state().clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn channel(&self) -> Option<String> {
        self.session.read().await.channel()
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.session.write().await.disconnect();
        Ok(())
    }
}
