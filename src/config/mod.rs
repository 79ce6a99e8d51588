// src/config/mod.rs - Settings file management with hot-reload

use anyhow::{Context, Result};
use log::{debug, error, info};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Duration;

use crate::platforms::twitch::TwitchConfig;

pub mod store;

use store::{keys, StateStore};

/// Name of the settings file inside the configuration directory
pub const CONFIG_FILE: &str = "firstchat.yaml";

/// Quiet period after a change before the settings file is re-read
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

/// Accounts filtered out of the first-time list unless configured otherwise
pub const DEFAULT_BOTS: &[&str] = &[
    "nightbot",
    "streamelements",
    "moobot",
    "fossabot",
    "soundalerts",
    "streamlabs",
    "wizebot",
    "botisimo",
    "coebot",
    "deepbot",
    "phantombot",
];

/// Settings file contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockConfiguration {
    pub twitch: TwitchSettings,
    /// When absent, the persisted bot list (or the defaults) is used
    pub bot_list: Option<Vec<String>>,
    /// JSON file holding acknowledgments and the last reset date
    pub state_file: PathBuf,
    pub reset_check_interval_seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwitchSettings {
    pub channel: String,
    pub username: String,
    pub oauth_token: String,
}

impl Default for DockConfiguration {
    fn default() -> Self {
        Self {
            twitch: TwitchSettings::default(),
            bot_list: None,
            state_file: PathBuf::from("firstchat-state.json"),
            reset_check_interval_seconds: 60,
        }
    }
}

impl DockConfiguration {
    /// Connection settings with `TWITCH_*` environment overrides applied
    pub fn twitch_config(&self) -> TwitchConfig {
        TwitchConfig::new(
            &self.twitch.channel,
            &self.twitch.username,
            &self.twitch.oauth_token,
        )
        .with_env_overrides()
    }

    /// File and environment settings, with empty fields taken from the
    /// channel, account name and credential kept in `state`
    pub fn resolve_twitch_config(&self, state: &dyn StateStore) -> TwitchConfig {
        self.twitch_config().or_fallback(&stored_twitch_config(state))
    }

    /// Configured bot list, normalised, if the file sets one
    pub fn bots(&self) -> Option<Vec<String>> {
        self.bot_list.as_ref().map(|bots| normalize_bot_list(bots))
    }

    pub fn validate(&self) -> Result<()> {
        if self.reset_check_interval_seconds == 0 {
            return Err(anyhow::anyhow!("reset_check_interval_seconds must be greater than zero"));
        }
        if self.state_file.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("state_file must not be empty"));
        }
        Ok(())
    }
}

/// Connection settings persisted under the store's channel, account-name and
/// credential keys. Missing keys come back empty.
pub fn stored_twitch_config(state: &dyn StateStore) -> TwitchConfig {
    let load = |key: &str| store::load_string(state, key).unwrap_or_default();
    TwitchConfig::new(
        &load(keys::CHANNEL),
        &load(keys::ACCOUNT_NAME),
        &load(keys::CREDENTIAL),
    )
}

/// Trim and lower-case bot entries, dropping blanks and repeats
pub fn normalize_bot_list<S: AsRef<str>>(entries: &[S]) -> Vec<String> {
    let mut bots: Vec<String> = Vec::new();
    for entry in entries {
        let bot = entry.as_ref().trim().to_lowercase();
        if !bot.is_empty() && !bots.contains(&bot) {
            bots.push(bot);
        }
    }
    bots
}

/// Events broadcast when the settings file changes
#[derive(Debug, Clone)]
pub enum ConfigChangeEvent {
    SettingsUpdated(DockConfiguration),
    ValidationError { file: String, error: String },
}

/// Owns the settings file: loads it, writes defaults, and watches it
#[derive(Clone)]
pub struct ConfigurationManager {
    config_dir: PathBuf,
    config: Arc<RwLock<DockConfiguration>>,

    /// File watchers for hot-reloading
    watchers: Arc<RwLock<Vec<RecommendedWatcher>>>,

    change_notifier: broadcast::Sender<ConfigChangeEvent>,
}

impl ConfigurationManager {
    pub fn new<P: AsRef<Path>>(config_dir: P) -> Self {
        let (tx, _) = broadcast::channel(100);

        Self {
            config_dir: config_dir.as_ref().to_path_buf(),
            config: Arc::new(RwLock::new(DockConfiguration::default())),
            watchers: Arc::new(RwLock::new(Vec::new())),
            change_notifier: tx,
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Create the directory, load or create the settings file and start
    /// watching it
    pub async fn initialize(&self) -> Result<()> {
        self.load().await?;
        self.setup_file_watchers().await?;
        info!("Configuration manager initialized successfully");
        Ok(())
    }

    /// Load the settings file, writing a default one if it is missing.
    /// A file that fails to parse or validate is left untouched and the
    /// defaults are used for this run.
    pub async fn load(&self) -> Result<()> {
        if !self.config_dir.exists() {
            fs::create_dir_all(&self.config_dir).await?;
            info!("Created configuration directory: {}", self.config_dir.display());
        }

        if !self.config_path().exists() {
            return self.create_default_config().await;
        }

        if let Err(e) = self.load_config().await {
            error!(
                "Invalid settings in {}, using defaults until it is fixed: {:#}",
                self.config_path().display(),
                e
            );
            *self.config.write().await = DockConfiguration::default();
        }
        Ok(())
    }

    async fn load_config(&self) -> Result<()> {
        let config_path = self.config_path();
        let config = Self::read_config(&config_path)
            .await
            .with_context(|| format!("reading {}", config_path.display()))?;
        *self.config.write().await = config;

        debug!("Loaded settings from {}", config_path.display());
        Ok(())
    }

    async fn read_config(path: &Path) -> Result<DockConfiguration> {
        let content = fs::read_to_string(path).await?;
        let config: DockConfiguration = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    async fn create_default_config(&self) -> Result<()> {
        let config = DockConfiguration {
            bot_list: Some(DEFAULT_BOTS.iter().map(|b| b.to_string()).collect()),
            ..DockConfiguration::default()
        };

        let config_path = self.config_path();
        let content = serde_yaml::to_string(&config)?;
        fs::write(&config_path, content).await?;

        *self.config.write().await = config;
        info!("Created default settings: {}", config_path.display());
        Ok(())
    }

    /// Persist settings collected by the operator
    pub async fn save_config(&self, config: DockConfiguration) -> Result<()> {
        config.validate()?;
        let content = serde_yaml::to_string(&config)?;
        fs::write(self.config_path(), content).await?;
        *self.config.write().await = config;
        Ok(())
    }

    pub async fn get_config(&self) -> DockConfiguration {
        self.config.read().await.clone()
    }

    pub fn subscribe_to_changes(&self) -> broadcast::Receiver<ConfigChangeEvent> {
        self.change_notifier.subscribe()
    }

    async fn setup_file_watchers(&self) -> Result<()> {
        let config_dir = self.config_dir.clone();
        let change_notifier = self.change_notifier.clone();
        let config = self.config.clone();

        let (tx, mut rx) = tokio::sync::mpsc::channel(100);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if let Err(e) = tx.blocking_send(event) {
                    error!("Failed to send file watch event: {}", e);
                }
            }
        })?;

        watcher.watch(&config_dir, RecursiveMode::NonRecursive)?;

        // Dropping the watcher stops it
        self.watchers.write().await.push(watcher);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !touches_settings(&event) {
                    continue;
                }

                // Let a burst of writes settle, then read the file once
                tokio::time::sleep(RELOAD_DEBOUNCE).await;
                while rx.try_recv().is_ok() {}

                let path = config_dir.join(CONFIG_FILE);
                info!("Settings file changed, reloading...");
                match Self::read_config(&path).await {
                    Ok(updated) => {
                        *config.write().await = updated.clone();
                        let _ = change_notifier.send(ConfigChangeEvent::SettingsUpdated(updated));
                    }
                    Err(e) => {
                        error!("Failed to reload settings: {}", e);
                        let _ = change_notifier.send(ConfigChangeEvent::ValidationError {
                            file: CONFIG_FILE.to_string(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        });

        info!("File watcher setup for hot-reloading");
        Ok(())
    }
}

fn touches_settings(event: &Event) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
        && event
            .paths
            .iter()
            .any(|path| path.file_name().and_then(|n| n.to_str()) == Some(CONFIG_FILE))
}
