// src/config/store.rs - Key/value persistence for tracker state

use chrono::NaiveDate;
use log::{debug, error, info};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tokio::fs;
use tokio::sync::{mpsc, oneshot};

/// Keys understood by the state store
pub mod keys {
    pub const CHANNEL: &str = "channel";
    pub const ACCOUNT_NAME: &str = "account-name";
    pub const CREDENTIAL: &str = "credential";
    pub const BOT_LIST: &str = "bot-list";
    pub const LAST_RESET_DATE: &str = "last-reset-date";
    pub const ACKNOWLEDGED_CHATTERS: &str = "acknowledged-chatters";
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is not a JSON object: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("state writer has stopped")]
    WriterStopped,
}

/// Minimal load/save-by-key contract.
///
/// `save` must not block: implementations update their view immediately and
/// persist in the background.
pub trait StateStore: Send + Sync {
    fn load(&self, key: &str) -> Option<Value>;
    fn save(&self, key: &str, value: Value);
}

/// Read a list of strings, ignoring non-string entries
pub fn load_strings(store: &dyn StateStore, key: &str) -> Option<Vec<String>> {
    match store.load(key)? {
        Value::Array(items) => Some(
            items
                .into_iter()
                .filter_map(|item| item.as_str().map(String::from))
                .collect(),
        ),
        _ => None,
    }
}

/// Read an ISO `YYYY-MM-DD` date
pub fn load_date(store: &dyn StateStore, key: &str) -> Option<NaiveDate> {
    let value = store.load(key)?;
    NaiveDate::parse_from_str(value.as_str()?, "%Y-%m-%d").ok()
}

pub fn load_string(store: &dyn StateStore, key: &str) -> Option<String> {
    store
        .load(key)?
        .as_str()
        .map(String::from)
        .filter(|s| !s.is_empty())
}

pub fn save_strings<I, S>(store: &dyn StateStore, key: &str, items: I)
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let items: Vec<Value> = items.into_iter().map(|s| Value::String(s.into())).collect();
    store.save(key, Value::Array(items));
}

pub fn save_date(store: &dyn StateStore, key: &str, date: NaiveDate) {
    store.save(key, Value::String(date.format("%Y-%m-%d").to_string()));
}

/// Volatile store, used when no state file is configured and in tests
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, key: &str) -> Option<Value> {
        let values = self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        values.get(key).cloned()
    }

    fn save(&self, key: &str, value: Value) {
        let mut values = self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        values.insert(key.to_string(), value);
    }
}

enum WriteRequest {
    Snapshot(Value),
    Flush(oneshot::Sender<()>),
}

/// JSON-file store. Reads happen from memory; every save queues a snapshot
/// for a background writer task.
pub struct JsonStateStore {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
    writer: mpsc::UnboundedSender<WriteRequest>,
}

impl JsonStateStore {
    /// Load `path` if it exists and start the writer. Must be called from
    /// within a tokio runtime.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let values = if path.exists() {
            let content = fs::read_to_string(&path)
                .await
                .map_err(|source| StoreError::Io { path: path.clone(), source })?;
            let values: Map<String, Value> = serde_json::from_str(&content)
                .map_err(|source| StoreError::Format { path: path.clone(), source })?;
            info!("Loaded {} state entries from {}", values.len(), path.display());
            values
        } else {
            debug!("No state file at {}, starting empty", path.display());
            Map::new()
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run_writer(path.clone(), rx));

        Ok(Self {
            path,
            values: Mutex::new(values),
            writer: tx,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until every snapshot queued so far is on disk
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.writer
            .send(WriteRequest::Flush(tx))
            .map_err(|_| StoreError::WriterStopped)?;
        rx.await.map_err(|_| StoreError::WriterStopped)
    }

    async fn run_writer(path: PathBuf, mut rx: mpsc::UnboundedReceiver<WriteRequest>) {
        while let Some(request) = rx.recv().await {
            let mut latest = None;
            let mut waiters = Vec::new();
            let mut next = Some(request);

            // Coalesce everything already queued into one write
            while let Some(request) = next {
                match request {
                    WriteRequest::Snapshot(snapshot) => latest = Some(snapshot),
                    WriteRequest::Flush(done) => waiters.push(done),
                }
                next = rx.try_recv().ok();
            }

            if let Some(snapshot) = latest {
                if let Err(e) = Self::write_snapshot(&path, &snapshot).await {
                    error!("Failed to persist state: {}", e);
                }
            }
            for done in waiters {
                let _ = done.send(());
            }
        }
        debug!("State writer for {} stopped", path.display());
    }

    async fn write_snapshot(path: &Path, snapshot: &Value) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io { path: path.to_path_buf(), source };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let content = serde_json::to_string_pretty(snapshot)
            .map_err(|source| StoreError::Format { path: path.to_path_buf(), source })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).await.map_err(io_err)?;
        fs::rename(&tmp, path).await.map_err(io_err)?;

        debug!("Persisted state to {}", path.display());
        Ok(())
    }
}

impl StateStore for JsonStateStore {
    fn load(&self, key: &str) -> Option<Value> {
        let values = self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        values.get(key).cloned()
    }

    fn save(&self, key: &str, value: Value) {
        let snapshot = {
            let mut values = self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            values.insert(key.to_string(), value);
            Value::Object(values.clone())
        };
        if self.writer.send(WriteRequest::Snapshot(snapshot)).is_err() {
            error!("State writer has stopped, change to '{}' not persisted", key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_store_helpers() {
        let store = MemoryStateStore::new();
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();

        save_strings(&store, keys::BOT_LIST, vec!["nightbot", "moobot"]);
        save_date(&store, keys::LAST_RESET_DATE, date);

        assert_eq!(
            load_strings(&store, keys::BOT_LIST),
            Some(vec!["nightbot".to_string(), "moobot".to_string()])
        );
        assert_eq!(load_date(&store, keys::LAST_RESET_DATE), Some(date));
        assert_eq!(store.load(keys::LAST_RESET_DATE), Some(Value::String("2024-03-09".into())));
        assert_eq!(load_strings(&store, keys::ACKNOWLEDGED_CHATTERS), None);
    }

    #[test]
    fn test_malformed_values_are_ignored() {
        let store = MemoryStateStore::new();
        store.save(keys::LAST_RESET_DATE, Value::String("yesterday".into()));
        store.save(keys::BOT_LIST, Value::Bool(true));
        store.save(keys::CHANNEL, Value::String(String::new()));

        assert_eq!(load_date(&store, keys::LAST_RESET_DATE), None);
        assert_eq!(load_strings(&store, keys::BOT_LIST), None);
        assert_eq!(load_string(&store, keys::CHANNEL), None);
    }

    #[tokio::test]
    async fn test_json_store_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("firstchat.json");

        {
            let store = JsonStateStore::open(&path).await.unwrap();
            save_strings(&store, keys::ACKNOWLEDGED_CHATTERS, vec!["alice"]);
            save_strings(&store, keys::ACKNOWLEDGED_CHATTERS, vec!["alice", "bob"]);
            store.flush().await.unwrap();
        }

        let reopened = JsonStateStore::open(&path).await.unwrap();
        assert_eq!(
            load_strings(&reopened, keys::ACKNOWLEDGED_CHATTERS),
            Some(vec!["alice".to_string(), "bob".to_string()])
        );
    }

    #[tokio::test]
    async fn test_json_store_rejects_non_object_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "[1, 2, 3]").await.unwrap();

        let result = JsonStateStore::open(&path).await;
        assert!(matches!(result, Err(StoreError::Format { .. })));
    }
}
