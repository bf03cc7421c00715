//! Durable key/value cache keyed by host or UPS name.

use std::collections::BTreeMap;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum DatastoreError {
    #[error("datastore I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("datastore encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Map-like persistence consumed by the host and UPS services.
/// Each entity only ever touches its own key.
pub trait Datastore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value) -> Result<(), DatastoreError>;
    fn clear(&self) -> Result<(), DatastoreError>;
}

/// Datastore backed by a single JSON object on disk.
/// Writes go through a temp file and rename, serialized by the entries lock.
/// On a multi-threaded runtime the write moves off the async worker via `block_in_place`.
pub struct JsonDatastore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl JsonDatastore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DatastoreError> {
        let path = path.into();

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| DatastoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let entries = match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => match serde_json::from_str(&content) {
                Ok(map) => map,
                Err(e) => {
                    warn!("Datastore {:?} is corrupt ({}), starting empty", path, e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(DatastoreError::Io { path, source }),
        };

        debug!("Opened datastore {:?} with {} entries", path, entries.len());

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn flush(&self, entries: &BTreeMap<String, Value>) -> Result<(), DatastoreError> {
        let content = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");

        blocking(|| {
            std::fs::write(&tmp, content).map_err(|source| DatastoreError::Io {
                path: tmp.clone(),
                source,
            })?;
            std::fs::rename(&tmp, &self.path).map_err(|source| DatastoreError::Io {
                path: self.path.clone(),
                source,
            })
        })
    }
}

/// `block_in_place` panics on a current-thread runtime, so it is only used on a multi-threaded one.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => tokio::task::block_in_place(f),
        _ => f(),
    }
}

impl Datastore for JsonDatastore {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<(), DatastoreError> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), value);
        self.flush(&entries)
    }

    fn clear(&self) -> Result<(), DatastoreError> {
        let mut entries = self.entries.lock();
        entries.clear();
        self.flush(&entries)
    }
}

/// Read a typed record, falling back to its default when absent or unreadable.
pub fn load_record<T>(store: &dyn Datastore, key: &str) -> T
where
    T: serde::de::DeserializeOwned + Default,
{
    match store.get(key) {
        Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
            warn!("Discarding unreadable cache entry for \"{}\": {}", key, e);
            T::default()
        }),
        None => T::default(),
    }
}

pub fn save_record<T: serde::Serialize>(store: &dyn Datastore, key: &str, record: &T) -> Result<(), DatastoreError> {
    store.set(key, serde_json::to_value(record)?)
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hosts.json");

        let store = JsonDatastore::open(&path).unwrap();
        store.set("nas", json!({"status": "up", "ack": true})).unwrap();
        drop(store);

        let store = JsonDatastore::open(&path).unwrap();
        assert_eq!(store.get("nas"), Some(json!({"status": "up", "ack": true})));
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn clear_removes_everything_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ups.json");

        let store = JsonDatastore::open(&path).unwrap();
        store.set("rack", json!({"hosts_halted": true})).unwrap();
        store.clear().unwrap();

        let store = JsonDatastore::open(&path).unwrap();
        assert_eq!(store.get("rack"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_writers_on_worker_threads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.json");
        let store = std::sync::Arc::new(JsonDatastore::open(&path).unwrap());

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.set(&format!("host{}", i), json!({"ack": i % 2 == 0})) })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let reopened = JsonDatastore::open(&path).unwrap();
        for i in 0..8 {
            assert_eq!(reopened.get(&format!("host{}", i)), Some(json!({"ack": i % 2 == 0})));
        }
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn writes_inside_current_thread_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ups.json");

        let store = JsonDatastore::open(&path).unwrap();
        store.set("rack", json!({"hosts_halted": true})).unwrap();

        let reopened = JsonDatastore::open(&path).unwrap();
        assert_eq!(reopened.get("rack"), Some(json!({"hosts_halted": true})));
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = JsonDatastore::open(&path).unwrap();
        assert_eq!(store.get("anything"), None);
    }
}
