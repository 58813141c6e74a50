//! Typed key-value settings access + change notification.
//!
//! The file-backed implementation serializes with `serde_json` and writes
//! through a temp-file-then-rename step so a crash mid-write can never
//! leave a half-written settings file behind.

pub mod errors;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Mutex, RwLock};

use serde_json::Value;

use crate::settings::errors::SettingsError;

/// Typed get/set over a flat key-value namespace, plus a change-notification
/// stream.
pub trait SettingsHost: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, SettingsError>;
    fn set(&self, key: &str, value: Value) -> Result<(), SettingsError>;
    /// Registers a channel that receives the key name on every successful
    /// `set`. Returns a subscription id usable with no explicit `unsubscribe`
    /// in this reference implementation - the sender is simply dropped by
    /// the caller when no longer needed and pruned lazily on next `set`.
    fn subscribe(&self) -> mpsc::Receiver<String>;
}

/// Single-file, single-`HashMap` settings store.
pub struct FileSettingsHost {
    path: PathBuf,
    data: RwLock<HashMap<String, Value>>,
    subscribers: Mutex<Vec<mpsc::Sender<String>>>,
}

impl FileSettingsHost {
    /// Opens (or creates) a settings file at `path`.
    ///
    /// # Arguments
    ///
    /// * 'path' - path to the JSON-backed settings file
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    fn flush(&self, data: &HashMap<String, Value>) -> Result<(), SettingsError> {
        let json = serde_json::to_string_pretty(data)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn notify(&self, key: &str) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|s| s.send(key.to_string()).is_ok());
    }
}

impl SettingsHost for FileSettingsHost {
    fn get(&self, key: &str) -> Result<Option<Value>, SettingsError> {
        let data = self.data.read()?;
        Ok(data.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), SettingsError> {
        {
            let mut data = self.data.write()?;
            data.insert(key.to_string(), value);
            self.flush(&data)?;
        }
        self.notify(key);
        Ok(())
    }

    fn subscribe(&self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

/// Keys that merely cache a snapshot and must never trigger a rebuild on
/// write, to avoid feedback loops: every other write schedules a rebuild.
pub const SNAPSHOT_ONLY_KEYS: &[&str] = &[
    "combined_prices",
    "power_tracker_state",
    "device_plan_snapshot",
    "daily_plan_snapshot",
];

pub fn is_snapshot_only(key: &str) -> bool {
    SNAPSHOT_ONLY_KEYS.contains(&key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn set_then_get_round_trips() {
        let dir = std::env::temp_dir().join(format!("mygrid-settings-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let host = FileSettingsHost::open(dir.join("settings.json")).unwrap();
        host.set("price_area", Value::String("NO1".to_string())).unwrap();
        let v = host.get("price_area").unwrap();
        assert_eq!(v, Some(Value::String("NO1".to_string())));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn subscribers_receive_changed_key() {
        let dir = std::env::temp_dir().join(format!("mygrid-settings-test2-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let host = FileSettingsHost::open(dir.join("settings.json")).unwrap();
        let rx = host.subscribe();
        host.set("capacity_limit_kw", Value::from(5.0)).unwrap();
        let key = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(key, "capacity_limit_kw");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn snapshot_keys_are_excluded_from_rebuild_triggers() {
        assert!(is_snapshot_only("combined_prices"));
        assert!(is_snapshot_only("daily_plan_snapshot"));
        assert!(!is_snapshot_only("capacity_limit_kw"));
    }
}
