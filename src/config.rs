//! Runtime configuration.
//!
//! Loaded from `<data_dir>/config.json` when present; every field has a
//! default and a few can be overridden from the environment.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::error::Result;

const CONFIG_FILE: &str = "config.json";
const DB_FILE: &str = "pos-offline.db";
const MANIFEST_FILE: &str = "image-sync.json";
const UPLOADS_DIR: &str = "uploads";
const LOGS_DIR: &str = "logs";

#[derive(Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoreConfig {
    pub data_dir: PathBuf,
    pub remote_url: String,
    pub api_key: Option<String>,
    /// Filter directive for the log subscriber, e.g. `info,offline_pos_core=debug`.
    pub log_filter: Option<String>,
    pub probe_interval_secs: u64,
    pub sync_interval_secs: u64,
    pub query_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub asset_timeout_secs: u64,
    pub staleness_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            remote_url: "http://localhost:3000".to_string(),
            api_key: None,
            log_filter: None,
            probe_interval_secs: 5,
            sync_interval_secs: 30,
            query_timeout_secs: 5,
            probe_timeout_secs: 5,
            asset_timeout_secs: 10,
            staleness_secs: 3600,
        }
    }
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("data_dir", &self.data_dir)
            .field("remote_url", &self.remote_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("log_filter", &self.log_filter)
            .field("probe_interval_secs", &self.probe_interval_secs)
            .field("sync_interval_secs", &self.sync_interval_secs)
            .field("query_timeout_secs", &self.query_timeout_secs)
            .field("probe_timeout_secs", &self.probe_timeout_secs)
            .field("asset_timeout_secs", &self.asset_timeout_secs)
            .field("staleness_secs", &self.staleness_secs)
            .finish()
    }
}

/// Platform data directory, following the usual per-user locations.
fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("offline-pos")
}

impl CoreConfig {
    /// Resolve configuration from the environment and the config file.
    ///
    /// `POS_DATA_DIR` picks the directory the file is read from; the other
    /// variables override whatever the file says.
    pub fn load() -> Result<Self> {
        let data_dir = std::env::var("POS_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());
        let mut config = Self::load_from(&data_dir)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Read `<data_dir>/config.json`, falling back to defaults when it is
    /// missing. A file that does not parse is an error.
    pub fn load_from(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        let mut config = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<Self>(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        config.data_dir = data_dir.to_path_buf();
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(dir) = non_empty("POS_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = non_empty("POS_REMOTE_URL") {
            self.remote_url = url;
        }
        if let Some(key) = non_empty("POS_API_KEY") {
            self.api_key = Some(key);
        }
        if let Some(filter) = non_empty("POS_LOG") {
            self.log_filter = Some(filter);
        }
        for (name, secs) in [
            ("probe_interval_secs", self.probe_interval_secs),
            ("sync_interval_secs", self.sync_interval_secs),
        ] {
            if secs == 0 {
                warn!("{name} is 0, background loop will spin; using 1");
            }
        }
        self.probe_interval_secs = self.probe_interval_secs.max(1);
        self.sync_interval_secs = self.sync_interval_secs.max(1);
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.data_dir.join(MANIFEST_FILE)
    }

    pub fn asset_dir(&self) -> PathBuf {
        self.data_dir.join(UPLOADS_DIR)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join(LOGS_DIR)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn asset_timeout(&self) -> Duration {
        Duration::from_secs(self.asset_timeout_secs)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.remote_url, "http://localhost:3000");
        assert_eq!(config.sync_interval(), Duration::from_secs(30));
        assert_eq!(config.query_timeout(), Duration::from_secs(5));
        assert_eq!(config.asset_timeout(), Duration::from_secs(10));
        assert_eq!(config.staleness(), Duration::from_secs(3600));
    }

    #[test]
    fn missing_file_gives_defaults_in_that_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = CoreConfig::load_from(dir.path()).expect("load");
        assert_eq!(config.data_dir, dir.path());
        assert_eq!(config.db_path(), dir.path().join("pos-offline.db"));
        assert_eq!(config.manifest_path(), dir.path().join("image-sync.json"));
        assert_eq!(config.asset_dir(), dir.path().join("uploads"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("config.json"),
            r#"{"remoteUrl": "https://pos.example.com", "syncIntervalSecs": 60}"#,
        )
        .expect("write config");
        let config = CoreConfig::load_from(dir.path()).expect("load");
        assert_eq!(config.remote_url, "https://pos.example.com");
        assert_eq!(config.sync_interval_secs, 60);
        assert_eq!(config.probe_interval_secs, 5);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("config.json"), "{not json").expect("write config");
        assert!(CoreConfig::load_from(dir.path()).is_err());
    }

    #[test]
    fn environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("POS_REMOTE_URL", "http://10.0.0.2:3000"),
            ("POS_API_KEY", "secret"),
            ("POS_LOG", ""),
        ]
        .into_iter()
        .collect();
        let mut config = CoreConfig {
            sync_interval_secs: 0,
            ..CoreConfig::default()
        };
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.remote_url, "http://10.0.0.2:3000");
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.log_filter, None);
        assert_eq!(config.sync_interval_secs, 1);
        assert!(!format!("{config:?}").contains("secret"));
    }
}
