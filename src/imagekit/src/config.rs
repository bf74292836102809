//! Image configuration document.
//!
//! The decoded form of the config blob referenced by a manifest: platform,
//! creation time, runtime configuration, the rootfs diff id list, and the
//! history entries aligned with it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::descriptor::Digest;

/// The only rootfs type in use.
pub const ROOTFS_TYPE_LAYERS: &str = "layers";

/// Decoded image configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    /// CPU architecture (`amd64`, `arm64`, ...).
    pub architecture: String,
    /// Operating system (`linux`, `windows`).
    pub os: String,
    /// OS version, set for Windows images.
    #[serde(rename = "os.version", skip_serializing_if = "Option::is_none", default)]
    pub os_version: Option<String>,
    /// Image creation time. Absent for scratch images that were never saved.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub created: Option<DateTime<Utc>>,
    /// Runtime configuration.
    #[serde(default)]
    pub config: Config,
    /// Root filesystem diff ids, lowest layer first.
    pub rootfs: RootFs,
    /// Build history, aligned with `rootfs.diff_ids` for non-empty entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
}

/// Runtime configuration section (Docker-style PascalCase wire keys).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user: Option<String>,
    /// Ordered `KEY=VALUE` entries; at most one entry per key.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub env: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cmd: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub volumes: Option<BTreeMap<String, serde_json::Value>>,
}

/// Root filesystem specification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootFs {
    /// Always `layers`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Layer diff ids, lowest first.
    #[serde(default)]
    pub diff_ids: Vec<Digest>,
}

/// A single build history entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub empty_layer: Option<bool>,
}

impl History {
    /// Whether this entry describes a layer-less build step.
    pub fn is_empty_layer(&self) -> bool {
        self.empty_layer.unwrap_or(false)
    }
}

impl ConfigFile {
    /// Minimal configuration for an image that does not exist yet.
    pub fn scratch(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            architecture: architecture.into(),
            os: os.into(),
            os_version: None,
            created: None,
            config: Config::default(),
            rootfs: RootFs {
                kind: ROOTFS_TYPE_LAYERS.to_string(),
                diff_ids: Vec::new(),
            },
            history: Vec::new(),
        }
    }

    /// Number of history entries that carry a layer.
    pub fn non_empty_history_count(&self) -> usize {
        self.history.iter().filter(|h| !h.is_empty_layer()).count()
    }
}

impl Config {
    /// Looks up a label value.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.as_ref()?.get(key).map(String::as_str)
    }

    /// Sets a label, replacing any existing value.
    pub fn set_label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
    }

    /// Looks up an environment variable by scanning for the first
    /// `KEY=` prefix match.
    pub fn env(&self, key: &str) -> Option<&str> {
        let prefix_len = key.len() + 1;
        self.env
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|entry| {
                entry.len() >= prefix_len
                    && entry.starts_with(key)
                    && entry.as_bytes()[key.len()] == b'='
            })
            .map(|entry| &entry[prefix_len..])
    }

    /// Sets an environment variable. An existing `KEY=` entry is replaced
    /// in place, preserving its position; otherwise the entry is appended.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let entries = self.env.get_or_insert_with(Vec::new);
        let updated = format!("{}={}", key, value);
        let prefix = format!("{}=", key);
        match entries.iter_mut().find(|e| e.starts_with(&prefix)) {
            Some(slot) => *slot = updated,
            None => entries.push(updated),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_config() {
        let config = ConfigFile::scratch("linux", "amd64");
        assert_eq!(config.os, "linux");
        assert_eq!(config.architecture, "amd64");
        assert_eq!(config.rootfs.kind, "layers");
        assert!(config.rootfs.diff_ids.is_empty());
        assert!(config.created.is_none());
    }

    #[test]
    fn test_label_round_trip() {
        let mut config = Config::default();
        assert_eq!(config.label("mykey"), None);
        config.set_label("mykey", "myvalue");
        config.set_label("other", "data");
        assert_eq!(config.label("mykey"), Some("myvalue"));
        config.set_label("mykey", "new-val");
        assert_eq!(config.label("mykey"), Some("new-val"));
        assert_eq!(config.label("other"), Some("data"));
    }

    #[test]
    fn test_env_lookup() {
        let config = Config {
            env: Some(vec![
                "PATH=/usr/bin:/bin".to_string(),
                "MY_VAR=my_val".to_string(),
            ]),
            ..Config::default()
        };
        assert_eq!(config.env("MY_VAR"), Some("my_val"));
        assert_eq!(config.env("MISSING_VAR"), None);
        // MY_VAR must not match the MY prefix
        assert_eq!(config.env("MY"), None);
    }

    #[test]
    fn test_set_env_preserves_position() {
        let mut config = Config {
            env: Some(vec![
                "A=1".to_string(),
                "B=2".to_string(),
                "C=3".to_string(),
            ]),
            ..Config::default()
        };
        config.set_env("B", "changed");
        assert_eq!(
            config.env.as_deref().unwrap(),
            &["A=1".to_string(), "B=changed".to_string(), "C=3".to_string()]
        );
    }

    #[test]
    fn test_set_env_appends_new_key() {
        let mut config = Config::default();
        config.set_env("ENV_KEY", "ENV_VAL");
        assert_eq!(config.env.as_deref().unwrap(), &["ENV_KEY=ENV_VAL".to_string()]);
        // exactly one entry per key after re-set
        config.set_env("ENV_KEY", "other");
        assert_eq!(config.env.as_deref().unwrap(), &["ENV_KEY=other".to_string()]);
    }

    #[test]
    fn test_config_file_wire_format() {
        let json = r#"{
            "architecture": "amd64",
            "os": "linux",
            "created": "2019-04-02T23:32:10.727183061Z",
            "config": {
                "Entrypoint": ["/bin/app"],
                "Env": ["PATH=/usr/bin"],
                "WorkingDir": "/workspace",
                "Labels": {"mykey": "myvalue"}
            },
            "rootfs": {
                "type": "layers",
                "diff_ids": ["sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"]
            },
            "history": [
                {"created_by": "RUN echo hi"},
                {"created_by": "ENV A=1", "empty_layer": true}
            ]
        }"#;
        let config: ConfigFile = serde_json::from_str(json).unwrap();
        assert_eq!(config.config.label("mykey"), Some("myvalue"));
        assert_eq!(config.config.working_dir.as_deref(), Some("/workspace"));
        assert_eq!(config.rootfs.diff_ids.len(), 1);
        assert_eq!(config.non_empty_history_count(), 1);

        // PascalCase keys must survive a round trip
        let out = serde_json::to_value(&config).unwrap();
        assert!(out["config"]["Entrypoint"].is_array());
        assert!(out["config"]["Labels"].is_object());
        assert_eq!(out["rootfs"]["type"], "layers");
    }

    #[test]
    fn test_history_empty_layer_flag() {
        let entry = History {
            empty_layer: Some(true),
            ..History::default()
        };
        assert!(entry.is_empty_layer());
        assert!(!History::default().is_empty_layer());
    }
}
