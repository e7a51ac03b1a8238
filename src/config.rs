//! Configuration loading and persistence.
//!
//! Settings live in `config.json` in the platform config directory. Missing
//! or unreadable files fall back to defaults; `FIBERLENS_*` environment
//! variables override whatever was loaded.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::channel::{BackoffPolicy, TransportKind, TransportSpec};
use crate::host::adapter::DiscoveryPolicy;
use crate::inspect::SerializerOptions;
use crate::snapshot::BuildOptions;

const CONFIG_FILE: &str = "config.json";

/// Configuration for an inspector session and the CLI.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Quiet period before a committed root is rebuilt, in milliseconds.
    pub debounce_ms: u64,
    /// Outgoing RPC timeout in seconds.
    pub rpc_timeout_secs: u64,
    /// Serializer depth limit.
    pub max_depth: usize,
    /// Serializer string clip length.
    pub max_string_len: usize,
    /// Serializer children per composite.
    pub max_entries: usize,
    /// Serializer preview length.
    pub preview_items: usize,
    /// Keep platform nodes in snapshots.
    pub include_host_nodes: bool,
    /// Recursion guard for snapshot rebuilds.
    pub max_tree_depth: usize,
    /// Ancestors listed in component details.
    pub ancestor_depth: usize,
    /// Root discovery attempts.
    pub discovery_attempts: u32,
    /// Root discovery spacing unit in milliseconds.
    pub discovery_base_delay_ms: u64,
    /// First reconnect delay in milliseconds.
    pub reconnect_initial_ms: u64,
    /// Reconnect delay cap in milliseconds.
    pub reconnect_max_ms: u64,
    /// Connection attempts before giving up.
    pub reconnect_max_attempts: u32,
    /// Transport used to reach the panel.
    pub transport: TransportKind,
    /// WebSocket URL the panel side connects to.
    pub socket_url: String,
    /// Address the demo host listens on.
    pub listen_addr: String,
    /// Broadcast channel name.
    pub broadcast_name: String,
    /// Origin frame messages are addressed to.
    pub frame_target_origin: String,
}

impl Default for Config {
    fn default() -> Self {
        let backoff = BackoffPolicy::default();
        let serializer = SerializerOptions::default();
        Self {
            debounce_ms: 200,
            rpc_timeout_secs: crate::rpc::DEFAULT_TIMEOUT.as_secs(),
            max_depth: serializer.max_depth,
            max_string_len: serializer.max_string_len,
            max_entries: serializer.max_entries,
            preview_items: serializer.preview_items,
            include_host_nodes: false,
            max_tree_depth: BuildOptions::default().max_depth,
            ancestor_depth: 25,
            discovery_attempts: 10,
            discovery_base_delay_ms: 100,
            reconnect_initial_ms: u64::try_from(backoff.initial.as_millis()).unwrap_or(u64::MAX),
            reconnect_max_ms: u64::try_from(backoff.max.as_millis()).unwrap_or(u64::MAX),
            reconnect_max_attempts: backoff.max_attempts,
            transport: TransportKind::Socket,
            socket_url: "ws://127.0.0.1:8097".to_string(),
            listen_addr: "127.0.0.1:8097".to_string(),
            broadcast_name: "fiberlens".to_string(),
            frame_target_origin: "*".to_string(),
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `FIBERLENS_CONFIG_DIR` wins; otherwise the platform config dir
    /// (Linux: `~/.config/fiberlens`).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("FIBERLENS_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("fiberlens")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let dir = Self::config_dir()?;
        Ok(Self::load_from(&dir))
    }

    /// Like [`Config::load`] but reading from `dir`.
    pub fn load_from(dir: &Path) -> Self {
        let mut config = Self::load_from_file(dir).unwrap_or_else(|e| {
            log::debug!("Using default config: {:#}", e);
            Self::default()
        });
        config.apply_env_overrides();
        config
    }

    fn load_from_file(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid config file {}", config_path.display()))
        } else {
            anyhow::bail!("Config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `FIBERLENS_*` overrides looked up through `var`.
    /// Values that fail to parse are ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(debounce) = var("FIBERLENS_DEBOUNCE_MS") {
            if let Ok(ms) = debounce.parse::<u64>() {
                self.debounce_ms = ms;
            }
        }

        if let Some(timeout) = var("FIBERLENS_RPC_TIMEOUT_SECS") {
            if let Ok(secs) = timeout.parse::<u64>() {
                self.rpc_timeout_secs = secs;
            }
        }

        if let Some(max_depth) = var("FIBERLENS_MAX_DEPTH") {
            if let Ok(depth) = max_depth.parse::<usize>() {
                self.max_depth = depth;
            }
        }

        if let Some(include) = var("FIBERLENS_INCLUDE_HOST_NODES") {
            match include.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.include_host_nodes = true,
                "0" | "false" | "no" => self.include_host_nodes = false,
                other => log::warn!("Ignoring FIBERLENS_INCLUDE_HOST_NODES={}", other),
            }
        }

        if let Some(url) = var("FIBERLENS_SOCKET_URL") {
            self.socket_url = url;
        }

        if let Some(transport) = var("FIBERLENS_TRANSPORT") {
            match transport.parse::<TransportKind>() {
                Ok(kind) => self.transport = kind,
                Err(e) => log::warn!("Ignoring FIBERLENS_TRANSPORT: {}", e),
            }
        }
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?)
    }

    /// Like [`Config::save`] but writing into `dir`.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        let config_path = dir.join(CONFIG_FILE);
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Rebuild debounce window.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Outgoing RPC timeout.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    /// Snapshot builder options.
    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            include_host_nodes: self.include_host_nodes,
            max_depth: self.max_tree_depth,
        }
    }

    /// Value serializer limits.
    pub fn serializer_options(&self) -> SerializerOptions {
        SerializerOptions {
            max_depth: self.max_depth,
            max_string_len: self.max_string_len,
            max_entries: self.max_entries,
            preview_items: self.preview_items,
        }
    }

    /// Root discovery schedule.
    pub fn discovery_policy(&self) -> DiscoveryPolicy {
        DiscoveryPolicy {
            max_attempts: self.discovery_attempts,
            base_delay: Duration::from_millis(self.discovery_base_delay_ms),
        }
    }

    /// Reconnect schedule.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(self.reconnect_initial_ms),
            max: Duration::from_millis(self.reconnect_max_ms),
            max_attempts: self.reconnect_max_attempts,
            jitter: true,
        }
    }

    /// Channel description for the configured transport.
    pub fn transport_spec(&self) -> TransportSpec {
        match self.transport {
            TransportKind::Local => TransportSpec::Local,
            TransportKind::Frame => TransportSpec::Frame {
                target_origin: self.frame_target_origin.clone(),
            },
            TransportKind::Broadcast => TransportSpec::Broadcast {
                name: self.broadcast_name.clone(),
            },
            TransportKind::Socket => TransportSpec::Socket {
                url: self.socket_url.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.debounce(), Duration::from_millis(200));
        assert_eq!(config.rpc_timeout(), Duration::from_secs(30));
        assert_eq!(config.serializer_options(), SerializerOptions::default());
        assert_eq!(config.backoff_policy(), BackoffPolicy::default());
        assert_eq!(config.transport, TransportKind::Socket);
    }

    #[test]
    fn test_save_then_load_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.debounce_ms = 50;
        config.transport = TransportKind::Broadcast;
        config.save_to(dir.path()).unwrap();

        let text = fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap();
        assert!(text.contains("\"transport\": \"broadcast\""));

        let mut loaded = Config::load_from_file(dir.path()).unwrap();
        loaded.apply_overrides(|_| None);
        assert_eq!(loaded, config);
        assert_eq!(
            loaded.transport_spec(),
            TransportSpec::Broadcast {
                name: "fiberlens".to_string()
            }
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_file_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        Config::default().save_to(dir.path()).unwrap();
        let mode = fs::metadata(dir.path().join(CONFIG_FILE)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), r#"{"max_depth": 2}"#).unwrap();
        let config = Config::load_from_file(dir.path()).unwrap();
        assert_eq!(config.max_depth, 2);
        assert_eq!(config.debounce_ms, 200);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load_from_file(dir.path()).is_err());
    }

    #[test]
    fn test_overrides_parse_and_ignore_garbage() {
        let vars: HashMap<&str, &str> = [
            ("FIBERLENS_DEBOUNCE_MS", "15"),
            ("FIBERLENS_RPC_TIMEOUT_SECS", "soon"),
            ("FIBERLENS_INCLUDE_HOST_NODES", "yes"),
            ("FIBERLENS_TRANSPORT", "ws"),
            ("FIBERLENS_SOCKET_URL", "ws://10.0.0.2:9000"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.transport = TransportKind::Local;
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.debounce_ms, 15);
        assert_eq!(config.rpc_timeout_secs, 30);
        assert!(config.include_host_nodes);
        assert_eq!(
            config.transport_spec(),
            TransportSpec::Socket {
                url: "ws://10.0.0.2:9000".to_string()
            }
        );
    }
}
