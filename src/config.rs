//! Node configuration - JSON file with defaults, snapshots, live reload.

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

pub const CONFIG_FILE: &str = "config.json";

/// One ICE server for the data-channel transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerEntry {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Everything the daemon reads at runtime. Hand-editable; the daemon
/// re-reads the file when it changes on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// This node's peer identifier.
    pub id: String,
    /// Loopback port the daemon IPC listens on.
    pub ipc_port: u16,
    /// Base URL of the rendezvous server.
    pub rendezvous_url: String,
    pub ice_servers: Vec<IceServerEntry>,
    /// Local endpoints the responder-side bindings connect to.
    pub shell_port: u16,
    pub framebuffer_port: u16,
    pub http_port: u16,
    pub message_port: u16,
    pub transfer_port: u16,
    /// Peers reachable over the LAN, for the direct transport.
    pub direct_peers: HashMap<String, SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ipc_port: 2224,
            rendezvous_url: "http://127.0.0.1:11095".to_string(),
            ice_servers: vec![IceServerEntry {
                urls: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                ],
                username: String::new(),
                credential: String::new(),
            }],
            shell_port: 22,
            framebuffer_port: 5900,
            http_port: 80,
            message_port: 2226,
            transfer_port: 8097,
            direct_peers: HashMap::new(),
        }
    }
}

impl Config {
    pub fn ipc_addr(&self) -> String {
        format!("127.0.0.1:{}", self.ipc_port)
    }
}

/// Shared, reloadable view of the config file. Components keep the
/// handle and call `snapshot()` on each use.
pub struct ConfigHandle {
    path: PathBuf,
    current: Arc<RwLock<Arc<Config>>>,
    _watcher: Option<RecommendedWatcher>,
}

/// Cloneable snapshot source handed to long-lived components. Stays
/// valid for as long as any clone exists; reloads flow through.
#[derive(Clone)]
pub struct ConfigView {
    current: Arc<RwLock<Arc<Config>>>,
}

impl ConfigView {
    pub fn snapshot(&self) -> Arc<Config> {
        self.current.read().expect("config lock poisoned").clone()
    }

    /// A view over a fixed config, for components built without a file.
    pub fn fixed(config: Config) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }
}

impl ConfigHandle {
    /// Load the config from `home`, writing defaults on first run.
    pub fn load_or_init(home: &Path) -> Result<Self> {
        std::fs::create_dir_all(home)
            .with_context(|| format!("failed to create {}", home.display()))?;
        let path = home.join(CONFIG_FILE);
        let config = if path.exists() {
            read_config(&path)?
        } else {
            let config = Config::default();
            let text = serde_json::to_string_pretty(&config)?;
            std::fs::write(&path, text)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!("wrote default config to {}", path.display());
            config
        };
        Ok(Self {
            path,
            current: Arc::new(RwLock::new(Arc::new(config))),
            _watcher: None,
        })
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.current.read().expect("config lock poisoned").clone()
    }

    pub fn view(&self) -> ConfigView {
        ConfigView {
            current: self.current.clone(),
        }
    }

    /// Re-read the file and swap the snapshot. Keeps the old snapshot
    /// if the file is missing or unparsable.
    pub fn reload(&self) {
        match read_config(&self.path) {
            Ok(config) => {
                *self.current.write().expect("config lock poisoned") = Arc::new(config);
                info!("config reloaded from {}", self.path.display());
            }
            Err(e) => warn!("config reload failed, keeping previous: {e:#}"),
        }
    }

    /// Watch the config file and reload on change.
    pub fn watch(&mut self) -> Result<()> {
        let path = self.path.clone();
        let current = self.current.clone();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            match event {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    match read_config(&path) {
                        Ok(config) => {
                            *current.write().expect("config lock poisoned") = Arc::new(config);
                            info!("config reloaded from {}", path.display());
                        }
                        Err(e) => warn!("config reload failed, keeping previous: {e:#}"),
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("config watch error: {e}"),
            }
        })?;
        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", dir.display()))?;
        self._watcher = Some(watcher);
        Ok(())
    }
}

fn read_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

/// Default home directory (`~/.farlink`).
pub fn default_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".farlink")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let handle = ConfigHandle::load_or_init(dir.path()).unwrap();
        assert!(dir.path().join(CONFIG_FILE).exists());
        let config = handle.snapshot();
        assert_eq!(config.ipc_port, 2224);
        assert!(!config.id.is_empty());

        // A second load picks up the same identity.
        let again = ConfigHandle::load_or_init(dir.path()).unwrap();
        assert_eq!(again.snapshot().id, config.id);
    }

    #[test]
    fn reload_swaps_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let handle = ConfigHandle::load_or_init(dir.path()).unwrap();
        let mut edited = (*handle.snapshot()).clone();
        edited.ipc_port = 4242;
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            serde_json::to_string_pretty(&edited).unwrap(),
        )
        .unwrap();

        handle.reload();
        assert_eq!(handle.snapshot().ipc_port, 4242);
    }

    #[test]
    fn reload_keeps_previous_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let handle = ConfigHandle::load_or_init(dir.path()).unwrap();
        let before = handle.snapshot().ipc_port;
        std::fs::write(dir.path().join(CONFIG_FILE), "{not json").unwrap();

        handle.reload();
        assert_eq!(handle.snapshot().ipc_port, before);
    }
}
