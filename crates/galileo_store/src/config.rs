//! System configuration resolved from the environment.

use std::path::PathBuf;

/// Default TCP listen port, stable across a cluster.
pub const DEFAULT_PORT: u16 = 5555;

/// Installation root; other paths derive from it when unset.
pub const ENV_INSTALL_ROOT: &str = "GALILEO_HOME";
/// Directory holding the network description.
pub const ENV_CONFIG_DIR: &str = "GALILEO_CONF";
/// Root directory for stored blocks.
pub const ENV_STORAGE_ROOT: &str = "GALILEO_ROOT";

/// File name of the overlay description inside the config directory.
pub const NETWORK_FILE: &str = "network";

/// Resolved filesystem locations for a node.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub install_root: PathBuf,
    pub config_dir: PathBuf,
    pub storage_root: PathBuf,
}

impl SystemConfig {
    /// Resolve from the three environment variables, deriving the config and
    /// storage directories from the install root when unset.
    pub fn from_env() -> Self {
        let install_root = std::env::var_os(ENV_INSTALL_ROOT)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let config_dir = std::env::var_os(ENV_CONFIG_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| install_root.join("config"));
        let storage_root = std::env::var_os(ENV_STORAGE_ROOT)
            .map(PathBuf::from)
            .unwrap_or_else(|| install_root.join("storage"));
        Self {
            install_root,
            config_dir,
            storage_root,
        }
    }

    /// Build a config with every path rooted under one directory.
    pub fn rooted(install_root: impl Into<PathBuf>) -> Self {
        let install_root = install_root.into();
        Self {
            config_dir: install_root.join("config"),
            storage_root: install_root.join("storage"),
            install_root,
        }
    }

    pub fn network_file(&self) -> PathBuf {
        self.config_dir.join(NETWORK_FILE)
    }

    pub fn status_file(&self) -> PathBuf {
        self.install_root.join("status.txt")
    }
}
