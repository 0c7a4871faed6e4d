use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::forwarding::{IPV4_FORWARDING_PATH, IPV6_FORWARDING_PATH};
use crate::interface::IPV6_CONF_ROOT;
use crate::supervisor::DEFAULT_HELPER_PATH;

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub socket_path: String,
    pub helper_path: String,
    pub ipv4_forwarding_path: String,
    pub ipv6_forwarding_path: String,
    pub ipv6_conf_root: String,
    /// Keep IP forwarding on for the whole lifetime of the daemon
    pub force_forwarding: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: "/run/netd/netd.sock".to_string(),
            helper_path: DEFAULT_HELPER_PATH.to_string(),
            ipv4_forwarding_path: IPV4_FORWARDING_PATH.to_string(),
            ipv6_forwarding_path: IPV6_FORWARDING_PATH.to_string(),
            ipv6_conf_root: IPV6_CONF_ROOT.to_string(),
            force_forwarding: false,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(CONFIG_FILE)
    }

    /// Reads the config file at `path`, writing the defaults there first if
    /// it does not exist yet.
    pub fn load_from(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Ok(config_str) = std::fs::read_to_string(path) {
            let config: Config = serde_json::from_str(&config_str)?;
            Ok(config)
        } else {
            let config = Config::default();
            let config_str = serde_json::to_string_pretty(&config)?;
            std::fs::write(path, config_str)?;
            Ok(config)
        }
    }

    pub fn socket_path(&self) -> anyhow::Result<PathBuf> {
        let path = PathBuf::from(&self.socket_path);
        if !path.is_absolute() {
            return Err(anyhow::anyhow!("Invalid socket path '{}': must be absolute", self.socket_path));
        }
        Ok(path)
    }
}
