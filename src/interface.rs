//! Tethered interface registry
//!
//! An interface is tethered once it has been switched to IPv6 router mode
//! and the forwarding helper (if running) has accepted the new interface
//! list. Any failure on the way returns the interface to client mode.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::channel::{ControlMessage, DaemonChannel};
use crate::error::{Error, Result};

pub const IPV6_CONF_ROOT: &str = "/proc/sys/net/ipv6/conf";

/// IFNAMSIZ minus the terminator
const MAX_IFACE_NAME_LEN: usize = 15;

/// Per-interface IPv6 knobs used for role changes
pub trait InterfaceConfigurator: Send + Sync {
    fn set_ipv6_enabled(&self, iface: &str, enabled: bool) -> io::Result<()>;
    fn set_accept_ra(&self, iface: &str, accept: bool) -> io::Result<()>;
    fn set_accept_dad(&self, iface: &str, accept: bool) -> io::Result<()>;
    fn set_dad_transmits(&self, iface: &str, count: u32) -> io::Result<()>;
}

/// Writes the per-interface sysctl files under `/proc/sys/net/ipv6/conf`.
#[derive(Debug, Clone)]
pub struct ProcSysConfigurator {
    root: PathBuf,
}

impl ProcSysConfigurator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn write(&self, iface: &str, key: &str, value: &str) -> io::Result<()> {
        let path = self.root.join(iface).join(key);
        let mut file = OpenOptions::new().write(true).truncate(true).open(&path)?;
        file.write_all(value.as_bytes())
    }
}

fn flag(on: bool) -> &'static str {
    if on {
        "1"
    } else {
        "0"
    }
}

impl InterfaceConfigurator for ProcSysConfigurator {
    fn set_ipv6_enabled(&self, iface: &str, enabled: bool) -> io::Result<()> {
        self.write(iface, "disable_ipv6", flag(!enabled))
    }

    fn set_accept_ra(&self, iface: &str, accept: bool) -> io::Result<()> {
        self.write(iface, "accept_ra", flag(accept))
    }

    fn set_accept_dad(&self, iface: &str, accept: bool) -> io::Result<()> {
        self.write(iface, "accept_dad", flag(accept))
    }

    fn set_dad_transmits(&self, iface: &str, count: u32) -> io::Result<()> {
        self.write(iface, "dad_transmits", &count.to_string())
    }
}

/// Alphanumeric first character, then alphanumerics, `_`, `-` or `:`.
/// Names are joined onto sysctl paths, so `.` and `/` never pass.
pub fn is_iface_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_IFACE_NAME_LEN
        && first.is_ascii_alphanumeric()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':'))
}

fn configure_for_router(cfg: &dyn InterfaceConfigurator, iface: &str) -> io::Result<()> {
    cfg.set_ipv6_enabled(iface, false)?;
    cfg.set_accept_ra(iface, false)?;
    cfg.set_accept_dad(iface, false)?;
    cfg.set_dad_transmits(iface, 0)?;
    cfg.set_ipv6_enabled(iface, true)
}

/// Every step is attempted regardless of earlier failures.
fn configure_for_client(cfg: &dyn InterfaceConfigurator, iface: &str) {
    let steps = [
        ("accept_ra", cfg.set_accept_ra(iface, true)),
        ("accept_dad", cfg.set_accept_dad(iface, true)),
        ("dad_transmits", cfg.set_dad_transmits(iface, 1)),
        ("disable_ipv6", cfg.set_ipv6_enabled(iface, false)),
    ];
    for (step, result) in steps {
        if let Err(e) = result {
            warn!("Failed to restore {} on {}: {}", step, iface, e);
        }
    }
}

pub struct InterfaceRegistry {
    interfaces: Vec<String>,
    configurator: Box<dyn InterfaceConfigurator>,
}

impl InterfaceRegistry {
    pub fn new(configurator: Box<dyn InterfaceConfigurator>) -> Self {
        Self {
            interfaces: Vec::new(),
            configurator,
        }
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    pub fn contains(&self, name: &str) -> bool {
        self.interfaces.iter().any(|i| i == name)
    }

    /// Puts `name` into router mode and announces it to the helper.
    pub async fn tether(&mut self, name: &str, channel: Option<&mut DaemonChannel>) -> Result<()> {
        debug!("tetherInterface({})", name);
        if !is_iface_name(name) {
            return Err(Error::InterfaceNotFound(name.to_string()));
        }
        if self.contains(name) {
            debug!("{} is already tethered", name);
            return Ok(());
        }

        if let Err(source) = configure_for_router(self.configurator.as_ref(), name) {
            warn!("Router configuration of {} failed, rolling back: {}", name, source);
            configure_for_client(self.configurator.as_ref(), name);
            return Err(Error::RouterConfig {
                iface: name.to_string(),
                source,
            });
        }
        self.interfaces.push(name.to_string());

        if let Err(e) = self.push(channel).await {
            self.interfaces.pop();
            configure_for_client(self.configurator.as_ref(), name);
            return Err(e);
        }
        info!("Interface {} tethered", name);
        Ok(())
    }

    /// Returns `name` to client mode. The interface stays removed even if the
    /// helper cannot be told.
    pub async fn untether(&mut self, name: &str, channel: Option<&mut DaemonChannel>) -> Result<()> {
        debug!("untetherInterface({})", name);
        let pos = self
            .interfaces
            .iter()
            .position(|i| i == name)
            .ok_or_else(|| Error::InterfaceNotFound(name.to_string()))?;

        self.interfaces.remove(pos);
        configure_for_client(self.configurator.as_ref(), name);
        info!("Interface {} untethered", name);
        self.push(channel).await
    }

    pub fn list_message(&self) -> ControlMessage {
        ControlMessage::update_ifaces(self.interfaces.iter().map(String::as_str))
    }

    /// Sends the interface list to a running helper. An empty list is never
    /// sent.
    pub async fn push(&self, channel: Option<&mut DaemonChannel>) -> Result<()> {
        let Some(channel) = channel else {
            return Ok(());
        };
        if self.interfaces.is_empty() {
            return Ok(());
        }
        channel.send(&self.list_message()).await
    }
}
