use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

use crate::error::{Error, Result};

pub const IPV4_FORWARDING_PATH: &str = "/proc/sys/net/ipv4/ip_forward";
pub const IPV6_FORWARDING_PATH: &str = "/proc/sys/net/ipv6/conf/all/forwarding";

/// Requester id used when forwarding must never be turned off.
pub const ALWAYS_ON_REQUESTER: &str = "bp-tools";

/// Reference-counted control over the system IP forwarding toggles.
///
/// Forwarding is on while at least one requester holds it. The toggles are
/// only written when the requester set changes between empty and non-empty.
#[derive(Debug)]
pub struct ForwardingGate {
    requesters: BTreeSet<String>,
    ipv4_path: PathBuf,
    ipv6_path: PathBuf,
}

fn write_toggle(path: &Path, value: &str) -> std::io::Result<()> {
    // The toggle files always exist; never create one.
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.write_all(value.as_bytes())
}

impl ForwardingGate {
    pub fn new(ipv4_path: impl Into<PathBuf>, ipv6_path: impl Into<PathBuf>) -> Self {
        Self {
            requesters: BTreeSet::new(),
            ipv4_path: ipv4_path.into(),
            ipv6_path: ipv6_path.into(),
        }
    }

    /// Applies the startup policy: forced forwarding holds the reserved
    /// requester, otherwise the toggles are reset to the empty state.
    pub fn initialize(&mut self, force_forwarding: bool) -> Result<()> {
        if force_forwarding {
            self.enable(ALWAYS_ON_REQUESTER)
        } else {
            self.persist()
        }
    }

    pub fn enable(&mut self, requester: &str) -> Result<()> {
        let trigger = self.requesters.is_empty();
        self.requesters.insert(requester.to_string());
        if trigger {
            return self.persist();
        }
        Ok(())
    }

    pub fn disable(&mut self, requester: &str) -> Result<()> {
        let was_enabled = !self.requesters.is_empty();
        self.requesters.remove(requester);
        if was_enabled && self.requesters.is_empty() {
            return self.persist();
        }
        Ok(())
    }

    pub fn request_count(&self) -> usize {
        self.requesters.len()
    }

    pub fn is_requested(&self) -> bool {
        !self.requesters.is_empty()
    }

    pub fn requesters(&self) -> impl Iterator<Item = &str> {
        self.requesters.iter().map(String::as_str)
    }

    /// Writes the current state to both toggles. Both writes are attempted
    /// even if the first fails.
    fn persist(&self) -> Result<()> {
        let value = if self.requesters.is_empty() { "0" } else { "1" };
        debug!("Setting IP forward enable = {}", value);

        let mut success = true;
        for path in [&self.ipv4_path, &self.ipv6_path] {
            if let Err(e) = write_toggle(path, value) {
                error!("Failed to write {} to {}: {}", value, path.display(), e);
                success = false;
            }
        }

        if success {
            Ok(())
        } else {
            Err(Error::ForwardingToggle)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn gate_in(dir: &TempDir) -> ForwardingGate {
        let v4 = dir.path().join("ip_forward");
        let v6 = dir.path().join("forwarding");
        fs::write(&v4, "").unwrap();
        fs::write(&v6, "").unwrap();
        ForwardingGate::new(v4, v6)
    }

    fn toggles(dir: &TempDir) -> (String, String) {
        (
            fs::read_to_string(dir.path().join("ip_forward")).unwrap(),
            fs::read_to_string(dir.path().join("forwarding")).unwrap(),
        )
    }

    #[test]
    fn test_enable_disable_tracks_requesters() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut gate = gate_in(&dir);

        gate.enable("tethering").unwrap();
        assert_eq!(toggles(&dir), ("1".to_string(), "1".to_string()));

        gate.enable("vpn").unwrap();
        gate.enable("vpn").unwrap();
        assert_eq!(gate.request_count(), 2);

        gate.disable("tethering").unwrap();
        assert_eq!(toggles(&dir), ("1".to_string(), "1".to_string()));

        gate.disable("vpn").unwrap();
        assert_eq!(gate.request_count(), 0);
        assert_eq!(toggles(&dir), ("0".to_string(), "0".to_string()));
    }

    #[test]
    fn test_writes_only_on_transitions() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut gate = gate_in(&dir);

        gate.enable("a").unwrap();
        // Tamper with the files; a non-transition must not rewrite them.
        fs::write(dir.path().join("ip_forward"), "x").unwrap();
        gate.enable("b").unwrap();
        gate.disable("a").unwrap();
        assert_eq!(toggles(&dir).0, "x");

        gate.disable("unknown").unwrap();
        assert_eq!(toggles(&dir).0, "x");
    }

    #[test]
    fn test_disable_when_empty_is_noop() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut gate = gate_in(&dir);
        gate.disable("nobody").unwrap();
        assert_eq!(toggles(&dir), (String::new(), String::new()));
    }

    #[test]
    fn test_failed_write_keeps_requester_and_still_writes_v6() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let v6 = dir.path().join("forwarding");
        fs::write(&v6, "").unwrap();
        let mut gate = ForwardingGate::new(dir.path().join("missing"), &v6);

        let result = gate.enable("tethering");
        assert!(matches!(result, Err(Error::ForwardingToggle)));
        assert_eq!(gate.request_count(), 1);
        assert_eq!(fs::read_to_string(&v6).unwrap(), "1");
    }

    #[test]
    fn test_forced_forwarding_policy() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut gate = gate_in(&dir);
        gate.initialize(true).unwrap();

        assert_eq!(gate.requesters().collect::<Vec<_>>(), vec![ALWAYS_ON_REQUESTER]);
        assert_eq!(toggles(&dir).0, "1");

        gate.enable("tethering").unwrap();
        gate.disable(ALWAYS_ON_REQUESTER).unwrap();
        assert_eq!(toggles(&dir).0, "1");
        gate.disable("tethering").unwrap();
        assert_eq!(toggles(&dir).0, "0");
    }

    #[test]
    fn test_default_policy_resets_toggles() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut gate = gate_in(&dir);
        gate.initialize(false).unwrap();
        assert_eq!(toggles(&dir), ("0".to_string(), "0".to_string()));
        assert!(!gate.is_requested());
    }
}
