//! Tethering supervisor
//!
//! Owns the forwarding helper process and everything that has to be kept in
//! step with it: the IP forwarding gate, the tethered interface set and the
//! upstream DNS servers. All methods take `&mut self`; the daemon shares one
//! instance behind a [`SharedSupervisor`] lock so there is a single writer.

use std::io;
use std::net::{IpAddr, Ipv6Addr};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::channel::{ControlMessage, DaemonChannel};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::forwarding::ForwardingGate;
use crate::fwmark::Fwmark;
use crate::interface::{InterfaceConfigurator, InterfaceRegistry, ProcSysConfigurator};

pub type SharedSupervisor = Arc<Mutex<TetherSupervisor>>;

pub const DEFAULT_HELPER_PATH: &str = "/usr/sbin/dnsmasq";

pub const DEFAULT_HELPER_ARGS: [&str; 7] = [
    "--keep-in-foreground",
    "--no-resolv",
    "--no-poll",
    "--dhcp-authoritative",
    "--dhcp-option-force=43,ANDROID_METERED",
    "--pid-file",
    "",
];

/// One DHCP address pool handed to the helper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpRange {
    pub low: String,
    pub high: String,
}

impl DhcpRange {
    pub fn new(low: impl Into<String>, high: impl Into<String>) -> Self {
        Self {
            low: low.into(),
            high: high.into(),
        }
    }

    fn arg(&self) -> String {
        format!("--dhcp-range={},{},1h", self.low, self.high)
    }
}

/// Program and fixed options used to launch the helper
#[derive(Debug, Clone)]
pub struct HelperCommand {
    program: PathBuf,
    fixed_args: Vec<String>,
}

impl Default for HelperCommand {
    fn default() -> Self {
        Self::new(DEFAULT_HELPER_PATH, DEFAULT_HELPER_ARGS)
    }
}

impl HelperCommand {
    pub fn new<I, S>(program: impl Into<PathBuf>, fixed_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            fixed_args: fixed_args.into_iter().map(Into::into).collect(),
        }
    }

    /// Full argument vector, program first.
    pub fn argv(&self, ranges: &[DhcpRange]) -> Vec<String> {
        let mut argv = Vec::with_capacity(1 + self.fixed_args.len() + ranges.len());
        argv.push(self.program.display().to_string());
        argv.extend(self.fixed_args.iter().cloned());
        argv.extend(ranges.iter().map(DhcpRange::arg));
        argv
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsForwarderConfig {
    pub net_id: u32,
    pub mark: u32,
    pub servers: Vec<String>,
}

struct DaemonProcess {
    pid: Option<u32>,
    child: Child,
    channel: DaemonChannel,
}

/// Numeric IPv4/IPv6 address, optionally with an IPv6 `%scope` suffix
fn is_numeric_host(server: &str) -> bool {
    match server.split_once('%') {
        Some((addr, scope)) => !scope.is_empty() && addr.parse::<Ipv6Addr>().is_ok(),
        None => server.parse::<IpAddr>().is_ok(),
    }
}

fn terminate(pid: u32) {
    // SAFETY: kill(2) takes plain integers and touches no memory.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        warn!("Failed to signal helper {}: {}", pid, io::Error::last_os_error());
    }
}

pub struct TetherSupervisor {
    forwarding: ForwardingGate,
    interfaces: InterfaceRegistry,
    helper: HelperCommand,
    daemon: Option<DaemonProcess>,
    dns: DnsForwarderConfig,
}

impl TetherSupervisor {
    pub fn new(
        forwarding: ForwardingGate,
        configurator: Box<dyn InterfaceConfigurator>,
        helper: HelperCommand,
    ) -> Self {
        Self {
            forwarding,
            interfaces: InterfaceRegistry::new(configurator),
            helper,
            daemon: None,
            dns: DnsForwarderConfig::default(),
        }
    }

    /// Builds the supervisor from the daemon configuration and applies the
    /// startup forwarding policy.
    pub fn from_config(config: &Config) -> Self {
        let mut forwarding =
            ForwardingGate::new(&config.ipv4_forwarding_path, &config.ipv6_forwarding_path);
        if let Err(e) = forwarding.initialize(config.force_forwarding) {
            warn!("Initial IP forwarding state not applied: {}", e);
        }

        Self::new(
            forwarding,
            Box::new(ProcSysConfigurator::new(&config.ipv6_conf_root)),
            HelperCommand::new(&config.helper_path, DEFAULT_HELPER_ARGS),
        )
    }

    pub fn into_shared(self) -> SharedSupervisor {
        Arc::new(Mutex::new(self))
    }

    pub async fn start(&mut self, ranges: &[DhcpRange]) -> Result<()> {
        if self.daemon.is_some() {
            error!("Tethering already started");
            return Err(Error::Busy);
        }
        info!("Starting tethering services");

        let argv = self.helper.argv(ranges);
        debug!("Launching helper: {:?}", argv);
        let mut child = Command::new(&self.helper.program)
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| {
                error!("Failed to launch {} ({})", self.helper.program.display(), e);
                Error::Spawn(e)
            })?;

        let stdin = match child.stdin.take() {
            Some(stdin) => stdin,
            None => {
                let _ = child.start_kill();
                return Err(Error::Spawn(io::Error::new(
                    io::ErrorKind::Other,
                    "helper stdin was not captured",
                )));
            }
        };
        let pid = child.id();
        let mut daemon = DaemonProcess {
            pid,
            child,
            channel: DaemonChannel::new(stdin),
        };

        if let Err(e) = self.interfaces.push(Some(&mut daemon.channel)).await {
            warn!("Interface list not delivered to new helper: {}", e);
        }
        self.daemon = Some(daemon);
        info!("Tethering services running (pid {:?})", pid);
        Ok(())
    }

    /// Stops the helper and waits for it to exit. There is no timeout.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(mut daemon) = self.daemon.take() else {
            debug!("Tethering already stopped");
            return Ok(());
        };
        info!("Stopping tethering services");

        match daemon.pid {
            Some(pid) => terminate(pid),
            None => debug!("Helper has no pid, skipping SIGTERM"),
        }
        match daemon.child.wait().await {
            Ok(status) => debug!("Helper {:?} exited: {}", daemon.pid, status),
            Err(e) => warn!("Failed to wait for helper {:?}: {}", daemon.pid, e),
        }
        drop(daemon.channel);

        info!("Tethering services stopped");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.daemon.is_some()
    }

    pub fn daemon_pid(&self) -> Option<u32> {
        self.daemon.as_ref().and_then(|d| d.pid)
    }

    /// Replaces the upstream DNS servers. Either every server is a numeric
    /// address or nothing changes.
    pub async fn set_dns_forwarders(&mut self, net_id: u32, servers: &[String]) -> Result<()> {
        let mark = Fwmark::for_dns_forwarding(net_id).value();
        for (i, server) in servers.iter().enumerate() {
            debug!("setDnsForwarders({:#x} {} = '{}')", mark, i, server);
            if !is_numeric_host(server) {
                error!("Failed to parse DNS server '{}'", server);
                return Err(Error::InvalidAddress(server.clone()));
            }
        }

        self.dns = DnsForwarderConfig {
            net_id,
            mark,
            servers: servers.to_vec(),
        };

        if let Some(daemon) = self.daemon.as_mut() {
            let msg = ControlMessage::update_dns(mark, self.dns.servers.iter().map(String::as_str));
            if let Err(e) = daemon.channel.send(&msg).await {
                self.dns.servers.clear();
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn dns_net_id(&self) -> u32 {
        self.dns.net_id
    }

    pub fn dns_forwarders(&self) -> &[String] {
        &self.dns.servers
    }

    pub fn dns_config(&self) -> &DnsForwarderConfig {
        &self.dns
    }

    pub async fn tether_interface(&mut self, name: &str) -> Result<()> {
        let channel = self.daemon.as_mut().map(|d| &mut d.channel);
        self.interfaces.tether(name, channel).await
    }

    pub async fn untether_interface(&mut self, name: &str) -> Result<()> {
        let channel = self.daemon.as_mut().map(|d| &mut d.channel);
        self.interfaces.untether(name, channel).await
    }

    pub fn tethered_interfaces(&self) -> &[String] {
        self.interfaces.interfaces()
    }

    pub fn enable_forwarding(&mut self, requester: &str) -> Result<()> {
        self.forwarding.enable(requester)
    }

    pub fn disable_forwarding(&mut self, requester: &str) -> Result<()> {
        self.forwarding.disable(requester)
    }

    pub fn forwarding_request_count(&self) -> usize {
        self.forwarding.request_count()
    }
}
