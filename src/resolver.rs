//! Resolver backends for the query proxy
//!
//! The dispatcher only sees the [`Resolver`] and [`InterfaceLookup`] traits.
//! [`SystemResolver`] is the production backend, built on the system DNS
//! configuration.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::TokioAsyncResolver;

use crate::wire::{AddrInfo, AddrInfoHints, HostEntry};

// getaddrinfo error codes
pub const EAI_AGAIN: u32 = 2;
pub const EAI_FAIL: u32 = 4;
pub const EAI_FAMILY: u32 = 5;
pub const EAI_NONAME: u32 = 8;
pub const EAI_SERVICE: u32 = 9;

// host lookup error codes
pub const HOST_NOT_FOUND: u32 = 1;
pub const TRY_AGAIN: u32 = 2;
pub const NO_RECOVERY: u32 = 3;
pub const NO_DATA: u32 = 4;

/// Numeric failure code reported by a resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("resolver error code {0}")]
pub struct LookupError(pub u32);

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn get_addr_info(
        &self,
        host: Option<&str>,
        service: Option<&str>,
        hints: Option<AddrInfoHints>,
        iface: Option<&str>,
    ) -> Result<Vec<AddrInfo>, LookupError>;

    async fn get_host_by_name(
        &self,
        name: Option<&str>,
        family: i32,
        iface: Option<&str>,
    ) -> Result<HostEntry, LookupError>;

    async fn get_host_by_addr(
        &self,
        addr: IpAddr,
        addr_len: u32,
        family: i32,
        iface: Option<&str>,
    ) -> Result<HostEntry, LookupError>;
}

/// Maps a requesting process to the interface its traffic is bound to.
pub trait InterfaceLookup: Send + Sync {
    fn interface_for_pid(&self, pid: i32) -> Option<String>;
}

/// In-memory pid to interface table
#[derive(Debug, Default)]
pub struct PidInterfaceMap {
    map: RwLock<HashMap<i32, String>>,
}

impl PidInterfaceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, pid: i32, iface: impl Into<String>) {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        map.insert(pid, iface.into());
    }

    pub fn clear(&self, pid: i32) {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        map.remove(&pid);
    }
}

impl InterfaceLookup for PidInterfaceMap {
    fn interface_for_pid(&self, pid: i32) -> Option<String> {
        let map = self.map.read().unwrap_or_else(|e| e.into_inner());
        map.get(&pid).cloned()
    }
}

pub struct SystemResolver {
    resolver: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn new() -> anyhow::Result<Self> {
        // Fall back to the built-in upstreams when the host has no usable
        // resolver configuration.
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(e) => {
                warn!("System resolver configuration unavailable ({}), using defaults", e);
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            }
        };

        Ok(Self { resolver })
    }

    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let lookup = self.resolver.lookup_ip(host).await?;
        Ok(lookup.iter().collect())
    }
}

/// Well-known entries from `/etc/services`; the port is the same for TCP
/// and UDP for all of them.
const WELL_KNOWN_SERVICES: &[(&str, u16)] = &[
    ("ftp", 21),
    ("ssh", 22),
    ("telnet", 23),
    ("smtp", 25),
    ("domain", 53),
    ("http", 80),
    ("pop3", 110),
    ("ntp", 123),
    ("imap", 143),
    ("snmp", 161),
    ("ldap", 389),
    ("https", 443),
    ("submission", 587),
    ("ldaps", 636),
    ("domain-s", 853),
    ("imaps", 993),
    ("pop3s", 995),
    ("xmpp-client", 5222),
    ("http-alt", 8080),
];

/// Numeric port or a well-known service name.
fn service_port(service: &str) -> Option<u16> {
    if let Ok(port) = service.parse::<u16>() {
        return Some(port);
    }
    WELL_KNOWN_SERVICES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(service))
        .map(|&(_, port)| port)
}

fn family_matches(family: i32, ip: &IpAddr) -> bool {
    match family {
        libc::AF_INET => ip.is_ipv4(),
        libc::AF_INET6 => ip.is_ipv6(),
        _ => true,
    }
}

fn gai_code(e: &ResolveError) -> u32 {
    match e.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => EAI_NONAME,
        ResolveErrorKind::Timeout => EAI_AGAIN,
        _ => EAI_FAIL,
    }
}

fn host_code(e: &ResolveError) -> u32 {
    match e.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => HOST_NOT_FOUND,
        ResolveErrorKind::Timeout => TRY_AGAIN,
        _ => NO_RECOVERY,
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn get_addr_info(
        &self,
        host: Option<&str>,
        service: Option<&str>,
        hints: Option<AddrInfoHints>,
        iface: Option<&str>,
    ) -> Result<Vec<AddrInfo>, LookupError> {
        let hints = hints.unwrap_or(AddrInfoHints {
            flags: 0,
            family: libc::AF_UNSPEC,
            socktype: 0,
            protocol: 0,
        });
        if ![libc::AF_UNSPEC, libc::AF_INET, libc::AF_INET6].contains(&hints.family) {
            return Err(LookupError(EAI_FAMILY));
        }
        let port = match service {
            Some(service) => service_port(service).ok_or(LookupError(EAI_SERVICE))?,
            None => 0,
        };
        if let Some(iface) = iface {
            debug!("getaddrinfo via {} (interface binding not supported)", iface);
        }

        let ips = match host {
            Some(host) => self.lookup(host).await.map_err(|e| {
                debug!("getaddrinfo({}) failed: {}", host, e);
                LookupError(gai_code(&e))
            })?,
            None if hints.flags & libc::AI_PASSIVE != 0 => vec![
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            ],
            None => vec![
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            ],
        };

        let socktypes = if hints.socktype != 0 {
            vec![(hints.socktype, hints.protocol)]
        } else {
            vec![
                (libc::SOCK_STREAM, libc::IPPROTO_TCP),
                (libc::SOCK_DGRAM, libc::IPPROTO_UDP),
            ]
        };

        let mut list = Vec::new();
        for ip in ips.into_iter().filter(|ip| family_matches(hints.family, ip)) {
            for &(socktype, protocol) in &socktypes {
                list.push(AddrInfo {
                    flags: hints.flags,
                    family: if ip.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 },
                    socktype,
                    protocol,
                    addr: SocketAddr::new(ip, port),
                    canonname: None,
                });
            }
        }
        if list.is_empty() {
            return Err(LookupError(EAI_NONAME));
        }
        if hints.flags & libc::AI_CANONNAME != 0 {
            list[0].canonname = host.map(str::to_string);
        }
        Ok(list)
    }

    async fn get_host_by_name(
        &self,
        name: Option<&str>,
        family: i32,
        iface: Option<&str>,
    ) -> Result<HostEntry, LookupError> {
        let name = name.ok_or(LookupError(HOST_NOT_FOUND))?;
        if family != libc::AF_INET && family != libc::AF_INET6 {
            return Err(LookupError(NO_RECOVERY));
        }
        if let Some(iface) = iface {
            debug!("gethostbyname via {} (interface binding not supported)", iface);
        }

        let ips = self.lookup(name).await.map_err(|e| {
            debug!("gethostbyname({}) failed: {}", name, e);
            LookupError(host_code(&e))
        })?;
        let entry = HostEntry::with_addresses(Some(name.to_string()), family, ips);
        if entry.addresses.is_empty() {
            return Err(LookupError(NO_DATA));
        }
        Ok(entry)
    }

    async fn get_host_by_addr(
        &self,
        addr: IpAddr,
        _addr_len: u32,
        family: i32,
        iface: Option<&str>,
    ) -> Result<HostEntry, LookupError> {
        if let Some(iface) = iface {
            debug!("gethostbyaddr via {} (interface binding not supported)", iface);
        }

        let lookup = self.resolver.reverse_lookup(addr).await.map_err(|e| {
            debug!("gethostbyaddr({}) failed: {}", addr, e);
            LookupError(host_code(&e))
        })?;
        let name = lookup
            .iter()
            .next()
            .map(|ptr| ptr.to_string().trim_end_matches('.').to_string())
            .ok_or(LookupError(HOST_NOT_FOUND))?;

        Ok(HostEntry::with_addresses(Some(name), family, [addr]))
    }
}
