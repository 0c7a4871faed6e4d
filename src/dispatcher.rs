//! Query proxy command handling
//!
//! Each lookup command is validated on the calling task and then served by
//! its own detached task, so a slow resolution never holds up the connection
//! that submitted it.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::client::ClientHandle;
use crate::resolver::{InterfaceLookup, Resolver};
use crate::wire::{nul_terminated, AddrInfoHints, ResponseCode, ResponseWriter};

/// Marks an intentionally absent optional argument.
pub const ABSENT: &str = "^";

pub const GETADDRINFO: &str = "getaddrinfo";
pub const GETHOSTBYNAME: &str = "gethostbyname";
pub const GETHOSTBYADDR: &str = "gethostbyaddr";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryRequest {
    ForwardLookup {
        host: Option<String>,
        service: Option<String>,
        hints: Option<AddrInfoHints>,
        iface: Option<String>,
        pid: i32,
    },
    ReverseLookup {
        address: IpAddr,
        length: u32,
        family: i32,
        iface: Option<String>,
        pid: i32,
    },
    NameLookup {
        name: Option<String>,
        iface: Option<String>,
        family: i32,
        pid: i32,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid number of arguments to {command}: {count}")]
    ArgCount { command: &'static str, count: usize },

    #[error("Invalid numeric argument to {command}: {value}")]
    NotNumeric { command: &'static str, value: String },

    #[error("inet_pton(\"{0}\") failed")]
    BadAddress(String),

    #[error("Unknown query command: {0}")]
    UnknownCommand(String),
}

impl ParseError {
    fn response_code(&self) -> ResponseCode {
        match self {
            ParseError::BadAddress(_) => ResponseCode::OperationFailed,
            _ => ResponseCode::CommandParameterError,
        }
    }
}

fn optional(arg: &str) -> Option<String> {
    if arg == ABSENT {
        None
    } else {
        Some(arg.to_string())
    }
}

fn numeric<T: std::str::FromStr>(command: &'static str, arg: &str) -> Result<T, ParseError> {
    arg.parse().map_err(|_| ParseError::NotNumeric {
        command,
        value: arg.to_string(),
    })
}

fn expect_args(command: &'static str, args: &[String], count: usize) -> Result<(), ParseError> {
    if args.len() != count {
        return Err(ParseError::ArgCount {
            command,
            count: args.len(),
        });
    }
    Ok(())
}

impl QueryRequest {
    /// Validates the positional arguments of a lookup command.
    pub fn parse(command: &str, args: &[String]) -> Result<Self, ParseError> {
        match command {
            GETADDRINFO => {
                expect_args(GETADDRINFO, args, 8)?;
                let flags = numeric(GETADDRINFO, &args[2])?;
                let family = numeric(GETADDRINFO, &args[3])?;
                let socktype = numeric(GETADDRINFO, &args[4])?;
                let protocol = numeric(GETADDRINFO, &args[5])?;
                let hints = if [flags, family, socktype, protocol].iter().all(|&v| v == -1) {
                    None
                } else {
                    Some(AddrInfoHints {
                        flags,
                        family,
                        socktype,
                        protocol,
                    })
                };

                Ok(QueryRequest::ForwardLookup {
                    host: optional(&args[0]),
                    service: optional(&args[1]),
                    hints,
                    iface: optional(&args[6]),
                    pid: numeric(GETADDRINFO, &args[7])?,
                })
            }
            GETHOSTBYNAME => {
                expect_args(GETHOSTBYNAME, args, 4)?;
                Ok(QueryRequest::NameLookup {
                    pid: numeric(GETHOSTBYNAME, &args[0])?,
                    iface: optional(&args[1]),
                    name: optional(&args[2]),
                    family: numeric(GETHOSTBYNAME, &args[3])?,
                })
            }
            GETHOSTBYADDR => {
                expect_args(GETHOSTBYADDR, args, 5)?;
                let length = numeric(GETHOSTBYADDR, &args[1])?;
                let family = numeric(GETHOSTBYADDR, &args[2])?;
                let pid = numeric(GETHOSTBYADDR, &args[3])?;
                let address = parse_address(&args[0], family)?;

                Ok(QueryRequest::ReverseLookup {
                    address,
                    length,
                    family,
                    iface: optional(&args[4]),
                    pid,
                })
            }
            other => Err(ParseError::UnknownCommand(other.to_string())),
        }
    }

    pub fn pid(&self) -> i32 {
        match self {
            QueryRequest::ForwardLookup { pid, .. }
            | QueryRequest::ReverseLookup { pid, .. }
            | QueryRequest::NameLookup { pid, .. } => *pid,
        }
    }

    pub fn iface(&self) -> Option<&str> {
        match self {
            QueryRequest::ForwardLookup { iface, .. }
            | QueryRequest::ReverseLookup { iface, .. }
            | QueryRequest::NameLookup { iface, .. } => iface.as_deref(),
        }
    }
}

fn parse_address(text: &str, family: i32) -> Result<IpAddr, ParseError> {
    let parsed = match family {
        libc::AF_INET => text.parse::<Ipv4Addr>().ok().map(IpAddr::V4),
        libc::AF_INET6 => text.parse::<Ipv6Addr>().ok().map(IpAddr::V6),
        _ => None,
    };
    parsed.ok_or_else(|| ParseError::BadAddress(text.to_string()))
}

pub struct QueryDispatcher {
    resolver: Arc<dyn Resolver>,
    iface_lookup: Arc<dyn InterfaceLookup>,
}

impl QueryDispatcher {
    pub fn new(resolver: Arc<dyn Resolver>, iface_lookup: Arc<dyn InterfaceLookup>) -> Self {
        Self {
            resolver,
            iface_lookup,
        }
    }

    pub fn handles(command: &str) -> bool {
        matches!(command, GETADDRINFO | GETHOSTBYNAME | GETHOSTBYADDR)
    }

    /// Validates the command and hands it to a detached worker. Returns
    /// whether a worker was started; validation failures are answered here.
    pub async fn run_command(&self, client: &ClientHandle, command: &str, args: &[String]) -> bool {
        match QueryRequest::parse(command, args) {
            Ok(request) => {
                debug!("Dispatching {:?} for client {}", request, client.id());
                let resolver = Arc::clone(&self.resolver);
                let iface_lookup = Arc::clone(&self.iface_lookup);
                let client = Arc::clone(client);
                tokio::spawn(serve(resolver, iface_lookup, client, request));
                true
            }
            Err(e) => {
                warn!("{}", e);
                client.send_msg(e.response_code(), &e.to_string()).await;
                false
            }
        }
    }
}

/// Resolves one request and writes the response. The client handle is
/// released when this returns, whatever the outcome.
async fn serve(
    resolver: Arc<dyn Resolver>,
    iface_lookup: Arc<dyn InterfaceLookup>,
    client: ClientHandle,
    request: QueryRequest,
) {
    let iface = match request.iface() {
        Some(iface) => Some(iface.to_string()),
        None => iface_lookup.interface_for_pid(request.pid()),
    };
    let iface = iface.as_deref();

    match request {
        QueryRequest::ForwardLookup {
            host,
            service,
            hints,
            ..
        } => {
            let result = resolver
                .get_addr_info(host.as_deref(), service.as_deref(), hints, iface)
                .await;

            let mut out = client.lock().await;
            let mut writer = ResponseWriter::new(&mut *out);
            match result {
                Ok(list) => {
                    writer.send_code(ResponseCode::DnsProxyQueryResult).await;
                    writer.send_addr_info_list(&list).await;
                }
                Err(e) => {
                    writer
                        .send_binary_msg(ResponseCode::DnsProxyOperationFailed, &e.0.to_be_bytes())
                        .await;
                }
            }
            writer.finish(GETADDRINFO).await;
        }
        QueryRequest::NameLookup { name, family, .. } => {
            let result = resolver.get_host_by_name(name.as_deref(), family, iface).await;

            let mut out = client.lock().await;
            let mut writer = ResponseWriter::new(&mut *out);
            match result {
                Ok(entry) => {
                    writer.send_code(ResponseCode::DnsProxyQueryResult).await;
                    writer.send_host_entry(&entry).await;
                }
                Err(e) => {
                    writer
                        .send_binary_msg(ResponseCode::DnsProxyOperationFailed, &e.0.to_be_bytes())
                        .await;
                }
            }
            writer.finish(GETHOSTBYNAME).await;
        }
        QueryRequest::ReverseLookup {
            address,
            length,
            family,
            ..
        } => {
            let result = resolver.get_host_by_addr(address, length, family, iface).await;

            let mut out = client.lock().await;
            let mut writer = ResponseWriter::new(&mut *out);
            match result {
                Ok(entry) => {
                    let name = entry.name.as_deref().map(nul_terminated).unwrap_or_default();
                    writer
                        .send_binary_msg(ResponseCode::DnsProxyQueryResult, &name)
                        .await;
                }
                Err(e) => {
                    writer
                        .send_binary_msg(ResponseCode::DnsProxyOperationFailed, &e.0.to_be_bytes())
                        .await;
                }
            }
            writer.finish(GETHOSTBYADDR).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_forward_lookup_with_placeholders() {
        let request = QueryRequest::parse(
            GETADDRINFO,
            &args(&["example.com", "^", "-1", "-1", "-1", "-1", "^", "1234"]),
        )
        .unwrap();

        assert_eq!(
            request,
            QueryRequest::ForwardLookup {
                host: Some("example.com".to_string()),
                service: None,
                hints: None,
                iface: None,
                pid: 1234,
            }
        );
    }

    #[test]
    fn test_parse_forward_lookup_hints() {
        let request = QueryRequest::parse(
            GETADDRINFO,
            &args(&["^", "53", "0", "2", "-1", "-1", "wlan0", "7"]),
        )
        .unwrap();

        match request {
            QueryRequest::ForwardLookup {
                host, hints, iface, ..
            } => {
                assert_eq!(host, None);
                assert_eq!(
                    hints,
                    Some(AddrInfoHints {
                        flags: 0,
                        family: 2,
                        socktype: -1,
                        protocol: -1,
                    })
                );
                assert_eq!(iface.as_deref(), Some("wlan0"));
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_parse_name_lookup() {
        let request = QueryRequest::parse(GETHOSTBYNAME, &args(&["99", "^", "host.lan", "10"]))
            .unwrap();
        assert_eq!(request.pid(), 99);
        assert_eq!(request.iface(), None);
        assert_eq!(
            request,
            QueryRequest::NameLookup {
                name: Some("host.lan".to_string()),
                iface: None,
                family: 10,
                pid: 99,
            }
        );
    }

    #[test]
    fn test_parse_reverse_lookup() {
        let request = QueryRequest::parse(
            GETHOSTBYADDR,
            &args(&["192.0.2.5", "4", "2", "17", "eth0"]),
        )
        .unwrap();
        assert_eq!(
            request,
            QueryRequest::ReverseLookup {
                address: "192.0.2.5".parse().unwrap(),
                length: 4,
                family: 2,
                iface: Some("eth0".to_string()),
                pid: 17,
            }
        );
    }

    #[test]
    fn test_reverse_lookup_family_mismatch() {
        let inet6 = libc::AF_INET6.to_string();
        let err = QueryRequest::parse(
            GETHOSTBYADDR,
            &args(&["192.0.2.5", "16", inet6.as_str(), "17", "^"]),
        )
        .unwrap_err();
        assert_eq!(err, ParseError::BadAddress("192.0.2.5".to_string()));
        assert_eq!(err.response_code(), ResponseCode::OperationFailed);
    }

    #[test]
    fn test_wrong_argument_counts() {
        let err = QueryRequest::parse(GETADDRINFO, &args(&["a", "b"])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid number of arguments to getaddrinfo: 2"
        );
        assert_eq!(err.response_code(), ResponseCode::CommandParameterError);

        assert!(QueryRequest::parse(GETHOSTBYNAME, &args(&["1", "^", "x"])).is_err());
        assert!(QueryRequest::parse(GETHOSTBYADDR, &args(&["::1"])).is_err());
    }

    #[test]
    fn test_non_numeric_field() {
        let err = QueryRequest::parse(GETHOSTBYNAME, &args(&["pid", "^", "x", "2"])).unwrap_err();
        assert_eq!(
            err,
            ParseError::NotNumeric {
                command: GETHOSTBYNAME,
                value: "pid".to_string(),
            }
        );
    }

    #[test]
    fn test_handles() {
        assert!(QueryDispatcher::handles("getaddrinfo"));
        assert!(QueryDispatcher::handles("gethostbyaddr"));
        assert!(!QueryDispatcher::handles("tether"));
    }
}
