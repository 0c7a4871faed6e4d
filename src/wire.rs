//! Binary response protocol for the query proxy
//!
//! Every variable-length item is sent as a 4-byte big-endian length followed
//! by the raw bytes. Status lines are the three-digit response code followed
//! by a NUL byte.

use bytes::{Buf, Bytes};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Terminates alias lists and address lists in a host entry.
const NUL_CHUNK: &[u8] = &[0];

/// flags, family, socktype, protocol, addrlen
pub const ADDRINFO_HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    TetherInterfaceListResult = 111,
    TetherDnsFwdTgtListResult = 112,
    CommandOkay = 200,
    TetherStatusResult = 210,
    IpFwdStatusResult = 211,
    DnsProxyQueryResult = 222,
    OperationFailed = 400,
    DnsProxyOperationFailed = 401,
    CommandSyntaxError = 500,
    CommandParameterError = 501,
}

impl ResponseCode {
    pub fn code(self) -> u16 {
        self as u16
    }

    fn status_line(self) -> [u8; 4] {
        let digits = format!("{:03}", self.code());
        let d = digits.as_bytes();
        [d[0], d[1], d[2], 0]
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated payload")]
    Truncated,

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Host record as returned by name and address lookups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub name: Option<String>,
    pub aliases: Vec<String>,
    pub family: i32,
    pub addr_len: u32,
    pub addresses: Vec<Vec<u8>>,
}

impl HostEntry {
    /// Builds an entry for `family`, keeping only addresses of that family.
    pub fn with_addresses<I>(name: Option<String>, family: i32, addrs: I) -> Self
    where
        I: IntoIterator<Item = IpAddr>,
    {
        let addr_len = if family == libc::AF_INET6 { 16 } else { 4 };
        let addresses = addrs
            .into_iter()
            .filter_map(|ip| match ip {
                IpAddr::V4(v4) if family == libc::AF_INET => Some(v4.octets().to_vec()),
                IpAddr::V6(v6) if family == libc::AF_INET6 => Some(v6.octets().to_vec()),
                _ => None,
            })
            .collect();

        Self {
            name,
            aliases: Vec::new(),
            family,
            addr_len,
            addresses,
        }
    }
}

/// Hints accompanying a forward lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrInfoHints {
    pub flags: i32,
    pub family: i32,
    pub socktype: i32,
    pub protocol: i32,
}

/// One node of a forward-lookup result list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    pub flags: i32,
    pub family: i32,
    pub socktype: i32,
    pub protocol: i32,
    pub addr: SocketAddr,
    pub canonname: Option<String>,
}

impl AddrInfo {
    fn header_image(&self) -> [u8; ADDRINFO_HEADER_LEN] {
        let addr_len = sockaddr_image(&self.addr).len() as i32;
        let mut image = [0u8; ADDRINFO_HEADER_LEN];
        for (i, field) in [self.flags, self.family, self.socktype, self.protocol, addr_len]
            .iter()
            .enumerate()
        {
            image[i * 4..i * 4 + 4].copy_from_slice(&field.to_be_bytes());
        }
        image
    }
}

/// sockaddr_in / sockaddr_in6 layout with all fields big-endian
fn sockaddr_image(addr: &SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut out = Vec::with_capacity(16);
            out.extend_from_slice(&(libc::AF_INET as u16).to_be_bytes());
            out.extend_from_slice(&v4.port().to_be_bytes());
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&[0u8; 8]);
            out
        }
        SocketAddr::V6(v6) => {
            let mut out = Vec::with_capacity(28);
            out.extend_from_slice(&(libc::AF_INET6 as u16).to_be_bytes());
            out.extend_from_slice(&v6.port().to_be_bytes());
            out.extend_from_slice(&v6.flowinfo().to_be_bytes());
            out.extend_from_slice(&v6.ip().octets());
            out.extend_from_slice(&v6.scope_id().to_be_bytes());
            out
        }
    }
}

pub(crate) fn nul_terminated(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 1);
    out.extend_from_slice(text.as_bytes());
    out.push(0);
    out
}

/// Writes responses to a client, remembering whether every write succeeded.
///
/// After the first failure all further writes are skipped.
pub struct ResponseWriter<'a, W> {
    out: &'a mut W,
    ok: bool,
}

impl<'a, W: AsyncWrite + Unpin> ResponseWriter<'a, W> {
    pub fn new(out: &'a mut W) -> Self {
        Self { out, ok: true }
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }

    async fn write_raw(&mut self, data: &[u8]) {
        if !self.ok {
            return;
        }
        if let Err(e) = self.out.write_all(data).await {
            debug!("Client write failed: {}", e);
            self.ok = false;
        }
    }

    pub async fn send_chunk(&mut self, data: &[u8]) {
        self.write_raw(&(data.len() as u32).to_be_bytes()).await;
        if !data.is_empty() {
            self.write_raw(data).await;
        }
    }

    pub async fn send_code(&mut self, code: ResponseCode) {
        self.write_raw(&code.status_line()).await;
    }

    /// Status line followed by a single length-prefixed chunk
    pub async fn send_binary_msg(&mut self, code: ResponseCode, data: &[u8]) {
        self.send_code(code).await;
        self.send_chunk(data).await;
    }

    /// `"<code> <text>\0"`
    pub async fn send_msg(&mut self, code: ResponseCode, msg: &str) {
        let line = nul_terminated(&format!("{} {}", code.code(), msg));
        self.write_raw(&line).await;
    }

    pub async fn send_host_entry(&mut self, entry: &HostEntry) {
        match &entry.name {
            Some(name) => self.send_chunk(&nul_terminated(name)).await,
            None => self.send_chunk(&[]).await,
        }
        for alias in entry.aliases.iter().filter(|a| !a.is_empty()) {
            self.send_chunk(&nul_terminated(alias)).await;
        }
        self.send_chunk(NUL_CHUNK).await;

        self.write_raw(&(entry.family as u32).to_be_bytes()).await;
        self.write_raw(&entry.addr_len.to_be_bytes()).await;
        for addr in &entry.addresses {
            self.write_raw(addr).await;
        }
        self.send_chunk(NUL_CHUNK).await;
    }

    pub async fn send_addr_info_list(&mut self, list: &[AddrInfo]) {
        for ai in list {
            if !self.ok {
                break;
            }
            self.send_chunk(&ai.header_image()).await;
            self.send_chunk(&sockaddr_image(&ai.addr)).await;
            match &ai.canonname {
                Some(name) => self.send_chunk(&nul_terminated(name)).await,
                None => self.send_chunk(&[]).await,
            }
        }
        self.send_chunk(&[]).await;
    }

    /// Flushes and logs a failure, if any, once. Returns whether every write
    /// succeeded.
    pub async fn finish(mut self, context: &str) -> bool {
        if self.ok {
            if let Err(e) = self.out.flush().await {
                debug!("Client flush failed: {}", e);
                self.ok = false;
            }
        }
        if !self.ok {
            warn!("{}: error writing DNS result to client", context);
        }
        self.ok
    }
}

fn take_u32(buf: &mut impl Buf) -> Result<u32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u32())
}

fn take_chunk(buf: &mut impl Buf) -> Result<Bytes, WireError> {
    let len = take_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    Ok(buf.copy_to_bytes(len))
}

fn chunk_text(chunk: &[u8]) -> Result<String, WireError> {
    let text = chunk.strip_suffix(&[0]).unwrap_or(chunk);
    String::from_utf8(text.to_vec()).map_err(|e| WireError::Malformed(e.to_string()))
}

/// Reads a status line and returns its numeric code.
pub fn decode_status(buf: &mut impl Buf) -> Result<u16, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    let mut line = [0u8; 4];
    buf.copy_to_slice(&mut line);
    if line[3] != 0 {
        return Err(WireError::Malformed("status line not terminated".into()));
    }
    std::str::from_utf8(&line[..3])
        .ok()
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| WireError::Malformed("status code is not numeric".into()))
}

/// Decodes one complete host entry; `buf` must hold exactly that payload.
pub fn decode_host_entry(buf: &mut impl Buf) -> Result<HostEntry, WireError> {
    let name = take_chunk(buf)?;
    let name = if name.is_empty() {
        None
    } else {
        Some(chunk_text(&name)?)
    };

    let mut aliases = Vec::new();
    loop {
        let chunk = take_chunk(buf)?;
        if chunk.as_ref() == NUL_CHUNK {
            break;
        }
        aliases.push(chunk_text(&chunk)?);
    }

    let family = take_u32(buf)? as i32;
    let addr_len = take_u32(buf)?;
    if addr_len == 0 {
        return Err(WireError::Malformed("zero address length".into()));
    }

    // Addresses are unframed; whatever precedes the 5-byte terminator is
    // address data.
    let terminator_len = 4 + NUL_CHUNK.len();
    let mut addresses = Vec::new();
    while buf.remaining() > terminator_len {
        if buf.remaining() < addr_len as usize + terminator_len {
            return Err(WireError::Truncated);
        }
        addresses.push(buf.copy_to_bytes(addr_len as usize).to_vec());
    }
    if take_chunk(buf)?.as_ref() != NUL_CHUNK {
        return Err(WireError::Malformed("missing address list terminator".into()));
    }

    Ok(HostEntry {
        name,
        aliases,
        family,
        addr_len,
        addresses,
    })
}

fn decode_sockaddr(mut image: Bytes) -> Result<SocketAddr, WireError> {
    if image.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    let family = image.get_u16() as i32;
    let port = image.get_u16();
    match family {
        libc::AF_INET if image.remaining() >= 4 => {
            let mut octets = [0u8; 4];
            image.copy_to_slice(&mut octets);
            Ok(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port)))
        }
        libc::AF_INET6 if image.remaining() >= 24 => {
            let flowinfo = image.get_u32();
            let mut octets = [0u8; 16];
            image.copy_to_slice(&mut octets);
            let scope_id = image.get_u32();
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                flowinfo,
                scope_id,
            )))
        }
        libc::AF_INET | libc::AF_INET6 => Err(WireError::Truncated),
        other => Err(WireError::Malformed(format!("unknown address family {}", other))),
    }
}

/// Decodes a zero-length-terminated address-info list.
pub fn decode_addr_info_list(buf: &mut impl Buf) -> Result<Vec<AddrInfo>, WireError> {
    let mut list = Vec::new();
    loop {
        let mut header = take_chunk(buf)?;
        if header.is_empty() {
            return Ok(list);
        }
        if header.len() != ADDRINFO_HEADER_LEN {
            return Err(WireError::Malformed(format!(
                "address info header of {} bytes",
                header.len()
            )));
        }
        let flags = header.get_i32();
        let family = header.get_i32();
        let socktype = header.get_i32();
        let protocol = header.get_i32();

        let addr = decode_sockaddr(take_chunk(buf)?)?;
        let canon = take_chunk(buf)?;
        let canonname = if canon.is_empty() {
            None
        } else {
            Some(chunk_text(&canon)?)
        };

        list.push(AddrInfo {
            flags,
            family,
            socktype,
            protocol,
            addr,
            canonname,
        });
    }
}
