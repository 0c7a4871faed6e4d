use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::Notify;

use netd_service::resolver::HOST_NOT_FOUND;
use netd_service::{
    AddrInfo, AddrInfoHints, HostEntry, InterfaceLookup, LookupError, PidInterfaceMap,
    QueryDispatcher, ResponseCode, ResponseWriter, Resolver, SocketClient,
};

const SLOW_HOST: &str = "slow.example";
const MISSING_HOST: &str = "missing.example";

// Answers every name with 10.0.0.1; SLOW_HOST waits until released.
struct FakeResolver {
    release: Notify,
    seen_ifaces: Mutex<Vec<Option<String>>>,
}

impl FakeResolver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            release: Notify::new(),
            seen_ifaces: Mutex::new(Vec::new()),
        })
    }

    fn record(&self, iface: Option<&str>) {
        self.seen_ifaces
            .lock()
            .unwrap()
            .push(iface.map(str::to_string));
    }
}

fn entry_for(name: &str) -> HostEntry {
    HostEntry::with_addresses(
        Some(name.to_string()),
        libc::AF_INET,
        [IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))],
    )
}

#[async_trait]
impl Resolver for FakeResolver {
    async fn get_addr_info(
        &self,
        host: Option<&str>,
        service: Option<&str>,
        _hints: Option<AddrInfoHints>,
        iface: Option<&str>,
    ) -> Result<Vec<AddrInfo>, LookupError> {
        self.record(iface);
        if host == Some(MISSING_HOST) {
            return Err(LookupError(8));
        }
        let port = service.and_then(|s| s.parse().ok()).unwrap_or(0);
        Ok(vec![AddrInfo {
            flags: 0,
            family: libc::AF_INET,
            socktype: libc::SOCK_STREAM,
            protocol: libc::IPPROTO_TCP,
            addr: (Ipv4Addr::new(10, 0, 0, 1), port).into(),
            canonname: host.map(str::to_string),
        }])
    }

    async fn get_host_by_name(
        &self,
        name: Option<&str>,
        _family: i32,
        iface: Option<&str>,
    ) -> Result<HostEntry, LookupError> {
        self.record(iface);
        let name = name.ok_or(LookupError(HOST_NOT_FOUND))?;
        match name {
            SLOW_HOST => {
                self.release.notified().await;
                Ok(entry_for(name))
            }
            MISSING_HOST => Err(LookupError(HOST_NOT_FOUND)),
            _ => Ok(entry_for(name)),
        }
    }

    async fn get_host_by_addr(
        &self,
        addr: IpAddr,
        _addr_len: u32,
        family: i32,
        iface: Option<&str>,
    ) -> Result<HostEntry, LookupError> {
        self.record(iface);
        Ok(HostEntry::with_addresses(
            Some("host.example".to_string()),
            family,
            [addr],
        ))
    }
}

fn args(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn dispatcher(resolver: Arc<FakeResolver>, lookup: Arc<dyn InterfaceLookup>) -> QueryDispatcher {
    QueryDispatcher::new(resolver, lookup)
}

async fn encoded_host_entry(entry: &HostEntry) -> Vec<u8> {
    let mut out = Vec::new();
    let mut writer = ResponseWriter::new(&mut out);
    writer.send_code(ResponseCode::DnsProxyQueryResult).await;
    writer.send_host_entry(entry).await;
    assert!(writer.finish("expected").await);
    out
}

async fn read_n(remote: &mut DuplexStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(Duration::from_secs(5), remote.read_exact(&mut buf))
        .await
        .expect("Timed out waiting for response")
        .expect("Failed to read response");
    buf
}

#[tokio::test]
async fn test_concurrent_lookups_complete_out_of_order() {
    let resolver = FakeResolver::new();
    let dispatcher = dispatcher(Arc::clone(&resolver), Arc::new(PidInterfaceMap::new()));
    let (local, mut remote) = tokio::io::duplex(4096);
    let client = SocketClient::new(1, local);

    let slow = args(&["1", "^", SLOW_HOST, "2"]);
    let fast = args(&["1", "^", "fast.example", "2"]);
    assert!(dispatcher.run_command(&client, "gethostbyname", &slow).await);
    assert!(dispatcher.run_command(&client, "gethostbyname", &fast).await);

    let fast_bytes = encoded_host_entry(&entry_for("fast.example")).await;
    assert_eq!(read_n(&mut remote, fast_bytes.len()).await, fast_bytes);

    resolver.release.notify_one();
    let slow_bytes = encoded_host_entry(&entry_for(SLOW_HOST)).await;
    assert_eq!(read_n(&mut remote, slow_bytes.len()).await, slow_bytes);

    // Once the reader and every worker let go, the peer sees EOF.
    drop(client);
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), remote.read_to_end(&mut rest))
        .await
        .expect("Connection was not released")
        .expect("Failed to read to end");
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_connection_held_while_worker_runs() {
    let resolver = FakeResolver::new();
    let dispatcher = dispatcher(Arc::clone(&resolver), Arc::new(PidInterfaceMap::new()));
    let (local, mut remote) = tokio::io::duplex(4096);
    let client = SocketClient::new(7, local);

    assert!(
        dispatcher
            .run_command(&client, "gethostbyname", &args(&["1", "^", SLOW_HOST, "2"]))
            .await
    );
    drop(client);

    // The worker still owns a handle, so the response can be delivered.
    resolver.release.notify_one();
    let expected = encoded_host_entry(&entry_for(SLOW_HOST)).await;
    assert_eq!(read_n(&mut remote, expected.len()).await, expected);

    let mut rest = Vec::new();
    remote.read_to_end(&mut rest).await.expect("Failed to read to end");
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_lookup_failure_sends_error_code() {
    let resolver = FakeResolver::new();
    let dispatcher = dispatcher(resolver, Arc::new(PidInterfaceMap::new()));
    let (local, mut remote) = tokio::io::duplex(4096);
    let client = SocketClient::new(2, local);

    assert!(
        dispatcher
            .run_command(&client, "gethostbyname", &args(&["1", "^", MISSING_HOST, "2"]))
            .await
    );

    let bytes = read_n(&mut remote, 12).await;
    assert_eq!(&bytes[..4], b"401\0");
    assert_eq!(&bytes[4..8], &4u32.to_be_bytes());
    assert_eq!(&bytes[8..], &HOST_NOT_FOUND.to_be_bytes());
}

#[tokio::test]
async fn test_interface_taken_from_pid_map() {
    let resolver = FakeResolver::new();
    let pids = Arc::new(PidInterfaceMap::new());
    pids.set(42, "wlan0");
    let dispatcher = dispatcher(Arc::clone(&resolver), pids);
    let (local, mut remote) = tokio::io::duplex(4096);
    let client = SocketClient::new(3, local);

    dispatcher
        .run_command(&client, "gethostbyname", &args(&["42", "^", "a.example", "2"]))
        .await;
    let expected = encoded_host_entry(&entry_for("a.example")).await;
    read_n(&mut remote, expected.len()).await;

    dispatcher
        .run_command(&client, "gethostbyname", &args(&["42", "rmnet0", "b.example", "2"]))
        .await;
    let expected = encoded_host_entry(&entry_for("b.example")).await;
    read_n(&mut remote, expected.len()).await;

    let seen = resolver.seen_ifaces.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![Some("wlan0".to_string()), Some("rmnet0".to_string())]
    );
}

#[tokio::test]
async fn test_getaddrinfo_response() {
    let resolver = FakeResolver::new();
    let dispatcher = dispatcher(resolver, Arc::new(PidInterfaceMap::new()));
    let (local, mut remote) = tokio::io::duplex(4096);
    let client = SocketClient::new(4, local);

    let request = args(&["www.example", "443", "-1", "-1", "-1", "-1", "^", "100"]);
    assert!(dispatcher.run_command(&client, "getaddrinfo", &request).await);

    let list = vec![AddrInfo {
        flags: 0,
        family: libc::AF_INET,
        socktype: libc::SOCK_STREAM,
        protocol: libc::IPPROTO_TCP,
        addr: (Ipv4Addr::new(10, 0, 0, 1), 443).into(),
        canonname: Some("www.example".to_string()),
    }];
    let mut expected = Vec::new();
    let mut writer = ResponseWriter::new(&mut expected);
    writer.send_code(ResponseCode::DnsProxyQueryResult).await;
    writer.send_addr_info_list(&list).await;
    assert!(writer.finish("expected").await);

    assert_eq!(read_n(&mut remote, expected.len()).await, expected);
}

#[tokio::test]
async fn test_gethostbyaddr_sends_name_only() {
    let resolver = FakeResolver::new();
    let dispatcher = dispatcher(resolver, Arc::new(PidInterfaceMap::new()));
    let (local, mut remote) = tokio::io::duplex(4096);
    let client = SocketClient::new(5, local);

    let inet = libc::AF_INET.to_string();
    let request = args(&["10.0.0.1", "4", inet.as_str(), "1", "^"]);
    assert!(dispatcher.run_command(&client, "gethostbyaddr", &request).await);

    let bytes = read_n(&mut remote, 21).await;
    assert_eq!(&bytes[..4], b"222\0");
    assert_eq!(&bytes[4..8], &13u32.to_be_bytes());
    assert_eq!(&bytes[8..], b"host.example\0");
}

#[tokio::test]
async fn test_malformed_request_answered_synchronously() {
    let resolver = FakeResolver::new();
    let dispatcher = dispatcher(resolver, Arc::new(PidInterfaceMap::new()));
    let (local, mut remote) = tokio::io::duplex(4096);
    let client = SocketClient::new(6, local);

    assert!(
        !dispatcher
            .run_command(&client, "gethostbyname", &args(&["1", "^"]))
            .await
    );
    let head = read_n(&mut remote, 4).await;
    assert_eq!(&head, b"501 ");

    drop(client);
    let mut rest = Vec::new();
    remote.read_to_end(&mut rest).await.expect("Failed to read to end");
    assert_eq!(rest.last(), Some(&0u8));
}
