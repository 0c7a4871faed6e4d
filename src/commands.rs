//! Handlers for the `tether` and `ipfwd` control commands.
//!
//! Each handler returns the complete list of response lines so the caller
//! can write them to the client in one go.

use std::net::Ipv4Addr;
use tracing::{debug, warn};

use crate::error::Error;
use crate::supervisor::{DhcpRange, SharedSupervisor};
use crate::wire::ResponseCode;

pub const TETHER: &str = "tether";
pub const IPFWD: &str = "ipfwd";

pub type Reply = Vec<(ResponseCode, String)>;

fn single(code: ResponseCode, msg: impl Into<String>) -> Reply {
    vec![(code, msg.into())]
}

fn missing_argument() -> Reply {
    single(ResponseCode::CommandSyntaxError, "Missing argument")
}

fn failure_reply(operation: &str, err: &Error) -> Reply {
    warn!("{} failed: {}", operation, err);
    match err {
        Error::InvalidAddress(_) => single(ResponseCode::CommandParameterError, "Invalid address"),
        e if e.is_validation() => single(
            ResponseCode::CommandParameterError,
            format!("{} operation failed: {}", operation, e),
        ),
        _ => single(
            ResponseCode::OperationFailed,
            format!("{} operation failed: {}", operation, err),
        ),
    }
}

fn ok_or_failure(operation: &str, result: crate::error::Result<()>) -> Reply {
    match result {
        Ok(()) => single(
            ResponseCode::CommandOkay,
            format!("{} operation succeeded", operation),
        ),
        Err(e) => failure_reply(operation, &e),
    }
}

/// Parses the `LOW HIGH ...` pairs given to `tether start`.
fn parse_ranges(args: &[String]) -> Result<Vec<DhcpRange>, Reply> {
    if args.len() % 2 != 0 {
        return Err(single(
            ResponseCode::CommandParameterError,
            "Bad number of arguments",
        ));
    }
    if let Some(bad) = args.iter().find(|a| a.parse::<Ipv4Addr>().is_err()) {
        debug!("Rejecting DHCP range address '{}'", bad);
        return Err(single(ResponseCode::CommandParameterError, "Invalid address"));
    }
    Ok(args
        .chunks(2)
        .map(|pair| DhcpRange::new(pair[0].clone(), pair[1].clone()))
        .collect())
}

pub async fn run_tether(supervisor: &SharedSupervisor, args: &[String]) -> Reply {
    let Some((sub, rest)) = args.split_first() else {
        return missing_argument();
    };

    match sub.as_str() {
        "start" => {
            let ranges = match parse_ranges(rest) {
                Ok(ranges) => ranges,
                Err(reply) => return reply,
            };
            ok_or_failure("Tether", supervisor.lock().await.start(&ranges).await)
        }
        "stop" => ok_or_failure("Tether", supervisor.lock().await.stop().await),
        "status" => {
            let state = if supervisor.lock().await.is_started() {
                "started"
            } else {
                "stopped"
            };
            single(
                ResponseCode::TetherStatusResult,
                format!("Tethering services {}", state),
            )
        }
        "interface" => run_tether_interface(supervisor, rest).await,
        "dns" => run_tether_dns(supervisor, rest).await,
        _ => single(ResponseCode::CommandSyntaxError, "Unknown tether cmd"),
    }
}

async fn run_tether_interface(supervisor: &SharedSupervisor, args: &[String]) -> Reply {
    match args {
        [op, name] if op == "add" => {
            ok_or_failure("Tether", supervisor.lock().await.tether_interface(name).await)
        }
        [op, name] if op == "remove" => {
            ok_or_failure("Tether", supervisor.lock().await.untether_interface(name).await)
        }
        [op] if op == "list" => {
            let guard = supervisor.lock().await;
            let mut reply: Reply = guard
                .tethered_interfaces()
                .iter()
                .map(|iface| (ResponseCode::TetherInterfaceListResult, iface.clone()))
                .collect();
            reply.push((
                ResponseCode::CommandOkay,
                "Tether interface list completed".to_string(),
            ));
            reply
        }
        [] | [_] => missing_argument(),
        _ => single(ResponseCode::CommandSyntaxError, "Unknown tether interface operation"),
    }
}

async fn run_tether_dns(supervisor: &SharedSupervisor, args: &[String]) -> Reply {
    let Some((op, rest)) = args.split_first() else {
        return missing_argument();
    };

    match op.as_str() {
        "set" => {
            let Some((net_id, servers)) = rest.split_first() else {
                return missing_argument();
            };
            let Ok(net_id) = net_id.parse::<u32>() else {
                return single(ResponseCode::CommandParameterError, "Invalid netId");
            };
            ok_or_failure(
                "Tether",
                supervisor.lock().await.set_dns_forwarders(net_id, servers).await,
            )
        }
        "list" => {
            let guard = supervisor.lock().await;
            let mut reply: Reply = guard
                .dns_forwarders()
                .iter()
                .map(|server| (ResponseCode::TetherDnsFwdTgtListResult, server.clone()))
                .collect();
            reply.push((
                ResponseCode::CommandOkay,
                "Tether dns fwd list completed".to_string(),
            ));
            reply
        }
        _ => single(ResponseCode::CommandSyntaxError, "Unknown tether dns operation"),
    }
}

pub async fn run_ipfwd(supervisor: &SharedSupervisor, args: &[String]) -> Reply {
    match args {
        [op] if op == "status" => {
            let count = supervisor.lock().await.forwarding_request_count();
            let state = if count > 0 { "enabled" } else { "disabled" };
            single(
                ResponseCode::IpFwdStatusResult,
                format!("Forwarding {}", state),
            )
        }
        [op, requester] if op == "enable" => ok_or_failure(
            "ipfwd",
            supervisor.lock().await.enable_forwarding(requester),
        ),
        [op, requester] if op == "disable" => ok_or_failure(
            "ipfwd",
            supervisor.lock().await.disable_forwarding(requester),
        ),
        [] => missing_argument(),
        _ => single(ResponseCode::CommandSyntaxError, "Unknown ipfwd cmd"),
    }
}
