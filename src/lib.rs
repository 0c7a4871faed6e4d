// Library module for the NetD service
// This allows the code to be used as both a library and binary

pub mod channel;
pub mod client;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod forwarding;
pub mod fwmark;
pub mod interface;
pub mod resolver;
pub mod server;
pub mod service;
pub mod supervisor;
pub mod wire;

// Re-export main types for external use
pub use channel::{ControlMessage, DaemonChannel};
pub use client::{ClientHandle, SocketClient};
pub use config::Config;
pub use dispatcher::{QueryDispatcher, QueryRequest};
pub use error::{Error, Result};
pub use forwarding::ForwardingGate;
pub use fwmark::Fwmark;
pub use interface::{InterfaceConfigurator, InterfaceRegistry, ProcSysConfigurator};
pub use resolver::{InterfaceLookup, LookupError, PidInterfaceMap, Resolver, SystemResolver};
pub use server::{CommandCodec, CommandServer};
pub use service::run_daemon;
pub use supervisor::{DhcpRange, HelperCommand, SharedSupervisor, TetherSupervisor};
pub use wire::{AddrInfo, AddrInfoHints, HostEntry, ResponseCode, ResponseWriter};
