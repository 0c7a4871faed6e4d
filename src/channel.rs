//! Control channel to the forwarding helper
//!
//! Messages are `|`-separated text commands terminated by a NUL byte and
//! written to the helper's standard input in a single write.

use std::fmt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

use crate::error::{Error, Result};

/// Largest message the helper accepts, terminator included.
pub const MAX_CMD_SIZE: usize = 1024;

pub const SEPARATOR: char = '|';

pub const UPDATE_DNS: &str = "update_dns";
pub const UPDATE_IFACES: &str = "update_ifaces";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    text: String,
    truncated: bool,
}

impl ControlMessage {
    pub fn new(command: &str) -> Self {
        Self {
            text: command.to_string(),
            truncated: false,
        }
    }

    /// `update_ifaces|if1|if2...`
    pub fn update_ifaces<'a, I>(ifaces: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut msg = Self::new(UPDATE_IFACES);
        for iface in ifaces {
            if !msg.push(iface) {
                debug!("Too many DNS ifaces listed");
                break;
            }
        }
        msg
    }

    /// `update_dns|0x<mark>|server1|server2...`
    pub fn update_dns<'a, I>(mark: u32, servers: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut msg = Self::new(UPDATE_DNS);
        msg.push(&format!("{:#x}", mark));
        for server in servers {
            if !msg.push(server) {
                debug!("Too many DNS servers listed");
                break;
            }
        }
        msg
    }

    /// Appends a field if the message stays within [`MAX_CMD_SIZE`]. Once a
    /// field has been refused every later field is refused as well.
    pub fn push(&mut self, field: &str) -> bool {
        if self.truncated || self.text.len() + 1 + field.len() + 1 >= MAX_CMD_SIZE {
            self.truncated = true;
            return false;
        }
        self.text.push(SEPARATOR);
        self.text.push_str(field);
        true
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Fields after the command name
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.text.split(SEPARATOR).skip(1)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.text.len() + 1);
        bytes.extend_from_slice(self.text.as_bytes());
        bytes.push(0);
        bytes
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Write end of the pipe bound to the helper's standard input
pub struct DaemonChannel {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl DaemonChannel {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Box::new(writer),
        }
    }

    /// Writes the whole message and its terminator at once. Anything short of
    /// a complete write is a failure; nothing is retried.
    pub async fn send(&mut self, msg: &ControlMessage) -> Result<()> {
        let bytes = msg.to_bytes();
        debug!("Sending update msg to forwarding helper [{}]", msg);

        let written = match self.writer.write(&bytes).await {
            Ok(n) => n,
            Err(e) => {
                error!("Failed to send update command to forwarding helper ({})", e);
                return Err(Error::Io(e));
            }
        };
        if written != bytes.len() {
            error!(
                "Failed to send update command to forwarding helper (wrote {} of {} bytes)",
                written,
                bytes.len()
            );
            return Err(Error::ShortWrite {
                written,
                expected: bytes.len(),
            });
        }
        Ok(())
    }
}
