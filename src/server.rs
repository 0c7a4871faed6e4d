use anyhow::Result;
use bytes::BytesMut;
use futures::StreamExt;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, error, info};

use crate::client::SocketClient;
use crate::commands::{self, IPFWD, TETHER};
use crate::dispatcher::QueryDispatcher;
use crate::supervisor::SharedSupervisor;
use crate::wire::ResponseCode;

/// Longest command accepted before the connection is dropped
pub const MAX_COMMAND_LEN: usize = 4096;

/// Splits the byte stream into NUL-terminated commands and tokenizes each
/// one into words. Double quotes group words and `\` escapes the next byte
/// inside quotes. An unterminated quote runs to the end of the command.
#[derive(Debug, Default)]
pub struct CommandCodec;

impl Decoder for CommandCodec {
    type Item = Vec<String>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Vec<String>>> {
        match src.iter().position(|&b| b == 0) {
            Some(pos) => {
                let line = src.split_to(pos + 1);
                let text = String::from_utf8_lossy(&line[..pos]);
                Ok(Some(tokenize(&text)))
            }
            None if src.len() > MAX_COMMAND_LEN => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "command exceeds maximum length",
            )),
            None => Ok(None),
        }
    }
}

pub fn tokenize(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' if quoted => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                quoted = !quoted;
                in_word = true;
            }
            ' ' if !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            _ => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// Command socket of the daemon
pub struct CommandServer {
    socket_path: PathBuf,
    dispatcher: Arc<QueryDispatcher>,
    supervisor: SharedSupervisor,
}

impl CommandServer {
    pub fn new(
        socket_path: PathBuf,
        dispatcher: Arc<QueryDispatcher>,
        supervisor: SharedSupervisor,
    ) -> Self {
        Self {
            socket_path,
            dispatcher,
            supervisor,
        }
    }

    pub async fn run(self) -> Result<()> {
        info!("Starting command server on {}", self.socket_path.display());

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        info!("Command server listening on {}", self.socket_path.display());

        self.serve(listener).await
    }

    /// Accepts connections on an already bound listener until it fails.
    pub async fn serve(self, listener: UnixListener) -> Result<()> {
        let next_id = AtomicU64::new(1);
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let id = next_id.fetch_add(1, Ordering::Relaxed);
                    debug!("New client connection {}", id);
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let supervisor = Arc::clone(&self.supervisor);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, id, dispatcher, supervisor).await {
                            error!("Client {} connection error: {}", id, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept client connection: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    id: u64,
    dispatcher: Arc<QueryDispatcher>,
    supervisor: SharedSupervisor,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let client = SocketClient::new(id, write_half);
    let mut commands = FramedRead::new(read_half, CommandCodec);

    while let Some(words) = commands.next().await {
        let words = words?;
        let Some((command, args)) = words.split_first() else {
            continue;
        };
        debug!("Client {} command '{}' ({} args)", id, command, args.len());

        if QueryDispatcher::handles(command) {
            dispatcher.run_command(&client, command, args).await;
            continue;
        }

        let reply = match command.as_str() {
            TETHER => commands::run_tether(&supervisor, args).await,
            IPFWD => commands::run_ipfwd(&supervisor, args).await,
            _ => vec![(
                ResponseCode::CommandSyntaxError,
                "Command not recognized".to_string(),
            )],
        };
        if !client.send_msgs(&reply).await {
            break;
        }
    }

    debug!("Client {} stopped sending commands", id);
    Ok(())
}
