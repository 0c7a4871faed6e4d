use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::wire::{ResponseCode, ResponseWriter};

pub type ClientWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared handle to a connected client. Every in-flight request holds one
/// clone; the connection is closed when the last clone is dropped.
pub type ClientHandle = Arc<SocketClient>;

/// Write side of a command-socket connection
pub struct SocketClient {
    id: u64,
    writer: Mutex<ClientWriter>,
}

impl SocketClient {
    pub fn new<W>(id: u64, writer: W) -> ClientHandle
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Arc::new(Self {
            id,
            writer: Mutex::new(Box::new(writer)),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Exclusive access to the connection for one complete response.
    pub async fn lock(&self) -> MutexGuard<'_, ClientWriter> {
        self.writer.lock().await
    }

    /// Sends a single text response line.
    pub async fn send_msg(&self, code: ResponseCode, msg: &str) -> bool {
        self.send_msgs(&[(code, msg.to_string())]).await
    }

    /// Sends several response lines without letting other responses on this
    /// connection interleave.
    pub async fn send_msgs(&self, lines: &[(ResponseCode, String)]) -> bool {
        let mut out = self.lock().await;
        let mut writer = ResponseWriter::new(&mut *out);
        for (code, msg) in lines {
            writer.send_msg(*code, msg).await;
        }
        writer.finish("send_msg").await
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        debug!("Client {} released", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_connection_closes_with_last_handle() {
        let (local, mut remote) = tokio::io::duplex(256);
        let client = SocketClient::new(1, local);
        let worker_ref = Arc::clone(&client);
        assert_eq!(Arc::strong_count(&client), 2);

        assert!(client.send_msg(ResponseCode::CommandOkay, "ok").await);
        drop(client);

        let mut first = [0u8; 7];
        remote.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"200 ok\0");

        drop(worker_ref);
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
