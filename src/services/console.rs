//! Remote console (RCON) client.
//!
//! Packets are `length | id | type | body | \0\0`, all integers little-endian i32.
//! A connection lives for exactly one command: connect, authenticate, send, read one
//! reply, disconnect.

use crate::error::{ManagerError, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const PACKET_AUTH: i32 = 3;
const PACKET_AUTH_RESPONSE: i32 = 2;
const PACKET_EXEC_COMMAND: i32 = 2;
const PACKET_RESPONSE_VALUE: i32 = 0;

/// Upper bound on an incoming packet; servers fragment at 4096 bytes.
const MAX_PACKET_LEN: i32 = 64 * 1024;

const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// One decoded RCON packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub kind: i32,
    pub body: String,
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        let body = self.body.as_bytes();
        let length = (body.len() + 10) as i32;
        let mut buf = Vec::with_capacity(body.len() + 14);
        buf.extend_from_slice(&length.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.kind.to_le_bytes());
        buf.extend_from_slice(body);
        buf.extend_from_slice(&[0, 0]);
        buf
    }
}

/// Read a single packet from `stream`.
pub async fn read_packet<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Packet> {
    let length = stream.read_i32_le().await.map_err(console_io)?;
    if !(10..=MAX_PACKET_LEN).contains(&length) {
        return Err(ManagerError::Console(format!("invalid packet length {length}")));
    }
    let id = stream.read_i32_le().await.map_err(console_io)?;
    let kind = stream.read_i32_le().await.map_err(console_io)?;

    let mut rest = vec![0u8; (length - 8) as usize];
    stream.read_exact(&mut rest).await.map_err(console_io)?;
    // Drop the body terminator and the empty-string pad
    let body_end = rest.len().saturating_sub(2);
    let body = String::from_utf8_lossy(&rest[..body_end]).into_owned();

    Ok(Packet { id, kind, body })
}

/// Authenticated console connection.
pub struct RconClient {
    stream: TcpStream,
    next_id: i32,
}

impl RconClient {
    /// Connect to `host:port` and authenticate with `password`.
    pub async fn connect(host: &str, port: u16, password: &str) -> Result<Self> {
        let stream = timeout(IO_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ManagerError::Console(format!("connection to {host}:{port} timed out")))?
            .map_err(|e| ManagerError::Console(format!("cannot connect to {host}:{port}: {e}")))?;

        let mut client = Self { stream, next_id: 1 };
        client.authenticate(password).await?;
        tracing::debug!("Authenticated to remote console {}:{}", host, port);
        Ok(client)
    }

    async fn authenticate(&mut self, password: &str) -> Result<()> {
        let id = self.send(PACKET_AUTH, password).await?;
        loop {
            let reply = self.receive().await?;
            if reply.kind != PACKET_AUTH_RESPONSE {
                // Some servers send an empty response value ahead of the auth result
                continue;
            }
            if reply.id == -1 || reply.id != id {
                return Err(ManagerError::Console("authentication failed".into()));
            }
            return Ok(());
        }
    }

    /// Run one console command and return the server's reply.
    pub async fn command(&mut self, command: &str) -> Result<String> {
        let id = self.send(PACKET_EXEC_COMMAND, command).await?;
        loop {
            let reply = self.receive().await?;
            if reply.kind == PACKET_RESPONSE_VALUE && reply.id == id {
                return Ok(reply.body);
            }
            tracing::debug!("Skipping unrelated console packet {:?}", reply);
        }
    }

    async fn send(&mut self, kind: i32, body: &str) -> Result<i32> {
        let id = self.next_id;
        self.next_id += 1;
        let packet = Packet {
            id,
            kind,
            body: body.to_string(),
        };
        self.stream
            .write_all(&packet.encode())
            .await
            .map_err(console_io)?;
        Ok(id)
    }

    async fn receive(&mut self) -> Result<Packet> {
        timeout(IO_TIMEOUT, read_packet(&mut self.stream))
            .await
            .map_err(|_| ManagerError::Console("timed out waiting for a reply".into()))?
    }

    /// Close the connection.
    pub async fn close(mut self) -> Result<()> {
        self.stream.shutdown().await.map_err(console_io)
    }
}

/// Connect, send one command, return the reply and disconnect.
pub async fn send_command(host: &str, port: u16, password: &str, command: &str) -> Result<String> {
    let mut client = RconClient::connect(host, port, password).await?;
    let reply = client.command(command).await;
    if let Err(e) = client.close().await {
        tracing::debug!("Console disconnect failed: {}", e);
    }
    reply
}

/// Console commands always start with `/`.
pub fn normalize_command(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn console_io(e: std::io::Error) -> ManagerError {
    ManagerError::Console(e.to_string())
}
