//! Log-stream channel: WebSocket framing and session handling
//!
//! A client upgraded on `GET /servers/{id}/logs` receives demultiplexed
//! container log lines as `{type:"log"}` messages and may send
//! `{type:"command"}` messages that are executed in the server's container,
//! answered with `{type:"command_result"}` or `{type:"error"}`.

use crate::runtime::{LogChunk, LogStream};
use crate::server::ServerManager;
use base64::Engine;
use futures::StreamExt;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// WebSocket magic GUID for the handshake (RFC 6455)
const WS_MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute the Sec-WebSocket-Accept header value for a client key
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_MAGIC_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Message sent by the client over the channel
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub command: String,
}

/// Message emitted by the server over the channel
#[derive(Debug, Serialize)]
pub struct Event<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub content: String,
}

/// A single decoded WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close,
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

/// Encode a server-to-client text frame (FIN set, unmasked)
pub fn encode_text(payload: &str) -> Vec<u8> {
    encode_frame(0x1, payload.as_bytes())
}

/// Encode a close frame
pub fn encode_close() -> Vec<u8> {
    vec![0x88, 0x00]
}

/// Encode a pong frame echoing a ping payload
pub fn encode_pong(payload: &[u8]) -> Vec<u8> {
    encode_frame(0xA, payload)
}

fn encode_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 10);
    frame.push(0x80 | opcode);

    if payload.len() < 126 {
        frame.push(payload.len() as u8);
    } else if payload.len() < 65536 {
        frame.push(126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }

    frame.extend_from_slice(payload);
    frame
}

/// Read one frame from the wire. Returns `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let opcode = header[0] & 0x0F;
    let masked = (header[1] & 0x80) != 0;
    let mut payload_len = (header[1] & 0x7F) as u64;

    if payload_len == 126 {
        let mut ext = [0u8; 2];
        reader.read_exact(&mut ext).await?;
        payload_len = u16::from_be_bytes(ext) as u64;
    } else if payload_len == 127 {
        let mut ext = [0u8; 8];
        reader.read_exact(&mut ext).await?;
        payload_len = u64::from_be_bytes(ext);
    }

    let mask = if masked {
        let mut m = [0u8; 4];
        reader.read_exact(&mut m).await?;
        Some(m)
    } else {
        None
    };

    let mut payload = vec![0u8; payload_len as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await?;
    }

    if let Some(mask) = mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }

    let frame = match opcode {
        0x1 => Frame::Text(String::from_utf8_lossy(&payload).into_owned()),
        0x8 => Frame::Close,
        0x9 => Frame::Ping(payload),
        0xA => Frame::Pong(payload),
        _ => Frame::Binary(payload),
    };

    Ok(Some(frame))
}

/// Accumulates log chunks and yields complete lines
#[derive(Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }
}

/// Drive one upgraded log-stream session until the log stream ends, the
/// client disconnects, or shutdown is signalled
pub async fn run_session(
    upgraded: Upgraded,
    manager: Arc<ServerManager>,
    server_id: String,
    mut logs: LogStream,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let io = TokioIo::new(upgraded);
    let (mut reader, mut writer) = tokio::io::split(io);
    let mut lines = LineBuffer::default();

    info!(server_id = %server_id, "Log-stream session established");

    loop {
        tokio::select! {
            frame = read_frame(&mut reader) => {
                match frame {
                    Ok(Some(Frame::Text(text))) => {
                        handle_client_message(&manager, &server_id, &text, &mut writer).await;
                    }
                    Ok(Some(Frame::Ping(payload))) => {
                        if writer.write_all(&encode_pong(&payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(Frame::Close)) | Ok(None) => {
                        let _ = writer.write_all(&encode_close()).await;
                        break;
                    }
                    Ok(Some(_)) => {}
                    Err(e) => {
                        debug!(server_id = %server_id, error = %e, "Client read error");
                        break;
                    }
                }
            }
            chunk = logs.next() => {
                match chunk {
                    Some(Ok(chunk)) => {
                        let bytes = match &chunk {
                            LogChunk::Stdout(b) | LogChunk::Stderr(b) => b.as_slice(),
                        };
                        let mut closed = false;
                        for line in lines.push(bytes) {
                            if send_event(&mut writer, "log", line).await.is_err() {
                                closed = true;
                                break;
                            }
                        }
                        if closed {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(server_id = %server_id, error = %e, "Error reading container logs");
                        let _ = send_event(&mut writer, "error", e.to_string()).await;
                        break;
                    }
                    None => {
                        debug!(server_id = %server_id, "Container log stream ended");
                        let _ = writer.write_all(&encode_close()).await;
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                let _ = writer.write_all(&encode_close()).await;
                break;
            }
        }
    }

    info!(server_id = %server_id, "Log-stream session closed");
}

async fn handle_client_message<W>(
    manager: &Arc<ServerManager>,
    server_id: &str,
    text: &str,
    writer: &mut W,
) where
    W: AsyncWrite + Unpin,
{
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(_) => {
            let _ = send_event(writer, "error", "invalid message format".to_string()).await;
            return;
        }
    };

    if message.kind != "command" {
        return;
    }

    info!(server_id, command = %message.command, "Executing command");
    match manager.execute_command(server_id, &message.command).await {
        Ok(output) => {
            let _ = send_event(writer, "command_result", output).await;
        }
        Err(e) => {
            let _ = send_event(
                writer,
                "error",
                format!("failed to execute command: {}", e),
            )
            .await;
        }
    }
}

async fn send_event<W>(writer: &mut W, kind: &str, content: String) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let event = Event { kind, content };
    let payload = serde_json::to_string(&event).unwrap_or_default();
    writer.write_all(&encode_text(&payload)).await
}
