//! Zabbix sender protocol client.
//!
//! Request frame: `ZBXD\x01`, payload length as u32 LE, four zero bytes, JSON
//! `{"request":"sender data","data":[..]}`. Response frame: `ZBXD\x01`, payload
//! length as u64 LE (at most 65535), JSON `{"response":..,"info":..}`.

use crate::utils::errors::{BackupError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Decoder, FramedRead};

pub const ZABBIX_HEADER: &[u8; 5] = b"ZBXD\x01";
pub const DEFAULT_PORT: u16 = 10051;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_RESPONSE_LEN: u64 = 65535;
const RESPONSE_PREFIX_LEN: usize = ZABBIX_HEADER.len() + 8;

/// One value reported for a host item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderItem {
    pub host: String,
    pub key: String,
    pub value: String,
}

impl SenderItem {
    pub fn new(host: &str, key: &str, value: impl Into<String>) -> Self {
        Self {
            host: host.to_string(),
            key: key.to_string(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SenderRequest {
    pub request: String,
    pub data: Vec<SenderItem>,
}

/// Server answer, e.g. `success: processed: 5; failed: 0; total: 5`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SenderResponse {
    pub response: String,
    pub info: String,
}

impl fmt::Display for SenderResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.response, self.info)
    }
}

/// Frame a batch of items as a sender request
pub fn encode_request(items: &[SenderItem]) -> Result<Bytes> {
    let payload = serde_json::to_vec(&SenderRequest {
        request: "sender data".to_string(),
        data: items.to_vec(),
    })?;
    let length = u32::try_from(payload.len()).map_err(|_| {
        BackupError::Transport(format!("Request too large: {} bytes", payload.len()))
    })?;

    let mut buf = BytesMut::with_capacity(ZABBIX_HEADER.len() + 8 + payload.len());
    buf.put_slice(ZABBIX_HEADER);
    buf.put_u32_le(length);
    buf.put_u32_le(0);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Decodes one sender response frame
#[derive(Debug, Default)]
pub struct ResponseCodec;

impl Decoder for ResponseCodec {
    type Item = SenderResponse;
    type Error = BackupError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<SenderResponse>> {
        let magic = src.len().min(ZABBIX_HEADER.len());
        if src[..magic] != ZABBIX_HEADER[..magic] {
            return Err(BackupError::Transport("Received invalid zabbix header".to_string()));
        }
        if src.len() < RESPONSE_PREFIX_LEN {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 8];
        length_bytes.copy_from_slice(&src[ZABBIX_HEADER.len()..RESPONSE_PREFIX_LEN]);
        let length = u64::from_le_bytes(length_bytes);
        if length > MAX_RESPONSE_LEN {
            return Err(BackupError::Transport(format!(
                "Received invalid zabbix header (message length: {})",
                length
            )));
        }

        let length = length as usize;
        if src.len() < RESPONSE_PREFIX_LEN + length {
            src.reserve(RESPONSE_PREFIX_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(RESPONSE_PREFIX_LEN);
        let payload = src.split_to(length);
        Ok(Some(serde_json::from_slice(&payload)?))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<SenderResponse>> {
        match self.decode(src)? {
            Some(response) => Ok(Some(response)),
            None => Err(BackupError::Transport(
                "Received invalid zabbix message (message too short)".to_string(),
            )),
        }
    }
}

/// One-shot client: a fresh connection per batch
#[derive(Debug, Clone)]
pub struct ZabbixSender {
    server: String,
    port: u16,
    timeout: Duration,
}

impl ZabbixSender {
    /// Target `server`, `server:port`, a bare IPv6 address or `[v6]:port`
    pub fn new(address: &str) -> Result<Self> {
        let invalid = || BackupError::Config(format!("Invalid zabbix server address: {}", address));

        let (server, port) = if let Some(bracketed) = address.strip_prefix('[') {
            let (server, rest) = bracketed.split_once(']').ok_or_else(invalid)?;
            match rest {
                "" => (server, DEFAULT_PORT),
                _ => {
                    let port = rest.strip_prefix(':').ok_or_else(invalid)?;
                    (server, port.parse().map_err(|_| invalid())?)
                }
            }
        } else if address.matches(':').count() > 1 {
            (address, DEFAULT_PORT)
        } else {
            match address.rsplit_once(':') {
                Some((server, port)) => (server, port.parse().map_err(|_| invalid())?),
                None => (address, DEFAULT_PORT),
            }
        };

        if server.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            server: server.to_string(),
            port,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address(&self) -> String {
        if self.server.contains(':') {
            format!("[{}]:{}", self.server, self.port)
        } else {
            format!("{}:{}", self.server, self.port)
        }
    }

    /// Send items and wait for the server's answer
    pub async fn send(&self, items: &[SenderItem]) -> Result<SenderResponse> {
        let request = encode_request(items)?;

        let connect = TcpStream::connect((self.server.as_str(), self.port));
        let mut stream = timeout(self.timeout, connect)
            .await
            .map_err(|_| {
                BackupError::Transport(format!("Timeout connecting to {}", self.address()))
            })?
            .map_err(|e| {
                BackupError::Transport(format!("Cannot connect to {}: {}", self.address(), e))
            })?;

        timeout(self.timeout, stream.write_all(&request))
            .await
            .map_err(|_| BackupError::Transport("Timeout sending zabbix request".to_string()))?
            .map_err(|e| BackupError::Transport(format!("Failed to send zabbix request: {}", e)))?;

        let mut frames = FramedRead::new(stream, ResponseCodec);
        match timeout(self.timeout, frames.next()).await {
            Err(_) => Err(BackupError::Transport(
                "Timeout waiting for zabbix response".to_string(),
            )),
            Ok(None) => Err(BackupError::Transport(
                "Connection closed without response".to_string(),
            )),
            Ok(Some(response)) => response.map_err(|e| match e {
                BackupError::Io(e) => {
                    BackupError::Transport(format!("Failed to read zabbix response: {}", e))
                }
                other => other,
            }),
        }
    }
}
