//! Stream framing for the TCP transport.
//!
//! Each frame is a 4-byte big-endian length prefix followed by a UTF-8 JSON
//! event envelope.
//!
//! ```text
//! [u32 BE: len][{"event": "...", "payload": ...}]
//! ```

use crate::config::TransportConfig;
use crate::{Result, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// One named event on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl EventEnvelope {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| RpcError::MalformedPacket {
            reason: format!("invalid event envelope: {}", e),
        })
    }
}

/// Read one frame. A stream that ends before the next length prefix yields
/// `None`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    check_frame_len(len)?;

    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    check_frame_len(frame.len())?;
    // Bounded by MAX_FRAME_SIZE, so the prefix cannot truncate.
    writer.write_u32(frame.len() as u32).await?;
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

fn check_frame_len(len: usize) -> Result<()> {
    if len <= TransportConfig::MAX_FRAME_SIZE {
        return Ok(());
    }
    Err(RpcError::Validation {
        field: "frame".to_string(),
        message: format!(
            "{} bytes exceeds the {} byte frame limit",
            len,
            TransportConfig::MAX_FRAME_SIZE
        ),
    })
}
