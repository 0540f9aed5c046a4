//! Length-prefixed JSON framing
//!
//! Wire format:  [4-byte big-endian length][JSON payload]

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::dmq::OutboundRequest;
use crate::error::{Error, Result};

/// Default frame size limit
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024;

/// Everything that travels between two DMQ nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireMessage {
    /// A DMQ request for a peer on the receiving node
    Request(OutboundRequest),

    /// Final status for a request
    Response {
        call_id: String,
        code: u16,
        reason: String,
    },
}

/// Read one frame. Fails with `FrameTooLarge` before allocating when the
/// length prefix exceeds `max`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max: usize) -> Result<WireMessage> {
    let len = reader.read_u32().await? as usize;
    if len > max {
        return Err(Error::FrameTooLarge { size: len, max });
    }

    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| Error::allocation(format!("{} byte frame", len)))?;
    buf.resize(len, 0);
    reader.read_exact(&mut buf).await?;

    Ok(serde_json::from_slice(&buf)?)
}

/// Write one frame and flush
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, message: &WireMessage, max: usize) -> Result<()> {
    let json = serde_json::to_vec(message)?;
    if json.len() > max {
        return Err(Error::FrameTooLarge { size: json.len(), max });
    }

    writer.write_u32(json.len() as u32).await?;
    writer.write_all(&json).await?;
    writer.flush().await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
