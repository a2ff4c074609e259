//! Every frame is a 4-byte big-endian length followed by a JSON body.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::api::Snapshot;

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Messages exchanged over an agent connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Coordinator → agent: apply this snapshot.
    #[serde(rename = "push")]
    Push {
        /// Correlates the push with its result.
        call_id: String,
        /// Snapshot to apply.
        snapshot: Snapshot,
    },
    /// Agent → coordinator: outcome of a push.
    #[serde(rename = "push_result")]
    PushResult {
        /// Echo of the push call id.
        call_id: String,
        /// Whether the agent reloaded its worker.
        #[serde(default)]
        reloaded: bool,
        /// Failure description when the update failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Frame codec failures.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Underlying socket error.
    #[error("frame io: {0}")]
    Io(#[from] std::io::Error),
    /// Body was not a valid frame.
    #[error("parse frame: {0}")]
    Decode(#[source] serde_json::Error),
    /// Frame could not be serialized.
    #[error("serialize frame: {0}")]
    Encode(#[source] serde_json::Error),
    /// Declared or encoded length exceeds [`MAX_FRAME_LEN`].
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    /// Peer closed the stream in the middle of a frame.
    #[error("stream ended mid-frame")]
    Truncated,
}

/// Serializes `frame` into a length-prefixed buffer.
pub fn encode_frame(frame: &Frame) -> Result<BytesMut, WireError> {
    let payload = serde_json::to_vec(frame).map_err(WireError::Encode)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(payload.len()));
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Writes one frame and flushes the writer.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode_frame(frame)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the next frame, buffering partial data in `buffer`.
///
/// Returns `Ok(None)` when the peer closes the stream between frames.
pub async fn read_frame<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
) -> Result<Option<Frame>, WireError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = try_parse_frame(buffer)? {
            return Ok(Some(frame));
        }

        let read = reader.read_buf(buffer).await?;
        if read == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(WireError::Truncated);
        }
    }
}

/// Parses one frame from the front of `buffer` if it is complete.
pub fn try_parse_frame(buffer: &mut BytesMut) -> Result<Option<Frame>, WireError> {
    if buffer.len() < HEADER_LEN {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    if buffer.len() < HEADER_LEN + len {
        buffer.reserve(HEADER_LEN + len - buffer.len());
        return Ok(None);
    }

    buffer.advance(HEADER_LEN);
    let payload = buffer.split_to(len);
    let frame = serde_json::from_slice(&payload).map_err(WireError::Decode)?;
    Ok(Some(frame))
}
