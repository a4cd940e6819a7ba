// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Length-prefixed JSON framing.
//!
//! Wire format in both directions between the supervisor and the agent:
//! a 4-byte big-endian unsigned length, then that many bytes of UTF-8
//! JSON. A frame larger than the configured cap poisons the stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix.
pub const PREFIX_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame length {len} exceeds cap {max}")]
    TooLarge { len: usize, max: usize },

    #[error("truncated frame: expected {expected} body bytes")]
    Truncated { expected: usize },

    #[error("frame body is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("frame body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read one frame body. Returns `Ok(None)` on clean EOF at a frame
/// boundary; EOF inside a frame is a [`FrameError::Truncated`].
pub async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; PREFIX_LEN];
    let mut filled = 0;
    while filled < PREFIX_LEN {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated { expected: PREFIX_LEN - filled });
        }
        filled += n;
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max {
        return Err(FrameError::TooLarge { len, max });
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => FrameError::Truncated { expected: len },
            _ => FrameError::Io(e),
        })?;
    Ok(Some(body))
}

/// Write one raw frame body with its length prefix.
pub async fn write_frame<W>(writer: &mut W, body: &[u8], max: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > max {
        return Err(FrameError::TooLarge { len: body.len(), max });
    }
    let prefix = (body.len() as u32).to_be_bytes();
    writer.write_all(&prefix).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize a record and write it as one frame.
pub async fn write_record<W, T>(writer: &mut W, record: &T, max: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let body = serde_json::to_vec(record)?;
    write_frame(writer, &body, max).await
}

/// Encode a frame into a buffer. Used by test fixtures and the fake
/// agent the spec suite drives.
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PREFIX_LEN + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
