//! Frame format for local channels: a big-endian `u32` length followed by the JSON envelope.

use crate::errors::{IpcError, IpcResult};
use crate::message::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Writes one message as a frame and flushes.
pub async fn write_frame<W>(writer: &mut W, message: &Message) -> IpcResult<()>
where
    W: AsyncWrite + Unpin,
{
    let serialized = serde_json::to_vec(message)?;
    let len = u32::try_from(serialized.len()).map_err(|_| IpcError::FrameTooLarge {
        size: serialized.len(),
        limit: u32::MAX as usize,
    })?;
    writer.write_u32(len).await?;
    writer.write_all(&serialized).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one raw frame. Returns `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> IpcResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(IpcError::Io(e)),
    };
    if len > max_len {
        return Err(IpcError::FrameTooLarge {
            size: len,
            limit: max_len,
        });
    }

    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer).await?;
    debug!(len, "Read frame");
    Ok(Some(buffer))
}

/// Decodes a frame body. Kept separate so a malformed body does not end the connection.
pub fn decode(frame: &[u8]) -> IpcResult<Message> {
    let message: Message = serde_json::from_slice(frame)?;
    Ok(message.normalized())
}
