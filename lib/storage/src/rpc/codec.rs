//! Length-prefixed msgpack framing over an arbitrary duplex byte stream.
//!
//! Mirrors the classic Go `net/rpc` wire shape -- one `(header, body)` pair per call -- but with
//! msgpack payloads instead of gob, per §6's "bidirectional msgpack-encoded `(header, body)`
//! pairs." Each frame on the wire is `u32` big-endian length followed by that many bytes of
//! msgpack-encoded `Frame`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::envelope::Frame;
use crate::error::{StorageError, StorageResult};

const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> StorageResult<()> {
    let encoded = rmp_serde::to_vec_named(frame)?;
    let len = u32::try_from(encoded.len())
        .map_err(|_| StorageError::service_error("frame too large to encode"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> StorageResult<Frame> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(StorageError::service_error(format!("frame of {len} bytes exceeds limit")));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(rmp_serde::from_slice(&buf)?)
}
