//! Length-prefixed framing for TCP streams.
//!
//! ```text
//!  ┌──────────────┬───────────────────────────┐
//!  │ len: u32 BE  │ payload (len bytes)       │
//!  └──────────────┴───────────────────────────┘
//! ```
//!
//! TCP is a byte stream, not a message stream: one `write` may arrive as
//! several `read`s and two writes may arrive as one.  The length prefix tells
//! the reader exactly where each frame ends.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame payload (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Writes one frame and flushes it.
///
/// # Errors
///
/// `InvalidInput` if `payload` exceeds [`MAX_FRAME_LEN`]; otherwise any I/O
/// error from the writer.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds {MAX_FRAME_LEN}", payload.len()),
        ));
    }
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Reads one frame.  Returns `Ok(None)` when the stream ends cleanly between
/// frames.
///
/// # Errors
///
/// `UnexpectedEof` if the stream ends inside a frame, `InvalidData` if the
/// announced length exceeds [`MAX_FRAME_LEN`].
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    let first = reader.read(&mut len_buf).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut len_buf[first..]).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("announced frame of {len} bytes exceeds {MAX_FRAME_LEN}"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_survive_a_duplex_stream() {
        // Arrange
        let (mut a, mut b) = tokio::io::duplex(64);

        // Act
        let writer = tokio::spawn(async move {
            write_frame(&mut a, b"hello").await.unwrap();
            write_frame(&mut a, b"").await.unwrap();
            write_frame(&mut a, &[7u8; 300]).await.unwrap();
        });
        let first = read_frame(&mut b).await.unwrap();
        let second = read_frame(&mut b).await.unwrap();
        let third = read_frame(&mut b).await.unwrap();
        writer.await.unwrap();
        let end = read_frame(&mut b).await.unwrap();

        // Assert
        assert_eq!(first.as_deref(), Some(&b"hello"[..]));
        assert_eq!(second.as_deref(), Some(&b""[..]));
        assert_eq!(third.map(|f| f.len()), Some(300));
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let bytes: &[u8] = &[0, 0, 0, 10, 1, 2, 3];
        let mut reader = bytes;
        let err = read_frame(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_oversized_length_is_rejected() {
        let bytes: &[u8] = &[0xFF, 0xFF, 0xFF, 0xFF];
        let mut reader = bytes;
        let err = read_frame(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_write_rejects_oversized_payload() {
        let mut sink = Vec::new();
        let payload = vec![0u8; MAX_FRAME_LEN + 1];
        let err = write_frame(&mut sink, &payload).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(sink.is_empty());
    }
}
