//! Kit socket framing
//!
//! Messages between the broker and the kit process travel as discrete frames
//! over a byte stream (the child's stdio in this deployment). Framing model:
//!
//! ```text
//! [0..4] : payload length (u32 BE)
//! [4..]  : payload bytes
//! ```
//!
//! Payloads are either pure text commands (`session …`, `child-… …`) or a
//! text header line followed by raw PNG bytes (`tile:` responses). The
//! payload shape is opaque to the codec; both ends agree on the prefix.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Refuse frames larger than this; a corrupt length prefix would otherwise
/// ask for gigabytes.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Read one length-prefixed frame. Returns `Ok(None)` on clean EOF at a
/// frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {} exceeds limit", len),
        ));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}

/// Write one length-prefixed frame and flush it.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame payload too large")
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        write_frame(&mut a, b"session 001 /doc 001").await.unwrap();
        write_frame(&mut a, b"tile: part=0 ver=1\n\x89PNG").await.unwrap();
        drop(a);

        let first = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(&first[..], b"session 001 /doc 001");

        let second = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(&second[..], b"tile: part=0 ver=1\n\x89PNG");

        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let bad = (MAX_FRAME_BYTES + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &bad).await.unwrap();
        drop(a);

        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
