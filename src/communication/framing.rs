use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

/// Upper bound on a single frame body.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Write one frame: 4-byte big-endian length, then the UTF-8 body.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, raw: &str) -> Result<()> {
    let bytes = raw.as_bytes();
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let len = bytes.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame.
///
/// Returns Ok(None) on clean EOF, an error on a partial body.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    }

    let length = u32::from_be_bytes(len_buf) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut body = vec![0u8; length];
    if let Err(e) = reader.read_exact(&mut body).await {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Err(Error::ConnectionClosed(format!(
                "Stream ended inside a frame of {} bytes.",
                length
            )));
        }
        return Err(Error::Io(e));
    }

    String::from_utf8(body)
        .map(Some)
        .map_err(|e| Error::Protocol(format!("Frame is not valid UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_in_sequence() {
        let mut buf = Vec::new();
        write_frame(&mut buf, "first").await.unwrap();
        write_frame(&mut buf, "").await.unwrap();
        write_frame(&mut buf, "third ✓").await.unwrap();
        assert_eq!(&buf[..4], &5u32.to_be_bytes());

        let mut reader = buf.as_slice();
        assert_eq!(read_frame(&mut reader).await.unwrap().as_deref(), Some("first"));
        assert_eq!(read_frame(&mut reader).await.unwrap().as_deref(), Some(""));
        assert_eq!(read_frame(&mut reader).await.unwrap().as_deref(), Some("third ✓"));
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_truncated_prefix_is_clean_eof() {
        let mut reader: &[u8] = &[0, 0];
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_truncated_body_is_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(b"abc");
        let mut reader = buf.as_slice();
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let buf = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
        let mut reader = &buf[..];
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_invalid_utf8_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u32.to_be_bytes());
        buf.extend_from_slice(&[0xff, 0xfe]);
        let mut reader = buf.as_slice();
        assert!(matches!(read_frame(&mut reader).await, Err(Error::Protocol(_))));
    }
}
