//! Frame codec for the channel wire protocol.
//!
//! Frame format:
//! ```text
//! ┌──────────────┬────────────────────────┐
//! │ len (4B)     │   payload (len bytes)  │
//! │ i32 LE       │                        │
//! └──────────────┴────────────────────────┘
//! ```
//! `len == 0` is a valid empty payload. `len == -1` is a keep-alive marker
//! with no payload and is never handed to the decoder. Any other negative
//! length, or a length above the configured maximum, is a protocol violation.

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::types::{Error, Result};

/// Length value marking a keep-alive frame.
pub const KEEPALIVE_SENTINEL: i32 = -1;

/// One frame read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Payload bytes, possibly empty.
    Data(Bytes),
    /// Keep-alive marker.
    KeepAlive,
}

/// What a length prefix announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHeader {
    Data(usize),
    KeepAlive,
}

/// Validate a 4-byte length prefix.
pub fn decode_length(prefix: [u8; 4], max_frame_bytes: u32) -> Result<FrameHeader> {
    let len = i32::from_le_bytes(prefix);
    if len == KEEPALIVE_SENTINEL {
        return Ok(FrameHeader::KeepAlive);
    }
    if len < 0 {
        return Err(Error::protocol(format!("negative frame length: {}", len)));
    }
    if len as u32 > max_frame_bytes {
        return Err(Error::protocol(format!(
            "frame too large: {} bytes (max {})",
            len, max_frame_bytes
        )));
    }
    Ok(FrameHeader::Data(len as usize))
}

/// Read one frame from the stream.
///
/// Returns `None` on clean EOF (the peer closed between frames). EOF inside a
/// frame is an I/O error.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    match decode_length(len_buf, max_frame_bytes)? {
        FrameHeader::KeepAlive => Ok(Some(Frame::KeepAlive)),
        FrameHeader::Data(0) => Ok(Some(Frame::Data(Bytes::new()))),
        FrameHeader::Data(len) => {
            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload).await?;
            Ok(Some(Frame::Data(Bytes::from(payload))))
        }
    }
}

/// Write one data frame and flush.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = i32::try_from(payload.len())
        .map_err(|_| Error::protocol(format!("payload too large: {} bytes", payload.len())))?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a keep-alive marker and flush.
pub async fn write_keepalive<W: AsyncWriteExt + Unpin>(writer: &mut W) -> Result<()> {
    writer.write_all(&KEEPALIVE_SENTINEL.to_le_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_zero_length_is_empty_payload() {
        let mut wire: &[u8] = &0i32.to_le_bytes();
        let frame = read_frame(&mut wire, 1024).await.unwrap();
        assert_eq!(frame, Some(Frame::Data(Bytes::new())));
    }

    #[tokio::test]
    async fn test_keepalive_round_trip() {
        let mut buf = Vec::new();
        write_keepalive(&mut buf).await.unwrap();
        write_frame(&mut buf, b"after").await.unwrap();

        let mut wire = buf.as_slice();
        assert_eq!(read_frame(&mut wire, 1024).await.unwrap(), Some(Frame::KeepAlive));
        assert_eq!(
            read_frame(&mut wire, 1024).await.unwrap(),
            Some(Frame::Data(Bytes::from_static(b"after")))
        );
        assert_eq!(read_frame(&mut wire, 1024).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversize_frame_is_protocol_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[7u8; 64]).await.unwrap();
        let mut wire = buf.as_slice();
        let err = read_frame(&mut wire, 16).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_io_error() {
        let mut buf = 10i32.to_le_bytes().to_vec();
        buf.extend_from_slice(b"abc");
        let mut wire = buf.as_slice();
        let err = read_frame(&mut wire, 1024).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    proptest! {
        #[test]
        fn prop_negative_lengths_other_than_sentinel_rejected(len in i32::MIN..-1i32) {
            let err = decode_length(len.to_le_bytes(), u32::MAX).unwrap_err();
            prop_assert!(matches!(err, Error::Protocol(_)));
        }

        #[test]
        fn prop_lengths_within_limit_accepted(len in 0i32..=4096, max in 4096u32..1_000_000) {
            prop_assert_eq!(
                decode_length(len.to_le_bytes(), max).unwrap(),
                FrameHeader::Data(len as usize)
            );
        }

        #[test]
        fn prop_lengths_above_limit_rejected(max in 0u32..1024, extra in 1i32..1024) {
            let len = max as i32 + extra;
            prop_assert!(decode_length(len.to_le_bytes(), max).is_err());
        }
    }
}
