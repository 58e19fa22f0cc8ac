//! Frame Codec
//!
//! Wire format shared by both directions of a connection:
//!
//! ```text
//! +----------------------+---------------------------+
//! | u32 length (BE)      | `length` bytes UTF-8 JSON |
//! +----------------------+---------------------------+
//! ```
//!
//! Reads are bounded by a caller-supplied maximum so a corrupt or hostile
//! length prefix can never drive an unbounded allocation.

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;
use crate::metrics;

pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Upper bound for a single frame body (1 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 1024 * 1024;

/// Serialize `value` into a complete frame (prefix + JSON body)
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(value)?;
    let len = u32::try_from(body.len()).map_err(|_| FrameError::Oversized {
        len: body.len() as u64,
        max: u32::MAX,
    })?;

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Read one frame from `reader`
///
/// Returns `Ok(None)` when the stream ends cleanly before the first prefix
/// byte, which callers treat as the peer closing the session.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: u32) -> Result<Option<Value>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
    let filled = read_until_full(reader, &mut prefix).await?;
    if filled == 0 {
        return Ok(None);
    }
    if filled < LENGTH_PREFIX_BYTES {
        return Err(FrameError::Truncated {
            expected: LENGTH_PREFIX_BYTES,
            received: filled,
        });
    }

    let len = u32::from_be_bytes(prefix);
    if len > max_frame_bytes {
        return Err(FrameError::Oversized {
            len: len as u64,
            max: max_frame_bytes,
        });
    }

    let mut body = vec![0u8; len as usize];
    let received = read_until_full(reader, &mut body).await?;
    if received < body.len() {
        return Err(FrameError::Truncated {
            expected: body.len(),
            received,
        });
    }

    metrics::FRAMES_RECEIVED.inc();
    let value = serde_json::from_slice(&body)?;
    Ok(Some(value))
}

/// Encode `value` and write it as one frame
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let frame = encode(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    metrics::FRAMES_SENT.inc();
    Ok(())
}

/// Discard `len` body bytes of a rejected frame, keeping the stream aligned
///
/// Returns `false` if the stream ended before `len` bytes were skipped.
pub async fn skip_body<R>(reader: &mut R, len: u64) -> Result<bool, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut limited = (&mut *reader).take(len);
    let skipped = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
    Ok(skipped == len)
}

/// Fill `buf` as far as the stream allows; returns the number of bytes read
async fn read_until_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_layout() {
        let frame = encode(&json!({"action": "get_history"})).unwrap();
        let body = br#"{"action":"get_history"}"#;
        assert_eq!(&frame[..4], &(body.len() as u32).to_be_bytes());
        assert_eq!(&frame[4..], body);
    }

    #[tokio::test]
    async fn test_read_frame_roundtrip() {
        let value = json!({"action": "send_image", "submitter_id": 7, "file_size": 3});
        let frame = encode(&value).unwrap();
        let mut reader = &frame[..];

        let decoded = read_frame(&mut reader, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
        assert_eq!(decoded, Some(value));
        // Nothing left over
        assert_eq!(read_frame(&mut reader, DEFAULT_MAX_FRAME_BYTES).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let mut reader: &[u8] = &[];
        assert!(read_frame(&mut reader, 16).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_prefix() {
        let mut reader: &[u8] = &[0, 0];
        let err = read_frame(&mut reader, 16).await.unwrap_err();
        assert!(matches!(err, FrameError::Truncated { expected: 4, received: 2 }));
    }

    #[tokio::test]
    async fn test_truncated_body() {
        let mut bytes = 10u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{\"a\"");
        let mut reader = &bytes[..];
        let err = read_frame(&mut reader, 64).await.unwrap_err();
        assert!(matches!(err, FrameError::Truncated { expected: 10, received: 4 }));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected_before_allocation() {
        let bytes = u32::MAX.to_be_bytes();
        let mut reader = &bytes[..];
        let err = read_frame(&mut reader, DEFAULT_MAX_FRAME_BYTES).await.unwrap_err();
        assert!(matches!(err, FrameError::Oversized { len, .. } if len == u32::MAX as u64));
    }

    #[tokio::test]
    async fn test_malformed_json() {
        let mut bytes = 3u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{x}");
        let mut reader = &bytes[..];
        let err = read_frame(&mut reader, 64).await.unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_skip_body_realigns_stream() {
        let mut bytes = vec![b'x'; 5];
        bytes.extend_from_slice(&encode(&json!({"ok": true})).unwrap());
        let mut reader = &bytes[..];

        assert!(skip_body(&mut reader, 5).await.unwrap());
        let next = read_frame(&mut reader, 64).await.unwrap();
        assert_eq!(next, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_write_frame_uses_mock_stream() {
        let value = json!({"status": "success"});
        let expected = encode(&value).unwrap();
        let mut writer = tokio_test::io::Builder::new().write(&expected).build();
        write_frame(&mut writer, &value).await.unwrap();
    }
}
