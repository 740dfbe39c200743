//! MLLP framing: `0x0B` payload `0x1C 0x0D`.

use crate::FrameError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const START_BLOCK: u8 = 0x0b;
pub const END_BLOCK: u8 = 0x1c;
pub const CARRIAGE_RETURN: u8 = 0x0d;

/// Default maximum payload size: 1 MiB.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Reads one frame and returns its payload.
///
/// # Returns
///
/// `Ok(None)` if the peer closed the connection before sending a single byte.
///
/// # Errors
///
/// - `FrameError::MissingStartBlock` if the first byte is not `0x0B`
/// - `FrameError::TooLarge` once more than `max_payload` bytes arrive without an end block
/// - `FrameError::Truncated` if the peer closes mid-frame
/// - `FrameError::Io` for any underlying read error
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut first = [0u8; 1];
    if reader.read(&mut first).await? == 0 {
        return Ok(None);
    }
    if first[0] != START_BLOCK {
        return Err(FrameError::MissingStartBlock(first[0]));
    }

    let mut payload: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(FrameError::Truncated);
        }
        // The end block may straddle two reads, so search from one byte back.
        let search_from = payload.len().saturating_sub(1);
        payload.extend_from_slice(&chunk[..n]);

        if let Some(end) = payload[search_from..]
            .windows(2)
            .position(|w| w == [END_BLOCK, CARRIAGE_RETURN])
        {
            payload.truncate(search_from + end);
            if payload.len() > max_payload {
                return Err(FrameError::TooLarge { limit: max_payload });
            }
            return Ok(Some(payload));
        }
        if payload.len() > max_payload + 1 {
            return Err(FrameError::TooLarge { limit: max_payload });
        }
    }
}

/// Writes `payload` as one frame and flushes.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(payload.len() + 3);
    frame.push(START_BLOCK);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&[END_BLOCK, CARRIAGE_RETURN]);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"MSH|^~\\&\rPID|1").await.unwrap();
        assert_eq!(buf.first(), Some(&START_BLOCK));
        assert!(buf.ends_with(&[END_BLOCK, CARRIAGE_RETURN]));

        let payload = read_frame(&mut buf.as_slice(), DEFAULT_MAX_FRAME_BYTES)
            .await
            .unwrap();
        assert_eq!(payload.as_deref(), Some(&b"MSH|^~\\&\rPID|1"[..]));
    }

    #[tokio::test]
    async fn test_eof_before_any_byte_is_none() {
        let empty: &[u8] = &[];
        assert!(read_frame(&mut &empty[..], 16).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_start_block() {
        let raw: &[u8] = b"MSH|...";
        assert!(matches!(
            read_frame(&mut &raw[..], 16).await,
            Err(FrameError::MissingStartBlock(b'M'))
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let raw: &[u8] = &[START_BLOCK, b'a', b'b'];
        assert!(matches!(
            read_frame(&mut &raw[..], 16).await,
            Err(FrameError::Truncated)
        ));
    }

    #[tokio::test]
    async fn test_oversize_frame_is_rejected() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[b'x'; 32]).await.unwrap();
        assert!(matches!(
            read_frame(&mut buf.as_slice(), 31).await,
            Err(FrameError::TooLarge { limit: 31 })
        ));
        let exact = read_frame(&mut buf.as_slice(), 32).await.unwrap();
        assert_eq!(exact.map(|p| p.len()), Some(32));
    }

    #[tokio::test]
    async fn test_oversize_stream_without_end_block_stops_early() {
        let mut raw = vec![START_BLOCK];
        raw.extend(std::iter::repeat(b'x').take(64 * 1024));
        assert!(matches!(
            read_frame(&mut raw.as_slice(), 1024).await,
            Err(FrameError::TooLarge { limit: 1024 })
        ));
    }

    #[tokio::test]
    async fn test_end_block_split_across_reads() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            client.write_all(&[START_BLOCK, b'o', b'k', END_BLOCK]).await.unwrap();
            client.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            client.write_all(&[CARRIAGE_RETURN]).await.unwrap();
        });
        let payload = read_frame(&mut server, 16).await.unwrap();
        assert_eq!(payload.as_deref(), Some(&b"ok"[..]));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"").await.unwrap();
        let payload = read_frame(&mut buf.as_slice(), 16).await.unwrap();
        assert_eq!(payload, Some(Vec::new()));
    }
}
