//! Length-prefixed framing shared by the relay and its clients.
//!
//! Every message on the stream is `[u32 big-endian length][payload]`. The
//! prefix is always network order so peers on different hosts agree on it.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;

pub const PREFIX_LEN: usize = 4;

/// Largest payload a peer may declare before the connection is dropped.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Prepends the length prefix to `payload`.
pub fn encode_frame(payload: &[u8]) -> io::Result<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too big"))?;

    let mut frame = Vec::with_capacity(PREFIX_LEN + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Reads exactly one frame from `reader`.
///
/// A short read on either the prefix or the payload surfaces as
/// [`FrameError::ConnectionClosed`]; the partially filled buffer is dropped
/// and never handed to the caller.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; PREFIX_LEN];
    reader.read_exact(&mut prefix).await.map_err(closed_on_eof)?;

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(closed_on_eof)?;
    Ok(payload)
}

/// Encodes `payload` and writes it in full, then flushes.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

fn closed_on_eof(err: io::Error) -> FrameError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => FrameError::ConnectionClosed,
        _ => FrameError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn decode_returns_encoded_payload() {
        let payload = "$chat héllo wörld".as_bytes();
        let encoded = encode_frame(payload).expect("encode");
        assert_eq!(&encoded[..PREFIX_LEN], &(payload.len() as u32).to_be_bytes());

        let mut reader = &encoded[..];
        let decoded = read_frame(&mut reader).await.expect("decode");
        assert_eq!(decoded, payload);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn arbitrary_bytes_survive_back_to_back_frames() {
        let payloads: Vec<Vec<u8>> = vec![
            Vec::new(),
            vec![0x00],
            (0..=255u8).collect(),
            vec![0xff, 0xfe, 0xc3, 0x28, 0x80],
            (0..65_536u32).map(|i| (i * 31 % 251) as u8).collect(),
            vec![b'\n'; 1000],
        ];

        let mut stream = Vec::new();
        for payload in &payloads {
            stream.extend(encode_frame(payload).expect("encode"));
        }

        let mut reader = &stream[..];
        for payload in &payloads {
            let decoded = read_frame(&mut reader).await.expect("decode");
            assert_eq!(&decoded, payload);
        }
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn empty_payload_is_a_valid_frame() {
        let encoded = encode_frame(b"").expect("encode");
        assert_eq!(encoded, vec![0, 0, 0, 0]);

        let decoded = read_frame(&mut &encoded[..]).await.expect("decode");
        assert!(decoded.is_empty());
    }

    #[tokio::test]
    async fn frames_split_across_writes_are_reassembled() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        let frame = encode_frame(b"$getlist").expect("encode");

        let feeder = tokio::spawn(async move {
            for chunk in frame.chunks(3) {
                writer.write_all(chunk).await.expect("write chunk");
                tokio::task::yield_now().await;
            }
        });

        let decoded = read_frame(&mut reader).await.expect("decode");
        assert_eq!(decoded, b"$getlist");
        feeder.await.expect("feeder");
    }

    #[tokio::test]
    async fn eof_before_prefix_is_connection_closed() {
        let result = read_frame(&mut &b""[..]).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn truncated_payload_is_connection_closed() {
        let mut encoded = encode_frame(b"hello world").expect("encode");
        encoded.truncate(PREFIX_LEN + 4);

        let result = read_frame(&mut &encoded[..]).await;
        assert!(matches!(result, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn oversized_declaration_is_rejected() {
        let prefix = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        let result = read_frame(&mut &prefix[..]).await;
        assert!(matches!(result, Err(FrameError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn write_frame_emits_prefix_and_payload() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        write_frame(&mut writer, b"SV_SUCCESS").await.expect("write");
        drop(writer);

        let mut raw = Vec::new();
        reader.read_to_end(&mut raw).await.expect("read");
        assert_eq!(raw, encode_frame(b"SV_SUCCESS").expect("encode"));
    }
}
