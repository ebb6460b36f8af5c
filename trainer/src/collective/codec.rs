//! Length-prefixed CBOR framing for ring traffic.
//!
//! Each frame is a big-endian `u32` payload length followed by the CBOR
//! encoding of one message.

use serde::{de::DeserializeOwned, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame payload (64 MiB)
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Read one frame from an async stream
pub async fn read_frame<T, M>(io: &mut T) -> io::Result<M>
where
    T: AsyncRead + Unpin + Send,
    M: DeserializeOwned,
{
    read_frame_with_limit(io, MAX_FRAME_BYTES).await
}

/// Write one frame to an async stream
pub async fn write_frame<T, M>(io: &mut T, message: &M) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
    M: Serialize + Sync,
{
    write_frame_with_limit(io, message, MAX_FRAME_BYTES).await
}

pub async fn read_frame_with_limit<T, M>(io: &mut T, limit: usize) -> io::Result<M>
where
    T: AsyncRead + Unpin + Send,
    M: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame size {} exceeds limit {}", len, limit),
        ));
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;

    ciborium::de::from_reader(&buf[..]).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub async fn write_frame_with_limit<T, M>(io: &mut T, message: &M, limit: usize) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
    M: Serialize + Sync,
{
    let mut buf = Vec::new();
    ciborium::ser::into_writer(message, &mut buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    if buf.len() > limit {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame size {} exceeds limit {}", buf.len(), limit),
        ));
    }

    let len = buf.len() as u32;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(&buf).await?;
    io.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collective::message::{AllReducePhase, TensorMessage};
    use crate::collective::tensor::Tensor;
    use std::io::Cursor;

    fn message(values: Vec<f32>) -> TensorMessage {
        TensorMessage::new(1, 0, "w", AllReducePhase::AllGather, 0, 0, &Tensor::from_vec(values))
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let msg = message(vec![1.5, 2.5, 3.5]);

        let mut write_buf = Vec::new();
        write_frame(&mut write_buf, &msg).await.unwrap();

        let mut read_buf = Cursor::new(write_buf);
        let decoded: TensorMessage = read_frame(&mut read_buf).await.unwrap();
        assert_eq!(msg, decoded);
    }

    #[tokio::test]
    async fn test_length_prefix_is_big_endian() {
        let msg = message(vec![1.0]);

        let mut buf = Vec::new();
        write_frame(&mut buf, &msg).await.unwrap();

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);
    }

    #[tokio::test]
    async fn test_write_size_limit() {
        let msg = message(vec![1.234_567_9; 1_000]);

        let mut buf = Vec::new();
        let result = write_frame_with_limit(&mut buf, &msg, 256).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
        assert!(buf.is_empty(), "Nothing may be written for an oversized frame");
    }

    #[tokio::test]
    async fn test_read_size_limit_enforcement() {
        let msg = message(vec![1.0, 2.0]);

        let mut write_buf = Vec::new();
        write_frame(&mut write_buf, &msg).await.unwrap();

        // Tamper with the length prefix to be larger than limit
        let large_len = (MAX_FRAME_BYTES + 1) as u32;
        write_buf[0..4].copy_from_slice(&large_len.to_be_bytes());

        let mut read_buf = Cursor::new(write_buf);
        let result: io::Result<TensorMessage> = read_frame(&mut read_buf).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_malformed_cbor() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(&[0xFF; 10]);

        let mut read_buf = Cursor::new(buf);
        let result: io::Result<TensorMessage> = read_frame(&mut read_buf).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_incomplete_read() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&100u32.to_be_bytes());
        buf.extend_from_slice(&[0x01, 0x02, 0x03]);

        let mut read_buf = Cursor::new(buf);
        let result: io::Result<TensorMessage> = read_frame(&mut read_buf).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }
}
