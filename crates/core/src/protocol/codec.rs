//! Length-prefixed framing for relay protocol messages.
//!
//! Every frame is a 4-byte little-endian length followed by the bincode
//! encoding of the message. Frames larger than
//! [`MAX_MESSAGE_SIZE`](circuitnet_common::protocol::MAX_MESSAGE_SIZE) are
//! rejected in both directions.

use circuitnet_common::protocol::MAX_MESSAGE_SIZE;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::messages::RelayMessage;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("failed to decode message: {0}")]
    Decode(String),

    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write one frame and flush it
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let encoded = bincode::serialize(message).map_err(|e| CodecError::Encode(e.to_string()))?;
    if encoded.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: encoded.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(4 + encoded.len());
    frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
    frame.extend_from_slice(&encoded);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. End of stream before a complete frame is an I/O error.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;

    bincode::deserialize(&data).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Relay message codec
pub struct MessageCodec;

impl MessageCodec {
    pub async fn send_message<W>(writer: &mut W, message: &RelayMessage) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        write_frame(writer, message).await?;
        debug!("Sent {} message", message.kind);
        Ok(())
    }

    pub async fn recv_message<R>(reader: &mut R) -> Result<RelayMessage, CodecError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let message: RelayMessage = read_frame(reader).await?;
        debug!("Received {} message", message.kind);
        Ok(message)
    }
}
