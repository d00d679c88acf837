//! Length-prefixed framing over an ordered bidirectional stream.
//!
//! # Wire Format
//!
//! ```text
//! +--------+--------+------------------+
//! | Length | Type   | Payload          |
//! | 4 bytes| 1 byte | JSON             |
//! | BE u32 | u8     | variable         |
//! +--------+--------+------------------+
//! ```
//!
//! The length covers the type byte plus the payload. Frames above
//! [`MAX_FRAME_SIZE`](crate::defaults::MAX_FRAME_SIZE) are rejected.
//! Unknown frame-type bytes are skipped (the declared length is consumed)
//! so that either end can add frame types without breaking the other.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::defaults::MAX_FRAME_SIZE;
use crate::frames::{AgentToController, ControllerToAgent, FrameType};
use crate::TunnelError;

/// A per-direction frame union that can be carried by the wire framing.
pub trait FrameUnion: Sized {
    fn frame_type(&self) -> FrameType;
    fn encode_payload(&self) -> Result<Vec<u8>, TunnelError>;
    fn decode(frame_type: FrameType, payload: &[u8]) -> Result<Self, TunnelError>;
}

impl FrameUnion for AgentToController {
    fn frame_type(&self) -> FrameType {
        AgentToController::frame_type(self)
    }
    fn encode_payload(&self) -> Result<Vec<u8>, TunnelError> {
        AgentToController::encode_payload(self)
    }
    fn decode(frame_type: FrameType, payload: &[u8]) -> Result<Self, TunnelError> {
        AgentToController::decode(frame_type, payload)
    }
}

impl FrameUnion for ControllerToAgent {
    fn frame_type(&self) -> FrameType {
        ControllerToAgent::frame_type(self)
    }
    fn encode_payload(&self) -> Result<Vec<u8>, TunnelError> {
        ControllerToAgent::encode_payload(self)
    }
    fn decode(frame_type: FrameType, payload: &[u8]) -> Result<Self, TunnelError> {
        ControllerToAgent::decode(frame_type, payload)
    }
}

/// Write one frame.
pub async fn write_frame<W, F>(writer: &mut W, frame: &F) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
    F: FrameUnion,
{
    let payload = frame.encode_payload()?;
    let frame_len = payload.len() + 1;
    if frame_len > MAX_FRAME_SIZE {
        return Err(TunnelError::FrameTooLarge {
            size: frame_len,
            max: MAX_FRAME_SIZE,
        });
    }

    writer.write_all(&(frame_len as u32).to_be_bytes()).await?;
    writer.write_all(&[frame.frame_type() as u8]).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next frame.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary.
/// Unknown frame types are skipped and the read retried; a known frame
/// type that does not belong to direction `F` is a protocol violation.
pub async fn read_frame<R, F>(reader: &mut R) -> Result<Option<F>, TunnelError>
where
    R: AsyncRead + Unpin,
    F: FrameUnion,
{
    loop {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Peer closed between frames.
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let frame_len = u32::from_be_bytes(len_bytes) as usize;
        if frame_len > MAX_FRAME_SIZE {
            return Err(TunnelError::FrameTooLarge {
                size: frame_len,
                max: MAX_FRAME_SIZE,
            });
        }
        if frame_len == 0 {
            return Err(TunnelError::InvalidFrame(
                "zero-length frame".to_string(),
            ));
        }

        let mut buffer = vec![0u8; frame_len];
        reader.read_exact(&mut buffer).await?;

        let type_byte = buffer[0];
        let payload = &buffer[1..];

        match FrameType::try_from(type_byte) {
            Ok(frame_type) => return F::decode(frame_type, payload).map(Some),
            Err(TunnelError::UnknownFrameType(byte)) => {
                // Reserved for forward compatibility.
                debug!(frame_type = byte, "Skipping unknown frame type");
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{HttpChunkedResponse, PingRequest};

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let sent = AgentToController::Ping(PingRequest { ts: 42 });
        write_frame(&mut client, &sent).await.unwrap();

        let received: AgentToController = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_clean_eof_returns_none() {
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);

        let received: Option<AgentToController> = read_frame(&mut server).await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_unknown_frame_type_skipped() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        // A frame with a reserved type byte, then a real one.
        let bogus_payload = b"{}";
        let frame_len = (bogus_payload.len() + 1) as u32;
        client.write_all(&frame_len.to_be_bytes()).await.unwrap();
        client.write_all(&[0x7f]).await.unwrap();
        client.write_all(bogus_payload).await.unwrap();

        let sent = AgentToController::HttpChunk(HttpChunkedResponse {
            id: "id-1".to_string(),
            target: "a1".to_string(),
            body: vec![9, 9, 9],
        });
        write_frame(&mut client, &sent).await.unwrap();

        let received: AgentToController = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let frame_len = (MAX_FRAME_SIZE + 1) as u32;
        client.write_all(&frame_len.to_be_bytes()).await.unwrap();

        let err = read_frame::<_, AgentToController>(&mut server)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        // Declares 10 bytes but delivers only the type byte.
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(&[0x02]).await.unwrap();
        drop(client);

        let err = read_frame::<_, AgentToController>(&mut server)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Io(_)));
    }
}
