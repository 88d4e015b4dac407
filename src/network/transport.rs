use log::info;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::core::Message;
use crate::utils::{Result, SyncError};

/// Largest accepted frame body.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

pub struct Transport;

impl Transport {
    pub async fn connect(addr: &str) -> Result<TcpStream> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            SyncError::ConnectionFailed(format!("Failed to connect to {}: {}", addr, e))
        })?;
        stream.set_nodelay(true)?;

        info!("Connected to {}", addr);
        Ok(stream)
    }

    pub async fn listen(port: u16) -> Result<TcpListener> {
        let addr = format!("0.0.0.0:{}", port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| SyncError::NetworkError(format!("Failed to bind to {}: {}", addr, e)))?;

        info!("Listening on {}", addr);
        Ok(listener)
    }

    /// Writes one frame: a big-endian u32 length followed by the body.
    pub async fn send_data<W>(stream: &mut W, data: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if data.len() > MAX_FRAME_SIZE {
            return Err(SyncError::MessageTooLarge(data.len()));
        }
        stream.write_u32(data.len() as u32).await?;
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    pub async fn receive_data<R>(stream: &mut R, max_size: usize) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        let len = stream.read_u32().await? as usize;

        if len > max_size {
            return Err(SyncError::MessageTooLarge(len));
        }

        let mut buffer = vec![0u8; len];
        stream.read_exact(&mut buffer).await?;

        Ok(buffer)
    }

    pub async fn send_message<W>(stream: &mut W, message: &Message) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        Self::send_data(stream, &message.encode()?).await
    }

    pub async fn receive_message<R>(stream: &mut R) -> Result<Message>
    where
        R: AsyncRead + Unpin,
    {
        let data = Self::receive_data(stream, MAX_FRAME_SIZE).await?;
        Message::decode(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let uuid = Uuid::new_v4();

        Transport::send_message(&mut a, &Message::chunk_request(uuid, 0, 16384))
            .await
            .unwrap();
        Transport::send_message(&mut a, &Message::Congestion)
            .await
            .unwrap();

        assert_eq!(
            Transport::receive_message(&mut b).await.unwrap(),
            Message::chunk_request(uuid, 0, 16384)
        );
        assert_eq!(
            Transport::receive_message(&mut b).await.unwrap(),
            Message::Congestion
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = a.write_u32((MAX_FRAME_SIZE + 1) as u32).await;
        });

        assert!(matches!(
            Transport::receive_message(&mut b).await,
            Err(SyncError::MessageTooLarge(_))
        ));
    }
}
