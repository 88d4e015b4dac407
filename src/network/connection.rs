use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use uuid::Uuid;

use crate::core::Message;
use crate::utils::Result;

/// One established link to a peer, as seen by the transfer engine.
///
/// Implementations own the wire; the engine only needs to push messages and
/// sample round-trip time. Incoming messages are delivered to the engine by
/// whoever drives the link.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> Uuid;

    async fn send_message(&self, message: Message) -> Result<()>;

    fn local_address(&self) -> Option<SocketAddr>;

    fn remote_address(&self) -> Option<SocketAddr>;

    /// Latest measured round-trip time.
    async fn round_trip_time(&self) -> Result<Duration>;
}
