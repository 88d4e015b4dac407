use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use uuid::Uuid;

use crate::core::Message;
use crate::network::{Connection, Transport, MAX_FRAME_SIZE};
use crate::transfer::FileTransfer;
use crate::utils::{Result, SyncError};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
const PING_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: Uuid,
    pub name: String,
    pub addr: Option<SocketAddr>,
    pub rtt: Option<Duration>,
    pub last_seen: Instant,
}

#[derive(Default)]
struct RttState {
    next_nonce: u64,
    pending: HashMap<u64, Instant>,
    last: Option<Duration>,
    last_seen: Option<Instant>,
}

/// A handshaken TCP link to another node. The connection id is the remote
/// node id.
pub struct TcpPeer {
    id: Uuid,
    name: String,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    writer: Mutex<OwnedWriteHalf>,
    rtt: std::sync::Mutex<RttState>,
    pinger: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TcpPeer {
    /// Exchanges handshakes on a fresh stream, registers the peer and starts
    /// its reader and ping tasks. Peers of another logical library are refused.
    pub async fn establish(
        stream: TcpStream,
        local: &Message,
        transfer: Arc<FileTransfer>,
        peer_manager: Arc<RwLock<PeerManager>>,
    ) -> Result<Arc<TcpPeer>> {
        let (our_id, our_logical) = match local {
            Message::Handshake {
                node_id,
                logical_name,
                ..
            } => (*node_id, logical_name.clone()),
            _ => {
                return Err(SyncError::ConnectionFailed(
                    "handshake message expected".to_string(),
                ))
            }
        };

        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();
        let (mut reader, mut writer) = stream.into_split();

        Transport::send_message(&mut writer, local).await?;
        let reply = timeout(HANDSHAKE_TIMEOUT, Transport::receive_message(&mut reader))
            .await
            .map_err(|_| SyncError::ConnectionFailed("Handshake timeout".to_string()))??;

        let (id, name) = match reply {
            Message::Handshake {
                node_id,
                node_name,
                logical_name,
            } => {
                if logical_name != our_logical {
                    return Err(SyncError::ConnectionFailed(format!(
                        "{} serves library '{}', not '{}'",
                        node_name, logical_name, our_logical
                    )));
                }
                if node_id == our_id {
                    return Err(SyncError::ConnectionFailed(
                        "connected to self".to_string(),
                    ));
                }
                (node_id, node_name)
            }
            other => {
                return Err(SyncError::ConnectionFailed(format!(
                    "expected handshake, got {:?}",
                    other.kind()
                )))
            }
        };

        let peer = Arc::new(TcpPeer {
            id,
            name,
            local_addr,
            remote_addr,
            writer: Mutex::new(writer),
            rtt: std::sync::Mutex::new(RttState::default()),
            pinger: std::sync::Mutex::new(None),
        });

        peer_manager.write().await.add_peer(peer.clone())?;
        if let Err(e) = transfer.add_connection(peer.clone()).await {
            peer_manager.write().await.remove_peer(&peer.id);
            return Err(e);
        }
        peer.spawn_tasks(reader, transfer, peer_manager);

        info!(
            "Peer {} ({}) connected from {:?}",
            peer.name, peer.id, peer.remote_addr
        );
        Ok(peer)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> PeerInfo {
        let (rtt, last_seen) = self
            .rtt
            .lock()
            .map(|state| (state.last, state.last_seen))
            .unwrap_or((None, None));
        PeerInfo {
            id: self.id,
            name: self.name.clone(),
            addr: self.remote_addr,
            rtt,
            last_seen: last_seen.unwrap_or_else(Instant::now),
        }
    }

    fn spawn_tasks(
        self: &Arc<Self>,
        mut reader: OwnedReadHalf,
        transfer: Arc<FileTransfer>,
        peer_manager: Arc<RwLock<PeerManager>>,
    ) {
        let pinger = {
            let peer = Arc::downgrade(self);
            tokio::spawn(async move {
                let mut ticker = interval(PING_INTERVAL);
                loop {
                    ticker.tick().await;
                    let peer = match peer.upgrade() {
                        Some(peer) => peer,
                        None => break,
                    };
                    let nonce = peer.next_ping();
                    if let Err(e) = peer.send_message(Message::Ping { nonce }).await {
                        debug!("Ping to {} failed: {}", peer.id, e);
                    }
                }
            })
        };

        {
            let peer = self.clone();
            tokio::spawn(async move {
                loop {
                    let frame = match Transport::receive_data(&mut reader, MAX_FRAME_SIZE).await {
                        Ok(frame) => frame,
                        Err(e) => {
                            debug!("Connection lost with {}: {}", peer.id, e);
                            break;
                        }
                    };
                    let message = match Message::decode(&frame) {
                        Ok(message) => message,
                        Err(e) => {
                            warn!("Dropping undecodable frame from {}: {}", peer.id, e);
                            continue;
                        }
                    };
                    peer.touch();
                    match message {
                        Message::Ping { nonce } => {
                            if let Err(e) = peer.send_message(Message::Pong { nonce }).await {
                                debug!("Pong to {} failed: {}", peer.id, e);
                            }
                        }
                        Message::Pong { nonce } => peer.record_pong(nonce),
                        Message::Handshake { .. } => {
                            debug!("Ignoring repeated handshake from {}", peer.id)
                        }
                        message => {
                            transfer.receive_message(peer.id, message);
                        }
                    }
                }

                transfer.remove_connection(&peer.id);
                peer_manager.write().await.remove_peer(&peer.id);
                peer.stop_pinger();
                info!("Peer {} disconnected", peer.id);
            });
        }

        if let Ok(mut slot) = self.pinger.lock() {
            *slot = Some(pinger);
        }
    }

    fn next_ping(&self) -> u64 {
        match self.rtt.lock() {
            Ok(mut state) => {
                state.next_nonce += 1;
                let nonce = state.next_nonce;
                state.pending.insert(nonce, Instant::now());
                // Unanswered pings older than a minute are forgotten.
                state
                    .pending
                    .retain(|_, sent| sent.elapsed() < Duration::from_secs(60));
                nonce
            }
            Err(_) => 0,
        }
    }

    fn record_pong(&self, nonce: u64) {
        if let Ok(mut state) = self.rtt.lock() {
            if let Some(sent) = state.pending.remove(&nonce) {
                state.last = Some(sent.elapsed());
            }
        }
    }

    fn touch(&self) {
        if let Ok(mut state) = self.rtt.lock() {
            state.last_seen = Some(Instant::now());
        }
    }

    fn stop_pinger(&self) {
        if let Some(task) = self.pinger.lock().ok().and_then(|mut slot| slot.take()) {
            task.abort();
        }
    }

    pub async fn close(&self) {
        self.stop_pinger();
        let mut writer = self.writer.lock().await;
        if let Err(e) = tokio::io::AsyncWriteExt::shutdown(&mut *writer).await {
            debug!("Shutdown of {} failed: {}", self.id, e);
        }
    }
}

#[async_trait]
impl Connection for TcpPeer {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn send_message(&self, message: Message) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match timeout(SEND_TIMEOUT, Transport::send_message(&mut *writer, &message)).await {
            Ok(sent) => sent?,
            Err(_) => {
                // A frame may be half written, so the stream is unusable. Closing
                // it makes both readers drop the connection.
                if let Err(e) = tokio::io::AsyncWriteExt::shutdown(&mut *writer).await {
                    debug!("Shutdown of {} failed: {}", self.id, e);
                }
                return Err(SyncError::NetworkError(format!(
                    "Send to {} timed out",
                    self.id
                )));
            }
        }
        debug!("Sent {:?} to {}", message.kind(), self.id);
        Ok(())
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    async fn round_trip_time(&self) -> Result<Duration> {
        self.rtt
            .lock()
            .ok()
            .and_then(|state| state.last)
            .ok_or_else(|| SyncError::NetworkError(format!("no RTT sample for {}", self.id)))
    }
}

pub struct PeerManager {
    peers: HashMap<Uuid, Arc<TcpPeer>>,
    max_peers: usize,
}

impl Default for PeerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerManager {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            max_peers: 50,
        }
    }

    pub fn add_peer(&mut self, peer: Arc<TcpPeer>) -> Result<()> {
        if self.peers.contains_key(&peer.id) {
            return Err(SyncError::ConnectionFailed(format!(
                "already connected to {}",
                peer.id
            )));
        }
        if self.peers.len() >= self.max_peers {
            return Err(SyncError::ConnectionFailed(format!(
                "peer limit {} reached",
                self.max_peers
            )));
        }

        let peer_id = peer.id;
        self.peers.insert(peer_id, peer);
        info!("Added peer: {} ({})", peer_id, self.peers.len());
        Ok(())
    }

    pub fn get_peer(&self, peer_id: &Uuid) -> Option<Arc<TcpPeer>> {
        self.peers.get(peer_id).cloned()
    }

    pub fn get_all_peers(&self) -> Vec<Arc<TcpPeer>> {
        self.peers.values().cloned().collect()
    }

    pub fn remove_peer(&mut self, peer_id: &Uuid) {
        if self.peers.remove(peer_id).is_some() {
            info!("Removed peer: {} ({})", peer_id, self.peers.len());
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TransferConfig;
    use crate::storage::FileLibrary;
    use crate::utils::MetricsCollector;
    use tokio::net::TcpListener;

    async fn transfer(dir: &std::path::Path) -> Arc<FileTransfer> {
        let library = Arc::new(
            FileLibrary::load(dir.to_path_buf(), Duration::from_secs(5))
                .await
                .unwrap(),
        );
        FileTransfer::new(
            library,
            TransferConfig::default(),
            Arc::new(MetricsCollector::new(None)),
        )
        .0
    }

    #[tokio::test]
    async fn test_handshake_and_rtt() {
        let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let (transfer_a, transfer_b) = (transfer(dir_a.path()).await, transfer(dir_b.path()).await);
        let (manager_a, manager_b) = (
            Arc::new(RwLock::new(PeerManager::new())),
            Arc::new(RwLock::new(PeerManager::new())),
        );
        let (id_a, id_b) = (Uuid::new_v4(), Uuid::new_v4());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let hello = Message::handshake(id_b, "b".to_string(), "team".to_string());
            TcpPeer::establish(stream, &hello, transfer_b, manager_b).await
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let hello = Message::handshake(id_a, "a".to_string(), "team".to_string());
        let peer = TcpPeer::establish(stream, &hello, transfer_a.clone(), manager_a.clone())
            .await
            .unwrap();
        let remote = accept.await.unwrap().unwrap();

        assert_eq!(peer.id(), id_b);
        assert_eq!(remote.id(), id_a);
        assert_eq!(manager_a.read().await.peer_count(), 1);
        assert_eq!(transfer_a.connection_ids(), vec![id_b]);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(peer.round_trip_time().await.is_ok());
    }

    #[tokio::test]
    async fn test_other_logical_library_refused() {
        let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let (transfer_a, transfer_b) = (transfer(dir_a.path()).await, transfer(dir_b.path()).await);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let hello = Message::handshake(Uuid::new_v4(), "b".to_string(), "photos".to_string());
            TcpPeer::establish(
                stream,
                &hello,
                transfer_b,
                Arc::new(RwLock::new(PeerManager::new())),
            )
            .await
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let hello = Message::handshake(Uuid::new_v4(), "a".to_string(), "music".to_string());
        let manager = Arc::new(RwLock::new(PeerManager::new()));
        let result = TcpPeer::establish(stream, &hello, transfer_a.clone(), manager.clone()).await;

        assert!(matches!(result, Err(SyncError::ConnectionFailed(_))));
        assert!(accept.await.unwrap().is_err());
        assert_eq!(manager.read().await.peer_count(), 0);
        assert!(transfer_a.connection_ids().is_empty());
    }
}
