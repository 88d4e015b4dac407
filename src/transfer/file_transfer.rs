//! Transfer engine: routes every inbound message to the library, a leecher or
//! a seeder, keeps one ordered queue per connection in each direction, and runs
//! the timeout and RTT sweeps.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use uuid::Uuid;

use crate::core::{FileState, Message, TransferConfig};
use crate::network::{Connection, Inbox, MessageEnvelope, MessageProcessor, Outbox};
use crate::storage::{FileLibrary, FileStatus, SyncFile, SyncHooks};
use crate::transfer::{
    select_congestion_targets, FileLeecher, FileSeeder, RttTracker, SlotDecision, TransferEvent,
    UploadSlots,
};
use crate::utils::{MetricsCollector, Result, SyncError};

struct LockRequest {
    pending: HashSet<Uuid>,
    reply: Option<oneshot::Sender<Result<()>>>,
}

pub struct FileTransfer {
    library: Arc<FileLibrary>,
    config: TransferConfig,
    outbox: Arc<Outbox>,
    inbox: Inbox,
    connections: RwLock<HashMap<Uuid, Arc<dyn Connection>>>,
    leechers: RwLock<HashMap<Uuid, Arc<FileLeecher>>>,
    seeders: RwLock<HashMap<Uuid, Arc<FileSeeder>>>,
    slots: Mutex<UploadSlots>,
    rtt: Mutex<RttTracker>,
    lock_requests: Mutex<HashMap<Uuid, LockRequest>>,
    events: mpsc::UnboundedSender<TransferEvent>,
    metrics: Arc<MetricsCollector>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    self_ref: Weak<FileTransfer>,
}

impl FileTransfer {
    pub fn new(
        library: Arc<FileLibrary>,
        config: TransferConfig,
        metrics: Arc<MetricsCollector>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransferEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let transfer = Arc::new_cyclic(|self_ref| Self {
            library,
            slots: Mutex::new(UploadSlots::new(config.max_upload_peers)),
            rtt: Mutex::new(RttTracker::new(config.congestion_factor)),
            config,
            outbox: Arc::new(Outbox::new()),
            inbox: Inbox::new(),
            connections: RwLock::new(HashMap::new()),
            leechers: RwLock::new(HashMap::new()),
            seeders: RwLock::new(HashMap::new()),
            lock_requests: Mutex::new(HashMap::new()),
            events,
            metrics,
            loops: Mutex::new(Vec::new()),
            self_ref: self_ref.clone(),
        });
        (transfer, events_rx)
    }

    pub fn library(&self) -> &Arc<FileLibrary> {
        &self.library
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Starts the request-timeout and RTT sweeps.
    pub fn start(&self) {
        let timeout_loop = {
            let weak = self.self_ref.clone();
            let period = self.config.timeout_sweep();
            tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    match weak.upgrade() {
                        Some(transfer) => transfer.sweep_timeouts(),
                        None => break,
                    }
                }
            })
        };

        let rtt_loop = {
            let weak = self.self_ref.clone();
            let period = self.config.rtt_sweep();
            tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    match weak.upgrade() {
                        Some(transfer) => transfer.sweep_rtt().await,
                        None => break,
                    }
                }
            })
        };

        if let Ok(mut loops) = self.loops.lock() {
            loops.push(timeout_loop);
            loops.push(rtt_loop);
        }
        info!("File transfer started");
    }

    pub async fn add_connection(&self, conn: Arc<dyn Connection>) -> Result<()> {
        let id = conn.id();
        let processor: Arc<dyn MessageProcessor> = self
            .self_ref
            .upgrade()
            .ok_or_else(|| SyncError::ChannelClosed("transfer shut down".to_string()))?;

        self.outbox.register(conn.clone());
        self.inbox.register(id, processor);
        if let Ok(mut connections) = self.connections.write() {
            connections.insert(id, conn);
        }
        info!("Connection {} added", id);

        let files = self.library.file_states(false).await;
        self.outbox.send(id, Message::SendLibrary { files });
        for leecher in self.leechers_snapshot() {
            leecher.add_connection(id);
        }
        Ok(())
    }

    pub fn remove_connection(&self, id: &Uuid) {
        let removed = self
            .connections
            .write()
            .map(|mut connections| connections.remove(id).is_some())
            .unwrap_or(false);
        self.outbox.unregister(id);
        self.inbox.unregister(id);
        if !removed {
            return;
        }

        for leecher in self.leechers_snapshot() {
            leecher.remove_connection(id);
        }
        for seeder in self.seeders_snapshot() {
            seeder.not_interested(id);
        }
        let granted = self
            .slots
            .lock()
            .map(|mut slots| slots.release_connection(*id))
            .unwrap_or_default();
        self.grant(granted);
        if let Ok(mut rtt) = self.rtt.lock() {
            rtt.remove(id);
        }

        if let Ok(mut requests) = self.lock_requests.lock() {
            for request in requests.values_mut() {
                request.pending.remove(id);
                if request.pending.is_empty() {
                    if let Some(reply) = request.reply.take() {
                        let _ = reply.send(Ok(()));
                    }
                }
            }
        }
        info!("Connection {} removed", id);
    }

    pub fn connection_ids(&self) -> Vec<Uuid> {
        self.connections
            .read()
            .map(|connections| connections.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Inbound entry point; the message joins the connection's receive queue.
    pub fn receive_message(&self, conn: Uuid, message: Message) -> bool {
        let delivered = self.inbox.deliver(conn, message);
        if !delivered {
            warn!("Dropping message from unknown connection {}", conn);
        }
        delivered
    }

    fn leechers_snapshot(&self) -> Vec<Arc<FileLeecher>> {
        self.leechers
            .read()
            .map(|leechers| leechers.values().cloned().collect())
            .unwrap_or_default()
    }

    fn seeders_snapshot(&self) -> Vec<Arc<FileSeeder>> {
        self.seeders
            .read()
            .map(|seeders| seeders.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn leecher(&self, uuid: &Uuid) -> Option<Arc<FileLeecher>> {
        self.leechers.read().ok()?.get(uuid).cloned()
    }

    pub fn seeder(&self, uuid: &Uuid) -> Option<Arc<FileSeeder>> {
        self.seeders.read().ok()?.get(uuid).cloned()
    }

    fn seeder_for(&self, file: &Arc<SyncFile>) -> Option<Arc<FileSeeder>> {
        let mut seeders = self.seeders.write().ok()?;
        let seeder = seeders.entry(file.uuid()).or_insert_with(|| {
            debug!("Seeding {}", file.uuid());
            Arc::new(FileSeeder::new(
                file.clone(),
                self.outbox.clone(),
                self.metrics.clone(),
                self.config.chunk_timeout(),
            ))
        });
        Some(seeder.clone())
    }

    fn grant(&self, granted: Vec<(Uuid, Uuid)>) {
        for (conn, uuid) in granted {
            debug!("Upload slot granted to {} for {}", conn, uuid);
            self.outbox.send(conn, Message::Authorised { uuid });
        }
    }

    /// `(uuid, pieces received, pieces total)` for every running download.
    pub fn active_downloads(&self) -> Vec<(Uuid, usize, usize)> {
        self.leechers_snapshot()
            .into_iter()
            .filter(|l| !l.is_finished())
            .map(|l| {
                let (done, total) = l.progress();
                (l.uuid(), done, total)
            })
            .collect()
    }

    pub async fn handle_message(&self, from: Uuid, message: Message) -> Result<()> {
        debug!("{:?} from {}", message.kind(), from);
        match message {
            Message::Handshake { .. } | Message::Ping { .. } | Message::Pong { .. } => {
                debug!("Transport message from {} reached the engine", from);
            }
            Message::SendInfo(state) => {
                self.library
                    .update_file_state(state, Some(from), self)
                    .await?;
            }
            Message::AskInfo { uuid } => match self.library.get(&uuid).await {
                Some(file) => {
                    let state = file.file_state(true).await;
                    self.outbox.send(from, Message::SendInfo(state));
                }
                None => debug!("Info asked for unknown file {}", uuid),
            },
            Message::SendLibrary { files } => {
                self.library.update_library(files, Some(from), self).await?;
            }
            Message::AskBitfield { uuid } => self.receive_ask_bitfield(from, uuid).await,
            Message::SendBitfield {
                uuid,
                version,
                bitfield,
            } => match self.leecher(&uuid) {
                Some(leecher) => leecher.receive_bitfield(from, version, bitfield),
                None => debug!("Bitfield for {} without a download", uuid),
            },
            Message::Have { uuid, piece } => {
                if let Some(leecher) = self.leecher(&uuid) {
                    leecher.receive_have(from, piece);
                }
            }
            Message::Interested { uuid, missing } => {
                self.receive_interested(from, uuid, missing).await
            }
            Message::NotInterested { uuid } => {
                if let Some(seeder) = self.seeder(&uuid) {
                    seeder.not_interested(&from);
                }
                let granted = self
                    .slots
                    .lock()
                    .map(|mut slots| slots.release(from, uuid))
                    .unwrap_or_default();
                self.grant(granted);
            }
            Message::AskChunk {
                uuid,
                begin,
                length,
            } => self.receive_ask_chunk(from, uuid, begin, length).await?,
            Message::SendChunk {
                uuid, begin, data, ..
            } => match self.leecher(&uuid) {
                Some(leecher) => leecher.receive_chunk(from, begin, data).await?,
                None => debug!("Chunk for {} without a download", uuid),
            },
            Message::Authorised { uuid } => {
                if let Some(leecher) = self.leecher(&uuid) {
                    leecher.set_authorised(from, true);
                }
            }
            Message::Unauthorised { uuid } => {
                if let Some(leecher) = self.leecher(&uuid) {
                    leecher.set_authorised(from, false);
                }
            }
            Message::Congestion => {
                self.metrics.record_congestion_signal().await;
                self.reduce_worst_leecher(&from);
            }
            Message::AskLibraryLocked {
                request_id,
                library_hash,
            } => {
                let ours = self.library.calculate_hash().await;
                self.outbox.send(
                    from,
                    Message::AnswerLibraryLocked {
                        request_id,
                        locked: self.library.is_locked(),
                        library_hash: ours.clone(),
                    },
                );
                if ours != library_hash {
                    info!("Library differs from {}, sending listing", from);
                    let files = self.library.file_states(false).await;
                    self.outbox.send(from, Message::SendLibrary { files });
                }
            }
            Message::AnswerLibraryLocked {
                request_id,
                locked,
                library_hash,
            } => {
                if library_hash != self.library.calculate_hash().await {
                    debug!("Library of {} differs from ours", from);
                }
                self.receive_lock_answer(from, request_id, locked);
            }
        }
        Ok(())
    }

    async fn receive_ask_bitfield(&self, from: Uuid, uuid: Uuid) {
        let file = match self.library.get(&uuid).await {
            Some(file) => file,
            None => {
                debug!("Bitfield asked for unknown file {}", uuid);
                return;
            }
        };
        let meta = file.copy().metadata();
        let count = crate::storage::piece_count(meta.size, meta.piece_size);
        let removed = file.is_removed().await;
        let (version, bitfield) = match file.status().await {
            FileStatus::Full if !removed => (meta.version, vec![true; count]),
            FileStatus::Downloading => match self.leecher(&uuid) {
                Some(leecher) => (leecher.target_version(), leecher.bitfield()),
                None => (meta.version, vec![false; count]),
            },
            _ => (meta.version, vec![false; count]),
        };
        self.outbox.send(
            from,
            Message::SendBitfield {
                uuid,
                version,
                bitfield,
            },
        );
    }

    async fn receive_interested(&self, from: Uuid, uuid: Uuid, missing: u64) {
        let file = match self.library.get(&uuid).await {
            Some(file) => file,
            None => return,
        };
        if file.is_removed().await {
            return;
        }
        if let Some(seeder) = self.seeder_for(&file) {
            seeder.interested(from, missing);
        }
        let decision = self
            .slots
            .lock()
            .map(|mut slots| slots.request(from, uuid))
            .unwrap_or(SlotDecision::Queued);
        let reply = match decision {
            SlotDecision::Authorised => Message::Authorised { uuid },
            SlotDecision::Queued => Message::Unauthorised { uuid },
        };
        self.outbox.send(from, reply);
    }

    /// Serves a byte range. Fails for a file this node does not know, in which
    /// case nothing is created and nothing is sent.
    pub async fn receive_ask_chunk(
        &self,
        from: Uuid,
        uuid: Uuid,
        begin: u64,
        length: u64,
    ) -> Result<()> {
        let file = self
            .library
            .get(&uuid)
            .await
            .ok_or(SyncError::UnknownFile(uuid))?;
        if file.is_removed().await {
            return Ok(());
        }

        let servable = match file.status().await {
            FileStatus::Full => true,
            FileStatus::Downloading => self
                .leecher(&uuid)
                .map(|l| l.has_range(begin, length))
                .unwrap_or(false),
            FileStatus::Empty => false,
        };
        if !servable {
            debug!("Cannot serve {}+{} of {} yet", begin, length, uuid);
            return Ok(());
        }

        let decision = self
            .slots
            .lock()
            .map(|mut slots| {
                if slots.is_authorised(&from, &uuid) {
                    SlotDecision::Authorised
                } else {
                    slots.request(from, uuid)
                }
            })
            .unwrap_or(SlotDecision::Queued);
        if decision == SlotDecision::Queued {
            self.outbox.send(from, Message::Unauthorised { uuid });
            return Ok(());
        }

        if let Some(seeder) = self.seeder_for(&file) {
            seeder.send_block(from, begin, length).await?;
        }
        Ok(())
    }

    fn sweep_timeouts(&self) {
        let mut finished = Vec::new();
        for leecher in self.leechers_snapshot() {
            if leecher.is_finished() {
                finished.push(leecher.uuid());
            } else {
                leecher.check_request_timeouts();
            }
        }
        if !finished.is_empty() {
            if let Ok(mut leechers) = self.leechers.write() {
                for uuid in finished {
                    leechers.remove(&uuid);
                }
            }
        }
    }

    async fn sweep_rtt(&self) {
        let peers = self
            .slots
            .lock()
            .map(|slots| slots.active_peers())
            .unwrap_or_default();
        let uploading: Vec<Arc<dyn Connection>> = self
            .connections
            .read()
            .map(|connections| {
                peers
                    .iter()
                    .filter_map(|id| connections.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();

        let mut flagged = Vec::new();
        for conn in uploading {
            let rtt = match conn.round_trip_time().await {
                Ok(rtt) => rtt,
                Err(_) => continue,
            };
            let congested = self
                .rtt
                .lock()
                .map(|mut tracker| tracker.observe(conn.id(), rtt))
                .unwrap_or(false);
            if congested {
                flagged.push(conn.id());
            }
        }

        for conn in flagged {
            self.monitor_decrease(conn);
        }
    }

    /// Pieces `conn` still misses across every file it is interested in.
    fn upload_missing(&self, conn: &Uuid) -> u64 {
        self.seeders_snapshot()
            .iter()
            .filter_map(|s| s.missing_for(conn))
            .sum()
    }

    /// Asks upload peers to back off after `flagged` showed congestion.
    pub fn monitor_decrease(&self, flagged: Uuid) {
        let mut ranked = self
            .slots
            .lock()
            .map(|slots| slots.active_peers())
            .unwrap_or_default();
        ranked.sort_by_key(|conn| self.upload_missing(conn));

        let rank = match ranked.iter().position(|c| *c == flagged) {
            Some(rank) => rank,
            None => return,
        };
        let targets = select_congestion_targets(&ranked, rank, &mut rand::thread_rng());
        info!(
            "Congestion on {} (rank {} of {}), signalling {} peers",
            flagged,
            rank,
            ranked.len(),
            targets.len()
        );
        for target in targets {
            self.outbox.send(target, Message::Congestion);
        }
        self.reduce_worst_leecher(&flagged);
    }

    /// Lowers the window of the download with the most requests in flight on `conn`.
    pub fn reduce_worst_leecher(&self, conn: &Uuid) {
        let worst = self
            .leechers_snapshot()
            .into_iter()
            .filter(|l| !l.is_finished() && l.has_connection(conn))
            .max_by_key(|l| l.outstanding_requests(conn));
        if let Some(leecher) = worst {
            if leecher.reduce_requests(conn) {
                debug!("Reduced requests of {} on {}", leecher.uuid(), conn);
            }
        }
    }

    /// Asks every peer whether its library is locked. Fails if any peer is, or
    /// if not every peer answers within the lock timeout.
    pub async fn ask_library_locked(&self) -> Result<()> {
        let pending: HashSet<Uuid> = self.outbox.connections().into_iter().collect();
        if pending.is_empty() {
            return Ok(());
        }

        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        if let Ok(mut requests) = self.lock_requests.lock() {
            requests.insert(
                request_id,
                LockRequest {
                    pending,
                    reply: Some(tx),
                },
            );
        }

        let library_hash = self.library.calculate_hash().await;
        self.outbox.broadcast(Message::AskLibraryLocked {
            request_id,
            library_hash,
        });

        let result = match timeout(self.config.lock_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::ChannelClosed("lock answer".to_string())),
            Err(_) => {
                let missing = self
                    .lock_requests
                    .lock()
                    .ok()
                    .and_then(|r| r.get(&request_id).map(|r| r.pending.len()))
                    .unwrap_or(0);
                Err(SyncError::LockTimeout(format!(
                    "{} peers did not answer",
                    missing
                )))
            }
        };
        if let Ok(mut requests) = self.lock_requests.lock() {
            requests.remove(&request_id);
        }
        result
    }

    fn receive_lock_answer(&self, from: Uuid, request_id: Uuid, locked: bool) {
        let mut requests = match self.lock_requests.lock() {
            Ok(requests) => requests,
            Err(_) => return,
        };
        let request = match requests.get_mut(&request_id) {
            Some(request) => request,
            None => {
                debug!("Late lock answer {} from {}", request_id, from);
                return;
            }
        };
        if locked {
            if let Some(reply) = request.reply.take() {
                let _ = reply.send(Err(SyncError::LibraryLocked(from.to_string())));
            }
            return;
        }
        request.pending.remove(&from);
        if request.pending.is_empty() {
            if let Some(reply) = request.reply.take() {
                let _ = reply.send(Ok(()));
            }
        }
    }

    pub fn shutdown(&self) {
        if let Ok(mut loops) = self.loops.lock() {
            for handle in loops.drain(..) {
                handle.abort();
            }
        }
        for leecher in self.leechers_snapshot() {
            leecher.shutdown();
        }
        for id in self.connection_ids() {
            self.remove_connection(&id);
        }
        info!("File transfer stopped");
    }
}

#[async_trait]
impl MessageProcessor for FileTransfer {
    async fn process(&self, envelope: MessageEnvelope) -> Result<()> {
        self.handle_message(envelope.from, envelope.message).await
    }
}

#[async_trait]
impl SyncHooks for FileTransfer {
    async fn broadcast(&self, message: Message) {
        self.outbox.broadcast(message);
    }

    async fn send_to(&self, conn: Uuid, message: Message) {
        self.outbox.send(conn, message);
    }

    async fn init_leecher(&self, file: Arc<SyncFile>, state: FileState) -> Result<()> {
        let uuid = file.uuid();
        if let Some(existing) = self.leecher(&uuid) {
            if !existing.is_finished() {
                if let Err(e) = existing.update_leeching(state).await {
                    existing.shutdown();
                    return Err(e);
                }
                return Ok(());
            }
        }

        let leecher = FileLeecher::new(
            file,
            state,
            self.outbox.clone(),
            self.config.clone(),
            self.metrics.clone(),
            self.events.clone(),
        );
        if leecher.start().await? {
            return leecher.end_download().await;
        }

        if let Ok(mut leechers) = self.leechers.write() {
            if let Some(old) = leechers.insert(uuid, leecher.clone()) {
                old.shutdown();
            }
        }
        for conn in self.outbox.connections() {
            leecher.add_connection(conn);
        }
        Ok(())
    }

    async fn remove_leecher(&self, uuid: Uuid) {
        let removed = self
            .leechers
            .write()
            .ok()
            .and_then(|mut leechers| leechers.remove(&uuid));
        if let Some(leecher) = removed {
            leecher.shutdown();
            info!("Download of {} cancelled", uuid);
        }
    }

    async fn notify(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    struct Sink {
        id: Uuid,
        seen: Arc<Mutex<Vec<Message>>>,
    }

    #[async_trait]
    impl Connection for Sink {
        fn id(&self) -> Uuid {
            self.id
        }

        async fn send_message(&self, message: Message) -> Result<()> {
            self.seen.lock().unwrap().push(message);
            Ok(())
        }

        fn local_address(&self) -> Option<SocketAddr> {
            None
        }

        fn remote_address(&self) -> Option<SocketAddr> {
            None
        }

        async fn round_trip_time(&self) -> Result<Duration> {
            Ok(Duration::from_millis(1))
        }
    }

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

    async fn sink(transfer: &FileTransfer) -> (Uuid, Arc<Mutex<Vec<Message>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let id = Uuid::new_v4();
        transfer
            .add_connection(Arc::new(Sink {
                id,
                seen: seen.clone(),
            }))
            .await
            .unwrap();
        (id, seen)
    }

    #[tokio::test]
    async fn test_new_connection_gets_library_listing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let transfer = transfer(dir.path()).await;
        transfer.library().scan(transfer.as_ref()).await.unwrap();

        let (_, seen) = sink(&transfer).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let seen = seen.lock().unwrap();
        assert!(matches!(&seen[0], Message::SendLibrary { files } if files.len() == 1));
    }

    #[tokio::test]
    async fn test_chunk_for_unknown_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = transfer(dir.path()).await;
        let (id, seen) = sink(&transfer).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let before = seen.lock().unwrap().len();

        let unknown = Uuid::new_v4();
        let result = transfer.receive_ask_chunk(id, unknown, 0, 16_384).await;
        assert!(matches!(result, Err(SyncError::UnknownFile(u)) if u == unknown));
        assert!(transfer.seeder(&unknown).is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().unwrap().len(), before);
    }

    #[tokio::test]
    async fn test_upload_slots_limit_served_peers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), vec![1u8; 1000]).unwrap();
        let library = Arc::new(
            FileLibrary::load(dir.path().to_path_buf(), Duration::from_secs(5))
                .await
                .unwrap(),
        );
        let config = TransferConfig {
            max_upload_peers: 1,
            ..TransferConfig::default()
        };
        let (transfer, _events) =
            FileTransfer::new(library, config, Arc::new(MetricsCollector::new(None)));
        transfer.library().scan(transfer.as_ref()).await.unwrap();
        let uuid = transfer.library().get_by_path("a.txt").await.unwrap().uuid();

        let (a, seen_a) = sink(&transfer).await;
        let (b, seen_b) = sink(&transfer).await;
        transfer
            .handle_message(a, Message::Interested { uuid, missing: 1 })
            .await
            .unwrap();
        transfer
            .handle_message(b, Message::Interested { uuid, missing: 1 })
            .await
            .unwrap();
        transfer.receive_ask_chunk(b, uuid, 0, 1000).await.unwrap();
        transfer
            .handle_message(a, Message::NotInterested { uuid })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(seen_a.lock().unwrap().contains(&Message::Authorised { uuid }));
        let seen_b = seen_b.lock().unwrap();
        assert!(seen_b.contains(&Message::Unauthorised { uuid }));
        assert!(!seen_b.iter().any(|m| matches!(m, Message::SendChunk { .. })));
        assert_eq!(seen_b.last(), Some(&Message::Authorised { uuid }));
    }

    #[tokio::test]
    async fn test_ask_bitfield_for_full_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), vec![2u8; 600 * 1024]).unwrap();
        let transfer = transfer(dir.path()).await;
        transfer.library().scan(transfer.as_ref()).await.unwrap();
        let uuid = transfer.library().get_by_path("a.bin").await.unwrap().uuid();
        let (id, seen) = sink(&transfer).await;

        transfer
            .handle_message(id, Message::AskBitfield { uuid })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(seen.lock().unwrap().contains(&Message::SendBitfield {
            uuid,
            version: 1,
            bitfield: vec![true; 3],
        }));
    }

    #[tokio::test]
    async fn test_lock_answer_reports_divergence() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = transfer(dir.path()).await;
        let (id, seen) = sink(&transfer).await;
        let request_id = Uuid::new_v4();

        transfer
            .handle_message(
                id,
                Message::AskLibraryLocked {
                    request_id,
                    library_hash: "other".to_string(),
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|m| matches!(
            m,
            Message::AnswerLibraryLocked { request_id: r, locked: false, .. } if *r == request_id
        )));
        assert!(matches!(seen.last(), Some(Message::SendLibrary { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_times_out_without_answers() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = transfer(dir.path()).await;
        sink(&transfer).await;

        let result = transfer.ask_library_locked().await;
        assert!(matches!(result, Err(SyncError::LockTimeout(_))));
    }
}
