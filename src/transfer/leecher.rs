//! Download side for one file.
//!
//! Keeps one window controller per connection, how many peers hold each piece,
//! and which pieces are received or requested. Pieces whose last attempt failed
//! go into a priority set and are retried before anything else.

use log::{debug, info, warn};
use rand::seq::SliceRandom;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::core::{FileState, Message, TransferConfig};
use crate::network::Outbox;
use crate::storage::{
    piece_count, piece_length, FileMetadata, HashUtils, SyncFile, MAX_PIECE_SIZE, MIN_PIECE_SIZE,
};
use crate::transfer::{ConnectionInfo, Piece, TransferEvent};
use crate::utils::{MetricsCollector, Result, SyncError};

/// Rejects an announced layout whose pieces cannot add up to the announced file.
fn check_layout(target: &FileState, hash_map: &[String]) -> Result<()> {
    let invalid = |reason: String| Err(SyncError::InvalidLayout(target.uuid, reason));
    if !(MIN_PIECE_SIZE..=MAX_PIECE_SIZE).contains(&target.piece_size) {
        return invalid(format!("piece size {}", target.piece_size));
    }
    let expected = piece_count(target.size, target.piece_size);
    if hash_map.len() != expected {
        return invalid(format!("{} piece hashes for {} pieces", hash_map.len(), expected));
    }
    if HashUtils::hash_piece_hashes(hash_map) != target.hash {
        return invalid("file hash does not match its piece hashes".to_string());
    }
    Ok(())
}

struct LeechState {
    target: FileState,
    hash_map: Vec<String>,
    blocks_per_piece: usize,
    connections: HashMap<Uuid, Arc<ConnectionInfo>>,
    peer_pieces: HashMap<Uuid, Vec<bool>>,
    rarity: Vec<u32>,
    received: Vec<bool>,
    requested: Vec<bool>,
    priority: BTreeSet<usize>,
    in_progress: HashMap<usize, Piece>,
    finishing: bool,
    finished: bool,
}

impl LeechState {
    fn for_target(target: FileState, block_size: u64) -> Self {
        let hash_map = target.hash_map.clone().unwrap_or_default();
        let count = hash_map.len();
        let blocks_per_piece = target.piece_size.div_ceil(block_size.max(1)).max(1) as usize;
        Self {
            target,
            hash_map,
            blocks_per_piece,
            connections: HashMap::new(),
            peer_pieces: HashMap::new(),
            rarity: vec![0; count],
            received: vec![false; count],
            requested: vec![false; count],
            priority: BTreeSet::new(),
            in_progress: HashMap::new(),
            finishing: false,
            finished: false,
        }
    }

    fn piece_count(&self) -> usize {
        self.hash_map.len()
    }

    fn missing(&self) -> u64 {
        self.received.iter().filter(|r| !**r).count() as u64
    }

    fn is_complete(&self) -> bool {
        self.received.iter().all(|r| *r)
    }

    fn peer_has_wanted(&self, conn: &Uuid) -> bool {
        self.peer_pieces
            .get(conn)
            .map(|bits| bits.iter().zip(&self.received).any(|(has, got)| *has && !*got))
            .unwrap_or(false)
    }

    /// Priority retries first, then the rarest piece nobody requested yet with
    /// ties broken at random.
    fn select_piece(&mut self, conn: &Uuid) -> Option<usize> {
        let bits = self.peer_pieces.get(conn)?;

        let retry = self
            .priority
            .iter()
            .copied()
            .find(|i| bits.get(*i).copied().unwrap_or(false) && !self.received[*i]
                && !self.in_progress.contains_key(i));
        if let Some(index) = retry {
            self.priority.remove(&index);
            return Some(index);
        }

        let candidates: Vec<usize> = (0..self.piece_count())
            .filter(|i| bits.get(*i).copied().unwrap_or(false))
            .filter(|i| !self.received[*i] && !self.requested[*i])
            .collect();
        let rarest = candidates.iter().map(|i| self.rarity[*i]).min()?;
        let ties: Vec<usize> = candidates
            .into_iter()
            .filter(|i| self.rarity[*i] == rarest)
            .collect();
        ties.choose(&mut rand::thread_rng()).copied()
    }

    fn requeue(&mut self, index: usize) {
        self.requested[index] = false;
        self.priority.insert(index);
    }
}

pub struct FileLeecher {
    uuid: Uuid,
    file: Arc<SyncFile>,
    outbox: Arc<Outbox>,
    config: TransferConfig,
    metrics: Arc<MetricsCollector>,
    events: mpsc::UnboundedSender<TransferEvent>,
    state: Mutex<LeechState>,
    self_ref: Weak<FileLeecher>,
}

impl FileLeecher {
    pub fn new(
        file: Arc<SyncFile>,
        target: FileState,
        outbox: Arc<Outbox>,
        config: TransferConfig,
        metrics: Arc<MetricsCollector>,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Arc<Self> {
        let state = LeechState::for_target(target, config.block_size);
        Arc::new_cyclic(|self_ref| Self {
            uuid: file.uuid(),
            file,
            outbox,
            config,
            metrics,
            events,
            state: Mutex::new(state),
            self_ref: self_ref.clone(),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn lock(&self) -> MutexGuard<'_, LeechState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Prepares the staging copy, keeping every piece it already holds.
    /// Returns true when nothing is left to download.
    pub async fn start(&self) -> Result<bool> {
        let (target, hash_map) = {
            let state = self.lock();
            (state.target.clone(), state.hash_map.clone())
        };
        check_layout(&target, &hash_map)?;

        let copy = self.file.copy();
        let local = if copy.exists() {
            copy.calculate_hash_map(target.piece_size)
                .await
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        copy.set_len(target.size).await?;
        copy.set_metadata(FileMetadata {
            size: target.size,
            piece_size: target.piece_size,
            hash_map: hash_map.clone(),
            hash: target.hash.clone(),
            version: target.version,
        });

        let mut state = self.lock();
        let mut reused = 0;
        for (i, expected) in hash_map.iter().enumerate() {
            if local.get(i) == Some(expected) {
                state.received[i] = true;
                state.requested[i] = true;
                reused += 1;
            }
        }
        info!(
            "Leeching {} v{}: {} pieces, {} already local",
            target.path,
            target.version,
            hash_map.len(),
            reused
        );
        Ok(state.is_complete())
    }

    fn new_connection_info(&self, conn: Uuid, blocks_per_piece: usize) -> Arc<ConnectionInfo> {
        let weak = self.self_ref.clone();
        Arc::new(
            ConnectionInfo::new(conn, blocks_per_piece, &self.config).with_on_available(Arc::new(
                move || {
                    if let Some(leecher) = weak.upgrade() {
                        leecher.download_next_pieces(conn);
                    }
                },
            )),
        )
    }

    pub fn add_connection(&self, conn: Uuid) {
        {
            let mut state = self.lock();
            if state.finished || state.connections.contains_key(&conn) {
                return;
            }
            let info = self.new_connection_info(conn, state.blocks_per_piece);
            state.connections.insert(conn, info);
        }
        self.outbox.send(conn, Message::AskBitfield { uuid: self.uuid });
    }

    /// Forgets a connection; pieces it was fetching move to the priority set.
    pub fn remove_connection(&self, conn: &Uuid) {
        let mut state = self.lock();
        if let Some(info) = state.connections.remove(conn) {
            info.shutdown();
        }
        if let Some(bits) = state.peer_pieces.remove(conn) {
            for (i, has) in bits.iter().enumerate() {
                if *has {
                    state.rarity[i] = state.rarity[i].saturating_sub(1);
                }
            }
        }
        let orphaned: Vec<usize> = state
            .in_progress
            .iter()
            .filter(|(_, piece)| piece.conn() == *conn)
            .map(|(index, _)| *index)
            .collect();
        for index in orphaned {
            state.in_progress.remove(&index);
            state.requeue(index);
        }
    }

    pub fn receive_bitfield(&self, conn: Uuid, version: u64, bitfield: Vec<bool>) {
        let interested = {
            let mut state = self.lock();
            if state.finished {
                return;
            }
            if version != state.target.version {
                debug!(
                    "Ignoring v{} bitfield for {} from {} (leeching v{})",
                    version, self.uuid, conn, state.target.version
                );
                return;
            }
            if bitfield.len() != state.piece_count() {
                warn!(
                    "Bitfield for {} from {} has {} entries, expected {}",
                    self.uuid,
                    conn,
                    bitfield.len(),
                    state.piece_count()
                );
                return;
            }
            if !state.connections.contains_key(&conn) {
                let info = self.new_connection_info(conn, state.blocks_per_piece);
                state.connections.insert(conn, info);
            }
            if let Some(old) = state.peer_pieces.insert(conn, bitfield.clone()) {
                for (i, has) in old.iter().enumerate() {
                    if *has {
                        state.rarity[i] = state.rarity[i].saturating_sub(1);
                    }
                }
            }
            for (i, has) in bitfield.iter().enumerate() {
                if *has {
                    state.rarity[i] += 1;
                }
            }
            state
                .peer_has_wanted(&conn)
                .then(|| state.missing())
        };

        if let Some(missing) = interested {
            self.outbox.send(
                conn,
                Message::Interested {
                    uuid: self.uuid,
                    missing,
                },
            );
            self.download_next_pieces(conn);
        }
    }

    pub fn receive_have(&self, conn: Uuid, piece: usize) {
        let newly_interested = {
            let mut state = self.lock();
            if state.finished || piece >= state.piece_count() {
                return;
            }
            let count = state.piece_count();
            let was_interested = state.peer_has_wanted(&conn);
            let bits = state
                .peer_pieces
                .entry(conn)
                .or_insert_with(|| vec![false; count]);
            if bits[piece] {
                return;
            }
            bits[piece] = true;
            state.rarity[piece] += 1;
            if !state.connections.contains_key(&conn) {
                let info = self.new_connection_info(conn, state.blocks_per_piece);
                state.connections.insert(conn, info);
            }
            (!was_interested && !state.received[piece]).then(|| state.missing())
        };

        if let Some(missing) = newly_interested {
            self.outbox.send(
                conn,
                Message::Interested {
                    uuid: self.uuid,
                    missing,
                },
            );
        }
        self.download_next_pieces(conn);
    }

    pub fn set_authorised(&self, conn: Uuid, authorised: bool) {
        let info = self.lock().connections.get(&conn).cloned();
        if let Some(info) = info {
            info.set_authorised(authorised);
            debug!(
                "{} {} for {}",
                conn,
                if authorised { "authorised" } else { "unauthorised" },
                self.uuid
            );
            if authorised {
                self.download_next_pieces(conn);
            }
        }
    }

    /// Fills the connection's window, continuing its own pieces before
    /// starting new ones.
    pub fn download_next_pieces(&self, conn: Uuid) {
        let mut requests = Vec::new();
        {
            let mut state = self.lock();
            if state.finished {
                return;
            }
            let info = match state.connections.get(&conn) {
                Some(info) => info.clone(),
                None => return,
            };

            while info.can_request_block() {
                let current = state
                    .in_progress
                    .iter()
                    .filter(|(_, piece)| piece.conn() == conn && piece.has_unrequested())
                    .map(|(index, _)| *index)
                    .min();
                let index = match current {
                    Some(index) => index,
                    None => match state.select_piece(&conn) {
                        Some(index) => {
                            let piece_size = state.target.piece_size;
                            let size = state.target.size;
                            let piece = Piece::new(
                                index,
                                conn,
                                index as u64 * piece_size,
                                piece_length(size, piece_size, index),
                                self.config.block_size,
                                state.hash_map[index].clone(),
                            );
                            state.requested[index] = true;
                            state.in_progress.insert(index, piece);
                            index
                        }
                        None => break,
                    },
                };

                let batch = match state.in_progress.get_mut(&index) {
                    Some(piece) => piece.next_block_requests(&info).0,
                    None => break,
                };
                if batch.is_empty() {
                    break;
                }
                requests.extend(batch);
            }
        }

        for request in requests {
            self.outbox.send(
                conn,
                Message::chunk_request(self.uuid, request.begin, request.length),
            );
        }
    }

    pub async fn receive_chunk(&self, conn: Uuid, begin: u64, data: Vec<u8>) -> Result<()> {
        let len = data.len() as u64;
        let completed = {
            let mut state = self.lock();
            if state.finished || state.target.piece_size == 0 {
                return Ok(());
            }
            let index = (begin / state.target.piece_size) as usize;
            let piece = match state.in_progress.get_mut(&index) {
                Some(piece) => piece,
                None => {
                    debug!("Unexpected chunk {}+{} for {} from {}", begin, len, self.uuid, conn);
                    return Ok(());
                }
            };
            let receipt = piece.receive(begin, &data);
            let owner = piece.conn();
            if receipt.answered {
                if let Some(info) = state.connections.get(&owner) {
                    info.update_nb_answer();
                }
            }
            if receipt.complete {
                state.in_progress.remove(&index)
            } else {
                None
            }
        };
        self.metrics.record_chunk_downloaded(conn, len).await;

        if let Some(piece) = completed {
            let index = piece.index();
            if !piece.verify() {
                warn!(
                    "Piece {} of {} from {} failed verification, retrying",
                    index, self.uuid, conn
                );
                self.metrics.record_piece_corrupted().await;
                self.lock().requeue(index);
            } else {
                self.file.write_chunk(piece.data(), piece.offset()).await?;
                self.metrics.record_piece_verified().await;
                let done = {
                    let mut state = self.lock();
                    state.received[index] = true;
                    state.is_complete()
                };
                self.outbox.broadcast(Message::Have {
                    uuid: self.uuid,
                    piece: index,
                });
                if done {
                    self.end_download().await?;
                    return Ok(());
                }
            }
        }

        self.download_next_pieces(conn);
        Ok(())
    }

    /// Re-verifies the whole copy. Mismatched pieces are fetched again;
    /// otherwise the copy is published and everyone is told we are done.
    pub async fn end_download(&self) -> Result<()> {
        let (target, hash_map) = {
            let mut state = self.lock();
            if state.finished || state.finishing {
                return Ok(());
            }
            state.finishing = true;
            (state.target.clone(), state.hash_map.clone())
        };
        let piece_size = target.piece_size;
        if let Err(e) = check_layout(&target, &hash_map) {
            warn!("Abandoning download of {}: {}", self.uuid, e);
            self.shutdown();
            self.file.abort_download().await?;
            return Err(e);
        }

        let local = self.file.copy().calculate_hash_map(piece_size).await?;
        let mismatched: Vec<usize> = hash_map
            .iter()
            .enumerate()
            .filter(|(i, expected)| local.get(*i) != Some(*expected))
            .map(|(i, _)| i)
            .collect();

        if !mismatched.is_empty() {
            warn!(
                "{} pieces of {} differ on disk, fetching them again",
                mismatched.len(),
                self.uuid
            );
            let conns: Vec<Uuid> = {
                let mut state = self.lock();
                state.finishing = false;
                for index in &mismatched {
                    state.received[*index] = false;
                    state.requeue(*index);
                }
                state.connections.keys().copied().collect()
            };
            for conn in conns {
                self.download_next_pieces(conn);
            }
            return Ok(());
        }

        self.file.finish_download().await?;
        let conns: Vec<Uuid> = {
            let mut state = self.lock();
            state.finished = true;
            state.in_progress.clear();
            for info in state.connections.values() {
                info.shutdown();
            }
            state.connections.keys().copied().collect()
        };
        for conn in conns {
            self.outbox
                .send(conn, Message::NotInterested { uuid: self.uuid });
        }
        self.metrics.record_file_downloaded().await;
        let _ = self.events.send(TransferEvent::DownloadFinished {
            uuid: self.uuid,
            path: self.file.rel_path(),
        });
        Ok(())
    }

    /// Gives up on stale requests and lowers the window of every connection
    /// that entered a new timeout episode.
    pub fn check_request_timeouts(&self) {
        let now = Instant::now();
        let timeout = self.config.chunk_timeout();
        let grace = self.config.retry_grace();

        let touched: Vec<Uuid> = {
            let mut state = self.lock();
            if state.finished {
                return;
            }
            let mut episodes: HashMap<Uuid, bool> = HashMap::new();
            let mut aborted = Vec::new();
            let mut abandoned: HashMap<Uuid, usize> = HashMap::new();

            for (index, piece) in state.in_progress.iter_mut() {
                let report = piece.check_request_timeout(now, timeout, grace);
                let entry = episodes.entry(piece.conn()).or_insert(false);
                *entry |= report.new_episode;
                *abandoned.entry(piece.conn()).or_insert(0) += report.reissued;
                if report.aborted {
                    aborted.push((*index, piece.conn()));
                }
            }
            for (index, conn) in aborted {
                state.in_progress.remove(&index);
                state.requeue(index);
                *abandoned.entry(conn).or_insert(0) += 1;
            }

            for (conn, count) in &abandoned {
                if let Some(info) = state.connections.get(conn) {
                    for _ in 0..*count {
                        info.request_abandoned();
                    }
                }
            }
            for (conn, new_episode) in &episodes {
                if *new_episode {
                    if let Some(info) = state.connections.get(conn) {
                        if info.decrease_level() {
                            debug!("Request timeout on {} for {}", conn, self.uuid);
                        }
                    }
                }
            }
            state.connections.keys().copied().collect()
        };

        for conn in touched {
            self.download_next_pieces(conn);
        }
    }

    /// Congestion signal from `conn`.
    pub fn reduce_requests(&self, conn: &Uuid) -> bool {
        let info = self.lock().connections.get(conn).cloned();
        info.map(|info| info.decrease_level()).unwrap_or(false)
    }

    /// Switches to a newer version announced mid-download. All per-piece and
    /// per-connection state for the old hash map is dropped.
    pub async fn update_leeching(&self, target: FileState) -> Result<bool> {
        let conns: Vec<Uuid> = {
            let mut state = self.lock();
            let conns: Vec<Uuid> = state.connections.keys().copied().collect();
            for info in state.connections.values() {
                info.shutdown();
            }
            *state = LeechState::for_target(target, self.config.block_size);
            conns
        };
        let complete = self.start().await?;
        if complete {
            self.end_download().await?;
            return Ok(true);
        }
        for conn in conns {
            self.add_connection(conn);
        }
        Ok(false)
    }

    pub fn outstanding_requests(&self, conn: &Uuid) -> usize {
        self.lock()
            .connections
            .get(conn)
            .map(|info| info.in_flight())
            .unwrap_or(0)
    }

    pub fn window(&self, conn: &Uuid) -> Option<usize> {
        self.lock().connections.get(conn).map(|info| info.window())
    }

    pub fn has_connection(&self, conn: &Uuid) -> bool {
        self.lock().connections.contains_key(conn)
    }

    /// True when every piece overlapping `[begin, begin + length)` is on disk.
    pub fn has_range(&self, begin: u64, length: u64) -> bool {
        let state = self.lock();
        let piece_size = state.target.piece_size;
        let end = match begin.checked_add(length) {
            Some(end) if length > 0 && piece_size > 0 && end <= state.target.size => end,
            _ => return false,
        };
        let first = (begin / piece_size) as usize;
        let last = ((end - 1) / piece_size) as usize;
        (first..=last).all(|i| state.received.get(i).copied().unwrap_or(false))
    }

    pub fn bitfield(&self) -> Vec<bool> {
        self.lock().received.clone()
    }

    pub fn missing(&self) -> u64 {
        self.lock().missing()
    }

    pub fn progress(&self) -> (usize, usize) {
        let state = self.lock();
        (
            state.received.iter().filter(|r| **r).count(),
            state.piece_count(),
        )
    }

    pub fn target_version(&self) -> u64 {
        self.lock().target.version
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.finished = true;
        for info in state.connections.values() {
            info.shutdown();
        }
        state.in_progress.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Operation, OperationKind};
    use crate::network::Connection;
    use crate::storage::sync_file::tests::RecordingHooks;
    use crate::storage::{piece_size_for, FileStatus};
    use async_trait::async_trait;
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

    fn content(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i % 251) as u8).collect()
    }

    fn target_for(uuid: Uuid, data: &[u8]) -> FileState {
        let piece_size = piece_size_for(data.len() as u64);
        let hash_map: Vec<String> = data
            .chunks(piece_size as usize)
            .map(HashUtils::hash_data)
            .collect();
        let hash = HashUtils::hash_piece_hashes(&hash_map);
        FileState {
            uuid,
            name: "f.bin".to_string(),
            path: "f.bin".to_string(),
            hash: hash.clone(),
            version: 1,
            size: data.len() as u64,
            piece_size,
            last_operation: Operation::new(OperationKind::Create, "f.bin", None, 1, hash),
            hash_map: Some(hash_map),
        }
    }

    struct Fixture {
        leecher: Arc<FileLeecher>,
        conn: Uuid,
        seen: Arc<Mutex<Vec<Message>>>,
        events: mpsc::UnboundedReceiver<TransferEvent>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(data: &[u8]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let uuid = Uuid::new_v4();
        let file = Arc::new(SyncFile::new_remote(
            uuid,
            root,
            &root.join(".sync"),
            "f.bin",
            Duration::from_secs(5),
        ));
        let outbox = Arc::new(Outbox::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let conn = Uuid::new_v4();
        outbox.register(Arc::new(Sink {
            id: conn,
            seen: seen.clone(),
        }));
        let (tx, events) = mpsc::unbounded_channel();
        let leecher = FileLeecher::new(
            file,
            target_for(uuid, data),
            outbox,
            TransferConfig::default(),
            Arc::new(MetricsCollector::new(None)),
            tx,
        );
        assert!(!leecher.start().await.unwrap());
        Fixture {
            leecher,
            conn,
            seen,
            events,
            _dir: dir,
        }
    }

    fn chunk_requests(seen: &Arc<Mutex<Vec<Message>>>) -> Vec<(u64, u64)> {
        seen.lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                Message::AskChunk { begin, length, .. } => Some((*begin, *length)),
                _ => None,
            })
            .collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_download_from_single_peer() {
        let data = content(600 * 1024);
        let mut fx = fixture(&data).await;
        let pieces = fx.leecher.bitfield().len();
        assert_eq!(pieces, 3);

        fx.leecher.add_connection(fx.conn);
        fx.leecher.receive_bitfield(fx.conn, 1, vec![true; pieces]);

        let mut served = std::collections::HashSet::new();
        for _ in 0..500 {
            settle().await;
            let pending: Vec<(u64, u64)> = chunk_requests(&fx.seen)
                .into_iter()
                .filter(|r| served.insert(*r))
                .collect();
            if pending.is_empty() {
                break;
            }
            for (begin, length) in pending {
                let slice = data[begin as usize..(begin + length) as usize].to_vec();
                fx.leecher.receive_chunk(fx.conn, begin, slice).await.unwrap();
            }
        }

        assert!(fx.leecher.is_finished());
        assert!(matches!(
            fx.events.try_recv(),
            Ok(TransferEvent::DownloadFinished { .. })
        ));
        let written = std::fs::read(fx._dir.path().join("f.bin")).unwrap();
        assert_eq!(written, data);
    }

    #[tokio::test]
    async fn test_corrupt_piece_goes_to_priority_set() {
        let data = content(32 * 1024);
        let fx = fixture(&data).await;
        fx.leecher.add_connection(fx.conn);
        fx.leecher.receive_bitfield(fx.conn, 1, vec![true]);
        settle().await;

        let requests = chunk_requests(&fx.seen);
        assert_eq!(requests.len(), 2);
        for (begin, length) in requests {
            fx.leecher
                .receive_chunk(fx.conn, begin, vec![0xFF; length as usize])
                .await
                .unwrap();
        }
        settle().await;

        // The piece was dropped and immediately requested again.
        assert_eq!(chunk_requests(&fx.seen).len(), 4);
        assert_eq!(fx.leecher.bitfield(), vec![false]);
        assert_eq!(fx.leecher.metrics.get_metrics().await.pieces_corrupted, 1);
        assert!(!fx.leecher.is_finished());
    }

    #[test]
    fn test_rarest_piece_first() {
        let data = content(1024 * 1024);
        let mut state = LeechState::for_target(target_for(Uuid::new_v4(), &data), 16 * 1024);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        // Pieces 0-2 are held by both peers, piece 3 only by `a`.
        state.peer_pieces.insert(a, vec![true; 4]);
        state.peer_pieces.insert(b, vec![true, true, true, false]);
        state.rarity = vec![2, 2, 2, 1];
        assert_eq!(state.select_piece(&a), Some(3));

        // A failed piece is retried before rarer ones.
        state.requeue(1);
        assert_eq!(state.select_piece(&a), Some(1));
        assert!(state.priority.is_empty());

        state.requested[3] = true;
        let picked = state.select_piece(&b).unwrap();
        assert!(picked < 3);
    }

    #[tokio::test]
    async fn test_local_pieces_are_reused() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let data = content(600 * 1024);
        let uuid = Uuid::new_v4();
        let staging = root.join(".sync");
        std::fs::create_dir_all(&staging).unwrap();

        // The staging copy already has the first piece of the new content.
        let mut old = data.clone();
        for b in old[300 * 1024..].iter_mut() {
            *b = 0;
        }
        std::fs::write(staging.join(format!("{}.data", uuid)), &old).unwrap();

        let file = Arc::new(SyncFile::new_remote(
            uuid,
            root,
            &staging,
            "f.bin",
            Duration::from_secs(5),
        ));
        let (tx, _rx) = mpsc::unbounded_channel();
        let leecher = FileLeecher::new(
            file,
            target_for(uuid, &data),
            Arc::new(Outbox::new()),
            TransferConfig::default(),
            Arc::new(MetricsCollector::new(None)),
            tx,
        );
        assert!(!leecher.start().await.unwrap());
        assert_eq!(leecher.bitfield(), vec![true, false, false]);
        assert!(leecher.has_range(0, 1024));
        assert!(!leecher.has_range(256 * 1024, 10));
    }

    fn standalone(file: Arc<SyncFile>, target: FileState) -> Arc<FileLeecher> {
        let (tx, _rx) = mpsc::unbounded_channel();
        FileLeecher::new(
            file,
            target,
            Arc::new(Outbox::new()),
            TransferConfig::default(),
            Arc::new(MetricsCollector::new(None)),
            tx,
        )
    }

    #[tokio::test]
    async fn test_inconsistent_layout_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let data = content(300 * 1024);
        let uuid = Uuid::new_v4();
        let file = Arc::new(SyncFile::new_remote(
            uuid,
            root,
            &root.join(".sync"),
            "f.bin",
            Duration::from_secs(5),
        ));

        let mut short_hash = target_for(uuid, &data);
        short_hash.hash = "abc".to_string();
        let result = standalone(file.clone(), short_hash).start().await;
        assert!(matches!(result, Err(SyncError::InvalidLayout(u, _)) if u == uuid));

        let mut missing_piece = target_for(uuid, &data);
        if let Some(map) = missing_piece.hash_map.as_mut() {
            map.pop();
        }
        missing_piece.hash = HashUtils::hash_piece_hashes(missing_piece.hash_map.as_ref().unwrap());
        assert!(standalone(file.clone(), missing_piece).start().await.is_err());

        let mut huge_pieces = target_for(uuid, &data);
        huge_pieces.piece_size = u64::MAX;
        assert!(standalone(file, huge_pieces).start().await.is_err());
    }

    #[tokio::test]
    async fn test_end_download_rejects_wrong_file_hash() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let data = content(32 * 1024);
        let uuid = Uuid::new_v4();
        let file = Arc::new(SyncFile::new_remote(
            uuid,
            root,
            &root.join(".sync"),
            "f.bin",
            Duration::from_secs(5),
        ));
        let target = target_for(uuid, &data);
        file.apply_operation_from_other(target.clone(), None, &RecordingHooks::default())
            .await
            .unwrap();
        assert_eq!(file.status().await, FileStatus::Downloading);

        let leecher = standalone(file.clone(), target);
        assert!(!leecher.start().await.unwrap());
        leecher.lock().target.hash = "abc".to_string();

        let result = leecher.end_download().await;
        assert!(matches!(result, Err(SyncError::InvalidLayout(u, _)) if u == uuid));
        assert!(leecher.is_finished());
        assert_eq!(file.status().await, FileStatus::Empty);
        assert!(!root.join("f.bin").exists());
    }

    #[tokio::test]
    async fn test_has_range_with_overflowing_request() {
        let fx = fixture(&content(300 * 1024)).await;
        assert!(!fx.leecher.has_range(1, u64::MAX));
        assert!(!fx.leecher.has_range(u64::MAX, 1));
        assert!(!fx.leecher.has_range(0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_decreases_once_per_episode() {
        let data = content(300 * 1024);
        let fx = fixture(&data).await;
        fx.leecher.add_connection(fx.conn);
        fx.leecher.receive_bitfield(fx.conn, 1, vec![true, true]);
        settle().await;
        let first_wave = chunk_requests(&fx.seen).len();
        assert_eq!(first_wave, 4);
        let info = fx.leecher.lock().connections.get(&fx.conn).cloned().unwrap();
        assert_eq!(info.window(), 4);

        tokio::time::advance(Duration::from_millis(1_100)).await;
        fx.leecher.check_request_timeouts();
        assert_eq!(info.window(), 2);
        tokio::time::advance(Duration::from_millis(1_000)).await;
        fx.leecher.check_request_timeouts();
        assert_eq!(info.window(), 2);
        assert_eq!(info.in_flight(), 4);

        tokio::time::advance(Duration::from_millis(2_000)).await;
        fx.leecher.check_request_timeouts();
        settle().await;
        // All four blocks were given up and two of them re-requested.
        let requests = chunk_requests(&fx.seen);
        assert_eq!(requests.len(), 6);
        assert_eq!(info.in_flight(), 2);
    }
}
