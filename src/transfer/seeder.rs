use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::core::Message;
use crate::network::Outbox;
use crate::storage::SyncFile;
use crate::utils::{MetricsCollector, Result};

#[derive(Default)]
struct SeedState {
    recent: HashMap<(Uuid, u64, u64), Instant>,
    interested: HashMap<Uuid, u64>,
}

/// Serving side for one file. Identical requests from the same peer within the
/// dedup window are answered once.
pub struct FileSeeder {
    uuid: Uuid,
    file: Arc<SyncFile>,
    outbox: Arc<Outbox>,
    metrics: Arc<MetricsCollector>,
    dedup_window: Duration,
    state: Mutex<SeedState>,
}

impl FileSeeder {
    pub fn new(
        file: Arc<SyncFile>,
        outbox: Arc<Outbox>,
        metrics: Arc<MetricsCollector>,
        dedup_window: Duration,
    ) -> Self {
        Self {
            uuid: file.uuid(),
            file,
            outbox,
            metrics,
            dedup_window,
            state: Mutex::new(SeedState::default()),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Loads and sends one byte range, at most one piece long and clipped to the
    /// end of the file. Returns whether anything was sent.
    pub async fn send_block(&self, conn: Uuid, begin: u64, length: u64) -> Result<bool> {
        let piece_size = self.file.copy().piece_size();
        if length == 0 || length > piece_size {
            warn!(
                "Rejecting request {}+{} for {} from {}: pieces are {} bytes",
                begin, length, self.uuid, conn, piece_size
            );
            return Ok(false);
        }
        let length = length.min(self.file.copy().size().saturating_sub(begin));
        if length == 0 {
            warn!(
                "Request at {} for {} from {} is past the end of the file",
                begin, self.uuid, conn
            );
            return Ok(false);
        }

        let now = Instant::now();
        {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(_) => return Ok(false),
            };
            let window = self.dedup_window;
            state
                .recent
                .retain(|_, at| now.duration_since(*at) < window);
            if state.recent.contains_key(&(conn, begin, length)) {
                debug!(
                    "Duplicate request {}+{} for {} from {}",
                    begin, length, self.uuid, conn
                );
                return Ok(false);
            }
            state.recent.insert((conn, begin, length), now);
        }

        let data = self.file.load_data(begin, length).await?;
        if data.is_empty() {
            return Ok(false);
        }

        let sent = data.len() as u64;
        if !self
            .outbox
            .send(conn, Message::chunk_response(self.uuid, begin, data))
        {
            return Ok(false);
        }
        self.metrics.record_chunk_uploaded(conn, sent).await;
        debug!("Sent {}+{} of {} to {}", begin, sent, self.uuid, conn);
        Ok(true)
    }

    pub fn interested(&self, conn: Uuid, missing: u64) {
        if let Ok(mut state) = self.state.lock() {
            if state.interested.insert(conn, missing).is_none() {
                info!("Peer {} interested in {} ({} pieces missing)", conn, self.uuid, missing);
            }
        }
    }

    pub fn not_interested(&self, conn: &Uuid) {
        if let Ok(mut state) = self.state.lock() {
            if state.interested.remove(conn).is_some() {
                debug!("Peer {} no longer interested in {}", conn, self.uuid);
            }
            state.recent.retain(|(c, _, _), _| c != conn);
        }
    }

    /// Pieces `conn` still misses, as it last reported.
    pub fn missing_for(&self, conn: &Uuid) -> Option<u64> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.interested.get(conn).copied())
    }

    pub fn interested_peers(&self) -> Vec<Uuid> {
        self.state
            .lock()
            .map(|state| state.interested.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OperationKind;
    use crate::network::Connection;
    use crate::storage::sync_file::tests::RecordingHooks;
    use async_trait::async_trait;
    use std::net::SocketAddr;

    struct Sink {
        id: Uuid,
        seen: Mutex<Vec<Message>>,
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

    async fn seeder_for(dir: &std::path::Path, size: usize) -> (FileSeeder, Arc<Sink>) {
        std::fs::write(dir.join("a.bin"), vec![5u8; size]).unwrap();
        let file = Arc::new(SyncFile::new_local(
            dir,
            &dir.join(".sync"),
            "a.bin",
            Duration::from_secs(5),
        ));
        file.apply_operation_from_me(OperationKind::Create, None, &RecordingHooks::default())
            .await
            .unwrap();

        let outbox = Arc::new(Outbox::new());
        let sink = Arc::new(Sink {
            id: Uuid::new_v4(),
            seen: Mutex::new(Vec::new()),
        });
        outbox.register(sink.clone());
        let seeder = FileSeeder::new(
            file,
            outbox,
            Arc::new(MetricsCollector::new(None)),
            Duration::from_secs(1),
        );
        (seeder, sink)
    }

    #[tokio::test]
    async fn test_oversized_request_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (seeder, sink) = seeder_for(dir.path(), 600 * 1024).await;
        let piece_size = seeder.file.copy().piece_size();
        assert_eq!(piece_size, 256 * 1024);

        assert!(!seeder.send_block(sink.id, 0, u64::MAX).await.unwrap());
        assert!(!seeder.send_block(sink.id, 0, piece_size + 1).await.unwrap());
        assert!(!seeder.send_block(sink.id, 0, 0).await.unwrap());
        assert!(!seeder.send_block(sink.id, u64::MAX, 16_384).await.unwrap());

        // A full piece is fine; one overlapping the end is clipped.
        assert!(seeder.send_block(sink.id, 0, piece_size).await.unwrap());
        assert!(seeder
            .send_block(sink.id, 512 * 1024, piece_size)
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let seen = sink.seen.lock().unwrap();
        let lengths: Vec<u64> = seen
            .iter()
            .filter_map(|m| match m {
                Message::SendChunk { length, .. } => Some(*length),
                _ => None,
            })
            .collect();
        assert_eq!(lengths, vec![piece_size, 88 * 1024]);
    }

    #[tokio::test]
    async fn test_repeated_request_served_once() {
        let dir = tempfile::tempdir().unwrap();
        let (seeder, sink) = seeder_for(dir.path(), 40_000).await;

        assert!(seeder.send_block(sink.id, 0, 16_384).await.unwrap());
        assert!(!seeder.send_block(sink.id, 0, 16_384).await.unwrap());
        assert!(seeder.send_block(sink.id, 32_768, 16_384).await.unwrap());
        assert!(!seeder.send_block(sink.id, 50_000, 16_384).await.unwrap());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let seen = sink.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(matches!(&seen[1], Message::SendChunk { length, .. } if *length == 40_000 - 32_768));
    }
}
