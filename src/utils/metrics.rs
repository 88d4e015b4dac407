use log::{debug, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tokio::time::interval;
use uuid::Uuid;

use crate::utils::Result;

#[derive(Debug, Clone)]
pub struct TransferMetrics {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub chunks_uploaded: u64,
    pub chunks_downloaded: u64,
    pub pieces_verified: u64,
    pub pieces_corrupted: u64,
    pub files_downloaded: u64,
    pub congestion_signals: u64,
    pub uptime: Duration,
    pub start_time: Instant,
}

impl Default for TransferMetrics {
    fn default() -> Self {
        Self {
            bytes_sent: 0,
            bytes_received: 0,
            chunks_uploaded: 0,
            chunks_downloaded: 0,
            pieces_verified: 0,
            pieces_corrupted: 0,
            files_downloaded: 0,
            congestion_signals: 0,
            uptime: Duration::new(0, 0),
            start_time: Instant::now(),
        }
    }
}

/// Bytes moved on one connection since the last rate-log flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateWindow {
    pub bytes_down: u64,
    pub bytes_up: u64,
}

pub struct MetricsCollector {
    metrics: Arc<RwLock<TransferMetrics>>,
    rates: Arc<RwLock<HashMap<Uuid, RateWindow>>>,
    rate_log: Option<PathBuf>,
}

impl MetricsCollector {
    pub fn new(rate_log: Option<PathBuf>) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(TransferMetrics::default())),
            rates: Arc::new(RwLock::new(HashMap::new())),
            rate_log,
        }
    }

    pub async fn record_chunk_uploaded(&self, conn: Uuid, bytes: u64) {
        {
            let mut metrics = self.metrics.write().await;
            metrics.bytes_sent += bytes;
            metrics.chunks_uploaded += 1;
        }
        self.rates.write().await.entry(conn).or_default().bytes_up += bytes;
    }

    pub async fn record_chunk_downloaded(&self, conn: Uuid, bytes: u64) {
        {
            let mut metrics = self.metrics.write().await;
            metrics.bytes_received += bytes;
            metrics.chunks_downloaded += 1;
        }
        self.rates.write().await.entry(conn).or_default().bytes_down += bytes;
    }

    pub async fn record_piece_verified(&self) {
        self.metrics.write().await.pieces_verified += 1;
    }

    pub async fn record_piece_corrupted(&self) {
        self.metrics.write().await.pieces_corrupted += 1;
    }

    pub async fn record_file_downloaded(&self) {
        self.metrics.write().await.files_downloaded += 1;
    }

    pub async fn record_congestion_signal(&self) {
        self.metrics.write().await.congestion_signals += 1;
    }

    pub async fn get_metrics(&self) -> TransferMetrics {
        let mut metrics = self.metrics.read().await.clone();
        metrics.uptime = metrics.start_time.elapsed();
        metrics
    }

    /// Drains the per-connection windows and appends one CSV line per connection.
    pub async fn flush_rates(&self) -> Result<Vec<(Uuid, RateWindow)>> {
        let drained: Vec<(Uuid, RateWindow)> = {
            let mut rates = self.rates.write().await;
            rates.drain().collect()
        };

        if drained.is_empty() {
            return Ok(drained);
        }

        if let Some(path) = &self.rate_log {
            let is_new = !path.exists();
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;

            let mut lines = String::new();
            if is_new {
                lines.push_str("timestamp,connection,bytes_down,bytes_up\n");
            }
            let now = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3f");
            for (conn, window) in &drained {
                lines.push_str(&format!(
                    "{},{},{},{}\n",
                    now, conn, window.bytes_down, window.bytes_up
                ));
            }
            file.write_all(lines.as_bytes()).await?;
            file.flush().await?;
            debug!("Rate log: wrote {} rows", drained.len());
        }

        Ok(drained)
    }

    pub fn start_rate_log(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let collector = self.clone();

        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                if let Err(e) = collector.flush_rates().await {
                    warn!("Rate log flush failed: {}", e);
                }
            }
        })
    }

    pub async fn print_stats(&self) {
        let metrics = self.get_metrics().await;

        println!("\n=== Sync Transfer Statistics ===");
        println!("Uptime: {:.2?}", metrics.uptime);
        println!(
            "Data Transfer: {} bytes sent, {} bytes received",
            metrics.bytes_sent, metrics.bytes_received
        );
        println!(
            "Chunks: {} uploaded, {} downloaded",
            metrics.chunks_uploaded, metrics.chunks_downloaded
        );
        println!(
            "Pieces: {} verified, {} corrupted",
            metrics.pieces_verified, metrics.pieces_corrupted
        );
        println!(
            "Files downloaded: {}, congestion signals: {}",
            metrics.files_downloaded, metrics.congestion_signals
        );
        println!("================================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flush_rates_writes_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rates.csv");
        let collector = MetricsCollector::new(Some(path.clone()));
        let conn = Uuid::new_v4();

        collector.record_chunk_downloaded(conn, 1024).await;
        collector.record_chunk_uploaded(conn, 16).await;

        let flushed = collector.flush_rates().await.unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(
            flushed[0].1,
            RateWindow {
                bytes_down: 1024,
                bytes_up: 16
            }
        );

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("timestamp,connection,bytes_down,bytes_up"));
        assert!(lines.next().unwrap().ends_with(&format!("{},1024,16", conn)));

        // Windows reset after a flush.
        assert!(collector.flush_rates().await.unwrap().is_empty());
        assert_eq!(collector.get_metrics().await.bytes_received, 1024);
    }
}
