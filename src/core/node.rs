use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

use crate::core::{Config, Message, PeerManager, TcpPeer};
use crate::network::Transport;
use crate::storage::FileLibrary;
use crate::transfer::{ExternalCommands, FileTransfer, TransferEvent};
use crate::utils::{MetricsCollector, Result, SyncError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Node {
    id: Uuid,
    pub config: Config,
    library: Arc<FileLibrary>,
    transfer: Arc<FileTransfer>,
    commands: Arc<ExternalCommands>,
    peer_manager: Arc<RwLock<PeerManager>>,
    metrics: Arc<MetricsCollector>,
    events: Option<mpsc::UnboundedReceiver<TransferEvent>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl Node {
    pub async fn new(config: Config) -> Result<Self> {
        config.transfer.validate()?;
        let id = Uuid::new_v4();
        let library = Arc::new(
            FileLibrary::load(config.library_dir.clone(), config.transfer.idle_close()).await?,
        );
        let metrics = Arc::new(MetricsCollector::new(config.rate_log.clone()));
        let (transfer, events) =
            FileTransfer::new(library.clone(), config.transfer.clone(), metrics.clone());
        let commands = Arc::new(ExternalCommands::new(transfer.clone()));

        Ok(Self {
            id,
            config,
            library,
            transfer,
            commands,
            peer_manager: Arc::new(RwLock::new(PeerManager::new())),
            metrics,
            events: Some(events),
            shutdown_tx: None,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn commands(&self) -> Arc<ExternalCommands> {
        self.commands.clone()
    }

    fn handshake(&self) -> Message {
        Message::handshake(
            self.id,
            self.config.node_name.clone(),
            self.config.logical_name.clone(),
        )
    }

    pub async fn start(&mut self) -> Result<()> {
        info!(
            "Starting sync node {} ({}) for library '{}' at {:?} on port {}",
            self.id,
            self.config.node_name,
            self.config.logical_name,
            self.library.root(),
            self.config.port
        );

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        let scanned = self.library.scan(self.transfer.as_ref()).await?;
        info!(
            "Library holds {} files ({} new or changed on disk)",
            self.library.len().await,
            scanned
        );

        self.transfer.start();
        if self.config.rate_log.is_some() {
            self.metrics.start_rate_log();
        }
        self.start_event_log();

        if self.config.port > 0 {
            let listener = Transport::listen(self.config.port).await?;
            self.start_connection_acceptor(listener);
        }

        for peer in self.config.peers.clone() {
            if let Err(e) = self.connect_to_peer(&peer).await {
                warn!("Could not connect to {}: {}", peer, e);
            }
        }

        self.start_console(shutdown_tx);

        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutdown requested");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down");
            }
        }

        self.transfer.shutdown();
        for peer in self.peer_manager.read().await.get_all_peers() {
            peer.close().await;
        }
        self.metrics.print_stats().await;
        Ok(())
    }

    fn start_event_log(&mut self) {
        let mut events = match self.events.take() {
            Some(events) => events,
            None => return,
        };
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransferEvent::DownloadFinished { uuid, path } => {
                        info!("Synchronised {} ({})", path, uuid)
                    }
                    TransferEvent::FileRemoved { uuid, path } => {
                        info!("Removed {} ({})", path, uuid)
                    }
                    TransferEvent::FileMoved { uuid, from, to } => {
                        info!("Moved {} -> {} ({})", from, to, uuid)
                    }
                }
            }
        });
    }

    fn start_connection_acceptor(&self, listener: TcpListener) {
        let transfer = self.transfer.clone();
        let peer_manager = self.peer_manager.clone();
        let hello = self.handshake();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        info!("New connection from: {}", addr);
                        let transfer = transfer.clone();
                        let peer_manager = peer_manager.clone();
                        let hello = hello.clone();

                        tokio::spawn(async move {
                            if let Err(e) =
                                TcpPeer::establish(stream, &hello, transfer, peer_manager).await
                            {
                                error!("Failed to handle connection from {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }

    pub async fn connect_to_peer(&self, addr: &str) -> Result<()> {
        info!("Connecting to peer: {}", addr);
        let stream = timeout(CONNECT_TIMEOUT, Transport::connect(addr))
            .await
            .map_err(|_| SyncError::ConnectionFailed(format!("{}: connection timeout", addr)))??;
        TcpPeer::establish(
            stream,
            &self.handshake(),
            self.transfer.clone(),
            self.peer_manager.clone(),
        )
        .await?;
        Ok(())
    }

    fn start_console(&self, shutdown_tx: mpsc::Sender<()>) {
        let commands = self.commands.clone();
        let transfer = self.transfer.clone();
        let library = self.library.clone();
        let peer_manager = self.peer_manager.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Console read failed: {}", e);
                        break;
                    }
                };
                let words: Vec<&str> = line.split_whitespace().collect();
                let result = match words.as_slice() {
                    [] => Ok(()),
                    ["add", path] => commands
                        .add(&PathBuf::from(path))
                        .await
                        .map(|added| println!("Added {} files", added.len())),
                    ["rm", path] => commands
                        .delete(&PathBuf::from(path))
                        .await
                        .map(|removed| println!("Removed {} files", removed.len())),
                    ["mv", from, to] => commands
                        .move_path(&PathBuf::from(from), &PathBuf::from(to))
                        .await
                        .map(|moved| println!("Moved {} files", moved.len())),
                    ["modify", path] => commands
                        .modify(&PathBuf::from(path))
                        .await
                        .map(|uuid| println!("Announced new version of {}", uuid)),
                    ["status"] => {
                        print_status(&library, &transfer, &peer_manager).await;
                        metrics.print_stats().await;
                        Ok(())
                    }
                    ["quit"] | ["exit"] => {
                        let _ = shutdown_tx.send(()).await;
                        break;
                    }
                    _ => {
                        println!("Commands: add <path> | rm <path> | mv <src> <dst> | modify <path> | status | quit");
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    println!("Error: {}", e);
                }
            }
        });
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        Ok(())
    }
}

async fn print_status(
    library: &FileLibrary,
    transfer: &FileTransfer,
    peer_manager: &RwLock<PeerManager>,
) {
    println!("\n=== Library {:?} ===", library.root());
    for state in library.file_states(false).await {
        if state.last_operation.kind == crate::core::OperationKind::Remove {
            continue;
        }
        println!(
            "  {} v{} {} ({} bytes)",
            state.path, state.version, state.uuid, state.size
        );
    }

    println!("Peers:");
    for peer in peer_manager.read().await.get_all_peers() {
        let info = peer.info();
        println!(
            "  {} ({}) at {:?}, rtt {:?}",
            info.name, info.id, info.addr, info.rtt
        );
    }

    for (uuid, done, total) in transfer.active_downloads() {
        println!("Downloading {}: {}/{} pieces", uuid, done, total);
    }
}
