use async_trait::async_trait;
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::Message;
use crate::network::Connection;
use crate::utils::Result;

#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    pub from: Uuid,
    pub message: Message,
}

#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, envelope: MessageEnvelope) -> Result<()>;
}

/// Outgoing queues, one per connection. Each queue is drained by its own task,
/// so messages to one peer leave in the order they were queued and `send`
/// never blocks the caller.
#[derive(Default)]
pub struct Outbox {
    senders: RwLock<HashMap<Uuid, mpsc::UnboundedSender<Message>>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn: Arc<dyn Connection>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let id = conn.id();
        if let Ok(mut senders) = self.senders.write() {
            senders.insert(id, tx);
        }

        tokio::spawn(async move {
            // A failed send loses that message only. The connection is torn
            // down by its reader, not here.
            while let Some(message) = rx.recv().await {
                let kind = message.kind();
                if let Err(e) = conn.send_message(message).await {
                    warn!("Send of {:?} to {} failed: {}", kind, id, e);
                }
            }
            debug!("Send worker for {} stopped", id);
        })
    }

    pub fn unregister(&self, conn: &Uuid) {
        if let Ok(mut senders) = self.senders.write() {
            senders.remove(conn);
        }
    }

    /// Queues `message` for `conn`; false when the connection is gone.
    pub fn send(&self, conn: Uuid, message: Message) -> bool {
        let senders = match self.senders.read() {
            Ok(senders) => senders,
            Err(_) => return false,
        };
        match senders.get(&conn) {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    pub fn broadcast(&self, message: Message) -> usize {
        self.broadcast_except(None, message)
    }

    pub fn broadcast_except(&self, except: Option<Uuid>, message: Message) -> usize {
        let senders = match self.senders.read() {
            Ok(senders) => senders,
            Err(_) => return 0,
        };
        senders
            .iter()
            .filter(|(id, _)| Some(**id) != except)
            .filter(|(_, tx)| tx.send(message.clone()).is_ok())
            .count()
    }

    pub fn connections(&self) -> Vec<Uuid> {
        self.senders
            .read()
            .map(|senders| senders.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.senders.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Incoming queues, one per connection, each handled in arrival order by a
/// dedicated task.
#[derive(Default)]
pub struct Inbox {
    queues: RwLock<HashMap<Uuid, mpsc::UnboundedSender<Message>>>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, conn: Uuid, processor: Arc<dyn MessageProcessor>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        if let Ok(mut queues) = self.queues.write() {
            queues.insert(conn, tx);
        }

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let kind = message.kind();
                if let Err(e) = processor
                    .process(MessageEnvelope {
                        from: conn,
                        message,
                    })
                    .await
                {
                    error!("Failed to handle {:?} from {}: {}", kind, conn, e);
                }
            }
            debug!("Receive worker for {} stopped", conn);
        })
    }

    pub fn unregister(&self, conn: &Uuid) {
        if let Ok(mut queues) = self.queues.write() {
            queues.remove(conn);
        }
    }

    pub fn deliver(&self, conn: Uuid, message: Message) -> bool {
        let queues = match self.queues.read() {
            Ok(queues) => queues,
            Err(_) => return false,
        };
        match queues.get(&conn) {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }
}
