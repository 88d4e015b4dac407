pub mod connection;
pub mod messaging;
pub mod transport;

pub use connection::Connection;
pub use messaging::{Inbox, MessageEnvelope, MessageProcessor, Outbox};
pub use transport::{Transport, MAX_FRAME_SIZE};
