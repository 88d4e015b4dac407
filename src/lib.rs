//! Mini Sync Library
//!
//! Peer-to-peer replication of a shared directory. Every file carries a UUID, a
//! version and its last operation; nodes resolve conflicts with a total order on
//! operations and move content piece by piece with SHA-256 verification.

pub mod core;
pub mod network;
pub mod storage;
pub mod transfer;
pub mod utils;

// Re-export main types
pub use core::{Config, Node, TransferConfig};
pub use network::Connection;
pub use storage::{FileLibrary, SyncFile};
pub use transfer::{ExternalCommands, FileTransfer, TransferEvent};
pub use utils::error::{Result, SyncError};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
