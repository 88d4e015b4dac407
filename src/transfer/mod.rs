pub mod commands;
pub mod congestion;
pub mod connection_info;
pub mod file_transfer;
pub mod leecher;
pub mod piece;
pub mod seeder;
pub mod slots;

pub use commands::ExternalCommands;
pub use congestion::{select_congestion_targets, RttTracker};
pub use connection_info::ConnectionInfo;
pub use file_transfer::FileTransfer;
pub use leecher::FileLeecher;
pub use piece::{BlockRequest, Piece};
pub use seeder::FileSeeder;
pub use slots::{SlotDecision, UploadSlots};

use uuid::Uuid;

/// Notifications for the local application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    DownloadFinished { uuid: Uuid, path: String },
    FileRemoved { uuid: Uuid, path: String },
    FileMoved { uuid: Uuid, from: String, to: String },
}
