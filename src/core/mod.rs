pub mod config;
pub mod node;
pub mod peer;
pub mod protocol;

pub use config::{Config, TransferConfig};
pub use node::Node;
pub use peer::{PeerInfo, PeerManager, TcpPeer};
pub use protocol::{FileState, Message, MessageKind, Operation, OperationKind, Precedence};
