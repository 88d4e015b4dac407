use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Kind of library mutation. The declaration order is the tie-break priority:
/// at equal version the lower kind wins.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Remove,
    Move,
    Modify,
    Create,
}

impl OperationKind {
    pub fn priority(&self) -> u8 {
        match self {
            OperationKind::Remove => 0,
            OperationKind::Move => 1,
            OperationKind::Modify => 2,
            OperationKind::Create => 3,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Remove => "remove",
            OperationKind::Move => "move",
            OperationKind::Modify => "modify",
            OperationKind::Create => "create",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    pub source: String,
    pub destination: Option<String>,
    pub version: u64,
    pub hash: String,
}

/// Outcome of comparing an incoming operation against the local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precedence {
    /// The incoming operation wins and must be applied.
    Wins,
    /// The incoming operation is provably older than the local one.
    Loses,
    /// Same version, kind, hash and destination.
    Same,
}

impl Operation {
    pub fn new(
        kind: OperationKind,
        source: impl Into<String>,
        destination: Option<String>,
        version: u64,
        hash: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            source: source.into(),
            destination,
            version,
            hash: hash.into(),
        }
    }

    fn tie_key(&self) -> String {
        format!("{}{}", self.hash, self.destination.as_deref().unwrap_or(""))
    }

    /// Orders operations by `(version, priority, hash+destination)`: a higher
    /// version wins, then the lower priority, then the lexicographically lower key.
    pub fn precedence_over(&self, local: &Operation) -> Precedence {
        let ordering = local
            .version
            .cmp(&self.version)
            .then_with(|| self.kind.priority().cmp(&local.kind.priority()))
            .then_with(|| self.tie_key().cmp(&local.tie_key()));

        match ordering {
            Ordering::Less => Precedence::Wins,
            Ordering::Greater => Precedence::Loses,
            Ordering::Equal => Precedence::Same,
        }
    }

    /// Path the file lives at once this operation is applied.
    pub fn target_path(&self) -> &str {
        self.destination.as_deref().unwrap_or(&self.source)
    }
}

/// Announced state of one synchronized file. `hash_map` is only present in a
/// full info message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileState {
    pub uuid: Uuid,
    pub name: String,
    pub path: String,
    pub hash: String,
    pub version: u64,
    pub size: u64,
    pub piece_size: u64,
    pub last_operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_map: Option<Vec<String>>,
}

impl FileState {
    pub fn is_full(&self) -> bool {
        self.hash_map.is_some()
    }

    pub fn piece_count(&self) -> usize {
        crate::storage::piece_count(self.size, self.piece_size)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    // Transport control
    Handshake {
        node_id: Uuid,
        node_name: String,
        logical_name: String,
    },
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },

    // File announcements
    SendInfo(FileState),
    AskInfo {
        uuid: Uuid,
    },
    SendLibrary {
        files: Vec<FileState>,
    },

    // Piece negotiation
    AskBitfield {
        uuid: Uuid,
    },
    /// Pieces held of `version`; a bitfield for another version is ignored.
    SendBitfield {
        uuid: Uuid,
        version: u64,
        bitfield: Vec<bool>,
    },
    Have {
        uuid: Uuid,
        piece: usize,
    },
    Interested {
        uuid: Uuid,
        missing: u64,
    },
    NotInterested {
        uuid: Uuid,
    },

    // Data transfer
    AskChunk {
        uuid: Uuid,
        begin: u64,
        length: u64,
    },
    SendChunk {
        uuid: Uuid,
        begin: u64,
        length: u64,
        #[serde(with = "hex::serde")]
        data: Vec<u8>,
    },

    // Flow control
    Authorised {
        uuid: Uuid,
    },
    Unauthorised {
        uuid: Uuid,
    },
    Congestion,

    // Library lock protocol
    AskLibraryLocked {
        request_id: Uuid,
        library_hash: String,
    },
    AnswerLibraryLocked {
        request_id: Uuid,
        locked: bool,
        library_hash: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Handshake,
    Ping,
    Pong,
    SendInfo,
    AskInfo,
    SendLibrary,
    AskBitfield,
    SendBitfield,
    Have,
    Interested,
    NotInterested,
    AskChunk,
    SendChunk,
    Authorised,
    Unauthorised,
    Congestion,
    AskLibraryLocked,
    AnswerLibraryLocked,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Handshake { .. } => MessageKind::Handshake,
            Message::Ping { .. } => MessageKind::Ping,
            Message::Pong { .. } => MessageKind::Pong,
            Message::SendInfo(_) => MessageKind::SendInfo,
            Message::AskInfo { .. } => MessageKind::AskInfo,
            Message::SendLibrary { .. } => MessageKind::SendLibrary,
            Message::AskBitfield { .. } => MessageKind::AskBitfield,
            Message::SendBitfield { .. } => MessageKind::SendBitfield,
            Message::Have { .. } => MessageKind::Have,
            Message::Interested { .. } => MessageKind::Interested,
            Message::NotInterested { .. } => MessageKind::NotInterested,
            Message::AskChunk { .. } => MessageKind::AskChunk,
            Message::SendChunk { .. } => MessageKind::SendChunk,
            Message::Authorised { .. } => MessageKind::Authorised,
            Message::Unauthorised { .. } => MessageKind::Unauthorised,
            Message::Congestion => MessageKind::Congestion,
            Message::AskLibraryLocked { .. } => MessageKind::AskLibraryLocked,
            Message::AnswerLibraryLocked { .. } => MessageKind::AnswerLibraryLocked,
        }
    }

    /// File the message refers to, when it refers to exactly one.
    pub fn file_uuid(&self) -> Option<Uuid> {
        match self {
            Message::SendInfo(state) => Some(state.uuid),
            Message::AskInfo { uuid }
            | Message::AskBitfield { uuid }
            | Message::SendBitfield { uuid, .. }
            | Message::Have { uuid, .. }
            | Message::Interested { uuid, .. }
            | Message::NotInterested { uuid }
            | Message::AskChunk { uuid, .. }
            | Message::SendChunk { uuid, .. }
            | Message::Authorised { uuid }
            | Message::Unauthorised { uuid } => Some(*uuid),
            _ => None,
        }
    }

    pub fn is_transport_control(&self) -> bool {
        matches!(
            self,
            Message::Handshake { .. } | Message::Ping { .. } | Message::Pong { .. }
        )
    }

    pub fn handshake(node_id: Uuid, node_name: String, logical_name: String) -> Self {
        Message::Handshake {
            node_id,
            node_name,
            logical_name,
        }
    }

    pub fn chunk_request(uuid: Uuid, begin: u64, length: u64) -> Self {
        Message::AskChunk {
            uuid,
            begin,
            length,
        }
    }

    pub fn chunk_response(uuid: Uuid, begin: u64, data: Vec<u8>) -> Self {
        Message::SendChunk {
            uuid,
            begin,
            length: data.len() as u64,
            data,
        }
    }

    pub fn encode(&self) -> crate::utils::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> crate::utils::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
