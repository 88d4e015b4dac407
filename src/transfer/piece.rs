use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::storage::HashUtils;
use crate::transfer::ConnectionInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub begin: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Unrequested,
    Requested { at: Instant, timed_out: bool },
    Received,
}

/// What a chunk did to the piece.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Receipt {
    /// New bytes were stored.
    pub stored: bool,
    /// The chunk answered a request still counted in flight.
    pub answered: bool,
    pub complete: bool,
}

/// Outcome of one timeout check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeoutReport {
    /// A request crossed the chunk timeout since the last check.
    pub new_episode: bool,
    /// Block requests given up and returned to the unrequested pool.
    pub reissued: usize,
    /// The outstanding whole-piece request was given up; the piece must be requeued.
    pub aborted: bool,
}

/// One piece being fetched from one connection.
#[derive(Debug)]
pub struct Piece {
    index: usize,
    conn: Uuid,
    offset: u64,
    length: u64,
    block_size: u64,
    hash: String,
    blocks: Vec<BlockState>,
    whole_request: bool,
    data: Vec<u8>,
    received: usize,
}

impl Piece {
    pub fn new(
        index: usize,
        conn: Uuid,
        offset: u64,
        length: u64,
        block_size: u64,
        hash: String,
    ) -> Self {
        let block_count = length.div_ceil(block_size).max(1) as usize;
        Self {
            index,
            conn,
            offset,
            length,
            block_size,
            hash,
            blocks: vec![BlockState::Unrequested; block_count],
            whole_request: false,
            data: vec![0; length as usize],
            received: 0,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn conn(&self) -> Uuid {
        self.conn
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.blocks.len()
    }

    pub fn has_unrequested(&self) -> bool {
        self.blocks.contains(&BlockState::Unrequested)
    }

    pub fn verify(&self) -> bool {
        HashUtils::verify_data(&self.data, &self.hash)
    }

    fn block_range(&self, block: usize) -> BlockRequest {
        let begin = block as u64 * self.block_size;
        BlockRequest {
            begin: self.offset + begin,
            length: (self.length - begin).min(self.block_size),
        }
    }

    /// Issues up to two new requests while `info` allows it. The flag is true
    /// once every block of the piece has been requested.
    pub fn next_block_requests(&mut self, info: &ConnectionInfo) -> (Vec<BlockRequest>, bool) {
        let now = Instant::now();
        let mut requests = Vec::new();

        if info.is_whole_piece() && self.received == 0 && !self.whole_request {
            let untouched = self.blocks.iter().all(|b| *b == BlockState::Unrequested);
            if untouched && info.can_request_block() {
                for block in self.blocks.iter_mut() {
                    *block = BlockState::Requested {
                        at: now,
                        timed_out: false,
                    };
                }
                self.whole_request = true;
                info.on_request_sent();
                requests.push(BlockRequest {
                    begin: self.offset,
                    length: self.length,
                });
                return (requests, true);
            }
        }

        while requests.len() < 2 && info.can_request_block() {
            let block = match self
                .blocks
                .iter()
                .position(|b| *b == BlockState::Unrequested)
            {
                Some(block) => block,
                None => break,
            };
            self.blocks[block] = BlockState::Requested {
                at: now,
                timed_out: false,
            };
            info.on_request_sent();
            requests.push(self.block_range(block));
        }

        (requests, !self.has_unrequested())
    }

    pub fn receive(&mut self, begin: u64, data: &[u8]) -> Receipt {
        let mut receipt = Receipt::default();
        if begin < self.offset || begin + data.len() as u64 > self.offset + self.length {
            return receipt;
        }
        let rel = begin - self.offset;

        if self.whole_request && rel == 0 && data.len() as u64 == self.length {
            receipt.answered = self
                .blocks
                .iter()
                .any(|b| matches!(b, BlockState::Requested { .. }));
            self.data.copy_from_slice(data);
            for block in self.blocks.iter_mut() {
                *block = BlockState::Received;
            }
            self.received = self.blocks.len();
            self.whole_request = false;
            receipt.stored = true;
            receipt.complete = true;
            return receipt;
        }

        if rel % self.block_size != 0 {
            return receipt;
        }
        let block = (rel / self.block_size) as usize;
        if block >= self.blocks.len() || self.block_range(block).length != data.len() as u64 {
            return receipt;
        }

        match self.blocks[block] {
            BlockState::Received => return receipt,
            BlockState::Requested { .. } => receipt.answered = !self.whole_request,
            BlockState::Unrequested => {}
        }
        let start = rel as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        self.blocks[block] = BlockState::Received;
        self.received += 1;
        receipt.stored = true;
        receipt.complete = self.is_complete();
        receipt
    }

    /// Walks the outstanding requests: a request older than `timeout` opens a
    /// timeout episode, one older than `timeout + grace` is given up.
    pub fn check_request_timeout(
        &mut self,
        now: Instant,
        timeout: Duration,
        grace: Duration,
    ) -> TimeoutReport {
        let mut report = TimeoutReport::default();
        let mut give_up = false;

        for block in self.blocks.iter_mut() {
            if let BlockState::Requested { at, timed_out } = block {
                let elapsed = now.duration_since(*at);
                if elapsed >= timeout && !*timed_out {
                    *timed_out = true;
                    report.new_episode = true;
                }
                if elapsed >= timeout + grace {
                    give_up = true;
                    if !self.whole_request {
                        *block = BlockState::Unrequested;
                        report.reissued += 1;
                    }
                }
            }
        }

        if give_up && self.whole_request {
            report.aborted = true;
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TransferConfig;

    const BLOCK: u64 = 16 * 1024;

    fn piece_of(data: &[u8]) -> Piece {
        Piece::new(
            0,
            Uuid::new_v4(),
            0,
            data.len() as u64,
            BLOCK,
            HashUtils::hash_data(data),
        )
    }

    #[tokio::test]
    async fn test_blocks_requested_two_at_a_time() {
        let data = vec![7u8; (BLOCK * 3 + 100) as usize];
        let mut piece = piece_of(&data);
        let info = ConnectionInfo::new(Uuid::new_v4(), 4, &TransferConfig::default());

        let (first, done) = piece.next_block_requests(&info);
        assert_eq!(first.len(), 2);
        assert!(!done);
        let (second, done) = piece.next_block_requests(&info);
        assert_eq!(second.len(), 2);
        assert!(done);
        assert_eq!(second[1].begin, BLOCK * 3);
        assert_eq!(second[1].length, 100);
        assert_eq!(info.in_flight(), 4);

        for request in first.iter().chain(second.iter()) {
            let start = request.begin as usize;
            let receipt = piece.receive(request.begin, &data[start..start + request.length as usize]);
            assert!(receipt.stored && receipt.answered);
        }
        assert!(piece.is_complete());
        assert!(piece.verify());
    }

    #[tokio::test]
    async fn test_duplicate_and_misaligned_chunks_are_ignored() {
        let data = vec![1u8; (BLOCK * 2) as usize];
        let mut piece = piece_of(&data);

        assert!(piece.receive(0, &data[..BLOCK as usize]).stored);
        assert_eq!(piece.receive(0, &data[..BLOCK as usize]), Receipt::default());
        assert_eq!(piece.receive(5, &data[..10]), Receipt::default());
        assert!(!piece.is_complete());
    }

    #[tokio::test]
    async fn test_corrupt_piece_fails_verification() {
        let data = vec![9u8; BLOCK as usize];
        let mut piece = piece_of(&data);
        let receipt = piece.receive(0, &vec![8u8; BLOCK as usize]);
        assert!(receipt.complete);
        assert!(!piece.verify());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_episode_then_reissue() {
        let data = vec![3u8; (BLOCK * 2) as usize];
        let mut piece = piece_of(&data);
        let info = ConnectionInfo::new(Uuid::new_v4(), 2, &TransferConfig::default());
        let timeout = Duration::from_secs(1);
        let grace = Duration::from_secs(3);

        let (requests, _) = piece.next_block_requests(&info);
        assert_eq!(requests.len(), 2);

        let start = Instant::now();
        let report = piece.check_request_timeout(start + Duration::from_millis(1_100), timeout, grace);
        assert!(report.new_episode);
        assert_eq!(report.reissued, 0);

        let report = piece.check_request_timeout(start + Duration::from_millis(2_000), timeout, grace);
        assert!(!report.new_episode);

        let report = piece.check_request_timeout(start + Duration::from_millis(4_100), timeout, grace);
        assert_eq!(report.reissued, 2);
        assert!(piece.has_unrequested());
    }
}
