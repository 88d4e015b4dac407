pub mod file;
pub mod hash;
pub mod library;
pub mod sync_file;

pub use file::{File, FileMetadata};
pub use hash::HashUtils;
pub use library::FileLibrary;
pub use sync_file::{ApplyOutcome, FileStatus, SyncFile, SyncHooks, SyncRecord};

/// Hidden directory under the library root holding staging copies and records.
pub const STAGING_DIR: &str = ".sync";

pub const MIN_PIECE_SIZE: u64 = 256 * 1024;
pub const MAX_PIECE_SIZE: u64 = 1024 * 1024;

/// Piece size grows with the file so large files stay around a few hundred pieces.
pub fn piece_size_for(file_size: u64) -> u64 {
    let target = file_size.div_ceil(256).max(1).next_power_of_two();
    target.clamp(MIN_PIECE_SIZE, MAX_PIECE_SIZE)
}

pub fn piece_count(file_size: u64, piece_size: u64) -> usize {
    if piece_size == 0 {
        return 0;
    }
    file_size.div_ceil(piece_size) as usize
}

/// Byte length of piece `index`; the last piece may be short.
pub fn piece_length(file_size: u64, piece_size: u64, index: usize) -> u64 {
    let start = index as u64 * piece_size;
    if start >= file_size {
        return 0;
    }
    (file_size - start).min(piece_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_size_bounds() {
        assert_eq!(piece_size_for(0), MIN_PIECE_SIZE);
        assert_eq!(piece_size_for(1024 * 1024), MIN_PIECE_SIZE);
        assert_eq!(piece_size_for(128 * 1024 * 1024), 512 * 1024);
        assert_eq!(piece_size_for(10 * 1024 * 1024 * 1024), MAX_PIECE_SIZE);
    }

    #[test]
    fn test_piece_layout() {
        let size = 1024 * 1024 + 10;
        let piece_size = piece_size_for(size);
        assert_eq!(piece_count(size, piece_size), 5);
        assert_eq!(piece_length(size, piece_size, 0), piece_size);
        assert_eq!(piece_length(size, piece_size, 4), 10);
        assert_eq!(piece_length(size, piece_size, 5), 0);
        assert_eq!(piece_count(0, piece_size), 0);
    }
}
