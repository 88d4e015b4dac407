use sha2::{Digest, Sha256};

pub struct HashUtils;

impl HashUtils {
    pub fn hash_data(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    /// File hash: digest over the concatenated piece hashes.
    pub fn hash_piece_hashes(hash_map: &[String]) -> String {
        let mut hasher = Sha256::new();
        for piece_hash in hash_map {
            hasher.update(piece_hash.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn verify_data(data: &[u8], expected_hash: &str) -> bool {
        Self::hash_data(data) == expected_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_hash_is_hash_of_concatenated_piece_hashes() {
        let pieces = vec![HashUtils::hash_data(b"one"), HashUtils::hash_data(b"two")];
        let concat = format!("{}{}", pieces[0], pieces[1]);
        assert_eq!(
            HashUtils::hash_piece_hashes(&pieces),
            HashUtils::hash_data(concat.as_bytes())
        );
        assert!(HashUtils::verify_data(b"one", &pieces[0]));
        assert!(!HashUtils::verify_data(b"two", &pieces[0]));
    }
}
