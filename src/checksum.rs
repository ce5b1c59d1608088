use sha2::{Digest, Sha256};

/// Truncated blob checksum stored in index rows: the first 8 bytes of the
/// SHA-256 digest, read little-endian.
pub fn blob_checksum(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}

/// Full lowercase hex SHA-256, used to name content-addressed objects.
pub fn content_hash(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_digest_prefix() {
        let data = b"trade blob";
        let full = Sha256::digest(data);
        let expected = u64::from_le_bytes(full[..8].try_into().unwrap());
        assert_eq!(blob_checksum(data), expected);
    }

    #[test]
    fn test_checksum_detects_single_bit_flip() {
        let mut data = vec![7u8; 256];
        let before = blob_checksum(&data);
        data[100] ^= 0x01;
        assert_ne!(before, blob_checksum(&data));
    }

    #[test]
    fn test_content_hash_known_vector() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
