//! On-disk verity superblock (spec component D), occupying hash-device
//! block 0. Byte layout follows the authoritative C struct exactly,
//! including the `u16 salt_size` + 6 bytes of padding before the 256-byte
//! salt field — spec.md's looser prose description undersells this.

use cvmboot_core::guid::{guid_from_bytes, guid_to_bytes};
use cvmboot_core::{CvmbootError, Result};
use uuid::Uuid;

pub const BLOCK_SIZE: usize = 4096;
pub const SUPERBLOCK_SIZE: usize = 512;
pub const SIGNATURE: [u8; 8] = *b"verity\0\0";
pub const MAX_SALT_SIZE: usize = 256;
pub const ROOTHASH_SIZE: usize = 32;
pub const MIN_HASH_DEV_SIZE: u64 = 4096;

/// `hash_type` value for the non-Chrome-OS (normal) verity layout.
pub const HASH_TYPE_NORMAL: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VeritySuperblock {
    pub version: u32,
    pub hash_type: u32,
    pub uuid: Uuid,
    pub algorithm: String,
    pub data_block_size: u32,
    pub hash_block_size: u32,
    pub data_blocks: u64,
    pub salt: Vec<u8>,
}

impl VeritySuperblock {
    pub fn new(uuid: Uuid, data_blocks: u64, salt: Vec<u8>) -> Self {
        Self {
            version: 1,
            hash_type: HASH_TYPE_NORMAL,
            uuid,
            algorithm: "sha256".to_string(),
            data_block_size: BLOCK_SIZE as u32,
            hash_block_size: BLOCK_SIZE as u32,
            data_blocks,
            salt,
        }
    }

    /// Serializes into a zero-padded 4096-byte hash-device block (the
    /// superblock proper occupies the first 512 bytes).
    pub fn to_block(&self) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        buf[0..8].copy_from_slice(&SIGNATURE);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.hash_type.to_le_bytes());
        buf[16..32].copy_from_slice(&guid_to_bytes(&self.uuid));

        let algo_bytes = self.algorithm.as_bytes();
        buf[32..32 + algo_bytes.len()].copy_from_slice(algo_bytes);

        buf[64..68].copy_from_slice(&self.data_block_size.to_le_bytes());
        buf[68..72].copy_from_slice(&self.hash_block_size.to_le_bytes());
        buf[72..80].copy_from_slice(&self.data_blocks.to_le_bytes());
        buf[80..82].copy_from_slice(&(self.salt.len() as u16).to_le_bytes());
        // bytes 82..88 stay zero (padding)
        buf[88..88 + self.salt.len()].copy_from_slice(&self.salt);
        // bytes 88+salt.len()..512 stay zero (salt padding + trailing pad)
        buf
    }

    /// Parses the first `SUPERBLOCK_SIZE` bytes of hash-device block 0.
    pub fn from_block(buf: &[u8]) -> Result<Self> {
        if buf.len() < SUPERBLOCK_SIZE {
            return Err(CvmbootError::InvalidArgument(
                "verity superblock block is too short".into(),
            ));
        }

        let signature: [u8; 8] = buf[0..8].try_into().unwrap();
        if signature != SIGNATURE {
            return Err(CvmbootError::CorruptFormat(
                "invalid verity superblock signature".into(),
            ));
        }

        let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let hash_type = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let uuid = guid_from_bytes(buf[16..32].try_into().unwrap());

        let algo_raw = &buf[32..64];
        let algo_len = algo_raw.iter().position(|&b| b == 0).unwrap_or(algo_raw.len());
        let algorithm = String::from_utf8_lossy(&algo_raw[..algo_len]).into_owned();

        let data_block_size = u32::from_le_bytes(buf[64..68].try_into().unwrap());
        let hash_block_size = u32::from_le_bytes(buf[68..72].try_into().unwrap());
        let data_blocks = u64::from_le_bytes(buf[72..80].try_into().unwrap());
        let salt_size = u16::from_le_bytes(buf[80..82].try_into().unwrap()) as usize;

        if salt_size > MAX_SALT_SIZE {
            return Err(CvmbootError::CorruptFormat(format!(
                "verity salt size {salt_size} exceeds the maximum of {MAX_SALT_SIZE}"
            )));
        }
        if hash_block_size as usize != BLOCK_SIZE {
            return Err(CvmbootError::CorruptFormat(
                "unexpected verity hash block size".into(),
            ));
        }

        let salt = buf[88..88 + salt_size].to_vec();

        Ok(Self {
            version,
            hash_type,
            uuid,
            algorithm,
            data_block_size,
            hash_block_size,
            data_blocks,
            salt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_block() {
        let sb = VeritySuperblock::new(Uuid::new_v4(), 1000, vec![0u8; ROOTHASH_SIZE]);
        let block = sb.to_block();
        assert_eq!(block.len(), BLOCK_SIZE);
        let back = VeritySuperblock::from_block(&block).unwrap();
        assert_eq!(sb, back);
    }

    #[test]
    fn rejects_bad_signature() {
        let buf = vec![0u8; BLOCK_SIZE];
        assert!(VeritySuperblock::from_block(&buf).is_err());
    }

    #[test]
    fn accepts_non_default_salt_size() {
        let mut sb = VeritySuperblock::new(Uuid::new_v4(), 1000, vec![0u8; ROOTHASH_SIZE]);
        sb.salt = vec![0xa5u8; 16];
        let block = sb.to_block();
        let back = VeritySuperblock::from_block(&block).unwrap();
        assert_eq!(back.salt, sb.salt);
    }

    #[test]
    fn rejects_salt_size_over_maximum() {
        let mut sb = VeritySuperblock::new(Uuid::new_v4(), 1000, vec![0u8; ROOTHASH_SIZE]);
        sb.salt = vec![0u8; MAX_SALT_SIZE];
        let mut block = sb.to_block();
        // Force an out-of-range salt_size field without touching the rest of the layout.
        block[80..82].copy_from_slice(&((MAX_SALT_SIZE + 1) as u16).to_le_bytes());
        assert!(VeritySuperblock::from_block(&block).is_err());
    }
}
