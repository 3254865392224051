//! On-disk byte layout of the GPT header and entry (spec §3/§6).

use cvmboot_core::guid::{guid_from_bytes, guid_to_bytes};
use cvmboot_core::{CvmbootError, Result};
use uuid::Uuid;

pub const SECTOR_SIZE: u64 = 512;
pub const MBR_SIZE: u64 = 512;
pub const HEADER_BLOCK_SIZE: u64 = 512;
/// The meaningful byte length of the header (the value stored in
/// `header_size` and the number of bytes the header CRC32 covers).
pub const HEADER_SIZE: u32 = 92;
pub const MAX_ENTRIES: usize = 128;
pub const ENTRY_SIZE: usize = 128;
pub const ENTRY_TYPENAME_LEN: usize = 36;
pub const ENTRIES_ARRAY_SIZE: u64 = (MAX_ENTRIES * ENTRY_SIZE) as u64;
pub const ENTRIES_BLOCKS: u64 = ENTRIES_ARRAY_SIZE / HEADER_BLOCK_SIZE;
/// Entries (32 blocks) + backup header (1 block).
pub const BACKUP_REGION_BLOCKS: u64 = ENTRIES_BLOCKS + 1;
/// MBR (1) + primary header (1) + primary entries (32).
pub const PRIMARY_REGION_BLOCKS: u64 = 2 + ENTRIES_BLOCKS;

pub const SIGNATURE: [u8; 8] = *b"EFI PART";
pub const REVISION: u32 = 0x0001_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptHeader {
    pub signature: [u8; 8],
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub reserved: u32,
    pub primary_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Uuid,
    pub first_entry_lba: u64,
    pub number_of_entries: u32,
    pub size_of_entry: u32,
    pub entries_crc32: u32,
}

impl GptHeader {
    pub fn zeroed() -> Self {
        Self {
            signature: [0; 8],
            revision: 0,
            header_size: 0,
            header_crc32: 0,
            reserved: 0,
            primary_lba: 0,
            backup_lba: 0,
            first_usable_lba: 0,
            last_usable_lba: 0,
            disk_guid: Uuid::nil(),
            first_entry_lba: 0,
            number_of_entries: 0,
            size_of_entry: 0,
            entries_crc32: 0,
        }
    }

    pub fn has_valid_signature(&self) -> bool {
        self.signature == SIGNATURE
    }

    /// Parses a 512-byte on-disk block into a header (padding is discarded).
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != HEADER_BLOCK_SIZE as usize {
            return Err(CvmbootError::InvalidArgument(
                "GPT header block must be 512 bytes".into(),
            ));
        }

        let signature: [u8; 8] = buf[0..8].try_into().unwrap();
        let revision = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let header_size = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let header_crc32 = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let reserved = u32::from_le_bytes(buf[20..24].try_into().unwrap());
        let primary_lba = u64::from_le_bytes(buf[24..32].try_into().unwrap());
        let backup_lba = u64::from_le_bytes(buf[32..40].try_into().unwrap());
        let first_usable_lba = u64::from_le_bytes(buf[40..48].try_into().unwrap());
        let last_usable_lba = u64::from_le_bytes(buf[48..56].try_into().unwrap());
        let disk_guid = guid_from_bytes(buf[56..72].try_into().unwrap());
        let first_entry_lba = u64::from_le_bytes(buf[72..80].try_into().unwrap());
        let number_of_entries = u32::from_le_bytes(buf[80..84].try_into().unwrap());
        let size_of_entry = u32::from_le_bytes(buf[84..88].try_into().unwrap());
        let entries_crc32 = u32::from_le_bytes(buf[88..92].try_into().unwrap());

        Ok(Self {
            signature,
            revision,
            header_size,
            header_crc32,
            reserved,
            primary_lba,
            backup_lba,
            first_usable_lba,
            last_usable_lba,
            disk_guid,
            first_entry_lba,
            number_of_entries,
            size_of_entry,
            entries_crc32,
        })
    }

    /// Serializes to a full 512-byte on-disk block, zero-padded after the
    /// 92 meaningful bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_BLOCK_SIZE as usize] {
        let mut buf = [0u8; HEADER_BLOCK_SIZE as usize];
        buf[0..8].copy_from_slice(&self.signature);
        buf[8..12].copy_from_slice(&self.revision.to_le_bytes());
        buf[12..16].copy_from_slice(&self.header_size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.header_crc32.to_le_bytes());
        buf[20..24].copy_from_slice(&self.reserved.to_le_bytes());
        buf[24..32].copy_from_slice(&self.primary_lba.to_le_bytes());
        buf[32..40].copy_from_slice(&self.backup_lba.to_le_bytes());
        buf[40..48].copy_from_slice(&self.first_usable_lba.to_le_bytes());
        buf[48..56].copy_from_slice(&self.last_usable_lba.to_le_bytes());
        buf[56..72].copy_from_slice(&guid_to_bytes(&self.disk_guid));
        buf[72..80].copy_from_slice(&self.first_entry_lba.to_le_bytes());
        buf[80..84].copy_from_slice(&self.number_of_entries.to_le_bytes());
        buf[84..88].copy_from_slice(&self.size_of_entry.to_le_bytes());
        buf[88..92].copy_from_slice(&self.entries_crc32.to_le_bytes());
        buf
    }

    /// Computes the CRC32 of this header over exactly `header_size` bytes
    /// with `header_crc32` treated as zero, and stores it.
    pub fn update_crc(&mut self) {
        self.header_crc32 = 0;
        let bytes = self.to_bytes();
        let region = &bytes[..self.header_size as usize];
        self.header_crc32 = crc32fast::hash(region);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptEntry {
    pub type_guid: Uuid,
    pub unique_guid: Uuid,
    pub starting_lba: u64,
    pub ending_lba: u64,
    pub attributes: u64,
    pub type_name: [u16; ENTRY_TYPENAME_LEN],
}

impl GptEntry {
    pub fn empty() -> Self {
        Self {
            type_guid: Uuid::nil(),
            unique_guid: Uuid::nil(),
            starting_lba: 0,
            ending_lba: 0,
            attributes: 0,
            type_name: [0; ENTRY_TYPENAME_LEN],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.type_guid.is_nil()
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let type_guid = guid_from_bytes(buf[0..16].try_into().unwrap());
        let unique_guid = guid_from_bytes(buf[16..32].try_into().unwrap());
        let starting_lba = u64::from_le_bytes(buf[32..40].try_into().unwrap());
        let ending_lba = u64::from_le_bytes(buf[40..48].try_into().unwrap());
        let attributes = u64::from_le_bytes(buf[48..56].try_into().unwrap());
        let mut type_name = [0u16; ENTRY_TYPENAME_LEN];
        for (i, chunk) in buf[56..128].chunks_exact(2).enumerate() {
            type_name[i] = u16::from_le_bytes(chunk.try_into().unwrap());
        }
        Self {
            type_guid,
            unique_guid,
            starting_lba,
            ending_lba,
            attributes,
            type_name,
        }
    }

    pub fn to_bytes(&self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0u8; ENTRY_SIZE];
        buf[0..16].copy_from_slice(&guid_to_bytes(&self.type_guid));
        buf[16..32].copy_from_slice(&guid_to_bytes(&self.unique_guid));
        buf[32..40].copy_from_slice(&self.starting_lba.to_le_bytes());
        buf[40..48].copy_from_slice(&self.ending_lba.to_le_bytes());
        buf[48..56].copy_from_slice(&self.attributes.to_le_bytes());
        for (i, v) in self.type_name.iter().enumerate() {
            buf[56 + i * 2..58 + i * 2].copy_from_slice(&v.to_le_bytes());
        }
        buf
    }
}

/// CRC32 over the full 128 * 128-byte entries array (including empty
/// slots).
pub fn entries_crc(entries: &[GptEntry; MAX_ENTRIES]) -> u32 {
    let mut buf = Vec::with_capacity(ENTRIES_ARRAY_SIZE as usize);
    for e in entries {
        buf.extend_from_slice(&e.to_bytes());
    }
    crc32fast::hash(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let mut h = GptHeader::zeroed();
        h.signature = SIGNATURE;
        h.revision = REVISION;
        h.header_size = HEADER_SIZE;
        h.primary_lba = 1;
        h.backup_lba = 1000;
        h.first_usable_lba = 34;
        h.last_usable_lba = 966;
        h.disk_guid = Uuid::new_v4();
        h.first_entry_lba = 2;
        h.number_of_entries = 128;
        h.size_of_entry = 128;
        h.update_crc();

        let bytes = h.to_bytes();
        let back = GptHeader::from_bytes(&bytes).unwrap();
        assert_eq!(h, back);
    }

    #[test]
    fn entry_round_trips() {
        let mut e = GptEntry::empty();
        e.type_guid = Uuid::new_v4();
        e.unique_guid = Uuid::new_v4();
        e.starting_lba = 34;
        e.ending_lba = 1000;
        e.attributes = 0x8000_0000_0000_0001;
        let bytes = e.to_bytes();
        let back = GptEntry::from_bytes(&bytes);
        assert_eq!(e, back);
    }

    #[test]
    fn crc_ignores_current_crc_field() {
        let mut h = GptHeader::zeroed();
        h.signature = SIGNATURE;
        h.header_size = HEADER_SIZE;
        h.update_crc();
        let crc1 = h.header_crc32;
        h.header_crc32 = 0xdead_beef;
        h.update_crc();
        assert_eq!(h.header_crc32, crc1);
    }
}
