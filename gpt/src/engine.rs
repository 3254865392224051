//! GPT engine (spec component C): load, sort, validate, rewrite, and
//! CRC-stamp the primary and backup GPT; add/remove/resize partitions;
//! repair the backup location after a container resize.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cvmboot_core::{BlockDevice, CvmbootError, NoopReread, PartitionTableReread, Result};
use uuid::Uuid;

use crate::raw::{
    entries_crc, GptEntry, GptHeader, ENTRIES_BLOCKS, ENTRY_TYPENAME_LEN, HEADER_BLOCK_SIZE,
    HEADER_SIZE, MAX_ENTRIES, REVISION, SECTOR_SIZE, SIGNATURE,
};

/// One copy of the table: a header plus its 128-entry array.
#[derive(Debug, Clone)]
struct Table {
    header: GptHeader,
    entries: [GptEntry; MAX_ENTRIES],
}

impl Table {
    fn empty() -> Self {
        Self {
            header: GptHeader::zeroed(),
            entries: [GptEntry::empty(); MAX_ENTRIES],
        }
    }
}

/// An open GUID Partition Table, backed by a whole-disk [`BlockDevice`]
/// (512-byte sectors).
pub struct Gpt {
    path: PathBuf,
    blockdev: BlockDevice,
    primary: Table,
    backup: Table,
    num_entries: usize,
    writable: bool,
    reread: Arc<dyn PartitionTableReread>,
}

fn entry_is_empty(e: &GptEntry) -> bool {
    e.is_empty()
}

fn sort_entries(entries: &mut [GptEntry; MAX_ENTRIES]) {
    entries.sort_by_key(|e| {
        if entry_is_empty(e) {
            u64::MAX
        } else {
            e.starting_lba
        }
    });
}

fn count_entries(entries: &[GptEntry; MAX_ENTRIES]) -> usize {
    entries.iter().take_while(|e| !entry_is_empty(e)).count()
}

fn update_primary_header(header: &mut GptHeader, new_last_usable_lba: u64) {
    header.last_usable_lba = new_last_usable_lba;
    header.backup_lba = new_last_usable_lba + crate::raw::BACKUP_REGION_BLOCKS;
    header.update_crc();
}

fn generate_backup_header(primary: &GptHeader) -> GptHeader {
    let mut backup = *primary;
    std::mem::swap(&mut backup.primary_lba, &mut backup.backup_lba);
    backup.first_entry_lba = backup.last_usable_lba + 1;
    backup.update_crc();
    backup
}

impl Gpt {
    /// Opens `path` as a whole-disk GPT. `writable` selects read-write
    /// mode, which also enables entry-array sorting on load and CRC
    /// recomputation. `reread` is the kernel-partition-reread collaborator
    /// invoked by `sync`; pass [`NoopReread`] for plain disk images.
    pub fn open(path: impl AsRef<Path>, writable: bool) -> Result<Self> {
        Self::open_with_reread(path, writable, Arc::new(NoopReread))
    }

    pub fn open_with_reread(
        path: impl AsRef<Path>,
        writable: bool,
        reread: Arc<dyn PartitionTableReread>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let blockdev = BlockDevice::open(&path, writable, SECTOR_SIZE)?;

        let mut gpt = Self {
            path,
            blockdev,
            primary: Table::empty(),
            backup: Table::empty(),
            num_entries: 0,
            writable,
            reread,
        };

        gpt.load()?;
        Ok(gpt)
    }

    fn read_table(&mut self, start_lba: u64) -> Result<Table> {
        let header_bytes = self.blockdev.get(start_lba, 1)?;
        let header = GptHeader::from_bytes(&header_bytes)?;

        let entries_bytes = self.blockdev.get(start_lba + 1, ENTRIES_BLOCKS)?;
        let mut entries = [GptEntry::empty(); MAX_ENTRIES];
        for (i, chunk) in entries_bytes.chunks_exact(crate::raw::ENTRY_SIZE).enumerate() {
            entries[i] = GptEntry::from_bytes(chunk);
        }

        Ok(Table { header, entries })
    }

    fn load(&mut self) -> Result<()> {
        self.num_entries = 0;

        // MBR (block 0) + primary header (block 1) + entries (blocks 2..34).
        let header_bytes = self.blockdev.get(1, 1)?;
        let mut header = GptHeader::from_bytes(&header_bytes)?;
        if !header.has_valid_signature() {
            return Err(CvmbootError::CorruptFormat(
                "invalid GPT header signature".into(),
            ));
        }

        let entries_bytes = self.blockdev.get(2, ENTRIES_BLOCKS)?;
        let mut entries = [GptEntry::empty(); MAX_ENTRIES];
        for (i, chunk) in entries_bytes.chunks_exact(crate::raw::ENTRY_SIZE).enumerate() {
            entries[i] = GptEntry::from_bytes(chunk);
        }

        if self.writable {
            sort_entries(&mut entries);
        }

        self.num_entries = count_entries(&entries);

        let total_blocks = self.blockdev.file_size() / SECTOR_SIZE;
        let new_last_usable_lba = total_blocks - crate::raw::BACKUP_REGION_BLOCKS - 1;

        let backup;
        if new_last_usable_lba == header.last_usable_lba {
            let backup_start = new_last_usable_lba + 1;
            let mut backup_table = self.read_table(backup_start)?;
            if self.writable {
                sort_entries(&mut backup_table.entries);
            }

            if !backup_table.header.has_valid_signature() {
                return Err(CvmbootError::CorruptFormat(
                    "invalid backup GPT header signature".into(),
                ));
            }

            // Sanity: the primary header must regenerate to itself.
            let mut regenerated_primary = header;
            update_primary_header(&mut regenerated_primary, new_last_usable_lba);
            if regenerated_primary != header {
                return Err(CvmbootError::CorruptFormat(
                    "primary GPT header failed regeneration check".into(),
                ));
            }

            // Sanity: the backup header must regenerate from the primary.
            let regenerated_backup = generate_backup_header(&header);
            if regenerated_backup != backup_table.header {
                return Err(CvmbootError::CorruptFormat(
                    "backup GPT header failed regeneration check".into(),
                ));
            }

            if entries != backup_table.entries {
                return Err(CvmbootError::CorruptFormat(
                    "primary and backup entry arrays differ".into(),
                ));
            }

            backup = backup_table;
        } else {
            update_primary_header(&mut header, new_last_usable_lba);
            let backup_header = generate_backup_header(&header);
            backup = Table {
                header: backup_header,
                entries,
            };
        }

        self.primary = Table { header, entries };
        self.backup = backup;

        if self.writable {
            self.update_crcs()?;
        }

        Ok(())
    }

    fn update_crcs(&mut self) -> Result<()> {
        let primary_crc = entries_crc(&self.primary.entries);
        let backup_crc = entries_crc(&self.backup.entries);

        if primary_crc != backup_crc {
            return Err(CvmbootError::CorruptFormat(
                "primary and backup entry CRCs disagree".into(),
            ));
        }

        self.primary.header.entries_crc32 = primary_crc;
        self.backup.header.entries_crc32 = backup_crc;
        self.primary.header.update_crc();
        self.backup.header.update_crc();
        Ok(())
    }

    /// True iff the primary entry array is sorted by `starting_lba` with
    /// empty slots trailing and no non-empty entry following a gap.
    pub fn is_sorted(&self) -> bool {
        let mut found_null = false;
        for e in &self.primary.entries {
            if found_null && !entry_is_empty(e) {
                return false;
            }
            if entry_is_empty(e) {
                found_null = true;
            }
        }
        true
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    pub fn get_entry(&self, index: usize) -> Result<GptEntry> {
        if index >= self.num_entries {
            return Err(CvmbootError::OutOfRange(format!(
                "entry index {index} out of range"
            )));
        }
        Ok(self.primary.entries[index])
    }

    pub fn find_partition_by_unique(&self, unique_guid: Uuid) -> Option<usize> {
        self.primary.entries[..self.num_entries]
            .iter()
            .position(|e| e.unique_guid == unique_guid)
    }

    pub fn find_partition_by_type(&self, type_guid: Uuid) -> Option<usize> {
        self.primary.entries[..self.num_entries]
            .iter()
            .position(|e| e.type_guid == type_guid)
    }

    /// Bytes of unused space between the last partition's end and
    /// `last_usable_lba`.
    pub fn trailing_free_space(&self) -> Result<u64> {
        if self.num_entries == MAX_ENTRIES {
            return Err(CvmbootError::OutOfRange("entry array is full".into()));
        }

        let max_ending_lba = self.max_ending_lba();
        let gap = self.primary.header.last_usable_lba - max_ending_lba;
        Ok(gap * SECTOR_SIZE)
    }

    fn max_ending_lba(&self) -> u64 {
        let mut max = self.primary.header.first_usable_lba;
        for e in &self.primary.entries[..self.num_entries] {
            if e.ending_lba > max {
                max = e.ending_lba;
            }
        }
        max
    }

    /// Adds a new partition of `num_blocks` 512-byte sectors (0 meaning
    /// "use all remaining space, 2048-sector aligned"), syncing the result
    /// to disk. Returns the new entry's index.
    pub fn add_partition(
        &mut self,
        type_guid: Uuid,
        num_blocks: u64,
        attributes: u64,
        type_name: Option<[u16; ENTRY_TYPENAME_LEN]>,
    ) -> Result<usize> {
        if type_guid.is_nil() {
            return Err(CvmbootError::InvalidArgument(
                "type guid must not be nil".into(),
            ));
        }
        if self.num_entries == MAX_ENTRIES {
            return Err(CvmbootError::OutOfRange("entry array is full".into()));
        }

        let mut entry = GptEntry::empty();
        entry.type_guid = type_guid;
        entry.unique_guid = Uuid::new_v4();
        entry.attributes = attributes;
        if let Some(name) = type_name {
            entry.type_name = name;
        }

        let max_ending_lba = self.max_ending_lba();
        let starting_lba = max_ending_lba + 1;
        let ending_lba_limit = self.primary.header.last_usable_lba;

        if ending_lba_limit <= starting_lba {
            return Err(CvmbootError::OutOfSpace(
                "no space left before last usable LBA".into(),
            ));
        }

        let gap = ending_lba_limit - starting_lba;

        entry.starting_lba = starting_lba;
        if num_blocks == 0 {
            let mut ending = self.primary.header.last_usable_lba;
            ending &= !0x7ff;
            entry.ending_lba = ending - 1;
        } else {
            if gap < num_blocks {
                return Err(CvmbootError::OutOfSpace(format!(
                    "requested {num_blocks} blocks but only {gap} available"
                )));
            }
            let aligned = num_blocks.div_ceil(2048) * 2048;
            entry.ending_lba = starting_lba + aligned - 1;
            if entry.ending_lba > self.primary.header.last_usable_lba {
                return Err(CvmbootError::OutOfRange(
                    "partition would exceed last usable LBA".into(),
                ));
            }
        }

        self.primary.entries[self.num_entries] = entry;
        self.backup.entries[self.num_entries] = entry;
        self.num_entries += 1;

        self.update_crcs()?;
        self.sync()?;

        Ok(self.num_entries - 1)
    }

    /// Removes the partition at `index`, shifting subsequent entries left
    /// and zeroing the vacated trailing slot.
    pub fn remove_partition(&mut self, index: usize) -> Result<()> {
        if index >= self.num_entries {
            return Err(CvmbootError::OutOfRange(format!(
                "entry index {index} out of range"
            )));
        }

        self.primary.entries.copy_within(index + 1..self.num_entries, index);
        self.backup.entries.copy_within(index + 1..self.num_entries, index);

        self.num_entries -= 1;
        self.primary.entries[self.num_entries] = GptEntry::empty();
        self.backup.entries[self.num_entries] = GptEntry::empty();

        self.update_crcs()?;
        self.sync()
    }

    /// Removes every partition whose type GUID is `type_guid`.
    pub fn remove_partitions_by_type(&mut self, type_guid: Uuid) -> Result<usize> {
        let mut count = 0;
        while let Some(index) = self.find_partition_by_type(type_guid) {
            self.remove_partition(index)?;
            count += 1;
        }
        Ok(count)
    }

    /// Resizes the partition at `index` to `num_sectors` (0 meaning "grow
    /// to the next partition's start, or to `last_usable_lba` if last"),
    /// rounding so the partition length is a multiple of 8 sectors (4096
    /// bytes). Refuses to shrink. Returns the new sector count.
    pub fn resize_partition(&mut self, index: usize, num_sectors: u64) -> Result<u64> {
        if index >= self.num_entries {
            return Err(CvmbootError::OutOfRange(format!(
                "entry index {index} out of range"
            )));
        }

        let mut entry = self.primary.entries[index];

        let max_usable_lba = if index + 1 == self.num_entries {
            self.primary.header.last_usable_lba
        } else {
            self.primary.entries[index + 1].starting_lba - 1
        };

        let mut new_ending_lba = if num_sectors == 0 {
            max_usable_lba
        } else {
            entry.starting_lba + num_sectors - 1
        };

        if new_ending_lba > max_usable_lba {
            return Err(CvmbootError::OutOfRange(
                "requested size exceeds available space".into(),
            ));
        }

        let mut sectors = new_ending_lba - entry.starting_lba + 1;
        if sectors % 8 != 0 {
            sectors -= sectors % 8;
            new_ending_lba = entry.starting_lba + sectors - 1;
        }

        if new_ending_lba < entry.ending_lba {
            return Err(CvmbootError::OutOfRange(
                "resize_partition cannot shrink a partition".into(),
            ));
        }

        entry.ending_lba = new_ending_lba;
        self.primary.entries[index] = entry;
        self.backup.entries[index] = entry;

        self.update_crcs()?;
        self.sync()?;

        Ok(entry.ending_lba - entry.starting_lba + 1)
    }

    /// Writes the primary and backup GPT to disk and asks the kernel to
    /// reread the partition table.
    pub fn sync(&mut self) -> Result<()> {
        if !self.primary.header.has_valid_signature() {
            return Err(CvmbootError::InvalidArgument(
                "primary GPT has not been loaded".into(),
            ));
        }
        if !self.backup.header.has_valid_signature() {
            return Err(CvmbootError::InvalidArgument(
                "backup GPT has not been loaded".into(),
            ));
        }

        let last_usable = self.primary.header.last_usable_lba;
        let backup_lba = self.primary.header.backup_lba;
        let offset1 = (last_usable + 1) * SECTOR_SIZE;
        let offset2 = backup_lba * SECTOR_SIZE - crate::raw::ENTRIES_ARRAY_SIZE;
        if offset1 != offset2 {
            return Err(CvmbootError::CorruptFormat(
                "backup LBA is inconsistent with last usable LBA".into(),
            ));
        }

        // Primary: MBR block untouched; header at block 1, entries at 2..34.
        self.blockdev.put(1, 1, &self.primary.header.to_bytes())?;
        let mut entries_bytes = Vec::with_capacity(crate::raw::ENTRIES_ARRAY_SIZE as usize);
        for e in &self.primary.entries {
            entries_bytes.extend_from_slice(&e.to_bytes());
        }
        self.blockdev.put(2, ENTRIES_BLOCKS, &entries_bytes)?;

        // Backup: entries then header at the tail.
        let backup_entries_lba = self.primary.header.backup_lba - ENTRIES_BLOCKS;
        let mut backup_entries_bytes = Vec::with_capacity(crate::raw::ENTRIES_ARRAY_SIZE as usize);
        for e in &self.backup.entries {
            backup_entries_bytes.extend_from_slice(&e.to_bytes());
        }
        self.blockdev
            .put(backup_entries_lba, ENTRIES_BLOCKS, &backup_entries_bytes)?;
        self.blockdev
            .put(self.primary.header.backup_lba, 1, &self.backup.header.to_bytes())?;

        self.blockdev.flush()?;

        self.reread_with_retry()
    }

    fn reread_with_retry(&self) -> Result<()> {
        // Eagerly, without delay, matching the original's tight retry loop.
        for _ in 0..16 {
            if self.reread.try_reread_once(&self.path).is_ok() {
                return Ok(());
            }
        }

        // Then exponential backoff up to roughly one second.
        let mut delay = Duration::from_micros(2000);
        let mut last_err = None;
        for _ in 0..10 {
            match self.reread.try_reread_once(&self.path) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_err = Some(e);
                    std::thread::sleep(delay);
                    delay *= 2;
                }
            }
        }

        Err(last_err.unwrap_or(CvmbootError::IoError(std::io::Error::other(
            "partition table reread failed",
        ))))
    }
}

/// Byte offset of `entry`'s partition on disk.
pub fn entry_offset(entry: &GptEntry) -> u64 {
    entry.starting_lba * SECTOR_SIZE
}

/// Byte length of `entry`'s partition.
pub fn entry_size(entry: &GptEntry) -> u64 {
    (entry.ending_lba - entry.starting_lba + 1) * SECTOR_SIZE
}

/// Creates a brand-new GPT (MBR + primary header + entries + backup) on a
/// freshly sized, all-zero container at `path`, ready to be opened with
/// [`Gpt::open`]. Used by the lifecycle driver's `prepare` step when
/// starting from a raw (partitionless) disk image copy.
pub fn format_new_gpt(path: impl AsRef<Path>, disk_guid: Uuid) -> Result<()> {
    let path = path.as_ref();
    let total_size = cvmboot_core::getsize64(path)?;
    let total_blocks = total_size / SECTOR_SIZE;
    if total_blocks < crate::raw::PRIMARY_REGION_BLOCKS + crate::raw::BACKUP_REGION_BLOCKS {
        return Err(CvmbootError::OutOfRange(
            "container too small to hold a GPT".into(),
        ));
    }

    let last_usable_lba = total_blocks - crate::raw::BACKUP_REGION_BLOCKS - 1;

    let mut header = GptHeader::zeroed();
    header.signature = SIGNATURE;
    header.revision = REVISION;
    header.header_size = HEADER_SIZE;
    header.primary_lba = 1;
    header.first_usable_lba = crate::raw::PRIMARY_REGION_BLOCKS;
    header.disk_guid = disk_guid;
    header.first_entry_lba = 2;
    header.number_of_entries = MAX_ENTRIES as u32;
    header.size_of_entry = crate::raw::ENTRY_SIZE as u32;
    update_primary_header(&mut header, last_usable_lba);

    let backup_header = generate_backup_header(&header);
    let entries = [GptEntry::empty(); MAX_ENTRIES];

    let mut dev = BlockDevice::open(path, true, SECTOR_SIZE)?;
    // MBR (protective, block 0) left as whatever the container has
    // (usually zero, or a protective MBR installed by the caller).
    dev.put(1, 1, &header.to_bytes())?;
    let mut entries_bytes = Vec::with_capacity(crate::raw::ENTRIES_ARRAY_SIZE as usize);
    for e in &entries {
        entries_bytes.extend_from_slice(&e.to_bytes());
    }
    dev.put(2, ENTRIES_BLOCKS, &entries_bytes)?;
    let backup_entries_lba = header.backup_lba - ENTRIES_BLOCKS;
    dev.put(backup_entries_lba, ENTRIES_BLOCKS, &entries_bytes)?;
    dev.put(header.backup_lba, 1, &backup_header.to_bytes())?;
    dev.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn scratch_disk(total_blocks: u64) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; (total_blocks * SECTOR_SIZE) as usize])
            .unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn format_then_open_round_trips() {
        let f = scratch_disk(10000);
        format_new_gpt(f.path(), Uuid::new_v4()).unwrap();

        let gpt = Gpt::open(f.path(), true).unwrap();
        assert_eq!(gpt.num_entries(), 0);
        assert!(gpt.is_sorted());
    }

    #[test]
    fn add_and_remove_partition() {
        let f = scratch_disk(20000);
        format_new_gpt(f.path(), Uuid::new_v4()).unwrap();

        let mut gpt = Gpt::open(f.path(), true).unwrap();
        let type_guid = cvmboot_core::guid::linux_filesystem_type_guid();
        let idx = gpt.add_partition(type_guid, 4096, 0, None).unwrap();
        assert_eq!(idx, 0);
        assert_eq!(gpt.num_entries(), 1);

        let entry = gpt.get_entry(idx).unwrap();
        assert_eq!(entry_size(&entry), 4096 * SECTOR_SIZE);

        gpt.remove_partition(idx).unwrap();
        assert_eq!(gpt.num_entries(), 0);
    }

    #[test]
    fn reopen_after_sync_is_byte_equal() {
        let f = scratch_disk(20000);
        format_new_gpt(f.path(), Uuid::new_v4()).unwrap();

        {
            let mut gpt = Gpt::open(f.path(), true).unwrap();
            gpt.add_partition(cvmboot_core::guid::linux_filesystem_type_guid(), 0, 0, None)
                .unwrap();
        }

        let gpt2 = Gpt::open(f.path(), true).unwrap();
        assert_eq!(gpt2.num_entries(), 1);
    }

    #[test]
    fn add_partition_fails_when_entries_full() {
        let f = scratch_disk(40_000_000 / 512);
        format_new_gpt(f.path(), Uuid::new_v4()).unwrap();
        let mut gpt = Gpt::open(f.path(), true).unwrap();

        for _ in 0..MAX_ENTRIES {
            gpt.add_partition(cvmboot_core::guid::linux_filesystem_type_guid(), 8, 0, None)
                .unwrap();
        }

        let result = gpt.add_partition(cvmboot_core::guid::linux_filesystem_type_guid(), 8, 0, None);
        assert!(result.is_err());
    }

    #[test]
    fn resize_partition_refuses_to_shrink() {
        let f = scratch_disk(20000);
        format_new_gpt(f.path(), Uuid::new_v4()).unwrap();
        let mut gpt = Gpt::open(f.path(), true).unwrap();
        let idx = gpt
            .add_partition(cvmboot_core::guid::linux_filesystem_type_guid(), 4096, 0, None)
            .unwrap();

        assert!(gpt.resize_partition(idx, 8).is_err());
    }
}
