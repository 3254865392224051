//! Hash-tree construction, sizing, and verification (spec component D).
//!
//! The tree is laid out root-first: block 0 of the hash device is the
//! superblock, block 1 starts the root level, and the leaf level (one
//! digest per data block) occupies the tail of the file. Each interior
//! node packs 128 child digests (4096 / 32).

use std::path::Path;

use cvmboot_core::{BlockDevice, CvmbootError, Result};
use cvmboot_sparse::{frags_find, frags_set_bits};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::superblock::{VeritySuperblock, BLOCK_SIZE, MIN_HASH_DEV_SIZE, ROOTHASH_SIZE};

const DIGESTS_PER_BLOCK: usize = BLOCK_SIZE / ROOTHASH_SIZE;

fn all_zeros(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

fn salted_hash(salt: &[u8], data: &[u8]) -> [u8; ROOTHASH_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(data);
    hasher.finalize().into()
}

/// Node counts of each hash-tree level, index 0 being the leaves (one
/// digest per data block) and the last index the single root node.
fn level_sizes(num_data_blocks: u64) -> Vec<u64> {
    let mut levels = Vec::new();
    let mut n = num_data_blocks;
    loop {
        n = n.div_ceil(DIGESTS_PER_BLOCK as u64);
        levels.push(n);
        if n <= 1 {
            break;
        }
    }
    levels
}

/// Computes the size in bytes a hash device must have to cover a data
/// device of `data_dev_size` bytes.
pub fn hash_dev_size(data_dev_size: u64) -> Result<u64> {
    if data_dev_size % BLOCK_SIZE as u64 != 0 {
        return Err(CvmbootError::OutOfRange(
            "data device size is not a multiple of the verity block size".into(),
        ));
    }
    if data_dev_size < 2 * BLOCK_SIZE as u64 {
        return Err(CvmbootError::OutOfRange(
            "data device is smaller than the minimum verity data size".into(),
        ));
    }

    let nblks = data_dev_size / BLOCK_SIZE as u64;
    let total_nodes: u64 = level_sizes(nblks).iter().sum();
    let size = (total_nodes + 1) * BLOCK_SIZE as u64;
    Ok(size.max(MIN_HASH_DEV_SIZE))
}

/// Formats `hash_dev` as the verity hash tree for `data_dev_path`, writing
/// the superblock and every hash-tree node. Returns the root hash.
///
/// Reads the data device's own sparse extents (if any) to skip reading
/// holes entirely, and additionally treats any all-zero block read from a
/// non-sparse region as equivalent to a hole for hashing purposes -- both
/// paths contribute the precomputed zero-block hash.
pub fn format(
    data_dev_path: impl AsRef<Path>,
    hash_dev: &mut BlockDevice,
    verity_uuid: Uuid,
) -> Result<[u8; ROOTHASH_SIZE]> {
    let data_dev_path = data_dev_path.as_ref();
    let data_dev_size = cvmboot_core::getsize64(data_dev_path)?;

    if data_dev_size % BLOCK_SIZE as u64 != 0 {
        return Err(CvmbootError::OutOfRange(
            "data device size is not a multiple of the verity block size".into(),
        ));
    }
    if data_dev_size < 2 * BLOCK_SIZE as u64 {
        return Err(CvmbootError::OutOfRange(
            "data device is smaller than the minimum verity data size".into(),
        ));
    }

    // Zero salt by default: deterministic output for identical input images,
    // which is what reproducible image signing needs.
    let salt = vec![0u8; ROOTHASH_SIZE];
    let zero_hash = salted_hash(&salt, &[0u8; BLOCK_SIZE]);

    let nblks = data_dev_size / BLOCK_SIZE as u64;
    let levels = level_sizes(nblks);
    let nlevels = levels.len();
    let total_nodes: u64 = levels.iter().sum();

    let num_hash_blocks = hash_dev.file_size() / hash_dev.block_size();
    let mut written = vec![false; num_hash_blocks as usize];

    let (non_sparse_frags, holes) = frags_find(data_dev_path, 0, data_dev_size)?;
    let non_sparse_bits = if holes.is_empty() {
        None
    } else {
        Some(frags_set_bits(&non_sparse_frags, nblks))
    };

    let data_file = std::fs::File::open(data_dev_path)?;

    let mut last_node = vec![0u8; BLOCK_SIZE];

    // Leaf level occupies the tail of the hash file.
    {
        let leaves_start_block = 1 + (total_nodes - levels[0]);
        let mut node = vec![0u8; BLOCK_SIZE];
        let mut node_offset = 0usize;
        let mut block_cursor = leaves_start_block;

        for blkno in 0..nblks {
            let is_sparse = non_sparse_bits
                .as_ref()
                .map(|bits| !bits[blkno as usize])
                .unwrap_or(false);

            let hash = if is_sparse {
                zero_hash
            } else {
                use std::io::{Read, Seek, SeekFrom};
                let mut buf = vec![0u8; BLOCK_SIZE];
                let mut f = &data_file;
                f.seek(SeekFrom::Start(blkno * BLOCK_SIZE as u64))?;
                f.read_exact(&mut buf)?;
                if all_zeros(&buf) {
                    zero_hash
                } else {
                    salted_hash(&salt, &buf)
                }
            };

            if node_offset + ROOTHASH_SIZE > BLOCK_SIZE {
                hash_dev.put(block_cursor, 1, &node)?;
                written[block_cursor as usize] = true;
                last_node = node.clone();
                block_cursor += 1;
                node = vec![0u8; BLOCK_SIZE];
                node_offset = 0;
            }

            node[node_offset..node_offset + ROOTHASH_SIZE].copy_from_slice(&hash);
            node_offset += ROOTHASH_SIZE;
        }

        if node_offset > 0 {
            hash_dev.put(block_cursor, 1, &node)?;
            written[block_cursor as usize] = true;
            last_node = node;
        }
    }

    // Interior levels, from the level just above the leaves up to the root.
    for i in 1..nlevels {
        let read_block_of = |level: usize| -> u64 {
            let trailing: u64 = levels[level + 1..].iter().sum();
            1 + trailing
        };

        let mut read_block = read_block_of(i - 1);
        let mut write_block = read_block_of(i);

        let mut remaining_to_read = levels[i - 1];

        for _ in 0..levels[i] {
            let mut node = vec![0u8; BLOCK_SIZE];
            let mut node_offset = 0usize;

            while remaining_to_read > 0 && node_offset + ROOTHASH_SIZE <= BLOCK_SIZE {
                if !written[read_block as usize] {
                    hash_dev.put(read_block, 1, &vec![0u8; BLOCK_SIZE])?;
                }
                let block = hash_dev.get(read_block, 1)?;
                read_block += 1;

                let hash = salted_hash(&salt, &block);
                node[node_offset..node_offset + ROOTHASH_SIZE].copy_from_slice(&hash);
                node_offset += ROOTHASH_SIZE;
                remaining_to_read -= 1;
            }

            hash_dev.put(write_block, 1, &node)?;
            written[write_block as usize] = true;
            last_node = node;
            write_block += 1;
        }
    }

    let roothash = salted_hash(&salt, &last_node);

    let sb = VeritySuperblock::new(verity_uuid, nblks, salt);
    hash_dev.put(0, 1, &sb.to_block())?;
    written[0] = true;

    for blkno in 0..num_hash_blocks {
        if !written[blkno as usize] {
            hash_dev.put(blkno, 1, &vec![0u8; BLOCK_SIZE])?;
        }
    }

    Ok(roothash)
}

/// Reads the on-disk superblock from block 0 of `hash_dev`.
pub fn get_superblock(hash_dev: &mut BlockDevice) -> Result<VeritySuperblock> {
    let block = hash_dev.get(0, 1)?;
    VeritySuperblock::from_block(&block)
}

/// Reads the superblock and recomputes the root hash from hash-tree block 1
/// (the root node), without walking the whole tree.
pub fn get_roothash(hash_dev: &mut BlockDevice) -> Result<[u8; ROOTHASH_SIZE]> {
    let sb = get_superblock(hash_dev)?;
    let root_block = hash_dev.get(1, 1)?;
    Ok(salted_hash(&sb.salt, &root_block))
}

/// The verified hash tree loaded into memory, with its leaf digests
/// delimited for fast per-block lookups during data verification.
pub struct HashTree {
    pub data: Vec<u8>,
    pub leaves_start: usize,
    pub leaves_end: usize,
}

/// Loads every hash-tree node into memory and verifies each node's hash
/// matches the digest recorded by its parent (or the caller-supplied
/// `roothash` for the root).
pub fn load_hash_tree(
    hash_dev: &mut BlockDevice,
    sb: &VeritySuperblock,
    roothash: &[u8; ROOTHASH_SIZE],
) -> Result<HashTree> {
    if sb.hash_block_size as usize != BLOCK_SIZE || sb.data_block_size as usize != BLOCK_SIZE {
        return Err(CvmbootError::InvalidArgument(
            "unsupported verity block size".into(),
        ));
    }
    if sb.algorithm != "sha256" {
        return Err(CvmbootError::InvalidArgument(
            "unsupported verity hash algorithm".into(),
        ));
    }

    let levels = level_sizes(sb.data_blocks);
    let nlevels = levels.len();
    let total_nodes: u64 = levels.iter().sum();

    // offsets[i] = block offset (after the superblock) of level i's first node.
    let mut offsets = vec![0u64; nlevels];
    let mut offset = 0u64;
    for i in (0..nlevels).rev() {
        offsets[i] = offset;
        offset += levels[i];
    }

    let mut data = vec![0u8; (total_nodes as usize) * BLOCK_SIZE];
    for i in 0..total_nodes {
        let block = hash_dev.get(i + 1, 1)?;
        data[(i as usize) * BLOCK_SIZE..(i as usize + 1) * BLOCK_SIZE].copy_from_slice(&block);
    }

    let leaves_start = (offsets[0] as usize) * BLOCK_SIZE;
    let leaves_end = data.len();

    let mut nchecks = 0u64;
    for i in 0..nlevels {
        let nnodes = levels[i];
        let level_offset = offsets[i];
        let parent_offset = if i + 1 != nlevels {
            Some(offsets[i + 1] as usize * BLOCK_SIZE)
        } else {
            None
        };

        for j in 0..nnodes {
            let index = (level_offset + j) as usize;
            let node = &data[index * BLOCK_SIZE..(index + 1) * BLOCK_SIZE];
            let hash = salted_hash(&sb.salt, node);

            match parent_offset {
                Some(poff) => {
                    let phash_off = poff + (j as usize) * ROOTHASH_SIZE;
                    let phash = &data[phash_off..phash_off + ROOTHASH_SIZE];
                    if phash != hash {
                        return Err(CvmbootError::HashMismatch(format!(
                            "hash tree node {index} does not match its parent digest"
                        )));
                    }
                }
                None => {
                    if hash != *roothash {
                        return Err(CvmbootError::HashMismatch(
                            "hash tree root does not match the supplied root hash".into(),
                        ));
                    }
                }
            }

            nchecks += 1;
        }
    }

    if nchecks != total_nodes {
        return Err(CvmbootError::CorruptFormat(
            "hash tree verification did not cover every node".into(),
        ));
    }

    Ok(HashTree {
        data,
        leaves_start,
        leaves_end,
    })
}

/// Verifies every block of `data_dev` against the loaded `hashtree`'s leaf
/// digests, using the same sparse/zero-block fast path as [`format`].
pub fn verify_data_device(
    data_dev_path: impl AsRef<Path>,
    sb: &VeritySuperblock,
    hashtree: &HashTree,
) -> Result<()> {
    let data_dev_path = data_dev_path.as_ref();
    let data_dev_size = cvmboot_core::getsize64(data_dev_path)?;

    if sb.data_blocks != data_dev_size / BLOCK_SIZE as u64 {
        return Err(CvmbootError::InvalidArgument(
            "data device size does not match the verity superblock".into(),
        ));
    }

    let zero_hash = salted_hash(&sb.salt, &[0u8; BLOCK_SIZE]);

    let (non_sparse_frags, holes) = frags_find(data_dev_path, 0, data_dev_size)?;
    let non_sparse_bits = if holes.is_empty() {
        None
    } else {
        Some(frags_set_bits(&non_sparse_frags, sb.data_blocks))
    };

    let data_file = std::fs::File::open(data_dev_path)?;

    let mut check_count = 0u64;
    for blkno in 0..sb.data_blocks {
        let is_sparse = non_sparse_bits
            .as_ref()
            .map(|bits| !bits[blkno as usize])
            .unwrap_or(false);

        let hash = if is_sparse {
            zero_hash
        } else {
            use std::io::{Read, Seek, SeekFrom};
            let mut buf = vec![0u8; BLOCK_SIZE];
            let mut f = &data_file;
            f.seek(SeekFrom::Start(blkno * BLOCK_SIZE as u64))?;
            f.read_exact(&mut buf)?;
            if all_zeros(&buf) {
                zero_hash
            } else {
                salted_hash(&sb.salt, &buf)
            }
        };

        let leaf_off = hashtree.leaves_start + (blkno as usize) * ROOTHASH_SIZE;
        if leaf_off + ROOTHASH_SIZE > hashtree.leaves_end {
            return Err(CvmbootError::OutOfRange(
                "data block index exceeds the hash tree's leaf range".into(),
            ));
        }

        if hash != hashtree.data[leaf_off..leaf_off + ROOTHASH_SIZE] {
            return Err(CvmbootError::HashMismatch(format!(
                "data block {blkno} failed verity verification"
            )));
        }

        check_count += 1;
    }

    if check_count != sb.data_blocks {
        return Err(CvmbootError::CorruptFormat(
            "data device verification did not cover every block".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn scratch_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn hash_dev_size_respects_minimum() {
        let size = hash_dev_size(2 * BLOCK_SIZE as u64).unwrap();
        assert_eq!(size, MIN_HASH_DEV_SIZE);
    }

    #[test]
    fn hash_dev_size_grows_with_data_blocks() {
        let small = hash_dev_size(256 * BLOCK_SIZE as u64).unwrap();
        let large = hash_dev_size(1_000_000 * BLOCK_SIZE as u64).unwrap();
        assert!(large > small);
    }

    #[test]
    fn format_then_verify_round_trips() {
        let nblks = 10u64;
        let data = vec![0x7au8; (nblks * BLOCK_SIZE as u64) as usize];
        let data_file = scratch_file(&data);

        let hash_size = hash_dev_size((nblks * BLOCK_SIZE as u64)).unwrap();
        let hash_file = scratch_file(&vec![0u8; hash_size as usize]);

        let mut hash_dev = BlockDevice::open(hash_file.path(), true, BLOCK_SIZE as u64).unwrap();
        let roothash = format(data_file.path(), &mut hash_dev, Uuid::new_v4()).unwrap();

        let sb = get_superblock(&mut hash_dev).unwrap();
        assert_eq!(sb.data_blocks, nblks);

        let tree = load_hash_tree(&mut hash_dev, &sb, &roothash).unwrap();
        verify_data_device(data_file.path(), &sb, &tree).unwrap();
    }

    #[test]
    fn format_then_verify_detects_tamper() {
        let nblks = 10u64;
        let mut data = vec![0x7au8; (nblks * BLOCK_SIZE as u64) as usize];
        let data_file = scratch_file(&data);

        let hash_size = hash_dev_size(nblks * BLOCK_SIZE as u64).unwrap();
        let hash_file = scratch_file(&vec![0u8; hash_size as usize]);

        let mut hash_dev = BlockDevice::open(hash_file.path(), true, BLOCK_SIZE as u64).unwrap();
        let roothash = format(data_file.path(), &mut hash_dev, Uuid::new_v4()).unwrap();
        let sb = get_superblock(&mut hash_dev).unwrap();
        let tree = load_hash_tree(&mut hash_dev, &sb, &roothash).unwrap();

        data[0] ^= 0xff;
        std::fs::write(data_file.path(), &data).unwrap();

        assert!(verify_data_device(data_file.path(), &sb, &tree).is_err());
    }
}
