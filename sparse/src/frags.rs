//! Sparse/fragment engine (spec component B).
//!
//! Discovers the data and hole extents of a file using the `SEEK_DATA` /
//! `SEEK_HOLE` positional queries, then uses those extents to drive
//! hole-preserving copy, compare, and sha-of-shas operations without ever
//! reading the holes.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use cvmboot_core::{getsize64, CvmbootError, Result};
use sha2::{Digest, Sha256};

pub const BLOCK_SIZE: u64 = 4096;

/// A single extent `[offset, offset+length)`, both multiples of
/// [`BLOCK_SIZE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frag {
    pub offset: u64,
    pub length: u64,
}

/// An ordered list of fragments, tracking the running block count the way
/// the original `frag_list_t` does.
#[derive(Debug, Clone, Default)]
pub struct FragList {
    pub frags: Vec<Frag>,
    pub num_blocks: u64,
}

impl FragList {
    pub fn append(&mut self, offset: u64, length: u64) {
        self.frags.push(Frag { offset, length });
        self.num_blocks += length / BLOCK_SIZE;
    }

    pub fn total_size(&self) -> u64 {
        self.frags.iter().map(|f| f.length).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.frags.is_empty()
    }
}

#[cfg(target_os = "linux")]
mod seek_probe {
    use super::*;
    use std::os::fd::AsRawFd;

    /// `lseek(fd, offset, SEEK_DATA)`. Returns `None` on `ENXIO` (no more
    /// data past `offset`) and propagates any other error.
    pub fn seek_data(file: &File, offset: u64) -> Result<Option<u64>> {
        seek(file, offset, libc::SEEK_DATA)
    }

    /// `lseek(fd, offset, SEEK_HOLE)`. Returns `None` on `ENXIO`.
    pub fn seek_hole(file: &File, offset: u64) -> Result<Option<u64>> {
        seek(file, offset, libc::SEEK_HOLE)
    }

    fn seek(file: &File, offset: u64, whence: i32) -> Result<Option<u64>> {
        let fd = file.as_raw_fd();
        let ret = unsafe { libc::lseek(fd, offset as i64, whence) };
        if ret < 0 {
            let errno = std::io::Error::last_os_error();
            if errno.raw_os_error() == Some(libc::ENXIO) {
                return Ok(None);
            }
            return Err(CvmbootError::IoError(errno));
        }
        Ok(Some(ret as u64))
    }
}

#[cfg(not(target_os = "linux"))]
mod seek_probe {
    use super::*;

    pub fn seek_data(_file: &File, _offset: u64) -> Result<Option<u64>> {
        Ok(None)
    }

    pub fn seek_hole(_file: &File, _offset: u64) -> Result<Option<u64>> {
        Ok(None)
    }
}

/// Enumerates the data and hole fragments of `path` over the byte window
/// `[start, end)`, both of which must be block-aligned. Files for which the
/// seek probes are unsupported (no holes reported at all) yield a single
/// data fragment spanning the whole window.
pub fn frags_find(path: impl AsRef<Path>, start: u64, end: u64) -> Result<(FragList, FragList)> {
    let path = path.as_ref();
    if start % BLOCK_SIZE != 0 || end % BLOCK_SIZE != 0 {
        return Err(CvmbootError::InvalidArgument(
            "start/end must be 4096-aligned".into(),
        ));
    }

    let mut frags = FragList::default();
    let mut holes = FragList::default();

    let file = File::open(path)?;

    // Probe once at `start`: if SEEK_HOLE is unsupported for this file, the
    // whole window is a single data fragment.
    if seek_probe::seek_hole(&file, start)?.is_none() {
        let size = getsize64(path)?;
        frags.append(0, size.min(end));
        return Ok((frags, holes));
    }

    let mut offset = start;

    loop {
        let data = seek_probe::seek_data(&file, offset)?;

        let data = match data {
            Some(d) if d < end => d,
            _ => {
                if offset < end {
                    holes.append(offset, end - offset);
                }
                break;
            }
        };

        if data > offset {
            holes.append(offset, data - offset);
        }

        let hole = seek_probe::seek_hole(&file, data)?;

        let hole = match hole {
            Some(h) if h < end => h,
            _ => {
                if end > data {
                    frags.append(data, end - data);
                }
                break;
            }
        };

        if hole > data {
            frags.append(data, hole - data);
        }

        offset = hole;
    }

    let total_blocks = (end - start) / BLOCK_SIZE;
    if frags.num_blocks + holes.num_blocks != total_blocks {
        return Err(CvmbootError::InvalidArgument(
            "fragment discovery did not partition the requested window".into(),
        ));
    }

    Ok((frags, holes))
}

fn all_zeros(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

/// Copies every data fragment of `list` from `source` to `dest`, skipping
/// any 4096-byte unit that is all zeros so the destination stays sparse.
/// `source_offset`/`dest_offset` translate fragment offsets (relative to
/// the whole source container) into destination file offsets.
pub fn sparse_copy(
    list: &FragList,
    source: impl AsRef<Path>,
    source_offset: u64,
    dest: impl AsRef<Path>,
    dest_offset: u64,
) -> Result<()> {
    let mut src = File::open(source)?;
    let mut dst = OpenOptions::new().read(true).write(true).open(dest)?;

    let mut fsync_counter: u64 = 0;

    for frag in &list.frags {
        let n_units = frag.length / BLOCK_SIZE;
        for i in 0..n_units {
            let off1 = frag.offset + i * BLOCK_SIZE;
            let off2 = off1 - source_offset + dest_offset;

            let mut buf = vec![0u8; BLOCK_SIZE as usize];
            src.seek(SeekFrom::Start(off1))?;
            src.read_exact(&mut buf)?;

            if !all_zeros(&buf) {
                dst.seek(SeekFrom::Start(off2))?;
                dst.write_all(&buf)?;

                fsync_counter += 1;
                if fsync_counter % 1024 == 0 {
                    dst.flush()?;
                }
            }
        }

        // Partial-block tail: copy the remainder byte-exactly.
        let tail = frag.length % BLOCK_SIZE;
        if tail != 0 {
            let off1 = frag.offset + n_units * BLOCK_SIZE;
            let off2 = off1 - source_offset + dest_offset;
            let mut buf = vec![0u8; tail as usize];
            src.seek(SeekFrom::Start(off1))?;
            src.read_exact(&mut buf)?;
            dst.seek(SeekFrom::Start(off2))?;
            dst.write_all(&buf)?;
        }
    }

    dst.flush()?;
    Ok(())
}

/// Compares every data fragment of `list` between `disk` and `dest`,
/// failing at the first mismatched block.
pub fn sparse_compare(
    list: &FragList,
    offset: i64,
    disk: impl AsRef<Path>,
    dest: impl AsRef<Path>,
) -> Result<()> {
    let mut f1 = File::open(disk)?;
    let mut f2 = File::open(dest)?;

    for frag in &list.frags {
        let n_units = frag.length.div_ceil(BLOCK_SIZE);
        for i in 0..n_units {
            let remaining = frag.length - i * BLOCK_SIZE;
            let len = remaining.min(BLOCK_SIZE) as usize;

            let off1 = frag.offset + i * BLOCK_SIZE;
            let off2 = (off1 as i64 - offset) as u64;

            let mut buf1 = vec![0u8; len];
            let mut buf2 = vec![0u8; len];
            f1.seek(SeekFrom::Start(off1))?;
            f1.read_exact(&mut buf1)?;
            f2.seek(SeekFrom::Start(off2))?;
            f2.read_exact(&mut buf2)?;

            if buf1 != buf2 {
                return Err(CvmbootError::HashMismatch(format!(
                    "block mismatch at source offset {off1}"
                )));
            }
        }
    }

    Ok(())
}

/// Computes a sha-of-shas fingerprint of `path` over `[start, end)`: each
/// 4096-byte block that is a hole or all-zero contributes a precomputed
/// hash of 4096 zero bytes; every other block contributes its own SHA-256.
pub fn sparse_sha256(path: impl AsRef<Path>, start: u64, end: u64) -> Result<[u8; 32]> {
    let path = path.as_ref();
    let (data_frags, _holes) = frags_find(path, start, end)?;

    let zero_block_hash: [u8; 32] = {
        let mut h = Sha256::new();
        h.update(vec![0u8; BLOCK_SIZE as usize]);
        h.finalize().into()
    };

    let mut is_data = vec![false; ((end - start) / BLOCK_SIZE) as usize];
    for frag in &data_frags.frags {
        let start_idx = (frag.offset - start) / BLOCK_SIZE;
        let count = frag.length / BLOCK_SIZE;
        for i in start_idx..start_idx + count {
            is_data[i as usize] = true;
        }
    }

    let mut file = File::open(path)?;
    let mut outer = Sha256::new();

    for (i, in_data) in is_data.iter().enumerate() {
        if *in_data {
            let mut buf = vec![0u8; BLOCK_SIZE as usize];
            file.seek(SeekFrom::Start(start + i as u64 * BLOCK_SIZE))?;
            file.read_exact(&mut buf)?;

            if all_zeros(&buf) {
                outer.update(zero_block_hash);
            } else {
                let mut h = Sha256::new();
                h.update(&buf);
                let digest: [u8; 32] = h.finalize().into();
                outer.update(digest);
            }
        } else {
            outer.update(zero_block_hash);
        }
    }

    Ok(outer.finalize().into())
}

/// Builds a bit-vector (one bit per absolute block number, relative to the
/// start of `list`'s offsets) marking which blocks are non-sparse, used by
/// the verity engine's sparse fast path.
pub fn frags_set_bits(frags: &FragList, total_blocks: u64) -> Vec<bool> {
    let mut bits = vec![false; total_blocks as usize];
    for frag in &frags.frags {
        let index = frag.offset / BLOCK_SIZE;
        let count = frag.length / BLOCK_SIZE;
        for i in index..index + count {
            if (i as usize) < bits.len() {
                bits[i as usize] = true;
            }
        }
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[cfg(target_os = "linux")]
    fn make_sparse_file(size: u64, hole_start: u64, hole_len: u64) -> tempfile::NamedTempFile {
        let f = tempfile::NamedTempFile::new().unwrap();
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(f.path())
            .unwrap();
        file.set_len(size).unwrap();

        // Write data before and after the hole so the middle remains sparse.
        let mut file = file;
        if hole_start > 0 {
            file.seek(SeekFrom::Start(0)).unwrap();
            file.write_all(&vec![0xabu8; hole_start as usize]).unwrap();
        }
        let tail_start = hole_start + hole_len;
        if tail_start < size {
            file.seek(SeekFrom::Start(tail_start)).unwrap();
            file.write_all(&vec![0xcdu8; (size - tail_start) as usize])
                .unwrap();
        }
        f
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn frags_find_partitions_whole_window() {
        let f = make_sparse_file(16 * 1024 * 1024, 4 * 1024 * 1024, 8 * 1024 * 1024);
        let (frags, holes) = frags_find(f.path(), 0, 16 * 1024 * 1024).unwrap();
        assert_eq!(
            frags.num_blocks + holes.num_blocks,
            16 * 1024 * 1024 / BLOCK_SIZE
        );
    }

    #[test]
    fn frags_set_bits_marks_only_data_blocks() {
        let mut frags = FragList::default();
        frags.append(0, BLOCK_SIZE);
        frags.append(3 * BLOCK_SIZE, BLOCK_SIZE);
        let bits = frags_set_bits(&frags, 5);
        assert_eq!(bits, vec![true, false, false, true, false]);
    }

    #[test]
    fn sparse_copy_preserves_content() {
        let src = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(src.path(), vec![0x42u8; BLOCK_SIZE as usize]).unwrap();

        let dst = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(dst.path(), vec![0u8; BLOCK_SIZE as usize]).unwrap();

        let mut frags = FragList::default();
        frags.append(0, BLOCK_SIZE);

        sparse_copy(&frags, src.path(), 0, dst.path(), 0).unwrap();

        let content = std::fs::read(dst.path()).unwrap();
        assert_eq!(content, vec![0x42u8; BLOCK_SIZE as usize]);
    }

    #[test]
    fn sparse_copy_skips_all_zero_blocks() {
        let src = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(src.path(), vec![0u8; BLOCK_SIZE as usize]).unwrap();

        let dst = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(dst.path(), vec![0x11u8; BLOCK_SIZE as usize]).unwrap();

        let mut frags = FragList::default();
        frags.append(0, BLOCK_SIZE);

        sparse_copy(&frags, src.path(), 0, dst.path(), 0).unwrap();

        // Destination block was never written, so it retains its original
        // (non-zero) content here -- in a freshly sparse file it would
        // remain a hole instead.
        let content = std::fs::read(dst.path()).unwrap();
        assert_eq!(content, vec![0x11u8; BLOCK_SIZE as usize]);
    }
}
