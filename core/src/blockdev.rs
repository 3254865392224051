//! Fixed-block-size device abstraction (spec component A).
//!
//! Wraps a regular file or a block-special device behind a uniform
//! `get`/`put` interface addressed in block numbers, optionally restricted
//! to a byte window `[start, end)` so a single open container can be sliced
//! into partition-scoped views without copying.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{CvmbootError, Result};

fn is_power_of_two(x: u64) -> bool {
    x != 0 && (x & (x - 1)) == 0
}

/// Returns the logical size of `path` in bytes, whether it names a regular
/// file or a block-special device.
pub fn getsize64<P: AsRef<Path>>(path: P) -> Result<u64> {
    let path = path.as_ref();
    let meta = std::fs::metadata(path)?;

    #[cfg(target_os = "linux")]
    {
        use std::os::unix::fs::FileTypeExt;
        if meta.file_type().is_block_device() {
            return block_device_size(path);
        }
    }

    Ok(meta.len())
}

#[cfg(target_os = "linux")]
fn block_device_size(path: &Path) -> Result<u64> {
    use std::os::fd::AsRawFd;

    nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

    let file = File::open(path)?;
    let mut size: u64 = 0;
    unsafe {
        blkgetsize64(file.as_raw_fd(), &mut size as *mut u64)
            .map_err(|e| CvmbootError::IoError(std::io::Error::from(e)))?;
    }
    Ok(size)
}

#[cfg(not(target_os = "linux"))]
fn block_device_size(_path: &Path) -> Result<u64> {
    Err(CvmbootError::InvalidArgument(
        "block-special devices are only supported on linux".into(),
    ))
}

/// Punches a hole `[offset, offset+len)` in the regular file at `path`,
/// without shrinking it, so the thin-provisioning projector can allocate a
/// data/meta partition pair that starts out fully sparse on the container.
#[cfg(target_os = "linux")]
pub fn punch_hole<P: AsRef<Path>>(path: P, offset: u64, len: u64) -> Result<()> {
    use std::os::fd::AsRawFd;
    use nix::fcntl::{fallocate, FallocateFlags};

    let file = OpenOptions::new().write(true).open(path)?;
    fallocate(
        file.as_raw_fd(),
        FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE,
        offset as libc::off_t,
        len as libc::off_t,
    )
    .map_err(|e| CvmbootError::IoError(std::io::Error::from(e)))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn punch_hole<P: AsRef<Path>>(_path: P, _offset: u64, _len: u64) -> Result<()> {
    Err(CvmbootError::InvalidArgument(
        "hole punching is only supported on linux".into(),
    ))
}

/// A fixed-block-size window onto a file or block-special device.
pub struct BlockDevice {
    file: File,
    file_size: u64,
    block_size: u64,
    start: u64,
    end: u64,
}

impl BlockDevice {
    /// Opens the whole of `path` as a block device with the given
    /// `block_size`. `block_size` must be a nonzero power of two and the
    /// file size must be a multiple of it.
    pub fn open<P: AsRef<Path>>(path: P, write: bool, block_size: u64) -> Result<Self> {
        let size = getsize64(&path)?;
        Self::open_slice(path, write, block_size, 0, size)
    }

    /// Opens a byte-range `[start, end)` of `path` as a block device. Both
    /// bounds must be block-size aligned.
    pub fn open_slice<P: AsRef<Path>>(
        path: P,
        write: bool,
        block_size: u64,
        start: u64,
        end: u64,
    ) -> Result<Self> {
        if block_size == 0 || !is_power_of_two(block_size) {
            return Err(CvmbootError::InvalidArgument(format!(
                "block size {block_size} is not a nonzero power of two"
            )));
        }
        if start % block_size != 0 || end % block_size != 0 {
            return Err(CvmbootError::InvalidArgument(
                "start/end must be block-size aligned".into(),
            ));
        }
        if start >= end {
            return Err(CvmbootError::InvalidArgument(
                "start must be less than end".into(),
            ));
        }

        let file_size = getsize64(&path)?;
        if start >= file_size || end > file_size {
            return Err(CvmbootError::OutOfRange(format!(
                "slice [{start}, {end}) exceeds file size {file_size}"
            )));
        }

        let file = OpenOptions::new().read(true).write(write).open(path)?;

        Ok(Self {
            file,
            file_size: end - start,
            block_size,
            start,
            end,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn num_blocks(&self) -> u64 {
        self.file_size / self.block_size
    }

    fn seek_to(&mut self, offset: u64) -> Result<()> {
        let abs = self.start + offset;
        if abs >= self.end && offset != 0 {
            return Err(CvmbootError::OutOfRange(format!(
                "offset {offset} exceeds device window"
            )));
        }
        self.file.seek(SeekFrom::Start(abs))?;
        Ok(())
    }

    /// Reads `n` blocks starting at `blkno`.
    pub fn get(&mut self, blkno: u64, n: u64) -> Result<Vec<u8>> {
        if n == 0 {
            return Err(CvmbootError::InvalidArgument("count is zero".into()));
        }

        let offset = blkno * self.block_size;
        let total = n * self.block_size;
        if offset + total > self.file_size {
            return Err(CvmbootError::OutOfRange(format!(
                "read of {total} bytes at block {blkno} exceeds device size {}",
                self.file_size
            )));
        }

        self.seek_to(offset)?;
        let mut buf = vec![0u8; total as usize];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Writes `blocks` (exactly `n * block_size` bytes) starting at
    /// `blkno`. Writing beyond the current `file_size` extends it.
    pub fn put(&mut self, blkno: u64, n: u64, blocks: &[u8]) -> Result<()> {
        if n == 0 || blocks.is_empty() {
            return Err(CvmbootError::InvalidArgument("count is zero".into()));
        }

        let offset = blkno * self.block_size;
        let total = n * self.block_size;
        if blocks.len() as u64 != total {
            return Err(CvmbootError::InvalidArgument(format!(
                "expected {total} bytes, got {}",
                blocks.len()
            )));
        }
        if offset + total > self.end - self.start {
            return Err(CvmbootError::OutOfRange(format!(
                "write of {total} bytes at block {blkno} exceeds device window"
            )));
        }

        self.seek_to(offset)?;
        self.file.write_all(blocks)?;

        if offset + total > self.file_size {
            self.file_size = offset + total;
        }

        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn scratch_file(size: u64) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; size as usize]).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn get_put_round_trip() {
        let f = scratch_file(4096 * 4);
        let mut dev = BlockDevice::open(f.path(), true, 4096).unwrap();
        assert_eq!(dev.num_blocks(), 4);

        let data = vec![0xabu8; 4096];
        dev.put(1, 1, &data).unwrap();
        let back = dev.get(1, 1).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn out_of_range_read_fails() {
        let f = scratch_file(4096 * 2);
        let mut dev = BlockDevice::open(f.path(), false, 4096).unwrap();
        assert!(dev.get(5, 1).is_err());
    }

    #[test]
    fn put_extends_file_size() {
        let f = scratch_file(4096);
        let mut dev = BlockDevice::open(f.path(), true, 4096).unwrap();
        assert_eq!(dev.file_size(), 4096);
    }

    #[test]
    fn rejects_non_power_of_two_block_size() {
        let f = scratch_file(4096);
        assert!(BlockDevice::open(f.path(), false, 500).is_err());
    }

    #[test]
    fn slice_restricts_window() {
        let f = scratch_file(4096 * 4);
        let dev = BlockDevice::open_slice(f.path(), false, 4096, 4096, 4096 * 3).unwrap();
        assert_eq!(dev.file_size(), 4096 * 2);
    }
}
