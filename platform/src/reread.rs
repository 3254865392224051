//! Linux `BLKRRPART` partition-table reread, the real collaborator behind
//! `cvmboot_core::PartitionTableReread`. The GPT engine owns the
//! retry/backoff loop (§5); this is a single ioctl attempt per call.

use std::path::Path;

use cvmboot_core::{CvmbootError, PartitionTableReread, Result};

pub struct LinuxReread;

#[cfg(target_os = "linux")]
impl PartitionTableReread for LinuxReread {
    fn try_reread_once(&self, path: &Path) -> Result<()> {
        use std::fs::File;
        use std::os::fd::AsRawFd;

        nix::ioctl_none!(blkrrpart, 0x12, 95);

        let file = File::open(path)?;
        unsafe {
            blkrrpart(file.as_raw_fd()).map_err(|e| CvmbootError::IoError(std::io::Error::from(e)))?;
        }
        tracing::debug!(path = %path.display(), "BLKRRPART reread succeeded");
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
impl PartitionTableReread for LinuxReread {
    fn try_reread_once(&self, _path: &Path) -> Result<()> {
        Err(CvmbootError::InvalidArgument(
            "BLKRRPART reread is only supported on linux".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `BLKRRPART` is only meaningful on a block-special file; issuing it
    /// against a regular file must fail cleanly rather than panic.
    #[test]
    fn regular_file_reread_fails_cleanly() {
        let f = tempfile::NamedTempFile::new().unwrap();
        assert!(LinuxReread.try_reread_once(f.path()).is_err());
    }
}
