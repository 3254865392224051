//! Linux loopback association: attaches a disk image file to a `/dev/loopN`
//! device so the GPT/verity/thinprov engines, which all operate on paths,
//! can be pointed at a real block device instead of a plain file.

use std::path::{Path, PathBuf};
use std::process::Command;

use cvmboot_core::{CvmbootError, Result};

use crate::exec::{require_tool, run};

/// Attaches `image` to the first free loop device and returns its path
/// (e.g. `/dev/loop7`).
pub fn attach(image: &Path) -> Result<PathBuf> {
    require_tool("losetup")?;
    let output = run(Command::new("losetup").args(["--find", "--show", "--partscan"]).arg(image))?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let device = stdout.trim();
    if device.is_empty() {
        return Err(CvmbootError::ExternalToolFailure(
            "losetup did not report an attached device".into(),
        ));
    }
    Ok(PathBuf::from(device))
}

/// Detaches a loopback device previously returned by [`attach`].
pub fn detach(device: &Path) -> Result<()> {
    run(Command::new("losetup").arg("-d").arg(device))?;
    Ok(())
}

/// Derives the device-node path of partition `index` (1-based, matching GPT
/// entry numbering) of a loop device attached with `--partscan`, e.g.
/// `/dev/loop7` + 3 -> `/dev/loop7p3`. Callers that need a thin-data or
/// thin-meta partition as a real block device (dm-thin-pool refuses plain
/// files) go through this rather than slicing the container file directly.
pub fn partition_device(loop_dev: &Path, index: usize) -> PathBuf {
    let name = loop_dev.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    loop_dev.with_file_name(format!("{name}p{index}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_device_appends_p_index() {
        assert_eq!(
            partition_device(Path::new("/dev/loop7"), 3),
            PathBuf::from("/dev/loop7p3")
        );
    }
}
