//! ESP content probe (spec component H), injected as a trait so `classify`
//! callers and tests can fake the EFI System Partition's contents without
//! mounting a real FAT filesystem — mounting/chroot orchestration is an
//! explicit Non-goal of this workspace.

use crate::error::Result;

pub trait EspProbe: Send + Sync {
    /// Whether the ESP carries an `EFI/cvmboot` directory (the marker
    /// `classify` treats as "prepared or protected").
    fn has_cvmboot_home_dir(&self) -> Result<bool>;

    /// Whether `EFI/cvmboot/cvmboot.cpio.sig` exists (the marker
    /// `classify` treats as "protected").
    fn has_cpio_signature(&self) -> Result<bool>;
}

/// An `EspProbe` over an already-mounted ESP directory, used by the real
/// lifecycle driver once the ESP has been mounted by its caller.
pub struct MountedEsp {
    root: std::path::PathBuf,
}

impl MountedEsp {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, rel: &str) -> std::path::PathBuf {
        self.root.join(rel)
    }
}

impl EspProbe for MountedEsp {
    fn has_cvmboot_home_dir(&self) -> Result<bool> {
        Ok(self.path("EFI/cvmboot").is_dir())
    }

    fn has_cpio_signature(&self) -> Result<bool> {
        Ok(self.path("EFI/cvmboot/cvmboot.cpio.sig").is_file())
    }
}

/// A fake `EspProbe` over in-memory flags, for tests.
pub struct FakeEsp {
    pub home_dir: bool,
    pub cpio_signature: bool,
}

impl EspProbe for FakeEsp {
    fn has_cvmboot_home_dir(&self) -> Result<bool> {
        Ok(self.home_dir)
    }

    fn has_cpio_signature(&self) -> Result<bool> {
        Ok(self.cpio_signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mounted_esp_reports_absence_on_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let esp = MountedEsp::new(dir.path());
        assert!(!esp.has_cvmboot_home_dir().unwrap());
        assert!(!esp.has_cpio_signature().unwrap());
    }

    #[test]
    fn mounted_esp_detects_home_dir_and_signature() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("EFI/cvmboot")).unwrap();
        let esp = MountedEsp::new(dir.path());
        assert!(esp.has_cvmboot_home_dir().unwrap());
        assert!(!esp.has_cpio_signature().unwrap());

        std::fs::write(dir.path().join("EFI/cvmboot/cvmboot.cpio.sig"), b"sig").unwrap();
        assert!(esp.has_cpio_signature().unwrap());
    }
}
