//! `dmsetup`-backed `DeviceMapper`, the real collaborator behind
//! `thinprov`'s pool/volume activation. Mirrors the teacher's
//! `DeviceManager`/platform-impl split: the algorithm lives in `thinprov`
//! against the trait, this crate supplies the OS-specific edge.

use std::path::{Path, PathBuf};
use std::process::Command;

use cvmboot_core::{DeviceMapper, Result};

use crate::exec::{require_tool, run};

pub struct DmsetupDeviceMapper;

impl DeviceMapper for DmsetupDeviceMapper {
    fn create_pool(
        &self,
        name: &str,
        pool_sectors: u64,
        meta_dev: &Path,
        data_dev: &Path,
        block_size_sectors: u64,
        low_water_mark: u64,
    ) -> Result<()> {
        require_tool("dmsetup")?;
        let table = format!(
            "0 {pool_sectors} thin-pool {} {} {block_size_sectors} {low_water_mark}",
            meta_dev.display(),
            data_dev.display()
        );
        run(Command::new("dmsetup").args(["create", name, "--table", &table]))?;
        Ok(())
    }

    fn create_thin(&self, pool_name: &str, id: u32) -> Result<()> {
        run(Command::new("dmsetup").args(["message", pool_name, "0", &format!("create_thin {id}")]))?;
        Ok(())
    }

    fn create_volume(&self, name: &str, pool_name: &str, id: u32, size_sectors: u64) -> Result<()> {
        let pool_dev = self.device_path(pool_name);
        let table = format!("0 {size_sectors} thin {} {id}", pool_dev.display());
        run(Command::new("dmsetup").args(["create", name, "--table", &table]))?;
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        run(Command::new("dmsetup").args(["remove", name]))?;
        Ok(())
    }

    fn device_path(&self, name: &str) -> PathBuf {
        PathBuf::from("/dev/mapper").join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_path_is_under_dev_mapper() {
        let dm = DmsetupDeviceMapper;
        assert_eq!(dm.device_path("cvmboot-thin-pool-x"), PathBuf::from("/dev/mapper/cvmboot-thin-pool-x"));
    }
}
