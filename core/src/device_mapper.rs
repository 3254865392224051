//! Device-mapper collaborator used by the thin-provisioning projector.
//! Modeled as a trait, the way the teacher splits `DeviceManager` from its
//! platform-specific implementations, so pool/volume activation can be
//! exercised in tests without `dmsetup` or `CAP_SYS_ADMIN`.

use std::path::{Path, PathBuf};

use crate::error::Result;

/// A host device-mapper collaborator. Each method corresponds to one
/// `dmsetup` invocation; implementors decide how to run it (shell out,
/// talk to libdevmapper, or fake it for tests).
pub trait DeviceMapper: Send + Sync {
    /// Creates a thin-pool device named `name` over `meta_dev`/`data_dev`,
    /// `pool_sectors` long, with the given data block size (in 512-byte
    /// sectors) and low water mark (in data blocks).
    fn create_pool(
        &self,
        name: &str,
        pool_sectors: u64,
        meta_dev: &Path,
        data_dev: &Path,
        block_size_sectors: u64,
        low_water_mark: u64,
    ) -> Result<()>;

    /// Sends the `create_thin <id>` message to the named pool.
    fn create_thin(&self, pool_name: &str, id: u32) -> Result<()>;

    /// Creates a thin volume device named `name`, mapped onto thin id `id`
    /// of `pool_name`, `size_sectors` long.
    fn create_volume(&self, name: &str, pool_name: &str, id: u32, size_sectors: u64) -> Result<()>;

    /// Tears down a previously created mapped device (pool or volume).
    fn remove(&self, name: &str) -> Result<()>;

    /// The block-special device path for a created mapped device.
    fn device_path(&self, name: &str) -> PathBuf;
}
