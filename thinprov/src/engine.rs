//! Thin-provisioning projector (spec component E): allocate thin data/meta
//! partitions sized from the root filesystem's non-sparse footprint,
//! activate a thin pool+volume via an injected [`DeviceMapper`], copy only
//! live blocks, and optionally verify block equivalence.

use std::path::Path;

use cvmboot_core::guid::{thin_data_type_guid, thin_meta_type_guid};
use cvmboot_core::{CvmbootError, DeviceMapper, Result};
use cvmboot_gpt::Gpt;
use cvmboot_sparse::{frags_find, sparse_compare, sparse_copy};
use uuid::Uuid;

use crate::sizing::{data_partition_size, meta_partition_size, LOW_WATER_MARK_BLOCKS, SECTOR_SIZE, THIN_BLOCK_SECTORS};

const META_ZERO_BYTES: u64 = 4096;

/// Indices of the newly added thin-data and thin-meta GPT entries.
pub struct ThinPartitions {
    pub data_index: usize,
    pub meta_index: usize,
}

/// Adds a thin-data and thin-meta partition to `gpt`, sized from the
/// non-sparse footprint `[root_offset, root_offset + root_size)` of
/// `container_path`, and punches a hole through the whole extent of both
/// so they start out fully sparse.
pub fn add_partitions(
    gpt: &mut Gpt,
    container_path: impl AsRef<Path>,
    root_offset: u64,
    root_size: u64,
) -> Result<ThinPartitions> {
    let container_path = container_path.as_ref();
    let (data_frags, _holes) = frags_find(container_path, root_offset, root_offset + root_size)?;
    let non_sparse_bytes = data_frags.num_blocks * cvmboot_sparse::BLOCK_SIZE;

    let data_size = data_partition_size(non_sparse_bytes);
    let meta_size = meta_partition_size(data_size);

    let data_index = gpt.add_partition(thin_data_type_guid(), data_size / SECTOR_SIZE, 0, None)?;
    let meta_index = gpt.add_partition(thin_meta_type_guid(), meta_size / SECTOR_SIZE, 0, None)?;

    let data_entry = gpt.get_entry(data_index)?;
    let meta_entry = gpt.get_entry(meta_index)?;

    cvmboot_core::punch_hole(
        container_path,
        cvmboot_gpt::entry_offset(&data_entry),
        cvmboot_gpt::entry_size(&data_entry),
    )?;
    cvmboot_core::punch_hole(
        container_path,
        cvmboot_gpt::entry_offset(&meta_entry),
        cvmboot_gpt::entry_size(&meta_entry),
    )?;

    Ok(ThinPartitions { data_index, meta_index })
}

/// Activates a thin pool over `meta_dev`/`data_dev` and a volume of
/// `volume_sectors` sectors on top of it, returning the mapped device
/// paths for `pool_name`/`volume_name`.
///
/// Does not touch the meta device's existing contents: `add_partitions`
/// punches the thin-meta partition fully sparse at creation time, which is
/// the only zeroing a fresh pool needs, and every later `activate` of the
/// same meta device (the lifecycle driver's post-`project` re-activation
/// for verity hashing, and standalone `verify`) must see the pool's real
/// block-mapping metadata rather than a blanked-out superblock region.
fn activate(
    dm: &dyn DeviceMapper,
    pool_name: &str,
    volume_name: &str,
    meta_dev: &Path,
    data_dev: &Path,
    data_sectors: u64,
    volume_sectors: u64,
) -> Result<()> {
    cvmboot_core::getsize64(meta_dev).and_then(|size| {
        if size < META_ZERO_BYTES {
            return Err(CvmbootError::InvalidArgument(
                "meta device is smaller than the zeroed header region".into(),
            ));
        }
        Ok(())
    })?;

    dm.create_pool(
        pool_name,
        data_sectors,
        meta_dev,
        data_dev,
        THIN_BLOCK_SECTORS,
        LOW_WATER_MARK_BLOCKS,
    )?;
    dm.create_thin(pool_name, 0)?;
    dm.create_volume(volume_name, pool_name, 0, volume_sectors)?;

    Ok(())
}

fn teardown(dm: &dyn DeviceMapper, pool_name: &str, volume_name: &str) -> Result<()> {
    dm.remove(volume_name)?;
    dm.remove(pool_name)?;
    Ok(())
}

/// Activates a thin pool+volume named after `instance` and returns the
/// volume's device path, for callers (the verity step of the lifecycle
/// driver) that need the projected root as a real block device rather than
/// through [`project`]/[`verify`]'s own narrower copy/compare use. Pair with
/// [`teardown_volume`].
pub fn activate_volume(
    dm: &dyn DeviceMapper,
    meta_dev: impl AsRef<Path>,
    data_dev: impl AsRef<Path>,
    volume_sectors: u64,
    instance: Uuid,
) -> Result<(String, String, std::path::PathBuf)> {
    let meta_dev = meta_dev.as_ref();
    let data_dev = data_dev.as_ref();
    let data_size = cvmboot_core::getsize64(data_dev)?;

    let pool_name = format!("cvmboot-thin-pool-{instance}");
    let volume_name = format!("cvmboot-thin-vol-{instance}");

    activate(
        dm,
        &pool_name,
        &volume_name,
        meta_dev,
        data_dev,
        data_size / SECTOR_SIZE,
        volume_sectors,
    )?;

    let volume_path = dm.device_path(&volume_name);
    Ok((pool_name, volume_name, volume_path))
}

/// Tears down a pool+volume pair returned by [`activate_volume`].
pub fn teardown_volume(dm: &dyn DeviceMapper, pool_name: &str, volume_name: &str) -> Result<()> {
    teardown(dm, pool_name, volume_name)
}

/// Copies the non-sparse blocks of the root partition `[root_offset,
/// root_offset + root_size)` of `container_path` into a freshly activated
/// thin volume, then tears the pool and volume down.
pub fn project(
    dm: &dyn DeviceMapper,
    container_path: impl AsRef<Path>,
    root_offset: u64,
    root_size: u64,
    data_dev: impl AsRef<Path>,
    meta_dev: impl AsRef<Path>,
    instance: Uuid,
) -> Result<()> {
    let container_path = container_path.as_ref();
    let data_dev = data_dev.as_ref();
    let meta_dev = meta_dev.as_ref();

    if root_size % SECTOR_SIZE != 0 {
        return Err(CvmbootError::InvalidArgument(
            "root size must be a multiple of the sector size".into(),
        ));
    }
    let root_sectors = root_size / SECTOR_SIZE;
    let (pool_name, volume_name, volume_path) = activate_volume(dm, meta_dev, data_dev, root_sectors, instance)?;

    let result = (|| -> Result<()> {
        let (data_frags, _holes) = frags_find(container_path, root_offset, root_offset + root_size)?;
        sparse_copy(&data_frags, container_path, root_offset, &volume_path, 0)
    })();

    teardown_volume(dm, &pool_name, &volume_name)?;
    result
}

/// Re-activates the pool/volume read-only and compares every non-sparse
/// root block against its thin-volume counterpart.
pub fn verify(
    dm: &dyn DeviceMapper,
    container_path: impl AsRef<Path>,
    root_offset: u64,
    root_size: u64,
    data_dev: impl AsRef<Path>,
    meta_dev: impl AsRef<Path>,
    instance: Uuid,
) -> Result<()> {
    let container_path = container_path.as_ref();
    let data_dev = data_dev.as_ref();
    let meta_dev = meta_dev.as_ref();

    let root_sectors = root_size / SECTOR_SIZE;
    let data_size = cvmboot_core::getsize64(data_dev)?;

    let pool_name = format!("cvmboot-thin-verify-pool-{instance}");
    let volume_name = format!("cvmboot-thin-verify-vol-{instance}");

    activate(
        dm,
        &pool_name,
        &volume_name,
        meta_dev,
        data_dev,
        data_size / SECTOR_SIZE,
        root_sectors,
    )?;

    let volume_path = dm.device_path(&volume_name);

    let result = (|| -> Result<()> {
        let (data_frags, _holes) = frags_find(container_path, root_offset, root_offset + root_size)?;
        sparse_compare(&data_frags, root_offset as i64, container_path, &volume_path)
    })();

    teardown(dm, &pool_name, &volume_name)?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Fake device mapper that maps a thin volume straight onto a backing
    /// scratch file under the system temp directory, so `project`/`verify`
    /// can be exercised without real `dmsetup`/root privileges.
    struct FakeDeviceMapper {
        volumes: Mutex<HashMap<String, PathBuf>>,
    }

    impl FakeDeviceMapper {
        fn new() -> Self {
            Self {
                volumes: Mutex::new(HashMap::new()),
            }
        }
    }

    impl DeviceMapper for FakeDeviceMapper {
        fn create_pool(
            &self,
            _name: &str,
            _pool_sectors: u64,
            _meta_dev: &Path,
            _data_dev: &Path,
            _block_size_sectors: u64,
            _low_water_mark: u64,
        ) -> Result<()> {
            Ok(())
        }

        fn create_thin(&self, _pool_name: &str, _id: u32) -> Result<()> {
            Ok(())
        }

        fn create_volume(&self, name: &str, _pool_name: &str, _id: u32, size_sectors: u64) -> Result<()> {
            let path = std::env::temp_dir().join(format!("cvmboot-thin-test-{name}"));
            std::fs::write(&path, vec![0u8; (size_sectors * SECTOR_SIZE) as usize]).unwrap();
            self.volumes.lock().unwrap().insert(name.to_string(), path);
            Ok(())
        }

        fn remove(&self, name: &str) -> Result<()> {
            if let Some(path) = self.volumes.lock().unwrap().remove(name) {
                let _ = std::fs::remove_file(path);
            }
            Ok(())
        }

        fn device_path(&self, name: &str) -> PathBuf {
            self.volumes.lock().unwrap().get(name).cloned().unwrap_or_default()
        }
    }

    #[test]
    fn activate_then_teardown_volume_round_trips() {
        let data_dev = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(data_dev.path(), vec![0u8; 8 * 1024 * 1024]).unwrap();
        let meta_dev = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(meta_dev.path(), vec![0u8; 8192]).unwrap();

        let dm = FakeDeviceMapper::new();
        let instance = Uuid::new_v4();

        let (pool_name, volume_name, volume_path) =
            activate_volume(&dm, meta_dev.path(), data_dev.path(), 64, instance).unwrap();

        assert!(pool_name.contains(&instance.to_string()));
        assert!(volume_name.contains(&instance.to_string()));
        assert!(volume_path.is_file());
        assert_eq!(std::fs::metadata(&volume_path).unwrap().len(), 64 * SECTOR_SIZE);

        teardown_volume(&dm, &pool_name, &volume_name).unwrap();
        assert!(!volume_path.exists());
    }

    #[test]
    fn project_then_verify_round_trips() {
        let root_size = 3 * cvmboot_sparse::BLOCK_SIZE;
        let container = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(container.path(), vec![0x5au8; root_size as usize]).unwrap();

        let data_dev = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(data_dev.path(), vec![0u8; 8 * 1024 * 1024]).unwrap();
        let meta_dev = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(meta_dev.path(), vec![0u8; 8192]).unwrap();

        let dm = FakeDeviceMapper::new();
        let instance = Uuid::new_v4();

        project(&dm, container.path(), 0, root_size, data_dev.path(), meta_dev.path(), instance).unwrap();
        verify(&dm, container.path(), 0, root_size, data_dev.path(), meta_dev.path(), instance).unwrap();
    }
}
