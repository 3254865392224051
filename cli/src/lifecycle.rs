//! Lifecycle driver (spec component I): sequences components A-H into the
//! `prepare`/`protect`/`init`/`verify`/`strip`/`state` operations named by
//! §4.9, using [`LifecycleContext`] for scoped loopback/pool/volume teardown
//! in place of the original's `globals_t` singleton and `atexit` unwind.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cvmboot_core::guid::{
    linux_filesystem_type_guid, rootfs_upper_type_guid, thin_data_type_guid, thin_meta_type_guid, verity_hash_type_guid,
};
use cvmboot_core::{BlockDevice, ClassifyInput, CvmbootError, DeviceMapper, EspProbe, ImageState, LifecycleContext, Result};
use cvmboot_gpt::{entry_offset, entry_size, Gpt};
use cvmboot_sparse::{frags_find, sparse_copy};
use uuid::Uuid;

use crate::config::Config;

const SECTOR_SIZE: u64 = cvmboot_gpt::raw::SECTOR_SIZE;

/// Outcome of a [`prepare`] run.
pub struct PrepareReport {
    pub roothash: String,
    pub verity_uuid: Uuid,
}

/// Outcome of a [`protect`] run.
pub struct ProtectReport {
    pub signer_hash: String,
}

/// The GPT engine in this driver always operates on the backing container
/// file (`output`/`disk`), not the loop device path `platform::attach`
/// returns, so a kernel `BLKRRPART` reread against that path would only
/// ever fail (it is not block-special). Deployments that instead reopen the
/// GPT through the loop device node directly can pass
/// `cvmboot_platform::LinuxReread` to `Gpt::open_with_reread` themselves.
fn reread() -> Arc<dyn cvmboot_core::PartitionTableReread> {
    Arc::new(cvmboot_core::NoopReread)
}

/// Copies `input` to `output` preserving sparseness, sorts/resyncs the GPT,
/// drops any leftover verity/thin partitions from a prior run, rounds the
/// root partition up to an 8-sector multiple, projects it onto a thin
/// volume, hashes that volume with dm-verity, and (if `esp_mount` is given)
/// records the resulting root hash into `cvmboot.conf`.
pub fn prepare(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    dm: Arc<dyn DeviceMapper>,
    esp_mount: Option<&Path>,
) -> Result<PrepareReport> {
    let input = input.as_ref();
    let output = output.as_ref();

    let input_size = cvmboot_core::getsize64(input)?;
    std::fs::File::create(output)?.set_len(input_size)?;

    let (data_frags, _holes) = frags_find(input, 0, input_size)?;
    sparse_copy(&data_frags, input, 0, output, 0)?;

    let mut ctx = LifecycleContext::new(output);

    let mut gpt = Gpt::open_with_reread(output, true, reread())?;

    gpt.remove_partitions_by_type(verity_hash_type_guid())?;
    gpt.remove_partitions_by_type(thin_data_type_guid())?;
    gpt.remove_partitions_by_type(thin_meta_type_guid())?;

    let root_index = gpt
        .find_partition_by_type(linux_filesystem_type_guid())
        .ok_or_else(|| CvmbootError::NotFound("no linux filesystem partition on the input image".into()))?;

    {
        let entry = gpt.get_entry(root_index)?;
        let sectors = entry.ending_lba - entry.starting_lba + 1;
        if sectors % 8 != 0 {
            gpt.resize_partition(root_index, sectors.div_ceil(8) * 8)?;
        }
    }

    let root_entry = gpt.get_entry(root_index)?;
    let root_offset = entry_offset(&root_entry);
    let root_size = entry_size(&root_entry);

    let thin_partitions = cvmboot_thinprov::add_partitions(&mut gpt, output, root_offset, root_size)?;

    let loop_dev = cvmboot_platform::attach(output)?;
    {
        let loop_dev = loop_dev.clone();
        ctx.on_teardown(move || {
            if let Err(e) = cvmboot_platform::detach(&loop_dev) {
                tracing::warn!(error = %e, device = %loop_dev.display(), "failed to detach loopback device during teardown");
            }
        });
    }

    let data_dev = cvmboot_platform::partition_device(&loop_dev, thin_partitions.data_index + 1);
    let meta_dev = cvmboot_platform::partition_device(&loop_dev, thin_partitions.meta_index + 1);

    let thin_instance = Uuid::new_v4();
    cvmboot_thinprov::project(dm.as_ref(), output, root_offset, root_size, &data_dev, &meta_dev, thin_instance)?;

    let root_sectors = root_size / SECTOR_SIZE;
    let (pool_name, volume_name, volume_path) =
        cvmboot_thinprov::activate_volume(dm.as_ref(), &meta_dev, &data_dev, root_sectors, thin_instance)?;

    let verity_uuid = Uuid::new_v4();
    let hash_result = (|| -> Result<[u8; 32]> {
        let hash_size = cvmboot_verity::hash_dev_size(root_size)?;
        let hash_index = gpt.add_partition(verity_hash_type_guid(), hash_size / SECTOR_SIZE, 0, None)?;
        let hash_entry = gpt.get_entry(hash_index)?;
        let hash_offset = entry_offset(&hash_entry);
        let hash_bytes = entry_size(&hash_entry);
        cvmboot_core::punch_hole(output, hash_offset, hash_bytes)?;

        let mut hash_dev = BlockDevice::open_slice(
            output,
            true,
            cvmboot_verity::BLOCK_SIZE as u64,
            hash_offset,
            hash_offset + hash_bytes,
        )?;
        cvmboot_verity::format(&volume_path, &mut hash_dev, verity_uuid)
    })();

    cvmboot_thinprov::teardown_volume(dm.as_ref(), &pool_name, &volume_name)?;
    let roothash = hash_result?;
    let roothash_hex = hex::encode(roothash);

    if let Some(esp_mount) = esp_mount {
        let conf_path = esp_mount.join("EFI/cvmboot/cvmboot.conf");
        std::fs::create_dir_all(conf_path.parent().unwrap())?;
        let mut config = if conf_path.exists() {
            Config::read(&conf_path)?
        } else {
            Config::default()
        };
        config.set_roothash(&roothash_hex);
        config.write(&conf_path)?;
    }

    Ok(PrepareReport {
        roothash: roothash_hex,
        verity_uuid,
    })
}

fn walk_files(root: &Path, rel: &Path, out: &mut Vec<(String, Vec<u8>)>) -> Result<()> {
    for entry in std::fs::read_dir(root.join(rel))? {
        let entry = entry?;
        let rel_path = rel.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            walk_files(root, &rel_path, out)?;
        } else {
            let contents = std::fs::read(entry.path())?;
            let name = rel_path.to_string_lossy().replace('\\', "/");
            out.push((name, contents));
        }
    }
    Ok(())
}

/// Re-sorts/resyncs the GPT embedded in the ESP's host disk image, packs the
/// ESP `EFI/cvmboot` directory into an in-memory CPIO archive, signs it, and
/// writes `cvmboot.cpio`/`cvmboot.cpio.sig` back under that directory.
pub fn protect(disk: impl AsRef<Path>, esp_mount: impl AsRef<Path>, signtool: &dyn cvmboot_sign::SignTool) -> Result<ProtectReport> {
    let disk = disk.as_ref();
    let esp_mount = esp_mount.as_ref();

    {
        let mut gpt = Gpt::open_with_reread(disk, true, reread())?;
        gpt.sync()?;
    }

    let home_dir = esp_mount.join("EFI/cvmboot");
    let mut files = Vec::new();
    if home_dir.is_dir() {
        walk_files(esp_mount, Path::new("EFI/cvmboot"), &mut files)?;
    }

    let archive = cvmboot_sign::write_archive(&files);
    let record = cvmboot_sign::create(&archive, signtool)?;

    std::fs::create_dir_all(&home_dir)?;
    std::fs::write(home_dir.join("cvmboot.cpio"), &archive)?;
    std::fs::write(home_dir.join("cvmboot.cpio.sig"), record.to_bytes()?)?;

    let signer_hex = hex::encode(record.signer);

    let events_path = home_dir.join("events");
    if events_path.is_file() {
        let text = std::fs::read_to_string(&events_path)?;
        match cvmboot_sign::parse_and_extend(&text, &signer_hex) {
            Ok(log) => {
                for pcr in 0..cvmboot_sign::MAX_PCRS {
                    let value = log.pcrs.get(pcr)?;
                    if value != [0u8; 32] {
                        tracing::info!(pcr, value = %hex::encode(value), "expected PCR value");
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "events file present but failed to parse"),
        }
    }

    Ok(ProtectReport { signer_hash: signer_hex })
}

/// Sequential composition of [`prepare`] then [`protect`], sharing the same
/// underlying disk image.
pub fn init(
    input: impl AsRef<Path>,
    output: impl AsRef<Path>,
    dm: Arc<dyn DeviceMapper>,
    esp_mount: &Path,
    signtool: &dyn cvmboot_sign::SignTool,
) -> Result<(PrepareReport, ProtectReport)> {
    let output = output.as_ref();
    let prepare_report = prepare(input, output, dm, Some(esp_mount))?;
    let protect_report = protect(output, esp_mount, signtool)?;
    Ok((prepare_report, protect_report))
}

/// Re-derives the thin-provisioned root volume and the verity hash tree and
/// checks every block of the root partition against the recorded root hash,
/// without mutating the image.
pub fn verify(disk: impl AsRef<Path>, dm: Arc<dyn DeviceMapper>) -> Result<()> {
    let disk = disk.as_ref();

    let gpt = Gpt::open_with_reread(disk, false, reread())?;

    let data_index = gpt
        .find_partition_by_type(thin_data_type_guid())
        .ok_or_else(|| CvmbootError::NotFound("no thin-data partition".into()))?;
    let meta_index = gpt
        .find_partition_by_type(thin_meta_type_guid())
        .ok_or_else(|| CvmbootError::NotFound("no thin-meta partition".into()))?;
    let hash_index = gpt
        .find_partition_by_type(verity_hash_type_guid())
        .ok_or_else(|| CvmbootError::NotFound("no verity hash partition".into()))?;
    let root_index = gpt
        .find_partition_by_type(linux_filesystem_type_guid())
        .ok_or_else(|| CvmbootError::NotFound("no linux filesystem partition".into()))?;

    let root_entry = gpt.get_entry(root_index)?;
    let root_size = entry_size(&root_entry);
    let hash_entry = gpt.get_entry(hash_index)?;

    let loop_dev = cvmboot_platform::attach(disk)?;
    let result = (|| -> Result<()> {
        let data_dev = cvmboot_platform::partition_device(&loop_dev, data_index + 1);
        let meta_dev = cvmboot_platform::partition_device(&loop_dev, meta_index + 1);

        let thin_instance = Uuid::new_v4();
        let root_sectors = root_size / SECTOR_SIZE;
        let (pool_name, volume_name, volume_path) =
            cvmboot_thinprov::activate_volume(dm.as_ref(), &meta_dev, &data_dev, root_sectors, thin_instance)?;

        let verify_result = (|| -> Result<()> {
            let mut hash_dev = BlockDevice::open_slice(
                disk,
                false,
                cvmboot_verity::BLOCK_SIZE as u64,
                entry_offset(&hash_entry),
                entry_offset(&hash_entry) + entry_size(&hash_entry),
            )?;
            let sb = cvmboot_verity::get_superblock(&mut hash_dev)?;
            let roothash = cvmboot_verity::get_roothash(&mut hash_dev)?;
            let tree = cvmboot_verity::load_hash_tree(&mut hash_dev, &sb, &roothash)?;
            cvmboot_verity::verify_data_device(&volume_path, &sb, &tree)
        })();

        cvmboot_thinprov::teardown_volume(dm.as_ref(), &pool_name, &volume_name)?;
        verify_result
    })();

    let _ = cvmboot_platform::detach(&loop_dev);
    result
}

/// Creates a new container sized to the sum of every partition except root,
/// copies those partitions across preserving sparseness, and swaps it in
/// place of `disk`.
pub fn strip(disk: impl AsRef<Path>) -> Result<PathBuf> {
    let disk = disk.as_ref();
    let gpt = Gpt::open_with_reread(disk, false, reread())?;

    let root_index = gpt
        .find_partition_by_type(linux_filesystem_type_guid())
        .ok_or_else(|| CvmbootError::NotFound("no linux filesystem partition".into()))?;
    // The rootfs-upper overlay partition, when present, is ephemeral per-boot
    // state and is dropped alongside the root partition, not carried into the
    // stripped image.
    let upper_index = gpt.find_partition_by_type(rootfs_upper_type_guid());

    let mut total = 0u64;
    for i in 0..gpt.num_entries() {
        if i == root_index || Some(i) == upper_index {
            continue;
        }
        total += entry_size(&gpt.get_entry(i)?);
    }

    let stripped_path = disk.with_extension("stripped.img");
    std::fs::File::create(&stripped_path)?.set_len(total)?;

    let mut write_offset = 0u64;
    for i in 0..gpt.num_entries() {
        if i == root_index || Some(i) == upper_index {
            continue;
        }
        let entry = gpt.get_entry(i)?;
        let (frags, _holes) = frags_find(disk, entry_offset(&entry), entry_offset(&entry) + entry_size(&entry))?;
        sparse_copy(&frags, disk, entry_offset(&entry), &stripped_path, write_offset)?;
        write_offset += entry_size(&entry);
    }

    std::fs::rename(&stripped_path, disk)?;
    Ok(disk.to_path_buf())
}

/// Classifies the disk image's lifecycle state from its GPT layout and ESP
/// contents.
pub fn state(disk: impl AsRef<Path>, esp: &dyn EspProbe) -> Result<ImageState> {
    let disk = disk.as_ref();
    let gpt = Gpt::open(disk, false)?;

    let input = ClassifyInput {
        gpt_sorted: gpt.is_sorted(),
        has_verity_partition: gpt.find_partition_by_type(verity_hash_type_guid()).is_some(),
        has_linux_partition: gpt.find_partition_by_type(linux_filesystem_type_guid()).is_some(),
        has_cvmboot_home_dir: esp.has_cvmboot_home_dir()?,
        has_cpio_signature: esp.has_cpio_signature()?,
    };

    Ok(cvmboot_core::classify(input))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_files_collects_nested_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("EFI/cvmboot/sub")).unwrap();
        std::fs::write(dir.path().join("EFI/cvmboot/cvmboot.conf"), b"roothash=ab\n").unwrap();
        std::fs::write(dir.path().join("EFI/cvmboot/sub/events"), b"PCR0:string:x\n").unwrap();

        let mut out = Vec::new();
        walk_files(dir.path(), Path::new("EFI/cvmboot"), &mut out).unwrap();
        out.sort();

        assert_eq!(out.len(), 2);
        assert!(out.iter().any(|(name, _)| name == "EFI/cvmboot/cvmboot.conf"));
        assert!(out.iter().any(|(name, _)| name == "EFI/cvmboot/sub/events"));
    }
}
