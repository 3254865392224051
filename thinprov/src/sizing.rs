//! Thin-data/meta partition sizing (spec component E).

pub const SECTOR_SIZE: u64 = 512;
/// `thin_block_size` passed to `dmsetup` for the pool: 1024 sectors = 512 KiB.
pub const THIN_BLOCK_SECTORS: u64 = 1024;
pub const THIN_BLOCK_SIZE: u64 = THIN_BLOCK_SECTORS * SECTOR_SIZE;
/// Counted in thin blocks, not bytes.
pub const LOW_WATER_MARK_BLOCKS: u64 = 1024;

const HEADROOM_BYTES: u64 = 1 << 30; // 1 GiB
const ALIGNMENT: u64 = 2 * 1024 * 1024; // 2 MiB

fn round_up(x: u64, m: u64) -> u64 {
    x.div_ceil(m) * m
}

/// Size of the thin-data partition given the non-sparse byte count of the
/// root filesystem being projected.
pub fn data_partition_size(non_sparse_bytes: u64) -> u64 {
    let raw = non_sparse_bytes + HEADROOM_BYTES + LOW_WATER_MARK_BLOCKS * THIN_BLOCK_SIZE;
    round_up(raw, ALIGNMENT)
}

/// Size of the thin-meta partition, roughly 2.5% of the data partition.
pub fn meta_partition_size(data_partition_size: u64) -> u64 {
    round_up(data_partition_size / 40, ALIGNMENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_size_includes_headroom_and_low_water_mark() {
        let size = data_partition_size(0);
        let expected_raw = HEADROOM_BYTES + LOW_WATER_MARK_BLOCKS * THIN_BLOCK_SIZE;
        assert_eq!(size, round_up(expected_raw, ALIGNMENT));
    }

    #[test]
    fn meta_size_is_roughly_2_5_percent_of_data() {
        let data = data_partition_size(10 * 1024 * 1024 * 1024);
        let meta = meta_partition_size(data);
        assert!(meta >= data / 41 && meta <= data / 39);
    }

    #[test]
    fn sizes_are_2mib_aligned() {
        let data = data_partition_size(12345);
        let meta = meta_partition_size(data);
        assert_eq!(data % ALIGNMENT, 0);
        assert_eq!(meta % ALIGNMENT, 0);
    }
}
