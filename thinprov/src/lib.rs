pub mod engine;
pub mod sizing;

pub use engine::{activate_volume, add_partitions, project, teardown_volume, verify, ThinPartitions};
pub use sizing::{data_partition_size, meta_partition_size, LOW_WATER_MARK_BLOCKS, THIN_BLOCK_SECTORS, THIN_BLOCK_SIZE};
