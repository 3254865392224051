pub mod engine;
pub mod superblock;

pub use engine::{format, get_roothash, get_superblock, hash_dev_size, load_hash_tree, verify_data_device, HashTree};
pub use superblock::{VeritySuperblock, BLOCK_SIZE, ROOTHASH_SIZE};
