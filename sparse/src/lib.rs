pub mod frags;

pub use frags::{frags_find, frags_set_bits, sparse_compare, sparse_copy, sparse_sha256};
pub use frags::{Frag, FragList, BLOCK_SIZE};
