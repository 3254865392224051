pub mod engine;
pub mod raw;

pub use engine::{entry_offset, entry_size, format_new_gpt, Gpt};
pub use raw::{GptEntry, GptHeader};
