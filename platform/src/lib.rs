pub mod device_mapper;
pub mod exec;
pub mod loopback;
pub mod reread;

pub use device_mapper::DmsetupDeviceMapper;
pub use exec::require_tool;
pub use loopback::{attach, detach, partition_device};
pub use reread::LinuxReread;
