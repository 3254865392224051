pub mod blockdev;
pub mod device_mapper;
pub mod error;
pub mod esp;
pub mod guid;
pub mod lifecycle;
pub mod reread;
pub mod state;

pub use blockdev::{getsize64, punch_hole, BlockDevice};
pub use device_mapper::DeviceMapper;
pub use error::{CvmbootError, Result};
pub use esp::{EspProbe, FakeEsp, MountedEsp};
pub use lifecycle::LifecycleContext;
pub use reread::{NoopReread, PartitionTableReread};
pub use state::{classify, ClassifyInput, ImageState};
