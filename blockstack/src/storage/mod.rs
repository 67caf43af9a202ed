pub mod block_device;
mod buffered;
mod chaining;
mod exhaustible;
mod flash_sim;
pub mod heap_device;
pub mod mbr;
mod observing;
mod profiling;
mod read_only;
mod slicing;

pub use block_device::{BdError, BlockDevice, InitRef};
pub use buffered::BufferedBlockDevice;
pub use chaining::ChainingBlockDevice;
pub use exhaustible::ExhaustibleBlockDevice;
pub use flash_sim::FlashSimBlockDevice;
pub use heap_device::HeapBlockDevice;
pub use mbr::MbrBlockDevice;
pub use observing::{ChangeCallback, ObservingBlockDevice};
pub use profiling::ProfilingBlockDevice;
pub use read_only::ReadOnlyBlockDevice;
pub use slicing::SlicingBlockDevice;
