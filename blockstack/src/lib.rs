//! Composable block-device wrappers.
//!
//! Every wrapper implements [`BlockDevice`] over a borrowed `&dyn BlockDevice`,
//! so stacks such as `Buffered(Chaining(Mbr(flash)))` are built by nesting
//! constructors. The caller owns every device and keeps it alive for as long
//! as any wrapper above it.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod storage;

pub use storage::{
    BdError, BlockDevice, BufferedBlockDevice, ChainingBlockDevice, ExhaustibleBlockDevice,
    FlashSimBlockDevice, HeapBlockDevice, MbrBlockDevice, ObservingBlockDevice,
    ProfilingBlockDevice, ReadOnlyBlockDevice, SlicingBlockDevice,
};
