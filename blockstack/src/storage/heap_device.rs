//! RAM-backed block device.
//!
//! Simulates a block device entirely in memory. Contents are allocated at
//! construction and survive deinit/init cycles, so a device can be formatted,
//! closed and reopened by a different wrapper stack. Used as the leaf under
//! every wrapper in the unit tests.
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use super::block_device::{BdError, BlockDevice, InitRef};

/// RAM-backed block device.
pub struct HeapBlockDevice {
    data: Mutex<Vec<u8>>,
    size: u64,
    read_size: u64,
    program_size: u64,
    erase_size: u64,
    erase_value: Option<u8>,
    refs: InitRef,
    init_calls: AtomicU32,
    deinit_calls: AtomicU32,
}

impl HeapBlockDevice {
    /// Create a RAM device with the given geometry and no defined erase value.
    pub fn new(size: u64, read_size: u64, program_size: u64, erase_size: u64) -> Self {
        Self::build(size, read_size, program_size, erase_size, None)
    }

    /// Create a RAM device whose erase writes `erase_value`. Contents start erased.
    pub fn with_erase_value(
        size: u64,
        read_size: u64,
        program_size: u64,
        erase_size: u64,
        erase_value: u8,
    ) -> Self {
        Self::build(size, read_size, program_size, erase_size, Some(erase_value))
    }

    fn build(
        size: u64,
        read_size: u64,
        program_size: u64,
        erase_size: u64,
        erase_value: Option<u8>,
    ) -> Self {
        debug_assert!(read_size > 0 && program_size % read_size == 0);
        debug_assert!(program_size > 0 && erase_size % program_size == 0);
        debug_assert!(erase_size > 0 && size % erase_size == 0);
        Self {
            data: Mutex::new(vec![erase_value.unwrap_or(0); size as usize]),
            size,
            read_size,
            program_size,
            erase_size,
            erase_value,
            refs: InitRef::new(),
            init_calls: AtomicU32::new(0),
            deinit_calls: AtomicU32::new(0),
        }
    }

    fn is_ready(&self) -> bool {
        self.refs.count() > 0
    }

    /// How many init() calls actually initialized the device (for testing).
    pub fn init_calls(&self) -> u32 {
        self.init_calls.load(Ordering::Relaxed)
    }

    /// How many deinit() calls actually released the device (for testing).
    pub fn deinit_calls(&self) -> u32 {
        self.deinit_calls.load(Ordering::Relaxed)
    }

    /// Copy raw bytes out at an offset, bypassing geometry (for test verification).
    ///
    /// Panics if `offset + len` is past the end of the device.
    pub fn read_raw(&self, offset: usize, len: usize) -> Vec<u8> {
        self.data.lock()[offset..offset + len].to_vec()
    }

    /// Overwrite raw bytes at an offset, bypassing geometry (for test setup).
    ///
    /// Panics if the bytes do not fit inside the device.
    pub fn write_raw(&self, offset: usize, bytes: &[u8]) {
        self.data.lock()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl BlockDevice for HeapBlockDevice {
    fn init(&self) -> Result<(), BdError> {
        if self.refs.acquire() {
            self.init_calls.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn deinit(&self) -> Result<(), BdError> {
        if self.refs.release() {
            self.deinit_calls.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn read(&self, buf: &mut [u8], addr: u64) -> Result<(), BdError> {
        if !self.is_valid_read(addr, buf.len() as u64) {
            return Err(BdError::DeviceError);
        }
        let start = addr as usize;
        buf.copy_from_slice(&self.data.lock()[start..start + buf.len()]);
        Ok(())
    }

    fn program(&self, buf: &[u8], addr: u64) -> Result<(), BdError> {
        if !self.is_valid_program(addr, buf.len() as u64) {
            return Err(BdError::DeviceError);
        }
        let start = addr as usize;
        self.data.lock()[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn erase(&self, addr: u64, size: u64) -> Result<(), BdError> {
        if !self.is_valid_erase(addr, size) {
            return Err(BdError::DeviceError);
        }
        if let Some(value) = self.erase_value {
            let start = addr as usize;
            self.data.lock()[start..start + size as usize].fill(value);
        }
        Ok(())
    }

    fn read_size(&self) -> u64 {
        if self.is_ready() { self.read_size } else { 0 }
    }

    fn program_size(&self) -> u64 {
        if self.is_ready() { self.program_size } else { 0 }
    }

    fn erase_size(&self) -> u64 {
        if self.is_ready() { self.erase_size } else { 0 }
    }

    fn erase_value(&self) -> i32 {
        match self.erase_value {
            Some(value) if self.is_ready() => value as i32,
            _ => -1,
        }
    }

    fn size(&self) -> u64 {
        if self.is_ready() { self.size } else { 0 }
    }

    fn device_type(&self) -> &'static str {
        "HEAP"
    }
}
