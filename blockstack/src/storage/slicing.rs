//! A fixed byte range of a block device, addressed from 0.
//!
//! Bounds may be negative to count back from the end of the wrapped device;
//! they are resolved at init, when the wrapped device's size is known.
use spin::Mutex;

use super::block_device::{BdError, BlockDevice, InitRef};

#[derive(Clone, Copy)]
struct Bounds {
    start: u64,
    stop: u64,
}

pub struct SlicingBlockDevice<'a> {
    bd: &'a dyn BlockDevice,
    start: i64,
    stop: Option<i64>,
    refs: InitRef,
    bounds: Mutex<Option<Bounds>>,
}

impl<'a> SlicingBlockDevice<'a> {
    /// Slice from `start` to the end of `bd`.
    pub fn new(bd: &'a dyn BlockDevice, start: i64) -> Self {
        Self::build(bd, start, None)
    }

    /// Slice `[start, stop)` of `bd`.
    pub fn with_stop(bd: &'a dyn BlockDevice, start: i64, stop: i64) -> Self {
        Self::build(bd, start, Some(stop))
    }

    fn build(bd: &'a dyn BlockDevice, start: i64, stop: Option<i64>) -> Self {
        Self {
            bd,
            start,
            stop,
            refs: InitRef::new(),
            bounds: Mutex::new(None),
        }
    }

    fn bounds(&self) -> Option<Bounds> {
        *self.bounds.lock()
    }

    fn resolve(&self) -> Result<Bounds, BdError> {
        let size = self.bd.size();
        let resolve = |bound: i64| -> Result<u64, BdError> {
            if bound >= 0 {
                Ok(bound as u64)
            } else {
                size.checked_sub(bound.unsigned_abs()).ok_or(BdError::DeviceError)
            }
        };
        let start = resolve(self.start)?;
        let stop = match self.stop {
            Some(stop) => resolve(stop)?,
            None => size,
        };
        if stop < start || !self.bd.is_valid_erase(start, stop - start) {
            log::warn!("slicing: [{:#x}, {:#x}) invalid on {}", start, stop, self.bd.device_type());
            return Err(BdError::DeviceError);
        }
        Ok(Bounds { start, stop })
    }
}

impl BlockDevice for SlicingBlockDevice<'_> {
    fn init(&self) -> Result<(), BdError> {
        if !self.refs.acquire() {
            return Ok(());
        }
        if let Err(err) = self.bd.init() {
            self.refs.reset();
            return Err(err);
        }
        match self.resolve() {
            Ok(bounds) => {
                *self.bounds.lock() = Some(bounds);
                Ok(())
            }
            Err(err) => {
                self.refs.reset();
                if let Err(close) = self.bd.deinit() {
                    log::warn!("slicing: deinit after failed init: {}", close);
                }
                Err(err)
            }
        }
    }

    fn deinit(&self) -> Result<(), BdError> {
        if self.bounds().is_none() || !self.refs.release() {
            return Ok(());
        }
        *self.bounds.lock() = None;
        self.bd.deinit()
    }

    fn sync(&self) -> Result<(), BdError> {
        if self.bounds().is_none() {
            return Err(BdError::DeviceError);
        }
        self.bd.sync()
    }

    fn read(&self, buf: &mut [u8], addr: u64) -> Result<(), BdError> {
        let bounds = self.bounds().ok_or(BdError::DeviceError)?;
        if !self.is_valid_read(addr, buf.len() as u64) {
            return Err(BdError::DeviceError);
        }
        self.bd.read(buf, bounds.start + addr)
    }

    fn program(&self, buf: &[u8], addr: u64) -> Result<(), BdError> {
        let bounds = self.bounds().ok_or(BdError::DeviceError)?;
        if !self.is_valid_program(addr, buf.len() as u64) {
            return Err(BdError::DeviceError);
        }
        self.bd.program(buf, bounds.start + addr)
    }

    fn erase(&self, addr: u64, size: u64) -> Result<(), BdError> {
        let bounds = self.bounds().ok_or(BdError::DeviceError)?;
        if !self.is_valid_erase(addr, size) {
            return Err(BdError::DeviceError);
        }
        self.bd.erase(bounds.start + addr, size)
    }

    fn trim(&self, addr: u64, size: u64) -> Result<(), BdError> {
        let bounds = self.bounds().ok_or(BdError::DeviceError)?;
        if !self.is_valid_erase(addr, size) {
            return Err(BdError::DeviceError);
        }
        self.bd.trim(bounds.start + addr, size)
    }

    fn read_size(&self) -> u64 {
        if self.bounds().is_some() { self.bd.read_size() } else { 0 }
    }

    fn program_size(&self) -> u64 {
        if self.bounds().is_some() { self.bd.program_size() } else { 0 }
    }

    fn erase_size(&self) -> u64 {
        if self.bounds().is_some() { self.bd.erase_size() } else { 0 }
    }

    fn erase_size_at(&self, addr: u64) -> u64 {
        self.bounds().map_or(0, |bounds| self.bd.erase_size_at(bounds.start + addr))
    }

    fn erase_value(&self) -> i32 {
        if self.bounds().is_some() { self.bd.erase_value() } else { -1 }
    }

    fn size(&self) -> u64 {
        self.bounds().map_or(0, |bounds| bounds.stop - bounds.start)
    }

    fn device_type(&self) -> &'static str {
        "SLICING"
    }
}
