//! Change notification for a block device.
//!
//! After a program or erase reaches the wrapped device and succeeds, the
//! attached callback runs with a read-only view of that device.
use alloc::boxed::Box;

use spin::Mutex;

use super::block_device::{BdError, BlockDevice};
use super::read_only::ReadOnlyBlockDevice;

/// Observer invoked after every successful mutation.
pub type ChangeCallback<'a> = Box<dyn FnMut(&dyn BlockDevice) + 'a>;

pub struct ObservingBlockDevice<'a> {
    bd: &'a dyn BlockDevice,
    change: Mutex<Option<ChangeCallback<'a>>>,
}

impl<'a> ObservingBlockDevice<'a> {
    pub fn new(bd: &'a dyn BlockDevice) -> Self {
        Self {
            bd,
            change: Mutex::new(None),
        }
    }

    /// Attach `callback`, replacing any previous observer.
    ///
    /// The callback must not call `attach` or `detach` on this device.
    pub fn attach<F>(&self, callback: F)
    where
        F: FnMut(&dyn BlockDevice) + 'a,
    {
        *self.change.lock() = Some(Box::new(callback));
    }

    pub fn detach(&self) {
        *self.change.lock() = None;
    }

    fn notify(&self) {
        if let Some(callback) = self.change.lock().as_mut() {
            callback(&ReadOnlyBlockDevice::new(self.bd));
        }
    }
}

impl BlockDevice for ObservingBlockDevice<'_> {
    fn init(&self) -> Result<(), BdError> {
        self.bd.init()
    }

    fn deinit(&self) -> Result<(), BdError> {
        self.bd.deinit()
    }

    fn sync(&self) -> Result<(), BdError> {
        self.bd.sync()
    }

    fn read(&self, buf: &mut [u8], addr: u64) -> Result<(), BdError> {
        if !self.bd.is_valid_read(addr, buf.len() as u64) {
            return Err(BdError::DeviceError);
        }
        self.bd.read(buf, addr)
    }

    fn program(&self, buf: &[u8], addr: u64) -> Result<(), BdError> {
        if !self.bd.is_valid_program(addr, buf.len() as u64) {
            return Err(BdError::DeviceError);
        }
        self.bd.program(buf, addr)?;
        self.notify();
        Ok(())
    }

    fn erase(&self, addr: u64, size: u64) -> Result<(), BdError> {
        if !self.bd.is_valid_erase(addr, size) {
            return Err(BdError::DeviceError);
        }
        self.bd.erase(addr, size)?;
        self.notify();
        Ok(())
    }

    fn trim(&self, addr: u64, size: u64) -> Result<(), BdError> {
        if !self.bd.is_valid_erase(addr, size) {
            return Err(BdError::DeviceError);
        }
        self.bd.trim(addr, size)
    }

    fn read_size(&self) -> u64 {
        self.bd.read_size()
    }

    fn program_size(&self) -> u64 {
        self.bd.program_size()
    }

    fn erase_size(&self) -> u64 {
        self.bd.erase_size()
    }

    fn erase_size_at(&self, addr: u64) -> u64 {
        self.bd.erase_size_at(addr)
    }

    fn erase_value(&self) -> i32 {
        self.bd.erase_value()
    }

    fn size(&self) -> u64 {
        self.bd.size()
    }

    fn device_type(&self) -> &'static str {
        "OBSERVING"
    }
}
