//! Write protection for a block device.
//!
//! Checked reads, sync and geometry pass straight through; program, erase and trim
//! fail with `WriteProtected` without touching the wrapped device.
use super::block_device::{BdError, BlockDevice};

pub struct ReadOnlyBlockDevice<'a> {
    bd: &'a dyn BlockDevice,
}

impl<'a> ReadOnlyBlockDevice<'a> {
    pub fn new(bd: &'a dyn BlockDevice) -> Self {
        Self { bd }
    }
}

impl BlockDevice for ReadOnlyBlockDevice<'_> {
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

    fn program(&self, _buf: &[u8], addr: u64) -> Result<(), BdError> {
        log::debug!("read_only: program at {:#x} refused", addr);
        Err(BdError::WriteProtected)
    }

    fn erase(&self, addr: u64, _size: u64) -> Result<(), BdError> {
        log::debug!("read_only: erase at {:#x} refused", addr);
        Err(BdError::WriteProtected)
    }

    fn trim(&self, _addr: u64, _size: u64) -> Result<(), BdError> {
        Err(BdError::WriteProtected)
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
        "READONLY"
    }
}
