//! Erase-endurance simulation.
//!
//! Every erase unit starts with a fixed budget of erase cycles. Each erase
//! spends one cycle per unit; a unit whose budget is spent rejects further
//! erases and programs with `DeviceError` without reaching the wrapped device.
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use super::block_device::{BdError, BlockDevice, InitRef};

struct WearTable {
    unit: u64,
    remaining: Vec<u32>,
}

impl WearTable {
    fn units(&self, addr: u64, size: u64) -> core::ops::Range<usize> {
        let first = (addr / self.unit) as usize;
        let last = addr.saturating_add(size).div_ceil(self.unit) as usize;
        first..last.min(self.remaining.len())
    }

    fn any_exhausted(&self, addr: u64, size: u64) -> bool {
        self.remaining[self.units(addr, size)].iter().any(|&n| n == 0)
    }
}

pub struct ExhaustibleBlockDevice<'a> {
    bd: &'a dyn BlockDevice,
    erase_cycles: u32,
    refs: InitRef,
    wear: Mutex<Option<WearTable>>,
}

impl<'a> ExhaustibleBlockDevice<'a> {
    /// Wrap `bd`, giving every erase unit `erase_cycles` erases.
    pub fn new(bd: &'a dyn BlockDevice, erase_cycles: u32) -> Self {
        Self {
            bd,
            erase_cycles,
            refs: InitRef::new(),
            wear: Mutex::new(None),
        }
    }

    /// Remaining erase cycles of the unit containing `addr`. 0 before init.
    pub fn erase_cycles(&self, addr: u64) -> u32 {
        let wear = self.wear.lock();
        let Some(wear) = wear.as_ref() else {
            return 0;
        };
        wear.remaining
            .get((addr / wear.unit) as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Override the remaining erase cycles of the unit containing `addr`.
    /// Ignored before init.
    pub fn set_erase_cycles(&self, addr: u64, cycles: u32) {
        let mut wear = self.wear.lock();
        if let Some(wear) = wear.as_mut() {
            let index = (addr / wear.unit) as usize;
            if let Some(slot) = wear.remaining.get_mut(index) {
                *slot = cycles;
            }
        }
    }

    fn is_ready(&self) -> bool {
        self.wear.lock().is_some()
    }
}

impl BlockDevice for ExhaustibleBlockDevice<'_> {
    fn init(&self) -> Result<(), BdError> {
        if !self.refs.acquire() {
            return Ok(());
        }
        if let Err(err) = self.bd.init() {
            self.refs.reset();
            return Err(err);
        }

        let unit = self.bd.erase_size();
        if unit == 0 {
            self.refs.reset();
            self.bd.deinit()?;
            return Err(BdError::DeviceError);
        }
        let count = self.bd.size().div_ceil(unit) as usize;
        log::debug!(
            "exhaustible: {} units of {} bytes, {} cycles each",
            count,
            unit,
            self.erase_cycles
        );
        *self.wear.lock() = Some(WearTable {
            unit,
            remaining: vec![self.erase_cycles; count],
        });
        Ok(())
    }

    fn deinit(&self) -> Result<(), BdError> {
        if !self.is_ready() || !self.refs.release() {
            return Ok(());
        }
        *self.wear.lock() = None;
        self.bd.deinit()
    }

    fn sync(&self) -> Result<(), BdError> {
        if !self.is_ready() {
            return Err(BdError::DeviceError);
        }
        self.bd.sync()
    }

    fn read(&self, buf: &mut [u8], addr: u64) -> Result<(), BdError> {
        if !self.is_ready() || !self.bd.is_valid_read(addr, buf.len() as u64) {
            return Err(BdError::DeviceError);
        }
        self.bd.read(buf, addr)
    }

    fn program(&self, buf: &[u8], addr: u64) -> Result<(), BdError> {
        let wear = self.wear.lock();
        let wear = wear.as_ref().ok_or(BdError::DeviceError)?;
        let size = buf.len() as u64;
        if !self.bd.is_valid_program(addr, size) {
            return Err(BdError::DeviceError);
        }
        if wear.any_exhausted(addr, size) {
            log::debug!("exhaustible: program at {:#x} hits a worn-out unit", addr);
            return Err(BdError::DeviceError);
        }
        self.bd.program(buf, addr)
    }

    fn erase(&self, addr: u64, size: u64) -> Result<(), BdError> {
        let mut wear = self.wear.lock();
        let wear = wear.as_mut().ok_or(BdError::DeviceError)?;
        if !self.bd.is_valid_erase(addr, size) {
            return Err(BdError::DeviceError);
        }
        if wear.any_exhausted(addr, size) {
            log::warn!("exhaustible: erase at {:#x} rejected, unit worn out", addr);
            return Err(BdError::DeviceError);
        }

        self.bd.erase(addr, size)?;
        let units = wear.units(addr, size);
        for remaining in &mut wear.remaining[units] {
            *remaining -= 1;
        }
        Ok(())
    }

    fn trim(&self, addr: u64, size: u64) -> Result<(), BdError> {
        if !self.is_ready() || !self.bd.is_valid_erase(addr, size) {
            return Err(BdError::DeviceError);
        }
        self.bd.trim(addr, size)
    }

    fn read_size(&self) -> u64 {
        if self.is_ready() { self.bd.read_size() } else { 0 }
    }

    fn program_size(&self) -> u64 {
        if self.is_ready() { self.bd.program_size() } else { 0 }
    }

    fn erase_size(&self) -> u64 {
        if self.is_ready() { self.bd.erase_size() } else { 0 }
    }

    fn erase_size_at(&self, addr: u64) -> u64 {
        if self.is_ready() { self.bd.erase_size_at(addr) } else { 0 }
    }

    fn erase_value(&self) -> i32 {
        if self.is_ready() { self.bd.erase_value() } else { -1 }
    }

    fn size(&self) -> u64 {
        if self.is_ready() { self.bd.size() } else { 0 }
    }

    fn device_type(&self) -> &'static str {
        "EXHAUSTIBLE"
    }
}
