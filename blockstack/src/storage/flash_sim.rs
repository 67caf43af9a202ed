//! Flash "erase before program" discipline on top of any block device.
//!
//! Erased state is tracked per program unit in a bitmap (1 bit per unit:
//! 1=erased). A program is accepted only if every unit it touches is erased,
//! and clears their bits; an erase writes the erase value over the region and
//! sets them again. Programming the same data twice is rejected as well.
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use super::block_device::{BdError, BlockDevice, InitRef};

struct EraseMap {
    bitmap: Vec<u64>,
    unit: u64,
    /// One program unit of erase value, used to write erased regions.
    blank: Vec<u8>,
}

impl EraseMap {
    fn new(units: u64, unit: u64, erase_value: u8) -> Self {
        Self {
            bitmap: vec![0u64; units.div_ceil(64) as usize],
            unit,
            blank: vec![erase_value; unit as usize],
        }
    }

    fn is_erased(&self, idx: u64) -> bool {
        let word = (idx / 64) as usize;
        let bit = (idx % 64) as u32;
        self.bitmap[word] & (1u64 << bit) != 0
    }

    fn set_erased(&mut self, idx: u64, erased: bool) {
        let word = (idx / 64) as usize;
        let bit = (idx % 64) as u32;
        if erased {
            self.bitmap[word] |= 1u64 << bit;
        } else {
            self.bitmap[word] &= !(1u64 << bit);
        }
    }

    fn units(&self, addr: u64, size: u64) -> core::ops::Range<u64> {
        addr / self.unit..(addr + size).div_ceil(self.unit)
    }
}

pub struct FlashSimBlockDevice<'a> {
    bd: &'a dyn BlockDevice,
    erase_value: u8,
    refs: InitRef,
    map: Mutex<Option<EraseMap>>,
}

impl<'a> FlashSimBlockDevice<'a> {
    /// Wrap `bd`, treating `erase_value` as the content of erased storage.
    pub fn new(bd: &'a dyn BlockDevice, erase_value: u8) -> Self {
        Self {
            bd,
            erase_value,
            refs: InitRef::new(),
            map: Mutex::new(None),
        }
    }

    fn is_ready(&self) -> bool {
        self.map.lock().is_some()
    }

    /// Seed the erased bitmap from the current contents of the wrapped device.
    fn scan(&self) -> Result<EraseMap, BdError> {
        let unit = self.bd.program_size();
        if unit == 0 {
            return Err(BdError::DeviceError);
        }
        let units = self.bd.size() / unit;
        let mut map = EraseMap::new(units, unit, self.erase_value);
        let mut scratch = vec![0u8; unit as usize];
        for idx in 0..units {
            self.bd.read(&mut scratch, idx * unit)?;
            if scratch == map.blank {
                map.set_erased(idx, true);
            }
        }
        Ok(map)
    }
}

impl BlockDevice for FlashSimBlockDevice<'_> {
    fn init(&self) -> Result<(), BdError> {
        if !self.refs.acquire() {
            return Ok(());
        }
        if let Err(err) = self.bd.init() {
            self.refs.reset();
            return Err(err);
        }

        match self.scan() {
            Ok(map) => {
                log::debug!(
                    "flash_sim: init over {}, {} program units, erase value {:#04x}",
                    self.bd.device_type(),
                    self.bd.size() / map.unit,
                    self.erase_value
                );
                *self.map.lock() = Some(map);
                Ok(())
            }
            Err(err) => {
                self.refs.reset();
                if let Err(close) = self.bd.deinit() {
                    log::warn!("flash_sim: deinit after failed init: {}", close);
                }
                Err(err)
            }
        }
    }

    fn deinit(&self) -> Result<(), BdError> {
        if !self.is_ready() || !self.refs.release() {
            return Ok(());
        }
        *self.map.lock() = None;
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
        let mut map = self.map.lock();
        let map = map.as_mut().ok_or(BdError::DeviceError)?;
        let size = buf.len() as u64;
        if !self.bd.is_valid_program(addr, size) {
            return Err(BdError::DeviceError);
        }

        let units = map.units(addr, size);
        if let Some(idx) = units.clone().find(|&idx| !map.is_erased(idx)) {
            log::debug!("flash_sim: program at {:#x} over non-erased unit {}", addr, idx);
            return Err(BdError::NotErased);
        }

        self.bd.program(buf, addr)?;
        for idx in units {
            map.set_erased(idx, false);
        }
        Ok(())
    }

    fn erase(&self, addr: u64, size: u64) -> Result<(), BdError> {
        let mut map = self.map.lock();
        let map = map.as_mut().ok_or(BdError::DeviceError)?;
        if !self.bd.is_valid_erase(addr, size) {
            return Err(BdError::DeviceError);
        }

        self.bd.erase(addr, size)?;
        for idx in map.units(addr, size) {
            self.bd.program(&map.blank, idx * map.unit)?;
            map.set_erased(idx, true);
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
        if self.is_ready() { self.erase_value as i32 } else { -1 }
    }

    fn size(&self) -> u64 {
        if self.is_ready() { self.bd.size() } else { 0 }
    }

    fn device_type(&self) -> &'static str {
        "FLASHSIM"
    }
}
