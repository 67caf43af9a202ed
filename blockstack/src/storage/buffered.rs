//! Byte-granular access over a device with larger read/program units.
//!
//! One program unit of write-back cache coalesces small writes; it is
//! programmed when the unit is completed, when a write moves to another unit,
//! or on sync/deinit. One read unit of scratch serves unaligned reads.
use alloc::vec;
use alloc::vec::Vec;
use core::cmp::min;

use spin::Mutex;

use super::block_device::{align_down, ranges_overlap, BdError, BlockDevice, InitRef};

/// Buffers allocated on first init, dropped on final deinit.
struct Cache {
    write: Vec<u8>,
    read: Vec<u8>,
    /// Address of the program unit held in `write`.
    addr: u64,
    valid: bool,
    bd_read_size: u64,
    bd_program_size: u64,
    bd_size: u64,
}

impl Cache {
    fn in_bounds(&self, addr: u64, size: u64) -> bool {
        matches!(addr.checked_add(size), Some(end) if end <= self.bd_size)
    }

    fn overlaps(&self, addr: u64, size: u64) -> bool {
        self.valid && ranges_overlap(self.addr, self.bd_program_size, addr, size)
    }

    fn flush(&mut self, bd: &dyn BlockDevice) -> Result<(), BdError> {
        if self.valid {
            log::trace!("buffered: flushing unit at {:#x}", self.addr);
            bd.program(&self.write, self.addr)?;
            self.valid = false;
        }
        Ok(())
    }

    /// Serve the head of `dst` from the wrapped device. Returns bytes served.
    fn read_through(&mut self, bd: &dyn BlockDevice, dst: &mut [u8], addr: u64) -> Result<usize, BdError> {
        let unit = self.bd_read_size;
        let aligned = align_down(addr, unit);
        let len = dst.len() as u64;

        if aligned == addr && len >= unit {
            let n = align_down(len, unit) as usize;
            bd.read(&mut dst[..n], addr)?;
            return Ok(n);
        }

        bd.read(&mut self.read, aligned)?;
        let offset = (addr - aligned) as usize;
        let n = min(unit - offset as u64, len) as usize;
        dst[..n].copy_from_slice(&self.read[offset..offset + n]);
        Ok(n)
    }
}

/// Block device with read/program size 1 over any wrapped device.
pub struct BufferedBlockDevice<'a> {
    bd: &'a dyn BlockDevice,
    refs: InitRef,
    cache: Mutex<Option<Cache>>,
}

impl<'a> BufferedBlockDevice<'a> {
    pub fn new(bd: &'a dyn BlockDevice) -> Self {
        Self {
            bd,
            refs: InitRef::new(),
            cache: Mutex::new(None),
        }
    }

    /// Program the cached unit, if any, without syncing the wrapped device.
    pub fn flush(&self) -> Result<(), BdError> {
        let mut cache = self.cache.lock();
        let cache = cache.as_mut().ok_or(BdError::DeviceError)?;
        cache.flush(self.bd)
    }
}

impl BlockDevice for BufferedBlockDevice<'_> {
    fn init(&self) -> Result<(), BdError> {
        if !self.refs.acquire() {
            return Ok(());
        }
        if let Err(err) = self.bd.init() {
            self.refs.reset();
            return Err(err);
        }

        let bd_read_size = self.bd.read_size();
        let bd_program_size = self.bd.program_size();
        let bd_size = self.bd.size();
        if bd_read_size == 0 || bd_program_size == 0 {
            log::warn!("buffered: {} reports a zero read or program unit", self.bd.device_type());
            self.refs.reset();
            if let Err(close) = self.bd.deinit() {
                log::warn!("buffered: deinit after failed init: {}", close);
            }
            return Err(BdError::DeviceError);
        }
        log::debug!(
            "buffered: init over {} (read {}, program {}, size {})",
            self.bd.device_type(),
            bd_read_size,
            bd_program_size,
            bd_size
        );

        *self.cache.lock() = Some(Cache {
            write: vec![0u8; bd_program_size as usize],
            read: vec![0u8; bd_read_size as usize],
            addr: 0,
            valid: false,
            bd_read_size,
            bd_program_size,
            bd_size,
        });
        Ok(())
    }

    fn deinit(&self) -> Result<(), BdError> {
        let mut guard = self.cache.lock();
        let Some(cache) = guard.as_mut() else {
            return Ok(());
        };

        cache.flush(self.bd)?;
        self.bd.sync()?;

        if !self.refs.release() {
            return Ok(());
        }
        if let Err(err) = self.bd.deinit() {
            self.refs.acquire();
            return Err(err);
        }
        *guard = None;
        log::debug!("buffered: deinit");
        Ok(())
    }

    fn sync(&self) -> Result<(), BdError> {
        let mut cache = self.cache.lock();
        let cache = cache.as_mut().ok_or(BdError::DeviceError)?;
        cache.flush(self.bd)?;
        self.bd.sync()
    }

    fn read(&self, buf: &mut [u8], addr: u64) -> Result<(), BdError> {
        let mut guard = self.cache.lock();
        let cache = guard.as_mut().ok_or(BdError::DeviceError)?;
        let size = buf.len() as u64;
        if !cache.in_bounds(addr, size) {
            return Err(BdError::DeviceError);
        }

        if !cache.overlaps(addr, size) && self.bd.is_valid_read(addr, size) {
            return self.bd.read(buf, addr);
        }

        let mut addr = addr;
        let mut pos = 0usize;
        while pos < buf.len() {
            let remaining = (buf.len() - pos) as u64;
            let cache_end = cache.addr + cache.bd_program_size;

            let n = if cache.valid && addr >= cache.addr && addr < cache_end {
                let offset = (addr - cache.addr) as usize;
                let n = min(remaining, cache_end - addr) as usize;
                buf[pos..pos + n].copy_from_slice(&cache.write[offset..offset + n]);
                n
            } else {
                // Stop short of the cached unit so its bytes come from the cache.
                let limit = if cache.valid && addr < cache.addr {
                    min(remaining, cache.addr - addr)
                } else {
                    remaining
                };
                let limit = limit as usize;
                cache.read_through(self.bd, &mut buf[pos..pos + limit], addr)?
            };

            pos += n;
            addr += n as u64;
        }
        Ok(())
    }

    fn program(&self, buf: &[u8], addr: u64) -> Result<(), BdError> {
        let mut guard = self.cache.lock();
        let cache = guard.as_mut().ok_or(BdError::DeviceError)?;
        if !cache.in_bounds(addr, buf.len() as u64) {
            return Err(BdError::DeviceError);
        }

        let unit = cache.bd_program_size;
        if align_down(addr, unit) != cache.addr {
            cache.flush(self.bd)?;
        }

        let mut addr = addr;
        let mut buf = buf;
        while !buf.is_empty() {
            cache.addr = align_down(addr, unit);
            let offset = addr - cache.addr;
            let remaining = buf.len() as u64;
            let chunk = if offset != 0 {
                min(unit - offset, remaining)
            } else if remaining >= unit {
                align_down(remaining, unit)
            } else {
                remaining
            };
            let (head, tail) = buf.split_at(chunk as usize);

            if chunk < unit {
                // Partial unit: read-modify-write through the cache.
                if !cache.valid {
                    self.bd.read(&mut cache.write, cache.addr)?;
                }
                let offset = offset as usize;
                cache.write[offset..offset + head.len()].copy_from_slice(head);

                if (offset as u64 + chunk) % unit == 0 {
                    self.bd.program(&cache.write, cache.addr)?;
                    self.bd.sync()?;
                    cache.valid = false;
                } else {
                    cache.valid = true;
                }
            } else {
                // Whole units go straight from the caller's buffer.
                self.bd.program(head, cache.addr)?;
                self.bd.sync()?;
                cache.valid = false;
            }

            addr += chunk;
            buf = tail;
        }
        Ok(())
    }

    fn erase(&self, addr: u64, size: u64) -> Result<(), BdError> {
        let mut guard = self.cache.lock();
        let cache = guard.as_mut().ok_or(BdError::DeviceError)?;
        if !self.bd.is_valid_erase(addr, size) {
            return Err(BdError::DeviceError);
        }
        // Erased data is gone anyway; drop the cache instead of flushing it.
        if cache.overlaps(addr, size) {
            cache.valid = false;
        }
        self.bd.erase(addr, size)
    }

    fn trim(&self, addr: u64, size: u64) -> Result<(), BdError> {
        let mut guard = self.cache.lock();
        let cache = guard.as_mut().ok_or(BdError::DeviceError)?;
        if !self.bd.is_valid_erase(addr, size) {
            return Err(BdError::DeviceError);
        }
        if cache.overlaps(addr, size) {
            cache.valid = false;
        }
        self.bd.trim(addr, size)
    }

    fn read_size(&self) -> u64 {
        if self.cache.lock().is_some() { 1 } else { 0 }
    }

    fn program_size(&self) -> u64 {
        if self.cache.lock().is_some() { 1 } else { 0 }
    }

    fn erase_size(&self) -> u64 {
        if self.cache.lock().is_some() { self.bd.erase_size() } else { 0 }
    }

    fn erase_size_at(&self, addr: u64) -> u64 {
        if self.cache.lock().is_some() { self.bd.erase_size_at(addr) } else { 0 }
    }

    fn erase_value(&self) -> i32 {
        if self.cache.lock().is_some() { self.bd.erase_value() } else { -1 }
    }

    fn size(&self) -> u64 {
        self.cache.lock().as_ref().map_or(0, |cache| cache.bd_size)
    }

    fn device_type(&self) -> &'static str {
        "BUFFERED"
    }

    fn is_valid_read(&self, addr: u64, size: u64) -> bool {
        self.cache.lock().as_ref().is_some_and(|cache| cache.in_bounds(addr, size))
    }

    fn is_valid_program(&self, addr: u64, size: u64) -> bool {
        self.cache.lock().as_ref().is_some_and(|cache| cache.in_bounds(addr, size))
    }

    fn is_valid_erase(&self, addr: u64, size: u64) -> bool {
        self.cache.lock().is_some() && self.bd.is_valid_erase(addr, size)
    }
}
