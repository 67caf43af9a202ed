//! Concatenation of several block devices into one address space.
//!
//! Member N starts where member N-1 ends. Reported read/program/erase units
//! are the largest across members; every member unit must divide it, and
//! every member size must be a multiple of it.
use alloc::vec::Vec;
use core::cmp::min;

use spin::Mutex;

use super::block_device::{BdError, BlockDevice, InitRef};

/// Geometry normalized over all members, computed at init.
#[derive(Clone, Copy)]
struct ChainGeometry {
    read_size: u64,
    program_size: u64,
    erase_size: u64,
    erase_value: i32,
    size: u64,
}

/// Fold one member's unit into the running maximum.
///
/// Returns `None` when neither unit divides the other.
fn merge_unit(current: u64, unit: u64) -> Option<u64> {
    if unit == 0 {
        return None;
    }
    if current == 0 {
        return Some(unit);
    }
    if unit >= current && unit % current == 0 {
        Some(unit)
    } else if current > unit && current % unit == 0 {
        Some(current)
    } else {
        None
    }
}

pub struct ChainingBlockDevice<'a> {
    bds: Vec<&'a dyn BlockDevice>,
    refs: InitRef,
    geometry: Mutex<Option<ChainGeometry>>,
}

impl<'a> ChainingBlockDevice<'a> {
    pub fn new(bds: &[&'a dyn BlockDevice]) -> Self {
        Self {
            bds: bds.to_vec(),
            refs: InitRef::new(),
            geometry: Mutex::new(None),
        }
    }

    fn geometry(&self) -> Option<ChainGeometry> {
        *self.geometry.lock()
    }

    /// Init every member and normalize their geometry.
    fn open_members(&self) -> Result<ChainGeometry, BdError> {
        if self.bds.is_empty() {
            log::warn!("chaining: no members");
            return Err(BdError::DeviceError);
        }
        let mut geo = ChainGeometry {
            read_size: 0,
            program_size: 0,
            erase_size: 0,
            erase_value: -1,
            size: 0,
        };

        for (i, bd) in self.bds.iter().enumerate() {
            if let Err(err) = bd.init() {
                let _ = self.close_members(i);
                return Err(err);
            }

            let merged = (
                merge_unit(geo.read_size, bd.read_size()),
                merge_unit(geo.program_size, bd.program_size()),
                merge_unit(geo.erase_size, bd.erase_size()),
            );
            let (Some(read), Some(program), Some(erase)) = merged else {
                log::warn!(
                    "chaining: member {} ({}) geometry incompatible with chain",
                    i,
                    bd.device_type()
                );
                let _ = self.close_members(i + 1);
                return Err(BdError::DeviceError);
            };
            geo.read_size = read;
            geo.program_size = program;
            geo.erase_size = erase;
            geo.size += bd.size();

            let value = bd.erase_value();
            if i == 0 {
                geo.erase_value = value;
            } else if value != geo.erase_value {
                geo.erase_value = -1;
            }
        }

        // Member boundaries must stay aligned to the chain's units.
        let misaligned = self.bds.iter().position(|bd| {
            let size = bd.size();
            size % geo.read_size != 0 || size % geo.program_size != 0 || size % geo.erase_size != 0
        });
        if let Some(i) = misaligned {
            log::warn!("chaining: member {} size not a multiple of the chain units", i);
            let _ = self.close_members(self.bds.len());
            return Err(BdError::DeviceError);
        }
        Ok(geo)
    }

    /// Deinit the first `count` members, keeping the first error.
    fn close_members(&self, count: usize) -> Result<(), BdError> {
        let mut result = Ok(());
        for bd in &self.bds[..count] {
            if let Err(err) = bd.deinit() {
                log::warn!("chaining: member {} deinit failed: {}", bd.device_type(), err);
                result = result.and(Err(err));
            }
        }
        result
    }

    /// Split `[addr, addr + size)` at member boundaries.
    ///
    /// `op` receives the member, the member-local address, the offset into the
    /// request and the length of the piece. The first error aborts the walk.
    fn for_each_span<F>(&self, addr: u64, size: u64, mut op: F) -> Result<(), BdError>
    where
        F: FnMut(&dyn BlockDevice, u64, usize, u64) -> Result<(), BdError>,
    {
        let mut addr = addr;
        let mut done = 0u64;
        for bd in &self.bds {
            if done == size {
                break;
            }
            let bd_size = bd.size();
            if addr >= bd_size {
                addr -= bd_size;
                continue;
            }
            let len = min(size - done, bd_size - addr);
            op(*bd, addr, done as usize, len)?;
            done += len;
            addr = 0;
        }
        Ok(())
    }

    /// Member holding `addr` and the member-local address.
    fn locate(&self, addr: u64) -> Option<(&'a dyn BlockDevice, u64)> {
        let mut addr = addr;
        for bd in &self.bds {
            let bd_size = bd.size();
            if addr < bd_size {
                return Some((*bd, addr));
            }
            addr -= bd_size;
        }
        None
    }
}

impl BlockDevice for ChainingBlockDevice<'_> {
    fn init(&self) -> Result<(), BdError> {
        if !self.refs.acquire() {
            return Ok(());
        }
        match self.open_members() {
            Ok(geo) => {
                log::debug!(
                    "chaining: init {} members (read {}, program {}, erase {}, size {})",
                    self.bds.len(),
                    geo.read_size,
                    geo.program_size,
                    geo.erase_size,
                    geo.size
                );
                *self.geometry.lock() = Some(geo);
                Ok(())
            }
            Err(err) => {
                self.refs.reset();
                Err(err)
            }
        }
    }

    fn deinit(&self) -> Result<(), BdError> {
        if self.geometry().is_none() || !self.refs.release() {
            return Ok(());
        }
        *self.geometry.lock() = None;
        log::debug!("chaining: deinit");
        self.close_members(self.bds.len())
    }

    fn sync(&self) -> Result<(), BdError> {
        if self.geometry().is_none() {
            return Err(BdError::DeviceError);
        }
        for bd in &self.bds {
            bd.sync()?;
        }
        Ok(())
    }

    fn read(&self, buf: &mut [u8], addr: u64) -> Result<(), BdError> {
        if !self.is_valid_read(addr, buf.len() as u64) {
            return Err(BdError::DeviceError);
        }
        self.for_each_span(addr, buf.len() as u64, |bd, local, offset, len| {
            bd.read(&mut buf[offset..offset + len as usize], local)
        })
    }

    fn program(&self, buf: &[u8], addr: u64) -> Result<(), BdError> {
        if !self.is_valid_program(addr, buf.len() as u64) {
            return Err(BdError::DeviceError);
        }
        self.for_each_span(addr, buf.len() as u64, |bd, local, offset, len| {
            bd.program(&buf[offset..offset + len as usize], local)
        })
    }

    fn erase(&self, addr: u64, size: u64) -> Result<(), BdError> {
        if !self.is_valid_erase(addr, size) {
            return Err(BdError::DeviceError);
        }
        self.for_each_span(addr, size, |bd, local, _, len| bd.erase(local, len))
    }

    fn trim(&self, addr: u64, size: u64) -> Result<(), BdError> {
        if !self.is_valid_erase(addr, size) {
            return Err(BdError::DeviceError);
        }
        self.for_each_span(addr, size, |bd, local, _, len| bd.trim(local, len))
    }

    fn read_size(&self) -> u64 {
        self.geometry().map_or(0, |geo| geo.read_size)
    }

    fn program_size(&self) -> u64 {
        self.geometry().map_or(0, |geo| geo.program_size)
    }

    fn erase_size(&self) -> u64 {
        self.geometry().map_or(0, |geo| geo.erase_size)
    }

    fn erase_size_at(&self, addr: u64) -> u64 {
        if self.geometry().is_none() {
            return 0;
        }
        self.locate(addr).map_or(0, |(bd, local)| bd.erase_size_at(local))
    }

    fn erase_value(&self) -> i32 {
        self.geometry().map_or(-1, |geo| geo.erase_value)
    }

    fn size(&self) -> u64 {
        self.geometry().map_or(0, |geo| geo.size)
    }

    fn device_type(&self) -> &'static str {
        "CHAINING"
    }
}
