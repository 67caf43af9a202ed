//! MBR partition view.
//!
//! Layout of the first 512-byte sector:
//!   0..446:    boot code (untouched when reading, erased when formatting)
//!   446..510:  four 16-byte partition entries
//!   510..512:  signature 0x55 0xAA
//!
//! Entry fields: status (1), CHS start (3), type (1), CHS stop (3),
//! LBA offset (4, LE), LBA size (4, LE). A partition sector is
//! `max(erase_size, 512)` bytes of the underlying device.
use alloc::vec;
use core::cmp::max;

use spin::Mutex;

use super::block_device::{align_down, align_up, BdError, BlockDevice, InitRef};

const SECTOR_SIZE: u64 = 512;
const TABLE_OFFSET: usize = 446;
const ENTRY_SIZE: usize = 16;
const ENTRY_COUNT: usize = 4;
const SIGNATURE_OFFSET: usize = 510;
const TABLE_SIZE: usize = ENTRY_SIZE * ENTRY_COUNT + 2;
const SIGNATURE: [u8; 2] = [0x55, 0xAA];

static_assertions::const_assert_eq!(TABLE_OFFSET + ENTRY_SIZE * ENTRY_COUNT, SIGNATURE_OFFSET);
static_assertions::const_assert_eq!(TABLE_OFFSET + TABLE_SIZE, SECTOR_SIZE as usize);

pub const STATUS_INACTIVE: u8 = 0x00;
pub const STATUS_ACTIVE: u8 = 0x80;

pub const TYPE_EMPTY: u8 = 0x00;
pub const TYPE_EXTENDED_CHS: u8 = 0x05;
pub const TYPE_FAT32_LBA: u8 = 0x0C;
pub const TYPE_EXTENDED_LBA: u8 = 0x0F;
pub const TYPE_LINUX_SWAP: u8 = 0x82;
pub const TYPE_LINUX: u8 = 0x83;

/// Highest LBA that CHS can express with 255 heads and 63 sectors per track.
const CHS_MAX_LBA: u32 = 1024 * 255 * 63 - 1;

/// One partition table entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct MbrEntry {
    status: u8,
    chs_start: [u8; 3],
    part_type: u8,
    chs_stop: [u8; 3],
    lba_offset: u32,
    lba_size: u32,
}

impl MbrEntry {
    fn parse(bytes: &[u8]) -> Self {
        Self {
            status: bytes[0],
            chs_start: [bytes[1], bytes[2], bytes[3]],
            part_type: bytes[4],
            chs_stop: [bytes[5], bytes[6], bytes[7]],
            lba_offset: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            lba_size: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        }
    }

    fn write(&self, bytes: &mut [u8]) {
        bytes[0] = self.status;
        bytes[1..4].copy_from_slice(&self.chs_start);
        bytes[4] = self.part_type;
        bytes[5..8].copy_from_slice(&self.chs_stop);
        bytes[8..12].copy_from_slice(&self.lba_offset.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.lba_size.to_le_bytes());
    }

    fn has_valid_status(&self) -> bool {
        self.status == STATUS_INACTIVE || self.status == STATUS_ACTIVE
    }

    fn is_usable(&self) -> bool {
        !matches!(self.part_type, TYPE_EMPTY | TYPE_EXTENDED_CHS | TYPE_EXTENDED_LBA)
    }

    fn overlaps(&self, lba_offset: u32, lba_size: u32) -> bool {
        let (start, end) = (lba_offset as u64, lba_offset as u64 + lba_size as u64);
        let (other_start, other_end) = (self.lba_offset as u64, self.lba_offset as u64 + self.lba_size as u64);
        !(start >= other_end || end <= other_start)
    }
}

/// The 66 bytes from offset 446 to the end of the sector.
struct MbrTable {
    entries: [MbrEntry; ENTRY_COUNT],
    signature: [u8; 2],
}

impl MbrTable {
    fn parse(bytes: &[u8]) -> Self {
        let mut entries = [MbrEntry::default(); ENTRY_COUNT];
        for (i, entry) in entries.iter_mut().enumerate() {
            *entry = MbrEntry::parse(&bytes[i * ENTRY_SIZE..(i + 1) * ENTRY_SIZE]);
        }
        Self {
            entries,
            signature: [bytes[TABLE_SIZE - 2], bytes[TABLE_SIZE - 1]],
        }
    }

    fn write(&self, bytes: &mut [u8]) {
        for (i, entry) in self.entries.iter().enumerate() {
            entry.write(&mut bytes[i * ENTRY_SIZE..(i + 1) * ENTRY_SIZE]);
        }
        bytes[TABLE_SIZE - 2..TABLE_SIZE].copy_from_slice(&self.signature);
    }

    fn has_signature(&self) -> bool {
        self.signature == SIGNATURE
    }
}

/// Aligned window `(start, len)` of the first sector that covers the table
/// for a device with the given I/O unit.
fn table_window(unit: u64) -> Result<(u64, usize), BdError> {
    if unit == 0 {
        return Err(BdError::DeviceError);
    }
    let start = align_down(TABLE_OFFSET as u64, unit);
    let end = align_up(SECTOR_SIZE, unit);
    Ok((start, (end - start) as usize))
}

/// Pack an LBA into the legacy CHS triple (head, sector | cylinder high bits,
/// cylinder low bits), saturating at the largest addressable CHS.
fn lba_to_chs(lba: u32) -> [u8; 3] {
    let lba = lba.min(CHS_MAX_LBA);
    let cylinder = lba / (255 * 63);
    let head = (lba / 63) % 255;
    let sector = lba % 63 + 1;
    [
        head as u8,
        (sector as u8 & 0x3F) | ((cylinder >> 2) as u8 & 0xC0),
        cylinder as u8,
    ]
}

fn sector_size(bd: &dyn BlockDevice) -> u64 {
    max(bd.erase_size(), SECTOR_SIZE)
}

/// Resolve a possibly negative bound against the device size.
fn resolve_bound(bound: i64, size: u64) -> Result<u64, BdError> {
    if bound >= 0 {
        return Ok(bound as u64);
    }
    size.checked_sub(bound.unsigned_abs()).ok_or(BdError::DeviceError)
}

#[derive(Clone, Copy)]
struct PartitionInfo {
    offset: u64,
    size: u64,
    part_type: u8,
}

/// One MBR partition of a device, addressed from 0.
pub struct MbrBlockDevice<'a> {
    bd: &'a dyn BlockDevice,
    part: u8,
    refs: InitRef,
    info: Mutex<Option<PartitionInfo>>,
}

impl<'a> MbrBlockDevice<'a> {
    /// View partition `part` (1-4) of `bd`.
    pub fn new(bd: &'a dyn BlockDevice, part: u8) -> Self {
        Self {
            bd,
            part,
            refs: InitRef::new(),
            info: Mutex::new(None),
        }
    }

    /// Write partition `part` spanning from `start` to the end of `bd`.
    ///
    /// A negative `start` counts back from the end of the device. `bd` must
    /// not be open through an `MbrBlockDevice` at the same time.
    pub fn partition(bd: &dyn BlockDevice, part: u8, part_type: u8, start: i64) -> Result<(), BdError> {
        Self::format(bd, part, part_type, start, None)
    }

    /// Write partition `part` spanning `[start, stop)` of `bd`.
    ///
    /// Negative bounds count back from the end of the device. A start inside
    /// the first 512 bytes is moved forward by one partition sector.
    pub fn partition_range(
        bd: &dyn BlockDevice,
        part: u8,
        part_type: u8,
        start: i64,
        stop: i64,
    ) -> Result<(), BdError> {
        Self::format(bd, part, part_type, start, Some(stop))
    }

    fn format(
        bd: &dyn BlockDevice,
        part: u8,
        part_type: u8,
        start: i64,
        stop: Option<i64>,
    ) -> Result<(), BdError> {
        bd.init()?;
        let result = Self::format_open(bd, part, part_type, start, stop);
        let closed = bd.deinit();
        result.and(closed)
    }

    fn format_open(
        bd: &dyn BlockDevice,
        part: u8,
        part_type: u8,
        start: i64,
        stop: Option<i64>,
    ) -> Result<(), BdError> {
        let size = bd.size();
        let mut offset = resolve_bound(start, size)?;
        let stop = match stop {
            Some(stop) => resolve_bound(stop, size)?,
            None => size,
        };
        // The first sector holds the table.
        if offset < SECTOR_SIZE {
            offset += sector_size(bd);
        }
        if stop < offset {
            return Err(BdError::InvalidPartition);
        }
        Self::partition_absolute(bd, part, part_type, offset, stop - offset)
    }

    /// Write partition `part` at byte `offset` with byte length `size` on an
    /// already initialized `bd`. `offset` must lie past the table sector.
    pub fn partition_absolute(
        bd: &dyn BlockDevice,
        part: u8,
        part_type: u8,
        offset: u64,
        size: u64,
    ) -> Result<(), BdError> {
        if !(1..=ENTRY_COUNT as u8).contains(&part) {
            return Err(BdError::InvalidPartition);
        }
        let sector = sector_size(bd);
        if offset < sector {
            log::warn!("mbr: partition {} at {:#x} overlaps the table sector", part, offset);
            return Err(BdError::InvalidPartition);
        }
        if !bd.is_valid_erase(offset, size) {
            log::warn!("mbr: partition {} [{:#x}, +{:#x}) not erase aligned", part, offset, size);
            return Err(BdError::InvalidPartition);
        }

        let (window_start, window_len) = table_window(bd.program_size())?;
        let mut buf = vec![0u8; window_len];
        bd.read(&mut buf, window_start)?;

        let table_at = TABLE_OFFSET - window_start as usize;
        let mut table = MbrTable::parse(&buf[table_at..table_at + TABLE_SIZE]);
        if !table.has_signature() {
            table = MbrTable {
                entries: [MbrEntry::default(); ENTRY_COUNT],
                signature: SIGNATURE,
            };
        }
        // A boot sector carries the same signature but no valid status bytes.
        if !table.entries.iter().all(MbrEntry::has_valid_status) {
            log::debug!("mbr: discarding foreign boot sector table");
            table.entries = [MbrEntry::default(); ENTRY_COUNT];
        }

        let lba_offset = u32::try_from(offset / sector).map_err(|_| BdError::InvalidPartition)?;
        let lba_size = u32::try_from(size / sector).map_err(|_| BdError::InvalidPartition)?;

        let index = part as usize - 1;
        for (i, other) in table.entries.iter().enumerate() {
            if i != index && other.part_type != TYPE_EMPTY && other.overlaps(lba_offset, lba_size) {
                log::warn!("mbr: partition {} overlaps partition {}", part, i + 1);
                return Err(BdError::InvalidPartition);
            }
        }

        table.entries[index] = MbrEntry {
            status: STATUS_INACTIVE,
            chs_start: lba_to_chs(lba_offset),
            part_type,
            chs_stop: lba_to_chs((lba_offset + lba_size).saturating_sub(1)),
            lba_offset,
            lba_size,
        };

        // Erase may be a no-op on the device; pad with the erased pattern so no
        // stale data survives around the table.
        let fill = u8::try_from(bd.erase_value()).unwrap_or(0xFF);
        buf[..table_at].fill(fill);
        buf[table_at + TABLE_SIZE..].fill(fill);
        table.write(&mut buf[table_at..table_at + TABLE_SIZE]);

        bd.erase(0, bd.erase_size_at(0))?;
        bd.program(&buf, window_start)?;
        log::debug!(
            "mbr: wrote partition {} type {:#04x} lba {}+{}",
            part,
            part_type,
            lba_offset,
            lba_size
        );
        Ok(())
    }

    fn info(&self) -> Option<PartitionInfo> {
        *self.info.lock()
    }

    /// Read the table and validate the selected entry.
    fn load(&self) -> Result<PartitionInfo, BdError> {
        if !(1..=ENTRY_COUNT as u8).contains(&self.part) {
            return Err(BdError::InvalidPartition);
        }

        let (window_start, window_len) = table_window(self.bd.read_size())?;
        let mut buf = vec![0u8; window_len];
        self.bd.read(&mut buf, window_start)?;

        let table_at = TABLE_OFFSET - window_start as usize;
        let table = MbrTable::parse(&buf[table_at..table_at + TABLE_SIZE]);
        if !table.has_signature() {
            log::warn!("mbr: no signature on {}", self.bd.device_type());
            return Err(BdError::InvalidMbr);
        }

        let entry = table.entries[self.part as usize - 1];
        if !entry.has_valid_status() || !entry.is_usable() {
            log::warn!(
                "mbr: partition {} unusable (status {:#04x}, type {:#04x})",
                self.part,
                entry.status,
                entry.part_type
            );
            return Err(BdError::InvalidPartition);
        }

        let sector = sector_size(self.bd);
        let offset = entry.lba_offset as u64 * sector;
        let size = entry.lba_size as u64 * sector;
        if !self.bd.is_valid_erase(offset, size) {
            log::warn!("mbr: partition {} outside device or misaligned", self.part);
            return Err(BdError::InvalidPartition);
        }

        Ok(PartitionInfo {
            offset,
            size,
            part_type: entry.part_type,
        })
    }

    pub fn partition_number(&self) -> u8 {
        self.part
    }

    /// Byte offset of the partition on the wrapped device.
    pub fn partition_start(&self) -> u64 {
        self.info().map_or(0, |info| info.offset)
    }

    /// Byte offset one past the end of the partition on the wrapped device.
    pub fn partition_stop(&self) -> u64 {
        self.info().map_or(0, |info| info.offset + info.size)
    }

    pub fn partition_type(&self) -> u8 {
        self.info().map_or(TYPE_EMPTY, |info| info.part_type)
    }
}

impl BlockDevice for MbrBlockDevice<'_> {
    fn init(&self) -> Result<(), BdError> {
        if !self.refs.acquire() {
            return Ok(());
        }
        if let Err(err) = self.bd.init() {
            self.refs.reset();
            return Err(err);
        }

        match self.load() {
            Ok(info) => {
                log::debug!(
                    "mbr: partition {} at {:#x} size {:#x} type {:#04x}",
                    self.part,
                    info.offset,
                    info.size,
                    info.part_type
                );
                *self.info.lock() = Some(info);
                Ok(())
            }
            Err(err) => {
                self.refs.reset();
                if let Err(close) = self.bd.deinit() {
                    log::warn!("mbr: deinit after failed init: {}", close);
                }
                Err(err)
            }
        }
    }

    fn deinit(&self) -> Result<(), BdError> {
        if self.info().is_none() || !self.refs.release() {
            return Ok(());
        }
        *self.info.lock() = None;
        self.bd.deinit()
    }

    fn sync(&self) -> Result<(), BdError> {
        if self.info().is_none() {
            return Err(BdError::DeviceError);
        }
        self.bd.sync()
    }

    fn read(&self, buf: &mut [u8], addr: u64) -> Result<(), BdError> {
        let info = self.info().ok_or(BdError::DeviceError)?;
        if !self.is_valid_read(addr, buf.len() as u64) {
            return Err(BdError::DeviceError);
        }
        self.bd.read(buf, addr + info.offset)
    }

    fn program(&self, buf: &[u8], addr: u64) -> Result<(), BdError> {
        let info = self.info().ok_or(BdError::DeviceError)?;
        if !self.is_valid_program(addr, buf.len() as u64) {
            return Err(BdError::DeviceError);
        }
        self.bd.program(buf, addr + info.offset)
    }

    fn erase(&self, addr: u64, size: u64) -> Result<(), BdError> {
        let info = self.info().ok_or(BdError::DeviceError)?;
        if !self.is_valid_erase(addr, size) {
            return Err(BdError::DeviceError);
        }
        self.bd.erase(addr + info.offset, size)
    }

    fn trim(&self, addr: u64, size: u64) -> Result<(), BdError> {
        let info = self.info().ok_or(BdError::DeviceError)?;
        if !self.is_valid_erase(addr, size) {
            return Err(BdError::DeviceError);
        }
        self.bd.trim(addr + info.offset, size)
    }

    fn read_size(&self) -> u64 {
        if self.info().is_some() { self.bd.read_size() } else { 0 }
    }

    fn program_size(&self) -> u64 {
        if self.info().is_some() { self.bd.program_size() } else { 0 }
    }

    fn erase_size(&self) -> u64 {
        if self.info().is_some() { self.bd.erase_size() } else { 0 }
    }

    fn erase_size_at(&self, addr: u64) -> u64 {
        self.info().map_or(0, |info| self.bd.erase_size_at(info.offset + addr))
    }

    fn erase_value(&self) -> i32 {
        if self.info().is_some() { self.bd.erase_value() } else { -1 }
    }

    fn size(&self) -> u64 {
        self.info().map_or(0, |info| info.size)
    }

    fn device_type(&self) -> &'static str {
        "MBR"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chs_packing() {
        assert_eq!(lba_to_chs(0), [0, 1, 0]);
        assert_eq!(lba_to_chs(63), [1, 1, 0]);
        // Cylinder 1024 is out of range and saturates at 1023/254/63.
        assert_eq!(lba_to_chs(u32::MAX), [254, 63 | 0xC0, 0xFF]);
    }

    #[test]
    fn table_window_geometry() {
        assert_eq!(table_window(1).unwrap(), (446, 66));
        assert_eq!(table_window(512).unwrap(), (0, 512));
        assert_eq!(table_window(4096).unwrap(), (0, 4096));
        assert!(table_window(0).is_err());
    }

    #[test]
    fn entry_layout_is_little_endian() {
        let entry = MbrEntry {
            status: STATUS_ACTIVE,
            chs_start: [1, 2, 3],
            part_type: TYPE_LINUX,
            chs_stop: [4, 5, 6],
            lba_offset: 0x0403_0201,
            lba_size: 0x0807_0605,
        };
        let mut bytes = [0u8; ENTRY_SIZE];
        entry.write(&mut bytes);
        assert_eq!(bytes, [0x80, 1, 2, 3, 0x83, 4, 5, 6, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(MbrEntry::parse(&bytes), entry);
    }

    #[test]
    fn negative_bounds_count_from_end() {
        assert_eq!(resolve_bound(1024, 8192).unwrap(), 1024);
        assert_eq!(resolve_bound(-1024, 8192).unwrap(), 7168);
        assert!(resolve_bound(-16384, 8192).is_err());
    }
}
