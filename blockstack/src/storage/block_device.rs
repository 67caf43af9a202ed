//! BlockDevice trait: the capability set every leaf driver and every wrapper
//! implements.
//!
//! Wrappers hold a `&'a dyn BlockDevice` to the device they decorate, so any
//! wrapper can sit on top of any other. All methods take `&self`: per-instance
//! state lives behind `spin::Mutex` or atomics, which lets one device be shared
//! by several outer stacks.
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

/// Block device errors.
///
/// Every variant maps onto the stable integer space returned by [`BdError::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BdError {
    /// Generic failure or misuse: uninitialized, misaligned, out of range,
    /// erase budget exhausted.
    DeviceError,
    /// Write or erase attempted on a read-only device.
    WriteProtected,
    /// Program attempted over storage that was not erased first.
    NotErased,
    /// No MBR signature in the first sector.
    InvalidMbr,
    /// Requested MBR partition has a bad status, type or alignment.
    InvalidPartition,
    /// Driver-specific error code from a leaf device.
    Device(i32),
}

impl BdError {
    pub const DEVICE_ERROR: i32 = -4001;
    pub const WRITE_PROTECTED: i32 = -4002;
    pub const INVALID_MBR: i32 = -3101;
    pub const INVALID_PARTITION: i32 = -3102;
    pub const NOT_ERASED: i32 = -3201;

    /// Integer status for this error. Success is 0 and never produced here.
    pub fn code(&self) -> i32 {
        match self {
            BdError::DeviceError => Self::DEVICE_ERROR,
            BdError::WriteProtected => Self::WRITE_PROTECTED,
            BdError::NotErased => Self::NOT_ERASED,
            BdError::InvalidMbr => Self::INVALID_MBR,
            BdError::InvalidPartition => Self::INVALID_PARTITION,
            BdError::Device(code) => *code,
        }
    }

    /// Classify an integer status into a result.
    pub fn from_code(code: i32) -> Result<(), BdError> {
        match code {
            0 => Ok(()),
            Self::DEVICE_ERROR => Err(BdError::DeviceError),
            Self::WRITE_PROTECTED => Err(BdError::WriteProtected),
            Self::NOT_ERASED => Err(BdError::NotErased),
            Self::INVALID_MBR => Err(BdError::InvalidMbr),
            Self::INVALID_PARTITION => Err(BdError::InvalidPartition),
            other => Err(BdError::Device(other)),
        }
    }
}

impl fmt::Display for BdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BdError::DeviceError => write!(f, "block device error"),
            BdError::WriteProtected => write!(f, "block device is write protected"),
            BdError::NotErased => write!(f, "program over non-erased storage"),
            BdError::InvalidMbr => write!(f, "invalid MBR signature"),
            BdError::InvalidPartition => write!(f, "invalid MBR partition"),
            BdError::Device(code) => write!(f, "device error {}", code),
        }
    }
}

/// Abstract block device.
///
/// Addresses and sizes are in bytes. The length of the buffer passed to
/// `read`/`program` is the size of the operation. Geometry queries return 0
/// (or -1 for [`erase_value`](Self::erase_value)) until `init` succeeds.
pub trait BlockDevice {
    /// Prepare the device for I/O.
    fn init(&self) -> Result<(), BdError>;

    /// Release the device. A device that was never initialized returns `Ok`.
    fn deinit(&self) -> Result<(), BdError>;

    /// Flush any cached writes down to stable storage.
    fn sync(&self) -> Result<(), BdError> {
        Ok(())
    }

    /// Read `buf.len()` bytes starting at `addr`.
    fn read(&self, buf: &mut [u8], addr: u64) -> Result<(), BdError>;

    /// Program `buf` at `addr`. The region must have been erased first.
    fn program(&self, buf: &[u8], addr: u64) -> Result<(), BdError>;

    /// Erase `size` bytes starting at `addr`.
    fn erase(&self, addr: u64, size: u64) -> Result<(), BdError>;

    /// Hint that `size` bytes at `addr` are no longer in use.
    fn trim(&self, _addr: u64, _size: u64) -> Result<(), BdError> {
        Ok(())
    }

    /// Smallest readable unit in bytes.
    fn read_size(&self) -> u64;

    /// Smallest programmable unit in bytes.
    fn program_size(&self) -> u64;

    /// Smallest erasable unit in bytes.
    fn erase_size(&self) -> u64;

    /// Erase unit of the region containing `addr`.
    fn erase_size_at(&self, _addr: u64) -> u64 {
        self.erase_size()
    }

    /// Byte value of erased storage, or -1 if erase leaves unknown content.
    fn erase_value(&self) -> i32 {
        -1
    }

    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Tag naming the concrete device kind.
    fn device_type(&self) -> &'static str;

    fn is_valid_read(&self, addr: u64, size: u64) -> bool {
        is_valid_range(addr, size, self.read_size(), self.size())
    }

    fn is_valid_program(&self, addr: u64, size: u64) -> bool {
        is_valid_range(addr, size, self.program_size(), self.size())
    }

    fn is_valid_erase(&self, addr: u64, size: u64) -> bool {
        let end = match addr.checked_add(size) {
            Some(end) if end <= self.size() => end,
            _ => return false,
        };
        let start_unit = self.erase_size_at(addr);
        if start_unit == 0 || addr % start_unit != 0 {
            return false;
        }
        if size == 0 {
            return true;
        }
        let end_unit = self.erase_size_at(end - 1);
        end_unit != 0 && end % end_unit == 0
    }
}

/// Aligned, in-bounds range check shared by the read and program validators.
pub fn is_valid_range(addr: u64, size: u64, unit: u64, device_size: u64) -> bool {
    if unit == 0 || addr % unit != 0 || size % unit != 0 {
        return false;
    }
    matches!(addr.checked_add(size), Some(end) if end <= device_size)
}

#[inline]
pub fn align_down(value: u64, unit: u64) -> u64 {
    value - value % unit
}

#[inline]
pub fn align_up(value: u64, unit: u64) -> u64 {
    align_down(value + unit - 1, unit)
}

#[inline]
pub fn is_aligned(value: u64, unit: u64) -> bool {
    unit != 0 && value % unit == 0
}

/// Whether `[a, a + a_len)` and `[b, b + b_len)` share at least one byte.
#[inline]
pub fn ranges_overlap(a: u64, a_len: u64, b: u64, b_len: u64) -> bool {
    a < b + b_len && b < a + a_len
}

/// Nested init/deinit reference count.
///
/// The first `acquire` does the real init, the last matching `release` does
/// the real teardown. Calls in between only move the count.
pub struct InitRef {
    count: AtomicU32,
}

impl InitRef {
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
        }
    }

    /// Take a reference. Returns true if the caller holds the first one.
    pub fn acquire(&self) -> bool {
        self.count.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Drop a reference. Returns true if it was the last one.
    pub fn release(&self) -> bool {
        let prev = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        prev == Ok(1)
    }

    /// Forget all references after a failed first init.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Release);
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }
}

impl Default for InitRef {
    fn default() -> Self {
        Self::new()
    }
}
