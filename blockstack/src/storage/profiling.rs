//! Pass-through that counts the traffic reaching a block device.
//!
//! Call counters tick on every forwarded call; byte counters only on
//! success. Used by the tests to assert what a wrapper sent downstream.
use core::sync::atomic::{AtomicU64, Ordering};

use super::block_device::{BdError, BlockDevice};

#[derive(Default)]
struct Counter {
    calls: AtomicU64,
    bytes: AtomicU64,
}

impl Counter {
    fn record(&self, bytes: u64, result: Result<(), BdError>) -> Result<(), BdError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if result.is_ok() {
            self.bytes.fetch_add(bytes, Ordering::Relaxed);
        }
        result
    }

    fn reset(&self) {
        self.calls.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
    }
}

pub struct ProfilingBlockDevice<'a> {
    bd: &'a dyn BlockDevice,
    reads: Counter,
    programs: Counter,
    erases: Counter,
    syncs: AtomicU64,
    inits: AtomicU64,
    deinits: AtomicU64,
}

impl<'a> ProfilingBlockDevice<'a> {
    pub fn new(bd: &'a dyn BlockDevice) -> Self {
        Self {
            bd,
            reads: Counter::default(),
            programs: Counter::default(),
            erases: Counter::default(),
            syncs: AtomicU64::new(0),
            inits: AtomicU64::new(0),
            deinits: AtomicU64::new(0),
        }
    }

    /// Bytes successfully read.
    pub fn read_count(&self) -> u64 {
        self.reads.bytes.load(Ordering::Relaxed)
    }

    /// Bytes successfully programmed.
    pub fn program_count(&self) -> u64 {
        self.programs.bytes.load(Ordering::Relaxed)
    }

    /// Bytes successfully erased.
    pub fn erase_count(&self) -> u64 {
        self.erases.bytes.load(Ordering::Relaxed)
    }

    pub fn read_calls(&self) -> u64 {
        self.reads.calls.load(Ordering::Relaxed)
    }

    pub fn program_calls(&self) -> u64 {
        self.programs.calls.load(Ordering::Relaxed)
    }

    pub fn erase_calls(&self) -> u64 {
        self.erases.calls.load(Ordering::Relaxed)
    }

    pub fn sync_calls(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }

    pub fn init_calls(&self) -> u64 {
        self.inits.load(Ordering::Relaxed)
    }

    pub fn deinit_calls(&self) -> u64 {
        self.deinits.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.reads.reset();
        self.programs.reset();
        self.erases.reset();
        self.syncs.store(0, Ordering::Relaxed);
        self.inits.store(0, Ordering::Relaxed);
        self.deinits.store(0, Ordering::Relaxed);
    }
}

impl BlockDevice for ProfilingBlockDevice<'_> {
    fn init(&self) -> Result<(), BdError> {
        self.inits.fetch_add(1, Ordering::Relaxed);
        self.bd.init()
    }

    fn deinit(&self) -> Result<(), BdError> {
        self.deinits.fetch_add(1, Ordering::Relaxed);
        self.bd.deinit()
    }

    fn sync(&self) -> Result<(), BdError> {
        self.syncs.fetch_add(1, Ordering::Relaxed);
        self.bd.sync()
    }

    fn read(&self, buf: &mut [u8], addr: u64) -> Result<(), BdError> {
        let len = buf.len() as u64;
        self.reads.record(len, self.bd.read(buf, addr))
    }

    fn program(&self, buf: &[u8], addr: u64) -> Result<(), BdError> {
        self.programs.record(buf.len() as u64, self.bd.program(buf, addr))
    }

    fn erase(&self, addr: u64, size: u64) -> Result<(), BdError> {
        self.erases.record(size, self.bd.erase(addr, size))
    }

    fn trim(&self, addr: u64, size: u64) -> Result<(), BdError> {
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
        "PROFILING"
    }
}
