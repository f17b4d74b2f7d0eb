//! Simulated device memory
//!
//! One [`Memory`] instance backs each address space: private memories belong
//! to a single work-item, local memories to a single work-group, and the
//! global memory (which also holds constant data) is shared by the whole
//! invocation and the host.
//!
//! # Addressing
//!
//! ```text
//!  63                 64-buffer_bits                    0
//! ┌────────────────────┬─────────────────────────────────┐
//! │     buffer id      │             offset              │
//! └────────────────────┴─────────────────────────────────┘
//! ```
//!
//! Buffer id 0 is never handed out, so the null pointer never decodes to a
//! live buffer.
//!
//! Methods here only move bytes. Plugin notification is the caller's job,
//! since only the caller knows which entity performed the access.

pub mod lock_array;

use crate::error::{Result, SimError};
use crate::ir::AddressSpace;
use crate::flags::flag_set;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

pub use lock_array::{LockArray, ShardKey, ShardedMap, DEFAULT_BUCKETS};

/// Buffer-id width used unless configured otherwise.
pub const DEFAULT_BUFFER_BITS: u32 = 16;

static NEXT_MEMORY_ID: AtomicU64 = AtomicU64::new(1);

flag_set! {
    /// Access restrictions for kernel accesses to a buffer.
    pub struct MemFlags {
        const READ_ONLY = 1 << 0;
        const WRITE_ONLY = 1 << 1;
    }
}

flag_set! {
    /// Host mapping mode of a buffer region.
    pub struct MapFlags {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// Read-modify-write operations supported by [`Memory::atomic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicOp {
    Add,
    Sub,
    Xchg,
    Inc,
    Dec,
    CmpXchg,
    /// Signed minimum
    Min,
    /// Signed maximum
    Max,
    UMin,
    UMax,
    And,
    Or,
    Xor,
    /// Plain atomic read
    Load,
    /// Plain atomic write
    Store,
}

impl AtomicOp {
    /// Whether the operation writes memory.
    pub fn writes(self) -> bool {
        !matches!(self, AtomicOp::Load)
    }

    /// Value stored for an old value `old` (`None` when nothing is written).
    pub fn apply(self, old: u64, operand: u64, compare: u64, size: usize) -> Option<u64> {
        let bits = size as u32 * 8;
        let mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
        let sext = |v: u64| -> i64 {
            let shift = 64 - bits;
            ((v << shift) as i64) >> shift
        };
        let new = match self {
            AtomicOp::Add => old.wrapping_add(operand),
            AtomicOp::Sub => old.wrapping_sub(operand),
            AtomicOp::Xchg | AtomicOp::Store => operand,
            AtomicOp::Inc => old.wrapping_add(1),
            AtomicOp::Dec => old.wrapping_sub(1),
            AtomicOp::CmpXchg => {
                if old & mask == compare & mask {
                    operand
                } else {
                    return None;
                }
            }
            AtomicOp::Min => {
                if sext(operand & mask) < sext(old & mask) {
                    operand
                } else {
                    old
                }
            }
            AtomicOp::Max => {
                if sext(operand & mask) > sext(old & mask) {
                    operand
                } else {
                    old
                }
            }
            AtomicOp::UMin => (operand & mask).min(old & mask),
            AtomicOp::UMax => (operand & mask).max(old & mask),
            AtomicOp::And => old & operand,
            AtomicOp::Or => old | operand,
            AtomicOp::Xor => old ^ operand,
            AtomicOp::Load => return None,
        };
        Some(new & mask)
    }
}

struct Buffer {
    size: u64,
    flags: MemFlags,
    data: Box<[AtomicU8]>,
}

impl Buffer {
    fn zeroed(size: u64, flags: MemFlags) -> Self {
        Self {
            size,
            flags,
            data: (0..size).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    fn read(&self, offset: usize, out: &mut [u8]) {
        for (dst, src) in out.iter_mut().zip(&self.data[offset..]) {
            *dst = src.load(Ordering::Relaxed);
        }
    }

    fn write(&self, offset: usize, data: &[u8]) {
        for (dst, src) in self.data[offset..].iter().zip(data) {
            dst.store(*src, Ordering::Relaxed);
        }
    }
}

/// Byte-addressable buffer arena for one address space.
pub struct Memory {
    id: u64,
    space: AddressSpace,
    buffer_bits: u32,
    buffers: RwLock<Vec<Option<Buffer>>>,
    free_ids: Mutex<Vec<usize>>,
    total_allocated: AtomicU64,
    atomic_locks: LockArray,
}

impl Memory {
    /// Empty memory for `space` with `buffer_bits` bits of buffer id.
    pub fn new(space: AddressSpace, buffer_bits: u32) -> Self {
        let buffer_bits = buffer_bits.clamp(1, 32);
        let buckets = if space.is_device_wide() { DEFAULT_BUCKETS } else { 1 };
        Self {
            id: NEXT_MEMORY_ID.fetch_add(1, Ordering::Relaxed),
            space,
            buffer_bits,
            // slot 0 is the null buffer
            buffers: RwLock::new(vec![None]),
            free_ids: Mutex::new(Vec::new()),
            total_allocated: AtomicU64::new(0),
            atomic_locks: LockArray::new(buckets),
        }
    }

    /// Process-unique identity of this memory.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn space(&self) -> AddressSpace {
        self.space
    }

    pub fn buffer_bits(&self) -> u32 {
        self.buffer_bits
    }

    fn offset_bits(&self) -> u32 {
        64 - self.buffer_bits
    }

    pub fn max_buffers(&self) -> usize {
        1usize << self.buffer_bits.min(usize::BITS - 1)
    }

    /// Largest buffer the address encoding can describe.
    pub fn max_buffer_size(&self) -> u64 {
        1u64 << self.offset_bits().min(63)
    }

    pub fn extract_buffer(&self, address: u64) -> usize {
        (address >> self.offset_bits()) as usize
    }

    pub fn extract_offset(&self, address: u64) -> u64 {
        address & (self.max_buffer_size() - 1)
    }

    pub fn make_address(&self, buffer: usize, offset: u64) -> u64 {
        ((buffer as u64) << self.offset_bits()) | offset
    }

    // ============================================================================================
    // Allocation
    // ============================================================================================

    /// Allocate a zero-filled buffer and return its base address.
    pub fn allocate(&self, size: u64, flags: MemFlags) -> Result<u64> {
        let fail = |reason: &str| SimError::AllocationFailed {
            space: self.space,
            size,
            reason: reason.to_string(),
        };
        if size == 0 {
            return Err(fail("zero-sized allocation"));
        }
        if size > self.max_buffer_size() {
            return Err(fail("exceeds maximum buffer size"));
        }

        let mut buffers = self.buffers.write();
        let id = match self.free_ids.lock().pop() {
            Some(id) => id,
            None => {
                if buffers.len() >= self.max_buffers() {
                    return Err(fail("buffer ids exhausted"));
                }
                buffers.push(None);
                buffers.len() - 1
            }
        };
        buffers[id] = Some(Buffer::zeroed(size, flags));
        self.total_allocated.fetch_add(size, Ordering::Relaxed);

        if self.space.is_device_wide() {
            clgrind_tracing::performance::record_allocation(self.space.name(), size, id as u64);
        }
        Ok(self.make_address(id, 0))
    }

    /// Release the buffer starting at `address`.
    pub fn deallocate(&self, address: u64) -> Result<()> {
        let id = self.extract_buffer(address);
        let mut buffers = self.buffers.write();
        let slot = match buffers.get_mut(id) {
            Some(slot) if id != 0 && self.extract_offset(address) == 0 => slot,
            _ => {
                return Err(SimError::InvalidDeallocation {
                    space: self.space,
                    address,
                })
            }
        };
        let buffer = slot.take().ok_or(SimError::InvalidDeallocation {
            space: self.space,
            address,
        })?;
        self.total_allocated.fetch_sub(buffer.size, Ordering::Relaxed);
        self.free_ids.lock().push(id);
        Ok(())
    }

    /// Drop every buffer.
    pub fn clear(&self) {
        let mut buffers = self.buffers.write();
        buffers.clear();
        buffers.push(None);
        self.free_ids.lock().clear();
        self.total_allocated.store(0, Ordering::Relaxed);
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.read().iter().filter(|b| b.is_some()).count()
    }

    pub fn total_allocated(&self) -> u64 {
        self.total_allocated.load(Ordering::Relaxed)
    }

    pub fn buffer_size(&self, address: u64) -> Option<u64> {
        let buffers = self.buffers.read();
        buffers.get(self.extract_buffer(address))?.as_ref().map(|b| b.size)
    }

    pub fn buffer_flags(&self, address: u64) -> Option<MemFlags> {
        let buffers = self.buffers.read();
        buffers.get(self.extract_buffer(address))?.as_ref().map(|b| b.flags)
    }

    /// True iff `address` decodes to a live buffer with `size` bytes in range.
    pub fn is_address_valid(&self, address: u64, size: u64) -> bool {
        let offset = self.extract_offset(address);
        self.buffer_size(address)
            .is_some_and(|buffer_size| offset.checked_add(size).is_some_and(|end| end <= buffer_size))
    }

    // ============================================================================================
    // Access
    // ============================================================================================

    fn with_buffer<R>(&self, address: u64, size: u64, f: impl FnOnce(&Buffer, usize) -> Result<R>) -> Result<R> {
        let invalid = || SimError::InvalidAccess {
            space: self.space,
            address,
            size,
        };
        let buffers = self.buffers.read();
        let buffer = buffers
            .get(self.extract_buffer(address))
            .and_then(Option::as_ref)
            .ok_or_else(invalid)?;
        let offset = self.extract_offset(address);
        match offset.checked_add(size) {
            Some(end) if end <= buffer.size => f(buffer, offset as usize),
            _ => Err(invalid()),
        }
    }

    fn check_readable(&self, buffer: &Buffer, address: u64) -> Result<()> {
        if buffer.flags.contains(MemFlags::WRITE_ONLY) {
            return Err(SimError::ReadFromWriteOnly {
                space: self.space,
                address,
            });
        }
        Ok(())
    }

    /// Kernel load, honouring `WRITE_ONLY`. The range is checked before the
    /// result is allocated.
    pub fn load(&self, address: u64, size: u64) -> Result<Vec<u8>> {
        self.with_buffer(address, size, |buffer, offset| {
            self.check_readable(buffer, address)?;
            let mut out = vec![0u8; size as usize];
            buffer.read(offset, &mut out);
            Ok(out)
        })
    }

    pub fn load_into(&self, address: u64, out: &mut [u8]) -> Result<()> {
        self.with_buffer(address, out.len() as u64, |buffer, offset| {
            self.check_readable(buffer, address)?;
            buffer.read(offset, out);
            Ok(())
        })
    }

    /// Kernel store, honouring `READ_ONLY`.
    pub fn store(&self, address: u64, data: &[u8]) -> Result<()> {
        self.with_buffer(address, data.len() as u64, |buffer, offset| {
            if buffer.flags.contains(MemFlags::READ_ONLY) {
                return Err(SimError::WriteToReadOnly {
                    space: self.space,
                    address,
                });
            }
            buffer.write(offset, data);
            Ok(())
        })
    }

    /// Host read; access qualifiers do not apply.
    pub fn host_read(&self, address: u64, size: u64) -> Result<Vec<u8>> {
        self.with_buffer(address, size, |buffer, offset| {
            let mut out = vec![0u8; size as usize];
            buffer.read(offset, &mut out);
            Ok(out)
        })
    }

    /// Host write; access qualifiers do not apply.
    pub fn host_write(&self, address: u64, data: &[u8]) -> Result<()> {
        self.with_buffer(address, data.len() as u64, |buffer, offset| {
            buffer.write(offset, data);
            Ok(())
        })
    }

    /// Atomic read-modify-write of a 4- or 8-byte value. Returns the old
    /// value.
    pub fn atomic(&self, op: AtomicOp, address: u64, size: usize, operand: u64, compare: u64) -> Result<u64> {
        if size != 4 && size != 8 {
            return Err(SimError::malformed(format!("{size}-byte atomic")));
        }
        if address % size as u64 != 0 {
            return Err(SimError::UnalignedAtomic {
                address,
                size: size as u64,
            });
        }
        let _guard = self.atomic_locks.lock(address);
        self.with_buffer(address, size as u64, |buffer, offset| {
            if op.writes() && buffer.flags.contains(MemFlags::READ_ONLY) {
                return Err(SimError::WriteToReadOnly {
                    space: self.space,
                    address,
                });
            }
            let mut bytes = [0u8; 8];
            buffer.read(offset, &mut bytes[..size]);
            let old = u64::from_le_bytes(bytes);
            if let Some(new) = op.apply(old, operand, compare, size) {
                buffer.write(offset, &new.to_le_bytes()[..size]);
            }
            Ok(old)
        })
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("id", &self.id)
            .field("space", &self.space)
            .field("buffers", &self.num_buffers())
            .field("total_allocated", &self.total_allocated())
            .finish()
    }
}

// ================================================================================================
// Tests
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn global() -> Memory {
        Memory::new(AddressSpace::Global, DEFAULT_BUFFER_BITS)
    }

    #[test]
    fn test_null_is_invalid() {
        let memory = global();
        let addr = memory.allocate(16, MemFlags::empty()).unwrap();
        assert_ne!(addr, 0);
        assert!(!memory.is_address_valid(0, 1));
        assert!(memory.load(0, 4).is_err());
    }

    #[test]
    fn test_store_load_roundtrip() {
        let memory = global();
        let addr = memory.allocate(16, MemFlags::empty()).unwrap();
        memory.store(addr + 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(memory.load(addr + 4, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(memory.load(addr, 4).unwrap(), vec![0; 4]);
    }

    #[test]
    fn test_out_of_bounds() {
        let memory = global();
        let addr = memory.allocate(8, MemFlags::empty()).unwrap();
        assert!(memory.is_address_valid(addr + 4, 4));
        assert!(!memory.is_address_valid(addr + 5, 4));
        assert!(matches!(memory.load(addr + 6, 4), Err(SimError::InvalidAccess { .. })));
    }

    #[test]
    fn test_huge_length_is_invalid_access() {
        let memory = global();
        let addr = memory.allocate(4, MemFlags::empty()).unwrap();
        assert!(matches!(memory.load(addr, 1 << 44), Err(SimError::InvalidAccess { .. })));
        assert!(matches!(memory.host_read(addr, u64::MAX), Err(SimError::InvalidAccess { .. })));
    }

    #[test]
    fn test_access_qualifiers() {
        let memory = global();
        let ro = memory.allocate(4, MemFlags::READ_ONLY).unwrap();
        let wo = memory.allocate(4, MemFlags::WRITE_ONLY).unwrap();
        assert!(matches!(memory.store(ro, &[1]), Err(SimError::WriteToReadOnly { .. })));
        assert!(matches!(memory.load(wo, 1), Err(SimError::ReadFromWriteOnly { .. })));
        memory.host_write(ro, &[9]).unwrap();
        assert_eq!(memory.host_read(ro, 1).unwrap(), vec![9]);
        assert!(memory.store(wo, &[1]).is_ok());
    }

    #[test]
    fn test_ids_are_reused() {
        let memory = global();
        let a = memory.allocate(4, MemFlags::empty()).unwrap();
        memory.deallocate(a).unwrap();
        let b = memory.allocate(4, MemFlags::empty()).unwrap();
        assert_eq!(memory.extract_buffer(a), memory.extract_buffer(b));
        assert_eq!(memory.num_buffers(), 1);
        assert!(matches!(
            memory.deallocate(b + 1),
            Err(SimError::InvalidDeallocation { .. })
        ));
    }

    #[test]
    fn test_allocation_limits() {
        let memory = Memory::new(AddressSpace::Private, 2);
        assert!(memory.allocate(0, MemFlags::empty()).is_err());
        for _ in 0..3 {
            memory.allocate(1, MemFlags::empty()).unwrap();
        }
        assert!(matches!(
            memory.allocate(1, MemFlags::empty()),
            Err(SimError::AllocationFailed { .. })
        ));
        assert_eq!(memory.total_allocated(), 3);
        memory.clear();
        assert_eq!(memory.num_buffers(), 0);
    }

    #[test]
    fn test_atomic_ops() {
        let memory = global();
        let addr = memory.allocate(8, MemFlags::empty()).unwrap();
        assert_eq!(memory.atomic(AtomicOp::Add, addr, 4, 5, 0).unwrap(), 0);
        assert_eq!(memory.atomic(AtomicOp::CmpXchg, addr, 4, 9, 4).unwrap(), 5);
        assert_eq!(memory.load(addr, 4).unwrap(), 5u32.to_le_bytes().to_vec());
        memory.atomic(AtomicOp::CmpXchg, addr, 4, 9, 5).unwrap();
        assert_eq!(memory.atomic(AtomicOp::Min, addr, 4, (-3i32) as u32 as u64, 0).unwrap(), 9);
        assert_eq!(memory.atomic(AtomicOp::Load, addr, 4, 0, 0).unwrap(), (-3i32) as u32 as u64);
        assert!(matches!(
            memory.atomic(AtomicOp::Add, addr + 2, 4, 1, 0),
            Err(SimError::UnalignedAtomic { .. })
        ));
    }

    #[test]
    fn test_concurrent_atomic_add() {
        let memory = Arc::new(global());
        let addr = memory.allocate(4, MemFlags::empty()).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let memory = Arc::clone(&memory);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        memory.atomic(AtomicOp::Inc, addr, 4, 0, 0).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(memory.load(addr, 4).unwrap(), 2000u32.to_le_bytes().to_vec());
    }

    #[test]
    fn test_memory_ids_are_unique() {
        assert_ne!(global().id(), global().id());
    }
}
