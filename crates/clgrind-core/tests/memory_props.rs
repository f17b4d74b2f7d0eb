//! Property tests for the buffer-addressed memory model.

use clgrind_core::ir::AddressSpace;
use clgrind_core::memory::DEFAULT_BUFFER_BITS;
use clgrind_core::{AtomicOp, MemFlags, Memory};
use proptest::prelude::*;

fn region_strategy() -> impl Strategy<Value = (u64, Vec<u8>, u64)> {
    (1u64..512).prop_flat_map(|size| {
        (
            Just(size),
            prop::collection::vec(any::<u8>(), 1..=(size as usize)),
            0..size,
        )
    })
}

proptest! {
    #[test]
    fn test_store_then_load_returns_data((size, data, offset) in region_strategy()) {
        let memory = Memory::new(AddressSpace::Global, DEFAULT_BUFFER_BITS);
        let base = memory.allocate(size, MemFlags::empty()).unwrap();
        let offset = offset.min(size - data.len() as u64);

        memory.store(base + offset, &data).unwrap();
        prop_assert_eq!(memory.load(base + offset, data.len() as u64).unwrap(), data);
    }

    #[test]
    fn test_access_past_end_is_rejected(size in 1u64..256, overrun in 1u64..64) {
        let memory = Memory::new(AddressSpace::Global, DEFAULT_BUFFER_BITS);
        let base = memory.allocate(size, MemFlags::empty()).unwrap();
        prop_assert!(memory.load(base + size - 1, overrun + 1).is_err());
        prop_assert!(!memory.is_address_valid(base, size + overrun));
        prop_assert!(memory.is_address_valid(base, size));
    }

    #[test]
    fn test_address_encoding_round_trips(buffer in 1usize..1000, offset in 0u64..(1 << 20)) {
        let memory = Memory::new(AddressSpace::Local, DEFAULT_BUFFER_BITS);
        let address = memory.make_address(buffer, offset);
        prop_assert_eq!(memory.extract_buffer(address), buffer);
        prop_assert_eq!(memory.extract_offset(address), offset);
    }

    #[test]
    fn test_atomic_add_accumulates(values in prop::collection::vec(any::<u32>(), 1..32)) {
        let memory = Memory::new(AddressSpace::Global, DEFAULT_BUFFER_BITS);
        let base = memory.allocate(4, MemFlags::empty()).unwrap();
        let mut expected = 0u32;
        for v in &values {
            let old = memory.atomic(AtomicOp::Add, base, 4, u64::from(*v), 0).unwrap();
            prop_assert_eq!(old, u64::from(expected));
            expected = expected.wrapping_add(*v);
        }
        let bytes = memory.load(base, 4).unwrap();
        prop_assert_eq!(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), expected);
    }
}

#[test]
fn test_released_buffer_is_invalid() {
    let memory = Memory::new(AddressSpace::Global, DEFAULT_BUFFER_BITS);
    let base = memory.allocate(16, MemFlags::empty()).unwrap();
    memory.deallocate(base).unwrap();
    assert!(memory.load(base, 1).is_err());
    assert!(memory.deallocate(base).is_err());
}
