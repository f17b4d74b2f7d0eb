//! Buffer access checks
//!
//! Warns when a kernel reads a buffer argument declared write-only or
//! writes one declared read-only, and when the host writes into a region it
//! mapped for reading only.

use clgrind_core::ir::{AccessQualifier, AddressSpace, Module};
use clgrind_core::{
    ArgValue, AtomicOp, Capabilities, Diagnostic, DiagnosticKind, DiagnosticSink, Entity, KernelInvocation, MapFlags,
    Memory, Plugin,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct ArgAccess {
    name: String,
    access: AccessQualifier,
}

#[derive(Debug, Default)]
struct KernelArgs {
    module: Option<Arc<Module>>,
    /// By buffer index in global memory
    buffers: HashMap<usize, ArgAccess>,
}

/// A host mapping without write access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadMapping {
    memory: u64,
    address: u64,
    size: u64,
}

impl ReadMapping {
    fn overlaps(&self, memory: u64, address: u64, size: u64) -> bool {
        self.memory == memory && address < self.address + self.size && self.address < address + size
    }
}

/// Checks buffer accesses against declared access qualifiers and host
/// mappings.
#[derive(Debug)]
pub struct MemCheck {
    sink: DiagnosticSink,
    args: RwLock<KernelArgs>,
    mappings: Mutex<Vec<ReadMapping>>,
}

impl MemCheck {
    pub fn new(sink: DiagnosticSink) -> Self {
        Self {
            sink,
            args: RwLock::new(KernelArgs::default()),
            mappings: Mutex::new(Vec::new()),
        }
    }

    fn check(&self, entity: Entity<'_>, memory: &Memory, address: u64, store: bool) {
        if memory.space() != AddressSpace::Global {
            return;
        }
        let args = self.args.read();
        let Some(arg) = args.buffers.get(&memory.extract_buffer(address)) else {
            return;
        };
        let message = match (arg.access, store) {
            (AccessQualifier::ReadOnly, true) => format!("Write to read-only argument '{}'", arg.name),
            (AccessQualifier::WriteOnly, false) => format!("Read from write-only argument '{}'", arg.name),
            _ => return,
        };

        let mut diagnostic = Diagnostic::warning(DiagnosticKind::InvalidAccess, message).with_entity(entity.coords());
        if let Some(at) = entity.as_work_item().and_then(|item| item.current_instruction()) {
            let loc = args
                .module
                .as_ref()
                .and_then(|m| m.instruction(at))
                .and_then(|i| i.debug_loc.clone());
            diagnostic = diagnostic.at(at, loc);
        }
        drop(args);
        self.sink.log(diagnostic);
    }
}

impl Plugin for MemCheck {
    fn name(&self) -> &str {
        "mem-check"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::KERNEL | Capabilities::MEMORY | Capabilities::HOST_MEMORY
    }

    fn kernel_begin(&self, invocation: &KernelInvocation<'_>) {
        let kernel = invocation.kernel();
        let memory = invocation.context().global_memory();
        let mut buffers = HashMap::new();
        for (index, info) in kernel.info().args.iter().enumerate() {
            if info.access == AccessQualifier::ReadWrite {
                continue;
            }
            if let Some(ArgValue::Buffer(address)) = kernel.arg(index) {
                if *address != 0 {
                    buffers.insert(
                        memory.extract_buffer(*address),
                        ArgAccess {
                            name: info.name.clone(),
                            access: info.access,
                        },
                    );
                }
            }
        }
        *self.args.write() = KernelArgs {
            module: Some(Arc::clone(kernel.module())),
            buffers,
        };
    }

    fn kernel_end(&self, _invocation: &KernelInvocation<'_>) {
        *self.args.write() = KernelArgs::default();
    }

    fn memory_load(&self, entity: Entity<'_>, memory: &Memory, address: u64, _size: u64) {
        self.check(entity, memory, address, false);
    }

    fn memory_store(&self, entity: Entity<'_>, memory: &Memory, address: u64, _data: &[u8]) {
        self.check(entity, memory, address, true);
    }

    fn memory_atomic_load(&self, entity: Entity<'_>, memory: &Memory, _op: AtomicOp, address: u64, _size: u64) {
        self.check(entity, memory, address, false);
    }

    fn memory_atomic_store(&self, entity: Entity<'_>, memory: &Memory, _op: AtomicOp, address: u64, _size: u64) {
        self.check(entity, memory, address, true);
    }

    fn memory_map(&self, memory: &Memory, address: u64, size: u64, flags: MapFlags) {
        if !flags.contains(MapFlags::WRITE) {
            self.mappings.lock().push(ReadMapping {
                memory: memory.id(),
                address,
                size,
            });
        }
    }

    fn memory_unmap(&self, memory: &Memory, address: u64, size: u64, _flags: MapFlags) {
        let mut mappings = self.mappings.lock();
        if let Some(pos) = mappings
            .iter()
            .position(|m| m.memory == memory.id() && m.address == address && m.size == size)
        {
            mappings.remove(pos);
        }
    }

    fn host_memory_store(&self, memory: &Memory, address: u64, data: &[u8]) {
        let mapped = self
            .mappings
            .lock()
            .iter()
            .any(|m| m.overlaps(memory.id(), address, data.len() as u64));
        if mapped {
            self.sink.log(Diagnostic::warning(
                DiagnosticKind::InvalidAccess,
                format!("Host write to buffer region at {address:#x} that is mapped for reading"),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_mapping_overlap() {
        let mapping = ReadMapping {
            memory: 1,
            address: 0x100,
            size: 16,
        };
        assert!(mapping.overlaps(1, 0x10c, 8));
        assert!(!mapping.overlaps(1, 0x110, 8));
        assert!(!mapping.overlaps(2, 0x100, 4));
        assert!(mapping.overlaps(1, 0xf0, 0x11));
    }
}
