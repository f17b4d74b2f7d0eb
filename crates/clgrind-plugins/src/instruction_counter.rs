//! Instruction histogram
//!
//! Counts every executed instruction by mnemonic, the bytes moved by loads
//! and stores in each address space, and the calls made to each callee. The
//! counts cover the most recent kernel invocation.

use clgrind_core::ir::{AddressSpace, Instruction, InstructionRef, Opcode};
use clgrind_core::{AtomicOp, Capabilities, Entity, KernelInvocation, Memory, Plugin, TypedValue, WorkItem};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Default)]
struct Counts {
    kernel: Option<String>,
    opcodes: HashMap<&'static str, u64>,
    calls: HashMap<String, u64>,
    loaded: [u64; 4],
    stored: [u64; 4],
}

/// Traffic through one address space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryTraffic {
    pub space: &'static str,
    pub loaded: u64,
    pub stored: u64,
}

/// Snapshot of an [`InstructionCounter`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstructionReport {
    pub kernel: Option<String>,
    /// `(mnemonic, count)`, most frequent first
    pub instructions: Vec<(String, u64)>,
    /// `(callee, count)`, most frequent first
    pub calls: Vec<(String, u64)>,
    pub memory: Vec<MemoryTraffic>,
}

impl InstructionReport {
    pub fn total(&self) -> u64 {
        self.instructions.iter().map(|(_, n)| n).sum()
    }

    pub fn count(&self, mnemonic: &str) -> u64 {
        self.instructions
            .iter()
            .find(|(m, _)| m == mnemonic)
            .map_or(0, |(_, n)| *n)
    }

    pub fn traffic(&self, space: AddressSpace) -> Option<&MemoryTraffic> {
        self.memory.iter().find(|t| t.space == space.name())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn sorted<K: ToString>(counts: impl IntoIterator<Item = (K, u64)>) -> Vec<(String, u64)> {
    let mut out: Vec<(String, u64)> = counts.into_iter().map(|(k, n)| (k.to_string(), n)).collect();
    out.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    out
}

impl fmt::Display for InstructionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(kernel) = &self.kernel {
            writeln!(f, "Instructions executed for kernel '{kernel}':")?;
        }
        for (mnemonic, count) in &self.instructions {
            writeln!(f, "{count:>16} - {mnemonic}")?;
        }
        for (callee, count) in &self.calls {
            writeln!(f, "{count:>16} - call {callee}")?;
        }
        for traffic in &self.memory {
            writeln!(
                f,
                "{:>16} - {} bytes loaded, {} bytes stored",
                traffic.space, traffic.loaded, traffic.stored
            )?;
        }
        Ok(())
    }
}

/// Counts executed instructions.
#[derive(Debug, Default)]
pub struct InstructionCounter {
    counts: Mutex<Counts>,
}

impl InstructionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self) -> InstructionReport {
        let counts = self.counts.lock();
        let memory = AddressSpace::ALL
            .iter()
            .filter(|space| **space != AddressSpace::Constant)
            .map(|space| MemoryTraffic {
                space: space.name(),
                loaded: counts.loaded[space.index()],
                stored: counts.stored[space.index()],
            })
            .filter(|t| t.loaded > 0 || t.stored > 0)
            .collect();
        InstructionReport {
            kernel: counts.kernel.clone(),
            instructions: sorted(counts.opcodes.iter().map(|(k, n)| (*k, *n))),
            calls: sorted(counts.calls.iter().map(|(k, n)| (k.as_str(), *n))),
            memory,
        }
    }

    fn add_traffic(&self, memory: &Memory, bytes: u64, store: bool) {
        let mut counts = self.counts.lock();
        let slot = memory.space().index();
        if store {
            counts.stored[slot] += bytes;
        } else {
            counts.loaded[slot] += bytes;
        }
    }
}

impl Plugin for InstructionCounter {
    fn name(&self) -> &str {
        "instruction-counter"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::KERNEL | Capabilities::INSTRUCTION | Capabilities::MEMORY
    }

    fn is_thread_safe(&self) -> bool {
        false
    }

    fn kernel_begin(&self, invocation: &KernelInvocation<'_>) {
        *self.counts.lock() = Counts {
            kernel: Some(invocation.kernel_name().to_string()),
            ..Counts::default()
        };
    }

    fn kernel_end(&self, invocation: &KernelInvocation<'_>) {
        let report = self.report();
        tracing::info!(
            kernel = invocation.kernel_name(),
            instructions = report.total(),
            distinct = report.instructions.len(),
            "instruction_counts"
        );
    }

    fn instruction_executed(&self, _item: &WorkItem, instruction: &Instruction, _at: InstructionRef, _: Option<&TypedValue>) {
        let mut counts = self.counts.lock();
        *counts.opcodes.entry(instruction.opcode.mnemonic()).or_default() += 1;
        if let Opcode::Call { callee, .. } = &instruction.opcode {
            match counts.calls.get_mut(callee) {
                Some(n) => *n += 1,
                None => {
                    counts.calls.insert(callee.clone(), 1);
                }
            }
        }
    }

    fn memory_load(&self, _entity: Entity<'_>, memory: &Memory, _address: u64, size: u64) {
        self.add_traffic(memory, size, false);
    }

    fn memory_store(&self, _entity: Entity<'_>, memory: &Memory, _address: u64, data: &[u8]) {
        self.add_traffic(memory, data.len() as u64, true);
    }

    fn memory_atomic_load(&self, _entity: Entity<'_>, memory: &Memory, _op: AtomicOp, _address: u64, size: u64) {
        self.add_traffic(memory, size, false);
    }

    fn memory_atomic_store(&self, _entity: Entity<'_>, memory: &Memory, _op: AtomicOp, _address: u64, size: u64) {
        self.add_traffic(memory, size, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_most_frequent_first() {
        let out = sorted([("add", 2u64), ("load", 5), ("br", 2)]);
        assert_eq!(
            out,
            vec![("load".to_string(), 5), ("add".to_string(), 2), ("br".to_string(), 2)]
        );
    }

    #[test]
    fn test_empty_report() {
        let counter = InstructionCounter::new();
        let report = counter.report();
        assert_eq!(report.total(), 0);
        assert!(report.memory.is_empty());
        assert_eq!(report.to_string(), "");
        assert!(report.to_json().unwrap().contains("\"instructions\": []"));
    }
}
