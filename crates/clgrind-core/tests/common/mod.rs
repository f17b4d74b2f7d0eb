//! Shared fixtures for execution tests.

#![allow(dead_code)]

use clgrind_core::ir::{AddressSpace, Function, KernelArgInfo, ModuleBuilder};
use clgrind_core::{Capabilities, Context, Diagnostic, DiagnosticKind, Kernel, Plugin, SimulatorConfig};
use parking_lot::Mutex;
use std::sync::Arc;

/// Plugin that keeps every surfaced diagnostic.
#[derive(Default)]
pub struct Collected {
    pub diagnostics: Mutex<Vec<Diagnostic>>,
}

impl Collected {
    pub fn kinds(&self) -> Vec<DiagnosticKind> {
        self.diagnostics.lock().iter().map(|d| d.kind).collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.diagnostics.lock().iter().map(|d| d.message.clone()).collect()
    }
}

impl Plugin for Collected {
    fn name(&self) -> &str {
        "collected"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::LOG
    }

    fn log(&self, diagnostic: &Diagnostic) {
        self.diagnostics.lock().push(diagnostic.clone());
    }
}

/// Serial context with a diagnostic collector attached.
pub fn context() -> (Context, Arc<Collected>) {
    let collected = Arc::new(Collected::default());
    let mut context = Context::new(SimulatorConfig::serial());
    context.add_plugin(collected.clone());
    (context, collected)
}

pub fn global_ptr(name: &str) -> KernelArgInfo {
    KernelArgInfo::pointer(name, "int*", AddressSpace::Global)
}

pub fn local_ptr(name: &str) -> KernelArgInfo {
    KernelArgInfo::pointer(name, "int*", AddressSpace::Local)
}

/// Wrap a single kernel function in a module.
pub fn kernel(function: Function, args: Vec<KernelArgInfo>, uniform: bool) -> Kernel {
    let name = function.name.clone();
    let mut module = ModuleBuilder::new("test");
    module.add_kernel(function, args, uniform);
    Kernel::new(Arc::new(module.build().unwrap()), &name).unwrap()
}

pub fn read_u32s(context: &Context, address: u64, count: usize) -> Vec<u32> {
    context
        .read_buffer(address, count as u64 * 4)
        .unwrap()
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn u32_bytes(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}
