//! Shared fixtures for analysis tests.

#![allow(dead_code)]

use clgrind_core::ir::{AddressSpace, Function, FunctionBuilder, KernelArgInfo, ModuleBuilder, Operand, Type};
use clgrind_core::{Context, Kernel, SimulatorConfig};
use clgrind_plugins::{DiagnosticCollector, InstalledPlugins, PluginConfig};
use std::sync::Arc;

pub const GLOBAL: Type = Type::Pointer(AddressSpace::Global);
pub const LOCAL: Type = Type::Pointer(AddressSpace::Local);

/// Serial context with the analyses of `config` and a collector attached.
pub fn context(config: PluginConfig) -> (Context, InstalledPlugins, Arc<DiagnosticCollector>) {
    let mut context = Context::new(SimulatorConfig::serial());
    let config = PluginConfig {
        log_diagnostics: false,
        ..config
    };
    let (installed, collector) = config.install_with_collector(&mut context);
    (context, installed, collector)
}

pub fn races() -> PluginConfig {
    PluginConfig {
        data_races: true,
        ..PluginConfig::default()
    }
}

pub fn uninitialized() -> PluginConfig {
    PluginConfig {
        uninitialized: true,
        ..PluginConfig::default()
    }
}

pub fn global_ptr(name: &str) -> KernelArgInfo {
    KernelArgInfo::pointer(name, "int*", AddressSpace::Global)
}

pub fn local_ptr(name: &str) -> KernelArgInfo {
    KernelArgInfo::pointer(name, "int*", AddressSpace::Local)
}

pub fn kernel(function: Function, args: Vec<KernelArgInfo>) -> Kernel {
    let name = function.name.clone();
    let mut module = ModuleBuilder::new("test");
    module.add_kernel(function, args, false);
    Kernel::new(Arc::new(module.build().unwrap()), &name).unwrap()
}

pub fn local_id(f: &mut FunctionBuilder) -> Operand {
    f.call("get_local_id", Type::I64, vec![f.const_i32(0)])
}

pub fn global_id(f: &mut FunctionBuilder) -> Operand {
    f.call("get_global_id", Type::I64, vec![f.const_i32(0)])
}

pub fn u32_bytes(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}
