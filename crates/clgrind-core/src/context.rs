//! Simulation context: global memory, the plugin bus, host buffer API and
//! the diagnostic sink.

use crate::config::SimulatorConfig;
use crate::diagnostic::{Diagnostic, DiagnosticSink};
use crate::error::{Result, SimError};
use crate::invocation::{InvocationSummary, KernelInvocation};
use crate::ir::AddressSpace;
use crate::kernel::Kernel;
use crate::launch::LaunchConfig;
use crate::memory::{MapFlags, MemFlags, Memory};
use crate::plugin::{Allocation, Plugin, PluginRegistry};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Host-side view of a mapped buffer region.
///
/// Reads see the buffer contents at map time; for write mappings the bytes
/// are written back by [`Context::unmap_buffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub address: u64,
    pub flags: MapFlags,
    pub data: Vec<u8>,
}

/// Owns everything shared by the kernel invocations of one simulated device.
pub struct Context {
    config: SimulatorConfig,
    global_memory: Memory,
    plugins: PluginRegistry,
    diagnostics: DiagnosticSink,
    pub(crate) invocation_active: AtomicBool,
}

impl Context {
    pub fn new(config: SimulatorConfig) -> Self {
        let global_memory = Memory::new(AddressSpace::Global, config.buffer_bits);
        let diagnostics = DiagnosticSink::new(config.max_errors);
        Self {
            config,
            global_memory,
            plugins: PluginRegistry::new(),
            diagnostics,
            invocation_active: AtomicBool::new(false),
        }
    }

    /// Context configured from `CLGRIND_*` environment variables.
    pub fn from_env() -> Self {
        Self::new(SimulatorConfig::from_env())
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Memory backing the global and constant address spaces.
    pub fn global_memory(&self) -> &Memory {
        &self.global_memory
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    /// Handle analyses clone to report diagnostics from inside hooks.
    pub fn diagnostics(&self) -> &DiagnosticSink {
        &self.diagnostics
    }

    /// Register an observer; it receives events for the context's lifetime.
    pub fn add_plugin(&mut self, plugin: Arc<dyn Plugin>) {
        self.diagnostics.attach(&plugin);
        self.plugins.register(plugin);
    }

    pub fn remove_plugin(&mut self, plugin: &Arc<dyn Plugin>) {
        self.diagnostics.detach(plugin);
        self.plugins.unregister(plugin);
    }

    // ============================================================================================
    // Host Buffer API
    // ============================================================================================

    /// Allocate an uninitialized global buffer.
    pub fn create_buffer(&self, size: u64, flags: MemFlags) -> Result<u64> {
        let address = self.global_memory.allocate(size, flags)?;
        self.plugins.memory_allocated(&Allocation {
            memory: &self.global_memory,
            address,
            size,
            flags,
            init: None,
            owner: None,
        });
        Ok(address)
    }

    /// Allocate a global buffer initialized with `data`.
    pub fn create_buffer_with_data(&self, data: &[u8], flags: MemFlags) -> Result<u64> {
        let size = data.len() as u64;
        let address = self.global_memory.allocate(size, flags)?;
        self.global_memory.host_write(address, data)?;
        self.plugins.memory_allocated(&Allocation {
            memory: &self.global_memory,
            address,
            size,
            flags,
            init: Some(data),
            owner: None,
        });
        Ok(address)
    }

    pub fn release_buffer(&self, address: u64) -> Result<()> {
        self.global_memory.deallocate(address)?;
        self.plugins.memory_deallocated(&self.global_memory, address, None);
        Ok(())
    }

    pub fn write_buffer(&self, address: u64, data: &[u8]) -> Result<()> {
        self.global_memory.host_write(address, data)?;
        self.plugins.host_memory_store(&self.global_memory, address, data);
        Ok(())
    }

    pub fn read_buffer(&self, address: u64, size: u64) -> Result<Vec<u8>> {
        let data = self.global_memory.host_read(address, size)?;
        self.plugins.host_memory_load(&self.global_memory, address, size);
        Ok(data)
    }

    /// Map `size` bytes at `address` into host memory.
    pub fn map_buffer(&self, address: u64, size: u64, flags: MapFlags) -> Result<Mapping> {
        let data = self.global_memory.host_read(address, size)?;
        self.plugins.memory_map(&self.global_memory, address, size, flags);
        if flags.contains(MapFlags::READ) {
            self.plugins.host_memory_load(&self.global_memory, address, size);
        }
        Ok(Mapping { address, flags, data })
    }

    /// Release a mapping, writing its bytes back if it was mapped for writing.
    pub fn unmap_buffer(&self, mapping: Mapping) -> Result<()> {
        let size = mapping.data.len() as u64;
        if mapping.flags.contains(MapFlags::WRITE) {
            self.global_memory.host_write(mapping.address, &mapping.data)?;
            self.plugins.host_memory_store(&self.global_memory, mapping.address, &mapping.data);
        }
        self.plugins.memory_unmap(&self.global_memory, mapping.address, size, mapping.flags);
        Ok(())
    }

    // ============================================================================================
    // Kernel Execution
    // ============================================================================================

    /// Run `kernel` over `launch`. Only one invocation may be active at a time.
    pub fn run_kernel(&self, kernel: &Kernel, launch: LaunchConfig) -> Result<InvocationSummary> {
        KernelInvocation::run(self, kernel, launch)
    }

    pub(crate) fn set_active_kernel(&self, name: Option<&str>) {
        self.diagnostics.set_active_kernel(name);
    }

    // ============================================================================================
    // Diagnostics
    // ============================================================================================

    /// Surface a diagnostic: deduplicate it, apply the error cap, and hand it
    /// to logging plugins.
    pub fn log(&self, diagnostic: Diagnostic) {
        self.diagnostics.log(diagnostic);
    }

    /// Report a fatal simulation error as an error diagnostic.
    pub fn report_error(&self, err: &SimError) {
        self.log(Diagnostic::from_error(err));
    }

    /// Distinct diagnostics surfaced to plugins.
    pub fn diagnostic_count(&self) -> usize {
        self.diagnostics.surfaced()
    }

    /// Distinct diagnostics withheld by the error cap.
    pub fn suppressed_count(&self) -> usize {
        self.diagnostics.suppressed()
    }

    /// Distinct error-severity diagnostics, surfaced or not.
    pub fn error_count(&self) -> usize {
        self.diagnostics.errors()
    }

    pub fn error_seen(&self) -> bool {
        self.diagnostics.error_seen()
    }

    /// Forget previously seen diagnostics and counters.
    pub fn reset_diagnostics(&self) {
        self.diagnostics.reset();
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("global_memory", &self.global_memory)
            .field("plugins", &self.plugins)
            .finish()
    }
}
