//! Instrumentation bus
//!
//! Analyses implement [`Plugin`] and register with a [`crate::Context`]. Every
//! simulation event is broadcast synchronously, in registration order, on the
//! thread that produced it.
//!
//! Plugins declare which event families they consume through
//! [`Plugin::capabilities`]; the [`PluginRegistry`] only calls the hooks of
//! plugins that declared the matching capability, so a plugin interested in
//! memory traffic pays nothing for instruction events.
//!
//! ```text
//!  WorkItem / WorkGroup / KernelInvocation / Context (host API)
//!                         │ event
//!                         ▼
//!  ┌──────────────────────────────────────────────────────┐
//!  │ PluginRegistry: per-capability lists, in order       │
//!  └───────┬──────────────────┬──────────────────┬────────┘
//!          ▼                  ▼                  ▼
//!     RaceDetector     Uninitialized         Logger ...
//! ```

use crate::diagnostic::{Diagnostic, EntityCoords};
use crate::invocation::KernelInvocation;
use crate::ir::{Instruction, InstructionRef};
use crate::memory::{AtomicOp, MapFlags, MemFlags, Memory};
use crate::value::TypedValue;
use crate::workgroup::{AsyncCopy, FenceFlags, WorkGroup};
use crate::workitem::WorkItem;
use crate::flags::flag_set;
use std::sync::Arc;

flag_set! {
    /// Event families a plugin consumes.
    pub struct Capabilities {
        /// `kernel_begin`, `kernel_end`
        const KERNEL = 1 << 0;
        /// `work_group_begin`, `work_group_complete`, `work_group_barrier`
        const WORK_GROUP = 1 << 1;
        /// `work_item_begin`, `work_item_complete`, `work_item_barrier`
        const WORK_ITEM = 1 << 2;
        /// `instruction_executed`
        const INSTRUCTION = 1 << 3;
        /// Allocation and kernel-side memory access hooks
        const MEMORY = 1 << 4;
        /// Host reads, writes, maps and unmaps
        const HOST_MEMORY = 1 << 5;
        /// `work_group_async_copy`
        const ASYNC_COPY = 1 << 6;
        /// `log`
        const LOG = 1 << 7;
    }
}

const NUM_CAPABILITIES: usize = 8;

/// The simulation entity that performed an action.
#[derive(Clone, Copy)]
pub enum Entity<'a> {
    WorkItem(&'a WorkItem),
    WorkGroup(&'a WorkGroup),
}

impl Entity<'_> {
    pub fn coords(&self) -> EntityCoords {
        match self {
            Entity::WorkItem(item) => item.coords(),
            Entity::WorkGroup(group) => EntityCoords::WorkGroup {
                group: group.group_id(),
            },
        }
    }

    /// Index of the worker thread running the entity.
    pub fn worker(&self) -> usize {
        match self {
            Entity::WorkItem(item) => item.worker(),
            Entity::WorkGroup(group) => group.worker(),
        }
    }

    /// Linear index of the work-group the entity belongs to.
    pub fn group_index(&self) -> usize {
        match self {
            Entity::WorkItem(item) => item.group_index(),
            Entity::WorkGroup(group) => group.group_index(),
        }
    }

    pub fn as_work_item(&self) -> Option<&WorkItem> {
        match self {
            Entity::WorkItem(item) => Some(item),
            Entity::WorkGroup(_) => None,
        }
    }
}

impl std::fmt::Debug for Entity<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.coords())
    }
}

/// A new buffer in some memory.
#[derive(Debug, Clone, Copy)]
pub struct Allocation<'a> {
    pub memory: &'a Memory,
    pub address: u64,
    pub size: u64,
    pub flags: MemFlags,
    /// Bytes the buffer was initialized with, if any
    pub init: Option<&'a [u8]>,
    /// Work-item or work-group owning the allocation; `None` for host and
    /// program-scope allocations
    pub owner: Option<Entity<'a>>,
}

/// Observer of simulation events.
///
/// Every hook has an empty default; implement the ones matching the declared
/// [`Capabilities`].
#[allow(unused_variables)]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Plugins that mutate shared state without synchronization return
    /// false, which restricts kernel execution to a single worker thread.
    fn is_thread_safe(&self) -> bool {
        true
    }

    // ============================================================================================
    // Lifecycle
    // ============================================================================================

    fn kernel_begin(&self, invocation: &KernelInvocation<'_>) {}

    fn kernel_end(&self, invocation: &KernelInvocation<'_>) {}

    fn work_group_begin(&self, group: &WorkGroup) {}

    fn work_group_complete(&self, group: &WorkGroup) {}

    fn work_group_barrier(&self, group: &WorkGroup, flags: FenceFlags) {}

    fn work_item_begin(&self, item: &WorkItem) {}

    fn work_item_complete(&self, item: &WorkItem) {}

    fn work_item_barrier(&self, item: &WorkItem, flags: FenceFlags) {}

    // ============================================================================================
    // Execution
    // ============================================================================================

    /// Called after `instruction` (at `at`) has executed. `result` is the
    /// value it defined, or the returned value for `ret`.
    fn instruction_executed(
        &self,
        item: &WorkItem,
        instruction: &Instruction,
        at: InstructionRef,
        result: Option<&TypedValue>,
    ) {
    }

    // ============================================================================================
    // Memory
    // ============================================================================================

    fn memory_allocated(&self, allocation: &Allocation<'_>) {}

    fn memory_deallocated(&self, memory: &Memory, address: u64, owner: Option<Entity<'_>>) {}

    fn memory_load(&self, entity: Entity<'_>, memory: &Memory, address: u64, size: u64) {}

    fn memory_store(&self, entity: Entity<'_>, memory: &Memory, address: u64, data: &[u8]) {}

    fn memory_atomic_load(&self, entity: Entity<'_>, memory: &Memory, op: AtomicOp, address: u64, size: u64) {}

    fn memory_atomic_store(&self, entity: Entity<'_>, memory: &Memory, op: AtomicOp, address: u64, size: u64) {}

    fn memory_map(&self, memory: &Memory, address: u64, size: u64, flags: MapFlags) {}

    fn memory_unmap(&self, memory: &Memory, address: u64, size: u64, flags: MapFlags) {}

    fn host_memory_load(&self, memory: &Memory, address: u64, size: u64) {}

    fn host_memory_store(&self, memory: &Memory, address: u64, data: &[u8]) {}

    fn work_group_async_copy(&self, group: &WorkGroup, copy: &AsyncCopy) {}

    // ============================================================================================
    // Diagnostics
    // ============================================================================================

    /// A deduplicated diagnostic surfaced by the context.
    fn log(&self, diagnostic: &Diagnostic) {}
}

// ================================================================================================
// Registry
// ================================================================================================

/// Ordered plugin list with per-capability dispatch tables.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
    by_capability: [Vec<Arc<dyn Plugin>>; NUM_CAPABILITIES],
}

fn slot(capability: Capabilities) -> usize {
    capability.bits().trailing_zeros() as usize
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        let capabilities = plugin.capabilities();
        for capability in capabilities.iter() {
            self.by_capability[slot(capability)].push(Arc::clone(&plugin));
        }
        tracing::debug!(plugin = plugin.name(), capabilities = ?capabilities, "plugin_registered");
        self.plugins.push(plugin);
    }

    /// Remove every registration of `plugin`.
    pub fn unregister(&mut self, plugin: &Arc<dyn Plugin>) {
        self.plugins.retain(|p| !Arc::ptr_eq(p, plugin));
        for list in &mut self.by_capability {
            list.retain(|p| !Arc::ptr_eq(p, plugin));
        }
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    /// Whether any plugin consumes `capability`.
    #[inline]
    pub fn wants(&self, capability: Capabilities) -> bool {
        !self.by_capability[slot(capability)].is_empty()
    }

    pub fn all_thread_safe(&self) -> bool {
        self.plugins.iter().all(|p| p.is_thread_safe())
    }

    #[inline]
    fn each(&self, capability: Capabilities, f: impl Fn(&dyn Plugin)) {
        for plugin in &self.by_capability[slot(capability)] {
            f(plugin.as_ref());
        }
    }

    pub fn kernel_begin(&self, invocation: &KernelInvocation<'_>) {
        self.each(Capabilities::KERNEL, |p| p.kernel_begin(invocation));
    }

    pub fn kernel_end(&self, invocation: &KernelInvocation<'_>) {
        self.each(Capabilities::KERNEL, |p| p.kernel_end(invocation));
    }

    pub fn work_group_begin(&self, group: &WorkGroup) {
        self.each(Capabilities::WORK_GROUP, |p| p.work_group_begin(group));
    }

    pub fn work_group_complete(&self, group: &WorkGroup) {
        self.each(Capabilities::WORK_GROUP, |p| p.work_group_complete(group));
    }

    pub fn work_group_barrier(&self, group: &WorkGroup, flags: FenceFlags) {
        self.each(Capabilities::WORK_GROUP, |p| p.work_group_barrier(group, flags));
    }

    pub fn work_item_begin(&self, item: &WorkItem) {
        self.each(Capabilities::WORK_ITEM, |p| p.work_item_begin(item));
    }

    pub fn work_item_complete(&self, item: &WorkItem) {
        self.each(Capabilities::WORK_ITEM, |p| p.work_item_complete(item));
    }

    pub fn work_item_barrier(&self, item: &WorkItem, flags: FenceFlags) {
        self.each(Capabilities::WORK_ITEM, |p| p.work_item_barrier(item, flags));
    }

    pub fn instruction_executed(
        &self,
        item: &WorkItem,
        instruction: &Instruction,
        at: InstructionRef,
        result: Option<&TypedValue>,
    ) {
        self.each(Capabilities::INSTRUCTION, |p| {
            p.instruction_executed(item, instruction, at, result)
        });
    }

    pub fn memory_allocated(&self, allocation: &Allocation<'_>) {
        self.each(Capabilities::MEMORY, |p| p.memory_allocated(allocation));
    }

    pub fn memory_deallocated(&self, memory: &Memory, address: u64, owner: Option<Entity<'_>>) {
        self.each(Capabilities::MEMORY, |p| p.memory_deallocated(memory, address, owner));
    }

    pub fn memory_load(&self, entity: Entity<'_>, memory: &Memory, address: u64, size: u64) {
        self.each(Capabilities::MEMORY, |p| p.memory_load(entity, memory, address, size));
    }

    pub fn memory_store(&self, entity: Entity<'_>, memory: &Memory, address: u64, data: &[u8]) {
        self.each(Capabilities::MEMORY, |p| p.memory_store(entity, memory, address, data));
    }

    pub fn memory_atomic_load(&self, entity: Entity<'_>, memory: &Memory, op: AtomicOp, address: u64, size: u64) {
        self.each(Capabilities::MEMORY, |p| {
            p.memory_atomic_load(entity, memory, op, address, size)
        });
    }

    pub fn memory_atomic_store(&self, entity: Entity<'_>, memory: &Memory, op: AtomicOp, address: u64, size: u64) {
        self.each(Capabilities::MEMORY, |p| {
            p.memory_atomic_store(entity, memory, op, address, size)
        });
    }

    pub fn memory_map(&self, memory: &Memory, address: u64, size: u64, flags: MapFlags) {
        self.each(Capabilities::HOST_MEMORY, |p| p.memory_map(memory, address, size, flags));
    }

    pub fn memory_unmap(&self, memory: &Memory, address: u64, size: u64, flags: MapFlags) {
        self.each(Capabilities::HOST_MEMORY, |p| p.memory_unmap(memory, address, size, flags));
    }

    pub fn host_memory_load(&self, memory: &Memory, address: u64, size: u64) {
        self.each(Capabilities::HOST_MEMORY, |p| p.host_memory_load(memory, address, size));
    }

    pub fn host_memory_store(&self, memory: &Memory, address: u64, data: &[u8]) {
        self.each(Capabilities::HOST_MEMORY, |p| p.host_memory_store(memory, address, data));
    }

    pub fn work_group_async_copy(&self, group: &WorkGroup, copy: &AsyncCopy) {
        self.each(Capabilities::ASYNC_COPY, |p| p.work_group_async_copy(group, copy));
    }

    pub fn log(&self, diagnostic: &Diagnostic) {
        self.each(Capabilities::LOG, |p| p.log(diagnostic));
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.plugins.iter().map(|p| p.name())).finish()
    }
}
