//! Work-group execution
//!
//! A [`WorkGroup`] owns its work-items and its local memory. Work-items are
//! stepped cooperatively in a fixed order: each runs until it reaches a
//! barrier, a collective wait or its end. When every item is waiting at the
//! same barrier the group releases them together; any other mix is barrier
//! divergence and aborts the group.
//!
//! ```text
//!   ┌──────── sweep ────────┐
//!   │ item0 ─► BARRIER      │      all at BARRIER ─► run async copies
//!   │ item1 ─► BARRIER      │ ───►                   notify barrier
//!   │ item2 ─► BARRIER      │                        items ─► READY
//!   └───────────────────────┘      mixed ─────────► divergence, abort
//! ```

use crate::diagnostic::Diagnostic;
use crate::error::{Result, SimError};
use crate::invocation::KernelInvocation;
use crate::ir::{AddressSpace, GlobalId, InstructionRef};
use crate::kernel::ArgValue;
use crate::launch::Size3;
use crate::memory::{MemFlags, Memory};
use crate::plugin::{Allocation, Entity};
use crate::workitem::{ExecEnv, WorkItem, WorkItemState};
use crate::flags::flag_set;
use clgrind_tracing::perf_span;
use std::collections::BTreeMap;

flag_set! {
    /// Memory fence scope of a barrier.
    pub struct FenceFlags {
        const LOCAL = 1;
        const GLOBAL = 2;
    }
}

/// A collective strided copy issued by every work-item of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncCopy {
    pub dst: u64,
    pub src: u64,
    pub dst_space: AddressSpace,
    pub src_space: AddressSpace,
    pub element_size: u64,
    pub num_elements: u64,
    /// Distance between source elements, in elements
    pub src_stride: u64,
    /// Distance between destination elements, in elements
    pub dst_stride: u64,
    pub event: u64,
    pub instruction: InstructionRef,
}

impl AsyncCopy {
    fn same_transfer(&self, other: &AsyncCopy) -> bool {
        self.dst == other.dst
            && self.src == other.src
            && self.dst_space == other.dst_space
            && self.src_space == other.src_space
            && self.element_size == other.element_size
            && self.num_elements == other.num_elements
            && self.src_stride == other.src_stride
            && self.dst_stride == other.dst_stride
            && self.instruction == other.instruction
    }

    pub fn total_bytes(&self) -> u64 {
        self.element_size * self.num_elements
    }
}

// ================================================================================================
// Group-Local State
// ================================================================================================

/// Local memory of one group with the addresses of its local arguments and
/// program-scope local variables.
pub struct GroupLocal {
    memory: Memory,
    globals: Vec<Option<u64>>,
    args: Vec<Option<u64>>,
}

impl GroupLocal {
    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Address of a program-scope local variable.
    pub fn global_address(&self, id: GlobalId) -> Option<u64> {
        self.globals.get(id.index()).copied().flatten()
    }

    /// Address of the buffer bound to local kernel argument `index`.
    pub fn arg_address(&self, index: usize) -> Option<u64> {
        self.args.get(index).copied().flatten()
    }
}

#[derive(Debug)]
struct Barrier {
    instruction: InstructionRef,
    fence: FenceFlags,
    arrived: usize,
    /// Events released by a `wait_group_events`; empty for plain barriers
    events: Vec<u64>,
}

#[derive(Debug)]
struct PendingCopy {
    copy: AsyncCopy,
    executed: usize,
}

/// Barrier and async-copy bookkeeping shared by the items of one group.
#[derive(Debug)]
pub struct GroupSync {
    barrier: Option<Barrier>,
    copies: BTreeMap<u64, PendingCopy>,
    issued: Vec<u64>,
    next_event: u64,
    divergence: Option<SimError>,
}

impl GroupSync {
    fn new(num_items: usize) -> Self {
        Self {
            barrier: None,
            copies: BTreeMap::new(),
            issued: vec![0; num_items],
            next_event: 0,
            divergence: None,
        }
    }

    /// Record a work-item arriving at a barrier or collective wait.
    pub(crate) fn arrive(&mut self, instruction: InstructionRef, fence: FenceFlags, events: Vec<u64>) {
        match &mut self.barrier {
            None => {
                self.barrier = Some(Barrier {
                    instruction,
                    fence,
                    arrived: 1,
                    events,
                });
            }
            Some(barrier) => {
                if barrier.instruction != instruction {
                    self.divergence.get_or_insert(SimError::BarrierDivergence(format!(
                        "work-items waiting at different barriers ({} and {})",
                        barrier.instruction, instruction
                    )));
                } else if barrier.fence != fence || barrier.events != events {
                    self.divergence.get_or_insert(SimError::BarrierDivergence(format!(
                        "work-items disagree on the arguments of the barrier at {instruction}"
                    )));
                }
                barrier.arrived += 1;
            }
        }
    }

    /// Register work-item `local_index`'s next async copy and return its
    /// event.
    pub(crate) fn register_copy(&mut self, local_index: usize, mut copy: AsyncCopy) -> u64 {
        let Some(issued) = self.issued.get_mut(local_index) else {
            return 0;
        };
        let seq = *issued;
        *issued += 1;

        if let Some(pending) = self.copies.get_mut(&seq) {
            if !pending.copy.same_transfer(&copy) {
                self.divergence.get_or_insert(SimError::AsyncCopyDivergence(format!(
                    "work-items issued different copies at {}",
                    copy.instruction
                )));
            }
            pending.executed += 1;
            return pending.copy.event;
        }

        if copy.event == 0 {
            self.next_event += 1;
            copy.event = self.next_event;
        }
        let event = copy.event;
        self.copies.insert(seq, PendingCopy { copy, executed: 1 });
        event
    }

    /// Whether `event` belongs to a copy that has not completed yet.
    pub(crate) fn is_pending(&self, event: u64) -> bool {
        self.copies.values().any(|p| p.copy.event == event)
    }

    /// Remove the copies signalled by `events`, checking that every item
    /// issued them.
    fn take_copies(&mut self, events: &[u64], num_items: usize) -> Result<Vec<AsyncCopy>> {
        let seqs: Vec<u64> = self
            .copies
            .iter()
            .filter(|(_, p)| events.contains(&p.copy.event))
            .map(|(seq, _)| *seq)
            .collect();

        let mut ready = Vec::with_capacity(seqs.len());
        for seq in seqs {
            if let Some(pending) = self.copies.remove(&seq) {
                if pending.executed != num_items {
                    return Err(SimError::AsyncCopyDivergence(format!(
                        "only {} of {} work-items executed copy at {}",
                        pending.executed, num_items, pending.copy.instruction
                    )));
                }
                ready.push(pending.copy);
            }
        }
        Ok(ready)
    }
}

/// Per-group execution counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupStats {
    pub work_items: usize,
    pub instructions: u64,
}

// ================================================================================================
// Work-Group
// ================================================================================================

pub struct WorkGroup {
    group_id: Size3,
    group_index: usize,
    group_size: Size3,
    worker: usize,
    local: GroupLocal,
    items: Vec<WorkItem>,
    sync: GroupSync,
}

impl WorkGroup {
    /// Create the group at `group_id`: allocate its local memory and build
    /// its work-items.
    pub(crate) fn new(invocation: &KernelInvocation<'_>, group_id: Size3, worker: usize) -> Result<Self> {
        let launch = invocation.launch();
        let group_size = launch.group_size(group_id);
        let group_index = group_id.flatten(launch.num_groups());
        let module = invocation.module();

        let mut group = Self {
            group_id,
            group_index,
            group_size,
            worker,
            local: GroupLocal {
                memory: Memory::new(AddressSpace::Local, invocation.context().config().buffer_bits),
                globals: vec![None; module.globals.len()],
                args: vec![None; invocation.kernel().num_args()],
            },
            items: Vec::with_capacity(group_size.volume()),
            sync: GroupSync::new(group_size.volume()),
        };
        group.allocate_local(invocation)?;

        for local_index in 0..group_size.volume() {
            let local_id = Size3::unflatten(local_index, group_size);
            let item = WorkItem::new(invocation, &group.local, group_id, group_index, local_id, group_size, worker)?;
            group.items.push(item);
        }
        Ok(group)
    }

    fn allocate_local(&mut self, invocation: &KernelInvocation<'_>) -> Result<()> {
        let plugins = invocation.context().plugins();

        for (index, global) in invocation.module().globals.iter().enumerate() {
            if global.space != AddressSpace::Local {
                continue;
            }
            let size = global.ty.size_bytes().max(1);
            let address = self.local.memory.allocate(size, MemFlags::empty())?;
            plugins.memory_allocated(&Allocation {
                memory: &self.local.memory,
                address,
                size,
                flags: MemFlags::empty(),
                init: None,
                owner: Some(Entity::WorkGroup(self)),
            });
            self.local.globals[index] = Some(address);
        }

        let kernel = invocation.kernel();
        for index in 0..kernel.num_args() {
            if let Some(ArgValue::Local(size)) = kernel.arg(index) {
                let address = self.local.memory.allocate(*size, MemFlags::empty())?;
                plugins.memory_allocated(&Allocation {
                    memory: &self.local.memory,
                    address,
                    size: *size,
                    flags: MemFlags::empty(),
                    init: None,
                    owner: Some(Entity::WorkGroup(self)),
                });
                self.local.args[index] = Some(address);
            }
        }
        Ok(())
    }

    pub fn group_id(&self) -> Size3 {
        self.group_id
    }

    /// Linear index of this group in the launch.
    pub fn group_index(&self) -> usize {
        self.group_index
    }

    pub fn group_size(&self) -> Size3 {
        self.group_size
    }

    /// Worker thread executing this group.
    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn local_memory(&self) -> &Memory {
        &self.local.memory
    }

    pub fn work_items(&self) -> &[WorkItem] {
        &self.items
    }

    /// Run every work-item to completion, honouring barriers.
    pub(crate) fn run(&mut self, invocation: &KernelInvocation<'_>) -> GroupStats {
        let _span = perf_span!("work_group", group = self.group_index, items = self.items.len());
        let plugins = invocation.context().plugins();

        plugins.work_group_begin(self);
        for item in &self.items {
            plugins.work_item_begin(item);
        }

        loop {
            self.sweep(invocation);

            if let Some(err) = self.sync.divergence.take() {
                let at = self.sync.barrier.as_ref().map(|b| b.instruction);
                self.abort(invocation, &err, at);
                break;
            }

            let waiting = self.items.iter().filter(|i| i.state() == WorkItemState::Barrier).count();
            if waiting == 0 {
                break;
            }

            let Some(barrier) = self.sync.barrier.take() else {
                self.abort(invocation, &SimError::malformed("work-items blocked without a barrier"), None);
                break;
            };
            if waiting != self.items.len() || barrier.arrived != waiting {
                let err = SimError::BarrierDivergence(format!(
                    "only {} of {} work-items reached the barrier at {}",
                    waiting,
                    self.items.len(),
                    barrier.instruction
                ));
                self.abort(invocation, &err, Some(barrier.instruction));
                break;
            }

            if let Err(err) = self.release(invocation, &barrier) {
                self.abort(invocation, &err, Some(barrier.instruction));
                break;
            }
        }

        plugins.work_group_complete(self);
        self.release_local(invocation);

        GroupStats {
            work_items: self.items.len(),
            instructions: self.items.iter().map(WorkItem::instruction_count).sum(),
        }
    }

    /// Step every ready item until it blocks or finishes.
    fn sweep(&mut self, invocation: &KernelInvocation<'_>) {
        let context = invocation.context();
        let env = ExecEnv {
            invocation,
            local: &self.local,
        };

        for item in self.items.iter_mut() {
            while item.state() == WorkItemState::Ready {
                match item.step(&env, &mut self.sync) {
                    Ok(WorkItemState::Finished) => context.plugins().work_item_complete(item),
                    Ok(_) => {}
                    Err(err) => {
                        let (at, loc) = item.error_location(invocation.module());
                        let mut diagnostic = Diagnostic::from_error(&err).with_entity(item.coords());
                        if let Some(at) = at {
                            diagnostic = diagnostic.at(at, loc);
                        }
                        context.log(diagnostic);
                        item.terminate();
                        context.plugins().work_item_complete(item);
                    }
                }
            }
        }
    }

    /// Complete the copies released by `barrier`, then let everyone go.
    fn release(&mut self, invocation: &KernelInvocation<'_>, barrier: &Barrier) -> Result<()> {
        let plugins = invocation.context().plugins();

        if !barrier.events.is_empty() {
            let copies = self.sync.take_copies(&barrier.events, self.items.len())?;
            for copy in &copies {
                plugins.work_group_async_copy(self, copy);
                self.perform_copy(invocation, copy)?;
            }
        }

        plugins.work_group_barrier(self, barrier.fence);
        for item in self.items.iter_mut() {
            item.resume(&barrier.events);
        }
        Ok(())
    }

    fn memory_for<'m>(&'m self, invocation: &'m KernelInvocation<'_>, space: AddressSpace) -> Result<&'m Memory> {
        match space {
            AddressSpace::Local => Ok(&self.local.memory),
            AddressSpace::Global | AddressSpace::Constant => Ok(invocation.context().global_memory()),
            AddressSpace::Private => Err(SimError::malformed("async copy through private memory")),
        }
    }

    fn perform_copy(&self, invocation: &KernelInvocation<'_>, copy: &AsyncCopy) -> Result<()> {
        let plugins = invocation.context().plugins();
        let src_memory = self.memory_for(invocation, copy.src_space)?;
        let dst_memory = self.memory_for(invocation, copy.dst_space)?;
        let size = copy.element_size;

        for i in 0..copy.num_elements {
            let src = copy.src.wrapping_add(i * copy.src_stride * size);
            let dst = copy.dst.wrapping_add(i * copy.dst_stride * size);
            let data = src_memory.load(src, size)?;
            plugins.memory_load(Entity::WorkGroup(self), src_memory, src, size);
            dst_memory.store(dst, &data)?;
            plugins.memory_store(Entity::WorkGroup(self), dst_memory, dst, &data);
        }
        Ok(())
    }

    /// Report `err` against the group and finish every remaining item.
    fn abort(&mut self, invocation: &KernelInvocation<'_>, err: &SimError, at: Option<InstructionRef>) {
        let context = invocation.context();
        let mut diagnostic = Diagnostic::from_error(err).with_entity(crate::diagnostic::EntityCoords::WorkGroup {
            group: self.group_id,
        });
        if let Some(at) = at {
            let loc = invocation.module().instruction(at).and_then(|i| i.debug_loc.clone());
            diagnostic = diagnostic.at(at, loc);
        }
        context.log(diagnostic);
        tracing::debug!(group = %self.group_id, error = %err, "work_group_aborted");

        for item in self.items.iter_mut() {
            if item.state() != WorkItemState::Finished {
                item.terminate();
                context.plugins().work_item_complete(item);
            }
        }
    }

    fn release_local(&mut self, invocation: &KernelInvocation<'_>) {
        let plugins = invocation.context().plugins();
        let addresses: Vec<u64> = self
            .local
            .globals
            .iter()
            .chain(self.local.args.iter())
            .filter_map(|a| *a)
            .collect();
        for address in addresses {
            if self.local.memory.deallocate(address).is_ok() {
                plugins.memory_deallocated(&self.local.memory, address, Some(Entity::WorkGroup(self)));
            }
        }
        self.local.globals.iter_mut().for_each(|a| *a = None);
        self.local.args.iter_mut().for_each(|a| *a = None);
    }
}

impl std::fmt::Debug for WorkGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkGroup")
            .field("group_id", &self.group_id)
            .field("group_size", &self.group_size)
            .field("worker", &self.worker)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BlockId, FunctionId};

    fn at(index: u32) -> InstructionRef {
        InstructionRef::new(FunctionId(0), BlockId(0), index)
    }

    fn copy(dst: u64) -> AsyncCopy {
        AsyncCopy {
            dst,
            src: 0x10,
            dst_space: AddressSpace::Local,
            src_space: AddressSpace::Global,
            element_size: 4,
            num_elements: 8,
            src_stride: 1,
            dst_stride: 1,
            event: 0,
            instruction: at(3),
        }
    }

    #[test]
    fn test_barrier_mismatch_is_divergence() {
        let mut sync = GroupSync::new(2);
        sync.arrive(at(1), FenceFlags::LOCAL, Vec::new());
        sync.arrive(at(1), FenceFlags::LOCAL, Vec::new());
        assert!(sync.divergence.is_none());
        assert_eq!(sync.barrier.as_ref().map(|b| b.arrived), Some(2));

        let mut sync = GroupSync::new(2);
        sync.arrive(at(1), FenceFlags::LOCAL, Vec::new());
        sync.arrive(at(2), FenceFlags::LOCAL, Vec::new());
        assert!(matches!(sync.divergence, Some(SimError::BarrierDivergence(_))));
    }

    #[test]
    fn test_copies_share_an_event() {
        let mut sync = GroupSync::new(2);
        let first = sync.register_copy(0, copy(0x100));
        let second = sync.register_copy(1, copy(0x100));
        assert_eq!(first, second);
        assert!(sync.is_pending(first));
        assert!(sync.divergence.is_none());

        let ready = sync.take_copies(&[first], 2).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(!sync.is_pending(first));
    }

    #[test]
    fn test_partial_copy_is_divergence() {
        let mut sync = GroupSync::new(3);
        let event = sync.register_copy(0, copy(0x100));
        sync.register_copy(1, copy(0x100));
        let err = sync.take_copies(&[event], 3).unwrap_err();
        assert!(err.to_string().contains("only 2 of 3 work-items executed copy"));
    }

    #[test]
    fn test_mismatched_copy_is_divergence() {
        let mut sync = GroupSync::new(2);
        sync.register_copy(0, copy(0x100));
        sync.register_copy(1, copy(0x200));
        assert!(matches!(sync.divergence, Some(SimError::AsyncCopyDivergence(_))));
    }
}
