//! Uninitialized-value tracking
//!
//! Every byte of simulated memory carries a poison byte in a
//! [`ShadowMemory`], and every SSA value a work-item computes carries a
//! [`ShadowValue`]. Buffers start poisoned unless they were created with
//! initial data; stores and host writes define bytes; loads hand the stored
//! poison back to the value they produce; pure opcodes combine operand poison
//! through [`propagate`].
//!
//! Poisoned data is reported, never fatal:
//! - read from or written to global memory
//! - used as a branch condition
//! - used as an index
//! - used as a pointer

use crate::shadow::{propagate, ShadowMemory, ShadowOperands, ShadowValue, DEFINED, POISONED};
use clgrind_core::ir::{AddressSpace, Function, FunctionId, Instruction, InstructionRef, Module, Opcode, Operand, Type, ValueId};
use clgrind_core::{
    Allocation, AtomicOp, Capabilities, Diagnostic, DiagnosticKind, DiagnosticSink, Entity, KernelInvocation,
    MapFlags, Memory, Plugin, TypedValue, WorkGroup, WorkItem,
};
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;

// ================================================================================================
// Per-item shadow state
// ================================================================================================

#[derive(Debug)]
struct ShadowFrame {
    function: FunctionId,
    values: Vec<Option<ShadowValue>>,
    /// Caller value receiving the return value
    result: Option<ValueId>,
}

impl ShadowFrame {
    fn new(function: FunctionId, num_values: usize, result: Option<ValueId>) -> Self {
        Self {
            function,
            values: vec![None; num_values],
            result,
        }
    }

    fn set(&mut self, id: ValueId, shadow: ShadowValue) {
        if let Some(slot) = self.values.get_mut(id.index()) {
            *slot = Some(shadow);
        }
    }
}

#[derive(Debug, Default)]
struct ItemShadow {
    frames: Vec<ShadowFrame>,
    /// Phi results waiting for the first non-phi of the block
    phis: Vec<(ValueId, ShadowValue)>,
    /// Shadows read by the instruction being executed
    loads: SmallVec<[ShadowValue; 2]>,
}

impl ItemShadow {
    fn flush_phis(&mut self) {
        let phis = std::mem::take(&mut self.phis);
        if let Some(frame) = self.frames.last_mut() {
            for (id, shadow) in phis {
                frame.set(id, shadow);
            }
        }
    }

    /// Poison read by the current instruction, shaped `(size, num)`.
    fn loaded(&self, size: usize, num: usize) -> ShadowValue {
        let bytes: Vec<u8> = self.loads.iter().flat_map(|l| l.bytes().iter().copied()).collect();
        if bytes.len() == size * num {
            ShadowValue::from_bytes(size, num, &bytes)
        } else {
            ShadowValue::uniform(size, num, bytes.iter().any(|b| *b != DEFINED))
        }
    }
}

/// State of the group a worker thread is executing.
#[derive(Debug, Default)]
struct WorkerShadow {
    module: Option<Arc<Module>>,
    /// By local index
    items: HashMap<usize, ItemShadow>,
    /// Last element read by a group-level copy
    group_load: Option<ShadowValue>,
}

/// Operand view over one shadow frame.
struct Operands<'a> {
    frame: Option<&'a ShadowFrame>,
    function: Option<&'a Function>,
    /// Present when the item's innermost frame is `frame`
    item: Option<&'a WorkItem>,
}

impl Operands<'_> {
    fn shape(&self, id: ValueId) -> (usize, usize) {
        self.function
            .and_then(|f| f.value_type(id))
            .map_or((0, 0), Type::value_shape)
    }
}

impl ShadowOperands for Operands<'_> {
    fn shadow(&self, operand: &Operand) -> ShadowValue {
        match operand {
            Operand::Value(id) => {
                match self.frame.and_then(|f| f.values.get(id.index())).and_then(Option::as_ref) {
                    Some(shadow) => shadow.clone(),
                    None => {
                        let (size, num) = self.shape(*id);
                        ShadowValue::defined(size, num)
                    }
                }
            }
            Operand::Const(constant) => {
                let (size, num) = constant.ty.value_shape();
                ShadowValue::uniform(size, num, constant.undef)
            }
            Operand::Global { space, .. } => {
                let (size, num) = Type::Pointer(*space).value_shape();
                ShadowValue::defined(size, num)
            }
        }
    }

    fn value(&self, operand: &Operand) -> Option<TypedValue> {
        match operand {
            Operand::Value(id) => self.item?.value(*id).cloned(),
            Operand::Const(constant) => Some(TypedValue::from_constant(constant)),
            Operand::Global { .. } => None,
        }
    }

    fn operand_type(&self, operand: &Operand) -> Option<Type> {
        match operand {
            Operand::Value(id) => self.function?.value_type(*id).cloned(),
            Operand::Const(constant) => Some(constant.ty.clone()),
            Operand::Global { space, .. } => Some(Type::Pointer(*space)),
        }
    }
}

fn is_memcpy(instruction: Option<&Instruction>) -> bool {
    matches!(
        instruction.map(|i| &i.opcode),
        Some(Opcode::Call { callee, .. }) if callee.starts_with("llvm.memcpy") || callee.starts_with("llvm.memmove")
    )
}

// ================================================================================================
// Plugin
// ================================================================================================

/// Reports uses of uninitialized memory and values.
pub struct Uninitialized {
    sink: DiagnosticSink,
    memory: ShadowMemory<u8>,
    workers: RwLock<Vec<Mutex<WorkerShadow>>>,
}

impl Uninitialized {
    pub fn new(sink: DiagnosticSink) -> Self {
        Self {
            sink,
            memory: ShadowMemory::new(),
            workers: RwLock::new(Vec::new()),
        }
    }

    /// Poison state of `len` bytes at `address`, if the buffer is tracked.
    pub fn shadow_of(&self, memory: &Memory, address: u64, len: u64) -> Option<Vec<u8>> {
        self.memory.read(memory, address, len)
    }

    fn with_worker<R>(&self, worker: usize, f: impl FnOnce(&mut WorkerShadow) -> R) -> Option<R> {
        let workers = self.workers.read();
        let mut state = workers.get(worker)?.lock();
        Some(f(&mut state))
    }

    fn report(&self, item: &WorkItem, module: Option<&Module>, at: Option<InstructionRef>, message: String) {
        let mut diagnostic =
            Diagnostic::warning(DiagnosticKind::UninitializedValue, message).with_entity(item.coords());
        if let Some(at) = at {
            let loc = module.and_then(|m| m.instruction(at)).and_then(|i| i.debug_loc.clone());
            diagnostic = diagnostic.at(at, loc);
        }
        self.sink.log(diagnostic);
    }

    /// Read the shadow of a kernel-side load and keep it for the
    /// instruction's result.
    fn item_load(&self, item: &WorkItem, memory: &Memory, address: u64, size: u64) {
        let bytes = self
            .memory
            .read(memory, address, size)
            .unwrap_or_else(|| vec![DEFINED; size as usize]);
        let shadow = ShadowValue::from_bytes(size as usize, 1, &bytes);
        let poisoned = shadow.first_poisoned();

        let module = self
            .with_worker(item.worker(), |worker| {
                if let Some(state) = worker.items.get_mut(&item.local_index()) {
                    state.loads.push(shadow);
                }
                worker.module.clone()
            })
            .flatten();

        let at = item.current_instruction();
        let instruction = module.as_deref().zip(at).and_then(|(m, at)| m.instruction(at));
        if let Some(offset) = poisoned {
            if memory.space() == AddressSpace::Global && !is_memcpy(instruction) {
                self.report(
                    item,
                    module.as_deref(),
                    at,
                    format!(
                        "Uninitialized value read from global memory address {:#x}",
                        address + offset as u64
                    ),
                );
            }
        }
    }

    /// Write `shadow` for a kernel-side store and report poison escaping to
    /// global memory.
    fn item_store(&self, item: &WorkItem, memory: &Memory, address: u64, shadow: ShadowValue, module: Option<&Module>) {
        self.memory.write(memory, address, shadow.bytes());
        let at = item.current_instruction();
        let instruction = module.zip(at).and_then(|(m, at)| m.instruction(at));
        if let Some(offset) = shadow.first_poisoned() {
            if memory.space() == AddressSpace::Global && !is_memcpy(instruction) {
                self.report(
                    item,
                    module,
                    at,
                    format!(
                        "Uninitialized value written to global memory address {:#x}",
                        address + offset as u64
                    ),
                );
            }
        }
    }

    /// Shadow of the bytes the current instruction of `item` stores.
    fn stored_shadow(state: &mut ItemShadow, item: &WorkItem, module: &Module, len: usize) -> ShadowValue {
        state.flush_phis();
        let Some(instruction) = item.current_instruction().and_then(|at| module.instruction(at)) else {
            return ShadowValue::defined(1, len);
        };
        let frame = state.frames.last();
        let operands = Operands {
            frame,
            function: frame.and_then(|f| module.function(f.function)),
            item: Some(item),
        };

        let shadow = match &instruction.opcode {
            Opcode::Store { value, .. } => operands.shadow(value),
            Opcode::Call { args, .. } => {
                // copies pair each store with the load of the same width
                match state.loads.iter().rev().find(|l| l.byte_len() == len) {
                    Some(loaded) => loaded.clone(),
                    None => {
                        let args: Vec<ShadowValue> = args.iter().map(|a| operands.shadow(a)).collect();
                        ShadowValue::combine(1, len, &args)
                    }
                }
            }
            _ => ShadowValue::defined(1, len),
        };
        shadow.reshape(1, len)
    }

    fn check_operand(&self, item: &WorkItem, module: &Module, at: InstructionRef, operands: &Operands<'_>, operand: &Operand, what: &str) {
        if operands.shadow(operand).is_poisoned() {
            self.report(item, Some(module), Some(at), format!("Uninitialized value used as {what}"));
        }
    }

    fn execute(&self, state: &mut ItemShadow, item: &WorkItem, module: &Module, instruction: &Instruction, at: InstructionRef) {
        let opcode = &instruction.opcode;
        if !opcode.is_phi() {
            state.flush_phis();
        }

        let function = state.frames.last().and_then(|f| module.function(f.function));
        let shape = instruction.ty.value_shape();
        let calls_module = matches!(opcode, Opcode::Call { callee, .. } if module.function_by_name(callee).is_some());

        let result = {
            let operands = Operands {
                frame: state.frames.last(),
                function,
                // a module call has already pushed the callee's frame
                item: (!calls_module && !matches!(opcode, Opcode::Ret { .. })).then_some(item),
            };

            match opcode {
                Opcode::Phi { incoming } => {
                    let previous = item.previous_block();
                    let shadow = incoming
                        .iter()
                        .find(|(_, block)| Some(*block) == previous)
                        .map_or_else(|| ShadowValue::defined(shape.0, shape.1), |(op, _)| operands.shadow(op));
                    if let Some(id) = instruction.result {
                        state.phis.push((id, shadow));
                    }
                    None
                }
                Opcode::Load { pointer, .. } => {
                    self.check_operand(item, module, at, &operands, pointer, "a pointer");
                    Some(state.loaded(shape.0, shape.1))
                }
                Opcode::Store { pointer, .. } => {
                    self.check_operand(item, module, at, &operands, pointer, "a pointer");
                    None
                }
                Opcode::CondBr { condition, .. } | Opcode::Switch { condition, .. } => {
                    self.check_operand(item, module, at, &operands, condition, "a branch condition");
                    None
                }
                Opcode::Call { callee, args } => {
                    let args: Vec<ShadowValue> = args.iter().map(|a| operands.shadow(a)).collect();
                    if let Some(target) = module.function_by_name(callee) {
                        let num_values = module.function(target).map_or(0, Function::num_values);
                        let mut frame = ShadowFrame::new(target, num_values, instruction.result);
                        for (index, shadow) in args.into_iter().enumerate() {
                            frame.set(ValueId(index as u32), shadow);
                        }
                        state.frames.push(frame);
                        None
                    } else if state.loads.is_empty() {
                        Some(ShadowValue::combine(shape.0, shape.1, &args))
                    } else {
                        Some(state.loaded(shape.0, shape.1))
                    }
                }
                Opcode::Ret { value } => {
                    let returned = value.as_ref().map(|v| operands.shadow(v));
                    let frame = state.frames.pop();
                    if let (Some(caller), Some(id), Some(shadow)) =
                        (state.frames.last_mut(), frame.and_then(|f| f.result), returned)
                    {
                        caller.set(id, shadow);
                    }
                    None
                }
                _ => {
                    if let Opcode::GetElementPtr { indices, .. } = opcode {
                        for index in indices {
                            self.check_operand(item, module, at, &operands, index, "an index");
                        }
                    }
                    if let Opcode::ExtractElement { index, .. } | Opcode::InsertElement { index, .. } = opcode {
                        self.check_operand(item, module, at, &operands, index, "an index");
                    }
                    propagate(opcode, shape, &operands)
                }
            }
        };

        if let (Some(id), Some(shadow)) = (instruction.result, result) {
            if let Some(frame) = state.frames.last_mut() {
                frame.set(id, shadow);
            }
        }
        state.loads.clear();
    }
}

impl std::fmt::Debug for Uninitialized {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uninitialized").field("memory", &self.memory).finish_non_exhaustive()
    }
}

impl Plugin for Uninitialized {
    fn name(&self) -> &str {
        "uninitialized"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::KERNEL
            | Capabilities::WORK_GROUP
            | Capabilities::WORK_ITEM
            | Capabilities::INSTRUCTION
            | Capabilities::MEMORY
            | Capabilities::HOST_MEMORY
    }

    fn kernel_begin(&self, invocation: &KernelInvocation<'_>) {
        let module = Arc::clone(invocation.kernel().module());
        let mut workers = self.workers.write();
        workers.clear();
        workers.resize_with(invocation.num_workers().max(1), || {
            Mutex::new(WorkerShadow {
                module: Some(Arc::clone(&module)),
                ..WorkerShadow::default()
            })
        });
    }

    fn kernel_end(&self, _invocation: &KernelInvocation<'_>) {
        self.workers.write().clear();
    }

    fn work_group_complete(&self, group: &WorkGroup) {
        self.memory.release_memory(group.local_memory().id());
        self.with_worker(group.worker(), |worker| {
            worker.items.clear();
            worker.group_load = None;
        });
    }

    fn work_item_begin(&self, item: &WorkItem) {
        self.with_worker(item.worker(), |worker| {
            let Some(function) = item.function() else {
                return;
            };
            let num_values = worker
                .module
                .as_ref()
                .and_then(|m| m.function(function))
                .map_or(0, Function::num_values);
            // kernel arguments are set by the host
            let state = ItemShadow {
                frames: vec![ShadowFrame::new(function, num_values, None)],
                ..ItemShadow::default()
            };
            worker.items.insert(item.local_index(), state);
        });
    }

    fn work_item_complete(&self, item: &WorkItem) {
        self.memory.release_memory(item.private_memory().id());
        self.with_worker(item.worker(), |worker| worker.items.remove(&item.local_index()));
    }

    fn instruction_executed(&self, item: &WorkItem, instruction: &Instruction, at: InstructionRef, _: Option<&TypedValue>) {
        self.with_worker(item.worker(), |worker| {
            let Some(module) = worker.module.clone() else {
                return;
            };
            if let Some(state) = worker.items.get_mut(&item.local_index()) {
                self.execute(state, item, &module, instruction, at);
            }
        });
    }

    fn memory_allocated(&self, allocation: &Allocation<'_>) {
        let fill = if allocation.init.is_some() { DEFINED } else { POISONED };
        self.memory.allocate(allocation.memory, allocation.address, allocation.size, fill);
    }

    fn memory_deallocated(&self, memory: &Memory, address: u64, _owner: Option<Entity<'_>>) {
        self.memory.release(memory, address);
    }

    fn memory_load(&self, entity: Entity<'_>, memory: &Memory, address: u64, size: u64) {
        match entity {
            Entity::WorkItem(item) => self.item_load(item, memory, address, size),
            Entity::WorkGroup(group) => {
                let bytes = self
                    .memory
                    .read(memory, address, size)
                    .unwrap_or_else(|| vec![DEFINED; size as usize]);
                let shadow = ShadowValue::from_bytes(size as usize, 1, &bytes);
                if let Some(offset) = shadow.first_poisoned().filter(|_| memory.space() == AddressSpace::Global) {
                    self.sink.log(
                        Diagnostic::warning(
                            DiagnosticKind::UninitializedValue,
                            format!(
                                "Uninitialized value read from global memory address {:#x}",
                                address + offset as u64
                            ),
                        )
                        .with_entity(entity.coords()),
                    );
                }
                self.with_worker(group.worker(), |worker| worker.group_load = Some(shadow));
            }
        }
    }

    fn memory_store(&self, entity: Entity<'_>, memory: &Memory, address: u64, data: &[u8]) {
        match entity {
            Entity::WorkItem(item) => {
                let stored = self
                    .with_worker(item.worker(), |worker| {
                        let module = worker.module.clone()?;
                        let state = worker.items.get_mut(&item.local_index())?;
                        Some((Self::stored_shadow(state, item, &module, data.len()), module))
                    })
                    .flatten();
                match stored {
                    Some((shadow, module)) => self.item_store(item, memory, address, shadow, Some(&module)),
                    None => {
                        self.memory.fill(memory, address, data.len() as u64, DEFINED);
                    }
                }
            }
            Entity::WorkGroup(group) => {
                let loaded = self
                    .with_worker(group.worker(), |worker| worker.group_load.take())
                    .flatten()
                    .filter(|l| l.byte_len() == data.len());
                match loaded {
                    Some(shadow) => self.memory.write(memory, address, shadow.bytes()),
                    None => self.memory.fill(memory, address, data.len() as u64, DEFINED),
                };
            }
        }
    }

    fn memory_atomic_load(&self, entity: Entity<'_>, memory: &Memory, _op: AtomicOp, address: u64, size: u64) {
        if let Entity::WorkItem(item) = entity {
            self.item_load(item, memory, address, size);
        }
    }

    fn memory_atomic_store(&self, entity: Entity<'_>, memory: &Memory, _op: AtomicOp, address: u64, size: u64) {
        let Entity::WorkItem(item) = entity else {
            return;
        };
        let stored = self
            .with_worker(item.worker(), |worker| {
                let module = worker.module.clone()?;
                let state = worker.items.get_mut(&item.local_index())?;
                let len = size as usize;
                let mut shadow = Self::stored_shadow(state, item, &module, len);
                // read-modify-write keeps the poison of the old value
                if let Some(old) = state.loads.iter().rev().find(|l| l.byte_len() == len) {
                    shadow.merge(old);
                }
                Some((shadow, module))
            })
            .flatten();
        if let Some((shadow, module)) = stored {
            self.item_store(item, memory, address, shadow, Some(&module));
        }
    }

    fn memory_map(&self, memory: &Memory, address: u64, size: u64, flags: MapFlags) {
        if flags.contains(MapFlags::WRITE) {
            self.memory.fill(memory, address, size, DEFINED);
        }
    }

    fn host_memory_store(&self, memory: &Memory, address: u64, data: &[u8]) {
        self.memory.fill(memory, address, data.len() as u64, DEFINED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clgrind_core::ir::{AddressSpace, BinaryOp, FunctionBuilder, KernelArgInfo, ModuleBuilder};
    use clgrind_core::{ArgValue, Context, Kernel, LaunchConfig, MemFlags, SimulatorConfig};

    fn setup() -> (Context, Arc<Uninitialized>) {
        let mut context = Context::new(SimulatorConfig::serial());
        let plugin = Arc::new(Uninitialized::new(context.diagnostics().clone()));
        context.add_plugin(plugin.clone());
        (context, plugin)
    }

    /// `out[0] = in[0] + 1`
    fn increment() -> Kernel {
        let global = Type::Pointer(AddressSpace::Global);
        let mut f = FunctionBuilder::new("increment", &[("in", global.clone()), ("out", global)], Type::Void);
        let x = f.load(Type::I32, f.param(0));
        let y = f.binary(BinaryOp::Add, x, f.const_i32(1));
        f.store(y, f.param(1));
        f.ret_void();

        let mut module = ModuleBuilder::new("test");
        let args = vec![
            KernelArgInfo::pointer("in", "int*", AddressSpace::Global),
            KernelArgInfo::pointer("out", "int*", AddressSpace::Global),
        ];
        module.add_kernel(f.finish(), args, false);
        Kernel::new(Arc::new(module.build().unwrap()), "increment").unwrap()
    }

    #[test]
    fn test_poison_flows_through_arithmetic_to_memory() {
        let (context, plugin) = setup();
        let mut kernel = increment();
        let input = context.create_buffer(4, MemFlags::empty()).unwrap();
        let output = context.create_buffer(4, MemFlags::empty()).unwrap();
        kernel.set_arg(0, ArgValue::Buffer(input)).unwrap();
        kernel.set_arg(1, ArgValue::Buffer(output)).unwrap();

        context.run_kernel(&kernel, LaunchConfig::new_1d(1, 1)).unwrap();

        // one read, one write
        assert_eq!(context.diagnostic_count(), 2);
        let shadow = plugin.shadow_of(context.global_memory(), output, 4).unwrap();
        assert!(shadow.iter().all(|b| *b == POISONED));
    }

    #[test]
    fn test_host_write_defines_bytes() {
        let (context, plugin) = setup();
        let mut kernel = increment();
        let input = context.create_buffer(4, MemFlags::empty()).unwrap();
        context.write_buffer(input, &7i32.to_le_bytes()).unwrap();
        let output = context.create_buffer(4, MemFlags::empty()).unwrap();
        kernel.set_arg(0, ArgValue::Buffer(input)).unwrap();
        kernel.set_arg(1, ArgValue::Buffer(output)).unwrap();

        context.run_kernel(&kernel, LaunchConfig::new_1d(1, 1)).unwrap();

        assert_eq!(context.diagnostic_count(), 0);
        assert_eq!(plugin.shadow_of(context.global_memory(), output, 4), Some(vec![DEFINED; 4]));
    }

    #[test]
    fn test_write_mapping_defines_bytes() {
        let (context, plugin) = setup();
        let buffer = context.create_buffer(8, MemFlags::empty()).unwrap();
        let mapping = context.map_buffer(buffer, 4, MapFlags::WRITE).unwrap();
        context.unmap_buffer(mapping).unwrap();
        let shadow = plugin.shadow_of(context.global_memory(), buffer, 8).unwrap();
        assert_eq!(shadow, vec![0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF]);
    }
}
