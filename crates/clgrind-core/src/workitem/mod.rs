//! Work-item interpreter
//!
//! A [`WorkItem`] executes one instruction per [`WorkItem::step`]. Values live
//! in a per-frame store indexed by [`ValueId`]; calls to module functions push
//! a new frame, calls to anything else go through the builtin table.
//!
//! Phi nodes at the head of a block are evaluated against the predecessor
//! block and committed together before the first non-phi instruction, so a
//! phi never observes another phi of the same block.

mod builtins;
mod ops;

#[cfg(test)]
mod ops_test;

use crate::diagnostic::{Diagnostic, DiagnosticKind, EntityCoords};
use crate::error::{Result, SimError};
use crate::invocation::KernelInvocation;
use crate::ir::{
    AddressSpace, BlockId, DebugLoc, Function, FunctionId, Instruction, InstructionRef, Module, Opcode, Operand, Type,
    ValueId,
};
use crate::kernel::ArgValue;
use crate::launch::Size3;
use crate::memory::{AtomicOp, MemFlags, Memory};
use crate::plugin::{Allocation, Entity};
use crate::value::TypedValue;
use crate::workgroup::{FenceFlags, GroupLocal, GroupSync};


/// Deepest call chain a work-item may build.
pub const MAX_CALL_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkItemState {
    Ready,
    /// Waiting at a barrier or a collective wait
    Barrier,
    Finished,
}

/// What the surrounding group provides to a stepping work-item.
pub struct ExecEnv<'a> {
    pub invocation: &'a KernelInvocation<'a>,
    pub local: &'a GroupLocal,
}

/// Effect of one executed instruction on the work-item's control state.
#[derive(Debug)]
pub(crate) enum Control {
    /// Fall through, optionally defining the instruction's result
    Value(Option<TypedValue>),
    /// Phi result, committed when the phi group ends
    Phi(TypedValue),
    Jump(BlockId),
    Call { function: FunctionId, args: Vec<TypedValue> },
    Return(Option<TypedValue>),
    Barrier(FenceFlags),
}

#[derive(Debug)]
struct Frame {
    function: FunctionId,
    block: BlockId,
    index: u32,
    previous_block: Option<BlockId>,
    values: Vec<Option<TypedValue>>,
    /// Call instruction in the caller that created this frame
    call_site: Option<InstructionRef>,
    /// Caller value receiving the return value
    result: Option<ValueId>,
    /// Private buffers released when the frame returns
    allocations: Vec<u64>,
}

impl Frame {
    fn new(function: FunctionId, num_values: usize, call_site: Option<InstructionRef>, result: Option<ValueId>) -> Self {
        Self {
            function,
            block: BlockId(0),
            index: 0,
            previous_block: None,
            values: vec![None; num_values],
            call_site,
            result,
            allocations: Vec::new(),
        }
    }

    fn set(&mut self, id: ValueId, value: TypedValue) -> Result<()> {
        let slot = self
            .values
            .get_mut(id.index())
            .ok_or_else(|| SimError::malformed(format!("value {id} outside the function's value store")))?;
        *slot = Some(value);
        Ok(())
    }

    fn cursor(&self) -> InstructionRef {
        InstructionRef::new(self.function, self.block, self.index)
    }
}

pub struct WorkItem {
    global_id: Size3,
    local_id: Size3,
    group_id: Size3,
    group_size: Size3,
    global_index: usize,
    local_index: usize,
    group_index: usize,
    worker: usize,
    state: WorkItemState,
    private_memory: Memory,
    frames: Vec<Frame>,
    phi_temps: Vec<(ValueId, TypedValue)>,
    pending_events: Vec<u64>,
    instruction_count: u64,
    last_instruction: Option<InstructionRef>,
}

impl WorkItem {
    /// Create the item at `local_id` of a group and bind the kernel
    /// arguments into its entry frame.
    pub(crate) fn new(
        invocation: &KernelInvocation<'_>,
        local: &GroupLocal,
        group_id: Size3,
        group_index: usize,
        local_id: Size3,
        group_size: Size3,
        worker: usize,
    ) -> Result<Self> {
        let launch = invocation.launch();
        let mut global_id = Size3::ZERO;
        let mut relative = Size3::ZERO;
        for dim in 0..3 {
            relative[dim] = group_id[dim] * launch.local_size[dim] + local_id[dim];
            global_id[dim] = relative[dim] + launch.global_offset[dim];
        }

        let mut item = Self {
            global_id,
            local_id,
            group_id,
            group_size,
            global_index: relative.flatten(launch.global_size),
            local_index: local_id.flatten(group_size),
            group_index,
            worker,
            state: WorkItemState::Ready,
            private_memory: Memory::new(AddressSpace::Private, invocation.context().config().buffer_bits),
            frames: Vec::new(),
            phi_temps: Vec::new(),
            pending_events: Vec::new(),
            instruction_count: 0,
            last_instruction: None,
        };

        let kernel = invocation.kernel();
        let function = invocation
            .module()
            .function(kernel.function())
            .ok_or_else(|| SimError::KernelNotFound(kernel.name().to_string()))?;
        let mut frame = Frame::new(kernel.function(), function.num_values(), None, None);

        for (index, param) in function.params.iter().enumerate() {
            let arg = kernel
                .arg(index)
                .ok_or_else(|| SimError::invalid_argument(index, "argument not set"))?;
            let value = match arg {
                ArgValue::Buffer(address) => TypedValue::pointer(*address),
                ArgValue::Local(_) => TypedValue::pointer(
                    local
                        .arg_address(index)
                        .ok_or_else(|| SimError::invalid_argument(index, "local argument was not allocated"))?,
                ),
                ArgValue::Scalar(payload) if param.ty.is_pointer() => {
                    let address = item.allocate_private(invocation, payload.byte_len() as u64, Some(payload.bytes()))?;
                    frame.allocations.push(address);
                    TypedValue::pointer(address)
                }
                ArgValue::Scalar(payload) => {
                    let (size, num) = param.ty.value_shape();
                    payload.reshape(size, num)
                }
            };
            frame.set(ValueId(index as u32), value)?;
        }

        item.frames.push(frame);
        Ok(item)
    }

    // ============================================================================================
    // Introspection
    // ============================================================================================

    pub fn global_id(&self) -> Size3 {
        self.global_id
    }

    pub fn local_id(&self) -> Size3 {
        self.local_id
    }

    pub fn group_id(&self) -> Size3 {
        self.group_id
    }

    /// Linear index over the whole launch, offset excluded.
    pub fn global_index(&self) -> usize {
        self.global_index
    }

    pub fn local_index(&self) -> usize {
        self.local_index
    }

    pub fn group_index(&self) -> usize {
        self.group_index
    }

    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn state(&self) -> WorkItemState {
        self.state
    }

    pub fn coords(&self) -> EntityCoords {
        EntityCoords::WorkItem {
            global: self.global_id,
            local: self.local_id,
            group: self.group_id,
        }
    }

    pub fn private_memory(&self) -> &Memory {
        &self.private_memory
    }

    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    /// Instruction the next step will execute.
    pub fn current_instruction(&self) -> Option<InstructionRef> {
        self.frames.last().map(Frame::cursor)
    }

    /// Call sites of the active frames, outermost first.
    pub fn call_stack(&self) -> Vec<InstructionRef> {
        self.frames.iter().filter_map(|f| f.call_site).collect()
    }

    /// Function of the innermost frame.
    pub fn function(&self) -> Option<FunctionId> {
        self.frames.last().map(|f| f.function)
    }

    /// Block the innermost frame entered its current block from.
    pub fn previous_block(&self) -> Option<BlockId> {
        self.frames.last().and_then(|f| f.previous_block)
    }

    /// Value `id` of the innermost frame, if defined.
    pub fn value(&self, id: ValueId) -> Option<&TypedValue> {
        self.frames.last()?.values.get(id.index())?.as_ref()
    }

    /// Async-copy events this item has not waited for.
    pub fn pending_events(&self) -> &[u64] {
        &self.pending_events
    }

    /// Instruction of the last step and its source location.
    pub(crate) fn error_location(&self, module: &Module) -> (Option<InstructionRef>, Option<DebugLoc>) {
        let at = self.last_instruction;
        let loc = at.and_then(|at| module.instruction(at)).and_then(|i| i.debug_loc.clone());
        (at, loc)
    }

    // ============================================================================================
    // Scheduling
    // ============================================================================================

    /// Stop executing after a fatal error or a group abort.
    pub(crate) fn terminate(&mut self) {
        self.state = WorkItemState::Finished;
        self.phi_temps.clear();
    }

    /// Leave a released barrier.
    pub(crate) fn resume(&mut self, released_events: &[u64]) {
        if self.state == WorkItemState::Barrier {
            self.pending_events.retain(|e| !released_events.contains(e));
            self.state = WorkItemState::Ready;
        }
    }

    fn frame(&self) -> Result<&Frame> {
        self.frames
            .last()
            .ok_or_else(|| SimError::malformed("work-item has no active frame"))
    }

    fn frame_mut(&mut self) -> Result<&mut Frame> {
        self.frames
            .last_mut()
            .ok_or_else(|| SimError::malformed("work-item has no active frame"))
    }

    fn advance(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.index += 1;
        }
    }

    fn flush_phis(&mut self) -> Result<()> {
        let temps = std::mem::take(&mut self.phi_temps);
        let frame = self.frame_mut()?;
        for (id, value) in temps {
            frame.set(id, value)?;
        }
        Ok(())
    }

    /// Execute the next instruction and report the resulting state.
    pub fn step(&mut self, env: &ExecEnv<'_>, sync: &mut GroupSync) -> Result<WorkItemState> {
        if self.state != WorkItemState::Ready {
            return Ok(self.state);
        }

        let module = env.invocation.module();
        let at = self.frame()?.cursor();
        self.last_instruction = Some(at);
        let instruction = module
            .instruction(at)
            .ok_or_else(|| SimError::malformed(format!("no instruction at {at}")))?;

        if !instruction.opcode.is_phi() && !self.phi_temps.is_empty() {
            self.flush_phis()?;
        }
        self.instruction_count += 1;

        let control = self.execute(module, instruction, at, env, sync)?;
        let plugins = env.invocation.context().plugins();

        match control {
            Control::Value(value) => {
                self.advance();
                match (instruction.result, value) {
                    (Some(id), Some(value)) => {
                        self.frame_mut()?.set(id, value)?;
                        plugins.instruction_executed(self, instruction, at, self.value(id));
                    }
                    _ => plugins.instruction_executed(self, instruction, at, None),
                }
            }
            Control::Phi(value) => {
                self.advance();
                let id = instruction
                    .result
                    .ok_or_else(|| SimError::malformed("phi without a result"))?;
                self.phi_temps.push((id, value));
                plugins.instruction_executed(self, instruction, at, self.phi_temps.last().map(|(_, v)| v));
            }
            Control::Jump(target) => {
                let frame = self.frame_mut()?;
                frame.previous_block = Some(frame.block);
                frame.block = target;
                frame.index = 0;
                plugins.instruction_executed(self, instruction, at, None);
            }
            Control::Call { function, args } => {
                self.advance();
                if self.frames.len() >= MAX_CALL_DEPTH {
                    return Err(SimError::malformed(format!("call depth exceeds {MAX_CALL_DEPTH}")));
                }
                let callee = module
                    .function(function)
                    .ok_or_else(|| SimError::UndefinedFunction(format!("{function}")))?;
                let mut frame = Frame::new(function, callee.num_values(), Some(at), instruction.result);
                for (index, value) in args.into_iter().enumerate() {
                    frame.set(ValueId(index as u32), value)?;
                }
                self.frames.push(frame);
                plugins.instruction_executed(self, instruction, at, None);
            }
            Control::Return(value) => {
                let frame = self.frames.pop().ok_or_else(|| SimError::malformed("return without a frame"))?;
                self.release_allocations(env, &frame.allocations);
                if self.frames.is_empty() {
                    self.state = WorkItemState::Finished;
                    plugins.instruction_executed(self, instruction, at, value.as_ref());
                    self.finish(env);
                } else {
                    if let (Some(id), Some(value)) = (frame.result, value.clone()) {
                        self.frame_mut()?.set(id, value)?;
                    }
                    plugins.instruction_executed(self, instruction, at, value.as_ref());
                }
            }
            Control::Barrier(flags) => {
                self.advance();
                self.state = WorkItemState::Barrier;
                plugins.instruction_executed(self, instruction, at, None);
                plugins.work_item_barrier(self, flags);
            }
        }

        Ok(self.state)
    }

    fn finish(&mut self, env: &ExecEnv<'_>) {
        if self.pending_events.is_empty() {
            return;
        }
        let mut diagnostic = Diagnostic::warning(
            DiagnosticKind::Execution,
            format!(
                "work-item finished with {} unwaited async copy event(s)",
                self.pending_events.len()
            ),
        )
        .with_entity(self.coords());
        if let Some(at) = self.last_instruction {
            let loc = env.invocation.module().instruction(at).and_then(|i| i.debug_loc.clone());
            diagnostic = diagnostic.at(at, loc);
        }
        env.invocation.context().log(diagnostic);
    }

    // ============================================================================================
    // Operands
    // ============================================================================================

    fn operand(&self, operand: &Operand, env: &ExecEnv<'_>) -> Result<TypedValue> {
        match operand {
            Operand::Value(id) => self
                .value(*id)
                .cloned()
                .ok_or_else(|| SimError::malformed(format!("use of undefined value {id}"))),
            Operand::Const(constant) => Ok(TypedValue::from_constant(constant)),
            Operand::Global { id, space } => {
                let address = match space {
                    AddressSpace::Local => env.local.global_address(*id),
                    _ => env.invocation.global_address(*id),
                };
                address
                    .map(TypedValue::pointer)
                    .ok_or_else(|| SimError::malformed(format!("global {id} has no storage")))
            }
        }
    }

    fn operand_type(operand: &Operand, function: &Function) -> Result<Type> {
        match operand {
            Operand::Value(id) => function
                .value_type(*id)
                .cloned()
                .ok_or_else(|| SimError::malformed(format!("value {id} has no type"))),
            Operand::Const(constant) => Ok(constant.ty.clone()),
            Operand::Global { space, .. } => Ok(Type::Pointer(*space)),
        }
    }

    fn uint_operand(&self, operand: &Operand, env: &ExecEnv<'_>) -> Result<u64> {
        Ok(self.operand(operand, env)?.get_uint(0))
    }

    // ============================================================================================
    // Memory
    // ============================================================================================

    fn memory<'m>(&'m self, env: &'m ExecEnv<'_>, space: AddressSpace) -> &'m Memory {
        match space {
            AddressSpace::Private => &self.private_memory,
            AddressSpace::Local => env.local.memory(),
            AddressSpace::Global | AddressSpace::Constant => env.invocation.context().global_memory(),
        }
    }

    /// Fail with `InvalidAccess` unless `size` bytes at `address` are in range.
    pub(crate) fn check_access(&self, env: &ExecEnv<'_>, space: AddressSpace, address: u64, size: u64) -> Result<()> {
        if self.memory(env, space).is_address_valid(address, size) {
            Ok(())
        } else {
            Err(SimError::InvalidAccess { space, address, size })
        }
    }

    pub(crate) fn load(&self, env: &ExecEnv<'_>, space: AddressSpace, address: u64, size: u64) -> Result<Vec<u8>> {
        let memory = self.memory(env, space);
        let data = memory.load(address, size)?;
        env.invocation
            .context()
            .plugins()
            .memory_load(Entity::WorkItem(self), memory, address, size);
        Ok(data)
    }

    pub(crate) fn store(&self, env: &ExecEnv<'_>, space: AddressSpace, address: u64, data: &[u8]) -> Result<()> {
        let memory = self.memory(env, space);
        memory.store(address, data)?;
        env.invocation
            .context()
            .plugins()
            .memory_store(Entity::WorkItem(self), memory, address, data);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn atomic(
        &self,
        env: &ExecEnv<'_>,
        space: AddressSpace,
        op: AtomicOp,
        address: u64,
        size: usize,
        operand: u64,
        compare: u64,
    ) -> Result<u64> {
        let memory = self.memory(env, space);
        let old = memory.atomic(op, address, size, operand, compare)?;
        let plugins = env.invocation.context().plugins();
        if op != AtomicOp::Store {
            plugins.memory_atomic_load(Entity::WorkItem(self), memory, op, address, size as u64);
        }
        if op.writes() {
            plugins.memory_atomic_store(Entity::WorkItem(self), memory, op, address, size as u64);
        }
        Ok(old)
    }

    fn allocate_private(&self, invocation: &KernelInvocation<'_>, size: u64, init: Option<&[u8]>) -> Result<u64> {
        let address = self.private_memory.allocate(size.max(1), MemFlags::empty())?;
        if let Some(data) = init {
            self.private_memory.host_write(address, data)?;
        }
        invocation.context().plugins().memory_allocated(&Allocation {
            memory: &self.private_memory,
            address,
            size: size.max(1),
            flags: MemFlags::empty(),
            init,
            owner: Some(Entity::WorkItem(self)),
        });
        Ok(address)
    }

    fn release_allocations(&self, env: &ExecEnv<'_>, allocations: &[u64]) {
        let plugins = env.invocation.context().plugins();
        for &address in allocations {
            if self.private_memory.deallocate(address).is_ok() {
                plugins.memory_deallocated(&self.private_memory, address, Some(Entity::WorkItem(self)));
            }
        }
    }

    // ============================================================================================
    // Dispatch
    // ============================================================================================

    fn execute(
        &mut self,
        module: &Module,
        instruction: &Instruction,
        at: InstructionRef,
        env: &ExecEnv<'_>,
        sync: &mut GroupSync,
    ) -> Result<Control> {
        let function = module
            .function(at.function)
            .ok_or_else(|| SimError::malformed(format!("no function {}", at.function)))?;
        let ty = &instruction.ty;

        let value = match &instruction.opcode {
            Opcode::Binary { op, lhs, rhs, flags } => {
                let lhs = self.operand(lhs, env)?;
                let rhs = self.operand(rhs, env)?;
                ops::binary(*op, *flags, &lhs, &rhs, ty.scalar_bits())?
            }
            Opcode::FNeg { operand } => ops::fneg(&self.operand(operand, env)?),
            Opcode::ICmp { pred, lhs, rhs } => {
                let bits = Self::operand_type(lhs, function)?.scalar_bits();
                let lhs = self.operand(lhs, env)?;
                let rhs = self.operand(rhs, env)?;
                ops::icmp(*pred, &lhs, &rhs, bits)?
            }
            Opcode::FCmp { pred, lhs, rhs } => {
                let lhs = self.operand(lhs, env)?;
                let rhs = self.operand(rhs, env)?;
                ops::fcmp(*pred, &lhs, &rhs)?
            }
            Opcode::Cast { op, operand } => {
                let from = Self::operand_type(operand, function)?;
                ops::cast(*op, &self.operand(operand, env)?, &from, ty)?
            }
            Opcode::Select {
                condition,
                if_true,
                if_false,
            } => {
                let condition = self.operand(condition, env)?;
                let if_true = self.operand(if_true, env)?;
                let if_false = self.operand(if_false, env)?;
                ops::select(&condition, &if_true, &if_false)?
            }

            Opcode::Alloca { allocated, count } => {
                let count = self.uint_operand(count, env)?;
                let size = allocated.size_bytes().saturating_mul(count);
                let address = self.allocate_private(env.invocation, size, None)?;
                self.frame_mut()?.allocations.push(address);
                TypedValue::pointer(address)
            }
            Opcode::Load { pointer, space } => {
                let address = self.operand(pointer, env)?.get_pointer(0);
                let (size, num) = ty.value_shape();
                let data = self.load(env, *space, address, (size * num) as u64)?;
                TypedValue::from_bytes(size, num, &data)
            }
            Opcode::Store { value, pointer, space } => {
                let value = self.operand(value, env)?;
                let address = self.operand(pointer, env)?.get_pointer(0);
                self.store(env, *space, address, value.bytes())?;
                return Ok(Control::Value(None));
            }
            Opcode::GetElementPtr { source, base, indices } => {
                let base = self.operand(base, env)?.get_pointer(0);
                let mut offsets = Vec::with_capacity(indices.len());
                for index in indices {
                    let bits = Self::operand_type(index, function)?.scalar_bits();
                    offsets.push(ops::sign_extend(self.uint_operand(index, env)?, bits));
                }
                TypedValue::pointer(ops::gep(source, base, &offsets)?)
            }

            Opcode::ExtractElement { vector, index } => {
                let vector = self.operand(vector, env)?;
                ops::extract_element(&vector, self.uint_operand(index, env)?)?
            }
            Opcode::InsertElement { vector, element, index } => {
                let vector = self.operand(vector, env)?;
                let element = self.operand(element, env)?;
                ops::insert_element(&vector, &element, self.uint_operand(index, env)?)?
            }
            Opcode::ShuffleVector { lhs, rhs, mask } => {
                let lhs = self.operand(lhs, env)?;
                let rhs = self.operand(rhs, env)?;
                ops::shuffle(&lhs, &rhs, mask)?
            }
            Opcode::ExtractValue { aggregate, indices } => {
                let aggregate_type = Self::operand_type(aggregate, function)?;
                let aggregate = self.operand(aggregate, env)?;
                ops::extract_value(&aggregate, &aggregate_type, indices)?
            }
            Opcode::InsertValue {
                aggregate,
                element,
                indices,
            } => {
                let aggregate_type = Self::operand_type(aggregate, function)?;
                let aggregate = self.operand(aggregate, env)?;
                let element = self.operand(element, env)?;
                ops::insert_value(&aggregate, &aggregate_type, &element, indices)?
            }

            Opcode::Phi { incoming } => {
                let previous = self
                    .previous_block()
                    .ok_or_else(|| SimError::malformed("phi in a block entered without a predecessor"))?;
                let (operand, _) = incoming
                    .iter()
                    .find(|(_, block)| *block == previous)
                    .ok_or_else(|| SimError::malformed(format!("phi has no incoming value for {previous}")))?;
                return Ok(Control::Phi(self.operand(operand, env)?));
            }
            Opcode::Call { callee, args } => {
                if let Some(target) = module.function_by_name(callee) {
                    let args = args
                        .iter()
                        .map(|a| self.operand(a, env))
                        .collect::<Result<Vec<_>>>()?;
                    return Ok(Control::Call { function: target, args });
                }
                let mut values = Vec::with_capacity(args.len());
                let mut types = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.operand(arg, env)?);
                    types.push(Self::operand_type(arg, function)?);
                }
                let site = builtins::CallSite {
                    name: callee,
                    args: values,
                    arg_types: types,
                    result_type: ty,
                    at,
                };
                return builtins::call(self, env, sync, &site);
            }
            Opcode::Br { target } => return Ok(Control::Jump(*target)),
            Opcode::CondBr {
                condition,
                if_true,
                if_false,
            } => {
                let taken = if self.operand(condition, env)?.get_bool(0) {
                    *if_true
                } else {
                    *if_false
                };
                return Ok(Control::Jump(taken));
            }
            Opcode::Switch {
                condition,
                default,
                cases,
            } => {
                let bits = Self::operand_type(condition, function)?.scalar_bits();
                let value = self.uint_operand(condition, env)? & ops::mask(bits);
                let target = cases
                    .iter()
                    .find(|(case, _)| case & ops::mask(bits) == value)
                    .map_or(*default, |(_, block)| *block);
                return Ok(Control::Jump(target));
            }
            Opcode::Ret { value } => {
                let value = value.as_ref().map(|v| self.operand(v, env)).transpose()?;
                return Ok(Control::Return(value));
            }
            Opcode::Unreachable => return Err(SimError::Unreachable),
        };

        Ok(Control::Value(Some(value)))
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("global_id", &self.global_id)
            .field("local_id", &self.local_id)
            .field("state", &self.state)
            .field("frames", &self.frames.len())
            .finish()
    }
}
