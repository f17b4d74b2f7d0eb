//! Programmatic construction of kernel modules
//!
//! Used by embedders that produce modules directly, and by tests and
//! benchmarks.
//!
//! # Example
//!
//! ```
//! use clgrind_core::ir::{AddressSpace, BinaryOp, FunctionBuilder, KernelArgInfo, ModuleBuilder, Type};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // out[get_global_id(0)] = 2 * get_global_id(0)
//! let mut f = FunctionBuilder::new("double_ids", &[("out", Type::Pointer(AddressSpace::Global))], Type::Void);
//! let gid = f.call("get_global_id", Type::I64, vec![f.const_i32(0)]);
//! let doubled = f.binary(BinaryOp::Add, gid.clone(), gid.clone());
//! let ptr = f.gep(Type::I64, f.param(0), vec![gid]);
//! f.store(doubled, ptr);
//! f.ret_void();
//!
//! let mut module = ModuleBuilder::new("example");
//! module.add_kernel(f.finish(), vec![KernelArgInfo::pointer("out", "long*", AddressSpace::Global)], false);
//! let module = module.build()?;
//! assert!(module.kernel("double_ids").is_some());
//! # Ok(())
//! # }
//! ```

use super::instruction::{
    ArithFlags, BasicBlock, BinaryOp, CastOp, FloatPredicate, Instruction, IntPredicate, Opcode,
};
use super::module::{
    AccessQualifier, Function, GlobalVariable, KernelArgInfo, KernelInfo, Module, ModuleResult, Param,
};
use super::types::{AddressSpace, BlockId, Constant, DebugLoc, FunctionId, GlobalId, Operand, Type, ValueId};

impl KernelArgInfo {
    /// Pointer argument into `space`.
    pub fn pointer(name: impl Into<String>, type_name: impl Into<String>, space: AddressSpace) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            space,
            access: AccessQualifier::ReadWrite,
            size: super::types::POINTER_SIZE,
        }
    }

    /// By-value argument of `size` bytes.
    pub fn scalar(name: impl Into<String>, type_name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            space: AddressSpace::Private,
            access: AccessQualifier::ReadWrite,
            size,
        }
    }

    pub fn with_access(mut self, access: AccessQualifier) -> Self {
        self.access = access;
        self
    }
}

// ================================================================================================
// Module Builder
// ================================================================================================

#[derive(Debug, Default)]
pub struct ModuleBuilder {
    name: String,
    functions: Vec<Function>,
    globals: Vec<GlobalVariable>,
    kernels: Vec<KernelInfo>,
}

impl ModuleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Declare a program-scope variable and return its address operand.
    pub fn add_global(
        &mut self,
        name: impl Into<String>,
        ty: Type,
        space: AddressSpace,
        initializer: Option<Vec<u8>>,
    ) -> Operand {
        let id = GlobalId::new(self.globals.len() as u32);
        self.globals.push(GlobalVariable {
            name: name.into(),
            ty,
            space,
            initializer,
        });
        Operand::Global { id, space }
    }

    pub fn add_function(&mut self, function: Function) -> FunctionId {
        let id = FunctionId::new(self.functions.len() as u32);
        self.functions.push(function);
        id
    }

    /// Add `function` and expose it as a kernel entry point.
    pub fn add_kernel(&mut self, function: Function, args: Vec<KernelArgInfo>, uniform_work_groups: bool) -> FunctionId {
        let name = function.name.clone();
        let id = self.add_function(function);
        self.kernels.push(KernelInfo {
            name,
            function: id,
            args,
            uniform_work_groups,
            required_work_group_size: None,
        });
        id
    }

    /// Metadata of the most recently added kernel.
    pub fn last_kernel_mut(&mut self) -> Option<&mut KernelInfo> {
        self.kernels.last_mut()
    }

    /// Index, then validate, the module.
    pub fn build(self) -> ModuleResult<Module> {
        let module = Module::from_parts(self.name, self.functions, self.globals, self.kernels)?;
        module.validate()?;
        Ok(module)
    }
}

// ================================================================================================
// Function Builder
// ================================================================================================

/// Appends instructions to a function, allocating value ids as it goes.
#[derive(Debug)]
pub struct FunctionBuilder {
    name: String,
    params: Vec<Param>,
    return_type: Type,
    blocks: Vec<BasicBlock>,
    value_types: Vec<Type>,
    current: BlockId,
    debug_loc: Option<DebugLoc>,
}

impl FunctionBuilder {
    /// Start a function with an empty `entry` block selected.
    pub fn new(name: impl Into<String>, params: &[(&str, Type)], return_type: Type) -> Self {
        Self {
            name: name.into(),
            params: params
                .iter()
                .map(|(name, ty)| Param {
                    name: (*name).to_string(),
                    ty: ty.clone(),
                })
                .collect(),
            return_type,
            blocks: vec![BasicBlock::new("entry")],
            value_types: params.iter().map(|(_, ty)| ty.clone()).collect(),
            current: BlockId::new(0),
            debug_loc: None,
        }
    }

    pub fn param(&self, index: usize) -> Operand {
        Operand::Value(ValueId::new(index as u32))
    }

    pub fn entry(&self) -> BlockId {
        BlockId::new(0)
    }

    pub fn current_block(&self) -> BlockId {
        self.current
    }

    /// Create an empty block (does not select it).
    pub fn block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId::new(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::new(name));
        id
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    /// Location attached to subsequently pushed instructions.
    pub fn set_debug_loc(&mut self, loc: Option<DebugLoc>) {
        self.debug_loc = loc;
    }

    /// Type of an operand as seen inside this function.
    pub fn operand_type(&self, operand: &Operand) -> Type {
        match operand {
            Operand::Value(id) => self.value_types.get(id.index()).cloned().unwrap_or(Type::Void),
            Operand::Const(c) => c.ty.clone(),
            Operand::Global { space, .. } => Type::Pointer(*space),
        }
    }

    /// Append an instruction; a non-void `ty` allocates a result value.
    pub fn push(&mut self, opcode: Opcode, ty: Type) -> Option<Operand> {
        let result = if ty.is_void() {
            None
        } else {
            let id = ValueId::new(self.value_types.len() as u32);
            self.value_types.push(ty.clone());
            Some(id)
        };
        let mut inst = Instruction::new(opcode, result, ty);
        inst.debug_loc = self.debug_loc.clone();
        if let Some(block) = self.blocks.get_mut(self.current.index()) {
            block.instructions.push(inst);
        }
        result.map(Operand::Value)
    }

    fn push_value(&mut self, opcode: Opcode, ty: Type) -> Operand {
        self.push(opcode, ty).unwrap_or(Operand::Const(Constant::undef(Type::Void)))
    }

    // ============================================================================================
    // Constants
    // ============================================================================================

    pub fn const_i32(&self, value: i32) -> Operand {
        Operand::Const(Constant::i32(value))
    }

    pub fn const_i64(&self, value: i64) -> Operand {
        Operand::Const(Constant::i64(value))
    }

    pub fn const_f32(&self, value: f32) -> Operand {
        Operand::Const(Constant::f32(value))
    }

    pub fn const_bool(&self, value: bool) -> Operand {
        Operand::Const(Constant::bool(value))
    }

    // ============================================================================================
    // Arithmetic
    // ============================================================================================

    pub fn binary(&mut self, op: BinaryOp, lhs: Operand, rhs: Operand) -> Operand {
        self.binary_flags(op, lhs, rhs, ArithFlags::NONE)
    }

    pub fn binary_flags(&mut self, op: BinaryOp, lhs: Operand, rhs: Operand, flags: ArithFlags) -> Operand {
        let ty = self.operand_type(&lhs);
        self.push_value(Opcode::Binary { op, lhs, rhs, flags }, ty)
    }

    pub fn fneg(&mut self, operand: Operand) -> Operand {
        let ty = self.operand_type(&operand);
        self.push_value(Opcode::FNeg { operand }, ty)
    }

    fn compare_type(&self, operand: &Operand) -> Type {
        match self.operand_type(operand) {
            Type::Vector(_, n) => Type::vector(Type::BOOL, n),
            _ => Type::BOOL,
        }
    }

    pub fn icmp(&mut self, pred: IntPredicate, lhs: Operand, rhs: Operand) -> Operand {
        let ty = self.compare_type(&lhs);
        self.push_value(Opcode::ICmp { pred, lhs, rhs }, ty)
    }

    pub fn fcmp(&mut self, pred: FloatPredicate, lhs: Operand, rhs: Operand) -> Operand {
        let ty = self.compare_type(&lhs);
        self.push_value(Opcode::FCmp { pred, lhs, rhs }, ty)
    }

    pub fn cast(&mut self, op: CastOp, operand: Operand, ty: Type) -> Operand {
        self.push_value(Opcode::Cast { op, operand }, ty)
    }

    pub fn select(&mut self, condition: Operand, if_true: Operand, if_false: Operand) -> Operand {
        let ty = self.operand_type(&if_true);
        self.push_value(
            Opcode::Select {
                condition,
                if_true,
                if_false,
            },
            ty,
        )
    }

    // ============================================================================================
    // Memory
    // ============================================================================================

    /// Private allocation of one `ty`.
    pub fn alloca(&mut self, ty: Type) -> Operand {
        self.alloca_n(ty, 1)
    }

    pub fn alloca_n(&mut self, ty: Type, count: u32) -> Operand {
        self.push_value(
            Opcode::Alloca {
                allocated: ty,
                count: Operand::Const(Constant::i32(count as i32)),
            },
            Type::Pointer(AddressSpace::Private),
        )
    }

    /// Load a `ty` through `pointer`.
    pub fn load(&mut self, ty: Type, pointer: Operand) -> Operand {
        let space = self.operand_type(&pointer).address_space().unwrap_or(AddressSpace::Private);
        self.push_value(Opcode::Load { pointer, space }, ty)
    }

    pub fn store(&mut self, value: Operand, pointer: Operand) {
        let space = self.operand_type(&pointer).address_space().unwrap_or(AddressSpace::Private);
        self.push(Opcode::Store { value, pointer, space }, Type::Void);
    }

    pub fn gep(&mut self, source: Type, base: Operand, indices: Vec<Operand>) -> Operand {
        let ty = self.operand_type(&base);
        self.push_value(Opcode::GetElementPtr { source, base, indices }, ty)
    }

    // ============================================================================================
    // Vectors and Aggregates
    // ============================================================================================

    pub fn extract_element(&mut self, vector: Operand, index: Operand) -> Operand {
        let ty = self.operand_type(&vector).scalar().clone();
        self.push_value(Opcode::ExtractElement { vector, index }, ty)
    }

    pub fn insert_element(&mut self, vector: Operand, element: Operand, index: Operand) -> Operand {
        let ty = self.operand_type(&vector);
        self.push_value(Opcode::InsertElement { vector, element, index }, ty)
    }

    pub fn shuffle(&mut self, lhs: Operand, rhs: Operand, mask: Vec<i32>) -> Operand {
        let element = self.operand_type(&lhs).scalar().clone();
        let ty = Type::vector(element, mask.len() as u32);
        self.push_value(Opcode::ShuffleVector { lhs, rhs, mask }, ty)
    }

    pub fn extract_value(&mut self, aggregate: Operand, indices: Vec<u32>) -> Operand {
        let mut ty = self.operand_type(&aggregate);
        for index in &indices {
            ty = ty.member(u64::from(*index)).cloned().unwrap_or(Type::Void);
        }
        self.push_value(Opcode::ExtractValue { aggregate, indices }, ty)
    }

    pub fn insert_value(&mut self, aggregate: Operand, element: Operand, indices: Vec<u32>) -> Operand {
        let ty = self.operand_type(&aggregate);
        self.push_value(
            Opcode::InsertValue {
                aggregate,
                element,
                indices,
            },
            ty,
        )
    }

    // ============================================================================================
    // Control Flow
    // ============================================================================================

    /// Phi node; more incoming edges can be added with [`Self::add_incoming`].
    pub fn phi(&mut self, ty: Type, incoming: Vec<(Operand, BlockId)>) -> Operand {
        self.push_value(Opcode::Phi { incoming }, ty)
    }

    pub fn add_incoming(&mut self, phi: &Operand, value: Operand, block: BlockId) {
        let Some(id) = phi.as_value() else { return };
        for inst in self.blocks.iter_mut().flat_map(|b| b.instructions.iter_mut()) {
            if inst.result == Some(id) {
                if let Opcode::Phi { incoming } = &mut inst.opcode {
                    incoming.push((value, block));
                }
                return;
            }
        }
    }

    /// Call returning a value of `ty`.
    pub fn call(&mut self, callee: impl Into<String>, ty: Type, args: Vec<Operand>) -> Operand {
        self.push_value(
            Opcode::Call {
                callee: callee.into(),
                args,
            },
            ty,
        )
    }

    pub fn call_void(&mut self, callee: impl Into<String>, args: Vec<Operand>) {
        self.push(
            Opcode::Call {
                callee: callee.into(),
                args,
            },
            Type::Void,
        );
    }

    pub fn br(&mut self, target: BlockId) {
        self.push(Opcode::Br { target }, Type::Void);
    }

    pub fn cond_br(&mut self, condition: Operand, if_true: BlockId, if_false: BlockId) {
        self.push(
            Opcode::CondBr {
                condition,
                if_true,
                if_false,
            },
            Type::Void,
        );
    }

    pub fn switch(&mut self, condition: Operand, default: BlockId, cases: Vec<(u64, BlockId)>) {
        self.push(
            Opcode::Switch {
                condition,
                default,
                cases,
            },
            Type::Void,
        );
    }

    pub fn ret(&mut self, value: Operand) {
        self.push(Opcode::Ret { value: Some(value) }, Type::Void);
    }

    pub fn ret_void(&mut self) {
        self.push(Opcode::Ret { value: None }, Type::Void);
    }

    pub fn unreachable(&mut self) {
        self.push(Opcode::Unreachable, Type::Void);
    }

    /// `barrier(flags)`
    pub fn barrier(&mut self, flags: u32) {
        self.call_void("barrier", vec![self.const_i32(flags as i32)]);
    }

    pub fn finish(self) -> Function {
        Function {
            name: self.name,
            params: self.params,
            return_type: self.return_type,
            blocks: self.blocks,
            value_types: self.value_types,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_ids_follow_params() {
        let mut f = FunctionBuilder::new("f", &[("a", Type::I32), ("b", Type::I32)], Type::I32);
        let sum = f.binary(BinaryOp::Add, f.param(0), f.param(1));
        assert_eq!(sum, Operand::Value(ValueId(2)));
        f.ret(sum);
        let function = f.finish();
        assert_eq!(function.value_types.len(), 3);
    }

    #[test]
    fn test_loop_with_phi() {
        let mut f = FunctionBuilder::new("count", &[("n", Type::I32)], Type::I32);
        let header = f.block("header");
        let exit = f.block("exit");
        let entry = f.entry();
        f.br(header);
        f.switch_to(header);
        let i = f.phi(Type::I32, vec![(f.const_i32(0), entry)]);
        let next = f.binary(BinaryOp::Add, i.clone(), f.const_i32(1));
        f.add_incoming(&i, next.clone(), header);
        let done = f.icmp(IntPredicate::Sge, next.clone(), f.param(0));
        f.cond_br(done, exit, header);
        f.switch_to(exit);
        f.ret(next);

        let mut module = ModuleBuilder::new("m");
        module.add_function(f.finish());
        let module = module.build().unwrap();
        let function = &module.functions[0];
        match &function.blocks[1].instructions[0].opcode {
            Opcode::Phi { incoming } => assert_eq!(incoming.len(), 2),
            other => panic!("expected phi, got {other:?}"),
        }
    }

    #[test]
    fn test_compare_types() {
        let v4 = Type::vector(Type::Float, 4);
        let mut f = FunctionBuilder::new("f", &[("a", v4.clone()), ("b", v4)], Type::Void);
        let cmp = f.fcmp(FloatPredicate::Olt, f.param(0), f.param(1));
        assert_eq!(f.operand_type(&cmp), Type::vector(Type::BOOL, 4));
        let scalar = f.icmp(IntPredicate::Eq, f.const_i32(1), f.const_i32(2));
        assert_eq!(f.operand_type(&scalar), Type::BOOL);
    }

    #[test]
    fn test_globals_are_addressable() {
        let mut module = ModuleBuilder::new("m");
        let g = module.add_global("table", Type::array(Type::I32, 4), AddressSpace::Constant, Some(vec![0; 16]));
        assert!(matches!(g, Operand::Global { space: AddressSpace::Constant, .. }));
    }
}
