//! Kernel IR
//!
//! The SSA instruction stream the simulator interprets. Modules arrive from an
//! external front end (usually via [`Module::from_bytes`]) or are assembled
//! with [`ModuleBuilder`].

pub mod builder;
pub mod instruction;
pub mod module;
pub mod types;

pub use builder::{FunctionBuilder, ModuleBuilder};
pub use instruction::{
    ArithFlags, BasicBlock, BinaryOp, CastOp, FloatPredicate, Instruction, IntPredicate, Opcode,
};
pub use module::{
    AccessQualifier, Function, GlobalVariable, KernelArgInfo, KernelInfo, Module, ModuleError, ModuleResult, Param,
    MODULE_MAGIC, MODULE_VERSION,
};
pub use types::{
    align_to, AddressSpace, BlockId, Constant, DebugLoc, FunctionId, GlobalId, InstructionRef, Operand, Type, ValueId,
    POINTER_SIZE,
};
