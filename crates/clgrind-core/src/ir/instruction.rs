//! Kernel instruction set
//!
//! SSA instructions in the shape the front end emits them:
//! - Arithmetic and bitwise binary operations with overflow flags
//! - Integer and floating-point comparisons
//! - Conversions
//! - Memory (alloca, load, store, address computation)
//! - Vector and aggregate manipulation
//! - Control flow (phi, branches, switch, call, return)

use super::types::{AddressSpace, BlockId, DebugLoc, Operand, Type, ValueId};
use serde::{Deserialize, Serialize};
use std::fmt;

// ================================================================================================
// Operation Kinds
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    Shl,
    LShr,
    AShr,
    And,
    Or,
    Xor,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FRem,
}

impl BinaryOp {
    pub const fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::UDiv => "udiv",
            BinaryOp::SDiv => "sdiv",
            BinaryOp::URem => "urem",
            BinaryOp::SRem => "srem",
            BinaryOp::Shl => "shl",
            BinaryOp::LShr => "lshr",
            BinaryOp::AShr => "ashr",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::FAdd => "fadd",
            BinaryOp::FSub => "fsub",
            BinaryOp::FMul => "fmul",
            BinaryOp::FDiv => "fdiv",
            BinaryOp::FRem => "frem",
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(
            self,
            BinaryOp::FAdd | BinaryOp::FSub | BinaryOp::FMul | BinaryOp::FDiv | BinaryOp::FRem
        )
    }
}

/// Overflow and exactness flags on integer arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ArithFlags {
    /// No signed wrap
    pub nsw: bool,
    /// No unsigned wrap
    pub nuw: bool,
    pub exact: bool,
}

impl ArithFlags {
    pub const NONE: ArithFlags = ArithFlags {
        nsw: false,
        nuw: false,
        exact: false,
    };
    pub const NSW: ArithFlags = ArithFlags {
        nsw: true,
        nuw: false,
        exact: false,
    };
    pub const NUW: ArithFlags = ArithFlags {
        nsw: false,
        nuw: true,
        exact: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntPredicate {
    Eq,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FloatPredicate {
    False,
    Oeq,
    Ogt,
    Oge,
    Olt,
    Ole,
    One,
    Ord,
    Ueq,
    Ugt,
    Uge,
    Ult,
    Ule,
    Une,
    Uno,
    True,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CastOp {
    Trunc,
    ZExt,
    SExt,
    FPTrunc,
    FPExt,
    FPToUI,
    FPToSI,
    UIToFP,
    SIToFP,
    PtrToInt,
    IntToPtr,
    BitCast,
    AddrSpaceCast,
}

impl CastOp {
    pub const fn name(self) -> &'static str {
        match self {
            CastOp::Trunc => "trunc",
            CastOp::ZExt => "zext",
            CastOp::SExt => "sext",
            CastOp::FPTrunc => "fptrunc",
            CastOp::FPExt => "fpext",
            CastOp::FPToUI => "fptoui",
            CastOp::FPToSI => "fptosi",
            CastOp::UIToFP => "uitofp",
            CastOp::SIToFP => "sitofp",
            CastOp::PtrToInt => "ptrtoint",
            CastOp::IntToPtr => "inttoptr",
            CastOp::BitCast => "bitcast",
            CastOp::AddrSpaceCast => "addrspacecast",
        }
    }
}

// ================================================================================================
// Opcodes
// ================================================================================================

/// Operation performed by an [`Instruction`] together with its operands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Opcode {
    // ============================================================================================
    // Arithmetic
    // ============================================================================================
    /// Element-wise binary operation
    Binary {
        op: BinaryOp,
        lhs: Operand,
        rhs: Operand,
        flags: ArithFlags,
    },

    /// Floating-point negation
    FNeg { operand: Operand },

    /// Integer or pointer comparison producing `i1` per lane
    ICmp {
        pred: IntPredicate,
        lhs: Operand,
        rhs: Operand,
    },

    /// Floating-point comparison producing `i1` per lane
    FCmp {
        pred: FloatPredicate,
        lhs: Operand,
        rhs: Operand,
    },

    /// Conversion to the instruction's result type
    Cast { op: CastOp, operand: Operand },

    /// Lane-wise (vector condition) or whole-value (scalar condition) choice
    Select {
        condition: Operand,
        if_true: Operand,
        if_false: Operand,
    },

    // ============================================================================================
    // Memory
    // ============================================================================================
    /// Reserve `count` elements of `allocated` in private memory
    Alloca { allocated: Type, count: Operand },

    /// Load a value of the result type
    Load { pointer: Operand, space: AddressSpace },

    /// Store `value` through `pointer`
    Store {
        value: Operand,
        pointer: Operand,
        space: AddressSpace,
    },

    /// Address arithmetic over `source`-typed elements
    GetElementPtr {
        source: Type,
        base: Operand,
        indices: Vec<Operand>,
    },

    // ============================================================================================
    // Vectors and Aggregates
    // ============================================================================================
    ExtractElement { vector: Operand, index: Operand },

    InsertElement {
        vector: Operand,
        element: Operand,
        index: Operand,
    },

    /// Lane permutation; mask entries index the concatenation of `lhs` and
    /// `rhs`, negative entries yield undefined lanes
    ShuffleVector {
        lhs: Operand,
        rhs: Operand,
        mask: Vec<i32>,
    },

    ExtractValue { aggregate: Operand, indices: Vec<u32> },

    InsertValue {
        aggregate: Operand,
        element: Operand,
        indices: Vec<u32>,
    },

    // ============================================================================================
    // Control Flow
    // ============================================================================================
    /// Value selected by the predecessor block
    Phi { incoming: Vec<(Operand, BlockId)> },

    /// Call a module function or a builtin
    Call { callee: String, args: Vec<Operand> },

    Br { target: BlockId },

    CondBr {
        condition: Operand,
        if_true: BlockId,
        if_false: BlockId,
    },

    Switch {
        condition: Operand,
        default: BlockId,
        cases: Vec<(u64, BlockId)>,
    },

    Ret { value: Option<Operand> },

    Unreachable,
}

impl Opcode {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::Binary { op, .. } => op.name(),
            Opcode::FNeg { .. } => "fneg",
            Opcode::ICmp { .. } => "icmp",
            Opcode::FCmp { .. } => "fcmp",
            Opcode::Cast { op, .. } => op.name(),
            Opcode::Select { .. } => "select",
            Opcode::Alloca { .. } => "alloca",
            Opcode::Load { .. } => "load",
            Opcode::Store { .. } => "store",
            Opcode::GetElementPtr { .. } => "getelementptr",
            Opcode::ExtractElement { .. } => "extractelement",
            Opcode::InsertElement { .. } => "insertelement",
            Opcode::ShuffleVector { .. } => "shufflevector",
            Opcode::ExtractValue { .. } => "extractvalue",
            Opcode::InsertValue { .. } => "insertvalue",
            Opcode::Phi { .. } => "phi",
            Opcode::Call { .. } => "call",
            Opcode::Br { .. } => "br",
            Opcode::CondBr { .. } => "br",
            Opcode::Switch { .. } => "switch",
            Opcode::Ret { .. } => "ret",
            Opcode::Unreachable => "unreachable",
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Opcode::Br { .. } | Opcode::CondBr { .. } | Opcode::Switch { .. } | Opcode::Ret { .. } | Opcode::Unreachable
        )
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, Opcode::Phi { .. })
    }

    /// Blocks this terminator can transfer control to.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Opcode::Br { target } => vec![*target],
            Opcode::CondBr { if_true, if_false, .. } => vec![*if_true, *if_false],
            Opcode::Switch { default, cases, .. } => {
                let mut targets = vec![*default];
                targets.extend(cases.iter().map(|(_, block)| *block));
                targets
            }
            _ => Vec::new(),
        }
    }

    /// All value operands in source order.
    pub fn operands(&self) -> Vec<&Operand> {
        match self {
            Opcode::Binary { lhs, rhs, .. } | Opcode::ICmp { lhs, rhs, .. } | Opcode::FCmp { lhs, rhs, .. } => {
                vec![lhs, rhs]
            }
            Opcode::FNeg { operand } | Opcode::Cast { operand, .. } => vec![operand],
            Opcode::Select {
                condition,
                if_true,
                if_false,
            } => vec![condition, if_true, if_false],
            Opcode::Alloca { count, .. } => vec![count],
            Opcode::Load { pointer, .. } => vec![pointer],
            Opcode::Store { value, pointer, .. } => vec![value, pointer],
            Opcode::GetElementPtr { base, indices, .. } => std::iter::once(base).chain(indices.iter()).collect(),
            Opcode::ExtractElement { vector, index } => vec![vector, index],
            Opcode::InsertElement { vector, element, index } => vec![vector, element, index],
            Opcode::ShuffleVector { lhs, rhs, .. } => vec![lhs, rhs],
            Opcode::ExtractValue { aggregate, .. } => vec![aggregate],
            Opcode::InsertValue { aggregate, element, .. } => vec![aggregate, element],
            Opcode::Phi { incoming } => incoming.iter().map(|(value, _)| value).collect(),
            Opcode::Call { args, .. } => args.iter().collect(),
            Opcode::CondBr { condition, .. } | Opcode::Switch { condition, .. } => vec![condition],
            Opcode::Ret { value } => value.iter().collect(),
            Opcode::Br { .. } | Opcode::Unreachable => Vec::new(),
        }
    }
}

// ================================================================================================
// Instructions and Blocks
// ================================================================================================

/// One SSA instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: Opcode,
    /// Value defined by this instruction, if any
    pub result: Option<ValueId>,
    /// Result type (`Void` when `result` is `None`)
    pub ty: Type,
    pub debug_loc: Option<DebugLoc>,
}

impl Instruction {
    pub fn new(opcode: Opcode, result: Option<ValueId>, ty: Type) -> Self {
        Self {
            opcode,
            result,
            ty,
            debug_loc: None,
        }
    }

    pub fn with_debug_loc(mut self, loc: DebugLoc) -> Self {
        self.debug_loc = Some(loc);
        self
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(result) = self.result {
            write!(f, "{result} = ")?;
        }
        write!(f, "{}", self.opcode.mnemonic())?;
        if let Opcode::Call { callee, .. } = &self.opcode {
            write!(f, " {callee}")?;
        }
        for (i, operand) in self.opcode.operands().iter().enumerate() {
            write!(f, "{} {operand}", if i == 0 { "" } else { "," })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BasicBlock {
    pub name: String,
    pub instructions: Vec<Instruction>,
}

impl BasicBlock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: Vec::new(),
        }
    }

    pub fn terminator(&self) -> Option<&Instruction> {
        self.instructions.last().filter(|inst| inst.opcode.is_terminator())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Constant;

    #[test]
    fn test_successors() {
        let switch = Opcode::Switch {
            condition: Operand::Value(ValueId(0)),
            default: BlockId(1),
            cases: vec![(0, BlockId(2)), (7, BlockId(3))],
        };
        assert_eq!(switch.successors(), vec![BlockId(1), BlockId(2), BlockId(3)]);
        assert!(switch.is_terminator());
        assert!(Opcode::Ret { value: None }.successors().is_empty());
    }

    #[test]
    fn test_operands_in_order() {
        let store = Opcode::Store {
            value: Operand::Const(Constant::i32(5)),
            pointer: Operand::Value(ValueId(2)),
            space: AddressSpace::Global,
        };
        let ops = store.operands();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[1].as_value(), Some(ValueId(2)));
    }

    #[test]
    fn test_display() {
        let inst = Instruction::new(
            Opcode::Binary {
                op: BinaryOp::Add,
                lhs: Operand::Value(ValueId(0)),
                rhs: Operand::Value(ValueId(1)),
                flags: ArithFlags::NSW,
            },
            Some(ValueId(2)),
            Type::I32,
        );
        assert_eq!(inst.to_string(), "%2 = add %0, %1");
    }
}
