//! Kernel modules: functions, program-scope variables and kernel metadata
//!
//! A [`Module`] is what the external front end hands the simulator. It can be
//! stored in a compact binary form:
//!
//! ```text
//! ┌──────────┬─────────────┬──────────────────────────┐
//! │ "CLGM"   │ version u32 │ bincode(Module)          │
//! └──────────┴─────────────┴──────────────────────────┘
//! ```

use super::instruction::{BasicBlock, Instruction, Opcode};
use super::types::{AddressSpace, BlockId, FunctionId, GlobalId, InstructionRef, Operand, Type, ValueId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Leading bytes of an encoded module.
pub const MODULE_MAGIC: [u8; 4] = *b"CLGM";

/// Encoding version written by [`Module::to_bytes`].
pub const MODULE_VERSION: u32 = 1;

/// Errors that can occur when loading or validating modules
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    /// Input does not start with the module magic
    #[error("not a kernel module (bad magic)")]
    BadMagic,

    /// Encoded with an unsupported version
    #[error("unsupported module version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    /// Payload failed to (de)serialize
    #[error("module encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structural problem found by validation
    #[error("invalid function '{function}': {reason}")]
    Invalid { function: String, reason: String },

    /// Name defined twice
    #[error("duplicate symbol '{0}'")]
    DuplicateSymbol(String),
}

/// Result type for module operations
pub type ModuleResult<T> = std::result::Result<T, ModuleError>;

// ================================================================================================
// Functions and Globals
// ================================================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

/// A function body. Parameters occupy value ids `0..params.len()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: Type,
    pub blocks: Vec<BasicBlock>,
    /// Type of every value id in this function
    pub value_types: Vec<Type>,
}

impl Function {
    pub fn num_values(&self) -> usize {
        self.value_types.len()
    }

    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id.index())
    }

    pub fn instruction(&self, block: BlockId, index: u32) -> Option<&Instruction> {
        self.block(block)?.instructions.get(index as usize)
    }

    pub fn value_type(&self, id: ValueId) -> Option<&Type> {
        self.value_types.get(id.index())
    }

    /// Total private bytes statically reserved by fixed-count allocas.
    pub fn static_private_size(&self) -> u64 {
        self.blocks
            .iter()
            .flat_map(|b| &b.instructions)
            .filter_map(|inst| match &inst.opcode {
                Opcode::Alloca {
                    allocated,
                    count: Operand::Const(c),
                } => {
                    let mut count = [0u8; 8];
                    let n = c.data.len().min(8);
                    count[..n].copy_from_slice(&c.data[..n]);
                    Some(allocated.size_bytes() * u64::from_le_bytes(count))
                }
                _ => None,
            })
            .sum()
    }
}

/// A program-scope variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalVariable {
    pub name: String,
    pub ty: Type,
    pub space: AddressSpace,
    pub initializer: Option<Vec<u8>>,
}

// ================================================================================================
// Kernel Metadata
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AccessQualifier {
    ReadOnly,
    WriteOnly,
    #[default]
    ReadWrite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelArgInfo {
    pub name: String,
    /// Source-level type name, e.g. `global int*`
    pub type_name: String,
    /// Pointee address space for pointers, `Private` for by-value arguments
    pub space: AddressSpace,
    pub access: AccessQualifier,
    /// Size in bytes of the argument value
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelInfo {
    pub name: String,
    pub function: FunctionId,
    pub args: Vec<KernelArgInfo>,
    /// Global size must be a multiple of local size
    pub uniform_work_groups: bool,
    pub required_work_group_size: Option<[usize; 3]>,
}

// ================================================================================================
// Module
// ================================================================================================

/// A loaded kernel program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub functions: Vec<Function>,
    pub globals: Vec<GlobalVariable>,
    pub kernels: Vec<KernelInfo>,
    #[serde(skip)]
    function_index: HashMap<String, FunctionId>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
            globals: Vec::new(),
            kernels: Vec::new(),
            function_index: HashMap::new(),
        }
    }

    /// Assemble a module from parts, indexing function names.
    pub fn from_parts(
        name: impl Into<String>,
        functions: Vec<Function>,
        globals: Vec<GlobalVariable>,
        kernels: Vec<KernelInfo>,
    ) -> ModuleResult<Self> {
        let mut module = Self {
            name: name.into(),
            functions,
            globals,
            kernels,
            function_index: HashMap::new(),
        };
        module.rebuild_index()?;
        Ok(module)
    }

    fn rebuild_index(&mut self) -> ModuleResult<()> {
        self.function_index.clear();
        for (i, function) in self.functions.iter().enumerate() {
            let id = FunctionId::new(i as u32);
            if self.function_index.insert(function.name.clone(), id).is_some() {
                return Err(ModuleError::DuplicateSymbol(function.name.clone()));
            }
        }
        Ok(())
    }

    pub fn function(&self, id: FunctionId) -> Option<&Function> {
        self.functions.get(id.index())
    }

    pub fn function_by_name(&self, name: &str) -> Option<FunctionId> {
        self.function_index.get(name).copied()
    }

    pub fn global(&self, id: GlobalId) -> Option<&GlobalVariable> {
        self.globals.get(id.index())
    }

    pub fn kernel(&self, name: &str) -> Option<&KernelInfo> {
        self.kernels.iter().find(|k| k.name == name)
    }

    pub fn instruction(&self, at: InstructionRef) -> Option<&Instruction> {
        self.function(at.function)?.instruction(at.block, at.index)
    }

    // ============================================================================================
    // Serialization
    // ============================================================================================

    /// Encode as magic, version and bincode payload.
    ///
    /// ```
    /// use clgrind_core::ir::Module;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let bytes = Module::new("empty").to_bytes()?;
    /// assert_eq!(&bytes[..4], b"CLGM");
    /// let module = Module::from_bytes(&bytes)?;
    /// assert_eq!(module.name, "empty");
    /// # Ok(())
    /// # }
    /// ```
    pub fn to_bytes(&self) -> ModuleResult<Vec<u8>> {
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(&MODULE_MAGIC);
        bytes.extend_from_slice(&MODULE_VERSION.to_le_bytes());
        bincode::serialize_into(&mut bytes, self)?;
        Ok(bytes)
    }

    /// Decode bytes produced by [`Module::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> ModuleResult<Self> {
        if bytes.len() < 8 || bytes[..4] != MODULE_MAGIC {
            return Err(ModuleError::BadMagic);
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != MODULE_VERSION {
            return Err(ModuleError::UnsupportedVersion {
                found: version,
                expected: MODULE_VERSION,
            });
        }
        let mut module: Module = bincode::deserialize(&bytes[8..])?;
        module.rebuild_index()?;
        Ok(module)
    }

    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> ModuleResult<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> ModuleResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    // ============================================================================================
    // Validation
    // ============================================================================================

    /// Check structural well-formedness of every function and kernel.
    pub fn validate(&self) -> ModuleResult<()> {
        for function in &self.functions {
            validate_function(function)?;
        }
        for kernel in &self.kernels {
            let function = self.function(kernel.function).ok_or_else(|| ModuleError::Invalid {
                function: kernel.name.clone(),
                reason: format!("kernel refers to missing function {}", kernel.function),
            })?;
            if function.params.len() != kernel.args.len() {
                return Err(ModuleError::Invalid {
                    function: kernel.name.clone(),
                    reason: format!(
                        "{} parameters but {} argument descriptors",
                        function.params.len(),
                        kernel.args.len()
                    ),
                });
            }
        }
        Ok(())
    }
}

fn validate_function(function: &Function) -> ModuleResult<()> {
    let invalid = |reason: String| ModuleError::Invalid {
        function: function.name.clone(),
        reason,
    };

    if function.blocks.is_empty() {
        return Err(invalid("function has no blocks".into()));
    }
    if function.value_types.len() < function.params.len() {
        return Err(invalid("missing parameter value types".into()));
    }

    let mut defined = vec![false; function.value_types.len()];
    for slot in defined.iter_mut().take(function.params.len()) {
        *slot = true;
    }

    for (b, block) in function.blocks.iter().enumerate() {
        let Some((last, body)) = block.instructions.split_last() else {
            return Err(invalid(format!("block {b} is empty")));
        };
        if !last.opcode.is_terminator() {
            return Err(invalid(format!("block {b} does not end in a terminator")));
        }
        let mut leading_phis = true;
        for (i, inst) in body.iter().enumerate() {
            if inst.opcode.is_terminator() {
                return Err(invalid(format!("terminator in the middle of block {b} at {i}")));
            }
            if inst.opcode.is_phi() && !leading_phis {
                return Err(invalid(format!("phi after non-phi in block {b} at {i}")));
            }
            leading_phis &= inst.opcode.is_phi();
        }
        for inst in &block.instructions {
            for target in inst.opcode.successors() {
                if target.index() >= function.blocks.len() {
                    return Err(invalid(format!("branch to missing block {target}")));
                }
            }
            if let Opcode::Phi { incoming } = &inst.opcode {
                if let Some((_, pred)) = incoming.iter().find(|(_, pred)| pred.index() >= function.blocks.len()) {
                    return Err(invalid(format!("phi names missing predecessor {pred}")));
                }
            }
            for operand in inst.opcode.operands() {
                if let Operand::Value(id) = operand {
                    if id.index() >= function.value_types.len() {
                        return Err(invalid(format!("use of undeclared value {id}")));
                    }
                }
            }
            if let Some(result) = inst.result {
                let slot = defined
                    .get_mut(result.index())
                    .ok_or_else(|| invalid(format!("result {result} has no declared type")))?;
                if *slot {
                    return Err(invalid(format!("value {result} defined more than once")));
                }
                *slot = true;
            }
        }
    }

    if let Some(missing) = defined.iter().position(|d| !d) {
        return Err(invalid(format!("value %{missing} is never defined")));
    }
    Ok(())
}

// ================================================================================================
// Tests
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Constant;

    fn tiny_function() -> Function {
        let mut entry = BasicBlock::new("entry");
        entry.instructions.push(Instruction::new(
            Opcode::Binary {
                op: super::super::BinaryOp::Add,
                lhs: Operand::Value(ValueId(0)),
                rhs: Operand::Const(Constant::i32(1)),
                flags: Default::default(),
            },
            Some(ValueId(1)),
            Type::I32,
        ));
        entry.instructions.push(Instruction::new(
            Opcode::Ret {
                value: Some(Operand::Value(ValueId(1))),
            },
            None,
            Type::Void,
        ));
        Function {
            name: "inc".into(),
            params: vec![Param {
                name: "x".into(),
                ty: Type::I32,
            }],
            return_type: Type::I32,
            blocks: vec![entry],
            value_types: vec![Type::I32, Type::I32],
        }
    }

    #[test]
    fn test_module_roundtrip() {
        let module = Module::from_parts("m", vec![tiny_function()], vec![], vec![]).unwrap();
        let bytes = module.to_bytes().unwrap();
        let decoded = Module::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, module);
        assert_eq!(decoded.function_by_name("inc"), Some(FunctionId(0)));
    }

    #[test]
    fn test_bad_magic_and_version() {
        assert!(matches!(Module::from_bytes(b"NOPE0000"), Err(ModuleError::BadMagic)));
        let mut bytes = Module::new("m").to_bytes().unwrap();
        bytes[4] = 9;
        assert!(matches!(
            Module::from_bytes(&bytes),
            Err(ModuleError::UnsupportedVersion { found: 9, .. })
        ));
    }

    #[test]
    fn test_validate_accepts_wellformed() {
        let module = Module::from_parts("m", vec![tiny_function()], vec![], vec![]).unwrap();
        assert!(module.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_terminator() {
        let mut function = tiny_function();
        function.blocks[0].instructions.pop();
        let module = Module::from_parts("m", vec![function], vec![], vec![]).unwrap();
        assert!(matches!(module.validate(), Err(ModuleError::Invalid { .. })));
    }

    #[test]
    fn test_validate_rejects_double_definition() {
        let mut function = tiny_function();
        function.blocks[0].instructions[0].result = Some(ValueId(0));
        let module = Module::from_parts("m", vec![function], vec![], vec![]).unwrap();
        assert!(module.validate().is_err());
    }

    #[test]
    fn test_duplicate_function_names() {
        let result = Module::from_parts("m", vec![tiny_function(), tiny_function()], vec![], vec![]);
        assert!(matches!(result, Err(ModuleError::DuplicateSymbol(_))));
    }

    #[test]
    fn test_file_roundtrip() {
        let module = Module::from_parts("m", vec![tiny_function()], vec![], vec![]).unwrap();
        let path = std::env::temp_dir().join(format!("clgrind-module-{}.clgm", std::process::id()));
        module.save_to_file(&path).unwrap();
        let loaded = Module::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.functions.len(), 1);
    }
}
