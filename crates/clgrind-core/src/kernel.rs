//! Kernel entry points with bound arguments.

use crate::error::{Result, SimError};
use crate::ir::{AddressSpace, FunctionId, KernelInfo, Module, Type};
use crate::value::TypedValue;
use std::sync::Arc;

/// Value bound to one kernel parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    /// By-value argument. For private-pointer parameters the payload is
    /// copied into a fresh private buffer of every work-item.
    Scalar(TypedValue),
    /// Address of a global or constant buffer (0 for a null pointer)
    Buffer(u64),
    /// Size in bytes of a per-work-group local allocation
    Local(u64),
}

/// A kernel and its argument bindings.
#[derive(Debug, Clone)]
pub struct Kernel {
    module: Arc<Module>,
    info: KernelInfo,
    args: Vec<Option<ArgValue>>,
}

impl Kernel {
    pub fn new(module: Arc<Module>, name: &str) -> Result<Self> {
        let info = module
            .kernel(name)
            .cloned()
            .ok_or_else(|| SimError::KernelNotFound(name.to_string()))?;
        if module.function(info.function).is_none() {
            return Err(SimError::KernelNotFound(name.to_string()));
        }
        let args = vec![None; info.args.len()];
        Ok(Self { module, info, args })
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    pub fn info(&self) -> &KernelInfo {
        &self.info
    }

    pub fn function(&self) -> FunctionId {
        self.info.function
    }

    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    pub fn arg(&self, index: usize) -> Option<&ArgValue> {
        self.args.get(index)?.as_ref()
    }

    fn param_type(&self, index: usize) -> Option<&Type> {
        let function = self.module.function(self.info.function)?;
        function.params.get(index).map(|p| &p.ty)
    }

    /// Bind argument `index`, checking it against the kernel's metadata.
    pub fn set_arg(&mut self, index: usize, value: ArgValue) -> Result<()> {
        let info = self
            .info
            .args
            .get(index)
            .ok_or_else(|| SimError::invalid_argument(index, "kernel has no such argument"))?;
        let param = self
            .param_type(index)
            .ok_or_else(|| SimError::invalid_argument(index, "kernel function has no such parameter"))?;

        match (&value, info.space) {
            (ArgValue::Buffer(_), AddressSpace::Global | AddressSpace::Constant) => {}
            (ArgValue::Local(size), AddressSpace::Local) => {
                if *size == 0 {
                    return Err(SimError::invalid_argument(index, "local argument size must be non-zero"));
                }
            }
            (ArgValue::Scalar(payload), AddressSpace::Private) => {
                if !param.is_pointer() && payload.byte_len() as u64 != param.size_bytes() {
                    return Err(SimError::invalid_argument(
                        index,
                        format!("expected {} bytes, got {}", param.size_bytes(), payload.byte_len()),
                    ));
                }
                if param.is_pointer() && payload.byte_len() as u64 != info.size {
                    return Err(SimError::invalid_argument(
                        index,
                        format!("expected {} bytes, got {}", info.size, payload.byte_len()),
                    ));
                }
            }
            (other, space) => {
                return Err(SimError::invalid_argument(
                    index,
                    format!("{other:?} cannot bind a {space} parameter"),
                ));
            }
        }

        self.args[index] = Some(value);
        Ok(())
    }

    /// Fail if any argument is unbound.
    pub fn validate_args(&self) -> Result<()> {
        match self.args.iter().position(Option::is_none) {
            Some(index) => Err(SimError::invalid_argument(index, "argument not set")),
            None => Ok(()),
        }
    }

    /// Local bytes each work-group needs for arguments and program-scope
    /// local variables.
    pub fn local_memory_size(&self) -> u64 {
        let args: u64 = self
            .args
            .iter()
            .filter_map(|a| match a {
                Some(ArgValue::Local(size)) => Some(*size),
                _ => None,
            })
            .sum();
        let globals: u64 = self
            .module
            .globals
            .iter()
            .filter(|g| g.space == AddressSpace::Local)
            .map(|g| g.ty.size_bytes())
            .sum();
        args + globals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, KernelArgInfo, ModuleBuilder};

    fn module() -> Arc<Module> {
        let mut f = FunctionBuilder::new(
            "k",
            &[
                ("out", Type::Pointer(AddressSpace::Global)),
                ("scratch", Type::Pointer(AddressSpace::Local)),
                ("n", Type::I32),
            ],
            Type::Void,
        );
        f.ret_void();
        let mut m = ModuleBuilder::new("m");
        m.add_kernel(
            f.finish(),
            vec![
                KernelArgInfo::pointer("out", "int*", AddressSpace::Global),
                KernelArgInfo::pointer("scratch", "int*", AddressSpace::Local),
                KernelArgInfo::scalar("n", "int", 4),
            ],
            true,
        );
        Arc::new(m.build().unwrap())
    }

    #[test]
    fn test_unknown_kernel() {
        assert!(matches!(Kernel::new(module(), "nope"), Err(SimError::KernelNotFound(_))));
    }

    #[test]
    fn test_arg_kinds_are_checked() {
        let mut kernel = Kernel::new(module(), "k").unwrap();
        assert!(kernel.set_arg(0, ArgValue::Local(16)).is_err());
        assert!(kernel.set_arg(2, ArgValue::Scalar(TypedValue::from_uint(8, 1))).is_err());
        assert!(kernel.set_arg(3, ArgValue::Buffer(0)).is_err());
        assert!(kernel.validate_args().is_err());

        kernel.set_arg(0, ArgValue::Buffer(0)).unwrap();
        kernel.set_arg(1, ArgValue::Local(64)).unwrap();
        kernel.set_arg(2, ArgValue::Scalar(TypedValue::from_uint(4, 3))).unwrap();
        assert!(kernel.validate_args().is_ok());
        assert_eq!(kernel.local_memory_size(), 64);
    }
}
