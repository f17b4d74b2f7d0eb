//! Host-side simulator for OpenCL-style compute kernels
//!
//! This crate provides:
//! - **Kernel IR**: SSA modules, a builder, and a binary module format
//! - **Memory**: buffer-addressed memories for the four address spaces
//! - **Interpreter**: work-items, work-groups and the builtin library
//! - **Plugin bus**: observers notified of every execution and memory event
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Context                          │
//! │      (global memory, plugin registry, diagnostics)      │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ run_kernel
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                   KernelInvocation                       │
//! │    (launch validation, program globals, worker pool)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┬─────────────┐
//!         ▼             ▼             ▼             ▼
//!   ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌──────────┐
//!   │WorkGroup │  │WorkGroup │  │WorkGroup │  │WorkGroup │
//!   │  local   │  │  local   │  │  local   │  │  local   │
//!   │ barriers │  │ barriers │  │ barriers │  │ barriers │
//!   └────┬─────┘  └──────────┘  └──────────┘  └──────────┘
//!        ▼
//!   WorkItem × N  (private memory, call stack, interpreter)
//! ```
//!
//! # Usage
//!
//! ```rust
//! use clgrind_core::ir::{AddressSpace, BinaryOp, FunctionBuilder, KernelArgInfo, ModuleBuilder, Type};
//! use clgrind_core::{ArgValue, Context, Kernel, LaunchConfig, MemFlags, SimulatorConfig};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // out[i] = i + i
//! let mut f = FunctionBuilder::new("double_ids", &[("out", Type::Pointer(AddressSpace::Global))], Type::Void);
//! let gid = f.call("get_global_id", Type::I64, vec![f.const_i32(0)]);
//! let doubled = f.binary(BinaryOp::Add, gid.clone(), gid.clone());
//! let ptr = f.gep(Type::I64, f.param(0), vec![gid]);
//! f.store(doubled, ptr);
//! f.ret_void();
//!
//! let mut module = ModuleBuilder::new("example");
//! module.add_kernel(f.finish(), vec![KernelArgInfo::pointer("out", "long*", AddressSpace::Global)], false);
//! let module = Arc::new(module.build()?);
//!
//! let context = Context::new(SimulatorConfig::serial());
//! let out = context.create_buffer(8 * 4, MemFlags::empty())?;
//! let mut kernel = Kernel::new(module, "double_ids")?;
//! kernel.set_arg(0, ArgValue::Buffer(out))?;
//!
//! let summary = context.run_kernel(&kernel, LaunchConfig::new_1d(4, 2))?;
//! assert_eq!(summary.work_items_executed, 4);
//!
//! let bytes = context.read_buffer(out, 8 * 4)?;
//! assert_eq!(bytes[8 * 3], 6);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod diagnostic;
pub mod error;
mod flags;
pub mod invocation;
pub mod ir;
pub mod kernel;
pub mod launch;
pub mod memory;
pub mod plugin;
pub mod value;
pub mod workgroup;
pub mod workitem;

pub use config::SimulatorConfig;
pub use context::{Context, Mapping};
pub use diagnostic::{Diagnostic, DiagnosticKind, DiagnosticSink, EntityCoords, Severity};
pub use error::{ErrorClass, Result, SimError};
pub use invocation::{InvocationSummary, KernelInvocation};
pub use kernel::{ArgValue, Kernel};
pub use launch::{LaunchConfig, Size3};
pub use memory::{AtomicOp, MapFlags, MemFlags, Memory};
pub use plugin::{Allocation, Capabilities, Entity, Plugin, PluginRegistry};
pub use value::TypedValue;
pub use workgroup::{AsyncCopy, FenceFlags, GroupStats, WorkGroup};
pub use workitem::{WorkItem, WorkItemState};
