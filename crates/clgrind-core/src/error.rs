//! Error types for simulation
//!
//! Every fatal condition raised while simulating a kernel is a [`SimError`].
//! Uninitialized-value use and data races never appear here: analyses report
//! them as diagnostics and execution continues.

use crate::ir::{AddressSpace, ModuleError};
use std::fmt;

/// Result type for simulator operations
pub type Result<T> = std::result::Result<T, SimError>;

/// Coarse classification of a [`SimError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    InvalidAccess,
    UndefinedBehaviour,
    Divergence,
    Execution,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorClass::InvalidAccess => "invalid memory access",
            ErrorClass::UndefinedBehaviour => "undefined behaviour",
            ErrorClass::Divergence => "divergence",
            ErrorClass::Execution => "execution error",
        })
    }
}

/// Errors that can occur while simulating a kernel
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    // ============================================================================================
    // Invalid Access
    // ============================================================================================
    /// Address does not decode to a live buffer, or runs past its end
    #[error("invalid {space} access of {size} bytes at {address:#x}")]
    InvalidAccess {
        space: AddressSpace,
        address: u64,
        size: u64,
    },

    /// Kernel read from a buffer created write-only
    #[error("read from write-only {space} buffer at {address:#x}")]
    ReadFromWriteOnly { space: AddressSpace, address: u64 },

    /// Kernel write to a buffer created read-only
    #[error("write to read-only {space} buffer at {address:#x}")]
    WriteToReadOnly { space: AddressSpace, address: u64 },

    /// Deallocation of an address that is not the start of a live buffer
    #[error("invalid deallocation of {space} address {address:#x}")]
    InvalidDeallocation { space: AddressSpace, address: u64 },

    /// Buffer could not be allocated
    #[error("failed to allocate {size} bytes of {space} memory: {reason}")]
    AllocationFailed {
        space: AddressSpace,
        size: u64,
        reason: String,
    },

    /// Atomic operation on a misaligned address
    #[error("unaligned {size}-byte atomic at {address:#x}")]
    UnalignedAtomic { address: u64, size: u64 },

    // ============================================================================================
    // Undefined Behaviour
    // ============================================================================================
    /// Integer division or remainder by zero
    #[error("integer division by zero")]
    DivisionByZero,

    /// Signed division of the minimum value by -1
    #[error("signed integer division overflow")]
    DivisionOverflow,

    /// Overflow on an instruction flagged `nsw` or `nuw`
    #[error("{kind} overflow in {op}")]
    ArithmeticOverflow { op: &'static str, kind: &'static str },

    /// Float to int conversion of a value outside the target range
    #[error("float-to-int conversion of {value} out of range for {target}")]
    ConversionOutOfRange { value: f64, target: String },

    /// `unreachable` instruction executed
    #[error("unreachable instruction executed")]
    Unreachable,

    /// `llvm.trap` called
    #[error("llvm.trap called")]
    Trap,

    // ============================================================================================
    // Divergence
    // ============================================================================================
    /// Work-items of one group disagree on reaching a barrier
    #[error("barrier divergence: {0}")]
    BarrierDivergence(String),

    /// Work-items of one group disagree on an async copy or its wait
    #[error("work-group divergence detected (async copy): {0}")]
    AsyncCopyDivergence(String),

    // ============================================================================================
    // Execution
    // ============================================================================================
    /// Call to a function that is neither defined nor a builtin
    #[error("undefined function: {0}")]
    UndefinedFunction(String),

    /// Instruction that cannot be executed as written
    #[error("malformed instruction: {0}")]
    MalformedInstruction(String),

    /// Kernel name missing from the module
    #[error("kernel not found: {0}")]
    KernelNotFound(String),

    /// Kernel argument missing or of the wrong kind
    #[error("invalid argument {index}: {reason}")]
    InvalidArgument { index: usize, reason: String },

    /// Launch geometry rejected before execution
    #[error("invalid launch configuration: {0}")]
    InvalidLaunch(String),

    /// A kernel is already running on this context
    #[error("another kernel invocation is already running on this context")]
    InvocationInProgress,

    /// `wait_group_events` on an event that is not pending
    #[error("invalid wait event: {0}")]
    InvalidWaitEvent(u64),

    /// Worker thread pool could not be created
    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),

    /// Module loading or validation failed
    #[error("module error: {0}")]
    Module(#[from] ModuleError),
}

impl SimError {
    /// Which part of the error taxonomy this belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            SimError::InvalidAccess { .. }
            | SimError::ReadFromWriteOnly { .. }
            | SimError::WriteToReadOnly { .. }
            | SimError::InvalidDeallocation { .. }
            | SimError::AllocationFailed { .. }
            | SimError::UnalignedAtomic { .. } => ErrorClass::InvalidAccess,

            SimError::DivisionByZero
            | SimError::DivisionOverflow
            | SimError::ArithmeticOverflow { .. }
            | SimError::ConversionOutOfRange { .. }
            | SimError::Unreachable
            | SimError::Trap => ErrorClass::UndefinedBehaviour,

            SimError::BarrierDivergence(_) | SimError::AsyncCopyDivergence(_) => ErrorClass::Divergence,

            SimError::UndefinedFunction(_)
            | SimError::MalformedInstruction(_)
            | SimError::KernelNotFound(_)
            | SimError::InvalidArgument { .. }
            | SimError::InvalidLaunch(_)
            | SimError::InvocationInProgress
            | SimError::InvalidWaitEvent(_)
            | SimError::WorkerPool(_)
            | SimError::Module(_) => ErrorClass::Execution,
        }
    }

    /// Create a malformed instruction error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedInstruction(msg.into())
    }

    /// Create an invalid launch error
    pub fn invalid_launch(msg: impl Into<String>) -> Self {
        Self::InvalidLaunch(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(index: usize, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            index,
            reason: reason.into(),
        }
    }

    pub(crate) fn overflow(op: &'static str, signed: bool) -> Self {
        Self::ArithmeticOverflow {
            op,
            kind: if signed { "signed" } else { "unsigned" },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let oob = SimError::InvalidAccess {
            space: AddressSpace::Global,
            address: 0x10,
            size: 4,
        };
        assert_eq!(oob.class(), ErrorClass::InvalidAccess);
        assert_eq!(SimError::DivisionByZero.class(), ErrorClass::UndefinedBehaviour);
        assert_eq!(SimError::overflow("add", true).class(), ErrorClass::UndefinedBehaviour);
        assert_eq!(SimError::BarrierDivergence("x".into()).class(), ErrorClass::Divergence);
        assert_eq!(SimError::UndefinedFunction("foo".into()).class(), ErrorClass::Execution);
    }

    #[test]
    fn test_error_messages() {
        let err = SimError::InvalidAccess {
            space: AddressSpace::Local,
            address: 0x1_0000_0004,
            size: 8,
        };
        assert_eq!(err.to_string(), "invalid local access of 8 bytes at 0x100000004");
        assert_eq!(SimError::overflow("mul", false).to_string(), "unsigned overflow in mul");
    }
}
