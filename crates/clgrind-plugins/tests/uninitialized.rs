//! Uninitialized-value tracking through whole kernels

mod common;

use clgrind_core::ir::{BinaryOp, BlockId, CastOp, Constant, FunctionBuilder, FunctionId, InstructionRef, IntPredicate, Operand, Type};
use clgrind_core::{ArgValue, DiagnosticKind, LaunchConfig, MemFlags, Severity};
use clgrind_plugins::shadow::{DEFINED, POISONED};
use common::*;
use proptest::prelude::*;

#[test]
fn test_uninitialized_global_read_reported_once() {
    let mut f = FunctionBuilder::new("read", &[("x", GLOBAL)], Type::Void);
    f.load(Type::I32, f.param(0));
    f.ret_void();
    let mut kernel = kernel(f.finish(), vec![global_ptr("x")]);

    let (context, _, collector) = context(uninitialized());
    let x = context.create_buffer(4, MemFlags::empty()).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(x)).unwrap();
    context.run_kernel(&kernel, LaunchConfig::new_1d(1, 1)).unwrap();

    let found = collector.of_kind(DiagnosticKind::UninitializedValue);
    assert_eq!(found.len(), 1);
    assert_eq!(collector.len(), 1);
    assert_eq!(found[0].severity, Severity::Warning);
    assert_eq!(
        found[0].instruction,
        Some(InstructionRef::new(FunctionId::new(0), BlockId::new(0), 0))
    );
    assert_eq!(
        found[0].message,
        format!("Uninitialized value read from global memory address {x:#x}")
    );
}

#[test]
fn test_host_initialized_data_is_clean() {
    let mut f = FunctionBuilder::new("vec_add", &[("a", GLOBAL), ("b", GLOBAL), ("out", GLOBAL)], Type::Void);
    let gid = global_id(&mut f);
    let pa = f.gep(Type::I32, f.param(0), vec![gid.clone()]);
    let a = f.load(Type::I32, pa);
    let pb = f.gep(Type::I32, f.param(1), vec![gid.clone()]);
    let b = f.load(Type::I32, pb);
    let sum = f.binary(BinaryOp::Add, a, b);
    let pout = f.gep(Type::I32, f.param(2), vec![gid]);
    f.store(sum, pout);
    f.ret_void();
    let mut kernel = kernel(f.finish(), vec![global_ptr("a"), global_ptr("b"), global_ptr("out")]);

    let (context, installed, collector) = context(uninitialized());
    let a = context.create_buffer_with_data(&u32_bytes(&[1, 2, 3, 4]), MemFlags::READ_ONLY).unwrap();
    let b = context.create_buffer(16, MemFlags::READ_ONLY).unwrap();
    context.write_buffer(b, &u32_bytes(&[10; 4])).unwrap();
    let out = context.create_buffer(16, MemFlags::WRITE_ONLY).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(a)).unwrap();
    kernel.set_arg(1, ArgValue::Buffer(b)).unwrap();
    kernel.set_arg(2, ArgValue::Buffer(out)).unwrap();
    context.run_kernel(&kernel, LaunchConfig::new_1d(4, 2)).unwrap();

    assert!(collector.is_empty());
    let tracker = installed.uninitialized.unwrap();
    let shadow = tracker.shadow_of(context.global_memory(), out, 16).unwrap();
    assert!(shadow.iter().all(|b| *b == DEFINED));
}

#[test]
fn test_branch_on_uninitialized_private_value() {
    let mut f = FunctionBuilder::new("branch", &[], Type::Void);
    let then = f.block("then");
    let done = f.block("done");
    let slot = f.alloca(Type::I32);
    let value = f.load(Type::I32, slot);
    let zero = f.icmp(IntPredicate::Eq, value, f.const_i32(0));
    f.cond_br(zero, then, done);
    f.switch_to(then);
    f.br(done);
    f.switch_to(done);
    f.ret_void();
    let kernel = kernel(f.finish(), vec![]);

    let (context, _, collector) = context(uninitialized());
    context.run_kernel(&kernel, LaunchConfig::new_1d(1, 1)).unwrap();

    let found = collector.of_kind(DiagnosticKind::UninitializedValue);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].message, "Uninitialized value used as a branch condition");
}

#[test]
fn test_private_store_defines_value() {
    let mut f = FunctionBuilder::new("defined", &[("out", GLOBAL)], Type::Void);
    let slot = f.alloca(Type::I32);
    f.store(f.const_i32(9), slot.clone());
    let value = f.load(Type::I32, slot);
    f.store(value, f.param(0));
    f.ret_void();
    let mut kernel = kernel(f.finish(), vec![global_ptr("out")]);

    let (context, _, collector) = context(uninitialized());
    let out = context.create_buffer(4, MemFlags::empty()).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(out)).unwrap();
    context.run_kernel(&kernel, LaunchConfig::new_1d(1, 1)).unwrap();
    assert!(collector.is_empty());
}

#[test]
fn test_memcpy_carries_shadow_silently() {
    let mut f = FunctionBuilder::new("copy", &[("dst", GLOBAL), ("src", GLOBAL)], Type::Void);
    f.call_void(
        "llvm.memcpy.p1.p1.i64",
        vec![f.param(0), f.param(1), f.const_i64(8), f.const_bool(false)],
    );
    f.ret_void();
    let mut kernel = kernel(f.finish(), vec![global_ptr("dst"), global_ptr("src")]);

    let (context, installed, collector) = context(uninitialized());
    let dst = context.create_buffer_with_data(&[0; 8], MemFlags::empty()).unwrap();
    let src = context.create_buffer(8, MemFlags::empty()).unwrap();
    context.write_buffer(src, &[1, 2, 3, 4]).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(dst)).unwrap();
    kernel.set_arg(1, ArgValue::Buffer(src)).unwrap();
    context.run_kernel(&kernel, LaunchConfig::new_1d(1, 1)).unwrap();

    assert!(collector.is_empty());
    let tracker = installed.uninitialized.unwrap();
    let shadow = tracker.shadow_of(context.global_memory(), dst, 8).unwrap();
    assert_eq!(shadow, vec![DEFINED, DEFINED, DEFINED, DEFINED, POISONED, POISONED, POISONED, POISONED]);
}

#[test]
fn test_pointer_built_from_undefined_offset() {
    let mut f = FunctionBuilder::new("deref", &[("x", GLOBAL)], Type::Void);
    let address = f.cast(CastOp::PtrToInt, f.param(0), Type::I64);
    let address = f.binary(BinaryOp::Add, address, Operand::Const(Constant::undef(Type::I64)));
    let pointer = f.cast(CastOp::IntToPtr, address, GLOBAL);
    f.load(Type::I32, pointer);
    f.ret_void();
    let mut kernel = kernel(f.finish(), vec![global_ptr("x")]);

    let (context, _, collector) = context(uninitialized());
    let x = context.create_buffer_with_data(&u32_bytes(&[5]), MemFlags::empty()).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(x)).unwrap();
    context.run_kernel(&kernel, LaunchConfig::new_1d(1, 1)).unwrap();

    let found = collector.of_kind(DiagnosticKind::UninitializedValue);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].message, "Uninitialized value used as a pointer");
}

#[test]
fn test_undefined_gep_index_poisons_the_pointer() {
    let mut f = FunctionBuilder::new("lookup", &[("x", GLOBAL)], Type::Void);
    let pointer = f.gep(Type::I32, f.param(0), vec![Operand::Const(Constant::undef(Type::I64))]);
    f.load(Type::I32, pointer);
    f.ret_void();
    let mut kernel = kernel(f.finish(), vec![global_ptr("x")]);

    let (context, _, collector) = context(uninitialized());
    let x = context.create_buffer_with_data(&u32_bytes(&[5, 6]), MemFlags::empty()).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(x)).unwrap();
    context.run_kernel(&kernel, LaunchConfig::new_1d(1, 1)).unwrap();

    let messages: Vec<String> = collector
        .of_kind(DiagnosticKind::UninitializedValue)
        .into_iter()
        .map(|d| d.message)
        .collect();
    assert_eq!(
        messages,
        vec![
            "Uninitialized value used as an index".to_string(),
            "Uninitialized value used as a pointer".to_string(),
        ]
    );
}

fn operand(poisoned: bool, value: i32) -> Operand {
    if poisoned {
        Operand::Const(Constant::undef(Type::I32))
    } else {
        Operand::Const(Constant::i32(value))
    }
}

const OPS: [BinaryOp; 6] = [
    BinaryOp::Add,
    BinaryOp::Sub,
    BinaryOp::Mul,
    BinaryOp::And,
    BinaryOp::Or,
    BinaryOp::Xor,
];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// The result of an operation is poisoned exactly when an operand is.
    #[test]
    fn prop_poison_is_or_of_operands(
        op in 0..OPS.len(),
        lhs_poisoned in any::<bool>(),
        rhs_poisoned in any::<bool>(),
        lhs in any::<i32>(),
        rhs in any::<i32>(),
    ) {
        let mut f = FunctionBuilder::new("combine", &[("out", GLOBAL)], Type::Void);
        let result = f.binary(OPS[op], operand(lhs_poisoned, lhs), operand(rhs_poisoned, rhs));
        f.store(result, f.param(0));
        f.ret_void();
        let mut kernel = kernel(f.finish(), vec![global_ptr("out")]);

        let (context, installed, collector) = context(uninitialized());
        let out = context.create_buffer(4, MemFlags::empty()).unwrap();
        kernel.set_arg(0, ArgValue::Buffer(out)).unwrap();
        context.run_kernel(&kernel, LaunchConfig::new_1d(1, 1)).unwrap();

        let poisoned = lhs_poisoned || rhs_poisoned;
        let expected = if poisoned { POISONED } else { DEFINED };
        let tracker = installed.uninitialized.unwrap();
        let shadow = tracker.shadow_of(context.global_memory(), out, 4).unwrap();
        prop_assert!(shadow.iter().all(|b| *b == expected));
        prop_assert_eq!(collector.count(DiagnosticKind::UninitializedValue), usize::from(poisoned));
    }
}
