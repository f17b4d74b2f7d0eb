//! Race detector scenarios
//!
//! Kernels are built with the IR builder and run serially, so the order in
//! which work-items touch memory is fixed.

mod common;

use clgrind_core::ir::{FunctionBuilder, IntPredicate, Type};
use clgrind_core::{ArgValue, DiagnosticKind, EntityCoords, LaunchConfig, MemFlags, Severity, Size3};
use clgrind_plugins::PluginConfig;
use common::*;

/// Item 0 writes `x[0]`, item 1 reads it, with an optional global barrier
/// between the two accesses.
fn write_then_read(barrier: bool) -> clgrind_core::Kernel {
    let mut f = FunctionBuilder::new("write_read", &[("x", GLOBAL)], Type::Void);
    let write = f.block("write");
    let sync = f.block("sync");
    let read = f.block("read");
    let done = f.block("done");

    let gid = global_id(&mut f);
    let first = f.icmp(IntPredicate::Eq, gid.clone(), f.const_i64(0));
    f.cond_br(first.clone(), write, sync);

    f.switch_to(write);
    f.store(f.const_i32(7), f.param(0));
    f.br(sync);

    f.switch_to(sync);
    if barrier {
        f.barrier(2);
    }
    let second = f.icmp(IntPredicate::Eq, gid, f.const_i64(1));
    f.cond_br(second, read, done);

    f.switch_to(read);
    f.load(Type::I32, f.param(0));
    f.br(done);

    f.switch_to(done);
    f.ret_void();
    kernel(f.finish(), vec![global_ptr("x")])
}

fn run_write_then_read(barrier: bool) -> usize {
    let (context, _, collector) = context(races());
    let mut kernel = write_then_read(barrier);
    let x = context.create_buffer(4, MemFlags::empty()).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(x)).unwrap();
    context.run_kernel(&kernel, LaunchConfig::new_1d(2, 2)).unwrap();
    collector.count(DiagnosticKind::DataRace)
}

#[test]
fn test_unsynchronized_write_read_races_once() {
    assert_eq!(run_write_then_read(false), 1);
}

#[test]
fn test_global_barrier_orders_write_read() {
    assert_eq!(run_write_then_read(true), 0);
}

#[test]
fn test_race_diagnostic_details() {
    let (context, _, collector) = context(races());
    let mut kernel = write_then_read(false);
    let x = context.create_buffer(4, MemFlags::empty()).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(x)).unwrap();
    context.run_kernel(&kernel, LaunchConfig::new_1d(2, 2)).unwrap();

    let races = collector.of_kind(DiagnosticKind::DataRace);
    assert_eq!(races.len(), 1);
    let race = &races[0];
    assert_eq!(race.severity, Severity::Error);
    assert_eq!(race.kernel.as_deref(), Some("write_read"));
    assert!(race.message.starts_with("Read-write data race at global memory address"));
    assert!(race.message.ends_with(&format!("{x:#x}")));
    assert_eq!(race.related.len(), 1);
    assert!(race.instruction.is_some());
    assert_eq!(
        race.entity,
        Some(EntityCoords::WorkItem {
            global: Size3::new(1, 0, 0),
            local: Size3::new(1, 0, 0),
            group: Size3::ZERO,
        })
    );
}

/// Item 0 of each group writes `scratch[0]`, item 1 reads it.
fn local_write_read(barrier: bool) -> usize {
    let mut f = FunctionBuilder::new("local_share", &[("scratch", LOCAL)], Type::Void);
    let write = f.block("write");
    let sync = f.block("sync");
    let read = f.block("read");
    let done = f.block("done");

    let lid = local_id(&mut f);
    let first = f.icmp(IntPredicate::Eq, lid.clone(), f.const_i64(0));
    f.cond_br(first, write, sync);

    f.switch_to(write);
    f.store(f.const_i32(3), f.param(0));
    f.br(sync);

    f.switch_to(sync);
    if barrier {
        f.barrier(1);
    }
    let second = f.icmp(IntPredicate::Eq, lid, f.const_i64(1));
    f.cond_br(second, read, done);

    f.switch_to(read);
    f.load(Type::I32, f.param(0));
    f.br(done);

    f.switch_to(done);
    f.ret_void();
    let mut kernel = kernel(f.finish(), vec![local_ptr("scratch")]);

    let (context, _, collector) = context(races());
    kernel.set_arg(0, ArgValue::Local(16)).unwrap();
    context.run_kernel(&kernel, LaunchConfig::new_1d(16, 4)).unwrap();
    collector.count(DiagnosticKind::DataRace)
}

#[test]
fn test_local_race_reported_per_group() {
    assert_eq!(local_write_read(false), 4);
}

#[test]
fn test_local_barrier_orders_local_accesses() {
    assert_eq!(local_write_read(true), 0);
}

/// Both items of one group store `value` to `x[0]`.
fn same_store(uniform_writes_safe: bool, same_value: bool) -> usize {
    let mut f = FunctionBuilder::new("same_store", &[("x", GLOBAL)], Type::Void);
    let value = if same_value {
        f.const_i32(5)
    } else {
        let gid = global_id(&mut f);
        f.cast(clgrind_core::ir::CastOp::Trunc, gid, Type::I32)
    };
    f.store(value, f.param(0));
    f.ret_void();
    let mut kernel = kernel(f.finish(), vec![global_ptr("x")]);

    let config = PluginConfig {
        uniform_writes_safe,
        ..races()
    };
    let (context, installed, collector) = context(config);
    assert_eq!(
        installed.race_detector.as_ref().map(|r| r.uniform_writes_safe()),
        Some(uniform_writes_safe)
    );
    let x = context.create_buffer(4, MemFlags::empty()).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(x)).unwrap();
    context.run_kernel(&kernel, LaunchConfig::new_1d(2, 2)).unwrap();
    collector.count(DiagnosticKind::DataRace)
}

#[test]
fn test_uniform_writes_are_safe_by_default() {
    assert_eq!(same_store(true, true), 0);
}

#[test]
fn test_uniform_writes_reported_when_unsafe() {
    assert_eq!(same_store(false, true), 1);
}

#[test]
fn test_different_values_always_race() {
    assert_eq!(same_store(true, false), 1);
}

#[test]
fn test_race_across_work_groups() {
    let mut f = FunctionBuilder::new("cross_group", &[("x", GLOBAL)], Type::Void);
    let write = f.block("write");
    let read = f.block("read");
    let done = f.block("done");

    let gid = global_id(&mut f);
    let first = f.icmp(IntPredicate::Eq, gid, f.const_i64(0));
    f.cond_br(first, write, read);

    f.switch_to(write);
    f.store(f.const_i32(1), f.param(0));
    f.br(done);

    f.switch_to(read);
    f.load(Type::I32, f.param(0));
    f.br(done);

    f.switch_to(done);
    f.ret_void();
    let mut kernel = kernel(f.finish(), vec![global_ptr("x")]);

    let (context, _, collector) = context(races());
    let x = context.create_buffer(4, MemFlags::empty()).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(x)).unwrap();
    context.run_kernel(&kernel, LaunchConfig::new_1d(2, 1)).unwrap();

    let races = collector.of_kind(DiagnosticKind::DataRace);
    assert_eq!(races.len(), 1);
    assert_eq!(
        races[0].entity,
        Some(EntityCoords::WorkItem {
            global: Size3::new(1, 0, 0),
            local: Size3::ZERO,
            group: Size3::new(1, 0, 0),
        })
    );
}

#[test]
fn test_atomics_do_not_race() {
    let mut f = FunctionBuilder::new("count", &[("counter", GLOBAL)], Type::Void);
    f.call("atomic_add", Type::I32, vec![f.param(0), f.const_i32(1)]);
    f.ret_void();
    let mut kernel = kernel(f.finish(), vec![global_ptr("counter")]);

    let (context, _, collector) = context(races());
    let counter = context.create_buffer_with_data(&u32_bytes(&[0]), MemFlags::empty()).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(counter)).unwrap();
    context.run_kernel(&kernel, LaunchConfig::new_1d(8, 4)).unwrap();

    assert_eq!(collector.count(DiagnosticKind::DataRace), 0);
    assert_eq!(context.read_buffer(counter, 4).unwrap(), u32_bytes(&[8]));
}

#[test]
fn test_detector_state_resets_between_kernels() {
    let (context, _, collector) = context(races());
    let mut kernel = write_then_read(true);
    let x = context.create_buffer(4, MemFlags::empty()).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(x)).unwrap();
    context.run_kernel(&kernel, LaunchConfig::new_1d(2, 2)).unwrap();
    context.run_kernel(&kernel, LaunchConfig::new_1d(2, 2)).unwrap();
    assert!(collector.is_empty());
}
