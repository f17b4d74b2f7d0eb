//! Buffer access checks and instruction counts

mod common;

use clgrind_core::ir::{AccessQualifier, AddressSpace, BinaryOp, FunctionBuilder, KernelArgInfo, Type};
use clgrind_core::{ArgValue, DiagnosticKind, LaunchConfig, MapFlags, MemFlags, Severity};
use clgrind_plugins::PluginConfig;
use common::*;

fn qualified(name: &str, access: AccessQualifier) -> KernelArgInfo {
    global_ptr(name).with_access(access)
}

#[test]
fn test_store_to_read_only_argument() {
    let mut f = FunctionBuilder::new("overwrite", &[("input", GLOBAL), ("output", GLOBAL)], Type::Void);
    let value = f.load(Type::I32, f.param(1));
    f.store(value, f.param(0));
    f.ret_void();
    let args = vec![
        qualified("input", AccessQualifier::ReadOnly),
        qualified("output", AccessQualifier::WriteOnly),
    ];
    let mut kernel = kernel(f.finish(), args);

    let (context, _, collector) = context(PluginConfig::default());
    let input = context.create_buffer_with_data(&u32_bytes(&[1]), MemFlags::empty()).unwrap();
    let output = context.create_buffer_with_data(&u32_bytes(&[2]), MemFlags::empty()).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(input)).unwrap();
    kernel.set_arg(1, ArgValue::Buffer(output)).unwrap();
    context.run_kernel(&kernel, LaunchConfig::new_1d(2, 2)).unwrap();

    let found = collector.of_kind(DiagnosticKind::InvalidAccess);
    let messages: Vec<&str> = found.iter().map(|d| d.message.as_str()).collect();
    assert!(messages.contains(&"Read from write-only argument 'output'"));
    assert!(messages.contains(&"Write to read-only argument 'input'"));
    assert!(found.iter().all(|d| d.severity == Severity::Warning));
    // one per work-item and instruction
    assert_eq!(found.len(), 4);
}

#[test]
fn test_read_write_arguments_are_unchecked() {
    let mut f = FunctionBuilder::new("inc", &[("data", GLOBAL)], Type::Void);
    let value = f.load(Type::I32, f.param(0));
    let value = f.binary(BinaryOp::Add, value, f.const_i32(1));
    f.store(value, f.param(0));
    f.ret_void();
    let mut kernel = kernel(f.finish(), vec![global_ptr("data")]);

    let (context, _, collector) = context(PluginConfig::default());
    let data = context.create_buffer_with_data(&u32_bytes(&[1]), MemFlags::empty()).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(data)).unwrap();
    context.run_kernel(&kernel, LaunchConfig::new_1d(1, 1)).unwrap();
    assert!(collector.is_empty());
}

#[test]
fn test_host_write_into_read_mapping() {
    let (context, _, collector) = context(PluginConfig::default());
    let buffer = context.create_buffer_with_data(&[0; 16], MemFlags::empty()).unwrap();

    let mapping = context.map_buffer(buffer, 8, MapFlags::READ).unwrap();
    context.write_buffer(buffer + 8, &[1; 8]).unwrap();
    assert!(collector.is_empty());
    context.write_buffer(buffer + 4, &[1; 4]).unwrap();
    assert_eq!(collector.count(DiagnosticKind::InvalidAccess), 1);

    context.unmap_buffer(mapping).unwrap();
    collector.clear();
    context.write_buffer(buffer, &[2; 4]).unwrap();
    assert!(collector.is_empty());
}

#[test]
fn test_write_mapping_is_not_checked() {
    let (context, _, collector) = context(PluginConfig::default());
    let buffer = context.create_buffer_with_data(&[0; 8], MemFlags::empty()).unwrap();
    let mut mapping = context.map_buffer(buffer, 8, MapFlags::READ | MapFlags::WRITE).unwrap();
    mapping.data.fill(3);
    context.write_buffer(buffer, &[1; 8]).unwrap();
    context.unmap_buffer(mapping).unwrap();
    assert!(collector.is_empty());
    assert_eq!(context.read_buffer(buffer, 8).unwrap(), vec![3; 8]);
}

#[test]
fn test_instruction_counts() {
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

    let config = PluginConfig {
        instruction_counts: true,
        ..PluginConfig::default()
    };
    let (context, installed, collector) = context(config);
    let a = context.create_buffer_with_data(&u32_bytes(&[1; 8]), MemFlags::empty()).unwrap();
    let b = context.create_buffer_with_data(&u32_bytes(&[2; 8]), MemFlags::empty()).unwrap();
    let out = context.create_buffer(32, MemFlags::empty()).unwrap();
    kernel.set_arg(0, ArgValue::Buffer(a)).unwrap();
    kernel.set_arg(1, ArgValue::Buffer(b)).unwrap();
    kernel.set_arg(2, ArgValue::Buffer(out)).unwrap();
    context.run_kernel(&kernel, LaunchConfig::new_1d(8, 4)).unwrap();
    assert!(collector.is_empty());

    let report = installed.instruction_counter.unwrap().report();
    assert_eq!(report.kernel.as_deref(), Some("vec_add"));
    assert_eq!(report.count("getelementptr"), 24);
    assert_eq!(report.count("load"), 16);
    assert_eq!(report.count("add"), 8);
    assert_eq!(report.count("store"), 8);
    assert_eq!(report.count("call"), 8);
    assert_eq!(report.count("ret"), 8);
    assert_eq!(report.total(), 72);
    assert_eq!(report.instructions[0], ("getelementptr".to_string(), 24));
    assert_eq!(report.calls, vec![("get_global_id".to_string(), 8)]);

    let global = report.traffic(AddressSpace::Global).unwrap();
    assert_eq!((global.loaded, global.stored), (64, 32));
    assert!(report.traffic(AddressSpace::Local).is_none());

    let json = report.to_json().unwrap();
    assert!(json.contains("\"kernel\": \"vec_add\""));
    assert!(report.to_string().contains("Instructions executed for kernel 'vec_add':"));
}
