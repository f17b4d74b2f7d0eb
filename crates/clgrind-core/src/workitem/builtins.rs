//! Builtin function table
//!
//! Calls to functions the module does not define are resolved here by name.
//! A callee name may carry overload segments after the base name, separated
//! by dots: `max.u` selects unsigned semantics, `async_work_group_copy.4`
//! gives the element size in bytes, and LLVM intrinsics carry their type
//! mangling (`llvm.memcpy.p1.p3.i64`). Resolution strips trailing segments
//! until a base name matches.

use super::ops::{mask, sign_extend};
use super::{Control, ExecEnv, WorkItem};
use crate::error::{Result, SimError};
use crate::ir::{AddressSpace, InstructionRef, Type};
use crate::memory::AtomicOp;
use crate::value::TypedValue;
use crate::workgroup::{AsyncCopy, FenceFlags, GroupSync};
use half::f16;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::f64::consts::PI;
use std::io::Write;

/// A builtin call with evaluated arguments.
pub(crate) struct CallSite<'a> {
    pub name: &'a str,
    pub args: Vec<TypedValue>,
    pub arg_types: Vec<Type>,
    pub result_type: &'a Type,
    pub at: InstructionRef,
}

/// A resolved call: the matched base name and the remaining overload
/// segments.
struct Call<'a> {
    site: &'a CallSite<'a>,
    base: &'a str,
    overload: &'a str,
}

impl Call<'_> {
    fn arg(&self, index: usize) -> Result<&TypedValue> {
        self.site.args.get(index).ok_or_else(|| {
            SimError::malformed(format!("{} expects at least {} arguments", self.site.name, index + 1))
        })
    }

    fn arg_type(&self, index: usize) -> Result<&Type> {
        self.site.arg_types.get(index).ok_or_else(|| {
            SimError::malformed(format!("{} expects at least {} arguments", self.site.name, index + 1))
        })
    }

    fn arg_bits(&self, index: usize) -> Result<u32> {
        Ok(self.arg_type(index)?.scalar_bits())
    }

    /// Address space of pointer argument `index`.
    fn pointer_space(&self, index: usize) -> AddressSpace {
        self.site
            .arg_types
            .get(index)
            .and_then(Type::address_space)
            .unwrap_or(AddressSpace::Global)
    }

    fn unsigned(&self) -> bool {
        self.overload.split('.').any(|s| s == "u")
    }

    /// Element size given as a numeric overload segment.
    fn element_size(&self) -> Option<u64> {
        self.overload.split('.').find_map(|s| s.parse().ok())
    }

    fn result(&self) -> TypedValue {
        TypedValue::for_type(self.site.result_type)
    }

    fn result_bits(&self) -> u32 {
        self.site.result_type.scalar_bits()
    }
}

type BuiltinFn = fn(&mut WorkItem, &ExecEnv<'_>, &mut GroupSync, &Call<'_>) -> Result<Control>;

#[derive(Clone, Copy)]
enum Builtin {
    Op(BuiltinFn),
    Float1(fn(f64) -> f64),
    Float2(fn(f64, f64) -> f64),
    Float3(fn(f64, f64, f64) -> f64),
    Relational1(fn(f64, usize) -> bool),
    Relational2(fn(f64, f64) -> bool),
}

// ================================================================================================
// Dispatch
// ================================================================================================

pub(crate) fn call(item: &mut WorkItem, env: &ExecEnv<'_>, sync: &mut GroupSync, site: &CallSite<'_>) -> Result<Control> {
    let (builtin, base, overload) =
        resolve(site.name).ok_or_else(|| SimError::UndefinedFunction(site.name.to_string()))?;
    let call = Call { site, base, overload };

    match builtin {
        Builtin::Op(f) => f(item, env, sync, &call),
        Builtin::Float1(f) => float_map(&call, |i| Ok(f(lane_f(call.arg(0)?, i)))),
        Builtin::Float2(f) => float_map(&call, |i| Ok(f(lane_f(call.arg(0)?, i), lane_f(call.arg(1)?, i)))),
        Builtin::Float3(f) => float_map(&call, |i| {
            Ok(f(
                lane_f(call.arg(0)?, i),
                lane_f(call.arg(1)?, i),
                lane_f(call.arg(2)?, i),
            ))
        }),
        Builtin::Relational1(f) => {
            let x = call.arg(0)?;
            relational(&call, |i| f(lane_f(x, i), x.size()))
        }
        Builtin::Relational2(f) => {
            let (x, y) = (call.arg(0)?, call.arg(1)?);
            relational(&call, |i| f(lane_f(x, i), lane_f(y, i)))
        }
    }
}

fn resolve(name: &str) -> Option<(Builtin, &str, &str)> {
    let mut candidate = name;
    loop {
        if let Some(builtin) = lookup(candidate) {
            let overload = name.get(candidate.len() + 1..).unwrap_or("");
            return Some((builtin, candidate, overload));
        }
        candidate = &candidate[..candidate.rfind('.')?];
    }
}

fn lookup(base: &str) -> Option<Builtin> {
    if let Some(builtin) = BUILTINS.get(base) {
        return Some(*builtin);
    }
    if let Some(stripped) = base.strip_prefix("native_").or_else(|| base.strip_prefix("half_")) {
        if let Some(builtin) = BUILTINS.get(stripped) {
            return Some(*builtin);
        }
    }
    if parse_vector_access(base).is_some() {
        return Some(Builtin::Op(vector_access));
    }
    if base.starts_with("convert_") && !base.contains('.') {
        return Some(Builtin::Op(convert));
    }
    None
}

lazy_static! {
    static ref BUILTINS: HashMap<&'static str, Builtin> = {
        use Builtin::*;
        let mut m: HashMap<&'static str, Builtin> = HashMap::new();

        // Work-item queries
        m.insert("get_work_dim", Op(get_work_dim));
        m.insert("get_global_size", Op(get_global_size));
        m.insert("get_global_id", Op(get_global_id));
        m.insert("get_global_offset", Op(get_global_offset));
        m.insert("get_local_size", Op(get_local_size));
        m.insert("get_enqueued_local_size", Op(get_enqueued_local_size));
        m.insert("get_local_id", Op(get_local_id));
        m.insert("get_num_groups", Op(get_num_groups));
        m.insert("get_group_id", Op(get_group_id));
        m.insert("get_global_linear_id", Op(get_global_linear_id));
        m.insert("get_local_linear_id", Op(get_local_linear_id));

        // Synchronization
        m.insert("barrier", Op(barrier));
        m.insert("work_group_barrier", Op(barrier));
        m.insert("mem_fence", Op(no_op));
        m.insert("read_mem_fence", Op(no_op));
        m.insert("write_mem_fence", Op(no_op));
        m.insert("async_work_group_copy", Op(async_copy));
        m.insert("async_work_group_strided_copy", Op(async_copy));
        m.insert("wait_group_events", Op(wait_group_events));
        m.insert("prefetch", Op(no_op));

        // Atomics
        for name in [
            "atomic_add", "atomic_sub", "atomic_xchg", "atomic_inc", "atomic_dec", "atomic_cmpxchg",
            "atomic_min", "atomic_max", "atomic_and", "atomic_or", "atomic_xor", "atomic_load",
            "atomic_store", "atom_add", "atom_sub", "atom_xchg", "atom_inc", "atom_dec",
            "atom_cmpxchg", "atom_min", "atom_max", "atom_and", "atom_or", "atom_xor",
        ] {
            m.insert(name, Op(atomic));
        }

        // Common
        m.insert("clamp", Op(clamp));
        m.insert("degrees", Float1(f64::to_degrees));
        m.insert("radians", Float1(f64::to_radians));
        m.insert("max", Op(max));
        m.insert("min", Op(min));
        m.insert("mix", Float3(|x, y, a| x + (y - x) * a));
        m.insert("sign", Float1(sign));
        m.insert("step", Float2(|edge, x| if x < edge { 0.0 } else { 1.0 }));
        m.insert("smoothstep", Float3(smoothstep));

        // Integer
        m.insert("abs", Op(abs));
        m.insert("abs_diff", Op(abs_diff));
        m.insert("add_sat", Op(add_sat));
        m.insert("sub_sat", Op(sub_sat));
        m.insert("hadd", Op(hadd));
        m.insert("rhadd", Op(rhadd));
        m.insert("clz", Op(clz));
        m.insert("ctz", Op(ctz));
        m.insert("popcount", Op(popcount));
        m.insert("mul_hi", Op(mul_hi));
        m.insert("mad_hi", Op(mad_hi));
        m.insert("mul24", Op(mul24));
        m.insert("mad24", Op(mad24));
        m.insert("mad_sat", Op(mad_sat));
        m.insert("rotate", Op(rotate));
        m.insert("upsample", Op(upsample));

        // Math
        m.insert("acos", Float1(f64::acos));
        m.insert("acosh", Float1(f64::acosh));
        m.insert("acospi", Float1(|x| x.acos() / PI));
        m.insert("asin", Float1(f64::asin));
        m.insert("asinh", Float1(f64::asinh));
        m.insert("asinpi", Float1(|x| x.asin() / PI));
        m.insert("atan", Float1(f64::atan));
        m.insert("atanh", Float1(f64::atanh));
        m.insert("atanpi", Float1(|x| x.atan() / PI));
        m.insert("atan2", Float2(f64::atan2));
        m.insert("atan2pi", Float2(|y, x| y.atan2(x) / PI));
        m.insert("cbrt", Float1(f64::cbrt));
        m.insert("ceil", Float1(f64::ceil));
        m.insert("copysign", Float2(f64::copysign));
        m.insert("cos", Float1(f64::cos));
        m.insert("cosh", Float1(f64::cosh));
        m.insert("cospi", Float1(|x| (x * PI).cos()));
        m.insert("divide", Float2(|x, y| x / y));
        m.insert("exp", Float1(f64::exp));
        m.insert("exp2", Float1(f64::exp2));
        m.insert("exp10", Float1(|x| 10f64.powf(x)));
        m.insert("expm1", Float1(f64::exp_m1));
        m.insert("fabs", Float1(f64::abs));
        m.insert("fdim", Float2(|x, y| if x > y { x - y } else { 0.0 }));
        m.insert("floor", Float1(f64::floor));
        m.insert("fma", Float3(f64::mul_add));
        m.insert("mad", Float3(|a, b, c| a * b + c));
        m.insert("fmax", Float2(f64::max));
        m.insert("fmin", Float2(f64::min));
        m.insert("fmod", Float2(|x, y| x % y));
        m.insert("hypot", Float2(f64::hypot));
        m.insert("log", Float1(f64::ln));
        m.insert("log2", Float1(f64::log2));
        m.insert("log10", Float1(f64::log10));
        m.insert("log1p", Float1(f64::ln_1p));
        m.insert("logb", Float1(logb));
        m.insert("maxmag", Float2(maxmag));
        m.insert("minmag", Float2(minmag));
        m.insert("pow", Float2(f64::powf));
        m.insert("powr", Float2(f64::powf));
        m.insert("recip", Float1(f64::recip));
        m.insert("remainder", Float2(|x, y| x - y * (x / y).round_ties_even()));
        m.insert("rint", Float1(f64::round_ties_even));
        m.insert("round", Float1(f64::round));
        m.insert("rsqrt", Float1(|x| 1.0 / x.sqrt()));
        m.insert("sin", Float1(f64::sin));
        m.insert("sinh", Float1(f64::sinh));
        m.insert("sinpi", Float1(|x| (x * PI).sin()));
        m.insert("sqrt", Float1(f64::sqrt));
        m.insert("tan", Float1(f64::tan));
        m.insert("tanh", Float1(f64::tanh));
        m.insert("tanpi", Float1(|x| (x * PI).tan()));
        m.insert("trunc", Float1(f64::trunc));
        m.insert("pown", Op(pown));
        m.insert("rootn", Op(rootn));
        m.insert("ldexp", Op(ldexp));
        m.insert("ilogb", Op(ilogb));
        m.insert("fract", Op(fract));
        m.insert("modf", Op(modf));
        m.insert("sincos", Op(sincos));
        m.insert("frexp", Op(frexp));
        m.insert("nan", Op(nan));

        // Geometric
        m.insert("dot", Op(dot));
        m.insert("cross", Op(cross));
        m.insert("length", Op(length));
        m.insert("fast_length", Op(length));
        m.insert("distance", Op(distance));
        m.insert("fast_distance", Op(distance));
        m.insert("normalize", Op(normalize));
        m.insert("fast_normalize", Op(normalize));

        // Relational
        m.insert("isequal", Relational2(|x, y| x == y));
        m.insert("isnotequal", Relational2(|x, y| x != y));
        m.insert("isgreater", Relational2(|x, y| x > y));
        m.insert("isgreaterequal", Relational2(|x, y| x >= y));
        m.insert("isless", Relational2(|x, y| x < y));
        m.insert("islessequal", Relational2(|x, y| x <= y));
        m.insert("islessgreater", Relational2(|x, y| x < y || x > y));
        m.insert("isordered", Relational2(|x, y| !x.is_nan() && !y.is_nan()));
        m.insert("isunordered", Relational2(|x, y| x.is_nan() || y.is_nan()));
        m.insert("isfinite", Relational1(|x, _| x.is_finite()));
        m.insert("isinf", Relational1(|x, _| x.is_infinite()));
        m.insert("isnan", Relational1(|x, _| x.is_nan()));
        m.insert("isnormal", Relational1(is_normal));
        m.insert("signbit", Relational1(|x, _| x.is_sign_negative()));
        m.insert("any", Op(any));
        m.insert("all", Op(all));
        m.insert("bitselect", Op(bitselect));
        m.insert("select", Op(select));

        // Other
        m.insert("printf", Op(printf));

        // LLVM intrinsics
        m.insert("llvm.memcpy", Op(llvm_memcpy));
        m.insert("llvm.memmove", Op(llvm_memcpy));
        m.insert("llvm.memset", Op(llvm_memset));
        m.insert("llvm.fmuladd", Float3(f64::mul_add));
        m.insert("llvm.fma", Float3(f64::mul_add));
        m.insert("llvm.fabs", Float1(f64::abs));
        m.insert("llvm.sqrt", Float1(f64::sqrt));
        m.insert("llvm.smax", Op(llvm_smax));
        m.insert("llvm.smin", Op(llvm_smin));
        m.insert("llvm.umax", Op(llvm_umax));
        m.insert("llvm.umin", Op(llvm_umin));
        m.insert("llvm.dbg", Op(no_op));
        m.insert("llvm.lifetime", Op(no_op));
        m.insert("llvm.assume", Op(no_op));
        m.insert("llvm.trap", Op(trap));

        m
    };
}

// ================================================================================================
// Lane Helpers
// ================================================================================================

/// Lane `i` of `value`, broadcasting scalars across vector lanes.
fn lane_f(value: &TypedValue, i: usize) -> f64 {
    value.get_float(i % value.num().max(1))
}

fn lane_u(value: &TypedValue, i: usize) -> u64 {
    value.get_uint(i % value.num().max(1))
}

fn lane_i(value: &TypedValue, i: usize, bits: u32, signed: bool) -> i128 {
    let raw = lane_u(value, i) & mask(bits);
    if signed {
        i128::from(sign_extend(raw, bits))
    } else {
        i128::from(raw)
    }
}

fn int_range(bits: u32, signed: bool) -> (i128, i128) {
    if signed {
        (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
    } else {
        (0, (1i128 << bits) - 1)
    }
}

fn saturate(value: i128, bits: u32, signed: bool) -> i128 {
    let (lo, hi) = int_range(bits, signed);
    value.clamp(lo, hi)
}

fn value(result: TypedValue) -> Result<Control> {
    Ok(Control::Value(Some(result)))
}

fn float_map(call: &Call<'_>, f: impl Fn(usize) -> Result<f64>) -> Result<Control> {
    let mut result = call.result();
    for i in 0..result.num() {
        result.set_float(i, f(i)?);
    }
    value(result)
}

/// Integer builtin over the first argument's width and the call's
/// signedness.
fn int_map(call: &Call<'_>, f: impl Fn(usize, u32, bool) -> Result<i128>) -> Result<Control> {
    let bits = call.arg_bits(0)?;
    let signed = !call.unsigned();
    let mut result = call.result();
    for i in 0..result.num() {
        result.set_uint(i, f(i, bits, signed)? as u64);
    }
    value(result)
}

/// Scalar results are 1/0, vector results all-ones/0 per lane.
fn relational(call: &Call<'_>, f: impl Fn(usize) -> bool) -> Result<Control> {
    let mut result = call.result();
    let truth = if result.num() > 1 {
        mask(result.size() as u32 * 8)
    } else {
        1
    };
    for i in 0..result.num() {
        result.set_uint(i, if f(i) { truth } else { 0 });
    }
    value(result)
}

fn no_op(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, _: &Call<'_>) -> Result<Control> {
    Ok(Control::Value(None))
}

fn trap(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, _: &Call<'_>) -> Result<Control> {
    Err(SimError::Trap)
}

// ================================================================================================
// Work-Item Queries
// ================================================================================================

fn dimension(call: &Call<'_>) -> usize {
    call.site.args.first().map_or(0, |d| d.get_uint(0) as usize)
}

fn query(call: &Call<'_>, answer: u64) -> Result<Control> {
    let mut result = call.result();
    if result.num() > 0 {
        result.set_uint(0, answer);
    }
    value(result)
}

/// Per-dimension query with the OpenCL defaults for dimensions past 2.
fn dim_query(call: &Call<'_>, size: crate::launch::Size3, default: u64) -> Result<Control> {
    let dim = dimension(call);
    query(call, if dim < 3 { size[dim] as u64 } else { default })
}

fn get_work_dim(_: &mut WorkItem, env: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    query(call, u64::from(env.invocation.launch().work_dim))
}

fn get_global_size(_: &mut WorkItem, env: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    dim_query(call, env.invocation.launch().global_size, 1)
}

fn get_global_id(item: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    dim_query(call, item.global_id, 0)
}

fn get_global_offset(_: &mut WorkItem, env: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    dim_query(call, env.invocation.launch().global_offset, 0)
}

fn get_local_size(item: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    dim_query(call, item.group_size, 1)
}

fn get_enqueued_local_size(
    _: &mut WorkItem,
    env: &ExecEnv<'_>,
    _: &mut GroupSync,
    call: &Call<'_>,
) -> Result<Control> {
    dim_query(call, env.invocation.launch().local_size, 1)
}

fn get_local_id(item: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    dim_query(call, item.local_id, 0)
}

fn get_num_groups(_: &mut WorkItem, env: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    dim_query(call, env.invocation.num_groups(), 1)
}

fn get_group_id(item: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    dim_query(call, item.group_id, 0)
}

fn get_global_linear_id(item: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    query(call, item.global_index as u64)
}

fn get_local_linear_id(item: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    query(call, item.local_index as u64)
}

// ================================================================================================
// Synchronization
// ================================================================================================

fn barrier(_: &mut WorkItem, _: &ExecEnv<'_>, sync: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let flags = FenceFlags::from_bits_truncate(call.arg(0)?.get_uint(0) as u32);
    sync.arrive(call.site.at, flags, Vec::new());
    Ok(Control::Barrier(flags))
}

fn async_copy(item: &mut WorkItem, _: &ExecEnv<'_>, sync: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let strided = call.base == "async_work_group_strided_copy";
    let dst = call.arg(0)?.get_pointer(0);
    let src = call.arg(1)?.get_pointer(0);
    let num_elements = call.arg(2)?.get_uint(0);
    let (stride, event) = if strided {
        (call.arg(3)?.get_uint(0), call.arg(4)?.get_uint(0))
    } else {
        (1, call.arg(3)?.get_uint(0))
    };

    let dst_space = call.pointer_space(0);
    let (src_stride, dst_stride) = if dst_space == AddressSpace::Local {
        (stride, 1)
    } else {
        (1, stride)
    };
    let copy = AsyncCopy {
        dst,
        src,
        dst_space,
        src_space: call.pointer_space(1),
        element_size: call.element_size().unwrap_or(1),
        num_elements,
        src_stride,
        dst_stride,
        event,
        instruction: call.site.at,
    };

    let event = sync.register_copy(item.local_index, copy);
    if !item.pending_events.contains(&event) {
        item.pending_events.push(event);
    }
    query(call, event)
}

fn wait_group_events(item: &mut WorkItem, env: &ExecEnv<'_>, sync: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let count = call.arg(0)?.get_uint(0);
    let list = call.arg(1)?.get_pointer(0);
    let space = call.site.arg_types.get(1).and_then(Type::address_space).unwrap_or(AddressSpace::Private);

    let mut events = Vec::new();
    for i in 0..count {
        let bytes = item.load(env, space, list.wrapping_add(i.wrapping_mul(8)), 8)?;
        let event = TypedValue::from_bytes(8, 1, &bytes).get_uint(0);
        if !sync.is_pending(event) {
            return Err(SimError::InvalidWaitEvent(event));
        }
        events.push(event);
    }

    let flags = FenceFlags::LOCAL | FenceFlags::GLOBAL;
    sync.arrive(call.site.at, flags, events);
    Ok(Control::Barrier(flags))
}

// ================================================================================================
// Atomics
// ================================================================================================

fn atomic(item: &mut WorkItem, env: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let name = call
        .base
        .strip_prefix("atomic_")
        .or_else(|| call.base.strip_prefix("atom_"))
        .unwrap_or(call.base);
    let signed = !call.unsigned();
    let op = match name {
        "add" => AtomicOp::Add,
        "sub" => AtomicOp::Sub,
        "xchg" => AtomicOp::Xchg,
        "inc" => AtomicOp::Inc,
        "dec" => AtomicOp::Dec,
        "cmpxchg" => AtomicOp::CmpXchg,
        "min" if signed => AtomicOp::Min,
        "min" => AtomicOp::UMin,
        "max" if signed => AtomicOp::Max,
        "max" => AtomicOp::UMax,
        "and" => AtomicOp::And,
        "or" => AtomicOp::Or,
        "xor" => AtomicOp::Xor,
        "load" => AtomicOp::Load,
        "store" => AtomicOp::Store,
        _ => return Err(SimError::UndefinedFunction(call.site.name.to_string())),
    };

    let address = call.arg(0)?.get_pointer(0);
    let (operand, compare) = match op {
        AtomicOp::Inc | AtomicOp::Dec | AtomicOp::Load => (0, 0),
        AtomicOp::CmpXchg => (call.arg(2)?.get_uint(0), call.arg(1)?.get_uint(0)),
        _ => (call.arg(1)?.get_uint(0), 0),
    };
    let size = if op == AtomicOp::Store {
        call.arg(1)?.size()
    } else {
        call.site.result_type.size_bytes() as usize
    };

    let old = item.atomic(env, call.pointer_space(0), op, address, size, operand, compare)?;
    if op == AtomicOp::Store {
        return Ok(Control::Value(None));
    }
    query(call, old)
}

// ================================================================================================
// Common and Integer
// ================================================================================================

fn sign(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        x
    }
}

fn smoothstep(edge0: f64, edge1: f64, x: f64) -> f64 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

fn clamp(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    if call.site.result_type.is_float() {
        return float_map(call, |i| {
            let x = lane_f(call.arg(0)?, i);
            Ok(x.max(lane_f(call.arg(1)?, i)).min(lane_f(call.arg(2)?, i)))
        });
    }
    int_map(call, |i, bits, signed| {
        let x = lane_i(call.arg(0)?, i, bits, signed);
        let lo = lane_i(call.arg(1)?, i, bits, signed);
        let hi = lane_i(call.arg(2)?, i, bits, signed);
        Ok(x.max(lo).min(hi))
    })
}

fn max(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    if call.site.result_type.is_float() {
        return float_map(call, |i| Ok(lane_f(call.arg(0)?, i).max(lane_f(call.arg(1)?, i))));
    }
    int_map(call, |i, bits, signed| {
        Ok(lane_i(call.arg(0)?, i, bits, signed).max(lane_i(call.arg(1)?, i, bits, signed)))
    })
}

fn min(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    if call.site.result_type.is_float() {
        return float_map(call, |i| Ok(lane_f(call.arg(0)?, i).min(lane_f(call.arg(1)?, i))));
    }
    int_map(call, |i, bits, signed| {
        Ok(lane_i(call.arg(0)?, i, bits, signed).min(lane_i(call.arg(1)?, i, bits, signed)))
    })
}

fn abs(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    int_map(call, |i, bits, signed| Ok(lane_i(call.arg(0)?, i, bits, signed).abs()))
}

fn abs_diff(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    int_map(call, |i, bits, signed| {
        Ok((lane_i(call.arg(0)?, i, bits, signed) - lane_i(call.arg(1)?, i, bits, signed)).abs())
    })
}

fn add_sat(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    int_map(call, |i, bits, signed| {
        let sum = lane_i(call.arg(0)?, i, bits, signed) + lane_i(call.arg(1)?, i, bits, signed);
        Ok(saturate(sum, bits, signed))
    })
}

fn sub_sat(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    int_map(call, |i, bits, signed| {
        let diff = lane_i(call.arg(0)?, i, bits, signed) - lane_i(call.arg(1)?, i, bits, signed);
        Ok(saturate(diff, bits, signed))
    })
}

fn hadd(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    int_map(call, |i, bits, signed| {
        Ok((lane_i(call.arg(0)?, i, bits, signed) + lane_i(call.arg(1)?, i, bits, signed)) >> 1)
    })
}

fn rhadd(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    int_map(call, |i, bits, signed| {
        Ok((lane_i(call.arg(0)?, i, bits, signed) + lane_i(call.arg(1)?, i, bits, signed) + 1) >> 1)
    })
}

fn clz(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    int_map(call, |i, bits, _| {
        let raw = lane_u(call.arg(0)?, i) & mask(bits);
        Ok(i128::from(raw.leading_zeros() - (64 - bits)))
    })
}

fn ctz(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    int_map(call, |i, bits, _| {
        let raw = lane_u(call.arg(0)?, i) & mask(bits);
        Ok(i128::from(if raw == 0 { bits } else { raw.trailing_zeros() }))
    })
}

fn popcount(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    int_map(call, |i, bits, _| {
        Ok(i128::from((lane_u(call.arg(0)?, i) & mask(bits)).count_ones()))
    })
}

fn mul_hi(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    int_map(call, |i, bits, signed| {
        let product = lane_i(call.arg(0)?, i, bits, signed) * lane_i(call.arg(1)?, i, bits, signed);
        Ok(product >> bits)
    })
}

fn mad_hi(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    int_map(call, |i, bits, signed| {
        let product = lane_i(call.arg(0)?, i, bits, signed) * lane_i(call.arg(1)?, i, bits, signed);
        Ok((product >> bits) + lane_i(call.arg(2)?, i, bits, signed))
    })
}

fn mul24(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    int_map(call, |i, bits, signed| {
        Ok(lane_i(call.arg(0)?, i, bits, signed).wrapping_mul(lane_i(call.arg(1)?, i, bits, signed)))
    })
}

fn mad24(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    int_map(call, |i, bits, signed| {
        let product = lane_i(call.arg(0)?, i, bits, signed).wrapping_mul(lane_i(call.arg(1)?, i, bits, signed));
        Ok(product.wrapping_add(lane_i(call.arg(2)?, i, bits, signed)))
    })
}

fn mad_sat(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    int_map(call, |i, bits, signed| {
        let product = lane_i(call.arg(0)?, i, bits, signed) * lane_i(call.arg(1)?, i, bits, signed);
        Ok(saturate(product + lane_i(call.arg(2)?, i, bits, signed), bits, signed))
    })
}

fn rotate(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    int_map(call, |i, bits, _| {
        let v = lane_u(call.arg(0)?, i) & mask(bits);
        let n = (lane_u(call.arg(1)?, i) % u64::from(bits)) as u32;
        if n == 0 {
            return Ok(i128::from(v));
        }
        Ok(i128::from(((v << n) | (v >> (bits - n))) & mask(bits)))
    })
}

fn upsample(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let lo_bits = call.arg_bits(1)?;
    let mut result = call.result();
    for i in 0..result.num() {
        let hi = lane_u(call.arg(0)?, i) & mask(lo_bits);
        let lo = lane_u(call.arg(1)?, i) & mask(lo_bits);
        result.set_uint(i, (hi << lo_bits) | lo);
    }
    value(result)
}

fn int_extreme(call: &Call<'_>, signed: bool, take_max: bool) -> Result<Control> {
    let bits = call.arg_bits(0)?;
    let mut result = call.result();
    for i in 0..result.num() {
        let a = lane_i(call.arg(0)?, i, bits, signed);
        let b = lane_i(call.arg(1)?, i, bits, signed);
        result.set_uint(i, if take_max { a.max(b) } else { a.min(b) } as u64);
    }
    value(result)
}

fn llvm_smax(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    int_extreme(call, true, true)
}

fn llvm_smin(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    int_extreme(call, true, false)
}

fn llvm_umax(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    int_extreme(call, false, true)
}

fn llvm_umin(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    int_extreme(call, false, false)
}

// ================================================================================================
// Math
// ================================================================================================

fn exponent_bits(x: f64) -> i64 {
    ((x.to_bits() >> 52) & 0x7ff) as i64 - 1023
}

fn logb(x: f64) -> f64 {
    if x == 0.0 {
        f64::NEG_INFINITY
    } else if x.is_infinite() {
        f64::INFINITY
    } else if x.is_nan() {
        x
    } else {
        exponent_bits(x) as f64
    }
}

fn maxmag(x: f64, y: f64) -> f64 {
    if x.abs() > y.abs() {
        x
    } else if y.abs() > x.abs() {
        y
    } else {
        x.max(y)
    }
}

fn minmag(x: f64, y: f64) -> f64 {
    if x.abs() < y.abs() {
        x
    } else if y.abs() < x.abs() {
        y
    } else {
        x.min(y)
    }
}

fn is_normal(x: f64, size: usize) -> bool {
    match size {
        2 => f16::from_f64(x).is_normal(),
        4 => (x as f32).is_normal(),
        _ => x.is_normal(),
    }
}

fn pown(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let n = call.arg(1)?;
    float_map(call, |i| Ok(lane_f(call.arg(0)?, i).powi(n.get_sint(i % n.num().max(1)) as i32)))
}

fn rootn(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let n = call.arg(1)?;
    float_map(call, |i| {
        let x = lane_f(call.arg(0)?, i);
        let n = n.get_sint(i % n.num().max(1));
        if n % 2 != 0 && x < 0.0 {
            Ok(-(-x).powf(1.0 / n as f64))
        } else {
            Ok(x.powf(1.0 / n as f64))
        }
    })
}

fn ldexp(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let n = call.arg(1)?;
    float_map(call, |i| {
        let exp = n.get_sint(i % n.num().max(1)) as i32;
        Ok(lane_f(call.arg(0)?, i) * 2f64.powi(exp))
    })
}

fn ilogb(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let x = call.arg(0)?;
    let mut result = call.result();
    for i in 0..result.num() {
        let v = lane_f(x, i);
        let e = if v == 0.0 {
            i64::from(i32::MIN)
        } else if v.is_nan() || v.is_infinite() {
            i64::from(i32::MAX)
        } else {
            exponent_bits(v)
        };
        result.set_sint(i, e);
    }
    value(result)
}

/// Store `data` through pointer argument `index`.
fn store_out(item: &WorkItem, env: &ExecEnv<'_>, call: &Call<'_>, index: usize, data: &TypedValue) -> Result<()> {
    let address = call.arg(index)?.get_pointer(0);
    item.store(env, call.pointer_space(index), address, data.bytes())
}

/// Float result plus a second float vector written through argument 1.
fn split_float(
    item: &mut WorkItem,
    env: &ExecEnv<'_>,
    call: &Call<'_>,
    f: impl Fn(f64) -> (f64, f64),
) -> Result<Control> {
    let mut result = call.result();
    let mut out = call.result();
    for i in 0..result.num() {
        let (ret, side) = f(lane_f(call.arg(0)?, i));
        result.set_float(i, ret);
        out.set_float(i, side);
    }
    store_out(item, env, call, 1, &out)?;
    value(result)
}

fn fract(item: &mut WorkItem, env: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let limit = if call.site.result_type.scalar_bits() == 64 {
        1.0 - f64::EPSILON / 2.0
    } else {
        f64::from(1.0f32 - f32::EPSILON / 2.0)
    };
    split_float(item, env, call, |x| (((x - x.floor()).min(limit)), x.floor()))
}

fn modf(item: &mut WorkItem, env: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    split_float(item, env, call, |x| (x - x.trunc(), x.trunc()))
}

fn sincos(item: &mut WorkItem, env: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    split_float(item, env, call, |x| (x.sin(), x.cos()))
}

fn frexp(item: &mut WorkItem, env: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let x = call.arg(0)?;
    let mut result = call.result();
    let mut exponents = TypedValue::new(4, result.num());
    for i in 0..result.num() {
        let v = lane_f(x, i);
        if v == 0.0 || !v.is_finite() {
            result.set_float(i, v);
            continue;
        }
        let e = exponent_bits(v) + 1;
        result.set_float(i, v / 2f64.powi(e as i32));
        exponents.set_sint(i, e);
    }
    store_out(item, env, call, 1, &exponents)?;
    value(result)
}

fn nan(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    float_map(call, |_| Ok(f64::NAN))
}

// ================================================================================================
// Geometric
// ================================================================================================

fn dot_of(a: &TypedValue, b: &TypedValue) -> f64 {
    (0..a.num()).map(|i| lane_f(a, i) * lane_f(b, i)).sum()
}

fn dot(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let d = dot_of(call.arg(0)?, call.arg(1)?);
    float_map(call, |_| Ok(d))
}

fn cross(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let (a, b) = (call.arg(0)?, call.arg(1)?);
    let c = |i: usize| a.get_float(i);
    let d = |i: usize| b.get_float(i);
    let lanes = [
        c(1) * d(2) - c(2) * d(1),
        c(2) * d(0) - c(0) * d(2),
        c(0) * d(1) - c(1) * d(0),
        0.0,
    ];
    float_map(call, |i| Ok(lanes.get(i).copied().unwrap_or(0.0)))
}

fn length(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let a = call.arg(0)?;
    let l = dot_of(a, a).sqrt();
    float_map(call, |_| Ok(l))
}

fn distance(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let (a, b) = (call.arg(0)?, call.arg(1)?);
    let d: f64 = (0..a.num()).map(|i| (lane_f(a, i) - lane_f(b, i)).powi(2)).sum();
    float_map(call, |_| Ok(d.sqrt()))
}

fn normalize(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let a = call.arg(0)?;
    let l = dot_of(a, a).sqrt();
    float_map(call, |i| Ok(if l == 0.0 { lane_f(a, i) } else { lane_f(a, i) / l }))
}

// ================================================================================================
// Relational
// ================================================================================================

fn msb_set(value: &TypedValue, i: usize) -> bool {
    let bits = value.size() as u32 * 8;
    (value.get_uint(i) >> (bits - 1)) & 1 == 1
}

fn any(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let x = call.arg(0)?;
    query(call, u64::from((0..x.num()).any(|i| msb_set(x, i))))
}

fn all(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let x = call.arg(0)?;
    query(call, u64::from((0..x.num()).all(|i| msb_set(x, i))))
}

fn bitselect(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let (a, b, c) = (call.arg(0)?, call.arg(1)?, call.arg(2)?);
    let mut result = call.result();
    for (i, byte) in result.bytes_mut().iter_mut().enumerate() {
        let (a, b, c) = (a.bytes()[i], b.bytes()[i], c.bytes()[i]);
        *byte = (a & !c) | (b & c);
    }
    value(result)
}

fn select(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let (a, b, c) = (call.arg(0)?, call.arg(1)?, call.arg(2)?);
    let mut result = call.result();
    for i in 0..result.num() {
        let pick_b = if c.num() == 1 {
            c.get_uint(0) != 0
        } else {
            msb_set(c, i)
        };
        let source = if pick_b { b } else { a };
        result.set_element(i, &source.element(i % source.num().max(1)));
    }
    value(result)
}

// ================================================================================================
// Vector Loads and Stores
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rounding {
    Even,
    Zero,
    Up,
    Down,
}

impl Rounding {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "rte" => Some(Rounding::Even),
            "rtz" => Some(Rounding::Zero),
            "rtp" => Some(Rounding::Up),
            "rtn" => Some(Rounding::Down),
            _ => None,
        }
    }

    fn to_integer(self, x: f64) -> f64 {
        match self {
            Rounding::Even => x.round_ties_even(),
            Rounding::Zero => x.trunc(),
            Rounding::Up => x.ceil(),
            Rounding::Down => x.floor(),
        }
    }
}

fn f32_step(v: f32, up: bool) -> f32 {
    if v.is_nan() || (v.is_infinite() && (v > 0.0) == up) {
        return v;
    }
    if v == 0.0 {
        let tiny = f32::from_bits(1);
        return if up { tiny } else { -tiny };
    }
    let bits = v.to_bits();
    f32::from_bits(if (v > 0.0) == up { bits + 1 } else { bits - 1 })
}

fn f16_step(v: f16, up: bool) -> f16 {
    let x = v.to_f64();
    if x.is_nan() || (x.is_infinite() && (x > 0.0) == up) {
        return v;
    }
    if x == 0.0 {
        let tiny = f16::from_bits(1);
        return if up { tiny } else { -tiny };
    }
    let bits = v.to_bits();
    f16::from_bits(if (x > 0.0) == up { bits + 1 } else { bits - 1 })
}

/// Round `x` to a float of `size` bytes using `mode`.
fn round_float(x: f64, size: usize, mode: Rounding) -> f64 {
    let adjust = |nearest: f64| -> Option<bool> {
        if mode == Rounding::Even || nearest == x || x.is_nan() {
            return None;
        }
        match mode {
            Rounding::Zero if nearest.abs() > x.abs() => Some(x < 0.0),
            Rounding::Up if nearest < x => Some(true),
            Rounding::Down if nearest > x => Some(false),
            _ => None,
        }
    };
    match size {
        2 => {
            let nearest = f16::from_f64(x);
            match adjust(nearest.to_f64()) {
                Some(up) => f16_step(nearest, up).to_f64(),
                None => nearest.to_f64(),
            }
        }
        4 => {
            let nearest = x as f32;
            match adjust(f64::from(nearest)) {
                Some(up) => f64::from(f32_step(nearest, up)),
                None => f64::from(nearest),
            }
        }
        _ => x,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VectorAccess {
    store: bool,
    half: bool,
    aligned: bool,
    /// Lane count from the name; 0 when taken from the value
    lanes: usize,
    rounding: Rounding,
}

fn parse_vector_access(base: &str) -> Option<VectorAccess> {
    let (store, rest) = match base.strip_prefix("vload") {
        Some(rest) => (false, rest),
        None => (true, base.strip_prefix("vstore")?),
    };
    let (aligned, rest) = match rest.strip_prefix('a') {
        Some(rest) => (true, rest),
        None => (false, rest),
    };
    let (half, rest) = match rest.strip_prefix("_half") {
        Some(rest) => (true, rest),
        None => (false, rest),
    };
    if aligned && !half {
        return None;
    }

    let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let lanes = if digits == 0 {
        1
    } else {
        rest[..digits].parse().ok()?
    };
    if !half && digits == 0 {
        return None;
    }
    if ![1, 2, 3, 4, 8, 16].contains(&lanes) {
        return None;
    }

    let rest = &rest[digits..];
    let rounding = match rest.strip_prefix('_') {
        Some(token) if store && half => Rounding::parse(token)?,
        Some(_) => return None,
        None if rest.is_empty() => Rounding::Even,
        None => return None,
    };
    Some(VectorAccess {
        store,
        half,
        aligned,
        lanes,
        rounding,
    })
}

fn vector_access(item: &mut WorkItem, env: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let access = parse_vector_access(call.base).ok_or_else(|| SimError::UndefinedFunction(call.site.name.to_string()))?;
    let pointer_index = if access.store { 2 } else { 1 };
    let offset_index = pointer_index - 1;
    let offset = call.arg(offset_index)?.get_uint(0);
    let base = call.arg(pointer_index)?.get_pointer(0);
    let space = call.pointer_space(pointer_index);

    let stride = if access.aligned && access.lanes == 3 {
        4
    } else {
        access.lanes as u64
    };

    if access.store {
        let data = call.arg(0)?;
        let lanes = data.num();
        if access.half {
            let mut halves = TypedValue::new(2, lanes);
            for i in 0..lanes {
                halves.set_float(i, round_float(data.get_float(i), 2, access.rounding));
            }
            item.store(env, space, element_address(base, offset, stride, 2), halves.bytes())?;
        } else {
            let element = data.size() as u64;
            item.store(env, space, element_address(base, offset, stride, element), data.bytes())?;
        }
        return Ok(Control::Value(None));
    }

    let mut result = call.result();
    if access.half {
        let bytes = item.load(env, space, element_address(base, offset, stride, 2), 2 * result.num() as u64)?;
        let halves = TypedValue::from_bytes(2, result.num(), &bytes);
        for i in 0..result.num() {
            result.set_float(i, halves.get_float(i));
        }
    } else {
        let element = result.size() as u64;
        let bytes = item.load(env, space, element_address(base, offset, stride, element), result.byte_len() as u64)?;
        result.bytes_mut().copy_from_slice(&bytes);
    }
    value(result)
}

/// Address of element `offset` of `stride`-lane vectors at `base`.
fn element_address(base: u64, offset: u64, stride: u64, element: u64) -> u64 {
    base.wrapping_add(offset.wrapping_mul(stride).wrapping_mul(element))
}

// ================================================================================================
// Conversions
// ================================================================================================

fn convert(_: &mut WorkItem, _: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let spec = call
        .base
        .strip_prefix("convert_")
        .ok_or_else(|| SimError::UndefinedFunction(call.site.name.to_string()))?;
    let mut tokens = spec.split('_');
    let target = tokens.next().unwrap_or_default();
    let mut saturate_result = false;
    let mut rounding = None;
    for token in tokens {
        match token {
            "sat" => saturate_result = true,
            other => {
                rounding = Some(Rounding::parse(other).ok_or_else(|| SimError::UndefinedFunction(call.site.name.to_string()))?)
            }
        }
    }

    let src = call.arg(0)?;
    let src_type = call.arg_type(0)?;
    let src_signed = !call.unsigned();
    let src_bits = src_type.scalar_bits();
    let dst_type = call.site.result_type;
    let dst_bits = call.result_bits();
    let dst_signed = !target.starts_with('u');

    let mut result = call.result();
    for i in 0..result.num() {
        if dst_type.is_float() {
            let x = if src_type.is_float() {
                lane_f(src, i)
            } else {
                lane_i(src, i, src_bits, src_signed) as f64
            };
            result.set_float(i, round_float(x, result.size(), rounding.unwrap_or(Rounding::Even)));
            continue;
        }

        let converted = if src_type.is_float() {
            let x = rounding.unwrap_or(Rounding::Zero).to_integer(lane_f(src, i));
            if x.is_nan() {
                0
            } else {
                let (lo, hi) = int_range(dst_bits, dst_signed);
                if saturate_result {
                    (x.clamp(lo as f64, hi as f64)) as i128
                } else {
                    x as i128
                }
            }
        } else {
            let x = lane_i(src, i, src_bits, src_signed);
            if saturate_result {
                saturate(x, dst_bits, dst_signed)
            } else {
                x
            }
        };
        result.set_uint(i, converted as u64 & mask(dst_bits));
    }
    value(result)
}

// ================================================================================================
// Memory Intrinsics
// ================================================================================================

fn llvm_memcpy(item: &mut WorkItem, env: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let dst = call.arg(0)?.get_pointer(0);
    let src = call.arg(1)?.get_pointer(0);
    let len = call.arg(2)?.get_uint(0);
    if len > 0 {
        let data = item.load(env, call.pointer_space(1), src, len)?;
        item.store(env, call.pointer_space(0), dst, &data)?;
    }
    Ok(Control::Value(None))
}

fn llvm_memset(item: &mut WorkItem, env: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let dst = call.arg(0)?.get_pointer(0);
    let byte = call.arg(1)?.get_uint(0) as u8;
    let len = call.arg(2)?.get_uint(0);
    if len > 0 {
        let space = call.pointer_space(0);
        item.check_access(env, space, dst, len)?;
        item.store(env, space, dst, &vec![byte; len as usize])?;
    }
    Ok(Control::Value(None))
}

// ================================================================================================
// printf
// ================================================================================================

const MAX_STRING: usize = 1 << 16;

fn read_c_string(item: &WorkItem, env: &ExecEnv<'_>, space: AddressSpace, address: u64) -> Result<String> {
    let memory = item.memory(env, space);
    let mut bytes = Vec::new();
    for i in 0..MAX_STRING as u64 {
        let byte = memory.load(address + i, 1)?;
        match byte.first() {
            Some(0) | None => break,
            Some(b) => bytes.push(*b),
        }
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

struct FormatSpec {
    left: bool,
    plus: bool,
    space: bool,
    alt: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
}

impl FormatSpec {
    fn pad(&self, body: String) -> String {
        let len = body.chars().count();
        if len >= self.width {
            return body;
        }
        let fill = self.width - len;
        if self.left {
            format!("{body}{}", " ".repeat(fill))
        } else if self.zero {
            let (sign, digits) = match body.chars().next() {
                Some(c @ ('-' | '+' | ' ')) => (c.to_string(), body[1..].to_string()),
                _ => (String::new(), body),
            };
            format!("{sign}{}{digits}", "0".repeat(fill))
        } else {
            format!("{}{body}", " ".repeat(fill))
        }
    }

    fn sign(&self, negative: bool) -> &'static str {
        if negative {
            "-"
        } else if self.plus {
            "+"
        } else if self.space {
            " "
        } else {
            ""
        }
    }
}

/// C-style `%e` body: mantissa, `e`, sign and at least two exponent digits.
fn format_exponent(x: f64, precision: usize, upper: bool) -> String {
    let raw = format!("{:.*e}", precision, x.abs());
    let (mantissa, exponent) = raw.split_once('e').unwrap_or((raw.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let sign = if exponent < 0 { '-' } else { '+' };
    let e = if upper { 'E' } else { 'e' };
    format!("{mantissa}{e}{sign}{:02}", exponent.abs())
}

fn strip_zeros(body: String) -> String {
    if !body.contains('.') {
        return body;
    }
    let (number, suffix) = match body.find(|c| c == 'e' || c == 'E') {
        Some(at) => (body[..at].to_string(), body[at..].to_string()),
        None => (body, String::new()),
    };
    let number = number.trim_end_matches('0').trim_end_matches('.').to_string();
    format!("{number}{suffix}")
}

fn format_float(spec: &FormatSpec, conversion: char, x: f64) -> String {
    let upper = conversion.is_ascii_uppercase();
    if x.is_nan() || x.is_infinite() {
        let word = if x.is_nan() { "nan" } else { "inf" };
        let word = if upper { word.to_uppercase() } else { word.to_string() };
        return format!("{}{word}", spec.sign(x.is_sign_negative() && !x.is_nan()));
    }
    let precision = spec.precision.unwrap_or(6);
    let body = match conversion.to_ascii_lowercase() {
        'e' => format_exponent(x, precision, upper),
        'g' => {
            let p = precision.max(1);
            let exponent = if x == 0.0 { 0 } else { x.abs().log10().floor() as i32 };
            let body = if exponent < -4 || exponent >= p as i32 {
                format_exponent(x, p - 1, upper)
            } else {
                format!("{:.*}", (p as i32 - 1 - exponent).max(0) as usize, x.abs())
            };
            if spec.alt {
                body
            } else {
                strip_zeros(body)
            }
        }
        _ => format!("{:.*}", precision, x.abs()),
    };
    format!("{}{body}", spec.sign(x.is_sign_negative()))
}

fn format_printf(format: &str, args: &[TypedValue], read_string: &dyn Fn(u64) -> Result<String>) -> Result<String> {
    let mut out = String::new();
    let mut chars = format.chars().peekable();
    let mut next_arg = args.iter();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }

        let mut spec = FormatSpec {
            left: false,
            plus: false,
            space: false,
            alt: false,
            zero: false,
            width: 0,
            precision: None,
        };
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => spec.left = true,
                '+' => spec.plus = true,
                ' ' => spec.space = true,
                '#' => spec.alt = true,
                '0' => spec.zero = true,
                _ => break,
            }
            chars.next();
        }
        while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
            spec.width = spec.width * 10 + d as usize;
            chars.next();
        }
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut precision = 0;
            while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                precision = precision * 10 + d as usize;
                chars.next();
            }
            spec.precision = Some(precision);
        }
        while matches!(chars.peek(), Some('h' | 'l' | 'z' | 'j' | 't')) {
            chars.next();
        }

        let Some(conversion) = chars.next() else {
            out.push('%');
            break;
        };
        if conversion == '%' {
            out.push('%');
            continue;
        }
        let Some(arg) = next_arg.next() else {
            return Err(SimError::malformed(format!("printf: missing argument for %{conversion}")));
        };

        let body = match conversion {
            'd' | 'i' => {
                let v = arg.get_sint(0);
                format!("{}{}", spec.sign(v < 0), v.unsigned_abs())
            }
            'u' => arg.get_uint(0).to_string(),
            'x' => format!("{}{:x}", if spec.alt { "0x" } else { "" }, arg.get_uint(0)),
            'X' => format!("{}{:X}", if spec.alt { "0X" } else { "" }, arg.get_uint(0)),
            'o' => format!("{}{:o}", if spec.alt { "0" } else { "" }, arg.get_uint(0)),
            'c' => char::from(arg.get_uint(0) as u8).to_string(),
            's' => {
                let s = read_string(arg.get_pointer(0))?;
                match spec.precision {
                    Some(p) => s.chars().take(p).collect(),
                    None => s,
                }
            }
            'p' => format!("0x{:x}", arg.get_pointer(0)),
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' => format_float(&spec, conversion, arg.get_float(0)),
            other => return Err(SimError::malformed(format!("printf: unsupported conversion %{other}"))),
        };
        out.push_str(&spec.pad(body));
    }
    Ok(out)
}

fn printf(item: &mut WorkItem, env: &ExecEnv<'_>, _: &mut GroupSync, call: &Call<'_>) -> Result<Control> {
    let format_space = call.site.arg_types.first().and_then(Type::address_space).unwrap_or(AddressSpace::Constant);
    let format = read_c_string(item, env, format_space, call.arg(0)?.get_pointer(0))?;

    let item_ref: &WorkItem = item;
    let read_string = |address: u64| read_c_string(item_ref, env, AddressSpace::Constant, address);
    let text = format_printf(&format, &call.site.args[1..], &read_string)?;

    let mut stdout = std::io::stdout().lock();
    if let Err(err) = stdout.write_all(text.as_bytes()).and_then(|_| stdout.flush()) {
        tracing::warn!(error = %err, "printf output failed");
    }
    query(call, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_strips_overloads() {
        let (_, base, overload) = resolve("max.u").unwrap();
        assert_eq!((base, overload), ("max", "u"));

        let (_, base, overload) = resolve("llvm.memcpy.p1.p3.i64").unwrap();
        assert_eq!((base, overload), ("llvm.memcpy", "p1.p3.i64"));

        let (_, base, _) = resolve("native_sqrt").unwrap();
        assert_eq!(base, "native_sqrt");
        assert!(resolve("vload4").is_some());
        assert!(resolve("convert_int4_sat_rte").is_some());
        assert!(resolve("no_such_builtin").is_none());
    }

    #[test]
    fn test_parse_vector_access() {
        let access = parse_vector_access("vstore_half4_rtz").unwrap();
        assert!(access.store && access.half && !access.aligned);
        assert_eq!(access.lanes, 4);
        assert_eq!(access.rounding, Rounding::Zero);

        let access = parse_vector_access("vloada_half3").unwrap();
        assert!(access.aligned);
        assert_eq!(access.lanes, 3);

        assert!(parse_vector_access("vload").is_none());
        assert!(parse_vector_access("vload5").is_none());
        assert!(parse_vector_access("vloada4").is_none());
    }

    #[test]
    fn test_round_float_modes() {
        let x = 1.0 + f64::EPSILON * 4.0;
        assert_eq!(round_float(x, 4, Rounding::Even), 1.0);
        assert!(round_float(x, 4, Rounding::Up) > 1.0);
        assert_eq!(round_float(x, 4, Rounding::Down), 1.0);
        assert_eq!(round_float(-x, 4, Rounding::Zero), -1.0);
    }

    #[test]
    fn test_printf_formatting() {
        let no_strings = |_: u64| -> Result<String> { Ok(String::new()) };
        let args = [
            TypedValue::from_sint(4, -42),
            TypedValue::from_float(4, 1.5),
            TypedValue::from_uint(4, 255),
        ];
        let out = format_printf("%5d|%.2f|%#x|%%", &args, &no_strings).unwrap();
        assert_eq!(out, "  -42|1.50|0xff|%");

        let args = [TypedValue::from_float(8, 12345.678)];
        assert_eq!(format_printf("%e", &args, &no_strings).unwrap(), "1.234568e+04");
        assert_eq!(format_printf("%g", &args, &no_strings).unwrap(), "12345.7");
        assert!(format_printf("%d", &[], &no_strings).is_err());
    }

    #[test]
    fn test_int_helpers() {
        assert_eq!(saturate(300, 8, false), 255);
        assert_eq!(saturate(-300, 8, true), -128);
        let v = TypedValue::from_uint(1, 0xff);
        assert_eq!(lane_i(&v, 0, 8, true), -1);
        assert_eq!(lane_i(&v, 0, 8, false), 255);
    }
}
