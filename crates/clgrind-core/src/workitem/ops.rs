//! Typed-value operation handlers
//!
//! Every handler works element-wise over [`TypedValue`] lanes, so scalars and
//! vectors share one code path. Integer results are masked to the bit width of
//! the result type; floats are rounded to the result element width on store.

use crate::error::{Result, SimError};
use crate::ir::{ArithFlags, BinaryOp, CastOp, FloatPredicate, IntPredicate, Type};
use crate::value::TypedValue;

/// All-ones mask of `bits` width.
#[inline]
pub fn mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Sign-extend the low `bits` of `value`.
#[inline]
pub fn sign_extend(value: u64, bits: u32) -> i64 {
    if bits == 0 || bits >= 64 {
        value as i64
    } else {
        let shift = 64 - bits;
        ((value << shift) as i64) >> shift
    }
}

fn uint_lane(value: &TypedValue, index: usize, bits: u32) -> u64 {
    value.get_uint(index) & mask(bits)
}

fn sint_lane(value: &TypedValue, index: usize, bits: u32) -> i64 {
    sign_extend(value.get_uint(index), bits)
}

fn check_lanes(lhs: &TypedValue, rhs: &TypedValue, what: &str) -> Result<()> {
    if lhs.num() != rhs.num() || lhs.size() != rhs.size() {
        return Err(SimError::malformed(format!(
            "{what}: operand shapes differ ({}x{} vs {}x{})",
            lhs.num(),
            lhs.size(),
            rhs.num(),
            rhs.size()
        )));
    }
    Ok(())
}

// ================================================================================================
// Binary Operations
// ================================================================================================

/// Evaluate `lhs op rhs` for `bits`-wide integer lanes or float lanes.
pub fn binary(op: BinaryOp, flags: ArithFlags, lhs: &TypedValue, rhs: &TypedValue, bits: u32) -> Result<TypedValue> {
    check_lanes(lhs, rhs, op.name())?;
    let mut result = TypedValue::new(lhs.size(), lhs.num());
    for i in 0..lhs.num() {
        if op.is_float() {
            let (a, b) = (lhs.get_float(i), rhs.get_float(i));
            let value = match op {
                BinaryOp::FAdd => a + b,
                BinaryOp::FSub => a - b,
                BinaryOp::FMul => a * b,
                BinaryOp::FDiv => a / b,
                _ => a % b,
            };
            result.set_float(i, value);
        } else {
            result.set_uint(i, int_binary(op, flags, lhs, rhs, i, bits)?);
        }
    }
    Ok(result)
}

fn int_binary(op: BinaryOp, flags: ArithFlags, lhs: &TypedValue, rhs: &TypedValue, i: usize, bits: u32) -> Result<u64> {
    let m = mask(bits);
    let (ua, ub) = (uint_lane(lhs, i, bits), uint_lane(rhs, i, bits));
    let (sa, sb) = (sint_lane(lhs, i, bits), sint_lane(rhs, i, bits));
    let smin = if bits >= 64 { i64::MIN } else { -(1i64 << (bits - 1)) };
    let smax = if bits >= 64 { i64::MAX } else { (1i64 << (bits - 1)) - 1 };
    let signed_fits = |v: i128| v >= i128::from(smin) && v <= i128::from(smax);
    let unsigned_fits = |v: u128| v <= u128::from(m);

    let value = match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul => {
            let (wide_s, wide_u) = match op {
                BinaryOp::Add => (
                    i128::from(sa) + i128::from(sb),
                    Some(u128::from(ua) + u128::from(ub)),
                ),
                BinaryOp::Sub => (i128::from(sa) - i128::from(sb), u128::from(ua).checked_sub(u128::from(ub))),
                _ => (
                    i128::from(sa) * i128::from(sb),
                    Some(u128::from(ua) * u128::from(ub)),
                ),
            };
            if flags.nsw && !signed_fits(wide_s) {
                return Err(SimError::overflow(op.name(), true));
            }
            if flags.nuw && !wide_u.is_some_and(unsigned_fits) {
                return Err(SimError::overflow(op.name(), false));
            }
            match op {
                BinaryOp::Add => ua.wrapping_add(ub),
                BinaryOp::Sub => ua.wrapping_sub(ub),
                _ => ua.wrapping_mul(ub),
            }
        }
        BinaryOp::UDiv | BinaryOp::URem => {
            if ub == 0 {
                return Err(SimError::DivisionByZero);
            }
            if op == BinaryOp::UDiv {
                ua / ub
            } else {
                ua % ub
            }
        }
        BinaryOp::SDiv | BinaryOp::SRem => {
            if sb == 0 {
                return Err(SimError::DivisionByZero);
            }
            if sa == smin && sb == -1 {
                return Err(SimError::DivisionOverflow);
            }
            let v = if op == BinaryOp::SDiv { sa / sb } else { sa % sb };
            v as u64
        }
        BinaryOp::Shl => {
            let shift = (ub % u64::from(bits.max(1))) as u32;
            let v = ua << shift;
            if flags.nuw && (v & m) >> shift != ua {
                return Err(SimError::overflow("shl", false));
            }
            if flags.nsw && sign_extend(v & m, bits) >> shift != sa {
                return Err(SimError::overflow("shl", true));
            }
            v
        }
        BinaryOp::LShr => ua >> (ub % u64::from(bits.max(1))),
        BinaryOp::AShr => (sa >> (ub % u64::from(bits.max(1)))) as u64,
        BinaryOp::And => ua & ub,
        BinaryOp::Or => ua | ub,
        BinaryOp::Xor => ua ^ ub,
        _ => return Err(SimError::malformed(format!("{} on integer operands", op.name()))),
    };
    Ok(value & m)
}

pub fn fneg(operand: &TypedValue) -> TypedValue {
    let mut result = TypedValue::new(operand.size(), operand.num());
    for i in 0..operand.num() {
        result.set_float(i, -operand.get_float(i));
    }
    result
}

// ================================================================================================
// Comparisons
// ================================================================================================

/// Integer comparison; `bits` is the operand element width.
pub fn icmp(pred: IntPredicate, lhs: &TypedValue, rhs: &TypedValue, bits: u32) -> Result<TypedValue> {
    check_lanes(lhs, rhs, "icmp")?;
    let mut result = TypedValue::new(1, lhs.num());
    for i in 0..lhs.num() {
        let (ua, ub) = (uint_lane(lhs, i, bits), uint_lane(rhs, i, bits));
        let (sa, sb) = (sint_lane(lhs, i, bits), sint_lane(rhs, i, bits));
        let outcome = match pred {
            IntPredicate::Eq => ua == ub,
            IntPredicate::Ne => ua != ub,
            IntPredicate::Ugt => ua > ub,
            IntPredicate::Uge => ua >= ub,
            IntPredicate::Ult => ua < ub,
            IntPredicate::Ule => ua <= ub,
            IntPredicate::Sgt => sa > sb,
            IntPredicate::Sge => sa >= sb,
            IntPredicate::Slt => sa < sb,
            IntPredicate::Sle => sa <= sb,
        };
        result.set_bool(i, outcome);
    }
    Ok(result)
}

pub fn fcmp(pred: FloatPredicate, lhs: &TypedValue, rhs: &TypedValue) -> Result<TypedValue> {
    check_lanes(lhs, rhs, "fcmp")?;
    let mut result = TypedValue::new(1, lhs.num());
    for i in 0..lhs.num() {
        let (a, b) = (lhs.get_float(i), rhs.get_float(i));
        let unordered = a.is_nan() || b.is_nan();
        let outcome = match pred {
            FloatPredicate::False => false,
            FloatPredicate::True => true,
            FloatPredicate::Ord => !unordered,
            FloatPredicate::Uno => unordered,
            FloatPredicate::Oeq => !unordered && a == b,
            FloatPredicate::Ogt => !unordered && a > b,
            FloatPredicate::Oge => !unordered && a >= b,
            FloatPredicate::Olt => !unordered && a < b,
            FloatPredicate::Ole => !unordered && a <= b,
            FloatPredicate::One => !unordered && a != b,
            FloatPredicate::Ueq => unordered || a == b,
            FloatPredicate::Ugt => unordered || a > b,
            FloatPredicate::Uge => unordered || a >= b,
            FloatPredicate::Ult => unordered || a < b,
            FloatPredicate::Ule => unordered || a <= b,
            FloatPredicate::Une => unordered || a != b,
        };
        result.set_bool(i, outcome);
    }
    Ok(result)
}

// ================================================================================================
// Conversions
// ================================================================================================

/// Convert `operand` of type `from` to type `to`.
pub fn cast(op: CastOp, operand: &TypedValue, from: &Type, to: &Type) -> Result<TypedValue> {
    if op == CastOp::BitCast {
        let (size, num) = to.value_shape();
        return Ok(operand.reshape(size, num));
    }

    let from_bits = from.scalar_bits();
    let to_bits = to.scalar_bits();
    let (size, num) = to.value_shape();
    if num != operand.num() {
        return Err(SimError::malformed(format!(
            "{}: {} lanes to {} lanes",
            op.name(),
            operand.num(),
            num
        )));
    }

    let mut result = TypedValue::new(size, num);
    for i in 0..num {
        match op {
            CastOp::Trunc
            | CastOp::ZExt
            | CastOp::PtrToInt
            | CastOp::IntToPtr
            | CastOp::AddrSpaceCast
            | CastOp::BitCast => {
                result.set_uint(i, uint_lane(operand, i, from_bits) & mask(to_bits));
            }
            CastOp::SExt => {
                result.set_uint(i, sint_lane(operand, i, from_bits) as u64 & mask(to_bits));
            }
            CastOp::FPTrunc | CastOp::FPExt => result.set_float(i, operand.get_float(i)),
            CastOp::UIToFP => result.set_float(i, uint_lane(operand, i, from_bits) as f64),
            CastOp::SIToFP => result.set_float(i, sint_lane(operand, i, from_bits) as f64),
            CastOp::FPToUI => {
                let value = operand.get_float(i).trunc();
                let limit = 2f64.powi(to_bits as i32);
                if value.is_nan() || value < 0.0 || value >= limit {
                    return Err(SimError::ConversionOutOfRange {
                        value: operand.get_float(i),
                        target: format!("u{to_bits}"),
                    });
                }
                result.set_uint(i, value as u64);
            }
            CastOp::FPToSI => {
                let value = operand.get_float(i).trunc();
                let limit = 2f64.powi(to_bits as i32 - 1);
                if value.is_nan() || value < -limit || value >= limit {
                    return Err(SimError::ConversionOutOfRange {
                        value: operand.get_float(i),
                        target: format!("i{to_bits}"),
                    });
                }
                result.set_uint(i, (value as i64) as u64 & mask(to_bits));
            }
        }
    }
    Ok(result)
}

// ================================================================================================
// Selection and Lanes
// ================================================================================================

/// Lane-wise select for vector conditions, whole-value for scalar ones.
pub fn select(condition: &TypedValue, if_true: &TypedValue, if_false: &TypedValue) -> Result<TypedValue> {
    check_lanes(if_true, if_false, "select")?;
    if condition.num() == 1 {
        return Ok(if condition.get_bool(0) {
            if_true.clone()
        } else {
            if_false.clone()
        });
    }
    if condition.num() != if_true.num() {
        return Err(SimError::malformed("select: condition lane count differs"));
    }
    let mut result = if_false.clone();
    for i in 0..condition.num() {
        if condition.get_bool(i) {
            result.set_element(i, &if_true.element(i));
        }
    }
    Ok(result)
}

pub fn extract_element(vector: &TypedValue, index: u64) -> Result<TypedValue> {
    if index as usize >= vector.num() {
        return Err(SimError::malformed(format!(
            "extractelement index {index} out of range for {} lanes",
            vector.num()
        )));
    }
    Ok(vector.element(index as usize))
}

pub fn insert_element(vector: &TypedValue, element: &TypedValue, index: u64) -> Result<TypedValue> {
    if index as usize >= vector.num() {
        return Err(SimError::malformed(format!(
            "insertelement index {index} out of range for {} lanes",
            vector.num()
        )));
    }
    let mut result = vector.clone();
    result.set_element(index as usize, element);
    Ok(result)
}

/// Build a vector from lanes of `lhs ++ rhs`; negative mask entries give
/// zero lanes.
pub fn shuffle(lhs: &TypedValue, rhs: &TypedValue, mask: &[i32]) -> Result<TypedValue> {
    let mut result = TypedValue::new(lhs.size(), mask.len());
    for (i, &m) in mask.iter().enumerate() {
        if m < 0 {
            continue;
        }
        let m = m as usize;
        let lane = if m < lhs.num() {
            lhs.element(m)
        } else if m - lhs.num() < rhs.num() {
            rhs.element(m - lhs.num())
        } else {
            return Err(SimError::malformed(format!("shufflevector mask entry {m} out of range")));
        };
        result.set_element(i, &lane);
    }
    Ok(result)
}

/// Byte offset and type of the member reached by `indices` in `ty`.
pub fn aggregate_member<'t>(ty: &'t Type, indices: &[u32]) -> Result<(usize, &'t Type)> {
    let mut offset = 0u64;
    let mut current = ty;
    for &index in indices {
        let index = u64::from(index);
        offset += current
            .member_offset(index)
            .ok_or_else(|| SimError::malformed(format!("no member {index} in {current}")))?;
        current = current
            .member(index)
            .ok_or_else(|| SimError::malformed(format!("no member {index} in {current}")))?;
    }
    Ok((offset as usize, current))
}

pub fn extract_value(aggregate: &TypedValue, ty: &Type, indices: &[u32]) -> Result<TypedValue> {
    let (offset, member) = aggregate_member(ty, indices)?;
    let (size, num) = member.value_shape();
    let bytes = aggregate
        .bytes()
        .get(offset..offset + size * num)
        .ok_or_else(|| SimError::malformed("extractvalue past end of aggregate"))?;
    Ok(TypedValue::from_bytes(size, num, bytes))
}

pub fn insert_value(aggregate: &TypedValue, ty: &Type, element: &TypedValue, indices: &[u32]) -> Result<TypedValue> {
    let (offset, _) = aggregate_member(ty, indices)?;
    let mut result = aggregate.clone();
    let target = result
        .bytes_mut()
        .get_mut(offset..offset + element.byte_len())
        .ok_or_else(|| SimError::malformed("insertvalue past end of aggregate"))?;
    target.copy_from_slice(element.bytes());
    Ok(result)
}

/// Address reached by indexing `base` with `indices` over `source`.
pub fn gep(source: &Type, base: u64, indices: &[i64]) -> Result<u64> {
    let Some((&first, rest)) = indices.split_first() else {
        return Ok(base);
    };
    let mut offset = first.wrapping_mul(source.size_bytes() as i64);
    let mut current = source;
    for &index in rest {
        match current {
            Type::Struct(_) => {
                let field = current
                    .field_offset(index as usize)
                    .ok_or_else(|| SimError::malformed(format!("no field {index} in {current}")))?;
                offset = offset.wrapping_add(field as i64);
            }
            Type::Array(element, _) | Type::Vector(element, _) => {
                offset = offset.wrapping_add(index.wrapping_mul(element.size_bytes() as i64));
            }
            other => return Err(SimError::malformed(format!("cannot index into {other}"))),
        }
        current = current
            .member(index as u64)
            .ok_or_else(|| SimError::malformed(format!("no member {index} in {current}")))?;
    }
    Ok(base.wrapping_add(offset as u64))
}
