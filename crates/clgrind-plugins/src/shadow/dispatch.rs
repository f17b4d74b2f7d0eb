//! Shadow dispatch: the metadata rule of every pure opcode.
//!
//! Each arm mirrors the interpreter's handling of the same opcode, but
//! combines operand poison instead of operand data. Element-wise opcodes keep
//! lanes apart, so lane `i` of a result is poisoned exactly when lane `i` of
//! some operand is.

use super::value::ShadowValue;
use clgrind_core::ir::{CastOp, Opcode, Operand, Type};
use clgrind_core::TypedValue;

/// Operand lookup for [`propagate`].
pub trait ShadowOperands {
    /// Shadow of `operand` in the current frame.
    fn shadow(&self, operand: &Operand) -> ShadowValue;

    /// Runtime value of `operand`, when known.
    fn value(&self, operand: &Operand) -> Option<TypedValue>;

    fn operand_type(&self, operand: &Operand) -> Option<Type>;
}

/// Shadow of the value produced by `opcode`, shaped `(size, num)`.
///
/// Returns `None` for opcodes whose shadow depends on memory or on the call
/// stack (loads, calls, phis, allocas, terminators and stores).
pub fn propagate(opcode: &Opcode, shape: (usize, usize), operands: &impl ShadowOperands) -> Option<ShadowValue> {
    let (size, num) = shape;
    let shadow = match opcode {
        Opcode::Binary { lhs, rhs, .. } | Opcode::ICmp { lhs, rhs, .. } | Opcode::FCmp { lhs, rhs, .. } => {
            ShadowValue::combine(size, num, [&operands.shadow(lhs), &operands.shadow(rhs)])
        }
        Opcode::FNeg { operand } => ShadowValue::combine(size, num, [&operands.shadow(operand)]),

        Opcode::Cast { op, operand } => {
            let source = operands.shadow(operand);
            match op {
                // bit-preserving casts carry poison byte for byte
                CastOp::BitCast | CastOp::PtrToInt | CastOp::IntToPtr | CastOp::AddrSpaceCast
                    if source.byte_len() == size * num =>
                {
                    source.reshape(size, num)
                }
                _ => ShadowValue::combine(size, num, [&source]),
            }
        }

        Opcode::Select {
            condition,
            if_true,
            if_false,
        } => select(shape, operands, condition, if_true, if_false),

        Opcode::GetElementPtr { base, indices, .. } => {
            let mut pointer = operands.shadow(base).reshape(size, num);
            for index in indices {
                pointer.merge(&operands.shadow(index));
            }
            pointer
        }

        Opcode::ExtractElement { vector, index } => {
            let vector = operands.shadow(vector);
            match lane_index(operands, index) {
                Some(lane) => vector.lane(lane).reshape(size, num),
                None => ShadowValue::poisoned(size, num),
            }
        }
        Opcode::InsertElement { vector, element, index } => {
            let mut result = operands.shadow(vector).reshape(size, num);
            match lane_index(operands, index) {
                Some(lane) if lane < num => result.set_lane_from(lane, &operands.shadow(element)),
                _ => result = ShadowValue::poisoned(size, num),
            }
            result
        }
        Opcode::ShuffleVector { lhs, rhs, mask } => {
            let lhs = operands.shadow(lhs);
            let rhs = operands.shadow(rhs);
            let mut result = ShadowValue::defined(size, num);
            for (lane, &selector) in mask.iter().enumerate() {
                let source = match usize::try_from(selector) {
                    Ok(i) if i < lhs.num() => lhs.lane(i),
                    Ok(i) => rhs.lane(i - lhs.num()),
                    // undefined lane
                    Err(_) => ShadowValue::poisoned(size, 1),
                };
                result.set_lane_from(lane, &source);
            }
            result
        }

        Opcode::ExtractValue { aggregate, indices } => {
            let whole = operands.shadow(aggregate);
            match operands
                .operand_type(aggregate)
                .and_then(|ty| member_offset(&ty, indices))
            {
                Some(offset) => whole.slice(offset, size * num).reshape(size, num),
                None => ShadowValue::uniform(size, num, whole.is_poisoned()),
            }
        }
        Opcode::InsertValue {
            aggregate,
            element,
            indices,
        } => {
            let mut result = operands.shadow(aggregate).reshape(size, num);
            let element = operands.shadow(element);
            match operands
                .operand_type(aggregate)
                .and_then(|ty| member_offset(&ty, indices))
            {
                Some(offset) => result.splice(offset, &element),
                None => result.merge(&element),
            }
            result
        }

        _ => return None,
    };
    Some(shadow)
}

fn select(
    shape: (usize, usize),
    operands: &impl ShadowOperands,
    condition: &Operand,
    if_true: &Operand,
    if_false: &Operand,
) -> ShadowValue {
    let (size, num) = shape;
    let cond_shadow = operands.shadow(condition);
    let cond_value = operands.value(condition);
    let if_true = operands.shadow(if_true).reshape(size, num);
    let if_false = operands.shadow(if_false).reshape(size, num);

    if cond_shadow.num() <= 1 || num == 1 {
        if cond_shadow.is_poisoned() {
            return ShadowValue::poisoned(size, num);
        }
        return match cond_value {
            Some(value) if value.get_bool(0) => if_true,
            Some(_) => if_false,
            None => ShadowValue::combine(size, num, [&if_true, &if_false]),
        };
    }

    let mut result = ShadowValue::defined(size, num);
    for lane in 0..num {
        let chosen = if cond_shadow.lane_poisoned(lane) {
            ShadowValue::poisoned(size, 1)
        } else {
            match &cond_value {
                Some(value) if value.get_bool(lane) => if_true.lane(lane),
                Some(_) => if_false.lane(lane),
                None => ShadowValue::combine(size, 1, [&if_true.lane(lane), &if_false.lane(lane)]),
            }
        };
        result.set_lane_from(lane, &chosen);
    }
    result
}

/// Lane selected by `index`, or `None` if the index itself is poisoned or
/// unknown.
fn lane_index(operands: &impl ShadowOperands, index: &Operand) -> Option<usize> {
    if operands.shadow(index).is_poisoned() {
        return None;
    }
    usize::try_from(operands.value(index)?.get_uint(0)).ok()
}

/// Byte offset of the member reached by `indices`.
fn member_offset(ty: &Type, indices: &[u32]) -> Option<usize> {
    let mut ty = ty;
    let mut offset = 0u64;
    for &index in indices {
        offset += ty.member_offset(u64::from(index))?;
        ty = ty.member(u64::from(index))?;
    }
    usize::try_from(offset).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clgrind_core::ir::{ArithFlags, BinaryOp, Constant, IntPredicate, ValueId};
    use std::collections::HashMap;

    /// Operands backed by maps from value id.
    #[derive(Default)]
    struct Frame {
        shadows: HashMap<u32, ShadowValue>,
        values: HashMap<u32, TypedValue>,
        types: HashMap<u32, Type>,
    }

    impl ShadowOperands for Frame {
        fn shadow(&self, operand: &Operand) -> ShadowValue {
            match operand {
                Operand::Value(id) => self.shadows[&id.0].clone(),
                Operand::Const(c) => {
                    let (size, num) = c.ty.value_shape();
                    ShadowValue::uniform(size, num, c.undef)
                }
                Operand::Global { .. } => ShadowValue::defined(8, 1),
            }
        }

        fn value(&self, operand: &Operand) -> Option<TypedValue> {
            match operand {
                Operand::Value(id) => self.values.get(&id.0).cloned(),
                Operand::Const(c) => Some(TypedValue::from_constant(c)),
                Operand::Global { .. } => None,
            }
        }

        fn operand_type(&self, operand: &Operand) -> Option<Type> {
            match operand {
                Operand::Value(id) => self.types.get(&id.0).cloned(),
                Operand::Const(c) => Some(c.ty.clone()),
                Operand::Global { space, .. } => Some(Type::Pointer(*space)),
            }
        }
    }

    fn value(id: u32) -> Operand {
        Operand::Value(ValueId(id))
    }

    #[test]
    fn test_binary_is_lane_wise_or() {
        let mut frame = Frame::default();
        let mut a = ShadowValue::defined(4, 4);
        a.set_lane(1, true);
        let mut b = ShadowValue::defined(4, 4);
        b.set_lane(3, true);
        frame.shadows.insert(0, a);
        frame.shadows.insert(1, b);

        let add = Opcode::Binary {
            op: BinaryOp::Add,
            lhs: value(0),
            rhs: value(1),
            flags: ArithFlags::NONE,
        };
        let result = propagate(&add, (4, 4), &frame).unwrap();
        let lanes: Vec<bool> = (0..4).map(|l| result.lane_poisoned(l)).collect();
        assert_eq!(lanes, vec![false, true, false, true]);
    }

    #[test]
    fn test_compare_shapes_to_bool_lanes() {
        let mut frame = Frame::default();
        frame.shadows.insert(0, ShadowValue::poisoned(4, 1));
        let cmp = Opcode::ICmp {
            pred: IntPredicate::Eq,
            lhs: value(0),
            rhs: Operand::Const(Constant::i32(3)),
        };
        let result = propagate(&cmp, (1, 1), &frame).unwrap();
        assert_eq!(result.byte_len(), 1);
        assert!(result.is_poisoned());
    }

    #[test]
    fn test_select_follows_condition() {
        let mut frame = Frame::default();
        frame.shadows.insert(0, ShadowValue::defined(1, 1));
        frame.values.insert(0, TypedValue::from_bool(false));
        frame.shadows.insert(1, ShadowValue::poisoned(4, 1));
        frame.shadows.insert(2, ShadowValue::defined(4, 1));

        let select = Opcode::Select {
            condition: value(0),
            if_true: value(1),
            if_false: value(2),
        };
        assert!(!propagate(&select, (4, 1), &frame).unwrap().is_poisoned());

        frame.shadows.insert(0, ShadowValue::poisoned(1, 1));
        assert!(propagate(&select, (4, 1), &frame).unwrap().is_poisoned());
    }

    #[test]
    fn test_undef_vector_filled_by_insert_and_splat() {
        let mut frame = Frame::default();
        frame.shadows.insert(0, ShadowValue::defined(4, 1));
        let vec4 = Type::vector(Type::I32, 4);

        let insert = Opcode::InsertElement {
            vector: Operand::Const(Constant::undef(vec4)),
            element: value(0),
            index: Operand::Const(Constant::i32(0)),
        };
        let inserted = propagate(&insert, (4, 4), &frame).unwrap();
        assert!(!inserted.lane_poisoned(0));
        assert!(inserted.lane_poisoned(1));

        frame.shadows.insert(1, inserted);
        let splat = Opcode::ShuffleVector {
            lhs: value(1),
            rhs: value(1),
            mask: vec![0, 0, 0, 0],
        };
        assert!(!propagate(&splat, (4, 4), &frame).unwrap().is_poisoned());

        let partial = Opcode::ShuffleVector {
            lhs: value(1),
            rhs: value(1),
            mask: vec![0, -1],
        };
        let result = propagate(&partial, (4, 2), &frame).unwrap();
        assert!(!result.lane_poisoned(0));
        assert!(result.lane_poisoned(1));
    }

    #[test]
    fn test_extract_value_uses_member_offset() {
        let mut frame = Frame::default();
        let pair = Type::Struct(vec![Type::I32, Type::I64]);
        let mut shadow = ShadowValue::defined(16, 1);
        shadow.splice(8, &ShadowValue::poisoned(8, 1));
        frame.shadows.insert(0, shadow);
        frame.types.insert(0, pair);

        let first = Opcode::ExtractValue {
            aggregate: value(0),
            indices: vec![0],
        };
        let second = Opcode::ExtractValue {
            aggregate: value(0),
            indices: vec![1],
        };
        assert!(!propagate(&first, (4, 1), &frame).unwrap().is_poisoned());
        assert!(propagate(&second, (8, 1), &frame).unwrap().is_poisoned());
    }

    #[test]
    fn test_memory_opcodes_are_not_pure() {
        let frame = Frame::default();
        let ret = Opcode::Ret { value: None };
        assert!(propagate(&ret, (0, 0), &frame).is_none());
    }
}
