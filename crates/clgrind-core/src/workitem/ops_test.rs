use super::ops::*;
use crate::error::SimError;
use crate::ir::{AddressSpace, ArithFlags, BinaryOp, CastOp, FloatPredicate, IntPredicate, Type};
use crate::value::TypedValue;

fn int4(values: [u64; 4]) -> TypedValue {
    let mut v = TypedValue::new(4, 4);
    for (i, x) in values.iter().enumerate() {
        v.set_uint(i, *x);
    }
    v
}

#[test]
fn test_mask_and_sign_extend() {
    assert_eq!(mask(8), 0xff);
    assert_eq!(mask(64), u64::MAX);
    assert_eq!(sign_extend(0x80, 8), -128);
    assert_eq!(sign_extend(0x7f, 8), 127);
    assert_eq!(sign_extend(1, 1), -1);
}

#[test]
fn test_add_wraps_without_flags() {
    let a = TypedValue::from_uint(1, 200);
    let b = TypedValue::from_uint(1, 100);
    let sum = binary(BinaryOp::Add, ArithFlags::NONE, &a, &b, 8).unwrap();
    assert_eq!(sum.get_uint(0), 44);
}

#[test]
fn test_nsw_overflow_is_error() {
    let a = TypedValue::from_sint(4, i64::from(i32::MAX));
    let b = TypedValue::from_sint(4, 1);
    let err = binary(BinaryOp::Add, ArithFlags::NSW, &a, &b, 32).unwrap_err();
    assert!(matches!(err, SimError::ArithmeticOverflow { kind: "signed", .. }));

    let ok = binary(BinaryOp::Add, ArithFlags::NUW, &a, &b, 32).unwrap();
    assert_eq!(ok.get_uint(0), 0x8000_0000);
}

#[test]
fn test_nuw_sub_underflow_is_error() {
    let a = TypedValue::from_uint(4, 1);
    let b = TypedValue::from_uint(4, 2);
    let err = binary(BinaryOp::Sub, ArithFlags::NUW, &a, &b, 32).unwrap_err();
    assert!(matches!(err, SimError::ArithmeticOverflow { kind: "unsigned", .. }));
}

#[test]
fn test_division_errors() {
    let zero = TypedValue::from_uint(4, 0);
    let one = TypedValue::from_uint(4, 1);
    assert!(matches!(
        binary(BinaryOp::UDiv, ArithFlags::NONE, &one, &zero, 32),
        Err(SimError::DivisionByZero)
    ));
    assert!(matches!(
        binary(BinaryOp::SRem, ArithFlags::NONE, &one, &zero, 32),
        Err(SimError::DivisionByZero)
    ));

    let min = TypedValue::from_sint(4, i64::from(i32::MIN));
    let minus_one = TypedValue::from_sint(4, -1);
    assert!(matches!(
        binary(BinaryOp::SDiv, ArithFlags::NONE, &min, &minus_one, 32),
        Err(SimError::DivisionOverflow)
    ));
}

#[test]
fn test_signed_division_truncates() {
    let a = TypedValue::from_sint(4, -7);
    let b = TypedValue::from_sint(4, 2);
    let q = binary(BinaryOp::SDiv, ArithFlags::NONE, &a, &b, 32).unwrap();
    let r = binary(BinaryOp::SRem, ArithFlags::NONE, &a, &b, 32).unwrap();
    assert_eq!(q.get_sint(0), -3);
    assert_eq!(r.get_sint(0), -1);
}

#[test]
fn test_shifts_are_modulo_width() {
    let a = TypedValue::from_uint(4, 1);
    let b = TypedValue::from_uint(4, 33);
    let v = binary(BinaryOp::Shl, ArithFlags::NONE, &a, &b, 32).unwrap();
    assert_eq!(v.get_uint(0), 2);

    let neg = TypedValue::from_sint(4, -8);
    let one = TypedValue::from_uint(4, 1);
    assert_eq!(binary(BinaryOp::AShr, ArithFlags::NONE, &neg, &one, 32).unwrap().get_sint(0), -4);
    assert_eq!(
        binary(BinaryOp::LShr, ArithFlags::NONE, &neg, &one, 32).unwrap().get_uint(0),
        0x7fff_fffc
    );
}

#[test]
fn test_vector_lanes_are_independent() {
    let a = int4([1, 2, 3, 4]);
    let b = int4([10, 20, 30, 40]);
    let v = binary(BinaryOp::Mul, ArithFlags::NONE, &a, &b, 32).unwrap();
    assert_eq!((0..4).map(|i| v.get_uint(i)).collect::<Vec<_>>(), vec![10, 40, 90, 160]);

    let short = TypedValue::new(4, 2);
    assert!(binary(BinaryOp::Add, ArithFlags::NONE, &a, &short, 32).is_err());
}

#[test]
fn test_float_ops_round_to_width() {
    let a = TypedValue::from_float(4, 1.0);
    let b = TypedValue::from_float(4, 3.0);
    let q = binary(BinaryOp::FDiv, ArithFlags::NONE, &a, &b, 32).unwrap();
    assert_eq!(q.get_float(0), f64::from(1.0f32 / 3.0));
    assert_eq!(fneg(&q).get_float(0), -f64::from(1.0f32 / 3.0));
}

#[test]
fn test_icmp_signedness() {
    let a = TypedValue::from_sint(4, -1);
    let b = TypedValue::from_sint(4, 1);
    assert!(icmp(IntPredicate::Slt, &a, &b, 32).unwrap().get_bool(0));
    assert!(icmp(IntPredicate::Ugt, &a, &b, 32).unwrap().get_bool(0));
    assert!(!icmp(IntPredicate::Eq, &a, &b, 32).unwrap().get_bool(0));
}

#[test]
fn test_fcmp_ordering() {
    let nan = TypedValue::from_float(8, f64::NAN);
    let one = TypedValue::from_float(8, 1.0);
    assert!(!fcmp(FloatPredicate::Oeq, &nan, &nan).unwrap().get_bool(0));
    assert!(fcmp(FloatPredicate::Uno, &nan, &one).unwrap().get_bool(0));
    assert!(fcmp(FloatPredicate::Une, &nan, &nan).unwrap().get_bool(0));
    assert!(fcmp(FloatPredicate::Olt, &one, &TypedValue::from_float(8, 2.0)).unwrap().get_bool(0));
}

#[test]
fn test_int_casts() {
    let byte = TypedValue::from_uint(1, 0xf0);
    let sext = cast(CastOp::SExt, &byte, &Type::Int(8), &Type::Int(32)).unwrap();
    let zext = cast(CastOp::ZExt, &byte, &Type::Int(8), &Type::Int(32)).unwrap();
    assert_eq!(sext.get_uint(0), 0xffff_fff0);
    assert_eq!(zext.get_uint(0), 0xf0);

    let trunc = cast(CastOp::Trunc, &TypedValue::from_uint(4, 0x1234), &Type::Int(32), &Type::Int(8)).unwrap();
    assert_eq!(trunc.get_uint(0), 0x34);
}

#[test]
fn test_float_to_int_range() {
    let big = TypedValue::from_float(4, 300.0);
    assert!(matches!(
        cast(CastOp::FPToUI, &big, &Type::Float, &Type::Int(8)),
        Err(SimError::ConversionOutOfRange { .. })
    ));
    let neg = TypedValue::from_float(4, -2.7);
    assert!(cast(CastOp::FPToUI, &neg, &Type::Float, &Type::Int(32)).is_err());
    let ok = cast(CastOp::FPToSI, &neg, &Type::Float, &Type::Int(32)).unwrap();
    assert_eq!(ok.get_sint(0), -2);
}

#[test]
fn test_bitcast_reshapes() {
    let v = TypedValue::from_float(4, 1.0);
    let bits = cast(CastOp::BitCast, &v, &Type::Float, &Type::Int(32)).unwrap();
    assert_eq!(bits.get_uint(0), 0x3f80_0000);

    let halves = cast(CastOp::BitCast, &bits, &Type::Int(32), &Type::vector(Type::Int(16), 2)).unwrap();
    assert_eq!((halves.size(), halves.num()), (2, 2));
    assert_eq!(halves.get_uint(1), 0x3f80);
}

#[test]
fn test_select_and_lanes() {
    let a = int4([1, 2, 3, 4]);
    let b = int4([5, 6, 7, 8]);
    let mut cond = TypedValue::new(1, 4);
    cond.set_bool(1, true);
    cond.set_bool(3, true);
    let v = select(&cond, &a, &b).unwrap();
    assert_eq!((0..4).map(|i| v.get_uint(i)).collect::<Vec<_>>(), vec![5, 2, 7, 4]);

    assert_eq!(extract_element(&a, 2).unwrap().get_uint(0), 3);
    assert!(extract_element(&a, 4).is_err());
    let v = insert_element(&a, &TypedValue::from_uint(4, 9), 0).unwrap();
    assert_eq!(v.get_uint(0), 9);

    let v = shuffle(&a, &b, &[7, 0, -1]).unwrap();
    assert_eq!(v.num(), 3);
    assert_eq!((v.get_uint(0), v.get_uint(1), v.get_uint(2)), (8, 1, 0));
    assert!(shuffle(&a, &b, &[8]).is_err());
}

#[test]
fn test_aggregates() {
    let ty = Type::Struct(vec![Type::Int(8), Type::Int(32)]);
    let (size, num) = ty.value_shape();
    let agg = TypedValue::new(size, num);
    let agg = insert_value(&agg, &ty, &TypedValue::from_uint(4, 77), &[1]).unwrap();
    assert_eq!(extract_value(&agg, &ty, &[1]).unwrap().get_uint(0), 77);
    assert!(extract_value(&agg, &ty, &[2]).is_err());
}

#[test]
fn test_gep_offsets() {
    let ty = Type::Struct(vec![Type::Int(8), Type::Int(32), Type::array(Type::Int(16), 4)]);
    let offset = ty.field_offset(2).unwrap();
    let address = gep(&ty, 0x1000, &[1, 2, 3]).unwrap();
    assert_eq!(address, 0x1000 + ty.size_bytes() + offset + 6);

    assert_eq!(gep(&Type::Int(32), 0x1000, &[-1]).unwrap(), 0x1000 - 4);
    assert!(gep(&Type::Int(32), 0, &[0, 1]).is_err());
    assert_eq!(gep(&Type::Pointer(AddressSpace::Global), 8, &[]).unwrap(), 8);
}

#[test]
fn test_gep_struct_offset_wraps() {
    let ty = Type::Struct(vec![Type::array(Type::Int(8), 16), Type::Int(32)]);
    let first = i64::MAX / ty.size_bytes() as i64;
    let expected = 0x1000u64
        .wrapping_add((first as u64).wrapping_mul(ty.size_bytes()))
        .wrapping_add(16);
    assert_eq!(gep(&ty, 0x1000, &[first, 1]).unwrap(), expected);
}
