//! Core IR types
//!
//! - Address spaces
//! - Value types and their memory layout
//! - Identifiers for values, blocks, functions and globals
//! - Constants and operands
//! - Source locations

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size in bytes of a pointer in every address space.
pub const POINTER_SIZE: u64 = 8;

// ================================================================================================
// Address Spaces
// ================================================================================================

/// Memory region class with its own lifetime and visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AddressSpace {
    /// Per work-item.
    Private,
    /// Visible to every work-item of the invocation and to the host.
    Global,
    /// Read-only data visible to every work-item.
    Constant,
    /// Shared by the work-items of one work-group.
    Local,
}

impl AddressSpace {
    pub const ALL: [AddressSpace; 4] = [
        AddressSpace::Private,
        AddressSpace::Global,
        AddressSpace::Constant,
        AddressSpace::Local,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            AddressSpace::Private => "private",
            AddressSpace::Global => "global",
            AddressSpace::Constant => "constant",
            AddressSpace::Local => "local",
        }
    }

    /// Stable index usable for per-space tables.
    pub const fn index(self) -> usize {
        match self {
            AddressSpace::Private => 0,
            AddressSpace::Global => 1,
            AddressSpace::Constant => 2,
            AddressSpace::Local => 3,
        }
    }

    /// Global and constant data live in the invocation-wide memory.
    pub const fn is_device_wide(self) -> bool {
        matches!(self, AddressSpace::Global | AddressSpace::Constant)
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ================================================================================================
// Value Types
// ================================================================================================

/// Type of an SSA value or of memory contents.
///
/// Pointers are opaque: the pointee type is carried by the instructions that
/// dereference them (`Load`, `GetElementPtr`, ...), the address space by the
/// pointer type itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Void,
    /// Integer of the given bit width (1, 8, 16, 32 or 64).
    Int(u32),
    Half,
    Float,
    Double,
    Pointer(AddressSpace),
    Vector(Box<Type>, u32),
    Array(Box<Type>, u64),
    Struct(Vec<Type>),
}

impl Type {
    pub const BOOL: Type = Type::Int(1);
    pub const I8: Type = Type::Int(8);
    pub const I16: Type = Type::Int(16);
    pub const I32: Type = Type::Int(32);
    pub const I64: Type = Type::Int(64);

    /// Vector of `count` elements of `element`.
    pub fn vector(element: Type, count: u32) -> Type {
        Type::Vector(Box::new(element), count)
    }

    /// Array of `count` elements of `element`.
    pub fn array(element: Type, count: u64) -> Type {
        Type::Array(Box::new(element), count)
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    pub fn is_int(&self) -> bool {
        matches!(self.scalar(), Type::Int(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(self.scalar(), Type::Half | Type::Float | Type::Double)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self.scalar(), Type::Pointer(_))
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, Type::Vector(..))
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Type::Array(..) | Type::Struct(_))
    }

    /// Element type for vectors, the type itself otherwise.
    pub fn scalar(&self) -> &Type {
        match self {
            Type::Vector(element, _) => element,
            other => other,
        }
    }

    /// Address space of a pointer (or pointer vector) type.
    pub fn address_space(&self) -> Option<AddressSpace> {
        match self.scalar() {
            Type::Pointer(space) => Some(*space),
            _ => None,
        }
    }

    /// Bit width of the scalar element.
    pub fn scalar_bits(&self) -> u32 {
        match self.scalar() {
            Type::Int(bits) => *bits,
            Type::Half => 16,
            Type::Float => 32,
            Type::Double => 64,
            Type::Pointer(_) => 64,
            _ => 0,
        }
    }

    /// Number of vector lanes (1 for scalars and aggregates).
    pub fn lanes(&self) -> u32 {
        match self {
            Type::Vector(_, count) => *count,
            _ => 1,
        }
    }

    /// Bytes occupied by one value of this type in memory, including
    /// trailing padding (3-element vectors occupy four lanes).
    pub fn size_bytes(&self) -> u64 {
        match self {
            Type::Void => 0,
            Type::Int(bits) => u64::from(bits.div_ceil(8)),
            Type::Half => 2,
            Type::Float => 4,
            Type::Double => 8,
            Type::Pointer(_) => POINTER_SIZE,
            Type::Vector(element, count) => {
                let lanes = if *count == 3 { 4 } else { u64::from(*count) };
                element.size_bytes() * lanes
            }
            Type::Array(element, count) => element.size_bytes() * count,
            Type::Struct(fields) => {
                let mut offset = 0;
                for field in fields {
                    offset = align_to(offset, field.alignment()) + field.size_bytes();
                }
                align_to(offset, self.alignment())
            }
        }
    }

    /// Natural alignment in bytes.
    pub fn alignment(&self) -> u64 {
        match self {
            Type::Void => 1,
            Type::Vector(..) => self.size_bytes().max(1),
            Type::Array(element, _) => element.alignment(),
            Type::Struct(fields) => fields.iter().map(Type::alignment).max().unwrap_or(1),
            scalar => scalar.size_bytes().max(1),
        }
    }

    /// Byte offset of field `index` within a struct.
    pub fn field_offset(&self, index: usize) -> Option<u64> {
        match self {
            Type::Struct(fields) if index < fields.len() => {
                let mut offset = 0;
                for field in &fields[..index] {
                    offset = align_to(offset, field.alignment()) + field.size_bytes();
                }
                Some(align_to(offset, fields[index].alignment()))
            }
            _ => None,
        }
    }

    /// Type of member `index` of an aggregate or vector.
    pub fn member(&self, index: u64) -> Option<&Type> {
        match self {
            Type::Struct(fields) => fields.get(usize::try_from(index).ok()?),
            Type::Array(element, _) | Type::Vector(element, _) => Some(element),
            _ => None,
        }
    }

    /// Byte offset of member `index` of an aggregate or vector.
    pub fn member_offset(&self, index: u64) -> Option<u64> {
        match self {
            Type::Struct(_) => self.field_offset(usize::try_from(index).ok()?),
            Type::Array(element, _) | Type::Vector(element, _) => Some(element.size_bytes() * index),
            _ => None,
        }
    }

    /// `(element_size, element_count)` of a runtime value of this type.
    ///
    /// Scalars and vectors are element-addressable; aggregates are carried
    /// as a single opaque element of their full size.
    pub fn value_shape(&self) -> (usize, usize) {
        match self {
            Type::Void => (0, 0),
            Type::Int(1) => (1, 1),
            Type::Vector(element, count) => (element.size_bytes() as usize, *count as usize),
            other => (other.size_bytes() as usize, 1),
        }
    }
}

/// Round `offset` up to a multiple of `align`.
pub fn align_to(offset: u64, align: u64) -> u64 {
    if align <= 1 {
        offset
    } else {
        offset.div_ceil(align) * align
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Int(bits) => write!(f, "i{bits}"),
            Type::Half => write!(f, "half"),
            Type::Float => write!(f, "float"),
            Type::Double => write!(f, "double"),
            Type::Pointer(space) => write!(f, "ptr({space})"),
            Type::Vector(element, count) => write!(f, "<{count} x {element}>"),
            Type::Array(element, count) => write!(f, "[{count} x {element}]"),
            Type::Struct(fields) => {
                write!(f, "{{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{field}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

// ================================================================================================
// Identifiers
// ================================================================================================

macro_rules! dense_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            pub const fn new(index: u32) -> Self {
                $name(index)
            }

            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

dense_id!(
    /// Function-local SSA value slot. Parameters come first.
    ValueId,
    "%"
);
dense_id!(
    /// Basic block index within a function.
    BlockId,
    "bb"
);
dense_id!(
    /// Function index within a module.
    FunctionId,
    "fn"
);
dense_id!(
    /// Program-scope variable index within a module.
    GlobalId,
    "@"
);

/// Stable identity of one instruction in a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstructionRef {
    pub function: FunctionId,
    pub block: BlockId,
    pub index: u32,
}

impl InstructionRef {
    pub const fn new(function: FunctionId, block: BlockId, index: u32) -> Self {
        Self { function, block, index }
    }
}

impl fmt::Display for InstructionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.function, self.block, self.index)
    }
}

/// Source position attached to an instruction by the front end.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DebugLoc {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl DebugLoc {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for DebugLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

// ================================================================================================
// Constants and Operands
// ================================================================================================

/// Embedded constant, little-endian.
///
/// `undef` marks values the front end left unspecified; they execute as
/// zero bytes and are treated as uninitialized by analyses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constant {
    pub ty: Type,
    pub data: Vec<u8>,
    pub undef: bool,
}

impl Constant {
    /// Integer constant (splatted across lanes for vector types).
    pub fn int(ty: Type, value: u64) -> Self {
        let (size, num) = ty.value_shape();
        let bytes = value.to_le_bytes();
        let lane = &bytes[..size.min(8)];
        let data = lane.repeat(num);
        Self { ty, data, undef: false }
    }

    /// Floating-point constant (splatted across lanes for vector types).
    pub fn float(ty: Type, value: f64) -> Self {
        let (size, num) = ty.value_shape();
        let lane: Vec<u8> = match size {
            2 => half::f16::from_f64(value).to_bits().to_le_bytes().to_vec(),
            4 => (value as f32).to_le_bytes().to_vec(),
            _ => value.to_le_bytes().to_vec(),
        };
        let data = lane.repeat(num);
        Self { ty, data, undef: false }
    }

    pub fn bool(value: bool) -> Self {
        Self::int(Type::BOOL, u64::from(value))
    }

    pub fn i32(value: i32) -> Self {
        Self::int(Type::I32, value as u32 as u64)
    }

    pub fn i64(value: i64) -> Self {
        Self::int(Type::I64, value as u64)
    }

    pub fn f32(value: f32) -> Self {
        Self::float(Type::Float, f64::from(value))
    }

    pub fn f64(value: f64) -> Self {
        Self::float(Type::Double, value)
    }

    pub fn null(space: AddressSpace) -> Self {
        Self::zero(Type::Pointer(space))
    }

    /// All-zero value of `ty` (`zeroinitializer`).
    pub fn zero(ty: Type) -> Self {
        let (size, num) = ty.value_shape();
        Self {
            ty,
            data: vec![0; size * num],
            undef: false,
        }
    }

    pub fn undef(ty: Type) -> Self {
        Self {
            undef: true,
            ..Self::zero(ty)
        }
    }

    /// Vector built from per-lane constants of the element type.
    pub fn vector(element: Type, lanes: &[Constant]) -> Self {
        let data = lanes.iter().flat_map(|c| c.data.iter().copied()).collect();
        Self {
            ty: Type::vector(element, lanes.len() as u32),
            data,
            undef: lanes.iter().any(|c| c.undef),
        }
    }

    /// Aggregate or vector constant from raw bytes.
    pub fn from_bytes(ty: Type, data: Vec<u8>) -> Self {
        Self { ty, data, undef: false }
    }
}

/// Instruction operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    /// SSA value defined earlier in the same function (or a parameter).
    Value(ValueId),
    /// Embedded constant.
    Const(Constant),
    /// Address of a program-scope variable.
    Global { id: GlobalId, space: AddressSpace },
}

impl Operand {
    pub fn as_value(&self) -> Option<ValueId> {
        match self {
            Operand::Value(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_const(&self) -> Option<&Constant> {
        match self {
            Operand::Const(c) => Some(c),
            _ => None,
        }
    }
}

impl From<ValueId> for Operand {
    fn from(id: ValueId) -> Self {
        Operand::Value(id)
    }
}

impl From<Constant> for Operand {
    fn from(constant: Constant) -> Self {
        Operand::Const(constant)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Value(id) => write!(f, "{id}"),
            Operand::Const(c) if c.undef => write!(f, "{} undef", c.ty),
            Operand::Const(c) => write!(f, "{} {:02x?}", c.ty, c.data),
            Operand::Global { id, .. } => write!(f, "{id}"),
        }
    }
}

// ================================================================================================
// Tests
// ================================================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_sizes() {
        assert_eq!(Type::BOOL.size_bytes(), 1);
        assert_eq!(Type::I16.size_bytes(), 2);
        assert_eq!(Type::Half.size_bytes(), 2);
        assert_eq!(Type::Double.size_bytes(), 8);
        assert_eq!(Type::Pointer(AddressSpace::Local).size_bytes(), 8);
    }

    #[test]
    fn test_vec3_is_padded() {
        let v3 = Type::vector(Type::Float, 3);
        assert_eq!(v3.size_bytes(), 16);
        assert_eq!(v3.value_shape(), (4, 3));
        assert_eq!(v3.alignment(), 16);
    }

    #[test]
    fn test_struct_layout() {
        let s = Type::Struct(vec![Type::I8, Type::I32, Type::I16]);
        assert_eq!(s.field_offset(0), Some(0));
        assert_eq!(s.field_offset(1), Some(4));
        assert_eq!(s.field_offset(2), Some(8));
        assert_eq!(s.size_bytes(), 12);
        assert_eq!(s.alignment(), 4);
        assert_eq!(s.value_shape(), (12, 1));
    }

    #[test]
    fn test_member_offsets() {
        let arr = Type::array(Type::I32, 8);
        assert_eq!(arr.member_offset(3), Some(12));
        assert_eq!(arr.member(3), Some(&Type::I32));
        assert_eq!(Type::I32.member(0), None);
    }

    #[test]
    fn test_constant_splat() {
        let c = Constant::int(Type::vector(Type::I16, 4), 0x1234);
        assert_eq!(c.data.len(), 8);
        assert_eq!(u16::from_le_bytes([c.data[6], c.data[7]]), 0x1234);

        let h = Constant::float(Type::Half, 1.5);
        assert_eq!(half::f16::from_bits(u16::from_le_bytes([h.data[0], h.data[1]])).to_f64(), 1.5);
    }

    #[test]
    fn test_undef_is_zero_filled() {
        let c = Constant::undef(Type::I64);
        assert!(c.undef);
        assert_eq!(c.data, vec![0; 8]);
    }

    #[test]
    fn test_address_space_helpers() {
        assert!(AddressSpace::Constant.is_device_wide());
        assert!(!AddressSpace::Local.is_device_wide());
        assert_eq!(Type::vector(Type::Pointer(AddressSpace::Global), 2).address_space(), Some(AddressSpace::Global));
        assert_eq!(AddressSpace::Local.to_string(), "local");
    }
}
