//! Runtime values
//!
//! A [`TypedValue`] is a little byte buffer tagged with an element size and an
//! element count. Scalars have one element; vectors have one per lane;
//! aggregates are a single element spanning the whole aggregate. The same
//! representation carries memory payloads between the interpreter and
//! [`crate::memory::Memory`].

use crate::ir::{Constant, Type};
use bytemuck::pod_read_unaligned;
use half::f16;
use smallvec::SmallVec;
use std::fmt;

/// Inline capacity: enough for a `float4` or a `long2` without spilling.
pub type ValueBytes = SmallVec<[u8; 16]>;

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TypedValue {
    size: usize,
    num: usize,
    data: ValueBytes,
}

impl TypedValue {
    /// Zero-filled value of `num` elements of `size` bytes.
    pub fn new(size: usize, num: usize) -> Self {
        Self {
            size,
            num,
            data: SmallVec::from_elem(0, size * num),
        }
    }

    /// Zero-filled value shaped for `ty`.
    pub fn for_type(ty: &Type) -> Self {
        let (size, num) = ty.value_shape();
        Self::new(size, num)
    }

    pub fn from_bytes(size: usize, num: usize, bytes: &[u8]) -> Self {
        let mut value = Self::new(size, num);
        let n = value.data.len().min(bytes.len());
        value.data[..n].copy_from_slice(&bytes[..n]);
        value
    }

    pub fn from_constant(constant: &Constant) -> Self {
        let (size, num) = constant.ty.value_shape();
        Self::from_bytes(size, num, &constant.data)
    }

    /// Scalar integer of `size` bytes.
    pub fn from_uint(size: usize, value: u64) -> Self {
        let mut v = Self::new(size, 1);
        v.set_uint(0, value);
        v
    }

    pub fn from_sint(size: usize, value: i64) -> Self {
        Self::from_uint(size, value as u64)
    }

    pub fn from_float(size: usize, value: f64) -> Self {
        let mut v = Self::new(size, 1);
        v.set_float(0, value);
        v
    }

    pub fn from_bool(value: bool) -> Self {
        Self::from_uint(1, u64::from(value))
    }

    pub fn pointer(address: u64) -> Self {
        Self::from_uint(8, address)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn num(&self) -> usize {
        self.num
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> ValueBytes {
        self.data
    }

    fn lane(&self, index: usize) -> &[u8] {
        let start = index * self.size;
        &self.data[start..start + self.size]
    }

    fn lane_mut(&mut self, index: usize) -> &mut [u8] {
        let start = index * self.size;
        &mut self.data[start..start + self.size]
    }

    // ============================================================================================
    // Element Access
    // ============================================================================================

    /// Element `index` zero-extended to 64 bits.
    pub fn get_uint(&self, index: usize) -> u64 {
        let lane = self.lane(index);
        match self.size {
            1 => u64::from(lane[0]),
            2 => u64::from(u16::from_le_bytes(pod_read_unaligned(lane))),
            4 => u64::from(u32::from_le_bytes(pod_read_unaligned(lane))),
            8 => u64::from_le_bytes(pod_read_unaligned(lane)),
            _ => {
                let mut bytes = [0u8; 8];
                let n = lane.len().min(8);
                bytes[..n].copy_from_slice(&lane[..n]);
                u64::from_le_bytes(bytes)
            }
        }
    }

    /// Element `index` sign-extended to 64 bits.
    pub fn get_sint(&self, index: usize) -> i64 {
        let raw = self.get_uint(index);
        let bits = (self.size.min(8) * 8) as u32;
        if bits == 0 || bits >= 64 {
            raw as i64
        } else {
            let shift = 64 - bits;
            ((raw << shift) as i64) >> shift
        }
    }

    /// Element `index` as a float of this value's width.
    pub fn get_float(&self, index: usize) -> f64 {
        let lane = self.lane(index);
        match self.size {
            2 => f16::from_bits(u16::from_le_bytes(pod_read_unaligned(lane))).to_f64(),
            4 => f64::from(f32::from_le_bytes(pod_read_unaligned(lane))),
            8 => f64::from_le_bytes(pod_read_unaligned(lane)),
            _ => 0.0,
        }
    }

    pub fn get_pointer(&self, index: usize) -> u64 {
        self.get_uint(index)
    }

    /// True when element `index` is non-zero.
    pub fn get_bool(&self, index: usize) -> bool {
        self.lane(index).iter().any(|b| *b != 0)
    }

    /// Store the low `size` bytes of `value` into element `index`.
    pub fn set_uint(&mut self, index: usize, value: u64) {
        let size = self.size;
        let bytes = value.to_le_bytes();
        let lane = self.lane_mut(index);
        let n = size.min(8);
        lane[..n].copy_from_slice(&bytes[..n]);
    }

    pub fn set_sint(&mut self, index: usize, value: i64) {
        self.set_uint(index, value as u64);
    }

    /// Round `value` to this value's float width and store it.
    pub fn set_float(&mut self, index: usize, value: f64) {
        match self.size {
            2 => self.set_uint(index, u64::from(f16::from_f64(value).to_bits())),
            4 => self.set_uint(index, u64::from((value as f32).to_bits())),
            _ => self.set_uint(index, value.to_bits()),
        }
    }

    pub fn set_bool(&mut self, index: usize, value: bool) {
        self.set_uint(index, u64::from(value));
    }

    /// Single-lane copy of element `index`.
    pub fn element(&self, index: usize) -> TypedValue {
        Self::from_bytes(self.size, 1, self.lane(index))
    }

    /// Copy a single-element value into lane `index`.
    pub fn set_element(&mut self, index: usize, value: &TypedValue) {
        let n = self.size.min(value.data.len());
        self.lane_mut(index)[..n].copy_from_slice(&value.data[..n]);
    }

    /// Same bytes reinterpreted with a different shape.
    pub fn reshape(&self, size: usize, num: usize) -> TypedValue {
        Self::from_bytes(size, num, &self.data)
    }
}

impl fmt::Debug for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypedValue({}x{}: {:02x?})", self.num, self.size, self.data.as_slice())
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.num > 1 {
            write!(f, "(")?;
        }
        for i in 0..self.num {
            if i > 0 {
                write!(f, ",")?;
            }
            match self.size {
                1 | 2 | 4 | 8 => write!(f, "{}", self.get_sint(i))?,
                _ => write!(f, "{:02x?}", self.lane(i))?,
            }
        }
        if self.num > 1 {
            write!(f, ")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_lanes() {
        let mut v = TypedValue::new(2, 4);
        v.set_sint(1, -2);
        v.set_uint(3, 0x1_FFFF);
        assert_eq!(v.get_uint(1), 0xFFFE);
        assert_eq!(v.get_sint(1), -2);
        assert_eq!(v.get_uint(3), 0xFFFF);
        assert_eq!(v.get_uint(0), 0);
        assert_eq!(v.byte_len(), 8);
    }

    #[test]
    fn test_float_widths() {
        let mut h = TypedValue::new(2, 1);
        h.set_float(0, 0.1);
        assert!((h.get_float(0) - 0.1).abs() < 1e-3);

        let f = TypedValue::from_float(4, 1.0 / 3.0);
        assert_eq!(f.get_float(0), f64::from(1.0f32 / 3.0));

        let d = TypedValue::from_float(8, 1.0 / 3.0);
        assert_eq!(d.get_float(0), 1.0 / 3.0);
    }

    #[test]
    fn test_elements() {
        let mut v = TypedValue::new(4, 3);
        v.set_element(2, &TypedValue::from_uint(4, 7));
        assert_eq!(v.element(2).get_uint(0), 7);
        assert_eq!(v.reshape(1, 12).get_uint(8), 7);
    }

    #[test]
    fn test_from_constant() {
        let c = Constant::int(Type::vector(Type::I32, 2), 5);
        let v = TypedValue::from_constant(&c);
        assert_eq!((v.size(), v.num()), (4, 2));
        assert_eq!(v.get_uint(1), 5);
    }

    #[test]
    fn test_display() {
        let mut v = TypedValue::new(4, 2);
        v.set_sint(0, -1);
        v.set_sint(1, 3);
        assert_eq!(v.to_string(), "(-1,3)");
    }
}
