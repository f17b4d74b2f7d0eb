//! Poison bytes shadowing SSA values.

use clgrind_core::TypedValue;
use smallvec::SmallVec;
use std::fmt;

/// Shadow byte of a defined byte.
pub const DEFINED: u8 = 0x00;
/// Shadow byte of an uninitialized byte.
pub const POISONED: u8 = 0xFF;

/// Poison state of a value, shaped like the [`TypedValue`] it shadows:
/// `num` lanes of `size` bytes.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct ShadowValue {
    size: usize,
    num: usize,
    bytes: SmallVec<[u8; 16]>,
}

impl ShadowValue {
    fn filled(size: usize, num: usize, byte: u8) -> Self {
        Self {
            size,
            num,
            bytes: SmallVec::from_elem(byte, size * num),
        }
    }

    pub fn defined(size: usize, num: usize) -> Self {
        Self::filled(size, num, DEFINED)
    }

    pub fn poisoned(size: usize, num: usize) -> Self {
        Self::filled(size, num, POISONED)
    }

    /// All-defined or all-poisoned value of the given shape.
    pub fn uniform(size: usize, num: usize, poisoned: bool) -> Self {
        Self::filled(size, num, if poisoned { POISONED } else { DEFINED })
    }

    /// Defined shadow shaped like `value`.
    pub fn for_value(value: &TypedValue) -> Self {
        Self::defined(value.size(), value.num())
    }

    /// Shadow from raw shadow bytes; missing bytes are defined.
    pub fn from_bytes(size: usize, num: usize, bytes: &[u8]) -> Self {
        let mut shadow = Self::defined(size, num);
        let n = shadow.bytes.len().min(bytes.len());
        shadow.bytes[..n].copy_from_slice(&bytes[..n]);
        shadow
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn num(&self) -> usize {
        self.num
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether any byte is poisoned.
    pub fn is_poisoned(&self) -> bool {
        self.bytes.iter().any(|b| *b != DEFINED)
    }

    /// Offset of the first poisoned byte.
    pub fn first_poisoned(&self) -> Option<usize> {
        self.bytes.iter().position(|b| *b != DEFINED)
    }

    pub fn lane_poisoned(&self, lane: usize) -> bool {
        let start = lane * self.size;
        self.bytes
            .get(start..start + self.size)
            .is_some_and(|lane| lane.iter().any(|b| *b != DEFINED))
    }

    pub fn set_lane(&mut self, lane: usize, poisoned: bool) {
        let start = lane * self.size;
        if let Some(bytes) = self.bytes.get_mut(start..start + self.size) {
            bytes.fill(if poisoned { POISONED } else { DEFINED });
        }
    }

    /// Lane `lane` as a scalar shadow; out-of-range lanes are poisoned.
    pub fn lane(&self, lane: usize) -> ShadowValue {
        let start = lane * self.size;
        match self.bytes.get(start..start + self.size) {
            Some(bytes) => Self::from_bytes(self.size, 1, bytes),
            None => Self::poisoned(self.size, 1),
        }
    }

    /// Copy `value`'s bytes into lane `lane`.
    pub fn set_lane_from(&mut self, lane: usize, value: &ShadowValue) {
        let start = lane * self.size;
        if let Some(bytes) = self.bytes.get_mut(start..start + self.size) {
            let n = bytes.len().min(value.bytes.len());
            bytes[..n].copy_from_slice(&value.bytes[..n]);
        }
    }

    /// Bytes `offset..offset + len` as a single-element shadow.
    pub fn slice(&self, offset: usize, len: usize) -> ShadowValue {
        match self.bytes.get(offset..offset + len) {
            Some(bytes) => Self::from_bytes(len, 1, bytes),
            None => Self::uniform(len, 1, self.is_poisoned()),
        }
    }

    /// Overwrite bytes starting at `offset` with `value`'s bytes.
    pub fn splice(&mut self, offset: usize, value: &ShadowValue) {
        let end = (offset + value.bytes.len()).min(self.bytes.len());
        if offset < end {
            self.bytes[offset..end].copy_from_slice(&value.bytes[..end - offset]);
        }
    }

    /// Same bytes viewed as `num` lanes of `size`. A value of another byte
    /// length collapses to all-poisoned or all-defined.
    pub fn reshape(&self, size: usize, num: usize) -> ShadowValue {
        if size * num == self.bytes.len() {
            Self {
                size,
                num,
                bytes: self.bytes.clone(),
            }
        } else {
            Self::uniform(size, num, self.is_poisoned())
        }
    }

    /// Poison every lane of `self` that is poisoned in `other`. Values with a
    /// different lane count contribute as a whole.
    pub fn merge(&mut self, other: &ShadowValue) {
        if other.num == self.num {
            for lane in 0..self.num {
                if other.lane_poisoned(lane) {
                    self.set_lane(lane, true);
                }
            }
        } else if other.is_poisoned() {
            self.bytes.fill(POISONED);
        }
    }

    /// Lane-wise OR of `operands`, shaped as `num` lanes of `size`.
    pub fn combine<'a>(size: usize, num: usize, operands: impl IntoIterator<Item = &'a ShadowValue>) -> ShadowValue {
        let mut result = Self::defined(size, num);
        for operand in operands {
            result.merge(operand);
        }
        result
    }
}

impl fmt::Debug for ShadowValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShadowValue({}x{} ", self.num, self.size)?;
        for lane in 0..self.num {
            f.write_str(if self.lane_poisoned(lane) { "P" } else { "." })?;
        }
        f.write_str(")")
    }
}
