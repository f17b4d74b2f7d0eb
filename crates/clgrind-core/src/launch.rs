//! Launch geometry: three-dimensional sizes and the launch configuration.

use crate::error::{Result, SimError};
use std::fmt;
use std::ops::{Index, IndexMut};

/// A size or index in up to three dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size3 {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl Size3 {
    pub const ONE: Size3 = Size3 { x: 1, y: 1, z: 1 };
    pub const ZERO: Size3 = Size3 { x: 0, y: 0, z: 0 };

    pub const fn new(x: usize, y: usize, z: usize) -> Self {
        Self { x, y, z }
    }

    /// `(n, 1, 1)`
    pub const fn linear(n: usize) -> Self {
        Self { x: n, y: 1, z: 1 }
    }

    /// Total number of points.
    pub const fn volume(&self) -> usize {
        self.x * self.y * self.z
    }

    /// Row-major linear index of `self` within `extent`.
    pub const fn flatten(&self, extent: Size3) -> usize {
        (self.z * extent.y + self.y) * extent.x + self.x
    }

    /// Inverse of [`Size3::flatten`].
    pub const fn unflatten(index: usize, extent: Size3) -> Self {
        Self {
            x: index % extent.x,
            y: (index / extent.x) % extent.y,
            z: index / (extent.x * extent.y),
        }
    }

    pub fn as_array(&self) -> [usize; 3] {
        [self.x, self.y, self.z]
    }
}

impl From<[usize; 3]> for Size3 {
    fn from(v: [usize; 3]) -> Self {
        Self::new(v[0], v[1], v[2])
    }
}

impl Index<usize> for Size3 {
    type Output = usize;

    fn index(&self, dim: usize) -> &usize {
        match dim {
            0 => &self.x,
            1 => &self.y,
            _ => &self.z,
        }
    }
}

impl IndexMut<usize> for Size3 {
    fn index_mut(&mut self, dim: usize) -> &mut usize {
        match dim {
            0 => &mut self.x,
            1 => &mut self.y,
            _ => &mut self.z,
        }
    }
}

impl fmt::Display for Size3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// Index space of one kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub work_dim: u32,
    pub global_offset: Size3,
    pub global_size: Size3,
    pub local_size: Size3,
}

impl LaunchConfig {
    pub fn new(work_dim: u32, global_offset: Size3, global_size: Size3, local_size: Size3) -> Self {
        Self {
            work_dim,
            global_offset,
            global_size,
            local_size,
        }
    }

    /// One-dimensional launch with zero offset.
    pub fn new_1d(global: usize, local: usize) -> Self {
        Self::new(1, Size3::ZERO, Size3::linear(global), Size3::linear(local))
    }

    /// Two-dimensional launch with zero offset.
    pub fn new_2d(global: [usize; 2], local: [usize; 2]) -> Self {
        Self::new(
            2,
            Size3::ZERO,
            Size3::new(global[0], global[1], 1),
            Size3::new(local[0], local[1], 1),
        )
    }

    pub fn with_offset(mut self, offset: Size3) -> Self {
        self.global_offset = offset;
        self
    }

    /// Reject malformed geometry. With `uniform` set every local size must
    /// divide its global size exactly.
    pub fn validate(&self, uniform: bool) -> Result<()> {
        if !(1..=3).contains(&self.work_dim) {
            return Err(SimError::invalid_launch(format!(
                "work dimension {} outside 1..=3",
                self.work_dim
            )));
        }
        for dim in 0..3 {
            let global = self.global_size[dim];
            let local = self.local_size[dim];
            if global == 0 || local == 0 {
                return Err(SimError::invalid_launch(format!("zero size in dimension {dim}")));
            }
            if dim >= self.work_dim as usize && (global != 1 || local != 1) {
                return Err(SimError::invalid_launch(format!(
                    "dimension {dim} is unused but has global size {global} and local size {local}"
                )));
            }
            if uniform && global % local != 0 {
                return Err(SimError::invalid_launch(format!(
                    "global size {global} is not a multiple of local size {local} in dimension {dim}"
                )));
            }
        }
        Ok(())
    }

    /// Number of work-groups per dimension; edge groups are partial when the
    /// sizes do not divide evenly.
    pub fn num_groups(&self) -> Size3 {
        Size3::new(
            self.global_size.x.div_ceil(self.local_size.x),
            self.global_size.y.div_ceil(self.local_size.y),
            self.global_size.z.div_ceil(self.local_size.z),
        )
    }

    /// Actual size of the group at `group_id`.
    pub fn group_size(&self, group_id: Size3) -> Size3 {
        let mut size = self.local_size;
        for dim in 0..3 {
            let start = group_id[dim] * self.local_size[dim];
            size[dim] = self.local_size[dim].min(self.global_size[dim] - start);
        }
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_roundtrip() {
        let extent = Size3::new(4, 3, 2);
        for i in 0..extent.volume() {
            assert_eq!(Size3::unflatten(i, extent).flatten(extent), i);
        }
    }

    #[test]
    fn test_uniform_validation() {
        let launch = LaunchConfig::new_1d(8, 3);
        assert!(launch.validate(true).is_err());
        assert!(launch.validate(false).is_ok());
        assert_eq!(launch.num_groups(), Size3::linear(3));
        assert_eq!(launch.group_size(Size3::linear(2)), Size3::linear(2));
    }

    #[test]
    fn test_rejects_bad_dims() {
        assert!(LaunchConfig::new(0, Size3::ZERO, Size3::ONE, Size3::ONE).validate(true).is_err());
        let bad = LaunchConfig::new(1, Size3::ZERO, Size3::new(4, 2, 1), Size3::new(2, 1, 1));
        assert!(bad.validate(true).is_err());
        assert!(LaunchConfig::new_1d(4, 0).validate(false).is_err());
    }

    #[test]
    fn test_2d_groups() {
        let launch = LaunchConfig::new_2d([8, 4], [4, 2]);
        assert!(launch.validate(true).is_ok());
        assert_eq!(launch.num_groups(), Size3::new(2, 2, 1));
    }
}
