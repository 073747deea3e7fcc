//! Dispatch geometry.
//!
//! A dispatch covers an *extent* of invocations (`GridDim`). The device
//! rounds that extent up to whole workgroups, so kernels guard against the
//! overshoot lanes themselves.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BackendError, Result};

/// Lanes per workgroup along x for 2D and 1D layer kernels.
pub const MAX_WORKGROUP_X: u32 = 256;
/// Upper bound on lanes in one 2D workgroup.
pub const MAX_WORKGROUP_LANES: u32 = 1024;

/// Number of invocations requested along each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridDim {
    pub x: u32,
    pub y: u32,
}

impl GridDim {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    pub const fn linear(x: u32) -> Self {
        Self { x, y: 1 }
    }

    pub const fn total(&self) -> u64 {
        self.x as u64 * self.y as u64
    }

    /// Extent from host-side sizes; fails if either axis exceeds `u32`.
    pub fn from_sizes(x: usize, y: usize) -> Result<Self> {
        let axis = |v: usize| u32::try_from(v).map_err(|_| BackendError::invalid_launch(format!("extent {v} too large")));
        Ok(Self::new(axis(x)?, axis(y)?))
    }
}

impl fmt::Display for GridDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Lanes per workgroup, baked into a kernel module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl WorkgroupSize {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Workgroup for a `x` by `y` dispatch: up to 256 lanes along x, then
    /// as many rows as fit into 1024 lanes.
    pub fn for_2d(x: usize, y: usize) -> Self {
        let wx = clamp_lanes(x, MAX_WORKGROUP_X);
        let wy = clamp_lanes(y, MAX_WORKGROUP_LANES / wx);
        Self::new(wx, wy)
    }

    /// Workgroup for a linear dispatch of `x` invocations.
    pub fn for_1d(x: usize, max_lanes: u32) -> Self {
        Self::new(clamp_lanes(x, max_lanes), 1)
    }

    pub const fn lanes(&self) -> u32 {
        self.x * self.y
    }
}

fn clamp_lanes(size: usize, max: u32) -> u32 {
    u32::try_from(size).unwrap_or(u32::MAX).clamp(1, max.max(1))
}

/// Extent plus the workgroup shape that tiles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub extent: GridDim,
    pub workgroup: WorkgroupSize,
}

impl LaunchConfig {
    pub const fn covering(extent: GridDim, workgroup: WorkgroupSize) -> Self {
        Self { extent, workgroup }
    }

    /// Workgroups along each axis, rounding the extent up.
    pub const fn workgroups(&self) -> (u32, u32) {
        (
            self.extent.x.div_ceil(self.workgroup.x),
            self.extent.y.div_ceil(self.workgroup.y),
        )
    }

    pub const fn total_workgroups(&self) -> u64 {
        let (x, y) = self.workgroups();
        x as u64 * y as u64
    }

    /// Lanes actually run, overshoot included.
    pub const fn total_lanes(&self) -> u64 {
        self.total_workgroups() * self.workgroup.lanes() as u64
    }

    pub fn validate(&self) -> Result<()> {
        if self.workgroup.x == 0 || self.workgroup.y == 0 {
            return Err(BackendError::invalid_launch(format!("empty workgroup {:?}", self.workgroup)));
        }
        if self.workgroup.lanes() > MAX_WORKGROUP_LANES {
            return Err(BackendError::invalid_launch(format!(
                "workgroup {}x{} exceeds {MAX_WORKGROUP_LANES} lanes",
                self.workgroup.x, self.workgroup.y
            )));
        }
        Ok(())
    }
}

impl fmt::Display for LaunchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (gx, gy) = self.workgroups();
        write!(
            f,
            "extent={}, workgroup=({}, {}), groups=({gx}, {gy})",
            self.extent, self.workgroup.x, self.workgroup.y
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_dimensional_sizes_fill_1024_lanes() {
        assert_eq!(WorkgroupSize::for_2d(16, 100), WorkgroupSize::new(16, 64));
        assert_eq!(WorkgroupSize::for_2d(1000, 1000), WorkgroupSize::new(256, 4));
        assert_eq!(WorkgroupSize::for_2d(1, 3), WorkgroupSize::new(1, 3));
    }

    #[test]
    fn one_dimensional_size_is_capped() {
        assert_eq!(WorkgroupSize::for_1d(9, 256), WorkgroupSize::new(9, 1));
        assert_eq!(WorkgroupSize::for_1d(10_000, 512), WorkgroupSize::new(512, 1));
        assert_eq!(WorkgroupSize::for_1d(0, 256), WorkgroupSize::new(1, 1));
    }

    #[test]
    fn workgroups_round_up() {
        let launch = LaunchConfig::covering(GridDim::new(100, 10), WorkgroupSize::new(32, 4));
        assert_eq!(launch.workgroups(), (4, 3));
        assert_eq!(launch.total_workgroups(), 12);
        assert_eq!(launch.total_lanes(), 12 * 128);
        assert!(launch.validate().is_ok());
    }

    #[test]
    fn oversized_workgroup_is_rejected() {
        let launch = LaunchConfig::covering(GridDim::linear(8), WorkgroupSize::new(2048, 1));
        assert!(matches!(launch.validate(), Err(BackendError::InvalidLaunch(_))));
    }

    #[test]
    fn extents_beyond_u32_fail() {
        assert!(GridDim::from_sizes(usize::MAX, 1).is_err());
        assert_eq!(GridDim::from_sizes(3, 4).unwrap().total(), 12);
    }
}
