//! Index-to-world transform
//!
//! Voxel `(i, j, k)` maps to `origin + (i, j, k) * spacing`. The map is an
//! affine scale followed by a translation; it is built once per export job
//! and never changes afterwards.

use glam::{DMat4, DQuat, DVec3, IVec3};
use serde::{Deserialize, Serialize};

use crate::error::{invalid_volume, VdbResult};

/// Relative tolerance for `to_index(to_world(ijk)) == ijk`
pub const ROUND_TRIP_TOLERANCE: f64 = 1e-9;

/// Affine map from voxel index space to world space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    scale: DVec3,
    translation: DVec3,
}

impl Transform {
    /// Build the transform from voxel spacing and world origin
    ///
    /// Fails only for zero or non-finite spacing, or a non-finite origin.
    pub fn build(voxel_spacing: DVec3, origin: DVec3) -> VdbResult<Self> {
        if !voxel_spacing.is_finite() || voxel_spacing.cmpeq(DVec3::ZERO).any() {
            return Err(invalid_volume(format!(
                "voxel spacing {} must be finite and non-zero",
                voxel_spacing
            )));
        }
        if !origin.is_finite() {
            return Err(invalid_volume(format!("origin {} must be finite", origin)));
        }

        Ok(Self {
            scale: voxel_spacing,
            translation: origin,
        })
    }

    /// Unit spacing at the origin
    pub fn identity() -> Self {
        Self {
            scale: DVec3::ONE,
            translation: DVec3::ZERO,
        }
    }

    pub fn scale(&self) -> DVec3 {
        self.scale
    }

    pub fn translation(&self) -> DVec3 {
        self.translation
    }

    /// World position of an index-space point
    pub fn to_world(&self, ijk: DVec3) -> DVec3 {
        ijk * self.scale + self.translation
    }

    /// World position of a voxel centre
    pub fn voxel_to_world(&self, ijk: IVec3) -> DVec3 {
        self.to_world(ijk.as_dvec3())
    }

    /// Continuous index-space position of a world point
    pub fn to_index(&self, xyz: DVec3) -> DVec3 {
        (xyz - self.translation) / self.scale
    }

    /// Nearest voxel to a world point
    pub fn to_voxel(&self, xyz: DVec3) -> IVec3 {
        self.to_index(xyz).round().as_ivec3()
    }

    /// Size of one voxel in world units
    pub fn voxel_size(&self) -> DVec3 {
        self.scale.abs()
    }

    /// Full 4x4 matrix, column-major, mapping index space to world space
    pub fn matrix(&self) -> DMat4 {
        DMat4::from_scale_rotation_translation(self.scale, DQuat::IDENTITY, self.translation)
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}
