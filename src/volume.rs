//! Dense input volumes
//!
//! A `Volume` is the fully populated 3-D array handed over by the image
//! reader: one scalar per voxel, laid out x-fastest, then y, then z, plus the
//! physical voxel spacing and origin. Volumes are immutable once constructed
//! and can be shared freely between build workers.

use glam::{DVec3, IVec3};
use serde::{Deserialize, Serialize};

use crate::error::{invalid_volume, VdbResult};

/// Inclusive axis-aligned box in index space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexBox {
    pub min: IVec3,
    pub max: IVec3,
}

impl IndexBox {
    pub fn new(min: IVec3, max: IVec3) -> Self {
        Self { min, max }
    }

    /// Box covering `[0, dims)` on every axis
    pub fn from_dims(dims: [usize; 3]) -> Self {
        Self {
            min: IVec3::ZERO,
            max: IVec3::new(dims[0] as i32 - 1, dims[1] as i32 - 1, dims[2] as i32 - 1),
        }
    }

    /// Box of side `1 << log2_span` starting at `origin`
    pub fn from_span(origin: IVec3, log2_span: u32) -> Self {
        let extent = (1i32 << log2_span) - 1;
        Self {
            min: origin,
            max: origin + IVec3::splat(extent),
        }
    }

    pub fn contains(&self, ijk: IVec3) -> bool {
        ijk.cmpge(self.min).all() && ijk.cmple(self.max).all()
    }

    pub fn intersects(&self, other: &IndexBox) -> bool {
        self.min.cmple(other.max).all() && other.min.cmple(self.max).all()
    }

    /// Whether `other` lies entirely inside this box
    pub fn encloses(&self, other: &IndexBox) -> bool {
        self.contains(other.min) && self.contains(other.max)
    }

    /// Number of voxels along each axis
    pub fn extent(&self) -> IVec3 {
        self.max - self.min + IVec3::ONE
    }

    /// Grow the box so that it contains `other`
    pub fn union(&self, other: &IndexBox) -> IndexBox {
        IndexBox {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

/// Rectangular region of interest in the XY plane, in pixels
///
/// Mirrors ImageJ ROI rectangles: `left`/`top` is the first pixel, the width
/// and height are the absolute differences of the opposite edges. A ROI drawn
/// on one frame of a time series carries that frame in `t`, which limits the
/// export to it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    pub left: usize,
    pub top: usize,
    pub right: usize,
    pub bottom: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<usize>,
}

impl Roi {
    pub fn width(&self) -> usize {
        self.right.abs_diff(self.left)
    }

    pub fn height(&self) -> usize {
        self.bottom.abs_diff(self.top)
    }
}

/// Dense 3-D array of scalar samples
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    dims: [usize; 3],
    spacing: DVec3,
    origin: DVec3,
    data: Vec<f32>,
}

impl Volume {
    /// Create a volume from samples laid out x-fastest, then y, then z
    pub fn new(
        dims: [usize; 3],
        data: Vec<f32>,
        spacing: [f64; 3],
        origin: [f64; 3],
    ) -> VdbResult<Self> {
        validate_geometry(dims, spacing, origin)?;

        let expected = dense_len(dims)?;
        if data.len() != expected {
            return Err(invalid_volume(format!(
                "sample count {} does not match dimensions {:?} ({} voxels)",
                data.len(),
                dims,
                expected
            )));
        }

        if let Some(index) = data.iter().position(|v| !v.is_finite()) {
            return Err(invalid_volume(format!(
                "sample {} is not finite ({})",
                index, data[index]
            )));
        }

        Ok(Self {
            dims,
            spacing: DVec3::from_array(spacing),
            origin: DVec3::from_array(origin),
            data,
        })
    }

    /// Create a volume from 8-bit samples
    pub fn from_u8(
        dims: [usize; 3],
        samples: &[u8],
        spacing: [f64; 3],
        origin: [f64; 3],
    ) -> VdbResult<Self> {
        Self::new(
            dims,
            samples.iter().map(|&v| v as f32).collect(),
            spacing,
            origin,
        )
    }

    /// Create a volume from 16-bit samples
    pub fn from_u16(
        dims: [usize; 3],
        samples: &[u16],
        spacing: [f64; 3],
        origin: [f64; 3],
    ) -> VdbResult<Self> {
        Self::new(
            dims,
            samples.iter().map(|&v| v as f32).collect(),
            spacing,
            origin,
        )
    }

    /// Create a volume where every voxel holds `value`, with unit spacing
    pub fn filled(dims: [usize; 3], value: f32) -> VdbResult<Self> {
        validate_geometry(dims, [1.0; 3], [0.0; 3])?;
        let len = dense_len(dims)?;
        Self::new(dims, vec![value; len], [1.0; 3], [0.0; 3])
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn spacing(&self) -> DVec3 {
        self.spacing
    }

    pub fn origin(&self) -> DVec3 {
        self.origin
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn voxel_count(&self) -> usize {
        self.data.len()
    }

    /// Index-space bounding box of the stored samples
    pub fn index_bbox(&self) -> IndexBox {
        IndexBox::from_dims(self.dims)
    }

    #[inline]
    fn linear_index(&self, x: usize, y: usize, z: usize) -> usize {
        x + self.dims[0] * (y + self.dims[1] * z)
    }

    /// Sample at `(x, y, z)`, or `None` outside the stored bounds
    pub fn get(&self, x: usize, y: usize, z: usize) -> Option<f32> {
        if x >= self.dims[0] || y >= self.dims[1] || z >= self.dims[2] {
            return None;
        }
        Some(self.data[self.linear_index(x, y, z)])
    }

    /// Sample at an index-space coordinate, or `None` outside the stored bounds
    #[inline]
    pub fn sample(&self, ijk: IVec3) -> Option<f32> {
        if ijk.cmplt(IVec3::ZERO).any() {
            return None;
        }
        self.get(ijk.x as usize, ijk.y as usize, ijk.z as usize)
    }

    /// Set a single sample; used by tests and by readers assembling volumes
    pub fn set(&mut self, x: usize, y: usize, z: usize, value: f32) -> VdbResult<()> {
        if x >= self.dims[0] || y >= self.dims[1] || z >= self.dims[2] {
            return Err(invalid_volume(format!(
                "voxel ({}, {}, {}) outside dimensions {:?}",
                x, y, z, self.dims
            )));
        }
        if !value.is_finite() {
            return Err(invalid_volume(format!("sample value {} is not finite", value)));
        }
        let index = self.linear_index(x, y, z);
        self.data[index] = value;
        Ok(())
    }

    /// Smallest and largest sample
    pub fn value_range(&self) -> (f32, f32) {
        self.data
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            })
    }

    /// Crop every Z slice to a region of interest
    pub fn crop(&self, roi: &Roi) -> VdbResult<Volume> {
        let x0 = roi.left.min(roi.right);
        let y0 = roi.top.min(roi.bottom);
        let (w, h) = (roi.width(), roi.height());

        if w == 0 || h == 0 {
            return Err(invalid_volume(format!("empty region of interest {:?}", roi)));
        }
        if x0 + w > self.dims[0] || y0 + h > self.dims[1] {
            return Err(invalid_volume(format!(
                "region of interest {:?} exceeds slice size {}x{}",
                roi, self.dims[0], self.dims[1]
            )));
        }

        let mut data = Vec::with_capacity(w * h * self.dims[2]);
        for z in 0..self.dims[2] {
            for y in y0..y0 + h {
                let start = self.linear_index(x0, y, z);
                data.extend_from_slice(&self.data[start..start + w]);
            }
        }

        Ok(Volume {
            dims: [w, h, self.dims[2]],
            spacing: self.spacing,
            origin: self.origin,
            data,
        })
    }

    /// Rescale intensities so that `[min, max]` maps onto `0..=255`
    ///
    /// Values are truncated towards zero after scaling, matching an 8-bit
    /// cast. A flat range maps everything to zero.
    pub fn normalized(&self, min: f32, max: f32) -> Volume {
        let ptp = max - min;
        let data = if ptp > 0.0 {
            let scale = ptp / 255.0;
            self.data
                .iter()
                .map(|&v| ((v - min) / scale).clamp(0.0, 255.0).trunc())
                .collect()
        } else {
            vec![0.0; self.data.len()]
        };

        Volume {
            dims: self.dims,
            spacing: self.spacing,
            origin: self.origin,
            data,
        }
    }
}

/// Number of voxels in a dense array of `dims`, rejecting sizes past `usize`
pub(crate) fn dense_len(dims: [usize; 3]) -> VdbResult<usize> {
    dims[0]
        .checked_mul(dims[1])
        .and_then(|n| n.checked_mul(dims[2]))
        .ok_or_else(|| {
            invalid_volume(format!(
                "dimensions {:?} overflow the addressable voxel count",
                dims
            ))
        })
}

fn validate_geometry(dims: [usize; 3], spacing: [f64; 3], origin: [f64; 3]) -> VdbResult<()> {
    if dims.iter().any(|&d| d == 0) {
        return Err(invalid_volume(format!("dimensions {:?} contain zero", dims)));
    }
    if dims.iter().any(|&d| d > i32::MAX as usize / 2) {
        return Err(invalid_volume(format!(
            "dimensions {:?} exceed the index range",
            dims
        )));
    }
    if spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
        return Err(invalid_volume(format!(
            "voxel spacing {:?} must be finite and positive",
            spacing
        )));
    }
    if origin.iter().any(|o| !o.is_finite()) {
        return Err(invalid_volume(format!("origin {:?} must be finite", origin)));
    }
    Ok(())
}
