//! Rigid-body transforms about the vertical axis.
//!
//! Tracking sessions share the direction of gravity, so two sessions (or a
//! session and the canonical frame) differ only by a rotation about `y`, a
//! translation and, at most, a uniform scale. Two correspondences are enough
//! to recover that transform.
//!
//! # Example
//!
//! ```rust
//! use meshcal_spatial::transform::rigid_align_2point;
//! use meshcal_types::Vec3;
//!
//! let t = rigid_align_2point(
//!     Vec3::new(0.0, 0.0, 0.0),
//!     Vec3::new(2.0, 0.0, 0.0),
//!     Vec3::new(5.0, 0.0, 5.0),
//!     Vec3::new(5.0, 0.0, 7.0),
//! )
//! .unwrap();
//!
//! let p = t.apply(Vec3::new(1.0, 0.0, 1.0));
//! assert!((p.x - 4.0).abs() < 1e-5);
//! assert!((p.z - 6.0).abs() < 1e-5);
//! ```

use meshcal_types::{CalibError, Vec3};
use serde::{Deserialize, Serialize};

/// Correspondence edges shorter than this (horizontal metres) cannot fix a
/// heading.
pub const MIN_EDGE_LENGTH_M: f32 = 0.01;

// ────────────────────────────────────────────────────────────────────────────
// Primitives
// ────────────────────────────────────────────────────────────────────────────

/// Rotate `p` by `angle` radians about the vertical axis.
///
/// A positive angle turns `+x` toward `+z`.
pub fn rotate_y(p: Vec3, angle: f32) -> Vec3 {
    let (sin, cos) = angle.sin_cos();
    Vec3::new(p.x * cos - p.z * sin, p.y, p.x * sin + p.z * cos)
}

/// Wrap an angle into `(-π, π]`.
pub fn normalize_angle(angle: f32) -> f32 {
    let two_pi = std::f32::consts::TAU;
    let mut a = angle % two_pi;
    if a <= -std::f32::consts::PI {
        a += two_pi;
    } else if a > std::f32::consts::PI {
        a -= two_pi;
    }
    a
}

// ────────────────────────────────────────────────────────────────────────────
// RigidTransform
// ────────────────────────────────────────────────────────────────────────────

/// Rotation about `y`, translation and uniform scale.
///
/// Applied as scale → rotate → translate. Used both for session-to-session
/// alignment (scale fixed at 1) and for the session-to-canonical transform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RigidTransform {
    pub rotation_y: f32,
    pub translation: Vec3,
    pub scale: f32,
}

impl RigidTransform {
    pub fn new(rotation_y: f32, translation: Vec3) -> Self {
        Self {
            rotation_y,
            translation,
            scale: 1.0,
        }
    }

    pub fn identity() -> Self {
        Self::new(0.0, Vec3::zero())
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    /// Map a point from the source frame into the target frame.
    pub fn apply(&self, p: Vec3) -> Vec3 {
        rotate_y(p * self.scale, self.rotation_y) + self.translation
    }

    /// Map a point from the target frame back into the source frame.
    pub fn apply_inverse(&self, p: Vec3) -> Vec3 {
        let unrotated = rotate_y(p - self.translation, -self.rotation_y);
        if self.scale == 0.0 {
            unrotated
        } else {
            unrotated * (1.0 / self.scale)
        }
    }

    /// The transform that undoes `self`.
    pub fn inverse(&self) -> Self {
        let inv_scale = if self.scale == 0.0 { 1.0 } else { 1.0 / self.scale };
        let translation = rotate_y(-self.translation, -self.rotation_y) * inv_scale;
        Self {
            rotation_y: -self.rotation_y,
            translation,
            scale: inv_scale,
        }
    }

    /// Distance between `apply(from)` and `to`.
    pub fn residual(&self, from: Vec3, to: Vec3) -> f32 {
        self.apply(from).distance(to)
    }

    /// Re-apply the transform to a correspondence and fail when it lands
    /// further than `threshold_m` from its target.
    pub fn verify(&self, from: Vec3, to: Vec3, threshold_m: f32) -> Result<f32, CalibError> {
        let residual_m = self.residual(from, to);
        if residual_m > threshold_m {
            return Err(CalibError::TransformVerificationFailed {
                residual_m,
                threshold_m,
            });
        }
        Ok(residual_m)
    }
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::identity()
    }
}

/// Apply a scale-free rigid transform given as raw parts.
pub fn apply_rigid_transform(point: Vec3, rotation_y: f32, translation: Vec3) -> Vec3 {
    RigidTransform::new(rotation_y, translation).apply(point)
}

// ────────────────────────────────────────────────────────────────────────────
// Two-point alignment
// ────────────────────────────────────────────────────────────────────────────

/// Whether alignment may rescale the source frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleMode {
    /// Scale fixed at 1 (both frames metric).
    Fixed,
    /// Scale = |new edge| / |old edge| in the horizontal plane.
    Estimate,
}

/// Compute the transform that maps `old_a` exactly onto `new_a` and points
/// `old_b` along the heading of `new_b`.
///
/// Both edges are projected onto the horizontal plane; either being shorter
/// than [`MIN_EDGE_LENGTH_M`] yields [`CalibError::DegenerateGeometry`].
/// The caller decides whether the fit is good enough by checking
/// [`RigidTransform::residual`] on `old_b`/`new_b`.
pub fn align_two_points(
    old_a: Vec3,
    old_b: Vec3,
    new_a: Vec3,
    new_b: Vec3,
    mode: ScaleMode,
) -> Result<RigidTransform, CalibError> {
    let old_edge = Vec3::new(old_b.x - old_a.x, 0.0, old_b.z - old_a.z);
    let new_edge = Vec3::new(new_b.x - new_a.x, 0.0, new_b.z - new_a.z);
    let old_len = old_edge.length();
    let new_len = new_edge.length();

    if old_len <= MIN_EDGE_LENGTH_M || new_len <= MIN_EDGE_LENGTH_M {
        return Err(CalibError::DegenerateGeometry(format!(
            "correspondence edge too short (old {old_len:.4} m, new {new_len:.4} m)"
        )));
    }

    let rotation_y = normalize_angle(new_edge.horizontal_angle() - old_edge.horizontal_angle());
    let scale = match mode {
        ScaleMode::Fixed => 1.0,
        ScaleMode::Estimate => new_len / old_len,
    };
    let translation = new_a - rotate_y(old_a * scale, rotation_y);

    Ok(RigidTransform {
        rotation_y,
        translation,
        scale,
    })
}

/// [`align_two_points`] with the scale fixed at 1.
pub fn rigid_align_2point(
    old_a: Vec3,
    old_b: Vec3,
    new_a: Vec3,
    new_b: Vec3,
) -> Result<RigidTransform, CalibError> {
    align_two_points(old_a, old_b, new_a, new_b, ScaleMode::Fixed)
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
