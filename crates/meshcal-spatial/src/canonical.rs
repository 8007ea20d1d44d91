//! The plan-centred canonical frame.
//!
//! | Canonical axis | Source |
//! |---|---|
//! | `x` | plan `x` offset from the origin pixel, in metres |
//! | `y` | fixed reference floor height |
//! | `z` | plan `y` offset from the origin pixel, in metres |
//!
//! The frame is stable across tracking sessions: once a session transform
//! has been fitted, every baked canonical estimate can be projected into that
//! session with a single [`RigidTransform`].

use meshcal_types::{CalibError, Point2, Vec3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::transform::{RigidTransform, ScaleMode, align_two_points};

/// Floor height used when none is configured (metres below the tracking
/// device origin).
pub const DEFAULT_FLOOR_HEIGHT_M: f32 = -1.1;

/// Parameters of the canonical frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CanonicalFrame {
    /// Plan pixel that maps to the canonical origin.
    pub origin: Point2,
    pub pixels_per_meter: f32,
    pub floor_height: f32,
}

impl CanonicalFrame {
    /// Frame centred on a `width × height` plan image.
    pub fn from_map_size(
        width_px: f32,
        height_px: f32,
        pixels_per_meter: f32,
        floor_height: f32,
    ) -> Result<Self, CalibError> {
        Self::with_origin(
            Point2::new(width_px / 2.0, height_px / 2.0),
            pixels_per_meter,
            floor_height,
        )
    }

    pub fn with_origin(origin: Point2, pixels_per_meter: f32, floor_height: f32) -> Result<Self, CalibError> {
        if !pixels_per_meter.is_finite() || pixels_per_meter <= 0.0 {
            return Err(CalibError::DegenerateGeometry(format!(
                "pixels_per_meter must be positive, got {pixels_per_meter}"
            )));
        }
        Ok(Self {
            origin,
            pixels_per_meter,
            floor_height,
        })
    }

    /// Plan pixel → canonical metres at floor height.
    pub fn map_to_canonical(&self, p: Point2) -> Vec3 {
        Vec3::new(
            (p.x - self.origin.x) / self.pixels_per_meter,
            self.floor_height,
            (p.y - self.origin.y) / self.pixels_per_meter,
        )
    }

    /// Canonical metres → plan pixel. Height is discarded.
    pub fn canonical_to_map(&self, p: Vec3) -> Point2 {
        Point2::new(
            p.x * self.pixels_per_meter + self.origin.x,
            p.z * self.pixels_per_meter + self.origin.y,
        )
    }

    /// Convert a plan distance in pixels to metres.
    pub fn pixels_to_meters(&self, px: f32) -> f32 {
        px / self.pixels_per_meter
    }

    /// Session position → canonical, through a session-to-canonical transform.
    pub fn session_to_canonical(&self, p: Vec3, transform: &RigidTransform) -> Vec3 {
        transform.apply(p)
    }

    /// Canonical position → session, undoing a session-to-canonical transform.
    pub fn canonical_to_session(&self, p: Vec3, transform: &RigidTransform) -> Vec3 {
        transform.apply_inverse(p)
    }

    /// Fit the session-to-canonical transform from landmarks measured in the
    /// current session.
    ///
    /// Uses the correspondence pair with the widest horizontal baseline in
    /// the session. Fewer than two correspondences yields
    /// [`CalibError::InsufficientCorrespondences`].
    pub fn fit_session_transform(
        &self,
        correspondences: &[Correspondence],
        mode: ScaleMode,
    ) -> Result<RigidTransform, CalibError> {
        let (a, b) = widest_pair(correspondences)?;
        let transform = align_two_points(
            a.session,
            b.session,
            self.map_to_canonical(a.map),
            self.map_to_canonical(b.map),
            mode,
        )?;
        debug!(
            rotation_y = transform.rotation_y,
            scale = transform.scale,
            correspondences = correspondences.len(),
            "session transform fitted"
        );
        Ok(transform)
    }
}

/// A landmark measured in a session, paired with its plan coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    pub session: Vec3,
    pub map: Point2,
}

impl Correspondence {
    pub fn new(session: Vec3, map: Point2) -> Self {
        Self { session, map }
    }
}

/// The two correspondences furthest apart in the session's horizontal plane.
pub fn widest_pair(correspondences: &[Correspondence]) -> Result<(Correspondence, Correspondence), CalibError> {
    if correspondences.len() < 2 {
        return Err(CalibError::InsufficientCorrespondences {
            needed: 2,
            found: correspondences.len(),
        });
    }

    let mut best = (correspondences[0], correspondences[1]);
    let mut best_len = f32::NEG_INFINITY;
    for (i, a) in correspondences.iter().enumerate() {
        for b in &correspondences[i + 1..] {
            let len = a.session.horizontal_distance(b.session);
            if len > best_len {
                best_len = len;
                best = (*a, *b);
            }
        }
    }
    Ok(best)
}
