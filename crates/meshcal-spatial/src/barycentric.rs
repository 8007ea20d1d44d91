//! Barycentric interpolation between the floor plan and a tracked session.
//!
//! Weights solved for a plan point inside a plan triangle are reused on the
//! three measured 3-D vertices to estimate where that plan point sits in the
//! session. This is the fallback path when no transform is available.

use meshcal_types::{CalibError, Point2, Vec3};

/// Triangles whose doubled signed area is at or below this are collinear.
pub const DEGENERATE_CROSS_EPSILON: f32 = 0.001;

/// Fewest grid steps per side used by [`fill_points`].
pub const MIN_FILL_STEPS: usize = 5;

/// Most grid steps per side used by [`fill_points`]; caps a triangle at
/// 20 301 points however fine the requested spacing.
pub const MAX_FILL_STEPS: usize = 200;

/// Solve the barycentric weights of `target` relative to `p1`, `p2`, `p3`.
///
/// `w1` is derived as `1 − w2 − w3`, so the weights always sum to one.
/// Points outside the triangle yield negative weights.
///
/// # Example
///
/// ```rust
/// use meshcal_spatial::barycentric_2d;
/// use meshcal_types::Point2;
///
/// let w = barycentric_2d(
///     Point2::new(0.0, 0.0),
///     Point2::new(10.0, 0.0),
///     Point2::new(0.0, 10.0),
///     Point2::new(5.0, 5.0),
/// )
/// .unwrap();
/// assert!((w[1] - 0.5).abs() < 1e-6 && (w[2] - 0.5).abs() < 1e-6);
/// ```
pub fn barycentric_2d(p1: Point2, p2: Point2, p3: Point2, target: Point2) -> Result<[f32; 3], CalibError> {
    let v0 = Point2::new(p2.x - p1.x, p2.y - p1.y);
    let v1 = Point2::new(p3.x - p1.x, p3.y - p1.y);
    let v2 = Point2::new(target.x - p1.x, target.y - p1.y);

    let cross = v0.x * v1.y - v0.y * v1.x;
    if cross.abs() <= DEGENERATE_CROSS_EPSILON {
        return Err(CalibError::DegenerateGeometry(format!(
            "collinear triangle {p1} {p2} {p3}"
        )));
    }

    let w2 = (v2.x * v1.y - v2.y * v1.x) / cross;
    let w3 = (v0.x * v2.y - v0.y * v2.x) / cross;
    Ok([1.0 - w2 - w3, w2, w3])
}

/// Apply barycentric `weights` to three 3-D vertices.
pub fn lift_barycentric(weights: [f32; 3], vertices: [Vec3; 3]) -> Vec3 {
    vertices[0] * weights[0] + vertices[1] * weights[1] + vertices[2] * weights[2]
}

/// Convenience: solve on the plan triangle and lift onto `session` in one go.
pub fn project_into(plan: [Point2; 3], session: [Vec3; 3], target: Point2) -> Result<Vec3, CalibError> {
    let w = barycentric_2d(plan[0], plan[1], plan[2], target)?;
    Ok(lift_barycentric(w, session))
}

/// Evenly spaced plan points covering `triangle`, vertices and edges
/// included.
///
/// The grid has `max(5, ⌊√(area / spacing²)⌋)` steps per side, clamped to
/// [`MAX_FILL_STEPS`], with spacing converted to pixels through
/// `pixels_per_meter`. Returns an empty list when the spacing is not
/// positive.
pub fn fill_points(triangle: [Point2; 3], spacing_m: f32, pixels_per_meter: f32) -> Vec<Point2> {
    let spacing_px = spacing_m * pixels_per_meter;
    if spacing_px.is_nan() || spacing_px <= 0.0 {
        return Vec::new();
    }

    let [a, b, c] = triangle;
    let area = ((b.x - a.x) * (c.y - a.y) - (c.x - a.x) * (b.y - a.y)).abs() / 2.0;
    let per_side = (area / (spacing_px * spacing_px)).sqrt();
    // `as` saturates, so an infinite ratio lands on the cap.
    let steps = (per_side as usize).clamp(MIN_FILL_STEPS, MAX_FILL_STEPS);

    let mut out = Vec::with_capacity((steps + 1) * (steps + 2) / 2);
    for i in 0..=steps {
        for j in 0..=(steps - i) {
            let wi = i as f32 / steps as f32;
            let wj = j as f32 / steps as f32;
            let wk = 1.0 - wi - wj;
            out.push(Point2::new(
                wi * a.x + wj * b.x + wk * c.x,
                wi * a.y + wj * b.y + wk * c.y,
            ));
        }
    }
    out
}
