//! Floor-plan predicates for building a valid triangle mesh.
//!
//! All coordinates are plan pixels. Triangles may share an edge or a single
//! vertex but their interiors must not overlap.

use meshcal_types::Point2;

/// Plan triangles with less than this area (px²) are treated as collinear.
pub const MIN_TRIANGLE_AREA_PX2: f32 = 1.0;

const POINT_IN_TRIANGLE_EPSILON: f32 = -0.0001;
const DEGENERATE_DENOM: f32 = 0.0001;

/// Unsigned area of the plan triangle `a`, `b`, `c` in px².
pub fn triangle_area(a: Point2, b: Point2, c: Point2) -> f32 {
    ((b.x - a.x) * (c.y - a.y) - (c.x - a.x) * (b.y - a.y)).abs() / 2.0
}

pub fn is_collinear(a: Point2, b: Point2, c: Point2) -> bool {
    triangle_area(a, b, c) < MIN_TRIANGLE_AREA_PX2
}

/// Whether `p` lies inside or on the boundary of `tri`.
///
/// Degenerate triangles contain nothing.
pub fn point_in_triangle(p: Point2, tri: [Point2; 3]) -> bool {
    let [v0, v1, v2] = tri;
    let denom = (v1.y - v2.y) * (v0.x - v2.x) + (v2.x - v1.x) * (v0.y - v2.y);
    if denom.abs() <= DEGENERATE_DENOM {
        return false;
    }

    let a = ((v1.y - v2.y) * (p.x - v2.x) + (v2.x - v1.x) * (p.y - v2.y)) / denom;
    let b = ((v2.y - v0.y) * (p.x - v2.x) + (v0.x - v2.x) * (p.y - v2.y)) / denom;
    let c = 1.0 - a - b;
    a >= POINT_IN_TRIANGLE_EPSILON && b >= POINT_IN_TRIANGLE_EPSILON && c >= POINT_IN_TRIANGLE_EPSILON
}

fn orientation(a: Point2, b: Point2, c: Point2) -> f32 {
    (c.y - a.y) * (b.x - a.x) - (b.y - a.y) * (c.x - a.x)
}

/// Proper crossing of segments `p1p2` and `p3p4`.
///
/// Segments that share an endpoint, touch, or are collinear do not count.
pub fn segments_intersect(p1: Point2, p2: Point2, p3: Point2, p4: Point2) -> bool {
    if p1 == p3 || p1 == p4 || p2 == p3 || p2 == p4 {
        return false;
    }

    let d1 = orientation(p3, p4, p1);
    let d2 = orientation(p3, p4, p2);
    let d3 = orientation(p1, p2, p3);
    let d4 = orientation(p1, p2, p4);

    let straddles = |a: f32, b: f32| (a > 0.0 && b < 0.0) || (a < 0.0 && b > 0.0);
    straddles(d1, d2) && straddles(d3, d4)
}

/// Whether the interiors of `a` and `b` overlap.
///
/// Vertex positions listed in `shared` are ignored by the containment test
/// so that triangles meeting at a common vertex are not reported.
pub fn triangles_overlap(a: [Point2; 3], b: [Point2; 3], shared: &[Point2]) -> bool {
    let contained = |points: &[Point2; 3], tri: [Point2; 3]| {
        points
            .iter()
            .any(|p| !shared.contains(p) && point_in_triangle(*p, tri))
    };
    if contained(&a, b) || contained(&b, a) {
        return true;
    }

    (0..3).any(|i| {
        (0..3).any(|j| segments_intersect(a[i], a[(i + 1) % 3], b[j], b[(j + 1) % 3]))
    })
}
