//! Triangle quality scoring from leg measurements.
//!
//! Each leg compares the tracked 3-D distance between two markers with the
//! plan distance between their landmarks. A perfect leg scores `1.0`; over-
//! and under-measurement are penalised symmetrically.

use meshcal_types::{LandmarkId, LegMeasurement, Point2, Triangle, Vec3};
use serde::{Deserialize, Serialize};

/// Quality at or above this is [`QualityBand::Good`].
pub const GOOD_QUALITY: f32 = 0.8;
/// Quality at or above this is [`QualityBand::Fair`].
pub const FAIR_QUALITY: f32 = 0.5;

/// `min(ratio, 1 / ratio)`; zero for non-positive or non-finite ratios.
pub fn leg_score(ratio: f32) -> f32 {
    if !ratio.is_finite() || ratio <= 0.0 {
        return 0.0;
    }
    ratio.min(1.0 / ratio)
}

/// Mean leg score, or zero without legs.
pub fn triangle_quality(legs: &[LegMeasurement]) -> f32 {
    if legs.is_empty() {
        return 0.0;
    }
    legs.iter().map(|l| leg_score(l.distortion_ratio())).sum::<f32>() / legs.len() as f32
}

/// Measure the three legs `0–1`, `1–2`, `2–0`.
///
/// With a known `pixels_per_meter` the plan distances are converted to
/// metres directly. Without one, plan distances are scaled so their mean
/// matches the mean tracked distance; the score then reflects shape
/// distortion only.
pub fn measure_legs(
    vertices: [LandmarkId; 3],
    plan: [Point2; 3],
    tracked: [Vec3; 3],
    pixels_per_meter: Option<f32>,
) -> Vec<LegMeasurement> {
    const EDGES: [(usize, usize); 3] = [(0, 1), (1, 2), (2, 0)];

    let plan_px = EDGES.map(|(i, j)| plan[i].distance(plan[j]));
    let tracked_m = EDGES.map(|(i, j)| tracked[i].distance(tracked[j]));

    let meters_per_px = match pixels_per_meter {
        Some(ppm) if ppm > 0.0 => 1.0 / ppm,
        _ => {
            let plan_sum: f32 = plan_px.iter().sum();
            if plan_sum > 0.0 {
                tracked_m.iter().sum::<f32>() / plan_sum
            } else {
                0.0
            }
        }
    };

    EDGES
        .iter()
        .enumerate()
        .map(|(k, (i, j))| LegMeasurement {
            vertex_a: vertices[*i],
            vertex_b: vertices[*j],
            map_distance_m: plan_px[k] * meters_per_px,
            tracked_distance_m: tracked_m[k],
        })
        .collect()
}

/// Display band for a triangle's calibration quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityBand {
    Uncalibrated,
    Poor,
    Fair,
    Good,
}

impl QualityBand {
    pub fn from_quality(quality: f32) -> Self {
        if quality >= GOOD_QUALITY {
            QualityBand::Good
        } else if quality >= FAIR_QUALITY {
            QualityBand::Fair
        } else {
            QualityBand::Poor
        }
    }

    pub fn of(triangle: &Triangle) -> Self {
        if triangle.is_calibrated {
            Self::from_quality(triangle.quality)
        } else {
            QualityBand::Uncalibrated
        }
    }
}

impl std::fmt::Display for QualityBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QualityBand::Uncalibrated => "uncalibrated",
            QualityBand::Poor => "poor",
            QualityBand::Fair => "fair",
            QualityBand::Good => "good",
        };
        f.write_str(s)
    }
}
