//! Drift detection for markers placed earlier in the same session.

use meshcal_types::{LandmarkId, MarkerId, Vec3};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::tracking::TrackingProvider;

/// Recorded and live positions further apart than this (3-D metres) are
/// flagged.
pub const DRIFT_THRESHOLD_M: f32 = 0.06;

pub fn is_drifted(recorded: Vec3, live: Vec3) -> bool {
    recorded.distance(live) > DRIFT_THRESHOLD_M
}

/// A placement whose live position moved away from its record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Drift {
    pub landmark: LandmarkId,
    pub recorded: Vec3,
    pub live: Vec3,
    pub distance_m: f32,
}

/// Re-observe each `(landmark, marker, recorded)` placement and return the
/// ones that drifted. Markers the tracker cannot see are skipped.
pub fn detect_drift<T: TrackingProvider + ?Sized>(
    placements: &[(LandmarkId, MarkerId, Vec3)],
    tracker: &T,
) -> Vec<Drift> {
    let mut flagged = Vec::new();
    for (landmark, marker, recorded) in placements {
        let Some(live) = tracker.current_position(*marker) else {
            debug!(landmark = %landmark, "marker not tracked; drift check skipped");
            continue;
        };
        let distance_m = recorded.distance(live);
        if distance_m > DRIFT_THRESHOLD_M {
            warn!(landmark = %landmark, distance_m, "drift detected");
            flagged.push(Drift {
                landmark: *landmark,
                recorded: *recorded,
                live,
                distance_m,
            });
        }
    }
    flagged
}
