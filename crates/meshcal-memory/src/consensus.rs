//! Outlier-rejected, confidence-weighted consensus over a landmark history.
//!
//! The rejection centroid is the plain mean of every record, outliers
//! included; survivors are then averaged by confidence.

use meshcal_types::{Landmark, PositionRecord, SessionId, Vec3};
use tracing::debug;

use crate::history::records_in_session;

/// Records further than this from the all-record centroid are outliers.
pub const OUTLIER_RADIUS_M: f32 = 0.15;

/// Best single position for `landmark` over its whole history, or `None`
/// when it has none.
pub fn consensus_position(landmark: &Landmark) -> Option<Vec3> {
    let records: Vec<&PositionRecord> = landmark.history.iter().collect();
    consensus_of(&records)
}

/// Consensus of the records captured in `session`, paired with their mean
/// confidence. `None` when the session never measured the landmark.
pub fn session_position(landmark: &Landmark, session: SessionId) -> Option<(Vec3, f32)> {
    let records = records_in_session(landmark, session);
    let position = consensus_of(&records)?;
    let confidence = records.iter().map(|r| r.confidence).sum::<f32>() / records.len() as f32;
    Some((position, confidence))
}

/// Consensus over an arbitrary record subset, e.g. one session's records.
pub fn consensus_of(records: &[&PositionRecord]) -> Option<Vec3> {
    match records {
        [] => None,
        [only] => Some(only.position),
        _ => {
            let centroid = mean(records.iter().map(|r| r.position));
            let survivors: Vec<&PositionRecord> = records
                .iter()
                .copied()
                .filter(|r| r.position.distance(centroid) <= OUTLIER_RADIUS_M)
                .collect();

            if survivors.is_empty() {
                debug!(records = records.len(), "every record rejected as outlier; averaging all");
                return Some(weighted_average(records.iter().map(|r| (r.position, r.confidence))));
            }
            if survivors.len() < records.len() {
                debug!(
                    rejected = records.len() - survivors.len(),
                    kept = survivors.len(),
                    "outliers rejected"
                );
            }
            Some(weighted_average(survivors.iter().map(|r| (r.position, r.confidence))))
        }
    }
}

/// Confidence-weighted mean of `(position, weight)` pairs.
///
/// Falls back to the unweighted mean when every weight is zero. An empty
/// input yields the origin.
pub fn weighted_average(samples: impl IntoIterator<Item = (Vec3, f32)>) -> Vec3 {
    let samples: Vec<(Vec3, f32)> = samples.into_iter().collect();
    let total: f32 = samples.iter().map(|(_, w)| *w).sum();
    if total <= 0.0 {
        return mean(samples.iter().map(|(p, _)| *p));
    }
    samples
        .iter()
        .fold(Vec3::zero(), |acc, (p, w)| acc + *p * *w)
        * (1.0 / total)
}

fn mean(points: impl Iterator<Item = Vec3>) -> Vec3 {
    let (sum, n) = points.fold((Vec3::zero(), 0usize), |(s, n), p| (s + p, n + 1));
    if n == 0 { sum } else { sum * (1.0 / n as f32) }
}
