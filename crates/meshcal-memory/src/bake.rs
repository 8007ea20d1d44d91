//! Bake-down: folding session measurements into canonical estimates.
//!
//! Two entry points share the same blending rule:
//!
//! - [`bake_down`] folds one session's samples for one landmark through an
//!   already-fitted session-to-canonical transform. The engine calls it when
//!   a triangle completes.
//! - [`plan_bake`] rebuilds every landmark's estimate from an immutable
//!   history snapshot: one rigid transform per session, every session folded
//!   in chronological order. Nothing is written; the caller commits the
//!   resulting [`BakePlan`] against the live store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use meshcal_spatial::canonical::widest_pair;
use meshcal_spatial::transform::rigid_align_2point;
use meshcal_spatial::{CanonicalFrame, Correspondence, RigidTransform};
use meshcal_types::{BakedPosition, CalibError, Landmark, LandmarkId, SessionId, Vec3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::consensus::session_position;

/// Largest residual accepted when re-verifying a per-session bake transform.
pub const BAKE_VERIFICATION_THRESHOLD_M: f32 = 0.1;

// ────────────────────────────────────────────────────────────────────────────
// Blending
// ────────────────────────────────────────────────────────────────────────────

/// Blend one canonical sample into an existing estimate.
///
/// The old estimate weighs `confidence × sample_count`, the new sample its
/// own confidence. A landmark with no estimate adopts the sample as-is.
pub fn blend(existing: Option<BakedPosition>, canonical: Vec3, confidence: f32) -> BakedPosition {
    let Some(old) = existing.filter(|b| b.sample_count > 0) else {
        return BakedPosition {
            position: canonical,
            confidence,
            sample_count: 1,
        };
    };

    let w_old = old.confidence * old.sample_count as f32;
    let w_new = confidence;
    let total = w_old + w_new;
    let position = if total > 0.0 {
        (old.position * w_old + canonical * w_new) * (1.0 / total)
    } else {
        (old.position + canonical) * 0.5
    };

    BakedPosition {
        position,
        confidence: total / (old.sample_count + 1) as f32,
        sample_count: old.sample_count + 1,
    }
}

/// Fold session-local `(position, confidence)` samples into `landmark`'s
/// canonical estimate through `session_to_canonical`.
pub fn bake_down(landmark: &mut Landmark, samples: &[(Vec3, f32)], session_to_canonical: &RigidTransform) {
    if samples.is_empty() {
        return;
    }
    let mut baked = landmark.baked;
    for (position, confidence) in samples {
        baked = Some(blend(baked, session_to_canonical.apply(*position), *confidence));
    }
    landmark.baked = baked;
    landmark.revision += 1;
    debug!(
        landmark = %landmark.id,
        samples = samples.len(),
        sample_count = landmark.baked.map(|b| b.sample_count).unwrap_or(0),
        "baked down"
    );
}

// ────────────────────────────────────────────────────────────────────────────
// Retrospective planning
// ────────────────────────────────────────────────────────────────────────────

/// A freshly computed estimate for one landmark, tagged with the revision of
/// the snapshot it was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BakeResult {
    pub landmark: LandmarkId,
    pub baked: BakedPosition,
    pub base_revision: u64,
}

/// Why a session contributed nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedSession {
    pub session: SessionId,
    pub reason: CalibError,
}

/// Output of [`plan_bake`].
#[derive(Debug, Clone, Default)]
pub struct BakePlan {
    pub results: Vec<BakeResult>,
    pub sessions_used: Vec<SessionId>,
    pub sessions_skipped: Vec<SkippedSession>,
}

/// Sessions ordered by the time of their earliest record.
fn sessions_chronological(landmarks: &[Landmark]) -> Vec<SessionId> {
    let mut first_seen: HashMap<SessionId, DateTime<Utc>> = HashMap::new();
    for record in landmarks.iter().flat_map(|lm| lm.history.iter()) {
        first_seen
            .entry(record.session)
            .and_modify(|t| {
                if record.recorded_at < *t {
                    *t = record.recorded_at;
                }
            })
            .or_insert(record.recorded_at);
    }
    let mut sessions: Vec<(SessionId, DateTime<Utc>)> = first_seen.into_iter().collect();
    sessions.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
    sessions.into_iter().map(|(s, _)| s).collect()
}

/// Fit and verify the rigid session-to-canonical transform for `session`.
pub fn fit_session(
    landmarks: &[Landmark],
    session: SessionId,
    frame: &CanonicalFrame,
) -> Result<RigidTransform, CalibError> {
    let correspondences: Vec<Correspondence> = landmarks
        .iter()
        .filter_map(|lm| {
            session_position(lm, session).map(|(position, _)| Correspondence::new(position, lm.map_position()))
        })
        .collect();

    let (a, b) = widest_pair(&correspondences)?;
    let target_a = frame.map_to_canonical(a.map);
    let target_b = frame.map_to_canonical(b.map);
    let transform = rigid_align_2point(a.session, b.session, target_a, target_b)?;
    transform.verify(b.session, target_b, BAKE_VERIFICATION_THRESHOLD_M)?;
    Ok(transform)
}

/// Rebuild canonical estimates for every landmark in `snapshot`.
///
/// `cancelled` is polled between sessions; returns `None` as soon as it
/// reports `true`.
pub fn plan_bake(
    snapshot: &[Landmark],
    frame: &CanonicalFrame,
    cancelled: impl Fn() -> bool,
) -> Option<BakePlan> {
    let mut plan = BakePlan::default();
    let mut folded: HashMap<LandmarkId, BakedPosition> = HashMap::new();

    for session in sessions_chronological(snapshot) {
        if cancelled() {
            info!(sessions_done = plan.sessions_used.len(), "bake planning cancelled");
            return None;
        }

        let transform = match fit_session(snapshot, session, frame) {
            Ok(t) => t,
            Err(reason) => {
                warn!(session = %session, error = %reason, "session skipped by bake");
                plan.sessions_skipped.push(SkippedSession { session, reason });
                continue;
            }
        };

        for lm in snapshot {
            for record in lm.history.iter().filter(|r| r.session == session) {
                let sample = transform.apply(record.position);
                let next = blend(folded.get(&lm.id).copied(), sample, record.confidence);
                folded.insert(lm.id, next);
            }
        }
        plan.sessions_used.push(session);
    }

    plan.results = snapshot
        .iter()
        .filter_map(|lm| {
            folded.get(&lm.id).map(|baked| BakeResult {
                landmark: lm.id,
                baked: *baked,
                base_revision: lm.revision,
            })
        })
        .collect();

    info!(
        landmarks = plan.results.len(),
        sessions_used = plan.sessions_used.len(),
        sessions_skipped = plan.sessions_skipped.len(),
        "bake planned"
    );
    Some(plan)
}
