//! Position estimation for unmeasured landmarks.
//!
//! Estimates are tried in priority order and the first success wins:
//!
//! | Priority | Source | Needs |
//! |---|---|---|
//! | 1 | [`ProposalSource::BakedProjection`] | a baked estimate and a cached session transform |
//! | 2 | [`ProposalSource::SessionConsensus`] | ≥ 2 anchors measured in a past session that also measured the target |
//! | 3 | [`ProposalSource::Barycentric`] or [`ProposalSource::PlanarEstimate`] | three or two placed markers in this session |
//!
//! Failures at one level are logged and never surfaced; the caller only sees
//! `None` when every level failed.

use meshcal_memory::consensus::{session_position, weighted_average};
use meshcal_spatial::barycentric::project_into;
use meshcal_spatial::transform::{ScaleMode, align_two_points, rigid_align_2point};
use meshcal_spatial::RigidTransform;
use meshcal_types::{CalibError, Landmark, Point2, Proposal, ProposalSource, SessionId, Vec3};
use tracing::debug;

/// Residual allowed when re-verifying a past-session alignment during crawl.
pub const CRAWL_VERIFICATION_THRESHOLD_M: f32 = 0.5;

/// Residual allowed when re-verifying a past-session alignment while
/// estimating the third vertex of the active triangle.
pub const THIRD_VERTEX_VERIFICATION_THRESHOLD_M: f32 = 1.0;

/// A landmark already measured in the current session.
#[derive(Debug, Clone)]
pub struct Anchor {
    pub landmark: Landmark,
    pub current: Vec3,
}

/// Geometry-only last resort.
#[derive(Debug, Clone, Copy)]
pub enum Fallback {
    /// Lift from a fully measured triangle.
    Barycentric { plan: [Point2; 3], session: [Vec3; 3] },
    /// Similarity from two placed markers; height is their mean.
    Planar { plan: [Point2; 2], session: [Vec3; 2] },
}

/// Session context shared by every estimate.
#[derive(Debug, Clone, Copy)]
pub struct Estimator<'a> {
    pub session: SessionId,
    /// Session-to-canonical transform, when one has been cached.
    pub session_transform: Option<&'a RigidTransform>,
}

impl<'a> Estimator<'a> {
    pub fn new(session: SessionId, session_transform: Option<&'a RigidTransform>) -> Self {
        Self {
            session,
            session_transform,
        }
    }

    /// Run the priority chain for `target`.
    pub fn estimate(
        &self,
        target: &Landmark,
        anchors: &[Anchor],
        fallback: Fallback,
        threshold_m: f32,
    ) -> Option<Proposal> {
        let proposal = |position, source| Proposal {
            landmark: target.id,
            position,
            source,
        };

        if let Some(p) = self.project_baked(target) {
            return Some(proposal(p, ProposalSource::BakedProjection));
        }

        match self.session_consensus(target, anchors, threshold_m) {
            Ok(p) => return Some(proposal(p, ProposalSource::SessionConsensus)),
            Err(e) => debug!(landmark = %target.id, error = %e, "session consensus unavailable"),
        }

        let result = match fallback {
            Fallback::Barycentric { plan, session } => {
                project_into(plan, session, target.map_position()).map(|p| (p, ProposalSource::Barycentric))
            }
            Fallback::Planar { plan, session } => {
                planar_estimate(plan, session, target.map_position()).map(|p| (p, ProposalSource::PlanarEstimate))
            }
        };
        match result {
            Ok((p, source)) => Some(proposal(p, source)),
            Err(e) => {
                debug!(landmark = %target.id, error = %e, "no estimate available");
                None
            }
        }
    }

    /// Baked canonical estimate projected into the current session.
    pub fn project_baked(&self, target: &Landmark) -> Option<Vec3> {
        let transform = self.session_transform?;
        let baked = target.baked?;
        Some(transform.apply_inverse(baked.position))
    }

    /// Confidence-weighted consensus of the target's past-session positions,
    /// each carried into this session by a rigid two-anchor alignment.
    ///
    /// Within one past session, the target and anchors each contribute
    /// their outlier-filtered session consensus rather than a single record.
    pub fn session_consensus(
        &self,
        target: &Landmark,
        anchors: &[Anchor],
        threshold_m: f32,
    ) -> Result<Vec3, CalibError> {
        let mut candidates: Vec<(Vec3, f32)> = Vec::new();
        let mut last_error = CalibError::InsufficientCorrespondences { needed: 2, found: 0 };

        for session in target.sessions() {
            if session == self.session {
                continue;
            }
            let Some((position, confidence)) = session_position(target, session) else {
                continue;
            };
            match align_from_session(anchors, session, threshold_m) {
                Ok(t) => candidates.push((t.apply(position), confidence)),
                Err(e) => {
                    debug!(session = %session, error = %e, "candidate rejected");
                    last_error = e;
                }
            }
        }

        if candidates.is_empty() {
            return Err(last_error);
        }
        Ok(weighted_average(candidates))
    }
}

/// Rigid transform from `session` into the current one, using the two
/// anchors with the widest baseline in `session`, verified on the second.
fn align_from_session(anchors: &[Anchor], session: SessionId, threshold_m: f32) -> Result<RigidTransform, CalibError> {
    let pairs: Vec<(Vec3, Vec3)> = anchors
        .iter()
        .filter_map(|a| session_position(&a.landmark, session).map(|(p, _)| (p, a.current)))
        .collect();
    if pairs.len() < 2 {
        return Err(CalibError::InsufficientCorrespondences {
            needed: 2,
            found: pairs.len(),
        });
    }

    let mut best = (pairs[0], pairs[1]);
    let mut best_len = f32::NEG_INFINITY;
    for (i, a) in pairs.iter().enumerate() {
        for b in &pairs[i + 1..] {
            let len = a.0.horizontal_distance(b.0);
            if len > best_len {
                best_len = len;
                best = (*a, *b);
            }
        }
    }

    let ((old_a, new_a), (old_b, new_b)) = best;
    let t = rigid_align_2point(old_a, old_b, new_a, new_b)?;
    t.verify(old_b, new_b, threshold_m)?;
    Ok(t)
}

/// Estimate a plan point's session position from two placed markers.
///
/// Fits a similarity (rotation, translation, scale) from the plan's
/// horizontal lift onto the session and sets the height to the mean of the
/// two markers.
pub fn planar_estimate(plan: [Point2; 2], session: [Vec3; 2], target: Point2) -> Result<Vec3, CalibError> {
    let t = align_two_points(
        plan[0].to_horizontal(),
        plan[1].to_horizontal(),
        session[0],
        session[1],
        ScaleMode::Estimate,
    )?;
    let mut p = t.apply(target.to_horizontal());
    p.y = (session[0].y + session[1].y) / 2.0;
    Ok(p)
}
