//! Mesh crawl: proposing the far vertices of a calibrated triangle's
//! neighbours.
//!
//! A neighbour shares exactly one edge with the calibrated triangle; its far
//! vertex is the one it does not share. Each eligible far vertex gets at most
//! one proposal per session, so running the crawl twice over the same
//! triangle proposes nothing new.

use std::collections::{HashMap, HashSet};

use meshcal_memory::FloorPlanStore;
use meshcal_types::{CalibError, LandmarkId, Point2, Proposal, Triangle, Vec3};
use tracing::{debug, info};

use crate::estimate::{Anchor, CRAWL_VERIFICATION_THRESHOLD_M, Estimator, Fallback};

/// Landmarks the crawl must leave alone.
#[derive(Debug, Clone, Copy)]
pub struct CrawlExclusions<'a> {
    /// Measured in the current session.
    pub measured: &'a HashMap<LandmarkId, Vec3>,
    /// Adjusted by the user this session.
    pub adjusted: &'a HashSet<LandmarkId>,
    /// Already carrying an outstanding proposal.
    pub proposed: &'a HashMap<LandmarkId, Proposal>,
}

impl CrawlExclusions<'_> {
    fn excludes(&self, landmark: LandmarkId) -> bool {
        self.measured.contains_key(&landmark)
            || self.adjusted.contains(&landmark)
            || self.proposed.contains_key(&landmark)
    }
}

/// Estimate every eligible far vertex around `calibrated`.
///
/// All three vertices of `calibrated` must be measured in the current
/// session.
pub fn propose_for_neighbors<S: FloorPlanStore + ?Sized>(
    store: &S,
    calibrated: &Triangle,
    estimator: &Estimator<'_>,
    exclusions: CrawlExclusions<'_>,
) -> Result<Vec<Proposal>, CalibError> {
    let vertices = calibrated.vertices();
    let mut plan = [Point2::default(); 3];
    let mut session = [Vec3::default(); 3];
    let mut anchors = Vec::with_capacity(3);
    for (i, id) in vertices.iter().enumerate() {
        let landmark = store.landmark(*id).ok_or(CalibError::LandmarkNotFound(*id))?;
        let current = *exclusions
            .measured
            .get(id)
            .ok_or(CalibError::InsufficientCorrespondences { needed: 3, found: i })?;
        plan[i] = landmark.map_position();
        session[i] = current;
        anchors.push(Anchor { landmark, current });
    }

    let mut proposals: Vec<Proposal> = Vec::new();
    for neighbor in store.find_adjacent(calibrated.id)? {
        let Some(far) = calibrated.far_vertex_of(&neighbor) else {
            continue;
        };
        if exclusions.excludes(far) || proposals.iter().any(|p| p.landmark == far) {
            debug!(landmark = %far, "far vertex already resolved");
            continue;
        }
        let Some(target) = store.landmark(far) else {
            continue;
        };

        let fallback = Fallback::Barycentric { plan, session };
        if let Some(proposal) = estimator.estimate(&target, &anchors, fallback, CRAWL_VERIFICATION_THRESHOLD_M) {
            info!(
                landmark = %far,
                neighbor = %neighbor.id,
                source = ?proposal.source,
                "proposal computed"
            );
            proposals.push(proposal);
        }
    }
    Ok(proposals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcal_memory::InMemoryStore;
    use meshcal_types::{ProposalSource, SessionId};

    #[test]
    fn crawl_is_idempotent() {
        let mut store = InMemoryStore::new();
        let a = store.add_landmark(Point2::new(0.0, 0.0));
        let b = store.add_landmark(Point2::new(100.0, 0.0));
        let c = store.add_landmark(Point2::new(0.0, 100.0));
        let d = store.add_landmark(Point2::new(100.0, 100.0));
        let t1 = store.create_triangle([a, b, c]).unwrap();
        store.create_triangle([b, c, d]).unwrap();

        let mut measured = HashMap::new();
        measured.insert(a, Vec3::new(0.0, -1.0, 0.0));
        measured.insert(b, Vec3::new(1.0, -1.0, 0.0));
        measured.insert(c, Vec3::new(0.0, -1.0, 1.0));
        let adjusted = HashSet::new();
        let mut proposed = HashMap::new();

        let session = SessionId::new();
        let estimator = Estimator::new(session, None);
        let tri = store.triangle(t1).unwrap();

        let first = propose_for_neighbors(
            &store,
            &tri,
            &estimator,
            CrawlExclusions { measured: &measured, adjusted: &adjusted, proposed: &proposed },
        )
        .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].landmark, d);
        assert_eq!(first[0].source, ProposalSource::Barycentric);
        assert!(first[0].position.distance(Vec3::new(1.0, -1.0, 1.0)) < 1e-5);

        for p in first {
            proposed.insert(p.landmark, p);
        }
        let second = propose_for_neighbors(
            &store,
            &tri,
            &estimator,
            CrawlExclusions { measured: &measured, adjusted: &adjusted, proposed: &proposed },
        )
        .unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn adjusted_far_vertex_is_skipped() {
        let mut store = InMemoryStore::new();
        let a = store.add_landmark(Point2::new(0.0, 0.0));
        let b = store.add_landmark(Point2::new(100.0, 0.0));
        let c = store.add_landmark(Point2::new(0.0, 100.0));
        let d = store.add_landmark(Point2::new(100.0, 100.0));
        let t1 = store.create_triangle([a, b, c]).unwrap();
        store.create_triangle([b, c, d]).unwrap();

        let measured: HashMap<_, _> = [
            (a, Vec3::new(0.0, 0.0, 0.0)),
            (b, Vec3::new(1.0, 0.0, 0.0)),
            (c, Vec3::new(0.0, 0.0, 1.0)),
        ]
        .into_iter()
        .collect();
        let adjusted: HashSet<_> = [d].into_iter().collect();
        let proposed = HashMap::new();

        let out = propose_for_neighbors(
            &store,
            &store.triangle(t1).unwrap(),
            &Estimator::new(SessionId::new(), None),
            CrawlExclusions { measured: &measured, adjusted: &adjusted, proposed: &proposed },
        )
        .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn unmeasured_triangle_cannot_crawl() {
        let mut store = InMemoryStore::new();
        let a = store.add_landmark(Point2::new(0.0, 0.0));
        let b = store.add_landmark(Point2::new(100.0, 0.0));
        let c = store.add_landmark(Point2::new(0.0, 100.0));
        let t1 = store.create_triangle([a, b, c]).unwrap();

        let measured = HashMap::new();
        let (adjusted, proposed) = (HashSet::new(), HashMap::new());
        let err = propose_for_neighbors(
            &store,
            &store.triangle(t1).unwrap(),
            &Estimator::new(SessionId::new(), None),
            CrawlExclusions { measured: &measured, adjusted: &adjusted, proposed: &proposed },
        )
        .unwrap_err();
        assert!(matches!(err, CalibError::InsufficientCorrespondences { needed: 3, found: 0 }));
    }
}
