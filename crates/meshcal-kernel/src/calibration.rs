//! [`CalibrationEngine`] – the triangle calibration state machine.
//!
//! ```text
//!            start_calibration / start_anchor_calibration
//!   Idle ───────────────────────────────────────────────▶ PlacingVertices(0)
//!                                                              │ register ×3
//!                                                              ▼
//!                       enter_survey_mode            ┌──── ReadyToFill ◀──┐
//!              SurveyMode ◀──────────────────────────┘                    │
//!                  └──────────────────────────────────────────────────────┘
//!                                exit_survey_mode
//!
//!   reset() returns to Idle from anywhere.
//! ```
//!
//! Each call runs to completion and validates before it mutates. A placement
//! either lands in history, is held as a [`BlockedPlacement`] awaiting
//! [`override_blocked`](CalibrationEngine::override_blocked) or
//! [`cancel_blocked`](CalibrationEngine::cancel_blocked), or completes the
//! target. Completing the third vertex first re-observes the earlier two;
//! drifted markers must be re-confirmed before the triangle is finalized.
//!
//! # Example
//!
//! ```rust
//! use meshcal_kernel::calibration::{CalibrationEngine, RegistrationOutcome};
//! use meshcal_kernel::observer::NullObserver;
//! use meshcal_kernel::tracking::NoTracking;
//! use meshcal_memory::{FloorPlanStore, InMemoryStore};
//! use meshcal_types::{CalibrationState, Point2, SourceKind, Vec3};
//!
//! let mut store = InMemoryStore::new();
//! let a = store.add_landmark(Point2::new(0.0, 0.0));
//! let b = store.add_landmark(Point2::new(100.0, 0.0));
//! let c = store.add_landmark(Point2::new(0.0, 100.0));
//! let tri = store.create_triangle([a, b, c]).unwrap();
//!
//! let mut engine = CalibrationEngine::new(store, NoTracking, NullObserver);
//! engine.start_calibration(tri).unwrap();
//! engine.register_marker(a, Vec3::new(0.0, -1.1, 0.0), SourceKind::InitialPlacement).unwrap();
//! engine.register_marker(b, Vec3::new(1.0, -1.1, 0.0), SourceKind::InitialPlacement).unwrap();
//! let outcome = engine
//!     .register_marker(c, Vec3::new(0.0, -1.1, 1.0), SourceKind::ProposalConfirmed)
//!     .unwrap();
//!
//! assert!(matches!(outcome, RegistrationOutcome::Completed { .. }));
//! assert_eq!(engine.state(), CalibrationState::ReadyToFill);
//! ```

use std::collections::{HashMap, HashSet};

use meshcal_memory::bake::bake_down;
use meshcal_memory::consensus::session_position;
use meshcal_memory::{FloorPlanStore, StoreError};
use meshcal_spatial::barycentric::{fill_points, project_into};
use meshcal_spatial::transform::ScaleMode;
use meshcal_spatial::{CanonicalFrame, Correspondence, RigidTransform};
use meshcal_types::{
    BlockedPlacement, CalibError, CalibrationState, LandmarkId, MarkerId, Point2, PositionRecord,
    Proposal, ProposalSource, SessionId, SourceKind, TriangleId, Vec3,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crawl::{CrawlExclusions, propose_for_neighbors};
use crate::drift::detect_drift;
use crate::estimate::{Anchor, Estimator, Fallback, THIRD_VERTEX_VERIFICATION_THRESHOLD_M};
use crate::observer::CalibrationObserver;
use crate::quality::{QualityBand, measure_legs, triangle_quality};
use crate::tracking::TrackingProvider;

/// Placements further than this from their proposal are blocked.
pub const BLOCK_DISTANCE_M: f32 = 0.5;

/// Confidence recorded when the user overrides a blocked placement.
pub const OVERRIDE_CONFIDENCE: f32 = 0.1;

// ────────────────────────────────────────────────────────────────────────────
// Public result types
// ────────────────────────────────────────────────────────────────────────────

/// What a calibration run is placing markers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationTarget {
    Triangle(TriangleId),
    /// Three ad-hoc anchors, not necessarily a stored triangle.
    AnchorSet([LandmarkId; 3]),
}

/// A finalized triangle or anchor set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    /// `None` for an anchor set that matches no stored triangle.
    pub triangle: Option<TriangleId>,
    pub vertices: [LandmarkId; 3],
    pub quality: f32,
    pub band: QualityBand,
    /// Crawl proposals emitted for neighbouring far vertices.
    pub proposals: Vec<Proposal>,
}

/// Result of a registration call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RegistrationOutcome {
    /// Stored; the target is not complete yet.
    Recorded {
        landmark: LandmarkId,
        state: CalibrationState,
        /// Proposal emitted for the remaining vertex, if this was the second.
        proposal: Option<Proposal>,
    },
    /// Not stored; awaiting override or cancel.
    Blocked { blocked: BlockedPlacement },
    /// Stored, but these earlier placements drifted and must be re-confirmed.
    DriftCorrectionRequired { landmarks: Vec<LandmarkId> },
    /// Stored and one or more targets finalized.
    Completed { completions: Vec<Completion> },
}

/// A survey fill point and its lifted session position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SurveyPoint {
    pub map: Point2,
    pub position: Vec3,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal bookkeeping
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct ActiveTarget {
    target: CalibrationTarget,
    /// Stored triangle the target resolves to.
    triangle: Option<TriangleId>,
    /// Vertices in placement order, starting at the rotated start vertex.
    order: [LandmarkId; 3],
}

/// A fully placed target waiting for drift corrections.
#[derive(Debug, Clone, Copy)]
struct Held {
    triangle: Option<TriangleId>,
    vertices: [LandmarkId; 3],
}

// ────────────────────────────────────────────────────────────────────────────
// CalibrationEngine
// ────────────────────────────────────────────────────────────────────────────

/// Single-context calibration engine.
///
/// The store, tracker and observer are required at construction; the
/// canonical frame is optional and without it estimation falls back to
/// session consensus and plan geometry.
pub struct CalibrationEngine<S, T, O> {
    store: S,
    tracker: T,
    observer: O,
    frame: Option<CanonicalFrame>,
    bake_on_complete: bool,
    session: SessionId,

    state: CalibrationState,
    active: Option<ActiveTarget>,
    positions: HashMap<LandmarkId, Vec3>,
    markers: HashMap<LandmarkId, MarkerId>,
    proposals: HashMap<LandmarkId, Proposal>,
    adjusted: HashSet<LandmarkId>,
    blocked: Option<BlockedPlacement>,
    pending_drift: HashSet<LandmarkId>,
    held: Vec<Held>,
    completed: HashSet<TriangleId>,
    baked: HashSet<LandmarkId>,
    session_transform: Option<RigidTransform>,
}

impl<S, T, O> CalibrationEngine<S, T, O>
where
    S: FloorPlanStore,
    T: TrackingProvider,
    O: CalibrationObserver,
{
    pub fn new(store: S, tracker: T, observer: O) -> Self {
        Self {
            store,
            tracker,
            observer,
            frame: None,
            bake_on_complete: true,
            session: SessionId::new(),
            state: CalibrationState::Idle,
            active: None,
            positions: HashMap::new(),
            markers: HashMap::new(),
            proposals: HashMap::new(),
            adjusted: HashSet::new(),
            blocked: None,
            pending_drift: HashSet::new(),
            held: Vec::new(),
            completed: HashSet::new(),
            baked: HashSet::new(),
            session_transform: None,
        }
    }

    pub fn with_frame(mut self, frame: Option<CanonicalFrame>) -> Self {
        self.frame = frame;
        self
    }

    pub fn with_bake_on_complete(mut self, bake: bool) -> Self {
        self.bake_on_complete = bake;
        self
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = session;
        self
    }

    // ── accessors ───────────────────────────────────────────────────────────

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn target(&self) -> Option<CalibrationTarget> {
        self.active.map(|a| a.target)
    }

    pub fn session_transform(&self) -> Option<&RigidTransform> {
        self.session_transform.as_ref()
    }

    pub fn proposal(&self, landmark: LandmarkId) -> Option<Proposal> {
        self.proposals.get(&landmark).copied()
    }

    pub fn proposals(&self) -> Vec<Proposal> {
        self.proposals.values().copied().collect()
    }

    pub fn session_position(&self, landmark: LandmarkId) -> Option<Vec3> {
        self.positions.get(&landmark).copied()
    }

    pub fn marker_for(&self, landmark: LandmarkId) -> Option<MarkerId> {
        self.markers.get(&landmark).copied()
    }

    pub fn blocked(&self) -> Option<&BlockedPlacement> {
        self.blocked.as_ref()
    }

    pub fn pending_drift(&self) -> Vec<LandmarkId> {
        self.pending_drift.iter().copied().collect()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    /// Next vertex the user is expected to place.
    pub fn expected_vertex(&self) -> Option<LandmarkId> {
        match self.state {
            CalibrationState::PlacingVertices(_) => self
                .active?
                .order
                .into_iter()
                .find(|v| !self.positions.contains_key(v)),
            _ => None,
        }
    }

    // ── lifecycle ───────────────────────────────────────────────────────────

    /// Begin calibrating a stored triangle.
    ///
    /// The start vertex rotates on every call so successive sessions vary
    /// which vertex is placed first. Returns that vertex.
    pub fn start_calibration(&mut self, triangle: TriangleId) -> Result<LandmarkId, CalibError> {
        let Some(tri) = self.store.triangle(triangle) else {
            warn!(triangle = %triangle, "cannot start calibration: triangle not found");
            return Err(CalibError::TriangleNotFound(triangle));
        };
        let vertices = tri.vertices();
        for v in vertices {
            if self.store.landmark(v).is_none() {
                warn!(triangle = %triangle, landmark = %v, "cannot start calibration: vertex missing");
                return Err(CalibError::LandmarkNotFound(v));
            }
        }

        let start = tri.last_start_vertex.map(|s| (s + 1) % 3).unwrap_or(0);
        self.store.set_start_vertex(triangle, start)?;
        let order = [vertices[start], vertices[(start + 1) % 3], vertices[(start + 2) % 3]];

        self.begin(ActiveTarget {
            target: CalibrationTarget::Triangle(triangle),
            triangle: Some(triangle),
            order,
        });
        info!(triangle = %triangle, start_vertex = start, "calibration started");
        Ok(order[0])
    }

    /// Begin calibrating three ad-hoc anchors.
    pub fn start_anchor_calibration(&mut self, anchors: [LandmarkId; 3]) -> Result<(), CalibError> {
        let [a, b, c] = anchors;
        if a == b || b == c || a == c {
            return Err(CalibError::InvalidTriangle("anchors must be distinct".into()));
        }
        for id in anchors {
            if self.store.landmark(id).is_none() {
                return Err(CalibError::LandmarkNotFound(id));
            }
        }
        let triangle = self
            .store
            .triangles()
            .into_iter()
            .find(|t| anchors.iter().all(|v| t.contains(*v)))
            .map(|t| t.id);

        self.begin(ActiveTarget {
            target: CalibrationTarget::AnchorSet(anchors),
            triangle,
            order: anchors,
        });
        info!(matched_triangle = triangle.is_some(), "anchor calibration started");
        Ok(())
    }

    /// Return to `Idle`, discarding every in-session accumulator and the
    /// cached session transform. History already written is untouched.
    pub fn reset(&mut self) {
        self.clear_accumulators();
        self.active = None;
        self.session_transform = None;
        self.set_state(CalibrationState::Idle);
        debug!("calibration reset");
    }

    /// Switch to a new tracking session. Implies [`reset`](Self::reset).
    pub fn begin_session(&mut self, session: SessionId) {
        self.reset();
        self.session = session;
        info!(session = %session, "tracking session started");
    }

    pub fn enter_survey_mode(&mut self) -> Result<(), CalibError> {
        if self.state != CalibrationState::ReadyToFill {
            return Err(CalibError::InvalidTransition {
                from: self.state,
                action: "enter survey mode".into(),
            });
        }
        self.set_state(CalibrationState::SurveyMode);
        Ok(())
    }

    pub fn exit_survey_mode(&mut self) -> Result<(), CalibError> {
        if self.state != CalibrationState::SurveyMode {
            return Err(CalibError::InvalidTransition {
                from: self.state,
                action: "exit survey mode".into(),
            });
        }
        self.set_state(CalibrationState::ReadyToFill);
        Ok(())
    }

    // ── registration ────────────────────────────────────────────────────────

    /// Use the caller's tracking marker for `landmark` in this run.
    ///
    /// Without a binding, [`register_marker`](Self::register_marker) mints a
    /// fresh [`MarkerId`]. Bindings are discarded by `start_calibration`,
    /// `reset` and `begin_session`, so bind after starting.
    pub fn bind_marker(&mut self, landmark: LandmarkId, marker: MarkerId) -> Result<(), CalibError> {
        if self.state == CalibrationState::Idle {
            return Err(CalibError::NoActiveCalibration);
        }
        if self.store.landmark(landmark).is_none() {
            return Err(CalibError::LandmarkNotFound(landmark));
        }
        if self.positions.contains_key(&landmark) {
            return Err(CalibError::DuplicatePlacement(landmark));
        }
        self.markers.insert(landmark, marker);
        Ok(())
    }

    /// Register a marker placed for `landmark` at `position` in the current
    /// session.
    ///
    /// The marker is the one given to [`bind_marker`](Self::bind_marker), or
    /// an engine-minted id otherwise; [`marker_for`](Self::marker_for)
    /// returns it afterwards.
    pub fn register_marker(
        &mut self,
        landmark: LandmarkId,
        position: Vec3,
        source: SourceKind,
    ) -> Result<RegistrationOutcome, CalibError> {
        self.check_registration(landmark)?;

        if let Some(proposal) = self.proposals.get(&landmark).copied() {
            let distance_m = proposal.position.distance(position);
            if distance_m > BLOCK_DISTANCE_M {
                let blocked = BlockedPlacement {
                    landmark,
                    attempted: position,
                    proposed: proposal.position,
                    distance_m,
                    source,
                };
                warn!(landmark = %landmark, distance_m, "placement blocked");
                self.blocked = Some(blocked);
                self.observer.blocked_placement(&blocked);
                return Ok(RegistrationOutcome::Blocked { blocked });
            }
        }

        self.commit(landmark, position, source, source.default_confidence())
    }

    /// Record the held blocked placement anyway, at
    /// [`OVERRIDE_CONFIDENCE`].
    pub fn override_blocked(&mut self) -> Result<RegistrationOutcome, CalibError> {
        let blocked = self
            .blocked
            .take()
            .ok_or_else(|| CalibError::NothingPending("no blocked placement".into()))?;
        info!(landmark = %blocked.landmark, distance_m = blocked.distance_m, "blocked placement overridden");
        self.commit(blocked.landmark, blocked.attempted, blocked.source, OVERRIDE_CONFIDENCE)
    }

    /// Discard the held blocked placement so the user can place again.
    pub fn cancel_blocked(&mut self) -> Result<BlockedPlacement, CalibError> {
        let blocked = self
            .blocked
            .take()
            .ok_or_else(|| CalibError::NothingPending("no blocked placement".into()))?;
        debug!(landmark = %blocked.landmark, "blocked placement cancelled");
        Ok(blocked)
    }

    /// Accept a drifted marker at its live position.
    pub fn confirm_drift(&mut self, landmark: LandmarkId) -> Result<RegistrationOutcome, CalibError> {
        if !self.pending_drift.contains(&landmark) {
            return Err(CalibError::NothingPending(format!("no drift correction for {landmark}")));
        }
        let live = self
            .proposals
            .get(&landmark)
            .map(|p| p.position)
            .or_else(|| {
                self.markers
                    .get(&landmark)
                    .and_then(|m| self.tracker.current_position(*m))
            })
            .ok_or_else(|| CalibError::NothingPending(format!("no live position for {landmark}")))?;
        self.register_marker(landmark, live, SourceKind::ProposalConfirmed)
    }

    // ── crawl / survey ──────────────────────────────────────────────────────

    /// Propose far vertices of `triangle`'s neighbours. Already resolved,
    /// adjusted or proposed vertices are skipped.
    pub fn propose_for_neighbors(&mut self, triangle: TriangleId) -> Result<Vec<Proposal>, CalibError> {
        if !self.state.allows_crawl() {
            return Err(CalibError::InvalidTransition {
                from: self.state,
                action: "crawl".into(),
            });
        }
        self.crawl(triangle)
    }

    /// Evenly spaced points inside the active target, lifted into the
    /// current session.
    pub fn survey_points(&self, spacing_m: f32) -> Result<Vec<SurveyPoint>, CalibError> {
        if self.state != CalibrationState::SurveyMode {
            return Err(CalibError::InvalidTransition {
                from: self.state,
                action: "generate survey points".into(),
            });
        }
        let active = self.active.ok_or(CalibError::NoActiveCalibration)?;
        let (plan, session) = self.measured_vertices(active.order)?;

        let pixels_per_meter = match self.frame {
            Some(f) => f.pixels_per_meter,
            None => {
                let plan_px: f32 = (0..3).map(|i| plan[i].distance(plan[(i + 1) % 3])).sum();
                let tracked_m: f32 = (0..3).map(|i| session[i].distance(session[(i + 1) % 3])).sum();
                if tracked_m <= 0.0 {
                    return Err(CalibError::DegenerateGeometry("markers coincide".into()));
                }
                plan_px / tracked_m
            }
        };

        fill_points(plan, spacing_m, pixels_per_meter)
            .into_iter()
            .map(|map| project_into(plan, session, map).map(|position| SurveyPoint { map, position }))
            .collect()
    }

    // ── internals ───────────────────────────────────────────────────────────

    fn set_state(&mut self, to: CalibrationState) {
        let from = self.state;
        if from != to {
            self.state = to;
            debug!(%from, %to, "state changed");
            self.observer.state_changed(from, to);
        }
    }

    fn clear_accumulators(&mut self) {
        self.positions.clear();
        self.markers.clear();
        self.proposals.clear();
        self.adjusted.clear();
        self.blocked = None;
        self.pending_drift.clear();
        self.held.clear();
        self.completed.clear();
        self.baked.clear();
    }

    fn begin(&mut self, active: ActiveTarget) {
        self.clear_accumulators();
        self.active = Some(active);
        self.set_state(CalibrationState::PlacingVertices(0));
    }

    fn check_registration(&self, landmark: LandmarkId) -> Result<(), CalibError> {
        if self.state == CalibrationState::Idle {
            return Err(CalibError::NoActiveCalibration);
        }
        if let Some(b) = &self.blocked {
            return Err(CalibError::PlacementPending(b.landmark));
        }
        if self.store.landmark(landmark).is_none() {
            return Err(CalibError::LandmarkNotFound(landmark));
        }
        let fixing = self.pending_drift.contains(&landmark);
        if !fixing && self.positions.contains_key(&landmark) {
            return Err(CalibError::DuplicatePlacement(landmark));
        }

        match self.state {
            CalibrationState::PlacingVertices(_) => {
                let active = self.active.ok_or(CalibError::NoActiveCalibration)?;
                if let CalibrationTarget::Triangle(id) = active.target {
                    if self.store.triangle(id).is_none() {
                        return Err(CalibError::TriangleNotFound(id));
                    }
                }
                if !active.order.contains(&landmark) {
                    return Err(CalibError::VertexNotInTriangle { landmark });
                }
            }
            _ => {
                if !fixing && self.store.triangles_containing(landmark).is_empty() {
                    return Err(CalibError::VertexNotInTriangle { landmark });
                }
            }
        }
        Ok(())
    }

    fn commit(
        &mut self,
        landmark: LandmarkId,
        position: Vec3,
        source: SourceKind,
        confidence: f32,
    ) -> Result<RegistrationOutcome, CalibError> {
        let fixing = self.pending_drift.contains(&landmark);
        let mut record = PositionRecord::new(position, self.session, source, confidence);
        if let Some(p) = self.proposals.get(&landmark) {
            record = record.with_distortion(position - p.position);
        }
        if fixing {
            self.store.replace_record(landmark, record)?;
        } else {
            self.store.append_record(landmark, record)?;
        }

        let marker = self.markers.get(&landmark).copied().unwrap_or_default();
        let updated = self.store.assign_marker(landmark, marker);
        self.markers.insert(landmark, marker);
        self.positions.insert(landmark, position);
        self.proposals.remove(&landmark);
        if source == SourceKind::ProposalAdjusted {
            self.adjusted.insert(landmark);
        }
        debug!(
            landmark = %landmark,
            ?source,
            confidence,
            triangles_updated = updated,
            replaced = fixing,
            "marker registered"
        );

        if fixing {
            self.pending_drift.remove(&landmark);
            if !self.pending_drift.is_empty() {
                return Ok(RegistrationOutcome::DriftCorrectionRequired {
                    landmarks: self.pending_drift(),
                });
            }
            let held = std::mem::take(&mut self.held);
            return self.finalize_all(held);
        }

        match self.state {
            CalibrationState::PlacingVertices(_) => self.advance_placement(landmark),
            _ => self.free_placement(landmark),
        }
    }

    fn advance_placement(&mut self, landmark: LandmarkId) -> Result<RegistrationOutcome, CalibError> {
        let active = self.active.ok_or(CalibError::NoActiveCalibration)?;
        let placed = active
            .order
            .into_iter()
            .filter(|v| self.positions.contains_key(v))
            .count();

        match placed {
            0 | 1 => {
                self.set_state(CalibrationState::PlacingVertices(1));
                Ok(RegistrationOutcome::Recorded {
                    landmark,
                    state: self.state,
                    proposal: None,
                })
            }
            2 => {
                self.refresh_session_transform();
                let proposal = self.propose_third_vertex(&active)?;
                self.set_state(CalibrationState::PlacingVertices(2));
                Ok(RegistrationOutcome::Recorded {
                    landmark,
                    state: self.state,
                    proposal,
                })
            }
            _ => {
                let earlier: Vec<LandmarkId> = active.order.into_iter().filter(|v| *v != landmark).collect();
                let held = Held {
                    triangle: active.triangle,
                    vertices: active.order,
                };
                self.check_drift_or_finalize(vec![held], &earlier)
            }
        }
    }

    fn free_placement(&mut self, landmark: LandmarkId) -> Result<RegistrationOutcome, CalibError> {
        self.refresh_session_transform();

        let ready: Vec<Held> = self
            .store
            .triangles_containing(landmark)
            .into_iter()
            .filter(|t| !self.completed.contains(&t.id))
            .filter(|t| t.vertices().iter().all(|v| self.positions.contains_key(v)))
            .map(|t| Held {
                triangle: Some(t.id),
                vertices: t.vertices(),
            })
            .collect();

        if ready.is_empty() {
            return Ok(RegistrationOutcome::Recorded {
                landmark,
                state: self.state,
                proposal: None,
            });
        }

        let mut earlier: Vec<LandmarkId> = Vec::new();
        for v in ready.iter().flat_map(|h| h.vertices) {
            if v != landmark && !earlier.contains(&v) {
                earlier.push(v);
            }
        }
        self.check_drift_or_finalize(ready, &earlier)
    }

    fn check_drift_or_finalize(
        &mut self,
        held: Vec<Held>,
        earlier: &[LandmarkId],
    ) -> Result<RegistrationOutcome, CalibError> {
        let placements: Vec<(LandmarkId, MarkerId, Vec3)> = earlier
            .iter()
            .filter_map(|id| Some((*id, *self.markers.get(id)?, *self.positions.get(id)?)))
            .collect();
        let drifts = detect_drift(&placements, &self.tracker);
        if drifts.is_empty() {
            return self.finalize_all(held);
        }

        let landmarks: Vec<LandmarkId> = drifts.iter().map(|d| d.landmark).collect();
        for d in &drifts {
            let proposal = Proposal {
                landmark: d.landmark,
                position: d.live,
                source: ProposalSource::DriftCorrection,
            };
            self.pending_drift.insert(d.landmark);
            self.proposals.insert(d.landmark, proposal);
            self.observer.propose_position(&proposal);
        }
        self.held.extend(held);
        self.observer.drift_correction_needed(&landmarks);
        Ok(RegistrationOutcome::DriftCorrectionRequired { landmarks })
    }

    fn finalize_all(&mut self, held: Vec<Held>) -> Result<RegistrationOutcome, CalibError> {
        let mut completions = Vec::with_capacity(held.len());
        for h in held {
            completions.push(self.finalize(h)?);
        }
        Ok(RegistrationOutcome::Completed { completions })
    }

    fn finalize(&mut self, held: Held) -> Result<Completion, CalibError> {
        let (plan, tracked) = self.measured_vertices(held.vertices)?;
        let legs = measure_legs(
            held.vertices,
            plan,
            tracked,
            self.frame.map(|f| f.pixels_per_meter),
        );
        let quality = triangle_quality(&legs);
        let band = QualityBand::from_quality(quality);

        if let Some(id) = held.triangle {
            self.store.set_leg_measurements(id, legs)?;
            self.store.set_calibrated(id, quality)?;
            self.completed.insert(id);
            self.observer.triangle_calibrated(id, quality);
        }
        info!(triangle = ?held.triangle.map(|t| t.to_string()), quality, %band, "triangle calibrated");

        if matches!(self.state, CalibrationState::PlacingVertices(_)) {
            self.set_state(CalibrationState::ReadyToFill);
        }
        if self.bake_on_complete {
            self.bake_vertices(held.vertices)?;
        }
        let proposals = match held.triangle {
            Some(id) => self.crawl(id)?,
            None => Vec::new(),
        };

        Ok(Completion {
            triangle: held.triangle,
            vertices: held.vertices,
            quality,
            band,
            proposals,
        })
    }

    fn measured_vertices(&self, vertices: [LandmarkId; 3]) -> Result<([Point2; 3], [Vec3; 3]), CalibError> {
        let mut plan = [Point2::default(); 3];
        let mut tracked = [Vec3::default(); 3];
        for (i, id) in vertices.iter().enumerate() {
            plan[i] = self
                .store
                .landmark(*id)
                .ok_or(CalibError::LandmarkNotFound(*id))?
                .map_position();
            tracked[i] = *self
                .positions
                .get(id)
                .ok_or(CalibError::InsufficientCorrespondences { needed: 3, found: i })?;
        }
        Ok((plan, tracked))
    }

    fn bake_vertices(&mut self, vertices: [LandmarkId; 3]) -> Result<(), CalibError> {
        let Some(transform) = self.session_transform else {
            return Ok(());
        };
        for id in vertices {
            if self.baked.contains(&id) {
                continue;
            }
            let Some(mut landmark) = self.store.landmark(id) else {
                continue;
            };
            let Some(sample) = session_position(&landmark, self.session) else {
                continue;
            };
            let base_revision = landmark.revision;
            bake_down(&mut landmark, &[sample], &transform);
            let Some(baked) = landmark.baked else {
                continue;
            };
            match self.store.set_baked(id, baked, Some(base_revision)) {
                Ok(()) => {
                    self.baked.insert(id);
                }
                // A concurrent bake got there first; its estimate stands.
                Err(StoreError::StaleRevision { expected, found, .. }) => {
                    debug!(landmark = %id, expected, found, "stale interactive bake skipped");
                }
                Err(StoreError::LandmarkNotFound(_)) => {
                    debug!(landmark = %id, "landmark removed before bake");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn crawl(&mut self, triangle: TriangleId) -> Result<Vec<Proposal>, CalibError> {
        let tri = self
            .store
            .triangle(triangle)
            .ok_or(CalibError::TriangleNotFound(triangle))?;
        let estimator = Estimator::new(self.session, self.session_transform.as_ref());
        let proposals = propose_for_neighbors(
            &self.store,
            &tri,
            &estimator,
            CrawlExclusions {
                measured: &self.positions,
                adjusted: &self.adjusted,
                proposed: &self.proposals,
            },
        )?;
        for p in &proposals {
            self.proposals.insert(p.landmark, *p);
            self.observer.propose_position(p);
        }
        Ok(proposals)
    }

    fn propose_third_vertex(&mut self, active: &ActiveTarget) -> Result<Option<Proposal>, CalibError> {
        let Some(third) = active
            .order
            .into_iter()
            .find(|v| !self.positions.contains_key(v))
        else {
            return Ok(None);
        };
        let target = self
            .store
            .landmark(third)
            .ok_or(CalibError::LandmarkNotFound(third))?;

        let mut anchors = Vec::with_capacity(2);
        let mut plan = [Point2::default(); 2];
        let mut session = [Vec3::default(); 2];
        let placed = active.order.into_iter().filter(|v| self.positions.contains_key(v));
        for (i, id) in placed.take(2).enumerate() {
            let landmark = self.store.landmark(id).ok_or(CalibError::LandmarkNotFound(id))?;
            let current = self
                .positions
                .get(&id)
                .copied()
                .ok_or(CalibError::InsufficientCorrespondences { needed: 2, found: i })?;
            plan[i] = landmark.map_position();
            session[i] = current;
            anchors.push(Anchor { landmark, current });
        }

        let estimator = Estimator::new(self.session, self.session_transform.as_ref());
        let proposal = estimator.estimate(
            &target,
            &anchors,
            Fallback::Planar { plan, session },
            THIRD_VERTEX_VERIFICATION_THRESHOLD_M,
        );
        if let Some(p) = proposal {
            info!(landmark = %third, source = ?p.source, "proposal computed");
            self.proposals.insert(third, p);
            self.observer.propose_position(&p);
        }
        Ok(proposal)
    }

    fn refresh_session_transform(&mut self) {
        if self.session_transform.is_some() {
            return;
        }
        let Some(frame) = self.frame else {
            return;
        };
        let correspondences: Vec<Correspondence> = self
            .positions
            .iter()
            .filter_map(|(id, p)| {
                self.store
                    .landmark(*id)
                    .map(|lm| Correspondence::new(*p, lm.map_position()))
            })
            .collect();
        if correspondences.len() < 2 {
            return;
        }
        match frame.fit_session_transform(&correspondences, ScaleMode::Estimate) {
            Ok(t) => {
                info!(rotation_y = t.rotation_y, scale = t.scale, "session transform cached");
                self.session_transform = Some(t);
            }
            Err(e) => debug!(error = %e, "session transform unavailable"),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::RecordingObserver;
    use crate::tracking::ScriptedTracker;
    use meshcal_memory::InMemoryStore;
    use meshcal_spatial::barycentric::MAX_FILL_STEPS;
    use meshcal_types::{BakedPosition, CalibrationEvent, Landmark, LegMeasurement, Triangle};

    type Engine = CalibrationEngine<InMemoryStore, ScriptedTracker, RecordingObserver>;

    /// Four landmarks on a 3 m square split into two triangles sharing the
    /// b–c edge, plus the rigid motion placing the canonical frame in the
    /// first tracking session.
    struct World {
        frame: CanonicalFrame,
        plan: [Point2; 4],
        ids: [LandmarkId; 4],
        tris: [TriangleId; 2],
        motion: RigidTransform,
    }

    impl World {
        fn truth(&self, i: usize) -> Vec3 {
            self.motion.apply(self.frame.map_to_canonical(self.plan[i]))
        }
    }

    fn world() -> (World, InMemoryStore) {
        let frame = CanonicalFrame::from_map_size(1000.0, 1000.0, 100.0, -1.1).unwrap();
        let plan = [
            Point2::new(400.0, 400.0),
            Point2::new(700.0, 400.0),
            Point2::new(400.0, 700.0),
            Point2::new(700.0, 700.0),
        ];
        let mut store = InMemoryStore::new();
        let ids = plan.map(|p| store.add_landmark(p));
        let t1 = store.create_triangle([ids[0], ids[1], ids[2]]).unwrap();
        let t2 = store.create_triangle([ids[1], ids[2], ids[3]]).unwrap();
        let w = World {
            frame,
            plan,
            ids,
            tris: [t1, t2],
            motion: RigidTransform::new(0.3, Vec3::new(1.0, 0.0, -2.0)),
        };
        (w, store)
    }

    fn engine(store: InMemoryStore) -> (Engine, ScriptedTracker) {
        let tracker = ScriptedTracker::new();
        let engine = CalibrationEngine::new(store, tracker.clone(), RecordingObserver::new());
        (engine, tracker)
    }

    /// Start the first triangle and place its first two vertices.
    fn place_two(w: &World, e: &mut Engine) -> RegistrationOutcome {
        e.start_calibration(w.tris[0]).unwrap();
        e.register_marker(w.ids[0], w.truth(0), SourceKind::InitialPlacement).unwrap();
        e.register_marker(w.ids[1], w.truth(1), SourceKind::InitialPlacement).unwrap()
    }

    // ── lifecycle ───────────────────────────────────────────────────────────

    #[test]
    fn start_vertex_rotates_between_runs() {
        let (w, store) = world();
        let (mut e, _) = engine(store);

        assert_eq!(e.start_calibration(w.tris[0]).unwrap(), w.ids[0]);
        assert_eq!(e.state(), CalibrationState::PlacingVertices(0));
        e.reset();
        assert_eq!(e.start_calibration(w.tris[0]).unwrap(), w.ids[1]);
        assert_eq!(e.expected_vertex(), Some(w.ids[1]));
        assert_eq!(e.store().triangle(w.tris[0]).unwrap().last_start_vertex, Some(1));
    }

    #[test]
    fn unknown_triangle_does_not_start() {
        let (_, store) = world();
        let (mut e, _) = engine(store);
        let missing = TriangleId::new();
        assert_eq!(e.start_calibration(missing).unwrap_err(), CalibError::TriangleNotFound(missing));
        assert_eq!(e.state(), CalibrationState::Idle);
    }

    #[test]
    fn reset_discards_session_state() {
        let (w, store) = world();
        let (mut e, _) = engine(store);
        place_two(&w, &mut e);
        assert!(!e.proposals().is_empty());

        e.reset();
        assert_eq!(e.state(), CalibrationState::Idle);
        assert!(e.proposals().is_empty());
        assert!(e.session_position(w.ids[0]).is_none());
        assert_eq!(
            e.register_marker(w.ids[2], w.truth(2), SourceKind::InitialPlacement).unwrap_err(),
            CalibError::NoActiveCalibration
        );
        // History survives.
        assert_eq!(e.store().landmark(w.ids[0]).unwrap().history.len(), 1);
    }

    #[test]
    fn survey_mode_transitions() {
        let (w, store) = world();
        let (mut e, _) = engine(store);
        assert!(matches!(e.enter_survey_mode(), Err(CalibError::InvalidTransition { .. })));

        place_two(&w, &mut e);
        e.register_marker(w.ids[2], w.truth(2), SourceKind::ProposalConfirmed).unwrap();
        e.enter_survey_mode().unwrap();
        assert_eq!(e.state(), CalibrationState::SurveyMode);

        let points = e.survey_points(0.5).unwrap();
        assert!(!points.is_empty());
        for p in &points {
            let expected = w.motion.apply(w.frame.map_to_canonical(p.map));
            assert!(p.position.distance(expected) < 1e-3);
        }

        let fine = e.survey_points(1e-30).unwrap();
        assert_eq!(fine.len(), (MAX_FILL_STEPS + 1) * (MAX_FILL_STEPS + 2) / 2);

        e.exit_survey_mode().unwrap();
        assert!(matches!(e.exit_survey_mode(), Err(CalibError::InvalidTransition { .. })));
        assert!(matches!(e.survey_points(0.5), Err(CalibError::InvalidTransition { .. })));
    }

    // ── registration ────────────────────────────────────────────────────────

    #[test]
    fn registration_rejections() {
        let (w, store) = world();
        let (mut e, _) = engine(store);
        assert_eq!(
            e.register_marker(w.ids[0], w.truth(0), SourceKind::InitialPlacement).unwrap_err(),
            CalibError::NoActiveCalibration
        );

        e.start_calibration(w.tris[0]).unwrap();
        e.register_marker(w.ids[0], w.truth(0), SourceKind::InitialPlacement).unwrap();
        assert_eq!(
            e.register_marker(w.ids[0], w.truth(0), SourceKind::InitialPlacement).unwrap_err(),
            CalibError::DuplicatePlacement(w.ids[0])
        );
        assert_eq!(
            e.register_marker(w.ids[3], w.truth(3), SourceKind::InitialPlacement).unwrap_err(),
            CalibError::VertexNotInTriangle { landmark: w.ids[3] }
        );
        assert_eq!(e.state(), CalibrationState::PlacingVertices(1));
        assert_eq!(e.store().landmark(w.ids[0]).unwrap().history.len(), 1);
    }

    #[test]
    fn full_triangle_completes_and_crawls() {
        let (w, store) = world();
        let (mut e, _) = engine(store);

        let second = place_two(&w, &mut e);
        let RegistrationOutcome::Recorded { proposal: Some(p), state, .. } = second else {
            panic!("expected a third-vertex proposal, got {second:?}");
        };
        assert_eq!(state, CalibrationState::PlacingVertices(2));
        assert_eq!(p.landmark, w.ids[2]);
        assert_eq!(p.source, ProposalSource::PlanarEstimate);
        assert!(p.position.distance(w.truth(2)) < 1e-3, "{}", p.position);

        let done = e
            .register_marker(w.ids[2], w.truth(2), SourceKind::ProposalConfirmed)
            .unwrap();
        let RegistrationOutcome::Completed { completions } = done else {
            panic!("expected completion, got {done:?}");
        };
        assert_eq!(completions.len(), 1);
        let c = &completions[0];
        assert_eq!(c.triangle, Some(w.tris[0]));
        assert!((c.quality - 1.0).abs() < 1e-4);
        assert_eq!(c.band, QualityBand::Good);
        assert_eq!(e.state(), CalibrationState::ReadyToFill);

        // Crawl proposes the far vertex of the b–c neighbour.
        assert_eq!(c.proposals.len(), 1);
        assert_eq!(c.proposals[0].landmark, w.ids[3]);
        assert_eq!(c.proposals[0].source, ProposalSource::Barycentric);
        assert!(c.proposals[0].position.distance(w.truth(3)) < 1e-3);

        let tri = e.store().triangle(w.tris[0]).unwrap();
        assert!(tri.is_calibrated);
        assert_eq!(tri.legs.len(), 3);
        assert!(tri.marker_slots.iter().all(Option::is_some));
        // Shared vertices carry the same marker in the neighbour.
        let neighbour = e.store().triangle(w.tris[1]).unwrap();
        assert_eq!(neighbour.marker_for(w.ids[1]), tri.marker_for(w.ids[1]));

        assert!(e.observer().events.iter().any(|ev| matches!(
            ev,
            CalibrationEvent::TriangleCalibrated { triangle, .. } if *triangle == w.tris[0]
        )));
    }

    #[test]
    fn crawl_is_idempotent_after_completion() {
        let (w, store) = world();
        let (mut e, _) = engine(store);
        place_two(&w, &mut e);
        e.register_marker(w.ids[2], w.truth(2), SourceKind::ProposalConfirmed).unwrap();

        assert!(e.propose_for_neighbors(w.tris[0]).unwrap().is_empty());
    }

    #[test]
    fn free_placement_completes_neighbour() {
        let (w, store) = world();
        let (mut e, _) = engine(store);
        place_two(&w, &mut e);
        e.register_marker(w.ids[2], w.truth(2), SourceKind::ProposalConfirmed).unwrap();

        let done = e
            .register_marker(w.ids[3], w.truth(3), SourceKind::ProposalConfirmed)
            .unwrap();
        let RegistrationOutcome::Completed { completions } = done else {
            panic!("expected completion, got {done:?}");
        };
        assert_eq!(completions[0].triangle, Some(w.tris[1]));
        assert!(e.store().triangle(w.tris[1]).unwrap().is_calibrated);
        assert_eq!(e.state(), CalibrationState::ReadyToFill);
    }

    // ── blocked placements ──────────────────────────────────────────────────

    #[test]
    fn far_placement_is_blocked_until_override() {
        let (w, store) = world();
        let (mut e, _) = engine(store);
        place_two(&w, &mut e);
        let wrong = w.truth(2) + Vec3::new(0.8, 0.0, 0.0);

        let out = e.register_marker(w.ids[2], wrong, SourceKind::ProposalAdjusted).unwrap();
        let RegistrationOutcome::Blocked { blocked } = out else {
            panic!("expected block, got {out:?}");
        };
        assert!((blocked.distance_m - 0.8).abs() < 1e-3);
        assert_eq!(e.state(), CalibrationState::PlacingVertices(2));
        assert!(e.store().landmark(w.ids[2]).unwrap().history.is_empty());
        assert_eq!(
            e.register_marker(w.ids[2], w.truth(2), SourceKind::ProposalConfirmed).unwrap_err(),
            CalibError::PlacementPending(w.ids[2])
        );

        // Cancel keeps the proposal; placing badly again blocks again.
        e.cancel_blocked().unwrap();
        assert!(e.proposal(w.ids[2]).is_some());
        e.register_marker(w.ids[2], wrong, SourceKind::ProposalAdjusted).unwrap();

        let out = e.override_blocked().unwrap();
        assert!(matches!(out, RegistrationOutcome::Completed { .. }));
        let lm = e.store().landmark(w.ids[2]).unwrap();
        let rec = lm.history.back().unwrap();
        assert_eq!(rec.confidence, OVERRIDE_CONFIDENCE);
        assert!(rec.distortion.is_some());
        assert!(matches!(e.override_blocked(), Err(CalibError::NothingPending(_))));
    }

    // ── drift ───────────────────────────────────────────────────────────────

    #[test]
    fn drifted_marker_must_be_reconfirmed() {
        let (w, store) = world();
        let (mut e, tracker) = engine(store);
        place_two(&w, &mut e);

        let live_a = w.truth(0) + Vec3::new(0.07, 0.0, 0.03);
        tracker.set(e.marker_for(w.ids[0]).unwrap(), live_a);
        tracker.set(e.marker_for(w.ids[1]).unwrap(), w.truth(1) + Vec3::new(0.05, 0.0, 0.03));

        let out = e
            .register_marker(w.ids[2], w.truth(2), SourceKind::ProposalConfirmed)
            .unwrap();
        assert_eq!(out, RegistrationOutcome::DriftCorrectionRequired { landmarks: vec![w.ids[0]] });
        assert!(!e.store().triangle(w.tris[0]).unwrap().is_calibrated);
        assert_eq!(e.proposal(w.ids[0]).map(|p| p.source), Some(ProposalSource::DriftCorrection));
        assert!(e
            .observer()
            .events
            .iter()
            .any(|ev| matches!(ev, CalibrationEvent::DriftCorrectionNeeded { landmarks, .. } if landmarks == &vec![w.ids[0]])));

        let done = e.confirm_drift(w.ids[0]).unwrap();
        assert!(matches!(done, RegistrationOutcome::Completed { .. }));
        assert!(e.store().triangle(w.tris[0]).unwrap().is_calibrated);

        // Replaced, not appended.
        let a = e.store().landmark(w.ids[0]).unwrap();
        assert_eq!(a.history.len(), 1);
        assert!(a.history[0].position.distance(live_a) < 1e-6);
        assert!(e.pending_drift().is_empty());
    }

    #[test]
    fn bound_marker_is_used_for_tracking() {
        let (w, store) = world();
        let (mut e, tracker) = engine(store);
        let marker = MarkerId::new();
        assert_eq!(e.bind_marker(w.ids[0], marker), Err(CalibError::NoActiveCalibration));

        e.start_calibration(w.tris[0]).unwrap();
        e.bind_marker(w.ids[0], marker).unwrap();
        e.register_marker(w.ids[0], w.truth(0), SourceKind::InitialPlacement).unwrap();
        assert_eq!(e.marker_for(w.ids[0]), Some(marker));
        assert_eq!(e.bind_marker(w.ids[0], MarkerId::new()), Err(CalibError::DuplicatePlacement(w.ids[0])));
        e.register_marker(w.ids[1], w.truth(1), SourceKind::InitialPlacement).unwrap();

        tracker.set(marker, w.truth(0) + Vec3::new(0.2, 0.0, 0.0));
        let out = e
            .register_marker(w.ids[2], w.truth(2), SourceKind::ProposalConfirmed)
            .unwrap();
        assert_eq!(out, RegistrationOutcome::DriftCorrectionRequired { landmarks: vec![w.ids[0]] });
        assert_eq!(e.store().triangle(w.tris[0]).unwrap().marker_for(w.ids[0]), Some(marker));
    }

    // ── cross-session estimation ────────────────────────────────────────────

    #[test]
    fn past_session_consensus_proposes_third_vertex() {
        let (w, store) = world();
        let (mut e, _) = engine(store);
        place_two(&w, &mut e);
        e.register_marker(w.ids[2], w.truth(2), SourceKind::ProposalConfirmed).unwrap();

        // New session, different origin. Start rotates to b, so a is third.
        let motion2 = RigidTransform::new(-1.2, Vec3::new(4.0, 0.1, 0.5));
        let truth2 = |i: usize| motion2.apply(w.frame.map_to_canonical(w.plan[i]));
        e.begin_session(SessionId::new());
        assert_eq!(e.start_calibration(w.tris[0]).unwrap(), w.ids[1]);
        e.register_marker(w.ids[1], truth2(1), SourceKind::InitialPlacement).unwrap();
        let out = e.register_marker(w.ids[2], truth2(2), SourceKind::InitialPlacement).unwrap();

        let RegistrationOutcome::Recorded { proposal: Some(p), .. } = out else {
            panic!("expected proposal, got {out:?}");
        };
        assert_eq!(p.landmark, w.ids[0]);
        assert_eq!(p.source, ProposalSource::SessionConsensus);
        assert!(p.position.distance(truth2(0)) < 1e-3, "{}", p.position);
    }

    #[test]
    fn baked_estimate_projects_into_new_session() {
        let (w, store) = world();
        let tracker = ScriptedTracker::new();
        let mut e = CalibrationEngine::new(store, tracker, RecordingObserver::new())
            .with_frame(Some(w.frame));

        place_two(&w, &mut e);
        assert!(e.session_transform().is_some());
        e.register_marker(w.ids[2], w.truth(2), SourceKind::ProposalConfirmed).unwrap();
        e.register_marker(w.ids[3], w.truth(3), SourceKind::ProposalConfirmed).unwrap();
        let d = e.store().landmark(w.ids[3]).unwrap();
        let baked = d.baked.unwrap();
        assert!(baked.position.distance(w.frame.map_to_canonical(w.plan[3])) < 1e-3);

        let motion2 = RigidTransform::new(2.0, Vec3::new(-3.0, 0.2, 1.0));
        let truth2 = |i: usize| motion2.apply(w.frame.map_to_canonical(w.plan[i]));
        e.begin_session(SessionId::new());
        let first = e.start_calibration(w.tris[1]).unwrap();
        assert_eq!(first, w.ids[1]);
        e.register_marker(w.ids[1], truth2(1), SourceKind::InitialPlacement).unwrap();
        let out = e.register_marker(w.ids[2], truth2(2), SourceKind::InitialPlacement).unwrap();

        let RegistrationOutcome::Recorded { proposal: Some(p), .. } = out else {
            panic!("expected proposal, got {out:?}");
        };
        assert_eq!(p.landmark, w.ids[3]);
        assert_eq!(p.source, ProposalSource::BakedProjection);
        assert!(p.position.distance(truth2(3)) < 1e-3, "{}", p.position);
    }

    /// Store where a background bake commits just before every
    /// revision-checked write, so that write always comes back stale.
    struct RacingStore {
        inner: InMemoryStore,
        background: BakedPosition,
    }

    impl FloorPlanStore for RacingStore {
        fn add_landmark(&mut self, map_position: Point2) -> LandmarkId {
            self.inner.add_landmark(map_position)
        }
        fn insert_landmark(&mut self, landmark: Landmark) {
            self.inner.insert_landmark(landmark)
        }
        fn landmark(&self, id: LandmarkId) -> Option<Landmark> {
            self.inner.landmark(id)
        }
        fn landmarks(&self) -> Vec<Landmark> {
            self.inner.landmarks()
        }
        fn remove_landmark(&mut self, id: LandmarkId) -> Result<Landmark, StoreError> {
            self.inner.remove_landmark(id)
        }
        fn append_record(&mut self, id: LandmarkId, record: PositionRecord) -> Result<(), StoreError> {
            self.inner.append_record(id, record)
        }
        fn replace_record(&mut self, id: LandmarkId, record: PositionRecord) -> Result<(), StoreError> {
            self.inner.replace_record(id, record)
        }
        fn set_baked(
            &mut self,
            id: LandmarkId,
            baked: BakedPosition,
            expected_revision: Option<u64>,
        ) -> Result<(), StoreError> {
            if expected_revision.is_some() {
                self.inner.set_baked(id, self.background, None)?;
            }
            self.inner.set_baked(id, baked, expected_revision)
        }
        fn create_triangle(&mut self, vertices: [LandmarkId; 3]) -> Result<TriangleId, StoreError> {
            self.inner.create_triangle(vertices)
        }
        fn triangle(&self, id: TriangleId) -> Option<Triangle> {
            self.inner.triangle(id)
        }
        fn triangles(&self) -> Vec<Triangle> {
            self.inner.triangles()
        }
        fn remove_triangle(&mut self, id: TriangleId) -> Result<Triangle, StoreError> {
            self.inner.remove_triangle(id)
        }
        fn triangles_containing(&self, landmark: LandmarkId) -> Vec<Triangle> {
            self.inner.triangles_containing(landmark)
        }
        fn find_adjacent(&self, id: TriangleId) -> Result<Vec<Triangle>, StoreError> {
            self.inner.find_adjacent(id)
        }
        fn set_calibrated(&mut self, id: TriangleId, quality: f32) -> Result<(), StoreError> {
            self.inner.set_calibrated(id, quality)
        }
        fn set_leg_measurements(&mut self, id: TriangleId, legs: Vec<LegMeasurement>) -> Result<(), StoreError> {
            self.inner.set_leg_measurements(id, legs)
        }
        fn set_start_vertex(&mut self, id: TriangleId, index: usize) -> Result<(), StoreError> {
            self.inner.set_start_vertex(id, index)
        }
        fn assign_marker(&mut self, landmark: LandmarkId, marker: MarkerId) -> usize {
            self.inner.assign_marker(landmark, marker)
        }
    }

    #[test]
    fn concurrent_bake_does_not_abort_completion() {
        let (w, store) = world();
        let background = BakedPosition {
            position: Vec3::new(9.0, 9.0, 9.0),
            confidence: 0.5,
            sample_count: 4,
        };
        let store = RacingStore { inner: store, background };
        let mut e = CalibrationEngine::new(store, ScriptedTracker::new(), RecordingObserver::new())
            .with_frame(Some(w.frame));

        e.start_calibration(w.tris[0]).unwrap();
        e.register_marker(w.ids[0], w.truth(0), SourceKind::InitialPlacement).unwrap();
        e.register_marker(w.ids[1], w.truth(1), SourceKind::InitialPlacement).unwrap();
        assert!(e.session_transform().is_some());

        let done = e
            .register_marker(w.ids[2], w.truth(2), SourceKind::ProposalConfirmed)
            .unwrap();
        let RegistrationOutcome::Completed { completions } = done else {
            panic!("expected completion, got {done:?}");
        };
        assert_eq!(completions[0].proposals.len(), 1);
        assert_eq!(completions[0].proposals[0].landmark, w.ids[3]);
        assert_eq!(e.state(), CalibrationState::ReadyToFill);
        assert!(e.store().triangle(w.tris[0]).unwrap().is_calibrated);

        // The concurrent estimates stand.
        for id in &w.ids[..3] {
            assert_eq!(e.store().landmark(*id).unwrap().baked, Some(background));
        }
    }

    #[test]
    fn anchor_set_resolves_stored_triangle() {
        let (w, store) = world();
        let (mut e, _) = engine(store);
        assert!(matches!(
            e.start_anchor_calibration([w.ids[0], w.ids[0], w.ids[1]]),
            Err(CalibError::InvalidTriangle(_))
        ));

        e.start_anchor_calibration([w.ids[2], w.ids[0], w.ids[1]]).unwrap();
        assert_eq!(
            e.target(),
            Some(CalibrationTarget::AnchorSet([w.ids[2], w.ids[0], w.ids[1]]))
        );
        for i in [2, 0, 1] {
            e.register_marker(w.ids[i], w.truth(i), SourceKind::InitialPlacement).unwrap();
        }
        assert!(e.store().triangle(w.tris[0]).unwrap().is_calibrated);
    }

    #[test]
    fn state_changes_are_reported() {
        let (w, store) = world();
        let (mut e, _) = engine(store);
        place_two(&w, &mut e);
        e.register_marker(w.ids[2], w.truth(2), SourceKind::ProposalConfirmed).unwrap();

        let transitions: Vec<(CalibrationState, CalibrationState)> = e
            .observer()
            .events
            .iter()
            .filter_map(|ev| match ev {
                CalibrationEvent::StateChanged { from, to, .. } => Some((*from, *to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                (CalibrationState::Idle, CalibrationState::PlacingVertices(0)),
                (CalibrationState::PlacingVertices(0), CalibrationState::PlacingVertices(1)),
                (CalibrationState::PlacingVertices(1), CalibrationState::PlacingVertices(2)),
                (CalibrationState::PlacingVertices(2), CalibrationState::ReadyToFill),
            ]
        );
    }
}
