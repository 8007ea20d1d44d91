//! Floor-plan and triangle store.
//!
//! [`FloorPlanStore`] is the seam between the calibration engine and
//! whatever keeps landmarks and triangles alive. Reads return owned copies;
//! every write goes through a named operation so that validation (triangle
//! geometry, membership, stale-revision checks) lives in one place.
//!
//! [`InMemoryStore`] is the reference implementation. [`SharedStore`] wraps
//! any store in an `Arc<Mutex<_>>` so the interactive engine and a
//! background bake job can take turns writing.
//!
//! # Example
//!
//! ```rust
//! use meshcal_memory::store::{FloorPlanStore, InMemoryStore};
//! use meshcal_types::Point2;
//!
//! let mut store = InMemoryStore::new();
//! let a = store.add_landmark(Point2::new(0.0, 0.0));
//! let b = store.add_landmark(Point2::new(100.0, 0.0));
//! let c = store.add_landmark(Point2::new(0.0, 100.0));
//! let t = store.create_triangle([a, b, c]).unwrap();
//!
//! assert_eq!(store.triangles_containing(a).len(), 1);
//! assert!(store.remove_landmark(a).is_err()); // still referenced by `t`
//! store.remove_triangle(t).unwrap();
//! assert!(store.remove_landmark(a).is_ok());
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use meshcal_spatial::planar::{is_collinear, triangles_overlap};
use meshcal_types::{
    BakedPosition, CalibError, Landmark, LandmarkId, LegMeasurement, MarkerId, Point2,
    PositionRecord, Triangle, TriangleId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::history;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised by store operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Landmark not found: {0}")]
    LandmarkNotFound(LandmarkId),
    #[error("Triangle not found: {0}")]
    TriangleNotFound(TriangleId),
    #[error("Invalid triangle: {0}")]
    InvalidTriangle(String),
    #[error("Landmark {landmark} is still used by {triangles} triangle(s)")]
    LandmarkInUse { landmark: LandmarkId, triangles: usize },
    #[error("Landmark {landmark} changed since revision {expected} (now {found})")]
    StaleRevision {
        landmark: LandmarkId,
        expected: u64,
        found: u64,
    },
}

impl From<StoreError> for CalibError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LandmarkNotFound(id) => CalibError::LandmarkNotFound(id),
            StoreError::TriangleNotFound(id) => CalibError::TriangleNotFound(id),
            StoreError::InvalidTriangle(msg) => CalibError::InvalidTriangle(msg),
            other => CalibError::Store(other.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FloorPlanStore
// ─────────────────────────────────────────────────────────────────────────────

/// CRUD and calibration bookkeeping for landmarks and triangles.
pub trait FloorPlanStore {
    // ── landmarks ──

    fn add_landmark(&mut self, map_position: Point2) -> LandmarkId;

    /// Insert a fully formed landmark, replacing any with the same id.
    fn insert_landmark(&mut self, landmark: Landmark);

    fn landmark(&self, id: LandmarkId) -> Option<Landmark>;

    fn landmarks(&self) -> Vec<Landmark>;

    /// Fails with [`StoreError::LandmarkInUse`] while any triangle uses it.
    fn remove_landmark(&mut self, id: LandmarkId) -> Result<Landmark, StoreError>;

    /// Append to the landmark's bounded history.
    fn append_record(&mut self, id: LandmarkId, record: PositionRecord) -> Result<(), StoreError>;

    /// Replace the latest record of `record.session` (drift correction).
    fn replace_record(&mut self, id: LandmarkId, record: PositionRecord) -> Result<(), StoreError>;

    /// Overwrite the baked estimate. With `expected_revision` set, the write
    /// is refused when the landmark has changed since that revision.
    fn set_baked(
        &mut self,
        id: LandmarkId,
        baked: BakedPosition,
        expected_revision: Option<u64>,
    ) -> Result<(), StoreError>;

    // ── triangles ──

    /// Validate and create a triangle over three existing landmarks.
    fn create_triangle(&mut self, vertices: [LandmarkId; 3]) -> Result<TriangleId, StoreError>;

    fn triangle(&self, id: TriangleId) -> Option<Triangle>;

    fn triangles(&self) -> Vec<Triangle>;

    fn remove_triangle(&mut self, id: TriangleId) -> Result<Triangle, StoreError>;

    fn triangles_containing(&self, landmark: LandmarkId) -> Vec<Triangle>;

    /// Triangles sharing exactly two vertices with `id`.
    fn find_adjacent(&self, id: TriangleId) -> Result<Vec<Triangle>, StoreError>;

    fn set_calibrated(&mut self, id: TriangleId, quality: f32) -> Result<(), StoreError>;

    fn set_leg_measurements(&mut self, id: TriangleId, legs: Vec<LegMeasurement>) -> Result<(), StoreError>;

    fn set_start_vertex(&mut self, id: TriangleId, index: usize) -> Result<(), StoreError>;

    /// Record `marker` for `landmark` in every triangle that contains it.
    /// Returns the number of triangles updated.
    fn assign_marker(&mut self, landmark: LandmarkId, marker: MarkerId) -> usize;
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Serializable image of a store's contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FloorPlanSnapshot {
    pub landmarks: Vec<Landmark>,
    pub triangles: Vec<Triangle>,
}

// ─────────────────────────────────────────────────────────────────────────────
// InMemoryStore
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct InMemoryStore {
    landmarks: HashMap<LandmarkId, Landmark>,
    /// Creation order.
    triangles: Vec<Triangle>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a snapshot. Triangles are inserted as-is, without
    /// geometric re-validation; memberships are recomputed.
    pub fn from_snapshot(snapshot: FloorPlanSnapshot) -> Self {
        let mut store = Self::new();
        for mut lm in snapshot.landmarks {
            lm.triangle_memberships.clear();
            store.landmarks.insert(lm.id, lm);
        }
        for tri in snapshot.triangles {
            for v in tri.vertices() {
                if let Some(lm) = store.landmarks.get_mut(&v) {
                    lm.triangle_memberships.push(tri.id);
                }
            }
            store.triangles.push(tri);
        }
        store
    }

    pub fn snapshot(&self) -> FloorPlanSnapshot {
        FloorPlanSnapshot {
            landmarks: self.landmarks(),
            triangles: self.triangles.clone(),
        }
    }

    fn landmark_mut(&mut self, id: LandmarkId) -> Result<&mut Landmark, StoreError> {
        self.landmarks.get_mut(&id).ok_or(StoreError::LandmarkNotFound(id))
    }

    fn triangle_mut(&mut self, id: TriangleId) -> Result<&mut Triangle, StoreError> {
        self.triangles
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(StoreError::TriangleNotFound(id))
    }

    fn plan_positions(&self, vertices: [LandmarkId; 3]) -> Result<[Point2; 3], StoreError> {
        let mut out = [Point2::default(); 3];
        for (slot, id) in out.iter_mut().zip(vertices) {
            *slot = self
                .landmarks
                .get(&id)
                .ok_or(StoreError::LandmarkNotFound(id))?
                .map_position();
        }
        Ok(out)
    }

    fn validate_triangle(&self, vertices: [LandmarkId; 3]) -> Result<(), StoreError> {
        let [a, b, c] = vertices;
        if a == b || b == c || a == c {
            return Err(StoreError::InvalidTriangle("vertices must be distinct".into()));
        }

        let positions = self.plan_positions(vertices)?;
        if is_collinear(positions[0], positions[1], positions[2]) {
            return Err(StoreError::InvalidTriangle("vertices are collinear".into()));
        }

        let candidate = Triangle::new(vertices);
        for existing in &self.triangles {
            let shared = existing.shared_vertices(&candidate);
            match shared.len() {
                3 => {
                    return Err(StoreError::InvalidTriangle(format!(
                        "duplicates triangle {}",
                        existing.id
                    )));
                }
                2 => continue,
                _ => {}
            }
            let existing_pos = self.plan_positions(existing.vertices())?;
            let shared_pos: Vec<Point2> = shared
                .iter()
                .filter_map(|id| self.landmarks.get(id).map(|lm| lm.map_position()))
                .collect();
            if triangles_overlap(positions, existing_pos, &shared_pos) {
                return Err(StoreError::InvalidTriangle(format!(
                    "interior overlaps triangle {}",
                    existing.id
                )));
            }
        }
        Ok(())
    }
}

impl FloorPlanStore for InMemoryStore {
    fn add_landmark(&mut self, map_position: Point2) -> LandmarkId {
        let lm = Landmark::new(map_position);
        let id = lm.id;
        self.landmarks.insert(id, lm);
        id
    }

    fn insert_landmark(&mut self, landmark: Landmark) {
        self.landmarks.insert(landmark.id, landmark);
    }

    fn landmark(&self, id: LandmarkId) -> Option<Landmark> {
        self.landmarks.get(&id).cloned()
    }

    fn landmarks(&self) -> Vec<Landmark> {
        let mut out: Vec<Landmark> = self.landmarks.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    fn remove_landmark(&mut self, id: LandmarkId) -> Result<Landmark, StoreError> {
        let in_use = self.triangles.iter().filter(|t| t.contains(id)).count();
        if in_use > 0 {
            return Err(StoreError::LandmarkInUse {
                landmark: id,
                triangles: in_use,
            });
        }
        self.landmarks.remove(&id).ok_or(StoreError::LandmarkNotFound(id))
    }

    fn append_record(&mut self, id: LandmarkId, record: PositionRecord) -> Result<(), StoreError> {
        let lm = self.landmark_mut(id)?;
        history::add_record(lm, record);
        Ok(())
    }

    fn replace_record(&mut self, id: LandmarkId, record: PositionRecord) -> Result<(), StoreError> {
        let lm = self.landmark_mut(id)?;
        history::replace_session_record(lm, record);
        Ok(())
    }

    fn set_baked(
        &mut self,
        id: LandmarkId,
        baked: BakedPosition,
        expected_revision: Option<u64>,
    ) -> Result<(), StoreError> {
        let lm = self.landmark_mut(id)?;
        if let Some(expected) = expected_revision {
            if lm.revision != expected {
                return Err(StoreError::StaleRevision {
                    landmark: id,
                    expected,
                    found: lm.revision,
                });
            }
        }
        lm.baked = Some(baked);
        lm.revision += 1;
        Ok(())
    }

    fn create_triangle(&mut self, vertices: [LandmarkId; 3]) -> Result<TriangleId, StoreError> {
        self.validate_triangle(vertices)?;

        let tri = Triangle::new(vertices);
        let id = tri.id;
        for v in vertices {
            self.landmark_mut(v)?.triangle_memberships.push(id);
        }
        self.triangles.push(tri);
        info!(triangle = %id, "triangle created");
        Ok(id)
    }

    fn triangle(&self, id: TriangleId) -> Option<Triangle> {
        self.triangles.iter().find(|t| t.id == id).cloned()
    }

    fn triangles(&self) -> Vec<Triangle> {
        self.triangles.clone()
    }

    fn remove_triangle(&mut self, id: TriangleId) -> Result<Triangle, StoreError> {
        let idx = self
            .triangles
            .iter()
            .position(|t| t.id == id)
            .ok_or(StoreError::TriangleNotFound(id))?;
        let tri = self.triangles.remove(idx);
        for v in tri.vertices() {
            if let Some(lm) = self.landmarks.get_mut(&v) {
                lm.triangle_memberships.retain(|t| *t != id);
            }
        }
        debug!(triangle = %id, "triangle removed");
        Ok(tri)
    }

    fn triangles_containing(&self, landmark: LandmarkId) -> Vec<Triangle> {
        self.triangles
            .iter()
            .filter(|t| t.contains(landmark))
            .cloned()
            .collect()
    }

    fn find_adjacent(&self, id: TriangleId) -> Result<Vec<Triangle>, StoreError> {
        let tri = self
            .triangles
            .iter()
            .find(|t| t.id == id)
            .ok_or(StoreError::TriangleNotFound(id))?;
        Ok(self
            .triangles
            .iter()
            .filter(|t| tri.is_adjacent(t))
            .cloned()
            .collect())
    }

    fn set_calibrated(&mut self, id: TriangleId, quality: f32) -> Result<(), StoreError> {
        let tri = self.triangle_mut(id)?;
        tri.is_calibrated = true;
        tri.quality = quality.clamp(0.0, 1.0);
        tri.last_calibrated_at = Some(chrono::Utc::now());
        Ok(())
    }

    fn set_leg_measurements(&mut self, id: TriangleId, legs: Vec<LegMeasurement>) -> Result<(), StoreError> {
        self.triangle_mut(id)?.legs = legs;
        Ok(())
    }

    fn set_start_vertex(&mut self, id: TriangleId, index: usize) -> Result<(), StoreError> {
        self.triangle_mut(id)?.last_start_vertex = Some(index % 3);
        Ok(())
    }

    fn assign_marker(&mut self, landmark: LandmarkId, marker: MarkerId) -> usize {
        self.triangles
            .iter_mut()
            .map(|t| t.set_marker(landmark, marker))
            .filter(|updated| *updated)
            .count()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SharedStore
// ─────────────────────────────────────────────────────────────────────────────

/// A store shared between the interactive engine and background jobs.
///
/// Each trait call holds the lock for its own duration only, so a commit
/// of one landmark never interleaves with a registration of the same one.
#[derive(Debug, Default)]
pub struct SharedStore<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for SharedStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: FloorPlanStore> SharedStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Exclusive access for multi-step operations.
    pub fn lock(&self) -> MutexGuard<'_, S> {
        // A panicked writer leaves whole records behind; keep serving them.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<S: FloorPlanStore> FloorPlanStore for SharedStore<S> {
    fn add_landmark(&mut self, map_position: Point2) -> LandmarkId {
        self.lock().add_landmark(map_position)
    }

    fn insert_landmark(&mut self, landmark: Landmark) {
        self.lock().insert_landmark(landmark)
    }

    fn landmark(&self, id: LandmarkId) -> Option<Landmark> {
        self.lock().landmark(id)
    }

    fn landmarks(&self) -> Vec<Landmark> {
        self.lock().landmarks()
    }

    fn remove_landmark(&mut self, id: LandmarkId) -> Result<Landmark, StoreError> {
        self.lock().remove_landmark(id)
    }

    fn append_record(&mut self, id: LandmarkId, record: PositionRecord) -> Result<(), StoreError> {
        self.lock().append_record(id, record)
    }

    fn replace_record(&mut self, id: LandmarkId, record: PositionRecord) -> Result<(), StoreError> {
        self.lock().replace_record(id, record)
    }

    fn set_baked(
        &mut self,
        id: LandmarkId,
        baked: BakedPosition,
        expected_revision: Option<u64>,
    ) -> Result<(), StoreError> {
        self.lock().set_baked(id, baked, expected_revision)
    }

    fn create_triangle(&mut self, vertices: [LandmarkId; 3]) -> Result<TriangleId, StoreError> {
        self.lock().create_triangle(vertices)
    }

    fn triangle(&self, id: TriangleId) -> Option<Triangle> {
        self.lock().triangle(id)
    }

    fn triangles(&self) -> Vec<Triangle> {
        self.lock().triangles()
    }

    fn remove_triangle(&mut self, id: TriangleId) -> Result<Triangle, StoreError> {
        self.lock().remove_triangle(id)
    }

    fn triangles_containing(&self, landmark: LandmarkId) -> Vec<Triangle> {
        self.lock().triangles_containing(landmark)
    }

    fn find_adjacent(&self, id: TriangleId) -> Result<Vec<Triangle>, StoreError> {
        self.lock().find_adjacent(id)
    }

    fn set_calibrated(&mut self, id: TriangleId, quality: f32) -> Result<(), StoreError> {
        self.lock().set_calibrated(id, quality)
    }

    fn set_leg_measurements(&mut self, id: TriangleId, legs: Vec<LegMeasurement>) -> Result<(), StoreError> {
        self.lock().set_leg_measurements(id, legs)
    }

    fn set_start_vertex(&mut self, id: TriangleId, index: usize) -> Result<(), StoreError> {
        self.lock().set_start_vertex(id, index)
    }

    fn assign_marker(&mut self, landmark: LandmarkId, marker: MarkerId) -> usize {
        self.lock().assign_marker(landmark, marker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcal_types::{SessionId, SourceKind, Vec3};

    fn square() -> (InMemoryStore, [LandmarkId; 4]) {
        let mut s = InMemoryStore::new();
        let ids = [
            s.add_landmark(Point2::new(0.0, 0.0)),
            s.add_landmark(Point2::new(100.0, 0.0)),
            s.add_landmark(Point2::new(0.0, 100.0)),
            s.add_landmark(Point2::new(100.0, 100.0)),
        ];
        (s, ids)
    }

    // ── triangle validation ─────────────────────────────────────────────────

    #[test]
    fn edge_sharing_triangles_accepted() {
        let (mut s, [a, b, c, d]) = square();
        let t1 = s.create_triangle([a, b, c]).unwrap();
        let t2 = s.create_triangle([b, c, d]).unwrap();

        let adj = s.find_adjacent(t1).unwrap();
        assert_eq!(adj.len(), 1);
        assert_eq!(adj[0].id, t2);
        assert_eq!(s.landmark(b).unwrap().triangle_memberships, vec![t1, t2]);
    }

    #[test]
    fn duplicate_triangle_rejected() {
        let (mut s, [a, b, c, _]) = square();
        s.create_triangle([a, b, c]).unwrap();
        let err = s.create_triangle([c, a, b]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTriangle(msg) if msg.contains("duplicates")));
    }

    #[test]
    fn overlapping_triangle_rejected() {
        let (mut s, [a, b, c, d]) = square();
        s.create_triangle([a, b, c]).unwrap();
        // Shares only `b`, and `e` sits inside a-b-c.
        let e = s.add_landmark(Point2::new(20.0, 20.0));
        let err = s.create_triangle([e, d, b]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTriangle(msg) if msg.contains("overlaps")));
        assert_eq!(s.triangles_containing(c).len(), 1);
    }

    #[test]
    fn collinear_and_repeated_vertices_rejected() {
        let (mut s, [a, b, ..]) = square();
        let m = s.add_landmark(Point2::new(50.0, 0.0));
        assert!(s.create_triangle([a, m, b]).is_err());
        assert!(s.create_triangle([a, a, b]).is_err());
        assert!(matches!(
            s.create_triangle([a, b, LandmarkId::new()]),
            Err(StoreError::LandmarkNotFound(_))
        ));
    }

    #[test]
    fn landmark_in_use_cannot_be_removed() {
        let (mut s, [a, b, c, _]) = square();
        let t = s.create_triangle([a, b, c]).unwrap();
        assert_eq!(
            s.remove_landmark(a).unwrap_err(),
            StoreError::LandmarkInUse { landmark: a, triangles: 1 }
        );
        s.remove_triangle(t).unwrap();
        assert!(s.landmark(b).unwrap().triangle_memberships.is_empty());
        assert!(s.remove_landmark(a).is_ok());
    }

    // ── calibration bookkeeping ─────────────────────────────────────────────

    #[test]
    fn marker_assigned_across_shared_edge() {
        let (mut s, [a, b, c, d]) = square();
        let t1 = s.create_triangle([a, b, c]).unwrap();
        let t2 = s.create_triangle([b, c, d]).unwrap();
        let m = MarkerId::new();

        assert_eq!(s.assign_marker(b, m), 2);
        assert_eq!(s.triangle(t1).unwrap().marker_for(b), Some(m));
        assert_eq!(s.triangle(t2).unwrap().marker_for(b), Some(m));
    }

    #[test]
    fn stale_bake_refused() {
        let (mut s, [a, ..]) = square();
        let baked = BakedPosition {
            position: Vec3::zero(),
            confidence: 1.0,
            sample_count: 1,
        };
        s.append_record(
            a,
            PositionRecord::new(Vec3::zero(), SessionId::new(), SourceKind::InitialPlacement, 0.95),
        )
        .unwrap();

        let err = s.set_baked(a, baked, Some(0)).unwrap_err();
        assert_eq!(err, StoreError::StaleRevision { landmark: a, expected: 0, found: 1 });
        s.set_baked(a, baked, Some(1)).unwrap();
        assert_eq!(s.landmark(a).unwrap().revision, 2);
    }

    #[test]
    fn set_calibrated_clamps_quality() {
        let (mut s, [a, b, c, _]) = square();
        let t = s.create_triangle([a, b, c]).unwrap();
        s.set_calibrated(t, 1.7).unwrap();
        let tri = s.triangle(t).unwrap();
        assert!(tri.is_calibrated);
        assert_eq!(tri.quality, 1.0);
        assert!(tri.last_calibrated_at.is_some());
    }

    // ── snapshot / sharing ──────────────────────────────────────────────────

    #[test]
    fn snapshot_round_trip_restores_memberships() {
        let (mut s, [a, b, c, _]) = square();
        let t = s.create_triangle([a, b, c]).unwrap();

        let json = serde_json::to_string(&s.snapshot()).unwrap();
        let restored = InMemoryStore::from_snapshot(serde_json::from_str(&json).unwrap());

        assert_eq!(restored.triangles().len(), 1);
        assert_eq!(restored.landmark(a).unwrap().triangle_memberships, vec![t]);
        assert_eq!(restored.landmarks().len(), 4);
    }

    #[test]
    fn shared_store_clones_see_same_data() {
        let mut shared = SharedStore::new(InMemoryStore::new());
        let other = shared.clone();
        let id = shared.add_landmark(Point2::new(1.0, 2.0));
        assert!(other.landmark(id).is_some());
    }

    #[test]
    fn store_error_converts_to_calib_error() {
        let id = TriangleId::new();
        let err: CalibError = StoreError::TriangleNotFound(id).into();
        assert_eq!(err, CalibError::TriangleNotFound(id));
    }
}
