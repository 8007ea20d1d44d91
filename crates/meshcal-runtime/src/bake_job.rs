//! Retrospective bake-down as a cancellable background job.
//!
//! The job snapshots every landmark, plans the bake off-thread (see
//! [`plan_bake`]) and then commits the results under one store lock.
//! Landmarks written by the engine after the snapshot are left alone: their
//! revision no longer matches and the commit skips them.
//!
//! ```text
//!   snapshot ──▶ spawn_blocking(plan_bake) ──▶ lock ──▶ set_baked(rev) ×N
//!                     ▲ polls cancel flag          single writer
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use meshcal_memory::bake::{BakePlan, plan_bake};
use meshcal_memory::{FloorPlanStore, SharedStore, StoreError};
use meshcal_spatial::CanonicalFrame;
use meshcal_types::{LandmarkId, SessionId};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum BakeJobError {
    #[error("Bake cancelled")]
    Cancelled,

    #[error("Bake worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("Bake commit failed: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of a committed bake.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BakeReport {
    pub committed: Vec<LandmarkId>,
    /// Changed or removed since the snapshot; left untouched.
    pub stale: Vec<LandmarkId>,
    pub sessions_used: Vec<SessionId>,
    pub sessions_skipped: Vec<SessionId>,
}

/// A retrospective bake over a shared store.
pub struct BakeJob<S> {
    store: SharedStore<S>,
    frame: CanonicalFrame,
    cancel: Arc<AtomicBool>,
}

impl<S> BakeJob<S>
where
    S: FloorPlanStore + Send + 'static,
{
    pub fn new(store: SharedStore<S>, frame: CanonicalFrame) -> Self {
        Self {
            store,
            frame,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an existing cancellation flag, e.g. one raised by a signal
    /// handler.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run on the blocking pool. Must be called inside a Tokio runtime.
    pub fn spawn(self) -> BakeHandle {
        let cancel = Arc::clone(&self.cancel);
        let task = tokio::task::spawn_blocking(move || self.run());
        BakeHandle { cancel, task }
    }

    /// Plan and commit on the current thread.
    pub fn run(&self) -> Result<BakeReport, BakeJobError> {
        let snapshot = self.store.lock().landmarks();
        debug!(landmarks = snapshot.len(), "bake snapshot taken");

        let cancel = Arc::clone(&self.cancel);
        let plan = plan_bake(&snapshot, &self.frame, move || cancel.load(Ordering::SeqCst))
            .ok_or(BakeJobError::Cancelled)?;

        if self.cancel.load(Ordering::SeqCst) {
            info!("bake cancelled before commit");
            return Err(BakeJobError::Cancelled);
        }

        let mut guard = self.store.lock();
        commit(&mut *guard, &plan)
    }
}

/// Apply a plan, skipping landmarks whose revision moved since it was
/// computed.
pub fn commit<S: FloorPlanStore + ?Sized>(store: &mut S, plan: &BakePlan) -> Result<BakeReport, BakeJobError> {
    let mut report = BakeReport {
        sessions_used: plan.sessions_used.clone(),
        sessions_skipped: plan.sessions_skipped.iter().map(|s| s.session).collect(),
        ..BakeReport::default()
    };

    for result in &plan.results {
        match store.set_baked(result.landmark, result.baked, Some(result.base_revision)) {
            Ok(()) => report.committed.push(result.landmark),
            Err(StoreError::StaleRevision { landmark, expected, found }) => {
                debug!(landmark = %landmark, expected, found, "stale bake result skipped");
                report.stale.push(landmark);
            }
            Err(StoreError::LandmarkNotFound(landmark)) => {
                debug!(landmark = %landmark, "landmark removed since snapshot");
                report.stale.push(landmark);
            }
            Err(e) => return Err(e.into()),
        }
    }

    if !report.stale.is_empty() {
        warn!(stale = report.stale.len(), "some bake results were stale");
    }
    info!(
        committed = report.committed.len(),
        sessions_used = report.sessions_used.len(),
        "bake committed"
    );
    Ok(report)
}

/// Handle to a spawned [`BakeJob`].
pub struct BakeHandle {
    cancel: Arc<AtomicBool>,
    task: JoinHandle<Result<BakeReport, BakeJobError>>,
}

impl BakeHandle {
    /// Ask the job to stop. Planning stops at the next session boundary;
    /// a commit already in progress completes.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub async fn join(self) -> Result<BakeReport, BakeJobError> {
        self.task.await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcal_memory::InMemoryStore;
    use meshcal_spatial::RigidTransform;
    use meshcal_types::{Point2, PositionRecord, SourceKind, Vec3};

    fn frame() -> CanonicalFrame {
        CanonicalFrame::from_map_size(1000.0, 1000.0, 100.0, -1.1).unwrap()
    }

    /// Three landmarks measured in one session displaced by a rigid motion.
    fn surveyed_store() -> (SharedStore<InMemoryStore>, Vec<(LandmarkId, Point2)>) {
        let f = frame();
        let motion = RigidTransform::new(0.7, Vec3::new(2.0, 0.3, -1.0));
        let session = SessionId::new();
        let mut store = InMemoryStore::new();
        let mut placed = Vec::new();
        for plan in [Point2::new(400.0, 400.0), Point2::new(700.0, 400.0), Point2::new(400.0, 700.0)] {
            let id = store.add_landmark(plan);
            let pos = motion.apply(f.map_to_canonical(plan));
            store
                .append_record(id, PositionRecord::new(pos, session, SourceKind::InitialPlacement, 0.95))
                .unwrap();
            placed.push((id, plan));
        }
        (SharedStore::new(store), placed)
    }

    #[tokio::test]
    async fn bake_job_commits_canonical_estimates() -> Result<(), Box<dyn std::error::Error>> {
        let (store, placed) = surveyed_store();
        let report = BakeJob::new(store.clone(), frame()).spawn().join().await?;

        assert_eq!(report.committed.len(), 3);
        assert!(report.stale.is_empty());
        assert_eq!(report.sessions_used.len(), 1);

        let f = frame();
        for (id, plan) in placed {
            let baked = store.lock().landmark(id).and_then(|lm| lm.baked).ok_or("not baked")?;
            assert!(baked.position.distance(f.map_to_canonical(plan)) < 1e-3);
            assert_eq!(baked.sample_count, 1);
        }
        Ok(())
    }

    #[tokio::test]
    async fn raised_flag_cancels_before_commit() {
        let (store, placed) = surveyed_store();
        let flag = Arc::new(AtomicBool::new(true));
        let result = BakeJob::new(store.clone(), frame())
            .with_cancel_flag(flag)
            .spawn()
            .join()
            .await;

        assert!(matches!(result, Err(BakeJobError::Cancelled)));
        assert!(store.lock().landmark(placed[0].0).unwrap().baked.is_none());
    }

    #[test]
    fn landmarks_written_after_snapshot_are_skipped() {
        let (store, placed) = surveyed_store();
        let snapshot = store.lock().landmarks();
        let plan = plan_bake(&snapshot, &frame(), || false).unwrap();

        // The engine records a new placement while the plan was computed.
        let late = PositionRecord::new(Vec3::zero(), SessionId::new(), SourceKind::Relocalized, 0.9);
        store.lock().append_record(placed[1].0, late).unwrap();

        let report = commit(&mut *store.lock(), &plan).unwrap();
        assert_eq!(report.stale, vec![placed[1].0]);
        assert_eq!(report.committed.len(), 2);
        assert!(store.lock().landmark(placed[1].0).unwrap().baked.is_none());
    }
}
