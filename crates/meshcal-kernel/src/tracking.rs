//! The external motion-tracking provider.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use meshcal_types::{MarkerId, Vec3};

/// Supplies the live 3-D position of a physical marker in the current
/// tracking session.
pub trait TrackingProvider {
    /// `None` when the marker is not currently tracked.
    fn current_position(&self, marker: MarkerId) -> Option<Vec3>;
}

/// Tracker that never sees anything. Drift detection is skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTracking;

impl TrackingProvider for NoTracking {
    fn current_position(&self, _marker: MarkerId) -> Option<Vec3> {
        None
    }
}

/// Tracker backed by a position table that callers update by hand.
///
/// Clones share the same table, so a handle kept outside the engine can
/// move markers after the engine took ownership of its copy.
///
/// ```rust
/// use meshcal_kernel::tracking::{ScriptedTracker, TrackingProvider};
/// use meshcal_types::{MarkerId, Vec3};
///
/// let tracker = ScriptedTracker::new();
/// let handle = tracker.clone();
/// let marker = MarkerId::new();
///
/// handle.set(marker, Vec3::new(1.0, 0.0, 2.0));
/// assert_eq!(tracker.current_position(marker), Some(Vec3::new(1.0, 0.0, 2.0)));
/// ```
#[derive(Debug, Default, Clone)]
pub struct ScriptedTracker {
    positions: Arc<Mutex<HashMap<MarkerId, Vec3>>>,
}

impl ScriptedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, marker: MarkerId, position: Vec3) {
        self.table().insert(marker, position);
    }

    pub fn remove(&self, marker: MarkerId) {
        self.table().remove(&marker);
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<MarkerId, Vec3>> {
        self.positions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TrackingProvider for ScriptedTracker {
    fn current_position(&self, marker: MarkerId) -> Option<Vec3> {
        self.table().get(&marker).copied()
    }
}
