//! Notifications toward the rendering/UI collaborator.
//!
//! The engine owns its observer and calls it synchronously. Nothing is read
//! back; the collaborator answers through the engine's registration and
//! confirmation calls.

use meshcal_types::{
    BlockedPlacement, CalibrationEvent, CalibrationState, LandmarkId, Proposal, TriangleId,
};

pub trait CalibrationObserver {
    /// A ghost position was computed for an unmeasured landmark.
    fn propose_position(&mut self, proposal: &Proposal);

    /// A placement landed too far from its proposal and awaits override or
    /// cancel.
    fn blocked_placement(&mut self, blocked: &BlockedPlacement);

    /// These earlier placements drifted and must be re-confirmed.
    fn drift_correction_needed(&mut self, landmarks: &[LandmarkId]);

    fn triangle_calibrated(&mut self, _triangle: TriangleId, _quality: f32) {}

    fn state_changed(&mut self, _from: CalibrationState, _to: CalibrationState) {}
}

/// Discards every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl CalibrationObserver for NullObserver {
    fn propose_position(&mut self, _proposal: &Proposal) {}
    fn blocked_placement(&mut self, _blocked: &BlockedPlacement) {}
    fn drift_correction_needed(&mut self, _landmarks: &[LandmarkId]) {}
}

/// Keeps every notification as a [`CalibrationEvent`], in order.
#[derive(Debug, Default, Clone)]
pub struct RecordingObserver {
    pub events: Vec<CalibrationEvent>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn proposals(&self) -> Vec<Proposal> {
        self.events
            .iter()
            .filter_map(|e| match e {
                CalibrationEvent::ProposalComputed { proposal, .. } => Some(*proposal),
                _ => None,
            })
            .collect()
    }

    pub fn drain(&mut self) -> Vec<CalibrationEvent> {
        std::mem::take(&mut self.events)
    }
}

impl CalibrationObserver for RecordingObserver {
    fn propose_position(&mut self, proposal: &Proposal) {
        self.events.push(CalibrationEvent::proposal(*proposal));
    }

    fn blocked_placement(&mut self, blocked: &BlockedPlacement) {
        self.events.push(CalibrationEvent::blocked(*blocked));
    }

    fn drift_correction_needed(&mut self, landmarks: &[LandmarkId]) {
        self.events.push(CalibrationEvent::drift(landmarks.to_vec()));
    }

    fn triangle_calibrated(&mut self, triangle: TriangleId, quality: f32) {
        self.events.push(CalibrationEvent::calibrated(triangle, quality));
    }

    fn state_changed(&mut self, from: CalibrationState, to: CalibrationState) {
        self.events.push(CalibrationEvent::state_changed(from, to));
    }
}
