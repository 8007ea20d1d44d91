//! [`BusObserver`] – publishes engine notifications onto a
//! [`CalibrationBus`].

use meshcal_kernel::CalibrationObserver;
use meshcal_types::{BlockedPlacement, CalibrationEvent, CalibrationState, LandmarkId, Proposal, TriangleId};
use tracing::debug;

use crate::bus::{BusError, CalibrationBus};

/// Adapts the engine's synchronous observer calls to the async bus.
///
/// Publishing never blocks; with nobody subscribed the event is dropped.
#[derive(Clone, Debug)]
pub struct BusObserver {
    bus: CalibrationBus,
    published: u64,
}

impl BusObserver {
    pub fn new(bus: CalibrationBus) -> Self {
        Self { bus, published: 0 }
    }

    pub fn bus(&self) -> &CalibrationBus {
        &self.bus
    }

    /// Events handed to at least one subscriber.
    pub fn published(&self) -> u64 {
        self.published
    }

    fn emit(&mut self, event: CalibrationEvent) {
        match self.bus.publish(event) {
            Ok(_) => self.published += 1,
            Err(BusError::NoSubscribers(topic)) => debug!(?topic, "event dropped: no subscribers"),
            Err(e) => debug!(error = %e, "event dropped"),
        }
    }
}

impl CalibrationObserver for BusObserver {
    fn propose_position(&mut self, proposal: &Proposal) {
        self.emit(CalibrationEvent::proposal(*proposal));
    }

    fn blocked_placement(&mut self, blocked: &BlockedPlacement) {
        self.emit(CalibrationEvent::blocked(*blocked));
    }

    fn drift_correction_needed(&mut self, landmarks: &[LandmarkId]) {
        self.emit(CalibrationEvent::drift(landmarks.to_vec()));
    }

    fn triangle_calibrated(&mut self, triangle: TriangleId, quality: f32) {
        self.emit(CalibrationEvent::calibrated(triangle, quality));
    }

    fn state_changed(&mut self, from: CalibrationState, to: CalibrationState) {
        self.emit(CalibrationEvent::state_changed(from, to));
    }
}
