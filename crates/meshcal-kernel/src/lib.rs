//! `meshcal-kernel` – Calibration Orchestration
//!
//! Turns marker placements into calibrated triangles. The kernel owns the
//! calibration state machine and decides what to propose next; geometry lives
//! in `meshcal-spatial` and persistence in `meshcal-memory`.
//!
//! # Modules
//!
//! - [`calibration`] – [`CalibrationEngine`][calibration::CalibrationEngine]:
//!   the state machine. Validates each placement, blocks placements that
//!   stray from their proposal, holds completion while drifted markers are
//!   re-confirmed, then scores, bakes and crawls.
//! - [`estimate`] – [`Estimator`][estimate::Estimator]: the proposal priority
//!   chain (baked projection, past-session consensus, plan geometry).
//! - [`crawl`] – [`propose_for_neighbors`][crawl::propose_for_neighbors]:
//!   proposes the far vertices of a calibrated triangle's neighbours.
//! - [`drift`] – [`detect_drift`][drift::detect_drift]: compares recorded
//!   placements with live tracked marker positions.
//! - [`quality`] – leg measurements, the quality score and
//!   [`QualityBand`][quality::QualityBand].
//! - [`tracking`] – the [`TrackingProvider`][tracking::TrackingProvider]
//!   seam onto the tracking device.
//! - [`observer`] – the [`CalibrationObserver`][observer::CalibrationObserver]
//!   seam onto the rendering collaborator.

pub mod calibration;
pub mod crawl;
pub mod drift;
pub mod estimate;
pub mod observer;
pub mod quality;
pub mod tracking;

pub use calibration::{
    CalibrationEngine, CalibrationTarget, Completion, RegistrationOutcome, SurveyPoint,
};
pub use drift::{DRIFT_THRESHOLD_M, Drift, detect_drift};
pub use estimate::{Estimator, planar_estimate};
pub use observer::{CalibrationObserver, NullObserver, RecordingObserver};
pub use quality::{QualityBand, measure_legs, triangle_quality};
pub use tracking::{NoTracking, ScriptedTracker, TrackingProvider};
