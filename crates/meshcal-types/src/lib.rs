//! `meshcal-types` – shared data model for the calibration workspace.
//!
//! Every other crate speaks in these types: identifiers, the small vector
//! primitives, the floor-plan [`Landmark`] with its measurement history, the
//! [`Triangle`] calibration unit, the [`CalibrationState`] machine states, the
//! [`CalibrationEvent`] notifications published to collaborators, and the
//! global [`CalibError`].

pub mod event;
pub mod geometry;
pub mod model;

use thiserror::Error;

pub use event::{BlockedPlacement, CalibrationEvent, Proposal, ProposalSource};
pub use geometry::{Point2, Vec3};
pub use model::{
    BakedPosition, CalibrationState, LandmarkId, Landmark, LegMeasurement, MarkerId,
    PositionRecord, SessionId, SourceKind, Triangle, TriangleId,
};

/// Global error type spanning geometry failures, lookup failures and
/// rejected calibration operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibError {
    /// Collinear points or a near-zero edge; the caller falls back to a
    /// lower-priority estimation path.
    #[error("Degenerate geometry: {0}")]
    DegenerateGeometry(String),

    #[error("Triangle not found: {0}")]
    TriangleNotFound(TriangleId),

    #[error("Landmark not found: {0}")]
    LandmarkNotFound(LandmarkId),

    #[error("Landmark {landmark} is not a vertex of the active calibration target")]
    VertexNotInTriangle { landmark: LandmarkId },

    #[error("Landmark {0} already has a marker in this session")]
    DuplicatePlacement(LandmarkId),

    #[error("Insufficient correspondences: need {needed}, found {found}")]
    InsufficientCorrespondences { needed: usize, found: usize },

    #[error("Transform verification failed: residual {residual_m:.3} m exceeds {threshold_m:.3} m")]
    TransformVerificationFailed { residual_m: f32, threshold_m: f32 },

    #[error("No calibration is active")]
    NoActiveCalibration,

    #[error("Invalid state transition from {from} ({action})")]
    InvalidTransition {
        from: CalibrationState,
        action: String,
    },

    #[error("A blocked placement for {0} is awaiting override or cancel")]
    PlacementPending(LandmarkId),

    #[error("Nothing pending: {0}")]
    NothingPending(String),

    #[error("Invalid triangle: {0}")]
    InvalidTriangle(String),

    /// A store rejected a write the engine assumed would succeed.
    #[error("Store error: {0}")]
    Store(String),
}
