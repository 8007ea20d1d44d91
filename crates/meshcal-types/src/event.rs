//! Notifications the engine emits toward its rendering/UI collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geometry::Vec3;
use crate::model::{CalibrationState, LandmarkId, SourceKind, TriangleId};

/// Which estimation path produced a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalSource {
    /// Baked canonical position projected through the cached session transform.
    BakedProjection,
    /// Confidence-weighted consensus of per-session rigid alignments.
    SessionConsensus,
    /// Barycentric lift from a fully measured triangle.
    Barycentric,
    /// Plan-geometry estimate from two placed markers.
    PlanarEstimate,
    /// Live re-observed position of a drifted marker awaiting re-confirmation.
    DriftCorrection,
}

/// An engine-computed estimate ("ghost") of an unmeasured landmark.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub landmark: LandmarkId,
    /// Current-session position (metres).
    pub position: Vec3,
    pub source: ProposalSource,
}

/// A placement held back because it lands too far from its proposal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlockedPlacement {
    pub landmark: LandmarkId,
    pub attempted: Vec3,
    pub proposed: Vec3,
    pub distance_m: f32,
    pub source: SourceKind,
}

/// Event payloads published to collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibrationEvent {
    ProposalComputed {
        proposal: Proposal,
        at: DateTime<Utc>,
    },
    PlacementBlocked {
        blocked: BlockedPlacement,
        at: DateTime<Utc>,
    },
    DriftCorrectionNeeded {
        landmarks: Vec<LandmarkId>,
        at: DateTime<Utc>,
    },
    TriangleCalibrated {
        triangle: TriangleId,
        quality: f32,
        at: DateTime<Utc>,
    },
    StateChanged {
        from: CalibrationState,
        to: CalibrationState,
        at: DateTime<Utc>,
    },
}

impl CalibrationEvent {
    pub fn proposal(proposal: Proposal) -> Self {
        Self::ProposalComputed {
            proposal,
            at: Utc::now(),
        }
    }

    pub fn blocked(blocked: BlockedPlacement) -> Self {
        Self::PlacementBlocked {
            blocked,
            at: Utc::now(),
        }
    }

    pub fn drift(landmarks: Vec<LandmarkId>) -> Self {
        Self::DriftCorrectionNeeded {
            landmarks,
            at: Utc::now(),
        }
    }

    pub fn calibrated(triangle: TriangleId, quality: f32) -> Self {
        Self::TriangleCalibrated {
            triangle,
            quality,
            at: Utc::now(),
        }
    }

    pub fn state_changed(from: CalibrationState, to: CalibrationState) -> Self {
        Self::StateChanged {
            from,
            to,
            at: Utc::now(),
        }
    }

    /// Timestamp at which the event was created.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::ProposalComputed { at, .. }
            | Self::PlacementBlocked { at, .. }
            | Self::DriftCorrectionNeeded { at, .. }
            | Self::TriangleCalibrated { at, .. }
            | Self::StateChanged { at, .. } => *at,
        }
    }
}
