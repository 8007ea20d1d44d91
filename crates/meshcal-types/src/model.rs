//! Floor-plan landmarks, their measurement records, and calibration triangles.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geometry::{Point2, Vec3};

// ────────────────────────────────────────────────────────────────────────────
// Identifiers
// ────────────────────────────────────────────────────────────────────────────

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                // Short form keeps log lines readable.
                let s = self.0.simple().to_string();
                f.write_str(&s[..8])
            }
        }
    };
}

uuid_id!(
    /// Identifies a floor-plan [`Landmark`].
    LandmarkId
);
uuid_id!(
    /// Identifies a calibration [`Triangle`].
    TriangleId
);
uuid_id!(
    /// Identifies one run of the external tracking provider. Positions from
    /// different sessions live in unrelated coordinate frames.
    SessionId
);
uuid_id!(
    /// Identifies a physical marker placed in the tracked scene.
    MarkerId
);

// ────────────────────────────────────────────────────────────────────────────
// PositionRecord
// ────────────────────────────────────────────────────────────────────────────

/// How a measurement came to be recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Placed by the user with no proposal to compare against.
    InitialPlacement,
    /// The user accepted an engine proposal as-is.
    ProposalConfirmed,
    /// The user moved an engine proposal before accepting it.
    ProposalAdjusted,
    /// Restored from a relocalised tracking session.
    Relocalized,
}

impl SourceKind {
    /// Confidence assigned to a record of this kind.
    pub fn default_confidence(self) -> f32 {
        match self {
            SourceKind::ProposalConfirmed => 1.0,
            SourceKind::InitialPlacement => 0.95,
            SourceKind::Relocalized => 0.9,
            SourceKind::ProposalAdjusted => 0.8,
        }
    }
}

/// A single immutable 3-D measurement of a landmark in one tracking session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub id: Uuid,
    /// Session-local position (metres).
    pub position: Vec3,
    pub session: SessionId,
    pub recorded_at: DateTime<Utc>,
    pub source: SourceKind,
    /// Weight in `[0, 1]` used by consensus and bake-down.
    pub confidence: f32,
    /// Observed − proposed. Diagnostic only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distortion: Option<Vec3>,
}

impl PositionRecord {
    /// Build a record stamped with a fresh id and the current UTC time.
    /// `confidence` is clamped to `[0, 1]`.
    pub fn new(position: Vec3, session: SessionId, source: SourceKind, confidence: f32) -> Self {
        Self {
            id: Uuid::new_v4(),
            position,
            session,
            recorded_at: Utc::now(),
            source,
            confidence: confidence.clamp(0.0, 1.0),
            distortion: None,
        }
    }

    pub fn with_distortion(mut self, distortion: Vec3) -> Self {
        self.distortion = Some(distortion);
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Landmark
// ────────────────────────────────────────────────────────────────────────────

/// Running canonical-frame estimate folded from session measurements.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BakedPosition {
    pub position: Vec3,
    pub confidence: f32,
    pub sample_count: u32,
}

/// A fixed floor-plan location with a history of 3-D measurements.
///
/// The plan coordinate is set at creation and never changes; calibration
/// only touches `history` and `baked`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub id: LandmarkId,
    map_position: Point2,
    /// Oldest first.
    pub history: VecDeque<PositionRecord>,
    pub baked: Option<BakedPosition>,
    /// Triangles that use this landmark as a vertex.
    #[serde(default)]
    pub triangle_memberships: Vec<TriangleId>,
    /// Bumped on every history or baked-estimate change. Used to detect
    /// stale background results.
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
}

impl Landmark {
    pub fn new(map_position: Point2) -> Self {
        Self::with_id(LandmarkId::new(), map_position)
    }

    pub fn with_id(id: LandmarkId, map_position: Point2) -> Self {
        Self {
            id,
            map_position,
            history: VecDeque::new(),
            baked: None,
            triangle_memberships: Vec::new(),
            revision: 0,
            created_at: Utc::now(),
        }
    }

    pub fn map_position(&self) -> Point2 {
        self.map_position
    }

    /// Most recent record captured in `session`, if any.
    pub fn latest_in_session(&self, session: SessionId) -> Option<&PositionRecord> {
        self.history.iter().rev().find(|r| r.session == session)
    }

    /// Distinct sessions present in the history, in order of first
    /// appearance.
    pub fn sessions(&self) -> Vec<SessionId> {
        let mut out: Vec<SessionId> = Vec::new();
        for record in &self.history {
            if !out.contains(&record.session) {
                out.push(record.session);
            }
        }
        out
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Triangle
// ────────────────────────────────────────────────────────────────────────────

/// One edge of a calibrated triangle, measured on the plan and in the
/// tracked session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LegMeasurement {
    pub vertex_a: LandmarkId,
    pub vertex_b: LandmarkId,
    /// Plan distance converted to metres.
    pub map_distance_m: f32,
    /// 3-D distance between the two tracked markers.
    pub tracked_distance_m: f32,
}

impl LegMeasurement {
    /// `tracked / map`; zero when the plan distance is zero.
    pub fn distortion_ratio(&self) -> f32 {
        if self.map_distance_m == 0.0 {
            0.0
        } else {
            self.tracked_distance_m / self.map_distance_m
        }
    }
}

/// Three landmarks forming a calibration unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Triangle {
    pub id: TriangleId,
    vertices: [LandmarkId; 3],
    /// Marker placed for each vertex, in vertex order.
    pub marker_slots: [Option<MarkerId>; 3],
    pub is_calibrated: bool,
    /// `0.0` (poor) to `1.0` (perfect).
    pub quality: f32,
    pub legs: Vec<LegMeasurement>,
    /// Vertex index that started the most recent calibration session.
    pub last_start_vertex: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub last_calibrated_at: Option<DateTime<Utc>>,
}

impl Triangle {
    pub fn new(vertices: [LandmarkId; 3]) -> Self {
        Self {
            id: TriangleId::new(),
            vertices,
            marker_slots: [None; 3],
            is_calibrated: false,
            quality: 0.0,
            legs: Vec::new(),
            last_start_vertex: None,
            created_at: Utc::now(),
            last_calibrated_at: None,
        }
    }

    pub fn vertices(&self) -> [LandmarkId; 3] {
        self.vertices
    }

    pub fn contains(&self, landmark: LandmarkId) -> bool {
        self.vertices.contains(&landmark)
    }

    pub fn vertex_index(&self, landmark: LandmarkId) -> Option<usize> {
        self.vertices.iter().position(|v| *v == landmark)
    }

    /// Vertices this triangle shares with `other`.
    pub fn shared_vertices(&self, other: &Triangle) -> Vec<LandmarkId> {
        self.vertices
            .iter()
            .copied()
            .filter(|v| other.contains(*v))
            .collect()
    }

    /// Two triangles are adjacent iff they share exactly two vertices.
    pub fn is_adjacent(&self, other: &Triangle) -> bool {
        self.id != other.id && self.shared_vertices(other).len() == 2
    }

    /// The single vertex of `neighbor` that this triangle does not contain,
    /// or `None` when the two are not adjacent.
    pub fn far_vertex_of(&self, neighbor: &Triangle) -> Option<LandmarkId> {
        if !self.is_adjacent(neighbor) {
            return None;
        }
        neighbor.vertices.iter().copied().find(|v| !self.contains(*v))
    }

    /// Record `marker` in the slot for `landmark`. Returns `false` when the
    /// landmark is not a vertex.
    pub fn set_marker(&mut self, landmark: LandmarkId, marker: MarkerId) -> bool {
        match self.vertex_index(landmark) {
            Some(i) => {
                self.marker_slots[i] = Some(marker);
                true
            }
            None => false,
        }
    }

    pub fn marker_for(&self, landmark: LandmarkId) -> Option<MarkerId> {
        self.vertex_index(landmark).and_then(|i| self.marker_slots[i])
    }
}

// ────────────────────────────────────────────────────────────────────────────
// CalibrationState
// ────────────────────────────────────────────────────────────────────────────

/// State of the single in-flight calibration context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "index", rename_all = "snake_case")]
pub enum CalibrationState {
    #[default]
    Idle,
    /// Waiting for the marker with this ordinal (0, 1 or 2).
    PlacingVertices(u8),
    ReadyToFill,
    SurveyMode,
}

impl CalibrationState {
    /// Crawl and free placement are only allowed once a target is complete.
    pub fn allows_crawl(self) -> bool {
        matches!(self, CalibrationState::ReadyToFill | CalibrationState::SurveyMode)
    }
}

impl std::fmt::Display for CalibrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalibrationState::Idle => write!(f, "Idle"),
            CalibrationState::PlacingVertices(i) => write!(f, "PlacingVertices({i})"),
            CalibrationState::ReadyToFill => write!(f, "ReadyToFill"),
            CalibrationState::SurveyMode => write!(f, "SurveyMode"),
        }
    }
}
