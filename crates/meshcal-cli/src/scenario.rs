//! Scripted calibration scenarios.
//!
//! A scenario is a JSON document naming the plan's landmarks, the triangles
//! over them and, per tracking session, the sequence of user actions to
//! drive through the engine:
//!
//! ```json
//! {
//!   "frame": { "map_width_px": 1000, "map_height_px": 1000, "pixels_per_meter": 100 },
//!   "landmarks": [ { "name": "a", "x": 400, "y": 400 }, ... ],
//!   "triangles": [ ["a", "b", "c"] ],
//!   "sessions": [
//!     { "steps": [
//!       { "action": "start", "triangle": 0 },
//!       { "action": "place", "landmark": "a", "position": { "x": -1.0, "y": -1.1, "z": -1.0 } },
//!       { "action": "override" }
//!     ] }
//!   ]
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use meshcal_kernel::{CalibrationEngine, Completion, RegistrationOutcome, ScriptedTracker};
use meshcal_memory::{FloorPlanStore, InMemoryStore, SharedStore, StoreError, consensus_position};
use meshcal_middleware::{BusObserver, CalibrationBus};
use meshcal_spatial::CanonicalFrame;
use meshcal_spatial::canonical::DEFAULT_FLOOR_HEIGHT_M;
use meshcal_types::{CalibError, LandmarkId, SessionId, SourceKind, TriangleId, Vec3};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("Failed to read scenario at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse scenario: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unknown landmark name: {0}")]
    UnknownLandmark(String),

    #[error("Duplicate landmark name: {0}")]
    DuplicateLandmark(String),

    #[error("Triangle index {0} out of range")]
    UnknownTriangle(usize),

    #[error("Landmark {0} has no marker to track")]
    NoMarker(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Calib(#[from] CalibError),
}

// ────────────────────────────────────────────────────────────────────────────
// Document model
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    /// Overrides the configured frame.
    #[serde(default)]
    pub frame: Option<FrameSpec>,
    pub landmarks: Vec<LandmarkSpec>,
    #[serde(default)]
    pub triangles: Vec<[String; 3]>,
    #[serde(default)]
    pub sessions: Vec<SessionSpec>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FrameSpec {
    pub map_width_px: f32,
    pub map_height_px: f32,
    pub pixels_per_meter: f32,
    #[serde(default = "default_floor_height")]
    pub floor_height_m: f32,
}

fn default_floor_height() -> f32 {
    DEFAULT_FLOOR_HEIGHT_M
}

impl FrameSpec {
    pub fn to_frame(self) -> Result<CanonicalFrame, CalibError> {
        CanonicalFrame::from_map_size(
            self.map_width_px,
            self.map_height_px,
            self.pixels_per_meter,
            self.floor_height_m,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LandmarkSpec {
    pub name: String,
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionSpec {
    #[serde(default)]
    pub label: Option<String>,
    pub steps: Vec<Step>,
}

fn default_source() -> SourceKind {
    SourceKind::InitialPlacement
}

/// One user action.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Start {
        triangle: usize,
    },
    StartAnchors {
        landmarks: [String; 3],
    },
    Place {
        landmark: String,
        position: Vec3,
        #[serde(default = "default_source")]
        source: SourceKind,
    },
    Override,
    Cancel,
    /// Move a placed marker as the tracker would report it. Without a
    /// position the tracker loses sight of the marker.
    Track {
        landmark: String,
        #[serde(default)]
        position: Option<Vec3>,
    },
    ConfirmDrift {
        landmark: String,
    },
    Crawl {
        triangle: usize,
    },
    EnterSurvey,
    ExitSurvey,
    Survey {
        spacing_m: f32,
    },
    Reset,
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Start { .. } => "start",
            Step::StartAnchors { .. } => "start_anchors",
            Step::Place { .. } => "place",
            Step::Override => "override",
            Step::Cancel => "cancel",
            Step::Track { .. } => "track",
            Step::ConfirmDrift { .. } => "confirm_drift",
            Step::Crawl { .. } => "crawl",
            Step::EnterSurvey => "enter_survey",
            Step::ExitSurvey => "exit_survey",
            Step::Survey { .. } => "survey",
            Step::Reset => "reset",
        }
    }
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self, ScenarioError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ScenarioError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ScenarioError> {
        Ok(serde_json::from_str(raw)?)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Replay
// ────────────────────────────────────────────────────────────────────────────

/// Result of one replayed step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub session: usize,
    pub index: usize,
    pub action: &'static str,
    pub result: Result<String, String>,
}

type Engine = CalibrationEngine<SharedStore<InMemoryStore>, ScriptedTracker, BusObserver>;

/// What the store holds for one landmark.
#[derive(Debug, Clone, PartialEq)]
pub struct LandmarkSummary {
    pub name: String,
    pub records: usize,
    /// Outlier-filtered consensus over the whole history.
    pub consensus: Option<Vec3>,
    pub baked: Option<Vec3>,
}

/// Drives a [`Scenario`] through a live engine.
pub struct Replay {
    engine: Engine,
    store: SharedStore<InMemoryStore>,
    tracker: ScriptedTracker,
    names: HashMap<String, LandmarkId>,
    labels: HashMap<LandmarkId, String>,
    triangles: Vec<TriangleId>,
}

impl Replay {
    /// Build the plan described by `scenario` and an engine over it.
    pub fn new(
        scenario: &Scenario,
        frame: Option<CanonicalFrame>,
        bake_on_complete: bool,
        bus: CalibrationBus,
    ) -> Result<Self, ScenarioError> {
        let mut store = InMemoryStore::new();
        let mut names = HashMap::new();
        let mut labels = HashMap::new();
        for spec in &scenario.landmarks {
            if names.contains_key(&spec.name) {
                return Err(ScenarioError::DuplicateLandmark(spec.name.clone()));
            }
            let id = store.add_landmark(meshcal_types::Point2::new(spec.x, spec.y));
            names.insert(spec.name.clone(), id);
            labels.insert(id, spec.name.clone());
        }

        let mut triangles = Vec::with_capacity(scenario.triangles.len());
        for [a, b, c] in &scenario.triangles {
            let vertices = [lookup(&names, a)?, lookup(&names, b)?, lookup(&names, c)?];
            triangles.push(store.create_triangle(vertices)?);
        }
        info!(
            landmarks = names.len(),
            triangles = triangles.len(),
            framed = frame.is_some(),
            "scenario plan built"
        );

        let store = SharedStore::new(store);
        let tracker = ScriptedTracker::new();
        let engine = CalibrationEngine::new(store.clone(), tracker.clone(), BusObserver::new(bus))
            .with_frame(frame)
            .with_bake_on_complete(bake_on_complete);

        Ok(Self {
            engine,
            store,
            tracker,
            names,
            labels,
            triangles,
        })
    }

    pub fn store(&self) -> SharedStore<InMemoryStore> {
        self.store.clone()
    }

    pub fn label(&self, id: LandmarkId) -> String {
        self.labels.get(&id).cloned().unwrap_or_else(|| id.to_string())
    }

    /// Per-landmark history after a replay, in store order.
    pub fn summary(&self) -> Vec<LandmarkSummary> {
        self.store
            .lock()
            .landmarks()
            .iter()
            .map(|lm| LandmarkSummary {
                name: self.label(lm.id),
                records: lm.history.len(),
                consensus: consensus_position(lm),
                baked: lm.baked.map(|b| b.position),
            })
            .collect()
    }

    /// Replay every session in order, one fresh tracking session each.
    ///
    /// Stops between steps once `cancel` is raised.
    pub fn run(
        &mut self,
        sessions: &[SessionSpec],
        cancel: &AtomicBool,
        mut on_step: impl FnMut(&StepRecord),
    ) -> Vec<StepRecord> {
        let mut records = Vec::new();
        for (s, session) in sessions.iter().enumerate() {
            self.engine.begin_session(SessionId::new());
            debug!(session = s, label = ?session.label, "replaying session");
            for (i, step) in session.steps.iter().enumerate() {
                if cancel.load(Ordering::SeqCst) {
                    info!(session = s, step = i, "replay cancelled");
                    return records;
                }
                let record = StepRecord {
                    session: s,
                    index: i,
                    action: step.name(),
                    result: self.apply(step).map_err(|e| e.to_string()),
                };
                on_step(&record);
                records.push(record);
            }
        }
        records
    }

    /// Apply a single step to the engine.
    pub fn apply(&mut self, step: &Step) -> Result<String, ScenarioError> {
        match step {
            Step::Start { triangle } => {
                let id = self.triangle(*triangle)?;
                let first = self.engine.start_calibration(id)?;
                Ok(format!("calibrating triangle {triangle}, place {} first", self.label(first)))
            }
            Step::StartAnchors { landmarks } => {
                let [a, b, c] = landmarks;
                let anchors = [self.lookup(a)?, self.lookup(b)?, self.lookup(c)?];
                self.engine.start_anchor_calibration(anchors)?;
                Ok(format!("calibrating anchors {a}, {b}, {c}"))
            }
            Step::Place {
                landmark,
                position,
                source,
            } => {
                let id = self.lookup(landmark)?;
                let outcome = self.engine.register_marker(id, *position, *source)?;
                Ok(self.describe(&outcome))
            }
            Step::Override => {
                let outcome = self.engine.override_blocked()?;
                Ok(format!("override: {}", self.describe(&outcome)))
            }
            Step::Cancel => {
                let blocked = self.engine.cancel_blocked()?;
                Ok(format!("cancelled placement of {}", self.label(blocked.landmark)))
            }
            Step::Track { landmark, position } => {
                let id = self.lookup(landmark)?;
                let marker = self
                    .engine
                    .marker_for(id)
                    .ok_or_else(|| ScenarioError::NoMarker(landmark.clone()))?;
                match position {
                    Some(p) => {
                        self.tracker.set(marker, *p);
                        Ok(format!("{landmark} tracked at {p}"))
                    }
                    None => {
                        self.tracker.remove(marker);
                        Ok(format!("{landmark} lost by the tracker"))
                    }
                }
            }
            Step::ConfirmDrift { landmark } => {
                let id = self.lookup(landmark)?;
                let outcome = self.engine.confirm_drift(id)?;
                Ok(format!("drift confirmed: {}", self.describe(&outcome)))
            }
            Step::Crawl { triangle } => {
                let id = self.triangle(*triangle)?;
                let proposals = self.engine.propose_for_neighbors(id)?;
                Ok(format!("{} new proposal(s)", proposals.len()))
            }
            Step::EnterSurvey => {
                self.engine.enter_survey_mode()?;
                Ok("survey mode".into())
            }
            Step::ExitSurvey => {
                self.engine.exit_survey_mode()?;
                Ok("ready to fill".into())
            }
            Step::Survey { spacing_m } => {
                let points = self.engine.survey_points(*spacing_m)?;
                Ok(format!("{} survey point(s) at {spacing_m} m spacing", points.len()))
            }
            Step::Reset => {
                self.engine.reset();
                Ok("reset".into())
            }
        }
    }

    /// One-line human summary of a registration outcome.
    pub fn describe(&self, outcome: &RegistrationOutcome) -> String {
        match outcome {
            RegistrationOutcome::Recorded {
                landmark,
                state,
                proposal,
            } => match proposal {
                Some(p) => format!(
                    "{} recorded ({state}); proposed {} via {:?}",
                    self.label(*landmark),
                    self.label(p.landmark),
                    p.source
                ),
                None => format!("{} recorded ({state})", self.label(*landmark)),
            },
            RegistrationOutcome::Blocked { blocked } => format!(
                "{} blocked: {:.2} m from proposal",
                self.label(blocked.landmark),
                blocked.distance_m
            ),
            RegistrationOutcome::DriftCorrectionRequired { landmarks } => {
                let names: Vec<String> = landmarks.iter().map(|l| self.label(*l)).collect();
                format!("drift detected on {}", names.join(", "))
            }
            RegistrationOutcome::Completed { completions } => {
                let parts: Vec<String> = completions.iter().map(|c| self.describe_completion(c)).collect();
                format!("completed {}", parts.join("; "))
            }
        }
    }

    fn describe_completion(&self, c: &Completion) -> String {
        let name = match c.triangle.and_then(|t| self.triangles.iter().position(|x| *x == t)) {
            Some(i) => format!("triangle {i}"),
            None => "anchor set".to_string(),
        };
        format!(
            "{name} quality {:.2} ({:?}), {} proposal(s)",
            c.quality,
            c.band,
            c.proposals.len()
        )
    }

    fn lookup(&self, name: &str) -> Result<LandmarkId, ScenarioError> {
        lookup(&self.names, name)
    }

    fn triangle(&self, index: usize) -> Result<TriangleId, ScenarioError> {
        self.triangles
            .get(index)
            .copied()
            .ok_or(ScenarioError::UnknownTriangle(index))
    }
}

fn lookup(names: &HashMap<String, LandmarkId>, name: &str) -> Result<LandmarkId, ScenarioError> {
    names
        .get(name)
        .copied()
        .ok_or_else(|| ScenarioError::UnknownLandmark(name.to_string()))
}
