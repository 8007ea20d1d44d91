//! `meshcal-memory` – position history, consensus and the floor-plan store.
//!
//! Everything the engine remembers between placements lives here.
//!
//! # Modules
//!
//! - [`history`] – bounded, append-only measurement history per landmark
//!   (capacity [`HISTORY_CAPACITY`][history::HISTORY_CAPACITY], oldest evicted).
//! - [`consensus`] – outlier-rejected, confidence-weighted position consensus.
//! - [`bake`] – bake-down of session measurements into each landmark's running
//!   canonical estimate, and retrospective bake planning over a snapshot.
//! - [`store`] – the [`FloorPlanStore`][store::FloorPlanStore] trait,
//!   [`InMemoryStore`][store::InMemoryStore] with triangle validation, and
//!   [`SharedStore`][store::SharedStore] for cross-thread single-writer use.

pub mod bake;
pub mod consensus;
pub mod history;
pub mod store;

pub use bake::{BakePlan, BakeResult, bake_down, blend, plan_bake};
pub use consensus::{consensus_of, consensus_position, session_position, weighted_average};
pub use history::{HISTORY_CAPACITY, add_record};
pub use store::{FloorPlanSnapshot, FloorPlanStore, InMemoryStore, SharedStore, StoreError};
