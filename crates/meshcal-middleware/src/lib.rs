//! `meshcal-middleware` – Collaborator Boundary
//!
//! Carries calibration notifications from the engine to the rendering/UI
//! collaborator without either side knowing about the other.
//!
//! # Modules
//!
//! - [`bus`] – topic-partitioned publish/subscribe bus of
//!   [`CalibrationEvent`][meshcal_types::CalibrationEvent]s built on Tokio
//!   broadcast channels, plus JSON encoding for external clients.
//! - [`observer`] – [`BusObserver`][observer::BusObserver]: a
//!   [`CalibrationObserver`][meshcal_kernel::CalibrationObserver] that
//!   publishes every notification onto the bus.

pub mod bus;
pub mod observer;

pub use bus::{BusError, CalibrationBus, Topic, TopicReceiver, encode};
pub use observer::BusObserver;
