//! Topic-partitioned publish/subscribe bus for [`CalibrationEvent`]s.
//!
//! Uses [`tokio::sync::broadcast`] channels so every subscriber receives
//! every message without any single subscriber blocking the engine.
//!
//! # Topics
//!
//! | Topic | Traffic |
//! |---|---|
//! | [`Topic::Proposals`] | Ghost positions for unmeasured landmarks |
//! | [`Topic::Alerts`] | Blocked placements and drift corrections awaiting the user |
//! | [`Topic::Progress`] | Triangle completion and state changes |
//!
//! A global lane carries every event regardless of topic.

use meshcal_types::CalibrationEvent;
use thiserror::Error;
use tokio::sync::broadcast;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Proposals,
    Alerts,
    Progress,
}

impl Topic {
    /// Lane an event is routed to.
    pub fn of(event: &CalibrationEvent) -> Self {
        match event {
            CalibrationEvent::ProposalComputed { .. } => Topic::Proposals,
            CalibrationEvent::PlacementBlocked { .. } | CalibrationEvent::DriftCorrectionNeeded { .. } => {
                Topic::Alerts
            }
            CalibrationEvent::TriangleCalibrated { .. } | CalibrationEvent::StateChanged { .. } => {
                Topic::Progress
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum BusError {
    /// Nobody is listening on the topic or the global lane. Normal when the
    /// collaborator has not attached yet.
    #[error("No subscribers for topic {0:?}")]
    NoSubscribers(Topic),

    #[error("Event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Shared calibration event bus. Clones share the same channels.
#[derive(Clone, Debug)]
pub struct CalibrationBus {
    all: broadcast::Sender<CalibrationEvent>,
    proposals: broadcast::Sender<CalibrationEvent>,
    alerts: broadcast::Sender<CalibrationEvent>,
    progress: broadcast::Sender<CalibrationEvent>,
}

impl CalibrationBus {
    /// Create a new bus. `capacity` applies to every lane independently.
    pub fn new(capacity: usize) -> Self {
        let (all, _) = broadcast::channel(capacity);
        let (proposals, _) = broadcast::channel(capacity);
        let (alerts, _) = broadcast::channel(capacity);
        let (progress, _) = broadcast::channel(capacity);
        Self {
            all,
            proposals,
            alerts,
            progress,
        }
    }

    /// Publish `event` to its topic lane and the global lane.
    ///
    /// Returns the number of receivers handed the event across both lanes.
    pub fn publish(&self, event: CalibrationEvent) -> Result<usize, BusError> {
        let topic = Topic::of(&event);
        let on_topic = self.topic_sender(topic).send(event.clone()).unwrap_or(0);
        let on_all = self.all.send(event).unwrap_or(0);
        match on_topic + on_all {
            0 => Err(BusError::NoSubscribers(topic)),
            n => Ok(n),
        }
    }

    /// Subscribe to one topic lane.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic: Some(topic),
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Subscribe to every event.
    pub fn subscribe_all(&self) -> TopicReceiver {
        TopicReceiver {
            topic: None,
            receiver: self.all.subscribe(),
        }
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<CalibrationEvent> {
        match topic {
            Topic::Proposals => &self.proposals,
            Topic::Alerts => &self.alerts,
            Topic::Progress => &self.progress,
        }
    }
}

impl Default for CalibrationBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Serialize an event as a single JSON line for external clients.
pub fn encode(event: &CalibrationEvent) -> Result<String, BusError> {
    Ok(serde_json::to_string(event)?)
}

/// An async receiver bound to one lane of the bus.
pub struct TopicReceiver {
    topic: Option<Topic>,
    receiver: broadcast::Receiver<CalibrationEvent>,
}

impl TopicReceiver {
    /// Wait for the next event.
    ///
    /// * `Err(RecvError::Lagged(n))` – the subscriber fell behind and `n`
    ///   events were dropped.
    /// * `Err(RecvError::Closed)` – every sender was dropped.
    pub async fn recv(&mut self) -> Result<CalibrationEvent, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Drain whatever is buffered without waiting. Lagged gaps are skipped.
    pub fn drain(&mut self) -> Vec<CalibrationEvent> {
        let mut out = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => out.push(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(topic = ?self.topic, lagged_by = n, "receiver lagged");
                }
                Err(_) => return out,
            }
        }
    }

    /// `None` for the global lane.
    pub fn topic(&self) -> Option<Topic> {
        self.topic
    }
}
