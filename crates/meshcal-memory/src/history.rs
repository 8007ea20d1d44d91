//! Bounded per-landmark measurement history.
//!
//! Records are appended oldest-first and never edited. Once the history
//! reaches [`HISTORY_CAPACITY`], the oldest record is evicted for each new
//! one. The only in-place change is drift correction, which swaps the
//! latest record of a session for its re-confirmed replacement.

use meshcal_types::{Landmark, PositionRecord, SessionId};
use tracing::debug;

/// Most records kept per landmark.
pub const HISTORY_CAPACITY: usize = 20;

/// Append `record`, evicting the oldest when over capacity.
///
/// Returns the evicted record, if any.
pub fn add_record(landmark: &mut Landmark, record: PositionRecord) -> Option<PositionRecord> {
    landmark.history.push_back(record);
    landmark.revision += 1;

    let evicted = if landmark.history.len() > HISTORY_CAPACITY {
        landmark.history.pop_front()
    } else {
        None
    };
    if let Some(old) = &evicted {
        debug!(landmark = %landmark.id, session = %old.session, "evicted oldest record");
    }
    evicted
}

/// Replace the latest record `session` holds for this landmark.
///
/// Falls back to appending when the session has no record yet. Returns the
/// replaced record.
pub fn replace_session_record(landmark: &mut Landmark, record: PositionRecord) -> Option<PositionRecord> {
    let session = record.session;
    match landmark.history.iter().rposition(|r| r.session == session) {
        Some(i) => {
            let old = std::mem::replace(&mut landmark.history[i], record);
            landmark.revision += 1;
            Some(old)
        }
        None => {
            add_record(landmark, record);
            None
        }
    }
}

/// All records captured in `session`, oldest first.
pub fn records_in_session(landmark: &Landmark, session: SessionId) -> Vec<&PositionRecord> {
    landmark.history.iter().filter(|r| r.session == session).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcal_types::{Point2, SourceKind, Vec3};

    fn record(x: f32, session: SessionId) -> PositionRecord {
        PositionRecord::new(Vec3::new(x, 0.0, 0.0), session, SourceKind::InitialPlacement, 0.95)
    }

    #[test]
    fn capacity_evicts_oldest() {
        let s = SessionId::new();
        let mut lm = Landmark::new(Point2::new(0.0, 0.0));

        for i in 0..HISTORY_CAPACITY {
            assert!(add_record(&mut lm, record(i as f32, s)).is_none());
        }
        let evicted = add_record(&mut lm, record(99.0, s)).unwrap();

        assert_eq!(evicted.position.x, 0.0);
        assert_eq!(lm.history.len(), HISTORY_CAPACITY);
        assert_eq!(lm.history.front().map(|r| r.position.x), Some(1.0));
        assert_eq!(lm.history.back().map(|r| r.position.x), Some(99.0));
        assert_eq!(lm.revision, (HISTORY_CAPACITY + 1) as u64);
    }

    #[test]
    fn replace_swaps_latest_in_session() {
        let s1 = SessionId::new();
        let s2 = SessionId::new();
        let mut lm = Landmark::new(Point2::new(0.0, 0.0));
        add_record(&mut lm, record(1.0, s1));
        add_record(&mut lm, record(2.0, s2));

        let old = replace_session_record(&mut lm, record(1.5, s1)).unwrap();

        assert_eq!(old.position.x, 1.0);
        assert_eq!(lm.history.len(), 2);
        assert_eq!(records_in_session(&lm, s1)[0].position.x, 1.5);
        assert_eq!(lm.history[1].position.x, 2.0);
    }

    #[test]
    fn replace_without_session_appends() {
        let s = SessionId::new();
        let mut lm = Landmark::new(Point2::new(0.0, 0.0));
        assert!(replace_session_record(&mut lm, record(3.0, s)).is_none());
        assert_eq!(records_in_session(&lm, s).len(), 1);
    }
}
