use crossbeam_channel::Sender;
use parking_lot::Mutex;

use super::RecorderEvent;

/// Largest timestamp reported by any encoder, surfaced as the recording
/// duration
#[derive(Debug)]
pub struct RecordingTimeline {
    max_ms: Mutex<i64>,
    events: Sender<RecorderEvent>,
}

impl RecordingTimeline {
    pub fn new(events: Sender<RecorderEvent>) -> Self {
        Self {
            max_ms: Mutex::new(0),
            events,
        }
    }

    /// Records a timestamp; emits `DurationChanged` only when it advances
    pub fn new_time_stamp(&self, ms: i64) {
        let mut max_ms = self.max_ms.lock();
        if ms > *max_ms {
            *max_ms = ms;
            let _ = self.events.send(RecorderEvent::DurationChanged(ms));
        }
    }

    pub fn duration_ms(&self) -> i64 {
        *self.max_ms.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_advancing_timestamps_are_reported() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let timeline = RecordingTimeline::new(tx);

        timeline.new_time_stamp(40);
        timeline.new_time_stamp(20);
        timeline.new_time_stamp(40);
        timeline.new_time_stamp(80);

        let events: Vec<RecorderEvent> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![RecorderEvent::DurationChanged(40), RecorderEvent::DurationChanged(80)]
        );
        assert_eq!(timeline.duration_ms(), 80);
    }
}
