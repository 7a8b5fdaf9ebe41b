//! Per-stream motion state for Home Assistant entities
//!
//! The tracker only mutates state. Publishing happens in the free functions
//! below, after the caller has copied what it needs out of the lock.

use super::connection::ConnectionManager;
use crate::detection::DetectionResult;
use crate::observability::metrics::metrics;
use crate::topics::TopicBuilder;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Maximum number of streams with motion state.
pub const MAX_MOTION_STREAMS: usize = 16;

/// Maximum number of distinct labels tracked per stream.
pub const MAX_TRACKED_LABELS: usize = 32;

pub const MOTION_ON: &str = "ON";
pub const MOTION_OFF: &str = "OFF";

/// Count of one object class in the latest detection batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelCount {
    pub label: String,
    pub count: u32,
}

#[derive(Debug, Clone)]
struct MotionEntry {
    stream: String,
    last_detection: Instant,
    active: bool,
    labels: Vec<LabelCount>,
}

/// What to publish after recording a detection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionUpdate {
    pub stream: String,
    /// True only on the inactive to active transition
    pub turned_on: bool,
    pub detection_count: usize,
    pub labels: Vec<LabelCount>,
}

/// A stream the watchdog just flipped to inactive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredStream {
    pub stream: String,
    /// Labels that were tracked before the flip
    pub labels: Vec<LabelCount>,
}

/// Read-only view of one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionSnapshot {
    pub stream: String,
    pub active: bool,
    pub labels: Vec<LabelCount>,
}

/// Bounded table of motion state keyed by stream name
#[derive(Debug, Default)]
pub struct MotionTracker {
    entries: Mutex<Vec<MotionEntry>>,
}

/// Count detections per label, keeping first-seen order
fn count_labels(result: &DetectionResult) -> Vec<LabelCount> {
    let mut labels: Vec<LabelCount> = Vec::new();
    for detection in &result.detections {
        if let Some(existing) = labels.iter_mut().find(|l| l.label == detection.label) {
            existing.count += 1;
        } else if labels.len() < MAX_TRACKED_LABELS {
            labels.push(LabelCount {
                label: detection.label.clone(),
                count: 1,
            });
        }
    }
    labels
}

impl MotionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<MotionEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a detection batch for `stream`
    ///
    /// Returns `None` when the table is full and `stream` has no entry yet.
    pub fn record_detection(
        &self,
        stream: &str,
        result: &DetectionResult,
        now: Instant,
    ) -> Option<MotionUpdate> {
        let mut entries = self.lock();

        let index = match entries.iter().position(|e| e.stream == stream) {
            Some(index) => index,
            None if entries.len() < MAX_MOTION_STREAMS => {
                entries.push(MotionEntry {
                    stream: stream.to_string(),
                    last_detection: now,
                    active: false,
                    labels: Vec::new(),
                });
                entries.len() - 1
            }
            None => {
                warn!(stream = %stream, "Motion state table full, ignoring stream");
                return None;
            }
        };

        let entry = &mut entries[index];
        entry.last_detection = now;
        let turned_on = !entry.active;
        entry.active = true;
        if !result.is_empty() {
            entry.labels = count_labels(result);
        }

        Some(MotionUpdate {
            stream: entry.stream.clone(),
            turned_on,
            detection_count: result.count(),
            labels: entry.labels.clone(),
        })
    }

    /// Flip every active stream idle for at least `off_delay` to inactive
    pub fn expire_idle(&self, now: Instant, off_delay: Duration) -> Vec<ExpiredStream> {
        let mut entries = self.lock();
        entries
            .iter_mut()
            .filter(|e| e.active && now.saturating_duration_since(e.last_detection) >= off_delay)
            .map(|e| {
                e.active = false;
                ExpiredStream {
                    stream: e.stream.clone(),
                    labels: std::mem::take(&mut e.labels),
                }
            })
            .collect()
    }

    /// Force `stream` inactive; `None` if it was not active
    pub fn clear(&self, stream: &str) -> Option<ExpiredStream> {
        let mut entries = self.lock();
        let entry = entries.iter_mut().find(|e| e.stream == stream && e.active)?;
        entry.active = false;
        Some(ExpiredStream {
            stream: entry.stream.clone(),
            labels: std::mem::take(&mut entry.labels),
        })
    }

    pub fn snapshot(&self, stream: &str) -> Option<MotionSnapshot> {
        self.lock()
            .iter()
            .find(|e| e.stream == stream)
            .map(|e| MotionSnapshot {
                stream: e.stream.clone(),
                active: e.active,
                labels: e.labels.clone(),
            })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn publish_state(connection: &ConnectionManager, topic: &str, payload: &str) {
    if let Err(e) = connection.publish(topic, payload.as_bytes(), false) {
        debug!(topic = %topic, error = %e, "Failed to publish motion state");
    }
}

/// Publish ON (on transition), the detection count and per-label counts
pub fn publish_motion_update(
    connection: &ConnectionManager,
    topics: &TopicBuilder,
    update: &MotionUpdate,
) {
    if update.turned_on {
        metrics().motion_turned_on();
        publish_state(connection, &topics.motion(&update.stream), MOTION_ON);
    }
    publish_state(
        connection,
        &topics.detection_count(&update.stream),
        &update.detection_count.to_string(),
    );
    for label in &update.labels {
        publish_state(
            connection,
            &topics.label_count(&update.stream, &label.label),
            &label.count.to_string(),
        );
    }
}

/// Publish OFF, reset the detection count and zero every previously tracked label
pub fn publish_motion_off(
    connection: &ConnectionManager,
    topics: &TopicBuilder,
    expired: &ExpiredStream,
) {
    metrics().motion_turned_off();
    debug!(stream = %expired.stream, "Motion cleared");
    publish_state(connection, &topics.motion(&expired.stream), MOTION_OFF);
    publish_state(connection, &topics.detection_count(&expired.stream), "0");
    for label in &expired.labels {
        publish_state(
            connection,
            &topics.label_count(&expired.stream, &label.label),
            "0",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Detection;

    fn result(labels: &[&str]) -> DetectionResult {
        DetectionResult::new(labels.iter().map(|l| Detection::new(*l, 0.9)).collect())
    }

    fn labels_of(snapshot: &MotionSnapshot) -> Vec<&str> {
        snapshot.labels.iter().map(|l| l.label.as_str()).collect()
    }

    #[test]
    fn test_first_detection_turns_on() {
        let tracker = MotionTracker::new();
        let now = Instant::now();

        let first = tracker.record_detection("cam", &result(&["person"]), now).unwrap();
        let second = tracker
            .record_detection("cam", &result(&["person"]), now + Duration::from_secs(1))
            .unwrap();

        assert!(first.turned_on);
        assert!(!second.turned_on);
    }

    #[test]
    fn test_labels_replaced_not_merged() {
        let tracker = MotionTracker::new();
        let now = Instant::now();

        tracker.record_detection("cam", &result(&["person"]), now);
        tracker.record_detection("cam", &result(&["car"]), now);

        let snapshot = tracker.snapshot("cam").unwrap();
        assert_eq!(labels_of(&snapshot), vec!["car"]);
    }

    #[test]
    fn test_empty_result_keeps_labels() {
        let tracker = MotionTracker::new();
        let now = Instant::now();

        tracker.record_detection("cam", &result(&["person", "person", "dog"]), now);
        let update = tracker
            .record_detection("cam", &DetectionResult::default(), now)
            .unwrap();

        assert_eq!(update.detection_count, 0);
        assert_eq!(
            update.labels,
            vec![
                LabelCount {
                    label: "person".to_string(),
                    count: 2
                },
                LabelCount {
                    label: "dog".to_string(),
                    count: 1
                },
            ]
        );
    }

    #[test]
    fn test_label_overflow_dropped() {
        let labels: Vec<String> = (0..MAX_TRACKED_LABELS + 3).map(|i| format!("l{i}")).collect();
        let refs: Vec<&str> = labels.iter().map(String::as_str).collect();

        let update = MotionTracker::new()
            .record_detection("cam", &result(&refs), Instant::now())
            .unwrap();

        assert_eq!(update.labels.len(), MAX_TRACKED_LABELS);
        assert_eq!(update.detection_count, MAX_TRACKED_LABELS + 3);
    }

    #[test]
    fn test_table_capacity() {
        let tracker = MotionTracker::new();
        let now = Instant::now();
        for i in 0..MAX_MOTION_STREAMS {
            assert!(tracker
                .record_detection(&format!("cam{i}"), &result(&["person"]), now)
                .is_some());
        }

        assert!(tracker
            .record_detection("one-too-many", &result(&["person"]), now)
            .is_none());
        assert!(tracker
            .record_detection("cam0", &result(&["person"]), now)
            .is_some());
        assert_eq!(tracker.len(), MAX_MOTION_STREAMS);
    }

    #[test]
    fn test_expire_only_after_off_delay() {
        let tracker = MotionTracker::new();
        let start = Instant::now();
        let delay = Duration::from_secs(30);
        tracker.record_detection("cam", &result(&["person"]), start);

        assert!(tracker
            .expire_idle(start + Duration::from_secs(29), delay)
            .is_empty());

        let expired = tracker.expire_idle(start + delay, delay);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].stream, "cam");
        assert_eq!(expired[0].labels[0].label, "person");

        // Already inactive: no second OFF
        assert!(tracker
            .expire_idle(start + Duration::from_secs(90), delay)
            .is_empty());
        let snapshot = tracker.snapshot("cam").unwrap();
        assert!(!snapshot.active);
        assert!(snapshot.labels.is_empty());
    }

    #[test]
    fn test_clear_forces_off_once() {
        let tracker = MotionTracker::new();
        tracker.record_detection("cam", &result(&["person"]), Instant::now());

        assert!(tracker.clear("cam").is_some());
        assert!(tracker.clear("cam").is_none());
        assert!(tracker.clear("unknown").is_none());
    }
}
