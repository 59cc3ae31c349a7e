use std::collections::VecDeque;

use serde::Serialize;

/// Samples older than this (relative to the latest append) are dropped.
pub const RETENTION_MS: i64 = 60_000;

pub type EntityId = i64;

/// One observed transfer. Immutable once appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ByteSample {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: i64,
    #[serde(rename = "tabId")]
    pub entity_id: EntityId,
}

impl ByteSample {
    pub fn received(entity_id: EntityId, timestamp_ms: i64, bytes_received: u64) -> Self {
        Self { bytes_received, bytes_sent: 0, timestamp_ms, entity_id }
    }

    pub fn total(&self) -> u64 {
        self.bytes_received.saturating_add(self.bytes_sent)
    }
}

/// Per-entity ordered buffer of samples, oldest at the front.
#[derive(Debug, Clone, Default)]
pub struct RetentionWindow {
    buf: VecDeque<ByteSample>,
}

impl RetentionWindow {
    pub fn new() -> Self {
        Self { buf: VecDeque::with_capacity(16) }
    }

    /// Push at the tail. A timestamp older than the current tail is raised
    /// to the tail's, so the buffer stays sorted and `prune` can stop at the
    /// first young sample. Returns the timestamp actually stored.
    pub fn append(&mut self, mut sample: ByteSample) -> i64 {
        if let Some(latest) = self.latest_timestamp() {
            sample.timestamp_ms = sample.timestamp_ms.max(latest);
        }
        self.buf.push_back(sample);
        sample.timestamp_ms
    }

    /// Drop every sample with `timestamp <= now - RETENTION_MS`.
    pub fn prune(&mut self, now_ms: i64) -> usize {
        let cutoff = now_ms.saturating_sub(RETENTION_MS);
        let mut dropped = 0;
        while let Some(front) = self.buf.front() {
            if front.timestamp_ms > cutoff {
                break;
            }
            self.buf.pop_front();
            dropped += 1;
        }
        dropped
    }

    /// Sum of bytes over samples with `timestamp > now - window_ms`.
    ///
    /// Walks backwards from the newest sample and stops at the first one
    /// outside the window, so the cost is bounded by the samples inside it.
    pub fn sum_since(&self, now_ms: i64, window_ms: i64) -> u64 {
        let cutoff = now_ms.saturating_sub(window_ms);
        self.buf
            .iter()
            .rev()
            .take_while(|s| s.timestamp_ms > cutoff)
            .fold(0u64, |acc, s| acc.saturating_add(s.total()))
    }

    pub fn latest_timestamp(&self) -> Option<i64> {
        self.buf.back().map(|s| s.timestamp_ms)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ByteSample> {
        self.buf.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: i64, bytes: u64) -> ByteSample {
        ByteSample::received(1, ts, bytes)
    }

    #[test]
    fn empty_window_sums_to_zero() {
        let w = RetentionWindow::new();
        assert_eq!(w.sum_since(10_000, 1000), 0);
        assert_eq!(w.iter().count(), 0);
    }

    #[test]
    fn sum_since_counts_only_samples_strictly_inside_window() {
        let mut w = RetentionWindow::new();
        let points = [(0, 10), (100, 20), (999, 40), (1000, 80), (1500, 160), (2000, 320)];
        for (ts, b) in points {
            w.append(sample(ts, b));
        }
        // `now` is at or past the newest sample, as it is during ingestion
        for now in [2000, 2400, 2500, 2999, 3000, 3001] {
            let expected: u64 = points
                .iter()
                .filter(|(ts, _)| *ts > now - 1000)
                .map(|(_, b)| *b)
                .sum();
            assert_eq!(w.sum_since(now, 1000), expected, "now={now}");
        }
        // boundary: sample at exactly now-1000 is excluded
        assert_eq!(w.sum_since(2000, 1000), 160 + 320);
    }

    #[test]
    fn sum_includes_bytes_sent() {
        let mut w = RetentionWindow::new();
        w.append(ByteSample { bytes_received: 5, bytes_sent: 7, timestamp_ms: 10, entity_id: 1 });
        assert_eq!(w.sum_since(10, 1000), 12);
    }

    #[test]
    fn prune_drops_samples_at_or_before_cutoff() {
        let mut w = RetentionWindow::new();
        w.append(sample(0, 1));
        w.append(sample(1, 1));
        w.append(sample(60_001, 1));
        let dropped = w.prune(60_001);
        assert_eq!(dropped, 2);
        assert_eq!(w.iter().count(), 1);
        assert!(w.iter().all(|s| s.timestamp_ms > 60_001 - RETENTION_MS));
    }

    #[test]
    fn prune_after_ten_thousand_samples_keeps_last_minute() {
        let mut w = RetentionWindow::new();
        // one sample every 10ms => 100_000ms of traffic
        for i in 0..10_000i64 {
            w.append(sample(i * 10, 1));
            w.prune(i * 10);
        }
        let latest = w.latest_timestamp().unwrap();
        assert_eq!(latest, 99_990);
        assert!(w.iter().all(|s| s.timestamp_ms > latest - RETENTION_MS));
        // (99_990 - 60_000, 99_990] at 10ms spacing
        assert_eq!(w.iter().count(), 6000);
    }

    #[test]
    fn late_sample_is_raised_to_tail_and_pruned_on_time() {
        let mut w = RetentionWindow::new();
        assert_eq!(w.append(sample(100_000, 1)), 100_000);
        assert_eq!(w.append(sample(0, 2)), 100_000);
        assert_eq!(w.append(sample(100_001, 4)), 100_001);
        let kept: Vec<_> = w.iter().map(|s| s.timestamp_ms).collect();
        assert_eq!(kept, vec![100_000, 100_000, 100_001]);

        w.prune(160_000);
        assert_eq!(w.iter().map(|s| s.timestamp_ms).collect::<Vec<_>>(), vec![100_001]);
        assert_eq!(w.sum_since(160_000, 1000), 0);
    }
}
