//! # History Reconciler
//!
//! Merges live samples observed on the connection with batches pulled back
//! from the persisted sample store into one bounded, newest-first window.
//!
//! Window invariants, enforced after every mutation:
//! - non-increasing by timestamp;
//! - no duplicate (timestamp, register) pairs; on a tie the `live` sample
//!   wins over the persisted copy of the same observation;
//! - never more than `cap` entries, excess dropped from the oldest end.

use crate::core::model::{Provenance, TelemetrySample};

/// Default retained window size, matching the dashboard's 100-row view.
pub const DEFAULT_HISTORY_CAP: usize = 100;

/// Bounded, deduplicated, newest-first view of recent samples.
pub struct HistoryReconciler {
    window: Vec<TelemetrySample>,
    cap: usize,
}

impl HistoryReconciler {
    pub fn new(cap: usize) -> Self {
        Self {
            window: Vec::with_capacity(cap.min(1024)),
            cap,
        }
    }

    /// Record a sample observed on the live connection. The only path that
    /// introduces `live`-provenance entries.
    pub fn record_live(&mut self, sample: TelemetrySample) {
        self.insert(sample);
        self.window.truncate(self.cap);
    }

    /// Merge a batch fetched from the persisted store. Idempotent: merging
    /// the same batch twice leaves the window unchanged after the first.
    pub fn merge_persisted(&mut self, samples: Vec<TelemetrySample>) {
        for sample in samples {
            self.insert(sample);
        }
        self.window.truncate(self.cap);
    }

    /// Insert keeping timestamp order, replacing an existing entry with the
    /// same (timestamp, register) key unless that entry is live and the
    /// incoming one is not.
    fn insert(&mut self, sample: TelemetrySample) {
        if let Some(existing) = self.window.iter_mut().find(|s| s.key() == sample.key()) {
            if existing.provenance == Provenance::Live && sample.provenance == Provenance::Persisted
            {
                return;
            }
            *existing = sample;
            return;
        }

        // Newest-first: find the first entry older than (or tied with) the
        // incoming sample and insert in front of it.
        let pos = self
            .window
            .iter()
            .position(|s| s.key() <= sample.key())
            .unwrap_or(self.window.len());
        self.window.insert(pos, sample);
    }

    /// Snapshot of the current window, newest first.
    pub fn snapshot(&self) -> Vec<TelemetrySample> {
        self.window.clone()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }
}

impl Default for HistoryReconciler {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Provenance, SampleValue};
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn sample(secs: i64, register: u16, value: bool, provenance: Provenance) -> TelemetrySample {
        TelemetrySample {
            timestamp: at(secs),
            register,
            value: SampleValue::Bool(value),
            provenance,
        }
    }

    fn assert_invariants(r: &HistoryReconciler) {
        let window = r.snapshot();
        assert!(window.len() <= r.cap());
        for pair in window.windows(2) {
            assert!(pair[0].timestamp >= pair[1].timestamp, "window out of order");
        }
        for (i, a) in window.iter().enumerate() {
            for b in &window[i + 1..] {
                assert_ne!(a.key(), b.key(), "duplicate (timestamp, register) pair");
            }
        }
    }

    #[test]
    fn record_live_keeps_newest_first() {
        let mut r = HistoryReconciler::new(10);
        r.record_live(sample(1, 0x6304, true, Provenance::Live));
        r.record_live(sample(3, 0x6304, false, Provenance::Live));
        r.record_live(sample(2, 0x6304, true, Provenance::Live));

        let window = r.snapshot();
        assert_eq!(window.len(), 3);
        assert_eq!(window[0].timestamp, at(3));
        assert_eq!(window[2].timestamp, at(1));
        assert_invariants(&r);
    }

    #[test]
    fn cap_is_enforced_from_the_oldest_end() {
        let mut r = HistoryReconciler::new(5);
        for i in 0..20 {
            r.record_live(sample(i, 0x6304, true, Provenance::Live));
        }
        assert_eq!(r.len(), 5);
        // The five newest survive.
        assert_eq!(r.snapshot()[0].timestamp, at(19));
        assert_eq!(r.snapshot()[4].timestamp, at(15));
        assert_invariants(&r);
    }

    #[test]
    fn merge_persisted_is_idempotent() {
        let mut r = HistoryReconciler::new(10);
        r.record_live(sample(5, 0x6304, true, Provenance::Live));

        let batch: Vec<_> = (0..4)
            .map(|i| sample(i, 0x6304, false, Provenance::Persisted))
            .collect();

        r.merge_persisted(batch.clone());
        let once = r.snapshot();
        r.merge_persisted(batch);
        let twice = r.snapshot();

        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a.key(), b.key());
            assert_eq!(a.provenance, b.provenance);
        }
        assert_invariants(&r);
    }

    #[test]
    fn live_wins_timestamp_register_ties() {
        let mut r = HistoryReconciler::new(10);
        r.record_live(sample(7, 0x6304, true, Provenance::Live));
        r.merge_persisted(vec![sample(7, 0x6304, false, Provenance::Persisted)]);

        let window = r.snapshot();
        assert_eq!(window.len(), 1);
        assert!(window[0].value.as_bool());
        assert_eq!(window[0].provenance, Provenance::Live);
    }

    #[test]
    fn live_wins_regardless_of_merge_order() {
        let mut r = HistoryReconciler::new(10);
        r.merge_persisted(vec![sample(7, 0x6304, false, Provenance::Persisted)]);
        r.record_live(sample(7, 0x6304, true, Provenance::Live));

        let window = r.snapshot();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].provenance, Provenance::Live);
        assert!(window[0].value.as_bool());
    }

    #[test]
    fn same_timestamp_different_register_both_kept() {
        let mut r = HistoryReconciler::new(10);
        r.record_live(sample(4, 0x6304, true, Provenance::Live));
        r.record_live(sample(4, 0x6305, false, Provenance::Live));
        assert_eq!(r.len(), 2);
        assert_invariants(&r);
    }

    #[test]
    fn merge_interleaves_by_timestamp() {
        let mut r = HistoryReconciler::new(10);
        r.record_live(sample(2, 0x6304, true, Provenance::Live));
        r.record_live(sample(6, 0x6304, true, Provenance::Live));
        r.merge_persisted(vec![
            sample(8, 0x6304, false, Provenance::Persisted),
            sample(4, 0x6304, false, Provenance::Persisted),
            sample(0, 0x6304, false, Provenance::Persisted),
        ]);

        let stamps: Vec<_> = r.snapshot().iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, vec![at(8), at(6), at(4), at(2), at(0)]);
        assert_invariants(&r);
    }

    #[test]
    fn cap_never_exceeded_under_mixed_load() {
        let mut r = HistoryReconciler::new(8);
        for i in 0..30 {
            r.record_live(sample(i, 0x6304, true, Provenance::Live));
            if i % 3 == 0 {
                let batch: Vec<_> = (0..10)
                    .map(|j| sample(i - j, 0x6310, false, Provenance::Persisted))
                    .collect();
                r.merge_persisted(batch);
            }
            assert_invariants(&r);
        }
        assert_eq!(r.len(), 8);
    }
}
