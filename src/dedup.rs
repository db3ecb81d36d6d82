// src/dedup.rs
// Rotating deduplication cache. One bucket per segment maps external listing
// IDs to last-seen timestamps; `rotate()` discards every bucket wholesale so
// memory stays bounded and updated listings become eligible for re-emission.
//
// Within one rotation window a worker never emits the same ID twice. A
// listing re-seen right after rotation is emitted again as an update;
// downstream must treat emissions as idempotent upserts.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use metrics::counter;

use crate::catalog::SegmentId;

type Bucket = HashMap<String, DateTime<Utc>>;

/// Shared across all workers. The segment set is fixed at construction, so
/// the outer map is immutable and each segment locks only its own bucket —
/// no cross-segment contention.
#[derive(Debug)]
pub struct DedupCache {
    buckets: HashMap<SegmentId, Mutex<Bucket>>,
}

impl DedupCache {
    pub fn new(segments: impl IntoIterator<Item = SegmentId>) -> Self {
        let buckets = segments
            .into_iter()
            .map(|id| (id, Mutex::new(Bucket::new())))
            .collect();
        Self { buckets }
    }

    /// Has this ID already been emitted within the current rotation window?
    pub fn seen(&self, segment: SegmentId, listing_id: &str) -> bool {
        match self.buckets.get(&segment) {
            Some(bucket) => bucket
                .lock()
                .expect("dedup bucket mutex poisoned")
                .contains_key(listing_id),
            None => false,
        }
    }

    /// Record an ID handed to the sink, accepted or not. It stays suppressed
    /// until the next rotation either way.
    pub fn record(&self, segment: SegmentId, listing_id: &str, ts: DateTime<Utc>) {
        if let Some(bucket) = self.buckets.get(&segment) {
            bucket
                .lock()
                .expect("dedup bucket mutex poisoned")
                .insert(listing_id.to_string(), ts);
        }
    }

    /// Retire every segment's bucket. Buckets are swapped one at a time so a
    /// rotation tick never holds more than one lock.
    pub fn rotate(&self) {
        let mut retired_total = 0usize;
        for bucket in self.buckets.values() {
            let mut guard = bucket.lock().expect("dedup bucket mutex poisoned");
            retired_total += guard.len();
            *guard = Bucket::new();
        }
        counter!("ingest_cache_rotations_total").increment(1);
        tracing::info!(target: "dedup", retired = retired_total, "dedup cache rotated");
    }

    /// Current bucket size for one segment (diagnostics).
    pub fn len(&self, segment: SegmentId) -> usize {
        self.buckets
            .get(&segment)
            .map(|b| b.lock().expect("dedup bucket mutex poisoned").len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(l: u32, c: u32) -> SegmentId {
        SegmentId {
            location_id: l,
            category_id: c,
        }
    }

    #[test]
    fn ids_are_seen_after_record_within_window() {
        let cache = DedupCache::new([seg(1, 1)]);
        assert!(!cache.seen(seg(1, 1), "42"));
        cache.record(seg(1, 1), "42", Utc::now());
        assert!(cache.seen(seg(1, 1), "42"));
        assert_eq!(cache.len(seg(1, 1)), 1);
    }

    #[test]
    fn segments_are_isolated() {
        let cache = DedupCache::new([seg(1, 1), seg(1, 2)]);
        cache.record(seg(1, 1), "42", Utc::now());
        assert!(!cache.seen(seg(1, 2), "42"));
    }

    #[test]
    fn rotation_allows_re_emission() {
        let cache = DedupCache::new([seg(1, 1)]);
        cache.record(seg(1, 1), "42", Utc::now());
        cache.rotate();
        assert!(!cache.seen(seg(1, 1), "42"));
        assert_eq!(cache.len(seg(1, 1)), 0);
        // re-recording captures it in the new bucket
        cache.record(seg(1, 1), "42", Utc::now());
        assert!(cache.seen(seg(1, 1), "42"));
    }

    #[test]
    fn unknown_segment_is_a_noop() {
        let cache = DedupCache::new([seg(1, 1)]);
        cache.record(seg(9, 9), "x", Utc::now());
        assert!(!cache.seen(seg(9, 9), "x"));
        assert_eq!(cache.len(seg(9, 9)), 0);
    }
}
