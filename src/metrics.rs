use std::fmt::Debug;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeCounts {
    pub items:              usize,
    pub keys_written:       usize,
    pub relationship_names: usize,
    /// Attribute writes skipped because the stored digest matched.
    pub skipped_writes:     usize,
    pub operations:         usize,
    pub batches:            usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictCounts {
    pub items:        usize,
    pub keys_deleted: usize,
    pub operations:   usize,
    pub batches:      usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetCounts {
    pub items:              usize,
    pub requested:          usize,
    pub keys_requested:     usize,
    pub relationship_names: usize,
    pub batches:            usize,
}

/// Observer of backend activity. All methods default to no-ops.
pub trait CacheMetrics: Debug + Send + Sync + 'static {
    fn merge(&self, _prefix: &str, _data_type: &str, _counts: &MergeCounts) {}
    fn evict(&self, _prefix: &str, _data_type: &str, _counts: &EvictCounts) {}
    fn get(&self, _prefix: &str, _data_type: &str, _counts: &GetCounts) {}
    /// A cache result of `source` was rejected because `id` of `data_type` failed key validation.
    fn rejected_result(&self, _source: &str, _data_type: &str, _id: &str) {}
}

#[derive(Debug, Default)]
pub struct NoopMetrics;

impl CacheMetrics for NoopMetrics {}

/// Running totals of backend activity.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    merged_items:   AtomicU64,
    keys_written:   AtomicU64,
    skipped_writes: AtomicU64,
    evicted_items:  AtomicU64,
    read_items:     AtomicU64,
    rejected:       AtomicU64,
}

impl CountingMetrics {
    pub fn merged_items(&self) -> u64 {
        self.merged_items.load(Ordering::Relaxed)
    }

    pub fn keys_written(&self) -> u64 {
        self.keys_written.load(Ordering::Relaxed)
    }

    pub fn skipped_writes(&self) -> u64 {
        self.skipped_writes.load(Ordering::Relaxed)
    }

    pub fn evicted_items(&self) -> u64 {
        self.evicted_items.load(Ordering::Relaxed)
    }

    pub fn read_items(&self) -> u64 {
        self.read_items.load(Ordering::Relaxed)
    }

    pub fn rejected_results(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl CacheMetrics for CountingMetrics {
    fn merge(&self, _prefix: &str, _data_type: &str, counts: &MergeCounts) {
        self.merged_items.fetch_add(counts.items as u64, Ordering::Relaxed);
        self.keys_written
            .fetch_add(counts.keys_written as u64, Ordering::Relaxed);
        self.skipped_writes
            .fetch_add(counts.skipped_writes as u64, Ordering::Relaxed);
    }

    fn evict(&self, _prefix: &str, _data_type: &str, counts: &EvictCounts) {
        self.evicted_items.fetch_add(counts.items as u64, Ordering::Relaxed);
    }

    fn get(&self, _prefix: &str, _data_type: &str, counts: &GetCounts) {
        self.read_items.fetch_add(counts.items as u64, Ordering::Relaxed);
    }

    fn rejected_result(&self, _source: &str, _data_type: &str, _id: &str) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }
}
