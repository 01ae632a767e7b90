use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for lock-free metric updates.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Clone for Counter {
    fn clone(&self) -> Self {
        Self {
            value: AtomicU64::new(self.value.load(Ordering::Relaxed)),
        }
    }
}

/// Controller-wide counters, shared across workers via Arc.
#[derive(Debug, Default)]
pub struct Metrics {
    pub cycles_total: Counter,
    pub fetches_ok: Counter,
    pub blocks_detected: Counter,
    pub empty_results: Counter,
    pub suspensions: Counter,
    pub identity_rotations: Counter,
    pub sessions_invalidated: Counter,
    pub new_content_hits: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// One-line operator summary for the status command and shutdown log.
    pub fn summary(&self) -> String {
        format!(
            "cycles={} ok={} blocked={} empty={} suspended={} rotations={} hits={}",
            self.cycles_total.get(),
            self.fetches_ok.get(),
            self.blocks_detected.get(),
            self.empty_results.get(),
            self.suspensions.get(),
            self.identity_rotations.get(),
            self.new_content_hits.get(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_increments() {
        let c = Counter::new();
        c.inc();
        c.add(5);
        assert_eq!(c.get(), 6);
    }

    #[test]
    fn test_metrics_summary_contains_counts() {
        let m = Metrics::new();
        m.cycles_total.add(3);
        m.blocks_detected.inc();
        let s = m.summary();
        assert!(s.contains("cycles=3"));
        assert!(s.contains("blocked=1"));
    }
}
