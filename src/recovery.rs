use crate::config::RecoveryConfig;
use crate::detector::Classification;
use crate::store::{RecoveryRecord, RecoveryStateRecord};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff: `min(max, base * 2^(n-1)) + jitter`, n >= 1.
pub struct ExponentialBackoff {
    base_ms: u64,
    max_ms: u64,
    jitter_percent: u64,
}

impl ExponentialBackoff {
    pub const fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            jitter_percent: 10,
        }
    }

    pub fn with_jitter(mut self, jitter_percent: u64) -> Self {
        self.jitter_percent = jitter_percent;
        self
    }

    /// Delay for the n-th consecutive failure. Non-decreasing in `attempt`
    /// up to the cap; jitter only ever adds on top.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let exponential = self.base_ms.saturating_mul(2u64.saturating_pow(exponent));
        let capped = exponential.min(self.max_ms);
        let jitter = if self.jitter_percent > 0 {
            rand::thread_rng().gen_range(0..capped / self.jitter_percent + 1)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }
}

/// What the controller must do after a recorded outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Nothing notable; keep going.
    None,
    /// Target entered (or deepened) backoff; session must be invalidated
    /// and the next acquire gets a rotated identity.
    EnteredBackoff { attempt: u32, until_secs: u64 },
    /// Failure ceiling hit; target is out until an operator reset.
    Suspended { reason: String },
    /// First success after a bad spell; target is healthy again.
    Recovered,
}

/// Per-target recovery state machine.
///
/// `Healthy` -> `Backoff(attempt, until)` on blocks (or enough consecutive
/// soft-empties), `Suspended` once the consecutive-failure ceiling is hit.
/// An expired backoff only makes the target retry-eligible; it becomes
/// `Healthy` again on the next success. `Suspended` is terminal until
/// `reset_suspended`. Transitions are atomic per target.
pub struct RecoveryController {
    config: RecoveryConfig,
    backoff: ExponentialBackoff,
    targets: DashMap<String, Mutex<RecoveryRecord>>,
}

impl RecoveryController {
    pub fn new(config: RecoveryConfig) -> Self {
        let backoff = ExponentialBackoff::new(config.backoff_base_ms, config.backoff_max_ms)
            .with_jitter(config.backoff_jitter_percent);
        Self {
            config,
            backoff,
            targets: DashMap::new(),
        }
    }

    /// Restore persisted state for a target, e.g. across process restarts.
    pub fn seed(&self, target: &str, record: RecoveryRecord) {
        self.targets.insert(target.to_string(), Mutex::new(record));
    }

    pub fn snapshot(&self, target: &str) -> RecoveryRecord {
        self.targets
            .get(target)
            .map(|entry| entry.lock().clone())
            .unwrap_or_default()
    }

    /// Whether the target may be fetched right now. A target in unexpired
    /// backoff or suspended is never selected for an immediate fetch.
    pub fn is_eligible(&self, target: &str, now_secs: u64) -> bool {
        match self.snapshot(target).state {
            RecoveryStateRecord::Healthy => true,
            RecoveryStateRecord::Backoff { until_secs, .. } => now_secs >= until_secs,
            RecoveryStateRecord::Suspended { .. } => false,
        }
    }

    pub fn is_suspended(&self, target: &str) -> bool {
        matches!(
            self.snapshot(target).state,
            RecoveryStateRecord::Suspended { .. }
        )
    }

    /// Record a classified outcome and return the resulting transition.
    pub fn record(
        &self,
        target: &str,
        classification: Classification,
        now_secs: u64,
    ) -> Transition {
        let entry = self
            .targets
            .entry(target.to_string())
            .or_insert_with(|| Mutex::new(RecoveryRecord::default()));
        let mut record = entry.lock();

        match classification {
            Classification::Success => {
                record.consecutive_failures = 0;
                record.consecutive_empty = 0;
                if record.state == RecoveryStateRecord::Healthy {
                    Transition::None
                } else {
                    record.state = RecoveryStateRecord::Healthy;
                    Transition::Recovered
                }
            }
            Classification::Empty => {
                record.consecutive_empty += 1;
                if record.consecutive_empty >= self.config.empty_escalation_threshold {
                    // Enough consecutive soft signals count as one block.
                    record.consecutive_empty = 0;
                    self.escalate(&mut record, now_secs)
                } else {
                    Transition::None
                }
            }
            Classification::Blocked => {
                // A hard block breaks any running empty streak; the counters
                // track consecutive signals of the same kind.
                record.consecutive_empty = 0;
                self.escalate(&mut record, now_secs)
            }
        }
    }

    fn escalate(&self, record: &mut RecoveryRecord, now_secs: u64) -> Transition {
        record.consecutive_failures += 1;

        if record.consecutive_failures >= self.config.failure_ceiling {
            let reason = "exhausted".to_string();
            record.state = RecoveryStateRecord::Suspended {
                reason: reason.clone(),
            };
            return Transition::Suspended { reason };
        }

        let attempt = record.consecutive_failures;
        let delay = self.backoff.delay(attempt);
        let until_secs = now_secs + delay.as_millis().div_ceil(1_000) as u64;
        record.state = RecoveryStateRecord::Backoff {
            attempt,
            until_secs,
        };
        Transition::EnteredBackoff {
            attempt,
            until_secs,
        }
    }

    /// Operator boundary call: clear a suspension. Returns false when the
    /// target was not suspended.
    pub fn reset_suspended(&self, target: &str) -> bool {
        let entry = self
            .targets
            .entry(target.to_string())
            .or_insert_with(|| Mutex::new(RecoveryRecord::default()));
        let mut record = entry.lock();

        match record.state {
            RecoveryStateRecord::Suspended { .. } => {
                record.state = RecoveryStateRecord::Healthy;
                record.consecutive_failures = 0;
                record.consecutive_empty = 0;
                true
            }
            _ => false,
        }
    }

    /// Operator boundary call: suspend a target externally. In-flight cycles
    /// finish; the scheduler simply stops re-admitting it.
    pub fn suspend(&self, target: &str, reason: &str) {
        let entry = self
            .targets
            .entry(target.to_string())
            .or_insert_with(|| Mutex::new(RecoveryRecord::default()));
        entry.lock().state = RecoveryStateRecord::Suspended {
            reason: reason.to_string(),
        };
    }

}
