use crate::config::{Defaults, TargetConfig};
use crate::recovery::RecoveryController;
use crate::store::{ScheduleRecord, WindowRecord};
use crate::util::day_offset_secs;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;

const MAX_HIT_HISTORY: usize = 512;

#[derive(Debug)]
struct TargetSchedule {
    min_interval_secs: u64,
    windows: Vec<WindowRecord>,
    last_fetch_secs: u64,
    hits: Vec<u64>,
}

/// Multi-window scheduler that learns per-target publish rhythms.
///
/// A target is due when it is recovery-eligible, outside its minimum
/// inter-fetch interval, inside one of its windows (an empty window set
/// means always eligible), and not currently dispatched. Window weights are
/// nudged toward windows that historically preceded new content; the
/// weights for a target always sum to `Defaults::WEIGHT_NORM`.
pub struct AdaptiveScheduler {
    targets: DashMap<String, Mutex<TargetSchedule>>,
    /// Targets currently owned by a worker; removed from the due set the
    /// instant they are dispatched and re-admitted when the cycle completes.
    in_flight: DashSet<String>,
    /// One-shot operator overrides consumed on the next dispatch.
    forced: DashSet<String>,
    learning_rate: f64,
}

impl AdaptiveScheduler {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            targets: DashMap::new(),
            in_flight: DashSet::new(),
            forced: DashSet::new(),
            learning_rate,
        }
    }

    /// Register a configured target with equal starting weights. Keeps any
    /// already-seeded state.
    pub fn register(&self, config: &TargetConfig) {
        if self.targets.contains_key(&config.key) {
            return;
        }

        let count = config.windows.len();
        let windows = config
            .windows
            .iter()
            .map(|w| WindowRecord {
                start_offset_secs: w.start_offset_secs,
                duration_secs: w.duration_secs,
                weight: Defaults::WEIGHT_NORM / count as f64,
            })
            .collect();

        self.targets.insert(
            config.key.clone(),
            Mutex::new(TargetSchedule {
                min_interval_secs: config.min_interval_secs,
                windows,
                last_fetch_secs: 0,
                hits: Vec::new(),
            }),
        );
    }

    /// Restore persisted schedule state, overriding registered defaults.
    pub fn seed(&self, target: &str, record: ScheduleRecord) {
        if let Some(entry) = self.targets.get(target) {
            let mut schedule = entry.lock();
            if !record.windows.is_empty() {
                schedule.windows = record.windows;
            }
            schedule.last_fetch_secs = record.last_fetch_secs;
            schedule.hits = record.hits;
        }
    }

    /// Targets eligible for dispatch right now, best window weight first so
    /// a bounded worker pool drains the most promising targets first.
    pub fn due_targets(&self, now_secs: u64, recovery: &RecoveryController) -> Vec<String> {
        let mut due: Vec<(String, f64)> = Vec::new();

        for entry in self.targets.iter() {
            let key = entry.key();
            if self.in_flight.contains(key) {
                continue;
            }
            if !recovery.is_eligible(key, now_secs) {
                continue;
            }

            let schedule = entry.value().lock();
            let forced = self.forced.contains(key);

            if !forced {
                let elapsed = now_secs.saturating_sub(schedule.last_fetch_secs);
                if schedule.last_fetch_secs != 0 && elapsed < schedule.min_interval_secs {
                    continue;
                }
            }

            let weight = match containing_window(&schedule.windows, now_secs) {
                Some(idx) => schedule.windows[idx].weight,
                // No windows configured yet means always eligible.
                None if schedule.windows.is_empty() => Defaults::WEIGHT_NORM,
                None => {
                    if forced {
                        Defaults::WEIGHT_NORM
                    } else {
                        continue;
                    }
                }
            };

            due.push((key.clone(), weight));
        }

        due.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        due.into_iter().map(|(key, _)| key).collect()
    }

    /// Claim a target for one fetch cycle. Returns false if another worker
    /// already owns it, so no two workers ever overlap on one target.
    pub fn mark_dispatched(&self, target: &str) -> bool {
        let claimed = self.in_flight.insert(target.to_string());
        if claimed {
            self.forced.remove(target);
        }
        claimed
    }

    /// Release a target after its cycle finished (success or failure) and
    /// stamp the fetch time for the min-interval gate.
    pub fn complete_cycle(&self, target: &str, now_secs: u64) {
        if let Some(entry) = self.targets.get(target) {
            entry.lock().last_fetch_secs = now_secs;
        }
        self.in_flight.remove(target);
    }

    /// Feed the window-learning update.
    ///
    /// Only `had_new_content = true` moves weights: the window containing
    /// `now` gains a learning-rate fraction of its remaining budget, taken
    /// proportionally from all other windows so the sum stays constant.
    /// Absence of new content is expected most of the time and is not
    /// evidence against a window.
    pub fn record_outcome(&self, target: &str, now_secs: u64, had_new_content: bool) {
        if !had_new_content {
            return;
        }

        let Some(entry) = self.targets.get(target) else {
            return;
        };
        let mut schedule = entry.lock();

        schedule.hits.push(now_secs);
        if schedule.hits.len() > MAX_HIT_HISTORY {
            let overflow = schedule.hits.len() - MAX_HIT_HISTORY;
            schedule.hits.drain(0..overflow);
        }

        let Some(idx) = containing_window(&schedule.windows, now_secs) else {
            return;
        };

        let current = schedule.windows[idx].weight;
        let delta = self.learning_rate * (Defaults::WEIGHT_NORM - current);
        let others_total: f64 = schedule
            .windows
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != idx)
            .map(|(_, w)| w.weight)
            .sum();

        if others_total <= f64::EPSILON {
            return; // Single window (or all budget already here): nothing to shift.
        }

        for (i, window) in schedule.windows.iter_mut().enumerate() {
            if i == idx {
                window.weight += delta;
            } else {
                window.weight -= delta * window.weight / others_total;
            }
        }
    }

    /// One-shot operator override: make the target due on the next tick,
    /// ignoring windows and the minimum interval (suspension still applies).
    pub fn force_schedule(&self, target: &str) {
        self.forced.insert(target.to_string());
    }

    /// Snapshot for persistence and status output.
    pub fn export(&self, target: &str) -> Option<ScheduleRecord> {
        self.targets.get(target).map(|entry| {
            let schedule = entry.lock();
            ScheduleRecord {
                windows: schedule.windows.clone(),
                last_fetch_secs: schedule.last_fetch_secs,
                hits: schedule.hits.clone(),
            }
        })
    }

    pub fn target_keys(&self) -> Vec<String> {
        self.targets.iter().map(|e| e.key().clone()).collect()
    }

    #[cfg(test)]
    fn weights(&self, target: &str) -> Vec<f64> {
        self.targets
            .get(target)
            .map(|e| e.lock().windows.iter().map(|w| w.weight).collect())
            .unwrap_or_default()
    }
}

/// Index of the window containing `now`, handling windows that wrap past
/// midnight.
fn containing_window(windows: &[WindowRecord], now_secs: u64) -> Option<usize> {
    let offset = day_offset_secs(now_secs);
    windows.iter().position(|w| {
        let end = w.start_offset_secs + w.duration_secs;
        if end <= 86_400 {
            offset >= w.start_offset_secs && offset < end
        } else {
            offset >= w.start_offset_secs || offset < end % 86_400
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RecoveryConfig, WindowConfig};
    use crate::detector::Classification;

    fn recovery() -> RecoveryController {
        RecoveryController::new(RecoveryConfig::default())
    }

    fn target(key: &str, min_interval_secs: u64, windows: Vec<WindowConfig>) -> TargetConfig {
        TargetConfig {
            key: key.to_string(),
            url: format!("https://{}.example.gov/list", key),
            min_interval_secs,
            expected_anchor: None,
            windows,
        }
    }

    fn assert_weight_sum(scheduler: &AdaptiveScheduler, key: &str) {
        let sum: f64 = scheduler.weights(key).iter().sum();
        assert!(
            (sum - Defaults::WEIGHT_NORM).abs() < 1e-9,
            "weights sum {} != {}",
            sum,
            Defaults::WEIGHT_NORM
        );
    }

    #[test]
    fn test_min_interval_timeline() {
        let scheduler = AdaptiveScheduler::new(0.2);
        let rc = recovery();
        scheduler.register(&target("board-a", 60, Vec::new()));
        let t = 1_000_000;

        // Fresh target with no history and no windows: due immediately.
        assert!(scheduler.due_targets(t, &rc).contains(&"board-a".to_string()));

        assert!(scheduler.mark_dispatched("board-a"));
        // Dispatched: out of the due set until the cycle completes.
        assert!(scheduler.due_targets(t, &rc).is_empty());

        scheduler.complete_cycle("board-a", t);
        assert!(scheduler.due_targets(t + 1, &rc).is_empty());
        assert!(scheduler
            .due_targets(t + 61, &rc)
            .contains(&"board-a".to_string()));
    }

    #[test]
    fn test_no_double_dispatch() {
        let scheduler = AdaptiveScheduler::new(0.2);
        scheduler.register(&target("board-a", 60, Vec::new()));

        assert!(scheduler.mark_dispatched("board-a"));
        assert!(!scheduler.mark_dispatched("board-a"));
        scheduler.complete_cycle("board-a", 10);
        assert!(scheduler.mark_dispatched("board-a"));
    }

    #[test]
    fn test_windows_gate_eligibility() {
        let scheduler = AdaptiveScheduler::new(0.2);
        let rc = recovery();
        // Window 08:00-10:00 UTC.
        scheduler.register(&target(
            "board-a",
            60,
            vec![WindowConfig {
                start_offset_secs: 8 * 3_600,
                duration_secs: 2 * 3_600,
            }],
        ));

        let midnight = 1_700_006_400; // Some epoch at 00:00 UTC.
        assert_eq!(crate::util::day_offset_secs(midnight), 0);

        assert!(scheduler.due_targets(midnight + 3_600, &rc).is_empty());
        assert!(!scheduler
            .due_targets(midnight + 9 * 3_600, &rc)
            .is_empty());
    }

    #[test]
    fn test_wraparound_window() {
        let windows = vec![WindowRecord {
            start_offset_secs: 23 * 3_600,
            duration_secs: 2 * 3_600,
            weight: 1.0,
        }];
        // 23:30 is inside, 00:30 is inside, 02:00 is not.
        assert_eq!(containing_window(&windows, 23 * 3_600 + 1_800), Some(0));
        assert_eq!(containing_window(&windows, 1_800), Some(0));
        assert_eq!(containing_window(&windows, 2 * 3_600), None);
    }

    #[test]
    fn test_weights_sum_invariant_through_learning() {
        let scheduler = AdaptiveScheduler::new(0.2);
        scheduler.register(&target(
            "board-a",
            60,
            vec![
                WindowConfig {
                    start_offset_secs: 0,
                    duration_secs: 4 * 3_600,
                },
                WindowConfig {
                    start_offset_secs: 8 * 3_600,
                    duration_secs: 4 * 3_600,
                },
                WindowConfig {
                    start_offset_secs: 16 * 3_600,
                    duration_secs: 4 * 3_600,
                },
            ],
        ));
        assert_weight_sum(&scheduler, "board-a");

        // Hammer one window with hits; the sum must never drift.
        let hit_time = 9 * 3_600; // Inside the second window.
        for day in 0..50 {
            scheduler.record_outcome("board-a", day * 86_400 + hit_time, true);
            assert_weight_sum(&scheduler, "board-a");
        }

        let weights = scheduler.weights("board-a");
        assert!(weights[1] > weights[0]);
        assert!(weights[1] > weights[2]);
        assert!(weights[1] > 0.9); // Converges toward the hit window.
    }

    #[test]
    fn test_no_new_content_never_moves_weights() {
        let scheduler = AdaptiveScheduler::new(0.2);
        scheduler.register(&target(
            "board-a",
            60,
            vec![
                WindowConfig {
                    start_offset_secs: 0,
                    duration_secs: 43_200,
                },
                WindowConfig {
                    start_offset_secs: 43_200,
                    duration_secs: 43_200,
                },
            ],
        ));

        let before = scheduler.weights("board-a");
        for i in 0..100 {
            scheduler.record_outcome("board-a", i * 1_000, false);
        }
        assert_eq!(scheduler.weights("board-a"), before);
    }

    #[test]
    fn test_backoff_target_not_due() {
        let scheduler = AdaptiveScheduler::new(0.2);
        let rc = recovery();
        scheduler.register(&target("board-a", 60, Vec::new()));

        rc.record("board-a", Classification::Blocked, 1_000);
        assert!(scheduler.due_targets(1_001, &rc).is_empty());
    }

    #[test]
    fn test_force_schedule_bypasses_interval_and_windows() {
        let scheduler = AdaptiveScheduler::new(0.2);
        let rc = recovery();
        scheduler.register(&target(
            "board-a",
            3_600,
            vec![WindowConfig {
                start_offset_secs: 8 * 3_600,
                duration_secs: 3_600,
            }],
        ));

        let midnight = 1_700_006_400;
        scheduler.complete_cycle("board-a", midnight);

        // Outside the window and inside the min interval: not due.
        assert!(scheduler.due_targets(midnight + 60, &rc).is_empty());

        scheduler.force_schedule("board-a");
        assert!(!scheduler.due_targets(midnight + 60, &rc).is_empty());

        // The override is consumed by dispatch.
        assert!(scheduler.mark_dispatched("board-a"));
        scheduler.complete_cycle("board-a", midnight + 61);
        assert!(scheduler.due_targets(midnight + 120, &rc).is_empty());
    }

    #[test]
    fn test_export_round_trip_through_seed() {
        let scheduler = AdaptiveScheduler::new(0.2);
        scheduler.register(&target(
            "board-a",
            60,
            vec![WindowConfig {
                start_offset_secs: 0,
                duration_secs: 43_200,
            }],
        ));
        scheduler.record_outcome("board-a", 3_600, true);
        scheduler.complete_cycle("board-a", 4_000);

        let exported = scheduler.export("board-a").unwrap();
        assert_eq!(exported.last_fetch_secs, 4_000);
        assert_eq!(exported.hits, vec![3_600]);

        let restored = AdaptiveScheduler::new(0.2);
        restored.register(&target(
            "board-a",
            60,
            vec![WindowConfig {
                start_offset_secs: 0,
                duration_secs: 43_200,
            }],
        ));
        restored.seed("board-a", exported);
        assert_eq!(restored.export("board-a").unwrap().hits, vec![3_600]);
    }
}
