use crate::config::PacingConfig;
use parking_lot::Mutex;
use rand::Rng;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct FatigueState {
    consecutive: u32,
    last_call: Option<Instant>,
}

/// Produces human-looking wait durations instead of fixed or uniform sleeps.
///
/// Each delay is a short uniform base wait plus an exponentially distributed
/// "idle" component, so the sequence of delays is heavy-tailed rather than
/// periodic. A fatigue factor stretches the mean after many calls in a short
/// wall-clock span and decays back to baseline after an idle gap.
pub struct DelayModel {
    config: PacingConfig,
    fatigue: Mutex<FatigueState>,
}

impl DelayModel {
    pub fn new(config: PacingConfig) -> Self {
        Self {
            config,
            fatigue: Mutex::new(FatigueState {
                consecutive: 0,
                last_call: None,
            }),
        }
    }

    /// Next inter-request wait, always clamped to [min_ms, max_ms].
    pub fn next_delay(&self) -> Duration {
        let factor = self.bump_fatigue(Instant::now());
        let mut rng = rand::thread_rng();

        // Uniform jitter around the base wait.
        let half = (self.config.base_ms / 2).max(1);
        let lo = self.config.base_ms.saturating_sub(half);
        let base = rng.gen_range(lo..=self.config.base_ms + half) as f64;

        // Exponential idle component via inverse-transform sampling.
        let u: f64 = rng.gen();
        let idle = -(self.config.idle_mean_ms as f64) * (1.0 - u).ln();

        let total_ms = (base + idle) * factor;
        let clamped = total_ms.clamp(self.config.min_ms as f64, self.config.max_ms as f64);
        Duration::from_millis(clamped as u64)
    }

    /// Advance the fatigue state for a call happening at `now` and return
    /// the current delay multiplier.
    fn bump_fatigue(&self, now: Instant) -> f64 {
        let mut state = self.fatigue.lock();

        let within_window = state
            .last_call
            .map(|prev| {
                now.duration_since(prev).as_secs() < self.config.fatigue_window_secs.max(1)
            })
            .unwrap_or(false);

        if within_window {
            state.consecutive = state.consecutive.saturating_add(1);
        } else {
            // Idle gap: back to baseline.
            state.consecutive = 0;
        }
        state.last_call = Some(now);

        (1.0 + state.consecutive as f64 * self.config.fatigue_step)
            .min(self.config.fatigue_max_factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PacingConfig {
        PacingConfig {
            min_ms: 100,
            max_ms: 5_000,
            base_ms: 300,
            idle_mean_ms: 800,
            fatigue_window_secs: 60,
            fatigue_step: 0.25,
            fatigue_max_factor: 2.0,
        }
    }

    #[test]
    fn test_zero_base_stays_in_bounds() {
        let mut c = config();
        c.base_ms = 0;
        let model = DelayModel::new(c);
        for _ in 0..200 {
            let d = model.next_delay();
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(5_000));
        }
    }

    #[test]
    fn test_delays_always_within_bounds() {
        let model = DelayModel::new(config());
        for _ in 0..500 {
            let d = model.next_delay();
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(5_000));
        }
    }

    #[test]
    fn test_delays_are_not_constant() {
        let model = DelayModel::new(config());
        let samples: Vec<u128> = (0..50).map(|_| model.next_delay().as_millis()).collect();
        let first = samples[0];
        assert!(samples.iter().any(|&s| s != first));
    }

    #[test]
    fn test_fatigue_grows_within_window_and_caps() {
        let model = DelayModel::new(config());
        let start = Instant::now();

        let mut last = model.bump_fatigue(start);
        for i in 1..20 {
            let f = model.bump_fatigue(start + Duration::from_secs(i));
            assert!(f >= last);
            last = f;
        }
        assert_eq!(last, 2.0); // Capped at fatigue_max_factor.
    }

    #[test]
    fn test_fatigue_decays_after_idle_gap() {
        let model = DelayModel::new(config());
        let start = Instant::now();

        model.bump_fatigue(start);
        model.bump_fatigue(start + Duration::from_secs(1));
        let tired = model.bump_fatigue(start + Duration::from_secs(2));
        assert!(tired > 1.0);

        // Longer than the fatigue window: back to baseline.
        let rested = model.bump_fatigue(start + Duration::from_secs(200));
        assert_eq!(rested, 1.0);
    }
}
