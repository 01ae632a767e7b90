use crate::config::Defaults;
use crate::fetch::{FetchResult, TransportError};
use dashmap::DashMap;
use parking_lot::Mutex;

/// Outcome of classifying one fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    /// Structurally valid but suspiciously thin - a soft signal that
    /// escalates slower than a hard block.
    Empty,
    Blocked,
}

/// Rolling body-size baseline for one target (count-weighted average).
#[derive(Debug, Default)]
struct BodyBaseline {
    avg_len: f64,
    samples: u64,
}

impl BodyBaseline {
    fn observe(&mut self, body_len: usize) {
        self.samples += 1;
        if self.samples == 1 {
            self.avg_len = body_len as f64;
        } else {
            self.avg_len =
                (self.avg_len * (self.samples - 1) as f64 + body_len as f64) / self.samples as f64;
        }
    }

    fn is_anomalously_small(&self, body_len: usize) -> bool {
        self.samples >= Defaults::BASELINE_MIN_SAMPLES
            && (body_len as f64) < self.avg_len * Defaults::SMALL_BODY_FRACTION
    }
}

/// Body substrings that identify a challenge/captcha interstitial.
const CHALLENGE_SIGNATURES: &[&str] = &[
    "captcha",
    "cf-browser-verification",
    "cf_chl_opt",
    "are you a robot",
    "verify you are human",
    "unusual traffic",
    "access denied",
    "request blocked",
    "attention required",
];

/// URL markers of a redirect onto a challenge page.
const CHALLENGE_URL_MARKERS: &[&str] = &["captcha", "challenge", "/denied", "/blocked"];

/// HTTP statuses treated as automated-access rejection.
const CHALLENGE_STATUSES: &[u16] = &[403, 429, 503];

/// Classifies fetch results as success, soft-empty, or blocked.
///
/// Classification is a pure function of the result plus a small rolling
/// body-size baseline per target; the baseline is only fed on the success
/// path via `observe_success`, never from inside `classify`.
pub struct BlockDetector {
    baselines: DashMap<String, Mutex<BodyBaseline>>,
}

impl BlockDetector {
    pub fn new() -> Self {
        Self {
            baselines: DashMap::new(),
        }
    }

    /// Classify one fetch attempt. First match wins:
    /// 1. transport failure after a known-good access this session -> Blocked
    /// 2. challenge status, challenge redirect, or body signature -> Blocked
    /// 3. anchor absent and body anomalously small vs baseline -> Empty
    /// 4. otherwise -> Success
    ///
    /// Returns the classification plus a short evidence summary for the
    /// block-event log.
    pub fn classify(
        &self,
        target: &str,
        outcome: &Result<FetchResult, TransportError>,
        had_prior_success: bool,
        expected_anchor: Option<&str>,
    ) -> (Classification, String) {
        let result = match outcome {
            Err(transport) => {
                // Transient blips were already absorbed by the fetcher's own
                // retry; a sudden failure after known-good access is a block
                // signal, not a network hiccup.
                return if had_prior_success {
                    (
                        Classification::Blocked,
                        format!("transport failure after prior success: {}", transport),
                    )
                } else {
                    (
                        Classification::Empty,
                        format!("transport failure with no session history: {}", transport),
                    )
                };
            }
            Ok(result) => result,
        };

        if CHALLENGE_STATUSES.contains(&result.status) {
            return (
                Classification::Blocked,
                format!("challenge status {}", result.status),
            );
        }

        let final_url = result.final_url.to_lowercase();
        if let Some(marker) = CHALLENGE_URL_MARKERS
            .iter()
            .find(|m| final_url.contains(*m))
        {
            return (
                Classification::Blocked,
                format!("redirected to challenge URL (matched {:?})", marker),
            );
        }

        let body = result.body.to_lowercase();
        if let Some(signature) = CHALLENGE_SIGNATURES.iter().find(|s| body.contains(*s)) {
            return (
                Classification::Blocked,
                format!("challenge signature {:?} in body", signature),
            );
        }

        let anchor_missing = expected_anchor
            .map(|anchor| !result.body.contains(anchor))
            .unwrap_or(false);
        if anchor_missing {
            let small = self
                .baselines
                .get(target)
                .map(|b| b.lock().is_anomalously_small(result.body.len()))
                .unwrap_or(false);
            if small {
                return (
                    Classification::Empty,
                    format!(
                        "anchor absent and body {} bytes below baseline",
                        result.body.len()
                    ),
                );
            }
        }

        (Classification::Success, String::new())
    }

    /// Feed the rolling baseline from a successful fetch.
    pub fn observe_success(&self, target: &str, body_len: usize) {
        self.baselines
            .entry(target.to_string())
            .or_default()
            .lock()
            .observe(body_len);
    }

    #[cfg(test)]
    fn baseline_avg(&self, target: &str) -> Option<f64> {
        self.baselines.get(target).map(|b| b.lock().avg_len)
    }
}

impl Default for BlockDetector {
    fn default() -> Self {
        Self::new()
    }
}
