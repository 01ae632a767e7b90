use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Tuning constants - single source of truth.
///
/// The pacing and identity numbers are empirically tuned, not derived from a
/// statistical model; everything here can be overridden from the config file.
pub struct Defaults;

impl Defaults {
    // Control loop
    pub const WORKERS: usize = 4;
    pub const TICK_INTERVAL_MS: u64 = 1_000;

    // Scheduling
    pub const MIN_INTERVAL_SECS: u64 = 300;
    pub const WINDOW_LEARNING_RATE: f64 = 0.2;
    /// Window weights per target always sum to this.
    pub const WEIGHT_NORM: f64 = 1.0;

    // Identity pool
    pub const IDENTITY_COOLDOWN_SECS: u64 = 1_800;
    pub const DEPRIORITIZE_RATIO: f64 = 0.5;

    // Behavioral pacing
    pub const DELAY_MIN_MS: u64 = 800;
    pub const DELAY_MAX_MS: u64 = 45_000;
    pub const DELAY_BASE_MS: u64 = 1_200;
    pub const DELAY_IDLE_MEAN_MS: u64 = 4_000;
    pub const FATIGUE_WINDOW_SECS: u64 = 120;
    pub const FATIGUE_STEP: f64 = 0.15;
    pub const FATIGUE_MAX_FACTOR: f64 = 3.0;

    // Recovery
    pub const BACKOFF_BASE_MS: u64 = 60_000;
    pub const BACKOFF_MAX_MS: u64 = 6 * 3_600 * 1_000;
    pub const BACKOFF_JITTER_PERCENT: u64 = 10;
    pub const EMPTY_ESCALATION_THRESHOLD: u32 = 3;
    pub const FAILURE_CEILING: u32 = 5;
    pub const BLOCK_LOG_CAP: usize = 64;

    // Block detection
    pub const BASELINE_MIN_SAMPLES: u64 = 3;
    pub const SMALL_BODY_FRACTION: f64 = 0.3;

    // Sessions
    pub const SESSION_FRESHNESS_SECS: u64 = 6 * 3_600;

    // HTTP
    pub const FETCH_TIMEOUT_SECS: u64 = 30;
    pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("No valid targets after validation")]
    NoValidTargets,

    #[error("Invalid pacing configuration: {0}")]
    InvalidPacing(String),
}

/// One recurring time-of-day window a target can be scheduled against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Seconds after midnight UTC.
    pub start_offset_secs: u64,
    pub duration_secs: u64,
}

/// A single crawl source (one government site/board).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub key: String,
    pub url: String,
    #[serde(default = "default_min_interval")]
    pub min_interval_secs: u64,
    /// Substring that must appear in a real listing page body; its absence
    /// on a small response is the soft-empty signal.
    #[serde(default)]
    pub expected_anchor: Option<String>,
    #[serde(default)]
    pub windows: Vec<WindowConfig>,
}

fn default_min_interval() -> u64 {
    Defaults::MIN_INTERVAL_SECS
}

/// One fetch persona in the identity catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub user_agent: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default = "default_viewport")]
    pub viewport: (u32, u32),
    #[serde(default = "default_locale")]
    pub locale: String,
    /// Optional network egress hint (proxy URL) for the fetcher.
    #[serde(default)]
    pub proxy: Option<String>,
}

fn default_viewport() -> (u32, u32) {
    (1920, 1080)
}

fn default_locale() -> String {
    "en-US".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    pub min_ms: u64,
    pub max_ms: u64,
    pub base_ms: u64,
    pub idle_mean_ms: u64,
    pub fatigue_window_secs: u64,
    pub fatigue_step: f64,
    pub fatigue_max_factor: f64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_ms: Defaults::DELAY_MIN_MS,
            max_ms: Defaults::DELAY_MAX_MS,
            base_ms: Defaults::DELAY_BASE_MS,
            idle_mean_ms: Defaults::DELAY_IDLE_MEAN_MS,
            fatigue_window_secs: Defaults::FATIGUE_WINDOW_SECS,
            fatigue_step: Defaults::FATIGUE_STEP,
            fatigue_max_factor: Defaults::FATIGUE_MAX_FACTOR,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_jitter_percent: u64,
    /// Consecutive EMPTY results treated as one BLOCKED.
    pub empty_escalation_threshold: u32,
    /// Consecutive failures before SUSPENDED.
    pub failure_ceiling: u32,
    pub block_log_cap: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: Defaults::BACKOFF_BASE_MS,
            backoff_max_ms: Defaults::BACKOFF_MAX_MS,
            backoff_jitter_percent: Defaults::BACKOFF_JITTER_PERCENT,
            empty_escalation_threshold: Defaults::EMPTY_ESCALATION_THRESHOLD,
            failure_ceiling: Defaults::FAILURE_CEILING,
            block_log_cap: Defaults::BLOCK_LOG_CAP,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub cooldown_secs: u64,
    pub deprioritize_ratio: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: Defaults::IDENTITY_COOLDOWN_SECS,
            deprioritize_ratio: Defaults::DEPRIORITIZE_RATIO,
        }
    }
}

/// Top-level controller configuration loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub identities: Vec<IdentityConfig>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default = "default_learning_rate")]
    pub window_learning_rate: f64,
    #[serde(default = "default_session_freshness")]
    pub session_freshness_secs: u64,
}

fn default_workers() -> usize {
    Defaults::WORKERS
}

fn default_learning_rate() -> f64 {
    Defaults::WINDOW_LEARNING_RATE
}

fn default_session_freshness() -> u64 {
    Defaults::SESSION_FRESHNESS_SECS
}

impl ControllerConfig {
    /// Load and validate configuration.
    ///
    /// A missing or unparsable file is fatal. An invalid individual target
    /// only drops that target from participation; the rest keep running.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: ControllerConfig = serde_json::from_str(&raw)?;
        validate_pacing(&config.pacing).map_err(ConfigError::InvalidPacing)?;
        config.targets = validate_targets(std::mem::take(&mut config.targets));
        if config.targets.is_empty() {
            return Err(ConfigError::NoValidTargets);
        }
        Ok(config)
    }
}

/// Pacing bounds are consumed by every fetch cycle, so a bad set is fatal at
/// startup rather than skippable.
fn validate_pacing(p: &PacingConfig) -> Result<(), String> {
    if p.base_ms == 0 {
        return Err("base_ms must be positive".to_string());
    }
    if p.min_ms > p.max_ms {
        return Err(format!(
            "min_ms {} exceeds max_ms {}",
            p.min_ms, p.max_ms
        ));
    }
    Ok(())
}

/// Drop malformed target entries, logging each rejection.
fn validate_targets(targets: Vec<TargetConfig>) -> Vec<TargetConfig> {
    targets
        .into_iter()
        .filter(|t| match validate_target(t) {
            Ok(()) => true,
            Err(reason) => {
                tracing::error!(target_key = %t.key, %reason, "Dropping invalid target definition");
                false
            }
        })
        .collect()
}

fn validate_target(t: &TargetConfig) -> Result<(), String> {
    if t.key.is_empty() {
        return Err("empty target key".to_string());
    }
    if !(t.url.starts_with("http://") || t.url.starts_with("https://")) {
        return Err(format!("URL has no http(s) scheme: {}", t.url));
    }
    if t.min_interval_secs == 0 {
        return Err("min_interval_secs must be positive".to_string());
    }
    for w in &t.windows {
        if w.start_offset_secs >= 86_400 {
            return Err(format!(
                "window start offset {} beyond one day",
                w.start_offset_secs
            ));
        }
        if w.duration_secs == 0 || w.duration_secs > 86_400 {
            return Err(format!("window duration {} out of range", w.duration_secs));
        }
    }
    Ok(())
}
