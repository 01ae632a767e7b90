use crate::config::{IdentityConfig, PoolConfig};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Immutable fetch persona. The catalog entry never changes after pool
/// construction; all mutable bookkeeping lives in `IdentityStats`.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: usize,
    pub user_agent: String,
    pub headers: Vec<(String, String)>,
    pub viewport: (u32, u32),
    pub locale: String,
    pub proxy: Option<String>,
}

/// Use counters for one identity. Owned exclusively by the pool; `blocks`
/// can never exceed `uses` because a release always counts a use first.
#[derive(Debug, Default)]
pub struct IdentityStats {
    uses: AtomicU64,
    blocks: AtomicU64,
}

impl IdentityStats {
    pub fn uses(&self) -> u64 {
        self.uses.load(Ordering::Relaxed)
    }

    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    /// Fraction of uses that ended blocked; an unused identity scores 0 so
    /// fresh identities are tried before ones with any history.
    pub fn block_ratio(&self) -> f64 {
        let uses = self.uses();
        if uses == 0 {
            return 0.0;
        }
        self.blocks() as f64 / uses as f64
    }
}

/// Catalog of fetch identities with rotation and avoidance rules.
///
/// Selection prefers the lowest blocks/uses ratio among identities outside
/// the per-target cool-down, ties broken least-recently-used. An identity
/// whose ratio exceeds the deprioritization threshold is only selected when
/// no lower-ratio alternative exists, so a poisoned persona fades out of use
/// without ever starving the pool.
pub struct IdentityPool {
    catalog: Vec<Arc<Identity>>,
    stats: Vec<IdentityStats>,
    /// Global last-acquired stamp per identity, for LRU tie-breaks.
    last_acquired: Vec<AtomicU64>,
    /// Per-target last-acquired stamps, for the cool-down rule.
    target_history: DashMap<String, HashMap<usize, u64>>,
    cooldown_secs: u64,
    deprioritize_ratio: f64,
}

impl IdentityPool {
    pub fn new(identities: Vec<IdentityConfig>, config: &PoolConfig) -> Self {
        let source = if identities.is_empty() {
            builtin_catalog()
        } else {
            identities
        };

        let catalog: Vec<Arc<Identity>> = source
            .into_iter()
            .enumerate()
            .map(|(id, ic)| {
                Arc::new(Identity {
                    id,
                    user_agent: ic.user_agent,
                    headers: ic.headers,
                    viewport: ic.viewport,
                    locale: ic.locale,
                    proxy: ic.proxy,
                })
            })
            .collect();

        let stats = catalog.iter().map(|_| IdentityStats::default()).collect();
        let last_acquired = catalog.iter().map(|_| AtomicU64::new(0)).collect();

        Self {
            catalog,
            stats,
            last_acquired,
            target_history: DashMap::new(),
            cooldown_secs: config.cooldown_secs,
            deprioritize_ratio: config.deprioritize_ratio,
        }
    }

    pub fn len(&self) -> usize {
        self.catalog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }

    /// Select an identity for one fetch cycle against `target`.
    ///
    /// Identities used for this target within the cool-down window are
    /// skipped; if the entire catalog is cooling down, the cool-down yields
    /// and the least-recently-used identity is handed out instead of
    /// stalling the cycle.
    pub fn acquire(&self, target: &str, now_secs: u64) -> Arc<Identity> {
        let history = self.target_history.get(target);

        let cooled: Vec<usize> = (0..self.catalog.len())
            .filter(|id| {
                let last = history.as_ref().and_then(|h| h.get(id).copied());
                match last {
                    Some(at) => now_secs.saturating_sub(at) >= self.cooldown_secs,
                    None => true,
                }
            })
            .collect();
        drop(history);

        let pick_from = if cooled.is_empty() {
            tracing::debug!(%target, "Entire identity catalog in cool-down, yielding to LRU");
            (0..self.catalog.len()).collect()
        } else {
            cooled
        };

        let preferred: Vec<usize> = pick_from
            .iter()
            .copied()
            .filter(|&id| self.stats[id].block_ratio() <= self.deprioritize_ratio)
            .collect();

        // High-ratio identities stay selectable as a last resort only.
        let pool = if preferred.is_empty() { pick_from } else { preferred };

        let chosen = pool
            .into_iter()
            .min_by(|&a, &b| {
                let ra = self.stats[a].block_ratio();
                let rb = self.stats[b].block_ratio();
                ra.partial_cmp(&rb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        self.last_acquired[a]
                            .load(Ordering::Relaxed)
                            .cmp(&self.last_acquired[b].load(Ordering::Relaxed))
                    })
            })
            .unwrap_or(0);

        self.last_acquired[chosen].store(now_secs, Ordering::Relaxed);
        self.target_history
            .entry(target.to_string())
            .or_default()
            .insert(chosen, now_secs);

        Arc::clone(&self.catalog[chosen])
    }

    /// Record the outcome of a cycle. Uses always increment; blocks only on
    /// a blocked outcome, which keeps `blocks <= uses` by construction.
    pub fn release(&self, _target: &str, identity_id: usize, blocked: bool) {
        if let Some(stats) = self.stats.get(identity_id) {
            stats.uses.fetch_add(1, Ordering::Relaxed);
            if blocked {
                stats.blocks.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn identity(&self, id: usize) -> Option<Arc<Identity>> {
        self.catalog.get(id).cloned()
    }

    /// Snapshot of (uses, blocks) per identity for persistence and status.
    pub fn export_stats(&self) -> Vec<(u64, u64)> {
        self.stats.iter().map(|s| (s.uses(), s.blocks())).collect()
    }

    /// Restore persisted counters, e.g. after a process restart. Extra
    /// entries (catalog shrank) are ignored; missing entries stay at zero.
    pub fn seed_stats(&self, persisted: &[(u64, u64)]) {
        for (id, &(uses, blocks)) in persisted.iter().enumerate() {
            if let Some(stats) = self.stats.get(id) {
                stats.uses.store(uses, Ordering::Relaxed);
                stats.blocks.store(blocks.min(uses), Ordering::Relaxed);
            }
        }
    }
}

/// Small default catalog used when the config file supplies none.
fn builtin_catalog() -> Vec<IdentityConfig> {
    let chrome_headers = vec![
        (
            "Accept".to_string(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
        ),
        ("Accept-Language".to_string(), "en-US,en;q=0.5".to_string()),
        ("Upgrade-Insecure-Requests".to_string(), "1".to_string()),
    ];

    vec![
        IdentityConfig {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36".to_string(),
            headers: chrome_headers.clone(),
            viewport: (1920, 1080),
            locale: "en-US".to_string(),
            proxy: None,
        },
        IdentityConfig {
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15".to_string(),
            headers: chrome_headers.clone(),
            viewport: (1680, 1050),
            locale: "en-US".to_string(),
            proxy: None,
        },
        IdentityConfig {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64; rv:127.0) Gecko/20100101 Firefox/127.0".to_string(),
            headers: chrome_headers,
            viewport: (1366, 768),
            locale: "en-US".to_string(),
            proxy: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(cooldown_secs: u64) -> IdentityPool {
        IdentityPool::new(
            Vec::new(),
            &PoolConfig {
                cooldown_secs,
                deprioritize_ratio: 0.5,
            },
        )
    }

    #[test]
    fn test_acquire_respects_target_cooldown() {
        let pool = pool(600);
        let now = 1_000_000;

        let first = pool.acquire("board-a", now);
        let second = pool.acquire("board-a", now + 1);
        assert_ne!(first.id, second.id);

        // A different target has its own cool-down history.
        let other = pool.acquire("board-b", now + 2);
        let _ = other; // Any identity is fair game for a fresh target.

        let third = pool.acquire("board-a", now + 3);
        assert_ne!(third.id, first.id);
        assert_ne!(third.id, second.id);
    }

    #[test]
    fn test_cooldown_expires() {
        let pool = pool(600);
        let now = 1_000_000;

        let first = pool.acquire("board-a", now);
        // Past the cool-down window the original identity is selectable again.
        let later = pool.acquire("board-a", now + 601);
        // With equal (zero) ratios the LRU tie-break favors untouched ids,
        // so just assert the original is at least permitted.
        let _ = later;
        let ids: Vec<usize> = (0..pool.len())
            .map(|_| pool.acquire("board-a", now + 2_000).id)
            .collect();
        assert!(ids.contains(&first.id));
    }

    #[test]
    fn test_blocked_identity_deprioritized_but_not_retired() {
        let pool = pool(0);
        let now = 1_000_000;

        let bad = pool.acquire("board-a", now);
        // Poison it: every use ends in a block.
        for _ in 0..4 {
            pool.release("board-a", bad.id, true);
        }
        assert!(pool.export_stats()[bad.id].1 > 0);

        // While alternatives exist, the poisoned identity is never chosen.
        for i in 0..10 {
            let picked = pool.acquire("board-a", now + i);
            assert_ne!(picked.id, bad.id);
        }

        // Poison everything else harder; the bad one becomes the least-bad
        // last resort instead of the pool starving.
        for id in 0..pool.len() {
            if id != bad.id {
                for _ in 0..10 {
                    pool.release("board-a", id, true);
                }
            }
        }
        let picked = pool.acquire("board-a", now + 100);
        assert_eq!(picked.id, bad.id);
    }

    #[test]
    fn test_blocks_never_exceed_uses() {
        let pool = pool(0);
        for _ in 0..5 {
            pool.release("board-a", 0, true);
        }
        pool.release("board-a", 0, false);
        let (uses, blocks) = pool.export_stats()[0];
        assert!(blocks <= uses);
        assert_eq!(uses, 6);
        assert_eq!(blocks, 5);
    }

    #[test]
    fn test_seed_stats_clamps_blocks() {
        let pool = pool(0);
        pool.seed_stats(&[(3, 7)]);
        let (uses, blocks) = pool.export_stats()[0];
        assert_eq!(uses, 3);
        assert_eq!(blocks, 3);
    }
}
