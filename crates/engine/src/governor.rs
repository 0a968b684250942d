//! Per-domain adaptive pacing.
//!
//! Every worker asks the governor for permission before touching a domain.
//! Each domain has one request slot spaced by its current delay, so total
//! pressure on an origin is bounded no matter how many workers are crawling
//! it. Delays escalate multiplicatively on throttle signals (429/503 or a
//! response-time spike over the learned baseline) and decay toward the floor
//! after a streak of fast successes. Confirmed throttles raise the floor.
//! Learned values persist to the domains table so pacing survives restarts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use warmfront_store::{DomainPacing, Store};

#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Configured minimum applied to every domain.
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Smallest delay a confirmed throttle escalates to.
    pub throttle_step: Duration,
    pub increase_factor: f64,
    pub decay_factor: f64,
    /// Consecutive fast successes before the delay decays one step.
    pub success_streak: u32,
    /// Response time over `spike_factor × EWMA` counts as a soft throttle.
    pub spike_factor: f64,
    /// Spikes below this absolute response time are ignored.
    pub spike_min_ms: u64,
    pub ewma_alpha: f64,
    /// Delay/floor drift below this is not written back to the store.
    pub persist_epsilon_secs: f64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::ZERO,
            max_delay: Duration::from_secs(120),
            throttle_step: Duration::from_secs(1),
            increase_factor: 2.0,
            decay_factor: 0.75,
            success_streak: 10,
            spike_factor: 3.0,
            spike_min_ms: 1_000,
            ewma_alpha: 0.2,
            persist_epsilon_secs: 0.05,
        }
    }
}

/// What a worker observed for one request against a domain.
#[derive(Debug, Clone, Copy)]
pub enum PaceSignal {
    Success { response_time_ms: u64 },
    /// Confirmed upstream throttle (429/503/408).
    Throttled,
}

#[derive(Debug)]
struct DomainPace {
    delay_secs: f64,
    floor_secs: f64,
    crawl_delay_secs: Option<f64>,
    next_slot: Option<Instant>,
    streak: u32,
    ewma_ms: Option<f64>,
    persisted_delay: f64,
    persisted_floor: f64,
}

impl DomainPace {
    fn from_stored(stored: DomainPacing) -> Self {
        Self {
            delay_secs: stored.adaptive_delay_secs.max(0.0),
            floor_secs: stored.floor_secs.max(0.0),
            crawl_delay_secs: stored.crawl_delay_secs,
            next_slot: None,
            streak: 0,
            ewma_ms: None,
            persisted_delay: stored.adaptive_delay_secs.max(0.0),
            persisted_floor: stored.floor_secs.max(0.0),
        }
    }

    /// Delay actually applied between requests: the learned delay, the
    /// robots crawl-delay and the configured minimum, whichever is largest.
    fn effective_delay(&self, config: &GovernorConfig) -> Duration {
        let secs = self
            .delay_secs
            .max(self.crawl_delay_secs.unwrap_or(0.0))
            .max(config.min_delay.as_secs_f64());
        Duration::from_secs_f64(secs.min(config.max_delay.as_secs_f64()))
    }
}

/// Per-domain pacing authority; see the module docs.
pub struct RateGovernor {
    store: Arc<dyn Store>,
    config: GovernorConfig,
    domains: Mutex<HashMap<i64, DomainPace>>,
}

impl RateGovernor {
    pub fn new(store: Arc<dyn Store>, config: GovernorConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            domains: Mutex::new(HashMap::new()),
        })
    }

    /// Load the domain's persisted pacing on first touch.
    async fn ensure_loaded(&self, domain_id: i64) {
        {
            let domains = self.domains.lock().await;
            if domains.contains_key(&domain_id) {
                return;
            }
        }
        let stored = match self.store.domain_pacing(domain_id).await {
            Ok(pacing) => pacing,
            Err(err) => {
                debug!(domain_id, "loading domain pacing failed: {err}");
                DomainPacing::default()
            }
        };
        self.domains
            .lock()
            .await
            .entry(domain_id)
            .or_insert_with(|| DomainPace::from_stored(stored));
    }

    /// Wait until the caller may issue a request against this domain.
    pub async fn acquire(&self, domain_id: i64) {
        self.ensure_loaded(domain_id).await;

        let start = {
            let mut domains = self.domains.lock().await;
            let pace = domains
                .entry(domain_id)
                .or_insert_with(|| DomainPace::from_stored(DomainPacing::default()));
            let delay = pace.effective_delay(&self.config);
            let now = Instant::now();
            let start = match pace.next_slot {
                Some(slot) if slot > now => slot,
                _ => now,
            };
            pace.next_slot = Some(start + delay);
            start
        };

        tokio::time::sleep_until(start).await;
    }

    /// Feed back what happened; adjusts and possibly persists the delay.
    pub async fn record(&self, domain_id: i64, signal: PaceSignal) {
        self.ensure_loaded(domain_id).await;

        let persist = {
            let mut domains = self.domains.lock().await;
            let Some(pace) = domains.get_mut(&domain_id) else {
                return;
            };
            let max = self.config.max_delay.as_secs_f64();

            match signal {
                PaceSignal::Throttled => {
                    pace.streak = 0;
                    let step = self.config.throttle_step.as_secs_f64();
                    pace.delay_secs = if pace.delay_secs < step {
                        step
                    } else {
                        (pace.delay_secs * self.config.increase_factor).min(max)
                    };
                    pace.floor_secs = pace.floor_secs.max(pace.delay_secs / 2.0).min(max);
                    warn!(
                        domain_id,
                        delay_secs = pace.delay_secs,
                        floor_secs = pace.floor_secs,
                        "throttle signal; raising adaptive delay"
                    );
                }
                PaceSignal::Success { response_time_ms } => {
                    let rt = response_time_ms as f64;
                    let spike = pace
                        .ewma_ms
                        .map(|baseline| {
                            rt > baseline * self.config.spike_factor
                                && response_time_ms >= self.config.spike_min_ms
                        })
                        .unwrap_or(false);
                    if spike {
                        pace.streak = 0;
                        pace.delay_secs =
                            (pace.delay_secs.max(0.25) * self.config.increase_factor).min(max);
                        debug!(
                            domain_id,
                            response_time_ms,
                            delay_secs = pace.delay_secs,
                            "response-time spike; raising adaptive delay"
                        );
                    } else {
                        pace.streak += 1;
                        if pace.streak >= self.config.success_streak {
                            pace.streak = 0;
                            pace.delay_secs =
                                (pace.delay_secs * self.config.decay_factor).max(pace.floor_secs);
                        }
                    }
                    pace.ewma_ms = Some(match pace.ewma_ms {
                        Some(prev) => {
                            self.config.ewma_alpha * rt + (1.0 - self.config.ewma_alpha) * prev
                        }
                        None => rt,
                    });
                }
            }

            let eps = self.config.persist_epsilon_secs;
            if (pace.delay_secs - pace.persisted_delay).abs() > eps
                || (pace.floor_secs - pace.persisted_floor).abs() > eps
            {
                pace.persisted_delay = pace.delay_secs;
                pace.persisted_floor = pace.floor_secs;
                Some((pace.delay_secs, pace.floor_secs))
            } else {
                None
            }
        };

        if let Some((delay, floor)) = persist {
            if let Err(err) = self
                .store
                .update_domain_pacing(domain_id, delay, floor)
                .await
            {
                debug!(domain_id, "persisting domain pacing failed: {err}");
            }
        }
    }

    /// Current adaptive delay in seconds (diagnostics and tests).
    pub async fn current_delay_secs(&self, domain_id: i64) -> Option<f64> {
        self.domains
            .lock()
            .await
            .get(&domain_id)
            .map(|p| p.delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warmfront_store::memory::MemoryStore;

    async fn governor_with_domain(config: GovernorConfig) -> (Arc<RateGovernor>, Arc<MemoryStore>, i64) {
        let store = Arc::new(MemoryStore::new());
        let domain_id = store.get_or_create_domain("example.com").await.unwrap();
        let governor = RateGovernor::new(store.clone() as Arc<dyn Store>, config);
        (governor, store, domain_id)
    }

    #[tokio::test]
    async fn throttle_escalates_and_persists() {
        let (governor, store, domain_id) = governor_with_domain(GovernorConfig::default()).await;

        governor.record(domain_id, PaceSignal::Throttled).await;
        assert_eq!(governor.current_delay_secs(domain_id).await, Some(1.0));

        governor.record(domain_id, PaceSignal::Throttled).await;
        assert_eq!(governor.current_delay_secs(domain_id).await, Some(2.0));

        let stored = store.domain_pacing(domain_id).await.unwrap();
        assert_eq!(stored.adaptive_delay_secs, 2.0);
        assert!(stored.floor_secs >= 1.0);
    }

    #[tokio::test]
    async fn success_streak_decays_toward_floor_only() {
        let config = GovernorConfig {
            success_streak: 3,
            ..GovernorConfig::default()
        };
        let (governor, _store, domain_id) = governor_with_domain(config).await;

        for _ in 0..3 {
            governor.record(domain_id, PaceSignal::Throttled).await;
        }
        let escalated = governor.current_delay_secs(domain_id).await.unwrap();
        let floor = escalated / 2.0;

        for _ in 0..60 {
            governor
                .record(domain_id, PaceSignal::Success { response_time_ms: 50 })
                .await;
        }
        let decayed = governor.current_delay_secs(domain_id).await.unwrap();
        assert!(decayed < escalated);
        assert!(decayed >= floor);
    }

    #[tokio::test]
    async fn response_time_spike_raises_delay() {
        let (governor, _store, domain_id) = governor_with_domain(GovernorConfig::default()).await;

        for _ in 0..5 {
            governor
                .record(domain_id, PaceSignal::Success { response_time_ms: 100 })
                .await;
        }
        let before = governor.current_delay_secs(domain_id).await.unwrap();

        governor
            .record(domain_id, PaceSignal::Success { response_time_ms: 5_000 })
            .await;
        let after = governor.current_delay_secs(domain_id).await.unwrap();
        assert!(after > before);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_spaces_requests_by_the_crawl_delay() {
        let (governor, store, domain_id) = governor_with_domain(GovernorConfig::default()).await;
        store
            .set_domain_crawl_delay(domain_id, Some(2.0))
            .await
            .unwrap();

        let started = Instant::now();
        governor.acquire(domain_id).await;
        governor.acquire(domain_id).await;
        governor.acquire(domain_id).await;

        // Slots at +0s, +2s and +4s.
        assert!(started.elapsed() >= Duration::from_secs(4));
        assert!(started.elapsed() < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_does_not_pace() {
        let (governor, _store, domain_id) = governor_with_domain(GovernorConfig::default()).await;
        let started = Instant::now();
        for _ in 0..10 {
            governor.acquire(domain_id).await;
        }
        assert!(started.elapsed() < Duration::from_millis(10));
    }
}
