//! Quota governor — sliding hourly/daily dispatch caps and cooldowns.
//!
//! Windows slide with every dispatch instead of resetting on clock-aligned
//! buckets, so a burst straddling a boundary cannot double the rate.
//! The dispatch loop is the only writer; observers read `snapshot()`.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dunning_core::config::QuotaConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::run::RunPhase;

const HOUR: i64 = 3600;
const DAY: i64 = 24 * 3600;

/// Which cap blocked dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuotaWindow {
    Hourly,
    Daily,
}

/// Read-only quota view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub hourly_count: u32,
    pub hourly_cap: u32,
    pub daily_count: u32,
    pub daily_cap: u32,
    /// Oldest dispatch still inside the hourly window.
    pub hourly_window_start: Option<DateTime<Utc>>,
    /// Oldest dispatch still inside the daily window.
    pub daily_window_start: Option<DateTime<Utc>>,
}

/// Tracks dispatch timestamps and gates the loop.
pub struct QuotaGovernor {
    config: QuotaConfig,
    /// Dispatch times inside the last 24h, oldest first.
    sends: VecDeque<DateTime<Utc>>,
    /// Last window reported as blocking, to log each breach once.
    blocked: Option<QuotaWindow>,
    rng: StdRng,
}

impl QuotaGovernor {
    pub fn new(config: QuotaConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_seed(config: QuotaConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: QuotaConfig, rng: StdRng) -> Self {
        Self {
            config,
            sends: VecDeque::new(),
            blocked: None,
            rng,
        }
    }

    /// Reload dispatch history from a persisted run.
    pub fn restore(&mut self, mut sends: Vec<DateTime<Utc>>, now: DateTime<Utc>) {
        sends.sort();
        self.sends = sends.into();
        self.prune(now);
    }

    /// True when both windows are under their caps and the run is RUNNING.
    pub fn may_dispatch(&mut self, phase: RunPhase, now: DateTime<Utc>) -> bool {
        if phase != RunPhase::Running {
            return false;
        }
        self.prune(now);
        match self.exceeded(now) {
            None => {
                self.blocked = None;
                true
            }
            Some(window) => {
                if self.blocked != Some(window) {
                    let snap = self.snapshot(now);
                    tracing::info!(
                        window = ?window,
                        hourly = snap.hourly_count,
                        daily = snap.daily_count,
                        "🚦 Dispatch quota reached"
                    );
                }
                self.blocked = Some(window);
                false
            }
        }
    }

    /// Count one dispatch in both windows.
    pub fn record_dispatch(&mut self, now: DateTime<Utc>) {
        self.sends.push_back(now);
        self.prune(now);
    }

    /// Cooldown to observe when a cap is reached, `None` otherwise.
    ///
    /// The wait is drawn from the configured range and stretched, if needed,
    /// until the blocking window has room again.
    pub fn check_cooldown(&mut self, now: DateTime<Utc>) -> Option<Duration> {
        self.prune(now);
        let window = self.exceeded(now)?;
        let drawn = self
            .rng
            .gen_range(self.config.cooldown_min_secs..=self.config.cooldown_max_secs);
        let drawn = Duration::from_secs(drawn);
        let until_free = self.until_free(window, now);
        Some(drawn.max(until_free))
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> QuotaSnapshot {
        let hour_ago = now - chrono::Duration::seconds(HOUR);
        let day_ago = now - chrono::Duration::seconds(DAY);
        QuotaSnapshot {
            hourly_count: self.sends.iter().filter(|t| **t > hour_ago).count() as u32,
            hourly_cap: self.config.hourly_cap,
            daily_count: self.sends.iter().filter(|t| **t > day_ago).count() as u32,
            daily_cap: self.config.daily_cap,
            hourly_window_start: self.sends.iter().find(|t| **t > hour_ago).copied(),
            daily_window_start: self.sends.iter().find(|t| **t > day_ago).copied(),
        }
    }

    /// Dispatch times still inside the daily window, for persistence.
    pub fn sends(&self) -> Vec<DateTime<Utc>> {
        self.sends.iter().copied().collect()
    }

    fn exceeded(&self, now: DateTime<Utc>) -> Option<QuotaWindow> {
        let snap = self.snapshot(now);
        if snap.daily_count >= self.config.daily_cap {
            Some(QuotaWindow::Daily)
        } else if snap.hourly_count >= self.config.hourly_cap {
            Some(QuotaWindow::Hourly)
        } else {
            None
        }
    }

    /// Time until enough old dispatches leave `window` to admit one more.
    fn until_free(&self, window: QuotaWindow, now: DateTime<Utc>) -> Duration {
        let (span, cap) = match window {
            QuotaWindow::Hourly => (HOUR, self.config.hourly_cap),
            QuotaWindow::Daily => (DAY, self.config.daily_cap),
        };
        let start = now - chrono::Duration::seconds(span);
        let inside: Vec<_> = self.sends.iter().filter(|t| **t > start).collect();
        if (inside.len() as u32) < cap {
            return Duration::ZERO;
        }
        let must_expire = inside.len() - cap as usize;
        let frees_at = *inside[must_expire] + chrono::Duration::seconds(span);
        (frees_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let day_ago = now - chrono::Duration::seconds(DAY);
        while self.sends.front().is_some_and(|t| *t <= day_ago) {
            self.sends.pop_front();
        }
    }
}
