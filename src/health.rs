// src/health.rs - Sliding-window crash accounting
//
// A burst of `threshold` crashes within `window` trips the breaker; the
// count drains as entries age out, so the breaker un-trips on its own once
// enough time passes. `reset` clears it explicitly after a clean stop.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub struct HealthMonitor {
    threshold: u32,
    window: Duration,
    crashes: VecDeque<Instant>,
}

impl HealthMonitor {
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            crashes: VecDeque::new(),
        }
    }

    /// Records a crash at `now` and evicts entries that fell out of the
    /// window. Entries exactly on the window boundary are evicted.
    pub fn record_crash(&mut self, now: Instant) {
        self.crashes.push_back(now);
        self.evict(now);
    }

    /// Whether a restart is still within budget.
    pub fn should_restart(&mut self, now: Instant) -> bool {
        self.evict(now);
        (self.crashes.len() as u32) < self.threshold
    }

    /// Crashes currently inside the window.
    pub fn crash_count(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.crashes.len()
    }

    /// Clears the ledger; called after the encoder stops cleanly.
    pub fn reset(&mut self) {
        if !self.crashes.is_empty() {
            log::debug!("clearing {} crash record(s)", self.crashes.len());
            self.crashes.clear();
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    fn evict(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while let Some(&oldest) = self.crashes.front() {
            if oldest <= cutoff {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
    }
}
