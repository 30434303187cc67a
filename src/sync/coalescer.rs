// 12.2: adaptive coalescing. events pile up and are applied together once the window
// closes. the window widens as the backlog grows so a burst costs one recompute.

use crate::config::SyncConfig;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct WindowPolicy {
    pub base: Duration,
    pub medium: Duration,
    pub max: Duration,
    pub medium_threshold: usize,
    pub high_threshold: usize,
}

impl WindowPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base: Duration::from_millis(config.coalesce_base_ms),
            medium: Duration::from_millis(config.coalesce_medium_ms),
            max: Duration::from_millis(config.coalesce_max_ms),
            medium_threshold: config.medium_pending_threshold,
            high_threshold: config.high_pending_threshold,
        }
    }

    pub fn window(&self, pending: usize) -> Duration {
        if pending >= self.high_threshold {
            self.max
        } else if pending >= self.medium_threshold {
            self.medium
        } else {
            self.base
        }
    }
}

#[derive(Debug)]
pub struct Coalescer<T> {
    policy: WindowPolicy,
    pending: Vec<T>,
    opened_at: Option<Instant>,
}

impl<T> Coalescer<T> {
    pub fn new(policy: WindowPolicy) -> Self {
        Self {
            policy,
            pending: Vec::new(),
            opened_at: None,
        }
    }

    /// The first item opens the window.
    pub fn push(&mut self, item: T, now: Instant) {
        if self.pending.is_empty() {
            self.opened_at = Some(now);
        }
        self.pending.push(item);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn window(&self) -> Duration {
        self.policy.window(self.pending.len())
    }

    /// When the current batch should be flushed. None when nothing is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|opened| opened + self.window())
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    pub fn drain(&mut self) -> Vec<T> {
        self.opened_at = None;
        std::mem::take(&mut self.pending)
    }

    /// Keep only the pending items matching `keep`; closes the window if none remain.
    pub fn retain(&mut self, keep: impl FnMut(&T) -> bool) {
        self.pending.retain(keep);
        if self.pending.is_empty() {
            self.opened_at = None;
        }
    }
}
