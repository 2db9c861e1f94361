//! Round-robin provider selection with error-aware skipping.
//!
//! Each provider carries a consecutive-error counter. A provider whose
//! counter reached the threshold is skipped until its cooldown has elapsed
//! since it was last used; it is then readmitted with the counter reset.
//! When nothing is eligible for a fresh request, the first provider is used
//! anyway. A single request never visits a provider twice.
//!
//! The state is plain data; the gateway keeps it behind a mutex and holds
//! the lock only while selecting or recording an outcome.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct Slot {
    name: String,
    errors: u32,
    last_used: Option<Instant>,
}

/// Health of one provider at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealth {
    pub name: String,
    pub consecutive_errors: u32,
    /// Over the error threshold and still inside its cooldown window.
    pub cooling_down: bool,
    /// Seconds since the provider was last selected.
    pub last_used_secs_ago: Option<f64>,
}

#[derive(Debug)]
pub struct RotationState {
    slots: Vec<Slot>,
    cursor: usize,
    error_threshold: u32,
    cooldown: Duration,
}

impl RotationState {
    pub fn new(names: Vec<String>, error_threshold: u32, cooldown: Duration) -> Self {
        Self {
            slots: names
                .into_iter()
                .map(|name| Slot {
                    name,
                    errors: 0,
                    last_used: None,
                })
                .collect(),
            cursor: 0,
            error_threshold: error_threshold.max(1),
            cooldown,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn name(&self, index: usize) -> &str {
        self.slots.get(index).map_or("", |s| s.name.as_str())
    }

    /// Pick the next provider for a request that already tried `tried`.
    ///
    /// Returns `None` once the request has made its single pass.
    pub fn select(&mut self, tried: &[usize]) -> Option<usize> {
        self.select_at(tried, Instant::now())
    }

    fn select_at(&mut self, tried: &[usize], now: Instant) -> Option<usize> {
        let count = self.slots.len();
        if count == 0 || tried.len() >= count {
            return None;
        }

        for offset in 0..count {
            let index = (self.cursor + offset) % count;
            if tried.contains(&index) {
                continue;
            }
            let slot = &mut self.slots[index];
            if slot.errors >= self.error_threshold {
                let cooled = slot
                    .last_used
                    .is_none_or(|used| now.duration_since(used) >= self.cooldown);
                if !cooled {
                    debug!(
                        stage = "provider_skipped",
                        provider = %slot.name,
                        consecutive_errors = slot.errors,
                        "Skipping provider over error threshold"
                    );
                    continue;
                }
                info!(
                    stage = "provider_readmitted",
                    provider = %slot.name,
                    consecutive_errors = slot.errors,
                    "Cooldown elapsed, provider eligible again"
                );
                slot.errors = 0;
            }
            return Some(self.mark_used(index, now));
        }

        // Every provider is over threshold: best effort with the first
        if tried.is_empty() {
            info!(
                stage = "provider_best_effort",
                provider = %self.slots[0].name,
                "All providers over error threshold, using the first"
            );
            return Some(self.mark_used(0, now));
        }
        None
    }

    fn mark_used(&mut self, index: usize, now: Instant) -> usize {
        self.slots[index].last_used = Some(now);
        self.cursor = (index + 1) % self.slots.len();
        index
    }

    pub fn record_success(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.errors = 0;
        }
    }

    /// Count one error. Returns the new consecutive-error count.
    pub fn record_failure(&mut self, index: usize) -> u32 {
        match self.slots.get_mut(index) {
            Some(slot) => {
                slot.errors = slot.errors.saturating_add(1);
                slot.errors
            }
            None => 0,
        }
    }

    pub fn snapshot(&self) -> Vec<ProviderHealth> {
        let now = Instant::now();
        self.slots
            .iter()
            .map(|slot| {
                let idle = slot.last_used.map(|used| now.duration_since(used));
                ProviderHealth {
                    name: slot.name.clone(),
                    consecutive_errors: slot.errors,
                    cooling_down: slot.errors >= self.error_threshold
                        && idle.is_some_and(|idle| idle < self.cooldown),
                    last_used_secs_ago: idle.map(|d| d.as_secs_f64()),
                }
            })
            .collect()
    }
}
