//! `PostOnlyFailurePolicy` (spec.md §4.5): per-symbol chronic-crossing
//! counter. `DashMap` gives per-symbol sharded locking without a single
//! global mutex, the same tradeoff the teacher reaches for `dashmap` on
//! other hot-path counters.

use crate::domain::OrderType;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};

pub struct PostOnlyFailurePolicy {
    counters: DashMap<String, AtomicU32>,
    max_attempts: u32,
}

impl PostOnlyFailurePolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            counters: DashMap::new(),
            max_attempts,
        }
    }

    /// Order type to request for both legs of this attempt.
    pub fn order_type_for(&self, symbol: &str) -> OrderType {
        let count = self
            .counters
            .get(symbol)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0);
        if count < self.max_attempts {
            OrderType::PostOnly
        } else {
            OrderType::Gtc
        }
    }

    pub fn on_crossing_rejected(&self, symbol: &str) {
        self.counters
            .entry(symbol.to_string())
            .or_insert_with(|| AtomicU32::new(0))
            .fetch_add(1, Ordering::SeqCst);
    }

    pub fn on_both_legs_accepted(&self, symbol: &str) {
        if let Some(counter) = self.counters.get(symbol) {
            counter.store(0, Ordering::SeqCst);
        }
    }

    pub fn failure_count(&self, symbol: &str) -> u32 {
        self.counters
            .get(symbol)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}
