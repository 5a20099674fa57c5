//! # Backoff module
//!
//! This module provide an exponential backoff with jitter whose attempts are
//! counted per key and reset on success.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use crate::svc::cfg;

// -----------------------------------------------------------------------------
// Constants

pub const MULTIPLIER: f64 = 2.0;
pub const JITTER: f64 = 0.1;

// -----------------------------------------------------------------------------
// Backoff structure

#[derive(Debug)]
pub struct Backoff<K> {
    initial: Duration,
    max: Duration,
    attempts: Mutex<HashMap<K, u32>>,
}

impl<K> From<&cfg::Reconciler> for Backoff<K> {
    fn from(config: &cfg::Reconciler) -> Self {
        Self::new(
            Duration::from_secs(config.backoff_initial),
            Duration::from_secs(config.backoff_max),
        )
    }
}

impl<K> Backoff<K> {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// returns the delay of the given attempt, starting at zero
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial.as_secs_f64() * MULTIPLIER.powi(attempt.min(32) as i32);

        let range = base * JITTER;
        let jitter = rand::random::<f64>() * range * 2.0 - range;

        Duration::from_secs_f64((base + jitter).max(0.0).min(self.max.as_secs_f64()))
    }
}

impl<K> Backoff<K>
where
    K: Eq + Hash + Clone,
{
    /// returns the delay before the next attempt and counts the failure
    pub fn next(&self, key: &K) -> Duration {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
            let attempt = attempts.entry(key.to_owned()).or_insert(0);
            let current = *attempt;
            *attempt = attempt.saturating_add(1);
            current
        };

        self.delay_for_attempt(attempt)
    }

    pub fn attempts(&self, key: &K) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn reset(&self, key: &K) {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}
