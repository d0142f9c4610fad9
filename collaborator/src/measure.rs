//! Lightweight timing spans for the load/store paths.
//!
//! A `MeasureContext` names a span path (`store-document/minio`, ...).
//! Each completed span is logged at trace level and folded into shared
//! counters that can be read back with [`MeasureContext::snapshot`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Aggregated counters for one span path or measured value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeasureStats {
    /// Number of completed spans or recorded values
    pub count: u64,
    /// Total time spent in the span
    pub total: Duration,
    /// Sum of recorded values (for `measure`)
    pub value: f64,
}

#[derive(Clone)]
pub struct MeasureContext {
    path: String,
    stats: Arc<Mutex<HashMap<String, MeasureStats>>>,
}

impl MeasureContext {
    /// Create a root context named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            path: name.into(),
            stats: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Child context sharing this context's counters.
    pub fn child(&self, name: &str) -> Self {
        Self {
            path: format!("{}/{name}", self.path),
            stats: self.stats.clone(),
        }
    }

    /// Run `f` inside a child span and record its duration.
    pub async fn with<F, Fut, T>(&self, name: &str, f: F) -> T
    where
        F: FnOnce(MeasureContext) -> Fut,
        Fut: Future<Output = T>,
    {
        let child = self.child(name);
        let started = Instant::now();
        let result = f(child.clone()).await;
        let elapsed = started.elapsed();
        log::trace!("{} took {:?}", child.path, elapsed);
        child.record(|s| {
            s.count += 1;
            s.total += elapsed;
        });
        result
    }

    /// Record a numeric value (e.g. payload size) under this span.
    pub fn measure(&self, name: &str, value: f64) {
        let child = self.child(name);
        log::trace!("{} = {value}", child.path);
        child.record(|s| {
            s.count += 1;
            s.value += value;
        });
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Copy of all counters recorded so far, keyed by span path.
    pub fn snapshot(&self) -> HashMap<String, MeasureStats> {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, update: impl FnOnce(&mut MeasureStats)) {
        let mut stats = match self.stats.lock() {
            Ok(stats) => stats,
            Err(poisoned) => poisoned.into_inner(),
        };
        update(stats.entry(self.path.clone()).or_default());
    }
}

impl std::fmt::Debug for MeasureContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeasureContext").field("path", &self.path).finish()
    }
}
