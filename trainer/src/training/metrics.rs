use std::collections::BTreeMap;
use tracing::debug;

/// Default tolerance for [`losses_in_sync`]
pub const SYNC_TOLERANCE: f64 = 1e-6;

/// Running per-epoch values of named metrics
#[derive(Debug, Clone, Default)]
pub struct MetricsTracker {
    values: BTreeMap<String, Vec<f64>>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update<'a>(&mut self, metrics: impl IntoIterator<Item = (&'a str, f64)>) {
        for (name, value) in metrics {
            self.values.entry(name.to_string()).or_default().push(value);
        }
    }

    /// Mean of every metric recorded since the last reset
    pub fn epoch_means(&self) -> BTreeMap<String, f64> {
        self.values
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (k.clone(), v.iter().sum::<f64>() / v.len() as f64))
            .collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.values.get(name).map_or(0, Vec::len)
    }

    pub fn reset(&mut self) {
        self.values.clear();
    }
}

/// Whether replicas agree on the loss: all finite, spread (max - min) below
/// `tolerance`.
pub fn losses_in_sync(losses: &[f64], tolerance: f64) -> bool {
    if losses.is_empty() {
        return true;
    }
    if losses.iter().any(|l| !l.is_finite()) {
        return false;
    }
    let max = losses.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = losses.iter().copied().fold(f64::INFINITY, f64::min);
    let spread = max - min;
    if spread >= tolerance {
        debug!(spread, tolerance, replicas = losses.len(), "Replica losses diverged");
        return false;
    }
    true
}
