use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct Metrics {
    rounds_created: Arc<AtomicU64>,
    rounds_succeeded: Arc<AtomicU64>,
    rounds_failed: Arc<AtomicU64>,
    blame_rounds: Arc<AtomicU64>,
    inputs_registered: Arc<AtomicU64>,
    inputs_rejected: Arc<AtomicU64>,
    outputs_registered: Arc<AtomicU64>,
    utxos_banned: Arc<AtomicU64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_rounds_created(&self) {
        self.rounds_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rounds_succeeded(&self) {
        self.rounds_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rounds_failed(&self) {
        self.rounds_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_blame_rounds(&self) {
        self.blame_rounds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_inputs_registered(&self) {
        self.inputs_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_inputs_rejected(&self) {
        self.inputs_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_outputs_registered(&self) {
        self.outputs_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_utxos_banned(&self, n: u64) {
        self.utxos_banned.fetch_add(n, Ordering::Relaxed);
    }

    pub fn rounds_created(&self) -> u64 {
        self.rounds_created.load(Ordering::Relaxed)
    }

    pub fn rounds_succeeded(&self) -> u64 {
        self.rounds_succeeded.load(Ordering::Relaxed)
    }

    pub fn rounds_failed(&self) -> u64 {
        self.rounds_failed.load(Ordering::Relaxed)
    }

    pub fn inputs_registered(&self) -> u64 {
        self.inputs_registered.load(Ordering::Relaxed)
    }

    pub fn utxos_banned(&self) -> u64 {
        self.utxos_banned.load(Ordering::Relaxed)
    }

    pub fn report(&self) {
        tracing::info!(
            "Metrics: rounds={} ok={} failed={} blame={} inputs={} rejected={} outputs={} banned={}",
            self.rounds_created.load(Ordering::Relaxed),
            self.rounds_succeeded.load(Ordering::Relaxed),
            self.rounds_failed.load(Ordering::Relaxed),
            self.blame_rounds.load(Ordering::Relaxed),
            self.inputs_registered.load(Ordering::Relaxed),
            self.inputs_rejected.load(Ordering::Relaxed),
            self.outputs_registered.load(Ordering::Relaxed),
            self.utxos_banned.load(Ordering::Relaxed),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let m = Metrics::new();
        let other = m.clone();
        other.inc_rounds_created();
        other.add_utxos_banned(3);
        assert_eq!(m.rounds_created(), 1);
        assert_eq!(m.utxos_banned(), 3);
    }
}
