//! Process-local metrics counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics handle for recording counters
#[derive(Debug, Default)]
pub struct Metrics {
    jobs_accepted: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    tasks_dispatched: AtomicU64,
    tasks_retried: AtomicU64,
    tasks_dead_lettered: AtomicU64,
    archives_written: AtomicU64,
    webhooks_delivered: AtomicU64,
    webhooks_skipped: AtomicU64,
    webhooks_failed: AtomicU64,
    breaker_transitions: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_accepted(&self) {
        self.jobs_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_dispatched(&self) {
        self.tasks_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_retried(&self) {
        self.tasks_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_dead_lettered(&self) {
        self.tasks_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn archive_written(&self) {
        self.archives_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn webhook_delivered(&self) {
        self.webhooks_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn webhook_skipped(&self) {
        self.webhooks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn webhook_failed(&self) {
        self.webhooks_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Each breaker transition is observable: one counter event tagged with
    /// the destination host and the edge it took.
    pub fn breaker_transition(&self, host: &str, from: &'static str, to: &'static str) {
        self.breaker_transitions.fetch_add(1, Ordering::Relaxed);
        tracing::info!(host, from, to, "circuit breaker transition");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_accepted: self.jobs_accepted.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            tasks_dispatched: self.tasks_dispatched.load(Ordering::Relaxed),
            tasks_retried: self.tasks_retried.load(Ordering::Relaxed),
            tasks_dead_lettered: self.tasks_dead_lettered.load(Ordering::Relaxed),
            archives_written: self.archives_written.load(Ordering::Relaxed),
            webhooks_delivered: self.webhooks_delivered.load(Ordering::Relaxed),
            webhooks_skipped: self.webhooks_skipped.load(Ordering::Relaxed),
            webhooks_failed: self.webhooks_failed.load(Ordering::Relaxed),
            breaker_transitions: self.breaker_transitions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub jobs_accepted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub tasks_dispatched: u64,
    pub tasks_retried: u64,
    pub tasks_dead_lettered: u64,
    pub archives_written: u64,
    pub webhooks_delivered: u64,
    pub webhooks_skipped: u64,
    pub webhooks_failed: u64,
    pub breaker_transitions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.job_accepted();
        metrics.job_accepted();
        metrics.task_dispatched();
        metrics.breaker_transition("example.com", "closed", "open");

        let snap = metrics.snapshot();
        assert_eq!(snap.jobs_accepted, 2);
        assert_eq!(snap.tasks_dispatched, 1);
        assert_eq!(snap.breaker_transitions, 1);
        assert_eq!(snap.jobs_failed, 0);
    }
}
