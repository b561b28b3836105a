//! Certificate work queue.
//!
//! A priority heap with per-host deduplication: renewals near expiry
//! outrank new acquisitions, which outrank retries. A host has at most
//! one pending or in-flight operation at a time; ACME directories rate
//! limit aggressively enough that duplicate orders are never worth it.

use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::sync::Mutex;
use tracing::debug;

/// Why a certificate operation was queued. Order matters: lower values
/// run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertJobKind {
    /// An expiring certificate that is still being served.
    Renewal = 0,
    /// A host that has never had a certificate.
    Acquisition = 1,
    /// A previously failed operation coming off back-off.
    Retry = 2,
}

impl PartialOrd for CertJobKind {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CertJobKind {
    fn cmp(&self, other: &Self) -> Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertJob {
    pub host: String,
    pub kind: CertJobKind,
    /// Earliest time the job may run; in the future for back-off.
    pub not_before: DateTime<Utc>,
}

impl CertJob {
    pub fn new(host: impl Into<String>, kind: CertJobKind) -> Self {
        Self {
            host: host.into(),
            kind,
            not_before: Utc::now(),
        }
    }

    pub fn delayed(host: impl Into<String>, kind: CertJobKind, not_before: DateTime<Utc>) -> Self {
        Self {
            host: host.into(),
            kind,
            not_before,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now
    }
}

impl PartialOrd for CertJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CertJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .cmp(&other.kind)
            .then(self.not_before.cmp(&other.not_before))
            .then_with(|| self.host.cmp(&other.host))
    }
}

/// Pending jobs plus the set of hosts with work pending or running.
#[derive(Debug, Default)]
pub struct CertQueue {
    inner: Mutex<QueueInner>,
}

#[derive(Debug, Default)]
struct QueueInner {
    pending: BinaryHeap<Reverse<CertJob>>,
    busy_hosts: HashSet<String>,
}

impl CertQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue unless the host already has work pending or in flight.
    /// Returns whether the job was accepted.
    pub fn enqueue(&self, job: CertJob) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.busy_hosts.insert(job.host.clone()) {
            debug!(host = %job.host, "[ACME] duplicate job skipped");
            return false;
        }
        inner.pending.push(Reverse(job));
        true
    }

    /// Pop the highest-priority job whose time has come. The host stays
    /// marked busy until [`CertQueue::done`].
    pub fn pop_ready(&self, now: DateTime<Utc>) -> Option<CertJob> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut deferred = Vec::new();
        let mut picked = None;

        while let Some(Reverse(job)) = inner.pending.pop() {
            if job.is_ready(now) {
                picked = Some(job);
                break;
            }
            deferred.push(job);
        }
        for job in deferred {
            inner.pending.push(Reverse(job));
        }
        picked
    }

    /// Release the per-host slot after the operation settles.
    pub fn done(&self, host: &str) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .busy_hosts
            .remove(host);
    }

    /// Drop pending work for a host that no longer exists. A job already
    /// running cannot be recalled; the worker re-checks the route table
    /// before persisting.
    pub fn forget(&self, host: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let retained: BinaryHeap<Reverse<CertJob>> = inner
            .pending
            .drain()
            .filter(|Reverse(job)| job.host != host)
            .collect();
        inner.pending = retained;
        inner.busy_hosts.remove(host);
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn renewals_outrank_acquisitions_and_retries() {
        let queue = CertQueue::new();
        assert!(queue.enqueue(CertJob::new("retry.example", CertJobKind::Retry)));
        assert!(queue.enqueue(CertJob::new("new.example", CertJobKind::Acquisition)));
        assert!(queue.enqueue(CertJob::new("old.example", CertJobKind::Renewal)));

        let now = Utc::now();
        assert_eq!(queue.pop_ready(now).unwrap().host, "old.example");
        assert_eq!(queue.pop_ready(now).unwrap().host, "new.example");
        assert_eq!(queue.pop_ready(now).unwrap().host, "retry.example");
        assert!(queue.pop_ready(now).is_none());
    }

    #[test]
    fn host_is_deduplicated_until_done() {
        let queue = CertQueue::new();
        assert!(queue.enqueue(CertJob::new("demo.example", CertJobKind::Acquisition)));
        assert!(!queue.enqueue(CertJob::new("demo.example", CertJobKind::Retry)));

        let job = queue.pop_ready(Utc::now()).unwrap();
        // Still busy while running.
        assert!(!queue.enqueue(CertJob::new("demo.example", CertJobKind::Retry)));
        queue.done(&job.host);
        assert!(queue.enqueue(CertJob::new("demo.example", CertJobKind::Retry)));
    }

    #[test]
    fn backoff_jobs_wait_their_turn() {
        let queue = CertQueue::new();
        let now = Utc::now();
        queue.enqueue(CertJob::delayed(
            "later.example",
            CertJobKind::Retry,
            now + Duration::minutes(5),
        ));
        queue.enqueue(CertJob::new("now.example", CertJobKind::Retry));

        assert_eq!(queue.pop_ready(now).unwrap().host, "now.example");
        assert!(queue.pop_ready(now).is_none());
        assert_eq!(
            queue
                .pop_ready(now + Duration::minutes(6))
                .unwrap()
                .host,
            "later.example"
        );
    }

    #[test]
    fn forget_drops_pending_work() {
        let queue = CertQueue::new();
        queue.enqueue(CertJob::new("gone.example", CertJobKind::Acquisition));
        queue.forget("gone.example");
        assert!(queue.pop_ready(Utc::now()).is_none());
        assert_eq!(queue.pending_count(), 0);
        // Slot was released too.
        assert!(queue.enqueue(CertJob::new("gone.example", CertJobKind::Acquisition)));
    }
}
