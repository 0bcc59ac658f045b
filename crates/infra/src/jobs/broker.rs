//! Multi-queue broker with leases, delayed delivery and a dead-letter store.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use tubewatch_core::{JobId, LeaseId};

use super::cancel::CancellationToken;
use super::types::{
    AttemptOutcome, AttemptRecord, DeadLetterEntry, DeadLetterReason, JobEnvelope, JobError, JobState, LeasedJob,
    QueueName, RetryPolicy,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("job {0} is already enqueued")]
    Duplicate(JobId),
    #[error("lease {0} is unknown or has expired")]
    UnknownLease(LeaseId),
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("broker state lock poisoned")]
    Poisoned,
}

impl From<BrokerError> for JobError {
    fn from(value: BrokerError) -> Self {
        match value {
            BrokerError::Poisoned => JobError::Transient(value.to_string()),
            other => JobError::Permanent(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    Completed,
    /// Cancellation was requested while the job ran
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NackOutcome {
    Requeued { attempt: u32, retry_at: DateTime<Utc> },
    DeadLettered,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Removed before any worker leased it
    Removed,
    /// Leased; the running handler sees the flag at its next checkpoint
    Signalled,
    NotFound,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub ready: usize,
    pub delayed: usize,
    pub leased: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub queues: BTreeMap<QueueName, QueueDepth>,
    pub dead_letters: usize,
    pub enqueued: u64,
    pub leases_granted: u64,
    pub acked: u64,
    pub requeued: u64,
    pub expired: u64,
    pub cancelled: u64,
    pub dead_lettered: u64,
}

/// Job queue abstraction shared by producers (scheduler, handlers) and the worker pool.
pub trait QueueBroker: Send + Sync {
    /// Add a job. Jobs whose `not_before` is in the future wait in the delay index.
    fn enqueue(&self, envelope: JobEnvelope) -> Result<JobId, BrokerError>;

    /// Lease the next job from `queues`, blocking up to `wait` for one to become available.
    ///
    /// `priority` is always served first, then the other queues round-robin;
    /// within a queue, higher priority first and FIFO among equals.
    fn lease(
        &self,
        queues: &[QueueName],
        worker_id: &str,
        lease_for: Duration,
        wait: Duration,
    ) -> Result<Option<LeasedJob>, BrokerError>;

    /// Finish a leased job. Fails if the lease is unknown or already expired.
    fn ack(&self, lease_id: LeaseId) -> Result<AckOutcome, BrokerError>;

    /// Report a failed delivery. `requeue = false` dead-letters immediately.
    fn nack(&self, lease_id: LeaseId, requeue: bool, error: &str) -> Result<NackOutcome, BrokerError>;

    fn cancel(&self, job_id: JobId) -> Result<CancelOutcome, BrokerError>;

    fn job_state(&self, job_id: JobId) -> Result<Option<JobState>, BrokerError>;

    /// Oldest first.
    fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, BrokerError>;

    /// Move a dead-lettered job back to its queue with `attempt = 0`.
    fn retry_dead_letter(&self, job_id: JobId) -> Result<JobEnvelope, BrokerError>;

    fn delete_dead_letter(&self, job_id: JobId) -> Result<(), BrokerError>;

    /// Drop every queued and delayed job in `queue`. Leased jobs are untouched.
    fn purge(&self, queue: QueueName) -> Result<usize, BrokerError>;

    fn stats(&self) -> Result<BrokerStats, BrokerError>;
}

impl<B> QueueBroker for Arc<B>
where
    B: QueueBroker + ?Sized,
{
    fn enqueue(&self, envelope: JobEnvelope) -> Result<JobId, BrokerError> {
        (**self).enqueue(envelope)
    }

    fn lease(
        &self,
        queues: &[QueueName],
        worker_id: &str,
        lease_for: Duration,
        wait: Duration,
    ) -> Result<Option<LeasedJob>, BrokerError> {
        (**self).lease(queues, worker_id, lease_for, wait)
    }

    fn ack(&self, lease_id: LeaseId) -> Result<AckOutcome, BrokerError> {
        (**self).ack(lease_id)
    }

    fn nack(&self, lease_id: LeaseId, requeue: bool, error: &str) -> Result<NackOutcome, BrokerError> {
        (**self).nack(lease_id, requeue, error)
    }

    fn cancel(&self, job_id: JobId) -> Result<CancelOutcome, BrokerError> {
        (**self).cancel(job_id)
    }

    fn job_state(&self, job_id: JobId) -> Result<Option<JobState>, BrokerError> {
        (**self).job_state(job_id)
    }

    fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, BrokerError> {
        (**self).dead_letters(limit)
    }

    fn retry_dead_letter(&self, job_id: JobId) -> Result<JobEnvelope, BrokerError> {
        (**self).retry_dead_letter(job_id)
    }

    fn delete_dead_letter(&self, job_id: JobId) -> Result<(), BrokerError> {
        (**self).delete_dead_letter(job_id)
    }

    fn purge(&self, queue: QueueName) -> Result<usize, BrokerError> {
        (**self).purge(queue)
    }

    fn stats(&self) -> Result<BrokerStats, BrokerError> {
        (**self).stats()
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub retry: RetryPolicy,
    /// How many finished job ids to remember for `job_state`
    pub finished_history: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            finished_history: 10_000,
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Higher priority first, then insertion order.
type ReadyKey = (Reverse<i32>, u64, JobId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Ready(u64),
    Delayed(u64),
    Leased(LeaseId),
}

#[derive(Debug)]
struct StoredJob {
    envelope: JobEnvelope,
    slot: Slot,
    history: Vec<AttemptRecord>,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct LeaseRecord {
    job_id: JobId,
    worker_id: String,
    leased_at: DateTime<Utc>,
    expiry: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: u64,
    leases_granted: u64,
    acked: u64,
    requeued: u64,
    expired: u64,
    cancelled: u64,
    dead_lettered: u64,
}

#[derive(Debug, Default)]
struct BrokerState {
    next_seq: u64,
    ready: HashMap<QueueName, BTreeSet<ReadyKey>>,
    delayed: BTreeSet<(DateTime<Utc>, u64, JobId)>,
    jobs: HashMap<JobId, StoredJob>,
    leases: HashMap<LeaseId, LeaseRecord>,
    expiries: BTreeSet<(DateTime<Utc>, LeaseId)>,
    dead: Vec<DeadLetterEntry>,
    finished: HashMap<JobId, JobState>,
    finished_order: VecDeque<JobId>,
    rr_cursor: usize,
    counters: Counters,
}

impl BrokerState {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Index an already-stored job as ready or delayed according to its `not_before`.
    fn place(&mut self, job_id: JobId, now: DateTime<Utc>) {
        let seq = self.seq();
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        let env = &job.envelope;
        if env.earliest_start() > now {
            self.delayed.insert((env.earliest_start(), seq, job_id));
            job.slot = Slot::Delayed(seq);
        } else {
            self.ready
                .entry(env.queue())
                .or_default()
                .insert((Reverse(env.priority()), seq, job_id));
            job.slot = Slot::Ready(seq);
        }
    }

    /// Remove a job and every index entry that points at it.
    fn unlink(&mut self, job_id: JobId) -> Option<StoredJob> {
        let job = self.jobs.remove(&job_id)?;
        let env = &job.envelope;
        match job.slot {
            Slot::Ready(seq) => {
                if let Some(queue) = self.ready.get_mut(&env.queue()) {
                    queue.remove(&(Reverse(env.priority()), seq, job_id));
                }
            }
            Slot::Delayed(seq) => {
                self.delayed.remove(&(env.earliest_start(), seq, job_id));
            }
            Slot::Leased(lease_id) => {
                if let Some(lease) = self.leases.remove(&lease_id) {
                    self.expiries.remove(&(lease.expiry, lease_id));
                }
            }
        }
        Some(job)
    }

    fn finish(&mut self, job_id: JobId, state: JobState, keep: usize) {
        if self.finished.insert(job_id, state).is_none() {
            self.finished_order.push_back(job_id);
        }
        while self.finished_order.len() > keep {
            if let Some(old) = self.finished_order.pop_front() {
                self.finished.remove(&old);
            }
        }
    }

    fn dead_letter(
        &mut self,
        job_id: JobId,
        reason: DeadLetterReason,
        last_error: &str,
        now: DateTime<Utc>,
        keep: usize,
    ) {
        let Some(job) = self.unlink(job_id) else {
            return;
        };
        warn!(
            job_id = %job_id,
            kind = %job.envelope.kind(),
            attempt = job.envelope.attempt(),
            reason = ?reason,
            error = %last_error,
            "job dead-lettered"
        );
        self.dead.push(DeadLetterEntry {
            envelope: job.envelope,
            reason,
            last_error: last_error.to_string(),
            history: job.history,
            dead_lettered_at: now,
        });
        self.counters.dead_lettered += 1;
        self.finish(job_id, JobState::DeadLettered, keep);
    }

    fn promote_due(&mut self, now: DateTime<Utc>) -> usize {
        let mut promoted = 0;
        while let Some(&(at, _, job_id)) = self.delayed.first() {
            if at > now {
                break;
            }
            self.delayed.pop_first();
            self.place(job_id, now);
            promoted += 1;
        }
        promoted
    }

    /// Return expired leases to their queues, charging one attempt each.
    fn reclaim_expired(&mut self, now: DateTime<Utc>, keep: usize) -> usize {
        let mut reclaimed = 0;
        while let Some(&(expiry, lease_id)) = self.expiries.first() {
            if expiry > now {
                break;
            }
            self.expiries.pop_first();
            let Some(lease) = self.leases.remove(&lease_id) else {
                continue;
            };
            let Some(job) = self.jobs.get_mut(&lease.job_id) else {
                continue;
            };
            let attempt = job.envelope.record_failure();
            job.history.push(AttemptRecord {
                attempt,
                worker_id: lease.worker_id.clone(),
                started_at: lease.leased_at,
                finished_at: now,
                outcome: AttemptOutcome::LeaseExpired,
            });
            job.envelope.set_not_before(now);
            let cancelled = job.cancel.is_cancelled();
            let exhausted = job.envelope.is_exhausted();

            self.counters.expired += 1;
            reclaimed += 1;
            warn!(
                job_id = %lease.job_id,
                lease_id = %lease_id,
                worker = %lease.worker_id,
                attempt,
                "lease expired"
            );

            if cancelled {
                self.unlink(lease.job_id);
                self.counters.cancelled += 1;
                self.finish(lease.job_id, JobState::Cancelled, keep);
            } else if exhausted {
                self.dead_letter(lease.job_id, DeadLetterReason::Exhausted, "lease expired", now, keep);
            } else {
                self.place(lease.job_id, now);
            }
        }
        reclaimed
    }

    fn maintain(&mut self, now: DateTime<Utc>, keep: usize) -> bool {
        let reclaimed = self.reclaim_expired(now, keep);
        let promoted = self.promote_due(now);
        reclaimed + promoted > 0
    }

    fn pop_ready(&mut self, queue: QueueName) -> Option<JobId> {
        self.ready.get_mut(&queue)?.pop_first().map(|(_, _, id)| id)
    }

    fn pick(&mut self, queues: &[QueueName]) -> Option<JobId> {
        if queues.contains(&QueueName::Priority) {
            if let Some(id) = self.pop_ready(QueueName::Priority) {
                return Some(id);
            }
        }
        let lanes = QueueName::ROUND_ROBIN.len();
        for offset in 0..lanes {
            let slot = (self.rr_cursor + offset) % lanes;
            let queue = QueueName::ROUND_ROBIN[slot];
            if !queues.contains(&queue) {
                continue;
            }
            if let Some(id) = self.pop_ready(queue) {
                self.rr_cursor = (slot + 1) % lanes;
                return Some(id);
            }
        }
        None
    }

    /// Time until the next delayed job becomes due or the next lease expires.
    fn until_next_event(&self, now: DateTime<Utc>) -> Option<Duration> {
        let next_due = self.delayed.first().map(|(at, _, _)| *at);
        let next_expiry = self.expiries.first().map(|(at, _)| *at);
        let next = match (next_due, next_expiry) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => return None,
        };
        Some((next - now).to_std().unwrap_or(Duration::ZERO))
    }

    fn state_of(&self, job_id: JobId) -> Option<JobState> {
        if let Some(job) = self.jobs.get(&job_id) {
            return Some(match job.slot {
                Slot::Ready(_) => JobState::Queued,
                Slot::Delayed(_) => JobState::Delayed,
                Slot::Leased(_) => JobState::Leased,
            });
        }
        self.finished.get(&job_id).copied()
    }
}

/// In-process broker: one mutex-guarded state plus a condvar that wakes
/// blocked `lease` calls when work arrives.
#[derive(Debug)]
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    available: Condvar,
    config: BrokerConfig,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl InMemoryBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            available: Condvar::new(),
            config,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        self.state.lock().map_err(|_| {
            error!("broker state lock poisoned");
            BrokerError::Poisoned
        })
    }

    fn keep(&self) -> usize {
        self.config.finished_history
    }

    /// Lock and run expiry/promotion bookkeeping.
    fn lock_maintained(&self) -> Result<MutexGuard<'_, BrokerState>, BrokerError> {
        let mut state = self.lock()?;
        if state.maintain(Utc::now(), self.keep()) {
            self.available.notify_all();
        }
        Ok(state)
    }

    /// Ready jobs in `queue`.
    pub fn depth(&self, queue: QueueName) -> Result<usize, BrokerError> {
        let state = self.lock_maintained()?;
        Ok(state.ready.get(&queue).map_or(0, BTreeSet::len))
    }
}

impl QueueBroker for InMemoryBroker {
    fn enqueue(&self, envelope: JobEnvelope) -> Result<JobId, BrokerError> {
        let job_id = envelope.id();
        let mut state = self.lock()?;
        if state.jobs.contains_key(&job_id) || state.dead.iter().any(|d| d.envelope.id() == job_id) {
            return Err(BrokerError::Duplicate(job_id));
        }

        debug!(
            job_id = %job_id,
            kind = %envelope.kind(),
            queue = %envelope.queue(),
            priority = envelope.priority(),
            fingerprint = %envelope.fingerprint().short(),
            "job enqueued"
        );
        state.jobs.insert(
            job_id,
            StoredJob {
                envelope,
                slot: Slot::Ready(0),
                history: Vec::new(),
                cancel: CancellationToken::new(),
            },
        );
        state.place(job_id, Utc::now());
        state.finished.remove(&job_id);
        state.counters.enqueued += 1;
        drop(state);

        self.available.notify_all();
        Ok(job_id)
    }

    fn lease(
        &self,
        queues: &[QueueName],
        worker_id: &str,
        lease_for: Duration,
        wait: Duration,
    ) -> Result<Option<LeasedJob>, BrokerError> {
        let deadline = Instant::now() + wait;
        let mut state = self.lock()?;

        loop {
            let now = Utc::now();
            if state.maintain(now, self.keep()) {
                self.available.notify_all();
            }

            if let Some(job_id) = state.pick(queues) {
                let lease_id = LeaseId::new();
                let expiry = now + to_chrono(lease_for);
                let Some(job) = state.jobs.get_mut(&job_id) else {
                    continue;
                };
                job.slot = Slot::Leased(lease_id);
                let leased = LeasedJob {
                    envelope: job.envelope.clone(),
                    lease_id,
                    worker_id: worker_id.to_string(),
                    leased_at: now,
                    lease_expiry: expiry,
                    cancel: job.cancel.clone(),
                };
                state.leases.insert(
                    lease_id,
                    LeaseRecord {
                        job_id,
                        worker_id: worker_id.to_string(),
                        leased_at: now,
                        expiry,
                    },
                );
                state.expiries.insert((expiry, lease_id));
                state.counters.leases_granted += 1;

                debug!(
                    job_id = %job_id,
                    lease_id = %lease_id,
                    worker = %worker_id,
                    kind = %leased.envelope.kind(),
                    queue = %leased.envelope.queue(),
                    attempt = leased.envelope.attempt(),
                    "job leased"
                );
                return Ok(Some(leased));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let timeout = state
                .until_next_event(now)
                .map_or(remaining, |next| next.min(remaining))
                .max(Duration::from_millis(1));
            state = self
                .available
                .wait_timeout(state, timeout)
                .map_err(|_| BrokerError::Poisoned)?
                .0;
        }
    }

    fn ack(&self, lease_id: LeaseId) -> Result<AckOutcome, BrokerError> {
        let mut state = self.lock_maintained()?;
        let job_id = state
            .leases
            .get(&lease_id)
            .map(|l| l.job_id)
            .ok_or(BrokerError::UnknownLease(lease_id))?;

        let job = state.unlink(job_id).ok_or(BrokerError::NotFound(job_id))?;
        let outcome = if job.cancel.is_cancelled() {
            state.counters.cancelled += 1;
            state.finish(job_id, JobState::Cancelled, self.keep());
            AckOutcome::Cancelled
        } else {
            state.counters.acked += 1;
            state.finish(job_id, JobState::Completed, self.keep());
            AckOutcome::Completed
        };
        debug!(job_id = %job_id, lease_id = %lease_id, outcome = ?outcome, "job acked");
        Ok(outcome)
    }

    fn nack(&self, lease_id: LeaseId, requeue: bool, error: &str) -> Result<NackOutcome, BrokerError> {
        let now = Utc::now();
        let keep = self.keep();
        let mut state = self.lock_maintained()?;
        let lease = state.leases.remove(&lease_id).ok_or(BrokerError::UnknownLease(lease_id))?;
        state.expiries.remove(&(lease.expiry, lease_id));

        let Some(job) = state.jobs.get_mut(&lease.job_id) else {
            return Err(BrokerError::NotFound(lease.job_id));
        };
        let attempt = job.envelope.record_failure();
        job.history.push(AttemptRecord {
            attempt,
            worker_id: lease.worker_id.clone(),
            started_at: lease.leased_at,
            finished_at: now,
            outcome: AttemptOutcome::Failed {
                error: error.to_string(),
                transient: requeue,
            },
        });

        if job.cancel.is_cancelled() {
            state.unlink(lease.job_id);
            state.counters.cancelled += 1;
            state.finish(lease.job_id, JobState::Cancelled, keep);
            return Ok(NackOutcome::Cancelled);
        }

        if !requeue {
            state.dead_letter(lease.job_id, DeadLetterReason::Permanent, error, now, keep);
            return Ok(NackOutcome::DeadLettered);
        }
        if job.envelope.is_exhausted() {
            state.dead_letter(lease.job_id, DeadLetterReason::Exhausted, error, now, keep);
            return Ok(NackOutcome::DeadLettered);
        }

        let retry_at = now + to_chrono(self.config.retry.delay_for_attempt(attempt));
        job.envelope.set_not_before(retry_at);
        state.place(lease.job_id, now);
        state.counters.requeued += 1;
        drop(state);
        self.available.notify_all();

        debug!(job_id = %lease.job_id, attempt, retry_at = %retry_at, error = %error, "job requeued");
        Ok(NackOutcome::Requeued { attempt, retry_at })
    }

    fn cancel(&self, job_id: JobId) -> Result<CancelOutcome, BrokerError> {
        let mut state = self.lock_maintained()?;
        let slot = match state.jobs.get(&job_id) {
            Some(job) => job.slot,
            None => return Ok(CancelOutcome::NotFound),
        };
        match slot {
            Slot::Leased(_) => {
                if let Some(job) = state.jobs.get(&job_id) {
                    job.cancel.cancel();
                }
                info!(job_id = %job_id, "cancellation signalled to running job");
                Ok(CancelOutcome::Signalled)
            }
            Slot::Ready(_) | Slot::Delayed(_) => {
                state.unlink(job_id);
                state.counters.cancelled += 1;
                state.finish(job_id, JobState::Cancelled, self.keep());
                info!(job_id = %job_id, "queued job cancelled");
                Ok(CancelOutcome::Removed)
            }
        }
    }

    fn job_state(&self, job_id: JobId) -> Result<Option<JobState>, BrokerError> {
        let state = self.lock_maintained()?;
        Ok(state.state_of(job_id))
    }

    fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, BrokerError> {
        let state = self.lock_maintained()?;
        Ok(state.dead.iter().take(limit).cloned().collect())
    }

    fn retry_dead_letter(&self, job_id: JobId) -> Result<JobEnvelope, BrokerError> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let index = state
            .dead
            .iter()
            .position(|d| d.envelope.id() == job_id)
            .ok_or(BrokerError::NotFound(job_id))?;
        let entry = state.dead.remove(index);

        let mut envelope = entry.envelope;
        envelope.reset_attempts();
        envelope.set_not_before(now);
        state.jobs.insert(
            job_id,
            StoredJob {
                envelope: envelope.clone(),
                slot: Slot::Ready(0),
                history: entry.history,
                cancel: CancellationToken::new(),
            },
        );
        state.place(job_id, now);
        state.counters.enqueued += 1;
        if state.finished.remove(&job_id).is_some() {
            state.finished_order.retain(|id| *id != job_id);
        }
        drop(state);
        self.available.notify_all();

        info!(job_id = %job_id, queue = %envelope.queue(), "dead-lettered job requeued");
        Ok(envelope)
    }

    fn delete_dead_letter(&self, job_id: JobId) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        let before = state.dead.len();
        state.dead.retain(|d| d.envelope.id() != job_id);
        if state.dead.len() == before {
            return Err(BrokerError::NotFound(job_id));
        }
        Ok(())
    }

    fn purge(&self, queue: QueueName) -> Result<usize, BrokerError> {
        let mut state = self.lock()?;
        let doomed: Vec<JobId> = state
            .jobs
            .iter()
            .filter(|(_, job)| job.envelope.queue() == queue && !matches!(job.slot, Slot::Leased(_)))
            .map(|(id, _)| *id)
            .collect();
        for job_id in &doomed {
            state.unlink(*job_id);
            state.counters.cancelled += 1;
            state.finish(*job_id, JobState::Cancelled, self.keep());
        }
        info!(queue = %queue, purged = doomed.len(), "queue purged");
        Ok(doomed.len())
    }

    fn stats(&self) -> Result<BrokerStats, BrokerError> {
        let state = self.lock_maintained()?;
        let mut queues: BTreeMap<QueueName, QueueDepth> =
            QueueName::ALL.iter().map(|q| (*q, QueueDepth::default())).collect();
        for job in state.jobs.values() {
            let depth = queues.entry(job.envelope.queue()).or_default();
            match job.slot {
                Slot::Ready(_) => depth.ready += 1,
                Slot::Delayed(_) => depth.delayed += 1,
                Slot::Leased(_) => depth.leased += 1,
            }
        }
        let c = &state.counters;
        Ok(BrokerStats {
            queues,
            dead_letters: state.dead.len(),
            enqueued: c.enqueued,
            leases_granted: c.leases_granted,
            acked: c.acked,
            requeued: c.requeued,
            expired: c.expired,
            cancelled: c.cancelled,
            dead_lettered: c.dead_lettered,
        })
    }
}
