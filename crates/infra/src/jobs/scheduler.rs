//! Recurring job definitions driven by a monotonic clock.

use std::collections::{BTreeMap, HashSet};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use tubewatch_core::JobId;

use super::broker::QueueBroker;
use super::types::{JobEnvelope, JobKind, JobState, QueueName};

/// Longest the scheduler thread sleeps between clock checks.
const MAX_IDLE: Duration = Duration::from_secs(1);

/// One recurring job. Static after startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub name: String,
    pub kind: JobKind,
    /// Defaults to the kind's queue
    pub queue: Option<QueueName>,
    pub period: Duration,
    /// Skip a tick while the previous occurrence is still queued or running
    pub no_overlap: bool,
    pub run_on_start: bool,
    pub priority: Option<i32>,
    pub max_attempts: Option<u32>,
    pub payload: Value,
}

impl ScheduleDefinition {
    pub fn new(name: impl Into<String>, kind: JobKind, period: Duration) -> Self {
        Self {
            name: name.into(),
            kind,
            queue: None,
            period,
            no_overlap: true,
            run_on_start: false,
            priority: None,
            max_attempts: None,
            payload: Value::Object(Default::default()),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn on_queue(mut self, queue: QueueName) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn allow_overlap(mut self) -> Self {
        self.no_overlap = false;
        self
    }

    pub fn run_on_start(mut self) -> Self {
        self.run_on_start = true;
        self
    }

    fn envelope(&self) -> Result<JobEnvelope, serde_json::Error> {
        let mut envelope = JobEnvelope::json(self.kind, &self.payload)?;
        if let Some(queue) = self.queue {
            envelope = envelope.on_queue(queue);
        }
        if let Some(priority) = self.priority {
            envelope = envelope.with_priority(priority);
        }
        if let Some(max_attempts) = self.max_attempts {
            envelope = envelope.with_max_attempts(max_attempts);
        }
        Ok(envelope)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("schedule {0} has a zero period")]
    ZeroPeriod(String),
    #[error("schedule name {0} is used more than once")]
    DuplicateName(String),
}

/// Where the latest occurrence of a definition is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OccurrenceState {
    Idle,
    Enqueued,
    Running,
}

impl OccurrenceState {
    fn from_job_state(state: Option<JobState>) -> Self {
        match state {
            Some(JobState::Queued | JobState::Delayed) => OccurrenceState::Enqueued,
            Some(JobState::Leased) => OccurrenceState::Running,
            _ => OccurrenceState::Idle,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleStats {
    pub enqueued: u64,
    pub skipped_overlap: u64,
    pub failed_enqueues: u64,
    pub last_job: Option<JobId>,
    pub last_enqueued_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Entry {
    definition: ScheduleDefinition,
    next_due: Instant,
    stats: ScheduleStats,
}

/// Enqueues recurring jobs when they fall due.
pub struct JobScheduler {
    broker: Arc<dyn QueueBroker>,
    entries: Vec<Entry>,
}

impl core::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobScheduler").field("entries", &self.entries).finish()
    }
}

impl JobScheduler {
    /// Build a scheduler whose first ticks are measured from `start`.
    pub fn new(
        broker: Arc<dyn QueueBroker>,
        definitions: Vec<ScheduleDefinition>,
        start: Instant,
    ) -> Result<Self, ScheduleError> {
        let mut names = HashSet::new();
        let mut entries = Vec::with_capacity(definitions.len());
        for definition in definitions {
            if definition.period.is_zero() {
                return Err(ScheduleError::ZeroPeriod(definition.name));
            }
            if !names.insert(definition.name.clone()) {
                return Err(ScheduleError::DuplicateName(definition.name));
            }
            let next_due = if definition.run_on_start {
                start
            } else {
                start + definition.period
            };
            entries.push(Entry {
                definition,
                next_due,
                stats: ScheduleStats::default(),
            });
        }
        Ok(Self { broker, entries })
    }

    pub fn definitions(&self) -> impl Iterator<Item = &ScheduleDefinition> {
        self.entries.iter().map(|e| &e.definition)
    }

    fn occurrence(&self, entry: &Entry) -> OccurrenceState {
        let Some(job_id) = entry.stats.last_job else {
            return OccurrenceState::Idle;
        };
        match self.broker.job_state(job_id) {
            Ok(state) => OccurrenceState::from_job_state(state),
            Err(e) => {
                // Cannot tell; assume the job is still in the system.
                warn!(schedule = %entry.definition.name, error = %e, "could not read occurrence state");
                OccurrenceState::Enqueued
            }
        }
    }

    pub fn state(&self, name: &str) -> Option<OccurrenceState> {
        let entry = self.entries.iter().find(|e| e.definition.name == name)?;
        Some(self.occurrence(entry))
    }

    pub fn stats(&self) -> BTreeMap<String, ScheduleStats> {
        self.entries
            .iter()
            .map(|e| (e.definition.name.clone(), e.stats.clone()))
            .collect()
    }

    /// Earliest instant any definition falls due.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.next_due).min()
    }

    /// Fire every definition due at `now`. Returns how many jobs were enqueued.
    ///
    /// A definition that missed several periods fires once and then resumes
    /// one period after `now`.
    pub fn run_pending(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        for index in 0..self.entries.len() {
            if self.entries[index].next_due > now {
                continue;
            }
            let state = self.occurrence(&self.entries[index]);
            let entry = &mut self.entries[index];
            let name = entry.definition.name.clone();

            if entry.definition.no_overlap && state != OccurrenceState::Idle {
                entry.stats.skipped_overlap += 1;
                warn!(schedule = %name, previous = ?entry.stats.last_job, state = ?state, "previous occurrence still active; tick skipped");
            } else {
                let enqueued = entry
                    .definition
                    .envelope()
                    .map_err(|e| e.to_string())
                    .and_then(|env| self.broker.enqueue(env).map_err(|e| e.to_string()));
                match enqueued {
                    Ok(job_id) => {
                        entry.stats.enqueued += 1;
                        entry.stats.last_job = Some(job_id);
                        entry.stats.last_enqueued_at = Some(Utc::now());
                        fired += 1;
                        info!(schedule = %name, job_id = %job_id, kind = %entry.definition.kind, "scheduled job enqueued");
                    }
                    Err(e) => {
                        entry.stats.failed_enqueues += 1;
                        error!(schedule = %name, error = %e, "failed to enqueue scheduled job");
                    }
                }
            }

            entry.next_due += entry.definition.period;
            if entry.next_due <= now {
                entry.next_due = now + entry.definition.period;
            }
        }
        fired
    }

    /// Run the scheduler loop on its own thread.
    pub fn spawn(self) -> std::io::Result<SchedulerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let scheduler = Arc::new(Mutex::new(self));
        let loop_scheduler = scheduler.clone();

        let join = thread::Builder::new()
            .name("job-scheduler".to_string())
            .spawn(move || scheduler_loop(&loop_scheduler, shutdown_rx))?;

        Ok(SchedulerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            scheduler,
        })
    }
}

fn scheduler_loop(scheduler: &Mutex<JobScheduler>, shutdown_rx: mpsc::Receiver<()>) {
    info!("job scheduler started");
    loop {
        let wait = {
            let mut scheduler = scheduler.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let fired = scheduler.run_pending(now);
            if fired > 0 {
                debug!(fired, "scheduler tick");
            }
            scheduler
                .next_wakeup()
                .map_or(MAX_IDLE, |at| at.saturating_duration_since(now))
                .clamp(Duration::from_millis(1), MAX_IDLE)
        };

        match shutdown_rx.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
    info!("job scheduler stopped");
}

/// Handle to a running scheduler thread.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    scheduler: Arc<Mutex<JobScheduler>>,
}

impl SchedulerHandle {
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> BTreeMap<String, ScheduleStats> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner).stats()
    }

    pub fn state(&self, name: &str) -> Option<OccurrenceState> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner).state(name)
    }
}
