//! Background job system: broker, worker pool and recurring schedules.
//!
//! ## Components
//!
//! - `JobEnvelope`: a unit of work with kind, queue, priority and attempt count
//! - `QueueBroker`: lease-based multi-queue delivery with delays and dead letters
//! - `WorkerPool`: threads that lease jobs and dispatch them by kind
//! - `JobScheduler`: enqueues recurring jobs on a monotonic clock

pub mod broker;
pub mod cancel;
pub mod executor;
pub mod scheduler;
pub mod types;

pub use broker::{
    AckOutcome, BrokerConfig, BrokerError, BrokerStats, CancelOutcome, InMemoryBroker, NackOutcome, QueueBroker,
    QueueDepth,
};
pub use cancel::CancellationToken;
pub use executor::{
    CompletionSink, ExecutorStats, HandlerRegistry, InMemoryCompletionSink, JobCompletion, JobContext, JobHandler,
    Settlement, WorkerPool, WorkerPoolConfig, WorkerPoolHandle,
};
pub use scheduler::{
    JobScheduler, OccurrenceState, ScheduleDefinition, ScheduleError, ScheduleStats, SchedulerHandle,
};
pub use types::{
    AttemptOutcome, AttemptRecord, BackoffStrategy, DEFAULT_MAX_ATTEMPTS, DeadLetterEntry, DeadLetterReason,
    JobEnvelope, JobError, JobKind, JobState, LeasedJob, QueueName, RetryPolicy,
};
