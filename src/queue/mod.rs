//! Durable job queues and the worker runtime.
//!
//! Two queues share the same discipline (leased claims, bounded retries with
//! exponential backoff, terminal statuses) but differ in scope:
//!
//! - [`stage_jobs`]: typed to `(project, stage)`, executed by the stage
//!   worker, broadcasting every state change on the notification bus.
//! - [`generic_jobs`]: free-form `type` + payload with idempotency keys and
//!   explicit lease expiry, driving the template pipelines.
//!
//! [`worker`] owns the polling loop, per-stage timeouts, stuck-job recovery,
//! and graceful shutdown. [`agents`] holds the compile-time dispatch of
//! stage work.

pub mod agents;
pub mod generic_jobs;
pub mod stage_jobs;
pub mod worker;

pub use agents::{StageAgent, StageRunOutcome, StageRunResult, WorkerContext};
pub use worker::WorkerRuntime;
