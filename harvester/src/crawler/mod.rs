//! Crawl orchestration.
//!
//! [`Orchestrator`] expands submissions into [`TaskUnit`]s and hands them to a
//! [`CrawlWorkerPool`]. Each unit runs through [`UnitExecutor`], which pairs a
//! credential from the pool with a rate-limited request and records the
//! outcome in the progress ledger.

mod context;
mod error;
mod executor;
mod orchestrator;
mod progress;
mod rate_limiter;
mod retry;
mod task;
mod worker_pool;

pub use context::CrawlContext;
pub use error::CrawlError;
pub use executor::{UnitExecutor, UnitOutcome};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use progress::{ProgressSnapshot, ProgressTracker};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use retry::RetryPolicy;
pub use task::{DataKind, TaskUnit, TimeWindow, expand};
pub use worker_pool::{CrawlWorkerPool, SharedReceiver, UnitQueue, WorkerPoolConfig};
