//! Dependency-aware job scheduling.
//!
//! Build a [`Graph`] of [`Node`]s, declare precursors, ask it for a [`Plan`]
//! and [`Plan::run`] it on a bounded pool of workers. A node only runs once
//! all of its precursors succeeded; nodes downstream of a failure are failed
//! with [`JobError::DependencyFailed`] instead of being run. The
//! [`RetryHelper`] wraps a single fallible operation with backoff, a
//! deadline and fast-fail patterns.

pub mod node;
pub mod error_list;
pub mod graph;
pub mod executor;
pub mod runner;
pub mod retry;
pub mod duration;
mod panic_trace;

pub use node::Node;
pub use error_list::{ErrorList, NodeError};
pub use graph::{Graph, Plan, PlannedNode};
pub use executor::{Executor, JobKey, JobStatus, Work};
pub use retry::{AbortReason, FastFail, RetryExhausted, RetryHelper};
pub use duration::{DurationError, DurationList};

use thiserror::Error;

/// Boxed error returned by work functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by the graph, the executor and the runner themselves.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// A precursor id that is not in the graph.
    #[error("unknown node {0:?}")]
    UnknownNode(String),
    /// A plan target that is not in the graph.
    #[error("unknown target {0:?}")]
    UnknownTarget(String),
    /// The ids that could not be placed in a plan, sorted.
    #[error("circular dependency: {}", .0.join(", "))]
    CircularDependency(Vec<String>),
    /// A node was skipped because the named precursor failed.
    #[error("dependency {0:?} failed")]
    DependencyFailed(String),
    /// A work function panicked with this message.
    #[error("panic: {0}")]
    PanicRecovered(String),
    /// The job is not registered with the executor.
    #[error("not found")]
    NotFound,
    #[error("cancelled")]
    Cancelled,
    /// [`Executor::start`] was called twice.
    #[error("executor already started")]
    AlreadyStarted,
}
