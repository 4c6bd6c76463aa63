//! Suspendable sources and sinks of tasks
//!
//! Endpoints abstract the underlying transport. Anything satisfying the two
//! traits here plugs into a task group: a broker queue, a key-value list, or
//! the in-process queues this crate ships. The engine guarantees at-least-once
//! handoff, not exactly-once; downstream idempotence is keyed on the record's
//! natural key.
//!
//! Suspension and resumption are not transport operations: the owning task
//! group simply stops polling a suspended input (see
//! [`crate::group::GroupHandle::suspend_endpoint`]).

mod delay;
mod memory;

pub use delay::TimedQueue;
pub use memory::{MemoryQueue, QueueOrder};

use crate::task::Task;
use async_trait::async_trait;
use thiserror::Error;

/// Endpoint transport errors
#[derive(Debug, Error)]
pub enum EndpointError {
    /// The transport is gone and will never yield or accept another task.
    #[error("endpoint closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),
}

/// A source of tasks. `receive` suspends the calling worker (never the pool)
/// until a task is available.
#[async_trait]
pub trait InputEndpoint: Send + Sync + 'static {
    async fn receive(&self) -> Result<Task, EndpointError>;
}

/// A sink of tasks. `send` suspends until the transport accepts the task,
/// which bounds the sender when the sink is backpressured.
#[async_trait]
pub trait OutputEndpoint: Send + Sync + 'static {
    async fn send(&self, task: Task) -> Result<(), EndpointError>;
}
