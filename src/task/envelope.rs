//! The task protocol envelope threading run state through a chain of tasks

use crate::task::Task;
use crate::CrawlError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The `{run_id, step, data}` wrapper carried by every task that participates
/// in a chained run.
///
/// `step` is strictly non-decreasing along a run's linear chain; `run_id` is
/// stable within a chain and only changes when a handler explicitly forks a
/// sub-run. Deriving is copy-on-derive: the parent envelope is never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEnvelope {
    pub run_id: String,
    pub step: u32,
    pub data: Value,
}

impl TaskEnvelope {
    /// Starts a fresh run at step 0.
    pub fn root(run_id: impl Into<String>, data: Value) -> Self {
        TaskEnvelope {
            run_id: run_id.into(),
            step: 0,
            data,
        }
    }

    /// Decodes an envelope from a task payload.
    pub fn decode(task: &Task) -> Result<Self, CrawlError> {
        serde_json::from_slice(task.payload())
            .map_err(|e| CrawlError::Protocol(format!("malformed envelope: {}", e)))
    }

    /// Derives an envelope carrying `data` at the same run and step.
    pub fn derive(&self, data: Value) -> Self {
        TaskEnvelope {
            run_id: self.run_id.clone(),
            step: self.step,
            data,
        }
    }

    /// Derives an envelope carrying `data` one step further along the chain.
    pub fn next_step(&self, data: Value) -> Self {
        TaskEnvelope {
            run_id: self.run_id.clone(),
            step: self.step + 1,
            data,
        }
    }

    /// Derives an envelope starting a forked sub-run at step 0.
    pub fn fork(&self, run_id: impl Into<String>, data: Value) -> Self {
        TaskEnvelope {
            run_id: run_id.into(),
            step: 0,
            data,
        }
    }

    /// Encodes this envelope into a fresh task.
    pub fn into_task(self) -> Task {
        // serializing a Value cannot fail
        Task::new(serde_json::to_vec(&self).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_roundtrip() {
        let env = TaskEnvelope::root("cat1", json!({"url": "root"}));
        let task = env.clone().into_task();
        let decoded = TaskEnvelope::decode(&task).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_derive_keeps_run_and_step() {
        let env = TaskEnvelope {
            run_id: "r".into(),
            step: 3,
            data: json!(null),
        };
        let child = env.derive(json!({"page": 2}));
        assert_eq!(child.run_id, "r");
        assert_eq!(child.step, 3);
        // parent unchanged
        assert_eq!(env.step, 3);
    }

    #[test]
    fn test_next_step_increments() {
        let env = TaskEnvelope::root("r", json!(null));
        let next = env.next_step(json!(1));
        assert_eq!(next.step, 1);
        assert_eq!(next.run_id, "r");
    }

    #[test]
    fn test_fork_restarts_chain() {
        let env = TaskEnvelope {
            run_id: "r".into(),
            step: 5,
            data: json!(null),
        };
        let forked = env.fork("sub", json!(null));
        assert_eq!(forked.run_id, "sub");
        assert_eq!(forked.step, 0);
    }

    #[test]
    fn test_decode_malformed_is_protocol_error() {
        let task = Task::new(b"not json".to_vec());
        let err = TaskEnvelope::decode(&task).unwrap_err();
        assert!(matches!(err, CrawlError::Protocol(_)));
    }
}
