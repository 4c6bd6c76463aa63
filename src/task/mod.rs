//! Routable units of work
//!
//! A [`Task`] is a payload plus an acknowledgement hook back to the transport
//! it arrived on. Routing tags are not part of the task itself: the group
//! runtime carries the origin beside the task on delivery, and handlers attach
//! the destination when they emit (see [`crate::group`]).

mod envelope;

pub use envelope::TaskEnvelope;

use tokio::sync::oneshot;

/// Acknowledgement hook owned by a task.
///
/// Transports that redeliver on crash attach one of these when they hand a
/// task over; firing it confirms the task was processed. In-memory transports
/// leave it empty. Delivery is at-least-once either way: downstream
/// idempotence is keyed on the record's natural key, not on the ack.
#[derive(Debug, Default)]
pub struct Ack(Option<oneshot::Sender<()>>);

impl Ack {
    /// An ack that confirms nothing (in-process transports).
    pub fn none() -> Self {
        Ack(None)
    }

    /// An ack wired to the given confirmation channel.
    pub fn via(tx: oneshot::Sender<()>) -> Self {
        Ack(Some(tx))
    }

    /// Fires the acknowledgement. Safe to call on an empty ack.
    pub fn fire(&mut self) {
        if let Some(tx) = self.0.take() {
            // receiver may already be gone; nothing to do then
            let _ = tx.send(());
        }
    }
}

/// A unit of routable work: opaque payload bytes plus its ack hook.
#[derive(Debug, Default)]
pub struct Task {
    payload: Vec<u8>,
    ack: Ack,
}

impl Task {
    /// Creates a task around the given payload bytes.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Task {
            payload: payload.into(),
            ack: Ack::none(),
        }
    }

    /// Creates a task carrying an acknowledgement hook.
    pub fn with_ack(payload: impl Into<Vec<u8>>, ack: Ack) -> Self {
        Task {
            payload: payload.into(),
            ack,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Confirms processing back to the origin transport.
    pub fn ack(&mut self) {
        self.ack.fire();
    }

    /// A copy of this task's payload without the ack hook.
    ///
    /// The pool uses this to keep a requeue candidate while the handler owns
    /// the original; only one of the two ever reaches a destination.
    pub fn retry_copy(&self) -> Task {
        Task::new(self.payload.clone())
    }
}

impl From<&str> for Task {
    fn from(s: &str) -> Self {
        Task::new(s.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_roundtrip() {
        let task = Task::new(b"hello".to_vec());
        assert_eq!(task.payload(), b"hello");
    }

    #[test]
    fn test_ack_fires_once() {
        let (tx, mut rx) = oneshot::channel();
        let mut task = Task::with_ack(b"x".to_vec(), Ack::via(tx));
        task.ack();
        assert!(rx.try_recv().is_ok());
        // second fire is a no-op
        task.ack();
    }

    #[test]
    fn test_retry_copy_drops_ack() {
        let (tx, mut rx) = oneshot::channel();
        let task = Task::with_ack(b"x".to_vec(), Ack::via(tx));
        let mut copy = task.retry_copy();
        assert_eq!(copy.payload(), b"x");
        copy.ack();
        assert!(rx.try_recv().is_err());
    }
}
