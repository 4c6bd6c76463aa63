use crate::endpoint::{EndpointError, InputEndpoint, OutputEndpoint};
use crate::task::Task;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct Entry {
    due: Instant,
    seq: u64,
    task: Task,
}

// earliest deadline first out of the max-heap; seq breaks ties in send order
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

/// A queue whose tasks only become receivable after a fixed delay.
///
/// Sending stamps the task with `now + delay`; receiving yields the earliest
/// stamped task once its deadline has passed, sleeping until then. This is how
/// a quarantined identity serves out its penalty window before release.
pub struct TimedQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    seq: AtomicU64,
    delay: Duration,
    arrived: Notify,
}

impl TimedQueue {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(TimedQueue {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            delay,
            arrived: Notify::new(),
        })
    }

    /// Number of tasks waiting out their delay.
    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl InputEndpoint for TimedQueue {
    async fn receive(&self) -> Result<Task, EndpointError> {
        loop {
            // register interest before inspecting the heap so a send between
            // the check and the await still wakes us
            let arrived = self.arrived.notified();
            let next_due = {
                let mut heap = self.heap.lock().unwrap();
                match heap.peek() {
                    Some(entry) if entry.due <= Instant::now() => {
                        // unwrap is fine: peek just succeeded
                        return Ok(heap.pop().unwrap().task);
                    }
                    Some(entry) => Some(entry.due),
                    None => None,
                }
            };

            match next_due {
                Some(due) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(due) => {}
                        _ = arrived => {}
                    }
                }
                None => arrived.await,
            }
        }
    }
}

#[async_trait]
impl OutputEndpoint for TimedQueue {
    async fn send(&self, task: Task) -> Result<(), EndpointError> {
        let entry = Entry {
            due: Instant::now() + self.delay,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
            task,
        };
        self.heap.lock().unwrap().push(entry);
        self.arrived.notify_one();
        Ok(())
    }
}
