use crate::endpoint::{EndpointError, InputEndpoint, OutputEndpoint};
use crate::task::Task;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Delivery order of an in-process queue.
///
/// Recursive traversals use LIFO loop-back queues so the frontier stays
/// depth-first and bounded; everything else is FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrder {
    Fifo,
    Lifo,
}

/// An in-process task queue usable as both input and output endpoint.
///
/// Receivers park on an item permit, senders on a space permit when the queue
/// is bounded, so backpressure and wakeups need no busy-waiting. Within one
/// queue, FIFO order is delivery order; claims about cross-queue interleaving
/// are the group's business, not ours.
pub struct MemoryQueue {
    deque: Mutex<VecDeque<Task>>,
    items: Semaphore,
    space: Option<Semaphore>,
    order: QueueOrder,
}

impl MemoryQueue {
    /// An unbounded queue.
    pub fn unbounded(order: QueueOrder) -> Arc<Self> {
        Arc::new(MemoryQueue {
            deque: Mutex::new(VecDeque::new()),
            items: Semaphore::new(0),
            space: None,
            order,
        })
    }

    /// A queue that blocks senders once `capacity` tasks are waiting.
    pub fn bounded(order: QueueOrder, capacity: usize) -> Arc<Self> {
        Arc::new(MemoryQueue {
            deque: Mutex::new(VecDeque::new()),
            items: Semaphore::new(0),
            space: Some(Semaphore::new(capacity)),
            order,
        })
    }

    /// Number of tasks currently queued.
    pub fn len(&self) -> usize {
        self.deque.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl InputEndpoint for MemoryQueue {
    async fn receive(&self) -> Result<Task, EndpointError> {
        let permit = self
            .items
            .acquire()
            .await
            .map_err(|_| EndpointError::Closed)?;
        permit.forget();
        let task = {
            let mut deque = self.deque.lock().unwrap();
            match self.order {
                QueueOrder::Fifo => deque.pop_front(),
                QueueOrder::Lifo => deque.pop_back(),
            }
        };
        if let Some(space) = &self.space {
            space.add_permits(1);
        }
        // an item permit was held, so the queue cannot have been empty
        task.ok_or(EndpointError::Closed)
    }
}

#[async_trait]
impl OutputEndpoint for MemoryQueue {
    async fn send(&self, task: Task) -> Result<(), EndpointError> {
        if let Some(space) = &self.space {
            let permit = space.acquire().await.map_err(|_| EndpointError::Closed)?;
            permit.forget();
        }
        self.deque.lock().unwrap().push_back(task);
        self.items.add_permits(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let q = MemoryQueue::unbounded(QueueOrder::Fifo);
        q.send(Task::from("a")).await.unwrap();
        q.send(Task::from("b")).await.unwrap();
        assert_eq!(q.receive().await.unwrap().payload(), b"a");
        assert_eq!(q.receive().await.unwrap().payload(), b"b");
    }

    #[tokio::test]
    async fn test_lifo_order() {
        let q = MemoryQueue::unbounded(QueueOrder::Lifo);
        q.send(Task::from("a")).await.unwrap();
        q.send(Task::from("b")).await.unwrap();
        assert_eq!(q.receive().await.unwrap().payload(), b"b");
        assert_eq!(q.receive().await.unwrap().payload(), b"a");
    }

    #[tokio::test]
    async fn test_receive_waits_for_send() {
        let q = MemoryQueue::unbounded(QueueOrder::Fifo);
        let q2 = Arc::clone(&q);
        let recv = tokio::spawn(async move { q2.receive().await.unwrap() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.send(Task::from("late")).await.unwrap();
        assert_eq!(recv.await.unwrap().payload(), b"late");
    }

    #[tokio::test]
    async fn test_bounded_send_backpressure() {
        let q = MemoryQueue::bounded(QueueOrder::Fifo, 1);
        q.send(Task::from("a")).await.unwrap();

        // second send must park until the first task is drained
        let q2 = Arc::clone(&q);
        let blocked = tokio::spawn(async move { q2.send(Task::from("b")).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!blocked.is_finished());

        assert_eq!(q.receive().await.unwrap().payload(), b"a");
        blocked.await.unwrap().unwrap();
        assert_eq!(q.receive().await.unwrap().payload(), b"b");
    }
}
