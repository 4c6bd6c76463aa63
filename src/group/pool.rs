//! Worker pool runtime: endpoint pumps, dispatch, outcome handling
//!
//! One pump task per input endpoint pulls tasks through a suspension gate
//! into a small dispatch channel; `capacity` worker tasks drain it. The pump
//! acknowledges each task on receipt, matching the at-least-once transports
//! this engine is built against.

use crate::endpoint::{EndpointError, InputEndpoint, OutputEndpoint};
use crate::group::{Delivery, GroupHandle, IdleHook, RouteKey, Routed, TaskGroup, Worker};
use crate::task::{Task, TaskEnvelope};
use crate::CrawlError;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

pub(crate) fn start<R: RouteKey>(
    group: TaskGroup<R>,
    joins: &mut JoinSet<()>,
    shutdown: watch::Receiver<bool>,
) -> GroupHandle<R> {
    let TaskGroup {
        name,
        capacity,
        inputs,
        outputs,
        worker,
        retry_route,
        ban_route,
        idle_hook,
    } = group;

    let name: Arc<str> = name.into();

    let mut gates = HashMap::new();
    for (route, _) in &inputs {
        gates.entry(*route).or_insert_with(|| watch::channel(false).0);
    }

    let handle = GroupHandle {
        name: Arc::clone(&name),
        active: Arc::new(Mutex::new(0)),
        gates: Arc::new(gates),
    };

    let worker = match worker {
        Some(w) => w,
        None => {
            tracing::error!("group {}: no handler set, group will not run", name);
            return handle;
        }
    };

    let (dispatch_tx, dispatch_rx) = mpsc::channel::<Delivery<R>>(1);

    for (route, endpoint) in inputs {
        let gate_rx = handle
            .gates
            .get(&route)
            .map(|g| g.subscribe())
            .unwrap_or_else(|| watch::channel(false).1);
        joins.spawn(pump(
            Arc::clone(&name),
            route,
            endpoint,
            gate_rx,
            dispatch_tx.clone(),
            shutdown.clone(),
        ));
    }
    // workers observe pump shutdown through channel closure
    drop(dispatch_tx);

    let dispatch_rx = Arc::new(tokio::sync::Mutex::new(dispatch_rx));
    let outputs = Arc::new(outputs);
    for _ in 0..capacity {
        joins.spawn(worker_loop(
            Arc::clone(&name),
            Arc::clone(&dispatch_rx),
            Arc::clone(&worker),
            handle.clone(),
            Arc::clone(&outputs),
            retry_route,
            ban_route,
            idle_hook.clone(),
            shutdown.clone(),
        ));
    }

    handle
}

/// Pulls tasks from one input endpoint into the dispatch channel, honoring
/// the endpoint's suspension gate.
async fn pump<R: RouteKey>(
    name: Arc<str>,
    route: R,
    endpoint: Arc<dyn InputEndpoint>,
    mut gate: watch::Receiver<bool>,
    dispatch: mpsc::Sender<Delivery<R>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        // park while suspended
        while *gate.borrow() {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                changed = gate.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = shutdown.changed() => {}
            }
        }
        if *shutdown.borrow() {
            return;
        }

        tokio::select! {
            received = endpoint.receive() => match received {
                Ok(mut task) => {
                    // transport handoff confirmed on receipt; redelivery past
                    // this point is the transport's crash story, not ours
                    task.ack();
                    if dispatch.send(Delivery { origin: route, task }).await.is_err() {
                        return;
                    }
                }
                Err(EndpointError::Closed) => {
                    tracing::warn!("group {}: input {:?} closed", name, route);
                    return;
                }
                Err(e) => {
                    tracing::error!("group {}: receive on {:?} failed: {}", name, route, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
            // a suspension toggled mid-receive must park the pump before the
            // next task is pulled; abandoning the receive is safe, the queue
            // hands a task over only at the moment receive completes
            _ = gate.changed() => {}
            _ = shutdown.changed() => {}
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop<R: RouteKey>(
    name: Arc<str>,
    dispatch: Arc<tokio::sync::Mutex<mpsc::Receiver<Delivery<R>>>>,
    worker: Arc<dyn Worker<R>>,
    handle: GroupHandle<R>,
    outputs: Arc<HashMap<R, Arc<dyn OutputEndpoint>>>,
    retry_route: Option<R>,
    ban_route: Option<R>,
    idle_hook: Option<IdleHook<R>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        let delivery = {
            let mut rx = dispatch.lock().await;
            tokio::select! {
                next = rx.recv() => match next {
                    Some(delivery) => delivery,
                    None => return,
                },
                _ = shutdown.changed() => continue,
            }
        };

        let retry_copy = delivery.task.retry_copy();
        {
            *handle.active.lock().unwrap() += 1;
        }

        match worker.handle(&handle, delivery).await {
            Ok(routed) => deliver(&name, &outputs, routed).await,
            Err(err) => {
                apply_outcome(&name, &outputs, retry_route, ban_route, err, retry_copy).await
            }
        }

        let idle = {
            let mut active = handle.active.lock().unwrap();
            *active -= 1;
            *active == 0
        };
        if idle {
            if let Some(hook) = &idle_hook {
                hook(&handle);
            }
        }
    }
}

/// Routes handler emissions to their registered outputs. An unregistered
/// destination is a programming error: fail fast, log, drop.
async fn deliver<R: RouteKey>(
    name: &str,
    outputs: &HashMap<R, Arc<dyn OutputEndpoint>>,
    routed: Vec<Routed<R>>,
) {
    for Routed { to, task } in routed {
        match outputs.get(&to) {
            Some(endpoint) => {
                if let Err(e) = endpoint.send(task).await {
                    tracing::error!("group {}: send to {:?} failed: {}", name, to, e);
                }
            }
            None => {
                tracing::error!(
                    "group {}: protocol violation: no output for {:?}, task dropped",
                    name,
                    to
                );
            }
        }
    }
}

/// Converts a handler error into its pool-level outcome.
async fn apply_outcome<R: RouteKey>(
    name: &str,
    outputs: &HashMap<R, Arc<dyn OutputEndpoint>>,
    retry_route: Option<R>,
    ban_route: Option<R>,
    err: CrawlError,
    retry_copy: Task,
) {
    match err {
        CrawlError::TransientFetch { ref url, .. } | CrawlError::ChallengeDetected { ref url } => {
            tracing::warn!("group {}: {}", name, err);
            requeue(name, outputs, retry_route, retry_copy, url).await;
        }
        CrawlError::BanDetected { ref url, ref proxy } => {
            tracing::warn!("group {}: {}", name, err);
            if let Some(ban) = ban_route {
                let notice = TaskEnvelope::root(
                    "ban",
                    json!({ "url": url, "proxy": proxy }),
                )
                .into_task();
                deliver(name, outputs, vec![Routed::new(ban, notice)]).await;
            }
            requeue(name, outputs, retry_route, retry_copy, url).await;
        }
        CrawlError::Extraction {
            platform,
            url,
            message,
        } => {
            // retrying an unparseable page wastes a fetch
            tracing::error!(
                "group {}: extraction failed, task dropped\n{} {}: {}",
                name,
                platform,
                url,
                message
            );
        }
        CrawlError::Protocol(message) => {
            tracing::error!("group {}: protocol violation, task dropped: {}", name, message);
        }
    }
}

async fn requeue<R: RouteKey>(
    name: &str,
    outputs: &HashMap<R, Arc<dyn OutputEndpoint>>,
    retry_route: Option<R>,
    task: Task,
    url: &str,
) {
    match retry_route {
        Some(route) => deliver(name, outputs, vec![Routed::new(route, task)]).await,
        None => tracing::warn!(
            "group {}: no retry route configured, dropping task for {}",
            name,
            url
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{MemoryQueue, QueueOrder};
    use crate::group::RouteExt;
    use crate::CrawlResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TestRoute {
        In,
        Out,
        Retry,
    }

    struct EchoWorker;

    #[async_trait]
    impl Worker<TestRoute> for EchoWorker {
        async fn handle(
            &self,
            _group: &GroupHandle<TestRoute>,
            delivery: Delivery<TestRoute>,
        ) -> CrawlResult<Vec<Routed<TestRoute>>> {
            Ok(vec![delivery.task.route(TestRoute::Out)])
        }
    }

    /// Tracks the maximum number of concurrently executing handlers.
    struct ConcurrencyProbe {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    struct SlowWorker(Arc<ConcurrencyProbe>);

    #[async_trait]
    impl Worker<TestRoute> for SlowWorker {
        async fn handle(
            &self,
            _group: &GroupHandle<TestRoute>,
            delivery: Delivery<TestRoute>,
        ) -> CrawlResult<Vec<Routed<TestRoute>>> {
            let now = self.0.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.0.current.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![delivery.task.route(TestRoute::Out)])
        }
    }

    struct FailingWorker;

    #[async_trait]
    impl Worker<TestRoute> for FailingWorker {
        async fn handle(
            &self,
            _group: &GroupHandle<TestRoute>,
            delivery: Delivery<TestRoute>,
        ) -> CrawlResult<Vec<Routed<TestRoute>>> {
            match delivery.task.payload() {
                b"transient" => Err(CrawlError::TransientFetch {
                    url: "http://x/".into(),
                    reason: "timeout".into(),
                }),
                b"unparseable" => Err(CrawlError::Extraction {
                    platform: "test".into(),
                    url: "http://x/".into(),
                    message: "bad shape".into(),
                }),
                _ => Ok(vec![delivery.task.route(TestRoute::Out)]),
            }
        }
    }

    fn harness() -> (watch::Sender<bool>, watch::Receiver<bool>, JoinSet<()>) {
        let (tx, rx) = watch::channel(false);
        (tx, rx, JoinSet::new())
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_capacity() {
        let (_tx, rx, mut joins) = harness();
        let input = MemoryQueue::unbounded(QueueOrder::Fifo);
        let output = MemoryQueue::unbounded(QueueOrder::Fifo);
        let probe = Arc::new(ConcurrencyProbe {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });

        let group = TaskGroup::new("bounded", 3)
            .add_input(TestRoute::In, input.clone())
            .add_output(TestRoute::Out, output.clone())
            .with_worker(Arc::new(SlowWorker(Arc::clone(&probe))));
        group.spawn(&mut joins, rx);

        for i in 0..10 {
            input.send(Task::new(format!("t{}", i))).await.unwrap();
        }
        for _ in 0..10 {
            output.receive().await.unwrap();
        }
        assert!(probe.peak.load(Ordering::SeqCst) <= 3);
        assert!(probe.peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_routes_to_registered_output() {
        let (_tx, rx, mut joins) = harness();
        let input = MemoryQueue::unbounded(QueueOrder::Fifo);
        let output = MemoryQueue::unbounded(QueueOrder::Fifo);

        let group = TaskGroup::new("echo", 1)
            .add_input(TestRoute::In, input.clone())
            .add_output(TestRoute::Out, output.clone())
            .with_worker(Arc::new(EchoWorker));
        group.spawn(&mut joins, rx);

        input.send(Task::from("ping")).await.unwrap();
        assert_eq!(output.receive().await.unwrap().payload(), b"ping");
    }

    #[tokio::test]
    async fn test_transient_failure_requeues() {
        let (_tx, rx, mut joins) = harness();
        let input = MemoryQueue::unbounded(QueueOrder::Fifo);
        let output = MemoryQueue::unbounded(QueueOrder::Fifo);
        let retry = MemoryQueue::unbounded(QueueOrder::Fifo);

        let group = TaskGroup::new("failing", 1)
            .add_input(TestRoute::In, input.clone())
            .add_output(TestRoute::Out, output.clone())
            .add_output(TestRoute::Retry, retry.clone())
            .retry_to(TestRoute::Retry)
            .with_worker(Arc::new(FailingWorker));
        group.spawn(&mut joins, rx);

        input.send(Task::from("transient")).await.unwrap();
        assert_eq!(retry.receive().await.unwrap().payload(), b"transient");
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn test_extraction_failure_drops_without_blocking() {
        let (_tx, rx, mut joins) = harness();
        let input = MemoryQueue::unbounded(QueueOrder::Fifo);
        let output = MemoryQueue::unbounded(QueueOrder::Fifo);

        let group = TaskGroup::new("failing", 1)
            .add_input(TestRoute::In, input.clone())
            .add_output(TestRoute::Out, output.clone())
            .with_worker(Arc::new(FailingWorker));
        group.spawn(&mut joins, rx);

        input.send(Task::from("unparseable")).await.unwrap();
        input.send(Task::from("fine")).await.unwrap();

        // the unparseable task is dropped; the next one flows through
        assert_eq!(output.receive().await.unwrap().payload(), b"fine");
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn test_suspend_and_resume_input() {
        let (_tx, rx, mut joins) = harness();
        let input = MemoryQueue::unbounded(QueueOrder::Fifo);
        let output = MemoryQueue::unbounded(QueueOrder::Fifo);

        let group = TaskGroup::new("gated", 1)
            .add_input(TestRoute::In, input.clone())
            .add_output(TestRoute::Out, output.clone())
            .with_worker(Arc::new(EchoWorker));
        let handle = group.spawn(&mut joins, rx);

        handle.suspend_endpoint(TestRoute::In);
        tokio::time::sleep(Duration::from_millis(20)).await;
        input.send(Task::from("gated")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(output.is_empty());

        handle.resume_endpoint(TestRoute::In);
        assert_eq!(output.receive().await.unwrap().payload(), b"gated");
    }

    #[tokio::test]
    async fn test_unregistered_destination_is_dropped() {
        struct MisroutingWorker;

        #[async_trait]
        impl Worker<TestRoute> for MisroutingWorker {
            async fn handle(
                &self,
                _group: &GroupHandle<TestRoute>,
                delivery: Delivery<TestRoute>,
            ) -> CrawlResult<Vec<Routed<TestRoute>>> {
                // Retry is never registered as an output here
                Ok(vec![delivery.task.route(TestRoute::Retry)])
            }
        }

        let (_tx, rx, mut joins) = harness();
        let input = MemoryQueue::unbounded(QueueOrder::Fifo);
        let output = MemoryQueue::unbounded(QueueOrder::Fifo);

        let group = TaskGroup::new("misrouting", 1)
            .add_input(TestRoute::In, input.clone())
            .add_output(TestRoute::Out, output.clone())
            .with_worker(Arc::new(MisroutingWorker));
        group.spawn(&mut joins, rx);

        input.send(Task::from("lost")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(output.is_empty());
    }
}
