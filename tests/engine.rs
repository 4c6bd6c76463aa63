//! Engine integration tests: run tracking, fan-out completion and routing
//! composed over in-process queues, no network involved.

use async_trait::async_trait;
use flowline::endpoint::{InputEndpoint, MemoryQueue, OutputEndpoint, QueueOrder};
use flowline::group::{Delivery, GroupHandle, RouteExt, Routed, TaskGroup, Worker};
use flowline::run::RunTracker;
use flowline::task::{Task, TaskEnvelope};
use flowline::{CrawlError, CrawlResult};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TreeRoute {
    Input,
    InputBack,
    Loop,
    Output,
}

/// Walks a static node tree the way the category crawler walks category
/// pages: each node fans out into its children and emits one record.
struct TreeWorker {
    tracker: Arc<RunTracker>,
    tree: HashMap<String, Vec<String>>,
}

#[async_trait]
impl Worker<TreeRoute> for TreeWorker {
    async fn handle(
        &self,
        group: &GroupHandle<TreeRoute>,
        delivery: Delivery<TreeRoute>,
    ) -> CrawlResult<Vec<Routed<TreeRoute>>> {
        let node = String::from_utf8(delivery.task.payload().to_vec())
            .map_err(|e| CrawlError::Protocol(e.to_string()))?;
        let is_root = delivery.origin == TreeRoute::Input;

        if is_root {
            if !self.tracker.accept_root(&[]) {
                return Ok(vec![delivery.task.route(TreeRoute::InputBack)]);
            }
            group.suspend_endpoint(TreeRoute::Input);
        }

        let children = self.tree.get(&node).cloned().unwrap_or_default();
        self.tracker.apply_fanout(children.len());

        let mut routed = Vec::new();
        for child in children {
            routed.push(Task::new(child).route(TreeRoute::Loop));
        }
        if !self.tracker.record_seen(&node) {
            routed.push(Task::new(format!("record:{}", node)).route(TreeRoute::Output));
        }
        Ok(routed)
    }
}

struct TreeHarness {
    input: Arc<MemoryQueue>,
    output: Arc<MemoryQueue>,
    cleanups: Arc<AtomicUsize>,
    _joins: JoinSet<()>,
    _shutdown: watch::Sender<bool>,
}

fn tree_harness(tree: &[(&str, &[&str])], capacity: usize) -> TreeHarness {
    let tree: HashMap<String, Vec<String>> = tree
        .iter()
        .map(|(node, children)| {
            (
                node.to_string(),
                children.iter().map(|c| c.to_string()).collect(),
            )
        })
        .collect();

    let input = MemoryQueue::unbounded(QueueOrder::Fifo);
    let output = MemoryQueue::unbounded(QueueOrder::Fifo);
    let inner = MemoryQueue::unbounded(QueueOrder::Lifo);
    let tracker = Arc::new(RunTracker::new());
    let cleanups = Arc::new(AtomicUsize::new(0));

    let hook_tracker = Arc::clone(&tracker);
    let hook_cleanups = Arc::clone(&cleanups);
    let group = TaskGroup::new("tree", capacity)
        .add_input(TreeRoute::Input, Arc::clone(&input) as _)
        .add_input(TreeRoute::Loop, Arc::clone(&inner) as _)
        .add_output(TreeRoute::Loop, inner)
        .add_output(TreeRoute::InputBack, Arc::clone(&input) as _)
        .add_output(TreeRoute::Output, Arc::clone(&output) as _)
        .with_worker(Arc::new(TreeWorker { tracker, tree }))
        .on_idle(Arc::new(move |handle: &GroupHandle<TreeRoute>| {
            if hook_tracker.finish_if_done() {
                hook_cleanups.fetch_add(1, Ordering::SeqCst);
                handle.resume_endpoint(TreeRoute::Input);
            }
        }));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut joins = JoinSet::new();
    group.spawn(&mut joins, shutdown_rx);

    TreeHarness {
        input,
        output,
        cleanups,
        _joins: joins,
        _shutdown: shutdown_tx,
    }
}

async fn collect_records(output: &Arc<MemoryQueue>, n: usize) -> Vec<String> {
    let mut records = Vec::new();
    for _ in 0..n {
        let task = tokio::time::timeout(Duration::from_secs(5), output.receive())
            .await
            .expect("timed out waiting for record")
            .unwrap();
        records.push(String::from_utf8(task.payload().to_vec()).unwrap());
    }
    records
}

#[tokio::test]
async fn test_fanout_run_completes_with_single_cleanup() {
    let harness = tree_harness(&[("root", &["a", "b", "c"])], 3);

    harness.input.send(Task::from("root")).await.unwrap();

    let mut records = collect_records(&harness.output, 4).await;
    records.sort();
    assert_eq!(records, ["record:a", "record:b", "record:c", "record:root"]);

    // all descendants done: cleanup fired exactly once, not once per leaf
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.cleanups.load(Ordering::SeqCst), 1);
    assert!(harness.output.is_empty());
}

#[tokio::test]
async fn test_empty_root_still_completes() {
    let harness = tree_harness(&[("root", &[])], 2);

    harness.input.send(Task::from("root")).await.unwrap();

    let records = collect_records(&harness.output, 1).await;
    assert_eq!(records, ["record:root"]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_overlapping_roots_run_one_at_a_time() {
    let harness = tree_harness(&[("root", &["a", "b"])], 2);

    // the second root must deflect while the first run is active, then get
    // accepted once ingestion resumes
    harness.input.send(Task::from("root")).await.unwrap();
    harness.input.send(Task::from("root")).await.unwrap();

    let records = collect_records(&harness.output, 6).await;
    assert_eq!(records.iter().filter(|r| *r == "record:root").count(), 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.cleanups.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_deep_chain_completes() {
    let harness = tree_harness(
        &[("root", &["a"]), ("a", &["b"]), ("b", &["c"]), ("c", &[])],
        2,
    );

    harness.input.send(Task::from("root")).await.unwrap();

    let mut records = collect_records(&harness.output, 4).await;
    records.sort();
    assert_eq!(records, ["record:a", "record:b", "record:c", "record:root"]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_envelope_chain_steps_are_monotonic() {
    // step only moves when a handler asks for the next stage
    let root = TaskEnvelope::root("run-7", json!({"page": 1}));
    let same = root.derive(json!({"page": 1, "extra": true}));
    let next = same.next_step(json!({"page": 2}));

    assert_eq!(root.step, 0);
    assert_eq!(same.step, 0);
    assert_eq!(next.step, 1);
    assert_eq!(next.run_id, "run-7");

    let forked = next.fork("run-8", json!({}));
    assert_eq!(forked.step, 0);
    assert_eq!(forked.run_id, "run-8");
}
