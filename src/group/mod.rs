//! Task groups: named channels multiplexed into a bounded worker pool
//!
//! A [`TaskGroup`] owns a set of input endpoints, a set of output endpoints
//! and a handler. Tasks arriving on any registered input are delivered to the
//! same handler, tagged with their origin route; results come back tagged with
//! a destination route and are forwarded to the matching output.
//!
//! Routes are closed per-pipeline enums rather than runtime strings, so a
//! group's channel topology is fixed at construction. An emission to a route
//! with no registered output is a protocol violation: logged, dropped, never
//! retried.
//!
//! Two structural patterns recur. A *single-stage* group reads one primary
//! input and loops results back through a sibling queue. A *two-stage* split
//! puts admission in a capacity-1 "task" group that gates one logical run at
//! a time and fans work into an internal queue drained by a wide "work" group,
//! which reports completion back over a dedicated notify channel.

mod pool;

use crate::endpoint::{InputEndpoint, OutputEndpoint};
use crate::task::Task;
use crate::CrawlResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Marker bound for route enums. Implemented automatically for any
/// `Copy + Eq + Hash + Debug` type, which every pipeline route enum is.
pub trait RouteKey: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Copy + Eq + Hash + Debug + Send + Sync + 'static> RouteKey for T {}

/// A task as delivered to a handler, tagged with the route it arrived on.
#[derive(Debug)]
pub struct Delivery<R: RouteKey> {
    pub origin: R,
    pub task: Task,
}

/// A task as emitted by a handler, tagged with its destination route.
#[derive(Debug)]
pub struct Routed<R: RouteKey> {
    pub to: R,
    pub task: Task,
}

impl<R: RouteKey> Routed<R> {
    pub fn new(to: R, task: Task) -> Self {
        Routed { to, task }
    }
}

/// Attaches a destination route to a task.
pub trait RouteExt: Sized {
    fn route<R: RouteKey>(self, to: R) -> Routed<R>;
}

impl RouteExt for Task {
    fn route<R: RouteKey>(self, to: R) -> Routed<R> {
        Routed::new(to, self)
    }
}

/// A task handler. One `handle` call per delivered task, at most `capacity`
/// of them in flight per group. Returning `Err` never crashes the pool: the
/// pool converts the error into a requeue, a remediation notice, or a logged
/// drop (see [`crate::CrawlError`]).
#[async_trait]
pub trait Worker<R: RouteKey>: Send + Sync + 'static {
    async fn handle(
        &self,
        group: &GroupHandle<R>,
        delivery: Delivery<R>,
    ) -> CrawlResult<Vec<Routed<R>>>;
}

/// Hook invoked when the pool's active count returns to zero after a task
/// completes. Run-tracker pipelines use it for the last-worker-standing
/// completion check.
pub type IdleHook<R> = Arc<dyn Fn(&GroupHandle<R>) + Send + Sync>;

/// Handler-facing view of a running group: suspension gates and the live
/// worker count.
pub struct GroupHandle<R: RouteKey> {
    name: Arc<str>,
    active: Arc<Mutex<usize>>,
    gates: Arc<HashMap<R, watch::Sender<bool>>>,
}

impl<R: RouteKey> Clone for GroupHandle<R> {
    fn clone(&self) -> Self {
        GroupHandle {
            name: Arc::clone(&self.name),
            active: Arc::clone(&self.active),
            gates: Arc::clone(&self.gates),
        }
    }
}

impl<R: RouteKey> GroupHandle<R> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops polling the given input endpoint. A task already pulled off the
    /// transport is still delivered; nothing new is fetched.
    pub fn suspend_endpoint(&self, route: R) {
        match self.gates.get(&route) {
            Some(gate) => {
                let _ = gate.send_replace(true);
                tracing::debug!("group {}: suspended input {:?}", self.name, route);
            }
            None => tracing::error!("group {}: no such input to suspend: {:?}", self.name, route),
        }
    }

    /// Resumes polling a suspended input endpoint.
    pub fn resume_endpoint(&self, route: R) {
        match self.gates.get(&route) {
            Some(gate) => {
                let _ = gate.send_replace(false);
                tracing::debug!("group {}: resumed input {:?}", self.name, route);
            }
            None => tracing::error!("group {}: no such input to resume: {:?}", self.name, route),
        }
    }

    /// Number of handler invocations currently executing, the calling one
    /// included when called from inside a handler.
    pub fn running_cnt(&self) -> usize {
        *self.active.lock().unwrap()
    }
}

/// Builder and owner of one task group. `start` wires the pumps and the
/// worker pool onto a join set and hands back the group's handle.
pub struct TaskGroup<R: RouteKey> {
    name: String,
    capacity: usize,
    inputs: Vec<(R, Arc<dyn InputEndpoint>)>,
    outputs: HashMap<R, Arc<dyn OutputEndpoint>>,
    worker: Option<Arc<dyn Worker<R>>>,
    retry_route: Option<R>,
    ban_route: Option<R>,
    idle_hook: Option<IdleHook<R>>,
}

impl<R: RouteKey> TaskGroup<R> {
    /// A group named `name` running at most `capacity` concurrent handlers.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        TaskGroup {
            name: name.into(),
            capacity: capacity.max(1),
            inputs: Vec::new(),
            outputs: HashMap::new(),
            worker: None,
            retry_route: None,
            ban_route: None,
            idle_hook: None,
        }
    }

    /// Registers an input endpoint under a route.
    pub fn add_input(mut self, route: R, endpoint: Arc<dyn InputEndpoint>) -> Self {
        self.inputs.push((route, endpoint));
        self
    }

    /// Registers an output endpoint under a route.
    pub fn add_output(mut self, route: R, endpoint: Arc<dyn OutputEndpoint>) -> Self {
        self.outputs.insert(route, endpoint);
        self
    }

    /// Sets the handler.
    pub fn with_worker(mut self, worker: Arc<dyn Worker<R>>) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Route that transient failures are requeued to. Without one, a
    /// transient failure is logged and dropped.
    pub fn retry_to(mut self, route: R) -> Self {
        self.retry_route = Some(route);
        self
    }

    /// Route that ban notifications are emitted to.
    pub fn ban_to(mut self, route: R) -> Self {
        self.ban_route = Some(route);
        self
    }

    /// Installs the idle hook (see [`IdleHook`]).
    pub fn on_idle(mut self, hook: IdleHook<R>) -> Self {
        self.idle_hook = Some(hook);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Type-erased starter so a server can own groups with different route enums.
pub trait GroupRunner: Send + 'static {
    fn group_name(&self) -> &str;
    fn start(self: Box<Self>, joins: &mut JoinSet<()>, shutdown: watch::Receiver<bool>);
}

impl<R: RouteKey> GroupRunner for TaskGroup<R> {
    fn group_name(&self) -> &str {
        &self.name
    }

    fn start(self: Box<Self>, joins: &mut JoinSet<()>, shutdown: watch::Receiver<bool>) {
        pool::start(*self, joins, shutdown);
    }
}

impl<R: RouteKey> TaskGroup<R> {
    /// Starts the group directly, returning its handle. Tests and embedders
    /// use this; the server goes through [`GroupRunner`].
    pub fn spawn(self, joins: &mut JoinSet<()>, shutdown: watch::Receiver<bool>) -> GroupHandle<R> {
        pool::start(self, joins, shutdown)
    }
}
