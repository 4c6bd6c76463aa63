//! Identity quarantine and timed release
//!
//! Ban notices name a blocked identity. The quarantine group takes the
//! identity out of the shared pool and parks the notice in a delayed queue;
//! once the penalty window elapses the release group puts the identity back.
//! The delayed queue is the expiry mechanism: nothing polls, tasks simply
//! become receivable when their window ends.

use crate::config::BanConfig;
use crate::endpoint::{InputEndpoint, OutputEndpoint};
use crate::group::{Delivery, GroupHandle, RouteExt, Routed, TaskGroup, Worker};
use crate::pipelines::QueueSet;
use crate::server::Server;
use crate::task::TaskEnvelope;
use crate::{CrawlResult, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BanRoute {
    Input,
    Output,
}

/// The pool of identities currently in rotation, shared with whatever
/// fetch-side selection the embedder runs.
#[derive(Debug, Default)]
pub struct IdentityPool {
    available: Mutex<HashSet<String>>,
}

impl IdentityPool {
    pub fn new() -> Self {
        IdentityPool::default()
    }

    /// Seeds the pool with known identities.
    pub fn seed(&self, identities: impl IntoIterator<Item = String>) {
        self.available.lock().unwrap().extend(identities);
    }

    /// Removes an identity from rotation; false if it was not in the pool.
    pub fn quarantine(&self, identity: &str) -> bool {
        self.available.lock().unwrap().remove(identity)
    }

    /// Returns an identity to rotation.
    pub fn release(&self, identity: &str) {
        self.available.lock().unwrap().insert(identity.to_string());
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.available.lock().unwrap().contains(identity)
    }

    pub fn len(&self) -> usize {
        self.available.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn identity_of(envelope: &TaskEnvelope) -> Option<String> {
    envelope
        .data
        .get("proxy")
        .and_then(Value::as_str)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
}

struct QuarantineWorker {
    pool: Arc<IdentityPool>,
}

#[async_trait]
impl Worker<BanRoute> for QuarantineWorker {
    async fn handle(
        &self,
        _group: &GroupHandle<BanRoute>,
        delivery: Delivery<BanRoute>,
    ) -> CrawlResult<Vec<Routed<BanRoute>>> {
        let envelope = TaskEnvelope::decode(&delivery.task)?;
        let identity = match identity_of(&envelope) {
            Some(identity) => identity,
            None => return Ok(vec![]),
        };
        tracing::info!("quarantine {}", identity);
        if self.pool.quarantine(&identity) {
            // only a first offense schedules a release; repeats are already
            // serving their window
            return Ok(vec![delivery.task.route(BanRoute::Output)]);
        }
        Ok(vec![])
    }
}

struct ReleaseWorker {
    pool: Arc<IdentityPool>,
}

#[async_trait]
impl Worker<BanRoute> for ReleaseWorker {
    async fn handle(
        &self,
        _group: &GroupHandle<BanRoute>,
        delivery: Delivery<BanRoute>,
    ) -> CrawlResult<Vec<Routed<BanRoute>>> {
        let envelope = TaskEnvelope::decode(&delivery.task)?;
        if let Some(identity) = identity_of(&envelope) {
            tracing::info!("release {}", identity);
            self.pool.release(&identity);
        }
        Ok(vec![])
    }
}

/// Builds the quarantine and release groups around the delayed hold queue.
pub fn build_groups(
    pool: Arc<IdentityPool>,
    notices: Arc<dyn InputEndpoint>,
    hold_in: Arc<dyn InputEndpoint>,
    hold_out: Arc<dyn OutputEndpoint>,
) -> (TaskGroup<BanRoute>, TaskGroup<BanRoute>) {
    let quarantine = TaskGroup::new("quarantine", 1)
        .add_input(BanRoute::Input, notices)
        .add_output(BanRoute::Output, hold_out)
        .with_worker(Arc::new(QuarantineWorker {
            pool: Arc::clone(&pool),
        }));
    let release = TaskGroup::new("release", 1)
        .add_input(BanRoute::Input, hold_in)
        .with_worker(Arc::new(ReleaseWorker { pool }));
    (quarantine, release)
}

pub fn install(server: &mut Server, pipeline: &BanConfig, queues: &QueueSet) -> Result<()> {
    let pool = Arc::new(IdentityPool::new());
    let (quarantine, release) = build_groups(
        pool,
        queues.input(&pipeline.input_queue)?,
        queues.input(&pipeline.hold_queue)?,
        queues.output(&pipeline.hold_queue)?,
    );
    server.add_group(quarantine);
    server.add_group(release);
    Ok(())
}
