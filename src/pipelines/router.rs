//! Envelope chain routing
//!
//! A chain is an ordered list of queues; an envelope at step N of its chain
//! forwards its data to the step N+1 queue with `next_step`, and steps may
//! fork entirely new chains (`fork` restarts the envelope at step 0 under the
//! forked chain's id). Chain targets are inherently config-dynamic, so this
//! worker resolves them to endpoint handles at construction time and sends
//! directly instead of going through a closed route enum.

use crate::config::RouterConfig;
use crate::group::{Delivery, GroupHandle, Routed, TaskGroup, Worker};
use crate::endpoint::OutputEndpoint;
use crate::pipelines::QueueSet;
use crate::server::Server;
use crate::task::TaskEnvelope;
use crate::{CrawlError, CrawlResult, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouterRoute {
    Input,
}

struct RouterWorker {
    /// Chain id -> ordered step queue names
    chains: HashMap<String, Vec<String>>,
    /// (chain id, step) -> chain ids forked there
    forks: HashMap<(String, u32), Vec<String>>,
    /// Queue name -> resolved sink
    targets: HashMap<String, Arc<dyn OutputEndpoint>>,
}

#[async_trait]
impl Worker<RouterRoute> for RouterWorker {
    async fn handle(
        &self,
        _group: &GroupHandle<RouterRoute>,
        delivery: Delivery<RouterRoute>,
    ) -> CrawlResult<Vec<Routed<RouterRoute>>> {
        let envelope = TaskEnvelope::decode(&delivery.task)?;
        tracing::info!("chain: {}, step: {}", envelope.run_id, envelope.step);

        let chain = self.chains.get(&envelope.run_id).ok_or_else(|| {
            CrawlError::Protocol(format!("unknown chain id: {}", envelope.run_id))
        })?;

        let next_index = envelope.step as usize + 1;
        if next_index < chain.len() {
            let next = envelope.next_step(envelope.data.clone());
            self.forward(&chain[next_index], next).await;
        }

        let fork_key = (envelope.run_id.clone(), envelope.step);
        if let Some(forked_chains) = self.forks.get(&fork_key) {
            for chain_id in forked_chains {
                match self.chains.get(chain_id).and_then(|c| c.first()) {
                    Some(entry_queue) => {
                        let forked = envelope.fork(chain_id.clone(), envelope.data.clone());
                        self.forward(entry_queue, forked).await;
                    }
                    None => tracing::error!("fork target chain {} has no entry", chain_id),
                }
            }
        }
        Ok(vec![])
    }
}

impl RouterWorker {
    async fn forward(&self, queue: &str, envelope: TaskEnvelope) {
        match self.targets.get(queue) {
            Some(endpoint) => {
                if let Err(e) = endpoint.send(envelope.into_task()).await {
                    tracing::error!("forward to {} failed: {}", queue, e);
                }
            }
            None => tracing::error!("no resolved target for queue {}", queue),
        }
    }
}

fn parse_fork_key(key: &str) -> Option<(String, u32)> {
    let (chain, step) = key.rsplit_once(':')?;
    Some((chain.to_string(), step.parse().ok()?))
}

pub fn build_group(pipeline: &RouterConfig, queues: &QueueSet) -> Result<TaskGroup<RouterRoute>> {
    let mut targets = HashMap::new();
    for steps in pipeline.chains.values() {
        for step in steps {
            if !targets.contains_key(step) {
                targets.insert(step.clone(), queues.output(step)?);
            }
        }
    }

    let mut forks = HashMap::new();
    for (key, chains) in &pipeline.forks {
        match parse_fork_key(key) {
            Some(fork_key) => {
                forks.insert(fork_key, chains.clone());
            }
            None => tracing::error!("ignoring malformed fork key: {}", key),
        }
    }

    let worker = RouterWorker {
        chains: pipeline.chains.clone(),
        forks,
        targets,
    };
    Ok(TaskGroup::new("router", pipeline.workers)
        .add_input(RouterRoute::Input, queues.input(&pipeline.input_queue)?)
        .with_worker(Arc::new(worker)))
}

pub fn install(server: &mut Server, pipeline: &RouterConfig, queues: &QueueSet) -> Result<()> {
    server.add_group(build_group(pipeline, queues)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fork_key() {
        assert_eq!(parse_fork_key("1:0"), Some(("1".to_string(), 0)));
        assert_eq!(parse_fork_key("review:3"), Some(("review".to_string(), 3)));
        assert_eq!(parse_fork_key("nocolon"), None);
        assert_eq!(parse_fork_key("a:b"), None);
    }
}
