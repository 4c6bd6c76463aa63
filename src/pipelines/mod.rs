//! Pipeline wiring: thin modules composing the engine into runnable services
//!
//! Each pipeline mirrors one crawler process of the fleet: it declares its
//! route enums, implements its workers against the `PageExtractor` seam, and
//! wires groups over the queues the configuration names. Everything heavy —
//! pooling, routing, barriers, run tracking — lives in the engine modules.

pub mod ban;
pub mod category;
pub mod detail;
pub mod router;
pub mod search;
pub mod stats;

use crate::config::{Config, PlatformConfig, QueueConfig, QueueOrderConfig};
use crate::endpoint::{InputEndpoint, MemoryQueue, OutputEndpoint, QueueOrder, TimedQueue};
use crate::extract::{generic, ExtractorRegistry};
use crate::fetch::Fetcher;
use crate::rotation::{PppRotator, RotationCoordinator};
use crate::server::Server;
use crate::{FlowError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Names accepted by `--pipeline`.
pub const PIPELINES: &[&str] = &["category", "search", "detail", "ban", "router", "stats"];

enum QueueHandle {
    Memory(Arc<MemoryQueue>),
    Timed(Arc<TimedQueue>),
}

/// The named queues of one process, instantiated from configuration.
///
/// Broker-backed transports would slot in here behind the same endpoint
/// traits; this build instantiates in-process queues.
pub struct QueueSet {
    queues: HashMap<String, QueueHandle>,
}

impl QueueSet {
    pub fn from_config(declarations: &[QueueConfig]) -> Self {
        let mut queues = HashMap::new();
        for declaration in declarations {
            let handle = match declaration.delay_secs {
                Some(delay) => QueueHandle::Timed(TimedQueue::new(Duration::from_secs(delay))),
                None => {
                    let order = match declaration.order {
                        QueueOrderConfig::Fifo => QueueOrder::Fifo,
                        QueueOrderConfig::Lifo => QueueOrder::Lifo,
                    };
                    match declaration.capacity {
                        Some(capacity) => QueueHandle::Memory(MemoryQueue::bounded(order, capacity)),
                        None => QueueHandle::Memory(MemoryQueue::unbounded(order)),
                    }
                }
            };
            queues.insert(declaration.name.clone(), handle);
        }
        QueueSet { queues }
    }

    pub fn input(&self, name: &str) -> Result<Arc<dyn InputEndpoint>> {
        match self.queues.get(name) {
            Some(QueueHandle::Memory(q)) => Ok(Arc::clone(q) as Arc<dyn InputEndpoint>),
            Some(QueueHandle::Timed(q)) => Ok(Arc::clone(q) as Arc<dyn InputEndpoint>),
            None => Err(FlowError::UnknownQueue(name.to_string())),
        }
    }

    pub fn output(&self, name: &str) -> Result<Arc<dyn OutputEndpoint>> {
        match self.queues.get(name) {
            Some(QueueHandle::Memory(q)) => Ok(Arc::clone(q) as Arc<dyn OutputEndpoint>),
            Some(QueueHandle::Timed(q)) => Ok(Arc::clone(q) as Arc<dyn OutputEndpoint>),
            None => Err(FlowError::UnknownQueue(name.to_string())),
        }
    }
}

/// Builds the extractor registry from the platforms that declare selector
/// sets. Dedicated extractors registered by an embedder take the same slots.
pub fn registry_from_config(platforms: &HashMap<String, PlatformConfig>) -> ExtractorRegistry {
    let mut registry = ExtractorRegistry::new();
    for (name, platform) in platforms {
        if let Some(factory) = generic::factory_for(name, platform) {
            registry.register(name.clone(), factory);
        }
    }
    registry
}

/// Builds the server for one named pipeline.
pub fn build_server(
    name: &str,
    config: &Config,
    registry: Arc<ExtractorRegistry>,
) -> Result<Server> {
    let queues = QueueSet::from_config(&config.queue);
    let mut server = Server::new(Duration::from_secs(config.engine.shutdown_grace_secs));

    match name {
        "category" => {
            let pipeline = config.pipeline.category.as_ref().cloned().ok_or_else(not_configured(name))?;
            category::install(&mut server, config, &pipeline, registry, &queues)?;
        }
        "search" => {
            let pipeline = config.pipeline.search.as_ref().cloned().ok_or_else(not_configured(name))?;
            search::install(&mut server, config, &pipeline, registry, &queues)?;
        }
        "detail" => {
            let pipeline = config.pipeline.detail.as_ref().cloned().ok_or_else(not_configured(name))?;
            detail::install(&mut server, config, &pipeline, registry, &queues)?;
        }
        "ban" => {
            let pipeline = config.pipeline.ban.as_ref().cloned().ok_or_else(not_configured(name))?;
            ban::install(&mut server, &pipeline, &queues)?;
        }
        "router" => {
            let pipeline = config.pipeline.router.as_ref().cloned().ok_or_else(not_configured(name))?;
            router::install(&mut server, &pipeline, &queues)?;
        }
        "stats" => {
            let pipeline = config.pipeline.stats.as_ref().cloned().ok_or_else(not_configured(name))?;
            stats::install(&mut server, &pipeline, &queues)?;
        }
        _ => return Err(FlowError::UnknownPipeline(name.to_string())),
    }
    Ok(server)
}

fn not_configured(name: &str) -> impl FnOnce() -> FlowError + '_ {
    move || FlowError::PipelineNotConfigured(name.to_string())
}

/// Creates the barrier-guarded fetcher for a pipeline and puts its rotation
/// coordinator routine on the server.
pub fn fetch_stack(server: &mut Server, config: &Config) -> Result<Arc<Fetcher>> {
    let coordinator = Arc::new(RotationCoordinator::new());
    let rotator = Arc::new(PppRotator::new(
        config.rotation.interface.clone(),
        Duration::from_secs(config.rotation.retry_delay_secs),
        config.rotation.fallback_after,
    ));
    server.add_routine("rotation", Arc::clone(&coordinator).run(rotator));
    Ok(Arc::new(Fetcher::new(&config.fetch, coordinator)?))
}
