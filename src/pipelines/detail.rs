//! Single-stage item detail fetch
//!
//! Each task names a platform and an item key; the handler fetches the item
//! page through the rotation barrier and emits one record per extracted
//! entry. Transient failures propagate to the pool, which requeues the task
//! through the external input queue (the loop-back), so a restart of this
//! process never loses work.

use crate::config::{Config, DetailConfig, PlatformConfig};
use crate::endpoint::{InputEndpoint, OutputEndpoint};
use crate::extract::{ExtractFilters, ExtractorRegistry};
use crate::fetch::Fetcher;
use crate::group::{Delivery, GroupHandle, RouteExt, Routed, TaskGroup, Worker};
use crate::pipelines::{fetch_stack, QueueSet};
use crate::server::Server;
use crate::task::Task;
use crate::{CrawlError, CrawlResult, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetailRoute {
    /// External item queue
    Input,
    /// Records
    Output,
    /// Requeue through the external queue on transient failure
    Loop,
}

#[derive(Debug, Deserialize)]
struct DetailTask {
    platform: String,
    key: String,
}

struct DetailWorker {
    fetcher: Arc<Fetcher>,
    registry: Arc<ExtractorRegistry>,
    platforms: Arc<HashMap<String, PlatformConfig>>,
    task_cnt: AtomicU64,
}

#[async_trait]
impl Worker<DetailRoute> for DetailWorker {
    async fn handle(
        &self,
        _group: &GroupHandle<DetailRoute>,
        delivery: Delivery<DetailRoute>,
    ) -> CrawlResult<Vec<Routed<DetailRoute>>> {
        let parsed: DetailTask = serde_json::from_slice(delivery.task.payload())
            .map_err(|e| CrawlError::Protocol(format!("malformed detail task: {}", e)))?;

        let no = self.task_cnt.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!("No.{} {} {}", no, parsed.platform, parsed.key);

        let url = self.item_url(&parsed)?;
        let factory = self.registry.get_for_task(&parsed.platform)?;
        // transient and ban failures propagate: the pool requeues via Loop
        let page = self.fetcher.fetch_extracted(&factory, &url).await?;

        // abandon result: wrong page shape
        if !page.is_target_page() {
            return Ok(vec![]);
        }

        let extraction = page
            .extract(&ExtractFilters::default())
            .map_err(|message| CrawlError::Extraction {
                platform: parsed.platform.clone(),
                url: url.clone(),
                message,
            })?;

        Ok(extraction
            .records
            .into_iter()
            .map(|record| Task::new(record.to_string()).route(DetailRoute::Output))
            .collect())
    }
}

impl DetailWorker {
    fn item_url(&self, task: &DetailTask) -> CrawlResult<String> {
        let template = self
            .platforms
            .get(&task.platform)
            .and_then(|p| p.item_url.as_ref())
            .ok_or_else(|| {
                CrawlError::Protocol(format!("platform {} has no item-url", task.platform))
            })?;
        Ok(template.replace("{key}", &task.key))
    }
}

pub fn build_group(
    pipeline: &DetailConfig,
    platforms: Arc<HashMap<String, PlatformConfig>>,
    fetcher: Arc<Fetcher>,
    registry: Arc<ExtractorRegistry>,
    input: Arc<dyn InputEndpoint>,
    loop_back: Arc<dyn OutputEndpoint>,
    output: Arc<dyn OutputEndpoint>,
) -> TaskGroup<DetailRoute> {
    let worker = DetailWorker {
        fetcher,
        registry,
        platforms,
        task_cnt: AtomicU64::new(0),
    };
    TaskGroup::new("detail", pipeline.workers)
        .add_input(DetailRoute::Input, input)
        .add_output(DetailRoute::Output, output)
        .add_output(DetailRoute::Loop, loop_back)
        .retry_to(DetailRoute::Loop)
        .with_worker(Arc::new(worker))
}

pub fn install(
    server: &mut Server,
    config: &Config,
    pipeline: &DetailConfig,
    registry: Arc<ExtractorRegistry>,
    queues: &QueueSet,
) -> Result<()> {
    let fetcher = fetch_stack(server, config)?;
    let group = build_group(
        pipeline,
        Arc::new(config.platform.clone()),
        fetcher,
        registry,
        queues.input(&pipeline.input_queue)?,
        queues.output(&pipeline.input_queue)?,
        queues.output(&pipeline.output_queue)?,
    );
    server.add_group(group);
    Ok(())
}
