//! Two-stage keyword search: admission gating plus paginated fan-out
//!
//! The capacity-1 task group gates admission: at most `slots` logical
//! searches run at once, further roots deflect back to the external input
//! queue, and each admitted search is normalized (page 1, index URL from the
//! platform template) into the internal work queue. The wide work group pages
//! through result lists, chaining page N+1 with `next_step`, and signals
//! "task done" back to the task group over the notify channel, which frees a
//! slot and resumes ingestion.

use crate::config::{Config, PlatformConfig, SearchConfig};
use crate::endpoint::{InputEndpoint, MemoryQueue, OutputEndpoint, QueueOrder};
use crate::extract::{ExtractFilters, ExtractorRegistry};
use crate::fetch::Fetcher;
use crate::group::{Delivery, GroupHandle, RouteExt, Routed, TaskGroup, Worker};
use crate::pipelines::{fetch_stack, QueueSet};
use crate::server::Server;
use crate::task::{Task, TaskEnvelope};
use crate::{CrawlError, CrawlResult, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use url::form_urlencoded;

const TASK_DONE: &[u8] = b"task done";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchTaskRoute {
    /// External search requests
    Input,
    /// Completion signals from the work group
    Notify,
    /// Deflection back to the external queue when all slots are taken
    InputBack,
    /// Normalized work for the work group
    Inner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchWorkRoute {
    /// Internal work queue (input and pagination loop-back)
    Inner,
    /// Result records
    Output,
    /// Completion signals to the task group
    Notify,
}

struct AdmissionWorker {
    slots: Mutex<usize>,
    max_slots: usize,
    default_end_page: u32,
    platforms: Arc<HashMap<String, PlatformConfig>>,
}

#[async_trait]
impl Worker<SearchTaskRoute> for AdmissionWorker {
    async fn handle(
        &self,
        group: &GroupHandle<SearchTaskRoute>,
        delivery: Delivery<SearchTaskRoute>,
    ) -> CrawlResult<Vec<Routed<SearchTaskRoute>>> {
        match delivery.origin {
            SearchTaskRoute::Input => {
                // reject malformed requests before a slot is taken, a
                // dropped task must not leak admission capacity
                let envelope = TaskEnvelope::decode(&delivery.task)?;
                let platform = field(&envelope.data, "platform")?;
                let keyword = field(&envelope.data, "keyword")?;
                let url = self.search_index_url(&platform, &keyword)?;

                {
                    let mut slots = self.slots.lock().unwrap();
                    if *slots >= self.max_slots {
                        return Ok(vec![delivery.task.route(SearchTaskRoute::InputBack)]);
                    }
                    *slots += 1;
                    if *slots >= self.max_slots {
                        group.suspend_endpoint(SearchTaskRoute::Input);
                    }
                }
                tracing::info!("{} {}", platform, keyword);
                let end_page = envelope
                    .data
                    .get("end_page")
                    .and_then(Value::as_u64)
                    .unwrap_or(self.default_end_page as u64);
                let work = envelope.derive(json!({
                    "platform": platform,
                    "keyword": keyword,
                    "end_page": end_page,
                    "page": 1,
                    "url": url,
                }));
                Ok(vec![work.into_task().route(SearchTaskRoute::Inner)])
            }
            SearchTaskRoute::Notify => {
                if delivery.task.payload() == TASK_DONE {
                    let mut slots = self.slots.lock().unwrap();
                    if *slots > 0 {
                        *slots -= 1;
                        if *slots + 1 == self.max_slots {
                            group.resume_endpoint(SearchTaskRoute::Input);
                        }
                    }
                }
                Ok(vec![])
            }
            _ => Err(CrawlError::Protocol(format!(
                "unexpected origin {:?}",
                delivery.origin
            ))),
        }
    }
}

impl AdmissionWorker {
    fn search_index_url(&self, platform: &str, keyword: &str) -> CrawlResult<String> {
        let template = self
            .platforms
            .get(platform)
            .and_then(|p| p.search_url.as_ref())
            .ok_or_else(|| {
                CrawlError::Protocol(format!("platform {} has no search-url", platform))
            })?;
        let encoded: String = form_urlencoded::byte_serialize(keyword.as_bytes()).collect();
        Ok(template.replace("{keyword}", &encoded))
    }
}

struct SearchWorker {
    fetcher: Arc<Fetcher>,
    registry: Arc<ExtractorRegistry>,
}

#[async_trait]
impl Worker<SearchWorkRoute> for SearchWorker {
    async fn handle(
        &self,
        _group: &GroupHandle<SearchWorkRoute>,
        delivery: Delivery<SearchWorkRoute>,
    ) -> CrawlResult<Vec<Routed<SearchWorkRoute>>> {
        let envelope = TaskEnvelope::decode(&delivery.task)?;
        let notify = || Task::new(TASK_DONE.to_vec()).route(SearchWorkRoute::Notify);

        let platform = field(&envelope.data, "platform")?;
        let keyword = field(&envelope.data, "keyword")?;
        let url = field(&envelope.data, "url")?;
        let page = envelope.data.get("page").and_then(Value::as_u64).unwrap_or(1);
        let end_page = envelope
            .data
            .get("end_page")
            .and_then(Value::as_u64)
            .unwrap_or(1);

        if page > end_page {
            return Ok(vec![notify()]);
        }

        let extracted = async {
            let factory = self.registry.get_for_task(&platform)?;
            let page = self.fetcher.fetch_extracted(&factory, &url).await?;
            Ok::<_, CrawlError>(page)
        }
        .await;

        let page_handle = match extracted {
            Ok(handle) => handle,
            Err(e @ CrawlError::TransientFetch { .. })
            | Err(e @ CrawlError::ChallengeDetected { .. })
            | Err(e @ CrawlError::BanDetected { .. }) => {
                tracing::warn!("{}; requeueing {} {}", e, platform, keyword);
                return Ok(vec![delivery.task.route(SearchWorkRoute::Inner)]);
            }
            Err(e) => {
                tracing::error!("search page failed\n{} {}: {}", platform, url, e);
                let failure = envelope.derive(json!({
                    "platform": platform,
                    "keyword": keyword,
                    "page": page,
                    "end": true,
                    "status": 1,
                    "message": "search page failed",
                }));
                return Ok(vec![
                    notify(),
                    failure.into_task().route(SearchWorkRoute::Output),
                ]);
            }
        };

        // abandon result: not a search page
        if !page_handle.is_target_page() {
            return Ok(vec![notify()]);
        }

        let extraction = match page_handle.extract(&ExtractFilters::default()) {
            Ok(extraction) => extraction,
            Err(message) => {
                tracing::error!("search extraction failed\n{} {}: {}", platform, url, message);
                return Ok(vec![notify()]);
            }
        };

        let next_url = extraction.links.into_iter().next();
        let mut info = json!({
            "platform": platform,
            "keyword": keyword,
            "page": page,
            "products": extraction.records,
            "status": 0,
        });

        let mut routed = Vec::new();
        let next_page = page + 1;
        match next_url {
            Some(next_url) if next_page <= end_page => {
                let follow = envelope.next_step(json!({
                    "platform": platform,
                    "keyword": keyword,
                    "end_page": end_page,
                    "page": next_page,
                    "url": next_url,
                }));
                routed.push(follow.into_task().route(SearchWorkRoute::Inner));
            }
            _ => {
                info["end"] = json!(true);
                routed.push(notify());
            }
        }
        routed.push(envelope.derive(info).into_task().route(SearchWorkRoute::Output));
        Ok(routed)
    }
}

fn field(data: &Value, name: &str) -> CrawlResult<String> {
    data.get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| CrawlError::Protocol(format!("search task missing {}", name)))
}

/// Builds the admission and work groups around fresh notify/work queues.
pub fn build_groups(
    pipeline: &SearchConfig,
    platforms: Arc<HashMap<String, PlatformConfig>>,
    fetcher: Arc<Fetcher>,
    registry: Arc<ExtractorRegistry>,
    input: Arc<dyn InputEndpoint>,
    input_back: Arc<dyn OutputEndpoint>,
    output: Arc<dyn OutputEndpoint>,
) -> (TaskGroup<SearchTaskRoute>, TaskGroup<SearchWorkRoute>) {
    let notify_queue = MemoryQueue::unbounded(QueueOrder::Fifo);
    let work_queue = MemoryQueue::unbounded(QueueOrder::Fifo);

    let admission = AdmissionWorker {
        slots: Mutex::new(0),
        max_slots: pipeline.slots,
        default_end_page: pipeline.default_end_page,
        platforms,
    };
    let task_group = TaskGroup::new("task", 1)
        .add_input(SearchTaskRoute::Input, input)
        .add_input(SearchTaskRoute::Notify, Arc::clone(&notify_queue) as _)
        .add_output(SearchTaskRoute::InputBack, input_back)
        .add_output(SearchTaskRoute::Inner, Arc::clone(&work_queue) as _)
        .with_worker(Arc::new(admission));

    let search = SearchWorker { fetcher, registry };
    let work_group = TaskGroup::new("work", pipeline.workers)
        .add_input(SearchWorkRoute::Inner, Arc::clone(&work_queue) as _)
        .add_output(SearchWorkRoute::Inner, work_queue)
        .add_output(SearchWorkRoute::Output, output)
        .add_output(SearchWorkRoute::Notify, notify_queue)
        .with_worker(Arc::new(search));

    (task_group, work_group)
}

pub fn install(
    server: &mut Server,
    config: &Config,
    pipeline: &SearchConfig,
    registry: Arc<ExtractorRegistry>,
    queues: &QueueSet,
) -> Result<()> {
    let fetcher = fetch_stack(server, config)?;
    let (task_group, work_group) = build_groups(
        pipeline,
        Arc::new(config.platform.clone()),
        fetcher,
        registry,
        queues.input(&pipeline.input_queue)?,
        queues.output(&pipeline.input_queue)?,
        queues.output(&pipeline.output_queue)?,
    );
    server.add_group(task_group);
    server.add_group(work_group);
    Ok(())
}
