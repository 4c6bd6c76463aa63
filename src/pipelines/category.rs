//! Recursive category-tree traversal
//!
//! A root task names a platform and a tree root URL; the handler expands each
//! category page into child category links (looped back through an internal
//! LIFO queue, keeping the frontier depth-first) and product records. One run
//! is active at a time: further roots deflect back to the external input
//! queue until the tree is exhausted. Completion is the idle-hook check over
//! the run tracker.

use crate::config::{CategoryConfig, Config};
use crate::endpoint::{InputEndpoint, MemoryQueue, OutputEndpoint, QueueOrder};
use crate::extract::{ExtractFilters, ExtractorRegistry};
use crate::fetch::Fetcher;
use crate::group::{Delivery, GroupHandle, RouteExt, Routed, TaskGroup, Worker};
use crate::pipelines::{fetch_stack, QueueSet};
use crate::run::RunTracker;
use crate::server::Server;
use crate::task::{Task, TaskEnvelope};
use crate::{CrawlError, CrawlResult, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CategoryRoute {
    /// External root-task queue
    Input,
    /// Deflection back to the external queue while a run is active
    InputBack,
    /// Internal depth-first loop-back
    Inner,
    /// Product records
    Output,
    /// Remediation notices
    Ban,
}

/// Task payload on the category queues.
///
/// Roots carry `root_url` and the run's category filter; loop-back children
/// carry `url` only.
#[derive(Debug, Serialize, Deserialize)]
struct CategoryTask {
    platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    root_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    category_filter: Vec<String>,
}

struct CategoryWorker {
    fetcher: Arc<Fetcher>,
    registry: Arc<ExtractorRegistry>,
    tracker: Arc<RunTracker>,
    ban_enabled: bool,
}

#[async_trait]
impl Worker<CategoryRoute> for CategoryWorker {
    async fn handle(
        &self,
        group: &GroupHandle<CategoryRoute>,
        delivery: Delivery<CategoryRoute>,
    ) -> CrawlResult<Vec<Routed<CategoryRoute>>> {
        let parsed: CategoryTask = serde_json::from_slice(delivery.task.payload())
            .map_err(|e| CrawlError::Protocol(format!("malformed category task: {}", e)))?;

        if parsed.root_url.is_some() {
            if !self.tracker.accept_root(&parsed.category_filter) {
                // a run is active: hand the root back to its origin transport
                return Ok(vec![delivery.task.route(CategoryRoute::InputBack)]);
            }
            group.suspend_endpoint(CategoryRoute::Input);
            tracing::info!(
                "category run started: {} {}",
                parsed.platform,
                parsed.root_url.as_deref().unwrap_or("")
            );
        } else if !self.tracker.is_active() {
            return Err(CrawlError::Protocol(
                "first task of a run must carry root_url".to_string(),
            ));
        }

        let url = match parsed.root_url.as_ref().or(parsed.url.as_ref()) {
            Some(url) => url.clone(),
            None => {
                self.tracker.apply_fanout(0);
                return Err(CrawlError::Protocol(
                    "category task carries neither root_url nor url".to_string(),
                ));
            }
        };

        // from here the task is counted against the run: every exit applies
        // exactly one fan-out so pending stays balanced
        match self.crawl(&parsed.platform, &url).await {
            Ok((routed, children)) => {
                self.tracker.apply_fanout(children);
                Ok(routed)
            }
            Err(CrawlError::TransientFetch { .. }) | Err(CrawlError::ChallengeDetected { .. }) => {
                self.tracker.apply_fanout(1);
                Ok(vec![self.requeue(&parsed, &url)])
            }
            Err(CrawlError::BanDetected { url: ban_url, proxy }) => {
                self.tracker.apply_fanout(1);
                let mut routed = vec![self.requeue(&parsed, &url)];
                if self.ban_enabled {
                    let notice =
                        TaskEnvelope::root("ban", json!({ "url": ban_url, "proxy": proxy }))
                            .into_task();
                    routed.push(notice.route(CategoryRoute::Ban));
                }
                Ok(routed)
            }
            Err(e) => {
                // extraction and protocol failures drop the branch
                self.tracker.apply_fanout(0);
                Err(e)
            }
        }
    }
}

impl CategoryWorker {
    async fn crawl(
        &self,
        platform: &str,
        url: &str,
    ) -> CrawlResult<(Vec<Routed<CategoryRoute>>, usize)> {
        let factory = self.registry.get_for_task(platform)?;
        let page = self.fetcher.fetch_extracted(&factory, url).await?;

        // abandon result: wrong page shape, nothing to expand
        if !page.is_target_page() {
            return Ok((vec![], 0));
        }

        let filters = ExtractFilters {
            categories: self.tracker.filters(),
            skip_children: self.tracker.container_seen(url),
        };
        let extraction = page.extract(&filters).map_err(|message| CrawlError::Extraction {
            platform: platform.to_string(),
            url: url.to_string(),
            message,
        })?;

        let mut routed = Vec::new();
        let children = extraction.links.len();
        for link in extraction.links {
            let child = CategoryTask {
                platform: platform.to_string(),
                root_url: None,
                url: Some(link),
                category_filter: Vec::new(),
            };
            routed.push(encode(&child).route(CategoryRoute::Inner));
        }
        for record in extraction.records {
            let fresh = record
                .get("key")
                .and_then(|k| k.as_str())
                .map(|key| !self.tracker.record_seen(key))
                .unwrap_or(true);
            if fresh {
                routed.push(Task::new(record.to_string()).route(CategoryRoute::Output));
            }
        }
        Ok((routed, children))
    }

    /// Re-encodes a task for retry, converting a root to child form: the
    /// run's filters already live in the tracker.
    fn requeue(&self, parsed: &CategoryTask, url: &str) -> Routed<CategoryRoute> {
        let retry = CategoryTask {
            platform: parsed.platform.clone(),
            root_url: None,
            url: Some(url.to_string()),
            category_filter: Vec::new(),
        };
        encode(&retry).route(CategoryRoute::Inner)
    }
}

fn encode(task: &CategoryTask) -> Task {
    Task::new(serde_json::to_vec(task).unwrap_or_default())
}

/// Builds the category group plus its run tracker and idle hook.
pub fn build_group(
    workers: usize,
    fetcher: Arc<Fetcher>,
    registry: Arc<ExtractorRegistry>,
    input: Arc<dyn InputEndpoint>,
    input_back: Arc<dyn OutputEndpoint>,
    output: Arc<dyn OutputEndpoint>,
    ban: Option<Arc<dyn OutputEndpoint>>,
) -> TaskGroup<CategoryRoute> {
    let tracker = Arc::new(RunTracker::new());
    // LIFO keeps the traversal depth-first so the frontier stays bounded
    let inner = MemoryQueue::unbounded(QueueOrder::Lifo);

    let worker = CategoryWorker {
        fetcher,
        registry,
        tracker: Arc::clone(&tracker),
        ban_enabled: ban.is_some(),
    };

    let hook_tracker = Arc::clone(&tracker);
    let mut group = TaskGroup::new("category", workers)
        .add_input(CategoryRoute::Input, input)
        .add_input(CategoryRoute::Inner, Arc::clone(&inner) as _)
        .add_output(CategoryRoute::Inner, inner)
        .add_output(CategoryRoute::InputBack, input_back)
        .add_output(CategoryRoute::Output, output)
        .with_worker(Arc::new(worker))
        .on_idle(Arc::new(move |handle: &GroupHandle<CategoryRoute>| {
            if hook_tracker.finish_if_done() {
                tracing::info!("category run complete, resuming input");
                handle.resume_endpoint(CategoryRoute::Input);
            }
        }));
    if let Some(ban) = ban {
        group = group.add_output(CategoryRoute::Ban, ban);
    }
    group
}

pub fn install(
    server: &mut Server,
    config: &Config,
    pipeline: &CategoryConfig,
    registry: Arc<ExtractorRegistry>,
    queues: &QueueSet,
) -> Result<()> {
    let fetcher = fetch_stack(server, config)?;
    let ban = match &pipeline.ban_queue {
        Some(name) => Some(queues.output(name)?),
        None => None,
    };
    let group = build_group(
        pipeline.workers,
        fetcher,
        registry,
        queues.input(&pipeline.input_queue)?,
        queues.output(&pipeline.input_queue)?,
        queues.output(&pipeline.output_queue)?,
        ban,
    );
    server.add_group(group);
    Ok(())
}
