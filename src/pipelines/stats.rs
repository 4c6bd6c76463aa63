//! Counter aggregation with periodic flush
//!
//! Envelopes on the input queue increment the counter their `(run_id, step)`
//! pair maps to; a background routine snapshots and clears the counter map on
//! a fixed interval and emits the snapshot as a record, but only when there
//! is something to flush.

use crate::config::StatsConfig;
use crate::endpoint::OutputEndpoint;
use crate::group::{Delivery, GroupHandle, Routed, TaskGroup, Worker};
use crate::pipelines::QueueSet;
use crate::server::Server;
use crate::task::{Task, TaskEnvelope};
use crate::{CrawlResult, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatsRoute {
    Input,
}

type CounterMap = Arc<Mutex<HashMap<String, u64>>>;

struct StatsWorker {
    /// "run-id:step" -> counter name
    counters: HashMap<String, String>,
    data: CounterMap,
}

#[async_trait]
impl Worker<StatsRoute> for StatsWorker {
    async fn handle(
        &self,
        _group: &GroupHandle<StatsRoute>,
        delivery: Delivery<StatsRoute>,
    ) -> CrawlResult<Vec<Routed<StatsRoute>>> {
        let envelope = TaskEnvelope::decode(&delivery.task)?;
        let key = format!("{}:{}", envelope.run_id, envelope.step);
        if let Some(name) = self.counters.get(&key) {
            *self.data.lock().unwrap().entry(name.clone()).or_insert(0) += 1;
        }
        Ok(vec![])
    }
}

async fn flush_routine(data: CounterMap, sink: Arc<dyn OutputEndpoint>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let snapshot: HashMap<String, u64> = {
            let mut data = data.lock().unwrap();
            if data.is_empty() {
                continue;
            }
            data.drain().collect()
        };
        let record = json!({
            "time": chrono::Utc::now().to_rfc3339(),
            "counters": snapshot,
        });
        if let Err(e) = sink.send(Task::new(record.to_string())).await {
            tracing::error!("stats flush failed: {}", e);
        }
    }
}

pub fn install(server: &mut Server, pipeline: &StatsConfig, queues: &QueueSet) -> Result<()> {
    let data: CounterMap = Arc::new(Mutex::new(HashMap::new()));

    let worker = StatsWorker {
        counters: pipeline.counters.clone(),
        data: Arc::clone(&data),
    };
    let group = TaskGroup::new("stats", 1)
        .add_input(StatsRoute::Input, queues.input(&pipeline.input_queue)?)
        .with_worker(Arc::new(worker));
    server.add_group(group);

    server.add_routine(
        "stats-flush",
        flush_routine(
            data,
            queues.output(&pipeline.flush_queue)?,
            Duration::from_secs(pipeline.flush_interval_secs),
        ),
    );
    Ok(())
}
