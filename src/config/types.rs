use serde::Deserialize;
use std::collections::HashMap;

/// Main configuration structure for a Flowline process
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    pub fetch: FetchConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    /// Named queues this process wires its pipelines over.
    #[serde(default)]
    pub queue: Vec<QueueConfig>,
    /// Per-platform URL templates and selector sets.
    #[serde(default)]
    pub platform: HashMap<String, PlatformConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Process-level knobs
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Seconds to wait for pumps and workers to drain on shutdown
    #[serde(rename = "shutdown-grace-secs", default = "default_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            shutdown_grace_secs: default_grace(),
        }
    }
}

/// HTTP fetch configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// User agent sent with every request
    #[serde(rename = "user-agent")]
    pub user_agent: String,

    /// Fixed per-call timeout (platform-tunable, 30-90s in practice)
    #[serde(rename = "request-timeout-secs", default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(rename = "connect-timeout-secs", default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Network-identity rotation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RotationConfig {
    /// PPPoE interface to bounce
    #[serde(default = "default_interface")]
    pub interface: String,

    /// Delay between retries of a failed interface toggle
    #[serde(rename = "retry-delay-secs", default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Consecutive bring-down failures before falling back to the pppoe
    /// service scripts
    #[serde(rename = "fallback-after", default = "default_fallback_after")]
    pub fallback_after: u32,
}

impl Default for RotationConfig {
    fn default() -> Self {
        RotationConfig {
            interface: default_interface(),
            retry_delay_secs: default_retry_delay(),
            fallback_after: default_fallback_after(),
        }
    }
}

/// Delivery order of a declared queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum QueueOrderConfig {
    #[default]
    Fifo,
    Lifo,
}

/// One named queue declaration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub name: String,

    #[serde(default)]
    pub order: QueueOrderConfig,

    /// Bounded capacity; omitted means unbounded
    pub capacity: Option<usize>,

    /// When set, the queue holds each task for this many seconds before it
    /// becomes receivable (quarantine/release windows)
    #[serde(rename = "delay-secs")]
    pub delay_secs: Option<u64>,
}

/// Per-platform wiring: URL templates plus the selector set the generic
/// extractor runs with
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    /// Base URL relative links are resolved against
    #[serde(rename = "base-url")]
    pub base_url: Option<String>,

    /// Search index URL template; `{keyword}` is substituted
    #[serde(rename = "search-url")]
    pub search_url: Option<String>,

    /// Item detail URL template; `{key}` is substituted
    #[serde(rename = "item-url")]
    pub item_url: Option<String>,

    pub selectors: Option<SelectorConfig>,
}

/// Selector set for the generic listing extractor
#[derive(Debug, Clone, Deserialize)]
pub struct SelectorConfig {
    /// Selector that must match for the page to count as a target page
    pub target: String,

    /// Selectors harvested for follow-up links
    #[serde(default)]
    pub links: Vec<String>,

    /// Record container selector and the attribute carrying the natural key
    pub record: Option<RecordSelectorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordSelectorConfig {
    pub selector: String,

    #[serde(rename = "key-attr")]
    pub key_attr: String,
}

/// Which pipelines this process can run
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PipelineConfig {
    pub category: Option<CategoryConfig>,
    pub search: Option<SearchConfig>,
    pub detail: Option<DetailConfig>,
    pub ban: Option<BanConfig>,
    pub router: Option<RouterConfig>,
    pub stats: Option<StatsConfig>,
}

/// Recursive category-tree traversal
#[derive(Debug, Clone, Deserialize)]
pub struct CategoryConfig {
    #[serde(default = "default_category_workers")]
    pub workers: usize,

    #[serde(rename = "input-queue")]
    pub input_queue: String,

    #[serde(rename = "output-queue")]
    pub output_queue: String,

    /// Remediation queue for ban notices; omitted disables ban routing
    #[serde(rename = "ban-queue")]
    pub ban_queue: Option<String>,
}

/// Two-stage keyword search
#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    /// Concurrent logical runs admitted before roots deflect
    #[serde(default = "default_search_slots")]
    pub slots: usize,

    #[serde(default = "default_search_workers")]
    pub workers: usize,

    #[serde(rename = "default-end-page", default = "default_end_page")]
    pub default_end_page: u32,

    #[serde(rename = "input-queue")]
    pub input_queue: String,

    #[serde(rename = "output-queue")]
    pub output_queue: String,
}

/// Single-stage item detail fetch
#[derive(Debug, Clone, Deserialize)]
pub struct DetailConfig {
    #[serde(default = "default_detail_workers")]
    pub workers: usize,

    #[serde(rename = "input-queue")]
    pub input_queue: String,

    #[serde(rename = "output-queue")]
    pub output_queue: String,
}

/// Identity quarantine and timed release
#[derive(Debug, Clone, Deserialize)]
pub struct BanConfig {
    /// Queue delivering ban notices
    #[serde(rename = "input-queue")]
    pub input_queue: String,

    /// Delayed queue a quarantined identity serves its penalty in; must be
    /// declared with `delay-secs`
    #[serde(rename = "hold-queue")]
    pub hold_queue: String,
}

/// Envelope chain routing
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_router_workers")]
    pub workers: usize,

    #[serde(rename = "input-queue")]
    pub input_queue: String,

    /// Chain id -> ordered queue names, one per step
    pub chains: HashMap<String, Vec<String>>,

    /// "chain:step" -> chain ids forked at that step
    #[serde(default)]
    pub forks: HashMap<String, Vec<String>>,
}

/// Counter aggregation with periodic flush
#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    #[serde(rename = "input-queue")]
    pub input_queue: String,

    #[serde(rename = "flush-queue")]
    pub flush_queue: String,

    #[serde(rename = "flush-interval-secs", default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// "run-id:step" -> counter name
    #[serde(default)]
    pub counters: HashMap<String, String>,
}

fn default_grace() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_interface() -> String {
    "ppp0".to_string()
}

fn default_retry_delay() -> u64 {
    10
}

fn default_fallback_after() -> u32 {
    3
}

fn default_category_workers() -> usize {
    2
}

fn default_search_slots() -> usize {
    30
}

fn default_search_workers() -> usize {
    30
}

fn default_end_page() -> u32 {
    20
}

fn default_detail_workers() -> usize {
    10
}

fn default_router_workers() -> usize {
    3
}

fn default_flush_interval() -> u64 {
    60
}
