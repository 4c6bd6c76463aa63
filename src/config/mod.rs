//! Configuration: TOML loading, parsing and validation
//!
//! One file configures a process: the fetch client, the rotation coordinator,
//! the queues it wires, the platforms it knows, and the pipelines it may run.

mod parser;
mod types;
mod validation;

pub use parser::{compute_config_hash, load_config, load_config_with_hash};
pub use types::{
    BanConfig, CategoryConfig, Config, DetailConfig, EngineConfig, FetchConfig, PipelineConfig,
    PlatformConfig, QueueConfig, QueueOrderConfig, RecordSelectorConfig, RotationConfig,
    RouterConfig, SearchConfig, SelectorConfig, StatsConfig,
};
