//! Flowline: a task-group execution engine for chained crawl pipelines
//!
//! This crate implements the coordinator that runs bounded pools of fetch
//! workers per stage, multiplexes named task channels, suspends and resumes
//! ingestion dynamically, tracks per-run completion across recursive fan-out,
//! and serializes network-identity rotation behind a barrier shared by every
//! in-flight fetch.

pub mod config;
pub mod endpoint;
pub mod extract;
pub mod fetch;
pub mod group;
pub mod pipelines;
pub mod rotation;
pub mod run;
pub mod server;
pub mod task;

use thiserror::Error;

/// Main error type for Flowline infrastructure operations
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Endpoint error: {0}")]
    Endpoint(#[from] endpoint::EndpointError),

    #[error("Unknown pipeline: {0}")]
    UnknownPipeline(String),

    #[error("Pipeline not configured: {0}")]
    PipelineNotConfigured(String),

    #[error("Unknown queue in wiring: {0}")]
    UnknownQueue(String),

    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Outcome-level errors returned by task handlers.
///
/// Every fetch or extraction failure is converted to one of these at the
/// handler boundary; the worker pool pattern-matches on the variant to decide
/// whether the task is requeued, forwarded to remediation, or dropped. None of
/// them ever propagate out of the pool.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Network failure or timeout; the task is retried by requeueing.
    #[error("Transient fetch failure for {url}: {reason}")]
    TransientFetch { url: String, reason: String },

    /// Anti-bot challenge page. Normally absorbed inside the guarded fetch
    /// loop; surfaced only when a handler bypasses it. Treated as transient.
    #[error("Challenge page at {url}")]
    ChallengeDetected { url: String },

    /// The origin has blocked this network identity outright.
    #[error("Identity banned at {url}")]
    BanDetected { url: String, proxy: Option<String> },

    /// Unexpected page shape on a successfully fetched page. Dropped, never
    /// retried: refetching an unparseable page wastes a request.
    #[error("Extraction failed for {platform} {url}: {message}")]
    Extraction {
        platform: String,
        url: String,
        message: String,
    },

    /// Malformed envelope or unroutable destination. Fatal to the task.
    #[error("Protocol violation: {0}")]
    Protocol(String),
}

/// Result type alias for Flowline infrastructure operations
pub type Result<T> = std::result::Result<T, FlowError>;

/// Result type alias for handler outcomes
pub type CrawlResult<T> = std::result::Result<T, CrawlError>;

// Re-export commonly used types
pub use config::Config;
pub use group::{Delivery, GroupHandle, Routed, RouteKey, TaskGroup, Worker};
pub use rotation::RotationCoordinator;
pub use run::RunTracker;
pub use task::{Task, TaskEnvelope};
