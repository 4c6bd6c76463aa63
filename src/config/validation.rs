use crate::config::types::{Config, PipelineConfig, QueueConfig};
use crate::ConfigError;
use std::collections::HashSet;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_fetch(config)?;
    validate_rotation(config)?;
    let queues = validate_queues(&config.queue)?;
    validate_pipelines(&config.pipeline, &queues)?;
    validate_ban_hold_queue(config)?;
    Ok(())
}

fn validate_fetch(config: &Config) -> Result<(), ConfigError> {
    if config.fetch.user_agent.is_empty() {
        return Err(ConfigError::Validation(
            "fetch.user-agent cannot be empty".to_string(),
        ));
    }

    if !(1..=600).contains(&config.fetch.request_timeout_secs) {
        return Err(ConfigError::Validation(format!(
            "fetch.request-timeout-secs must be between 1 and 600, got {}",
            config.fetch.request_timeout_secs
        )));
    }

    // URL templates must at least parse with their placeholder substituted
    for (name, platform) in &config.platform {
        for (key, template) in [
            ("search-url", &platform.search_url),
            ("item-url", &platform.item_url),
        ] {
            if let Some(template) = template {
                let probe = template
                    .replace("{keyword}", "probe")
                    .replace("{key}", "probe");
                Url::parse(&probe).map_err(|e| {
                    ConfigError::InvalidUrl(format!("platform.{}.{}: {}", name, key, e))
                })?;
            }
        }
    }
    Ok(())
}

fn validate_rotation(config: &Config) -> Result<(), ConfigError> {
    if config.rotation.interface.is_empty() {
        return Err(ConfigError::Validation(
            "rotation.interface cannot be empty".to_string(),
        ));
    }
    if config.rotation.retry_delay_secs == 0 {
        return Err(ConfigError::Validation(
            "rotation.retry-delay-secs must be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_ban_hold_queue(config: &Config) -> Result<(), ConfigError> {
    if let Some(ban) = &config.pipeline.ban {
        let held = config
            .queue
            .iter()
            .find(|q| q.name == ban.hold_queue)
            .map(|q| q.delay_secs.is_some())
            .unwrap_or(false);
        if !held {
            return Err(ConfigError::Validation(format!(
                "pipeline.ban.hold-queue {} must be declared with delay-secs",
                ban.hold_queue
            )));
        }
    }
    Ok(())
}

fn validate_queues(queues: &[QueueConfig]) -> Result<HashSet<String>, ConfigError> {
    let mut names = HashSet::new();
    for queue in queues {
        if queue.name.is_empty() {
            return Err(ConfigError::Validation(
                "queue.name cannot be empty".to_string(),
            ));
        }
        if !names.insert(queue.name.clone()) {
            return Err(ConfigError::Validation(format!(
                "duplicate queue name: {}",
                queue.name
            )));
        }
        if queue.capacity == Some(0) {
            return Err(ConfigError::Validation(format!(
                "queue {}: capacity must be >= 1 when set",
                queue.name
            )));
        }
    }
    Ok(names)
}

fn validate_pipelines(
    pipeline: &PipelineConfig,
    queues: &HashSet<String>,
) -> Result<(), ConfigError> {
    let check_queue = |context: &str, name: &str| {
        if queues.contains(name) {
            Ok(())
        } else {
            Err(ConfigError::Validation(format!(
                "{} references undeclared queue: {}",
                context, name
            )))
        }
    };
    let check_workers = |context: &str, workers: usize| {
        if (1..=200).contains(&workers) {
            Ok(())
        } else {
            Err(ConfigError::Validation(format!(
                "{}: workers must be between 1 and 200, got {}",
                context, workers
            )))
        }
    };

    if let Some(category) = &pipeline.category {
        check_workers("pipeline.category", category.workers)?;
        check_queue("pipeline.category", &category.input_queue)?;
        check_queue("pipeline.category", &category.output_queue)?;
        if let Some(ban) = &category.ban_queue {
            check_queue("pipeline.category", ban)?;
        }
    }
    if let Some(search) = &pipeline.search {
        check_workers("pipeline.search", search.workers)?;
        if search.slots == 0 {
            return Err(ConfigError::Validation(
                "pipeline.search: slots must be >= 1".to_string(),
            ));
        }
        check_queue("pipeline.search", &search.input_queue)?;
        check_queue("pipeline.search", &search.output_queue)?;
    }
    if let Some(detail) = &pipeline.detail {
        check_workers("pipeline.detail", detail.workers)?;
        check_queue("pipeline.detail", &detail.input_queue)?;
        check_queue("pipeline.detail", &detail.output_queue)?;
    }
    if let Some(ban) = &pipeline.ban {
        check_queue("pipeline.ban", &ban.input_queue)?;
        check_queue("pipeline.ban", &ban.hold_queue)?;
    }
    if let Some(router) = &pipeline.router {
        check_workers("pipeline.router", router.workers)?;
        check_queue("pipeline.router", &router.input_queue)?;
        for (chain, steps) in &router.chains {
            if steps.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "pipeline.router.chains.{}: chain cannot be empty",
                    chain
                )));
            }
            for step in steps {
                check_queue(&format!("pipeline.router.chains.{}", chain), step)?;
            }
        }
        for (at, targets) in &router.forks {
            for target in targets {
                if !router.chains.contains_key(target) {
                    return Err(ConfigError::Validation(format!(
                        "pipeline.router.forks.{}: unknown chain {}",
                        at, target
                    )));
                }
            }
        }
    }
    if let Some(stats) = &pipeline.stats {
        check_queue("pipeline.stats", &stats.input_queue)?;
        check_queue("pipeline.stats", &stats.flush_queue)?;
        if stats.flush_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "pipeline.stats: flush-interval-secs must be >= 1".to_string(),
            ));
        }
    }
    Ok(())
}
