use crate::config::types::{
    BrandEntry, BrowserConfig, Config, OutputConfig, ProtocolConfig, SchedulerConfig, SiteConfig,
    TaskConfig,
};
use crate::ConfigError;
use std::collections::HashSet;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_scheduler_config(&config.scheduler)?;
    validate_task_config(&config.task)?;
    validate_protocol_config(&config.protocol)?;
    validate_browser_config(&config.browser)?;
    validate_output_config(&config.output)?;
    if let Some(site) = &config.site {
        validate_site_config(site)?;
    }
    validate_brands(&config.brands)?;
    Ok(())
}

/// Validates scheduler configuration
fn validate_scheduler_config(config: &SchedulerConfig) -> Result<(), ConfigError> {
    if config.max_concurrent_jobs < 1 || config.max_concurrent_jobs > 32 {
        return Err(ConfigError::Validation(format!(
            "max_concurrent_jobs must be between 1 and 32, got {}",
            config.max_concurrent_jobs
        )));
    }

    if config.retry_attempts < 1 {
        return Err(ConfigError::Validation(format!(
            "retry_attempts must be >= 1, got {}",
            config.retry_attempts
        )));
    }

    if config.poll_interval_ms < 1 {
        return Err(ConfigError::Validation(
            "poll_interval_ms must be >= 1ms".to_string(),
        ));
    }

    if config.timeout_per_job_ms < 1_000 {
        return Err(ConfigError::Validation(format!(
            "timeout_per_job_ms must be >= 1000ms, got {}ms",
            config.timeout_per_job_ms
        )));
    }

    if config.max_brands_per_session < 1 {
        return Err(ConfigError::Validation(
            "max_brands_per_session must be >= 1".to_string(),
        ));
    }

    if config.exponential_backoff && config.max_retry_delay_ms < config.retry_delay_ms {
        return Err(ConfigError::Validation(format!(
            "max_retry_delay_ms ({}) must not be below retry_delay_ms ({})",
            config.max_retry_delay_ms, config.retry_delay_ms
        )));
    }

    Ok(())
}

/// Validates task defaults
fn validate_task_config(config: &TaskConfig) -> Result<(), ConfigError> {
    if config.max_attempts < 1 {
        return Err(ConfigError::Validation(format!(
            "task max_attempts must be >= 1, got {}",
            config.max_attempts
        )));
    }

    if config.pool_size < 1 || config.pool_size > 16 {
        return Err(ConfigError::Validation(format!(
            "pool_size must be between 1 and 16, got {}",
            config.pool_size
        )));
    }

    if config.concurrency < 1 {
        return Err(ConfigError::Validation(
            "task concurrency must be >= 1".to_string(),
        ));
    }

    if config.acquire_poll_ms < 1 {
        return Err(ConfigError::Validation(
            "acquire_poll_ms must be >= 1ms".to_string(),
        ));
    }

    if config.launch_attempts < 1 {
        return Err(ConfigError::Validation(
            "launch_attempts must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates protocol activation settings
fn validate_protocol_config(config: &ProtocolConfig) -> Result<(), ConfigError> {
    if config.enable_timeout_ms < 1 {
        return Err(ConfigError::Validation(
            "enable_timeout_ms must be >= 1ms".to_string(),
        ));
    }

    if config.max_retries < 1 {
        return Err(ConfigError::Validation(
            "protocol max_retries must be >= 1".to_string(),
        ));
    }

    for critical in &config.critical {
        if !config.capabilities.contains(critical) {
            return Err(ConfigError::Validation(format!(
                "critical capability '{}' is not in the capability list",
                critical
            )));
        }
    }

    Ok(())
}

/// Validates browser settings
fn validate_browser_config(config: &BrowserConfig) -> Result<(), ConfigError> {
    if config.viewport_width == 0 || config.viewport_height == 0 {
        return Err(ConfigError::Validation(format!(
            "viewport must be non-empty, got {}x{}",
            config.viewport_width, config.viewport_height
        )));
    }

    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user_agent cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validates output configuration
fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    let paths = [
        ("data_dir", &config.data_dir),
        ("checkpoint_dir", &config.checkpoint_dir),
        ("status_path", &config.status_path),
        ("cursor_path", &config.cursor_path),
        ("report_dir", &config.report_dir),
        ("database_path", &config.database_path),
    ];

    for (name, value) in paths {
        if value.is_empty() {
            return Err(ConfigError::Validation(format!("{} cannot be empty", name)));
        }
    }

    Ok(())
}

/// Validates the site description
fn validate_site_config(config: &SiteConfig) -> Result<(), ConfigError> {
    validate_url_template("discovery-url", &config.discovery_url, "{source_id}")?;
    validate_url_template("task-url", &config.task_url, "{task_id}")?;

    if config.discovery_script.trim().is_empty() || config.extract_script.trim().is_empty() {
        return Err(ConfigError::Validation(
            "discovery-script and extract-script cannot be empty".to_string(),
        ));
    }

    if !config.items_pointer.is_empty() && !config.items_pointer.starts_with('/') {
        return Err(ConfigError::Validation(format!(
            "items-pointer must be a JSON pointer starting with '/', got '{}'",
            config.items_pointer
        )));
    }

    Ok(())
}

/// Validates a URL template: it must contain its placeholder and parse once filled in
fn validate_url_template(name: &str, template: &str, placeholder: &str) -> Result<(), ConfigError> {
    if !template.contains(placeholder) {
        return Err(ConfigError::Validation(format!(
            "{} must contain the {} placeholder",
            name, placeholder
        )));
    }

    let url = Url::parse(&template.replace(placeholder, "0"))
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid {} '{}': {}", name, template, e)))?;

    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(ConfigError::InvalidUrl(format!(
            "{} must use http or https, got '{}'",
            name,
            url.scheme()
        )));
    }

    Ok(())
}

/// Validates catalog entries
fn validate_brands(brands: &[BrandEntry]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();

    for entry in brands {
        validate_job_id(&entry.name)?;

        if !seen.insert(entry.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "brand '{}' is listed more than once",
                entry.name
            )));
        }

        if entry.source_ids.is_empty() || entry.source_ids.iter().any(|id| id.trim().is_empty()) {
            return Err(ConfigError::Validation(format!(
                "brand '{}' must have at least one non-empty source id",
                entry.name
            )));
        }

        if entry.timeout_ms.is_some_and(|t| t < 1_000) {
            return Err(ConfigError::Validation(format!(
                "brand '{}' timeout-ms must be >= 1000ms",
                entry.name
            )));
        }
    }

    Ok(())
}

/// Job ids name files on disk, so path separators are rejected
fn validate_job_id(id: &str) -> Result<(), ConfigError> {
    if id.trim().is_empty() {
        return Err(ConfigError::Validation(
            "brand name cannot be empty".to_string(),
        ));
    }

    if id.contains(['/', '\\']) || id == "." || id == ".." {
        return Err(ConfigError::Validation(format!(
            "brand name '{}' cannot contain path separators",
            id
        )));
    }

    Ok(())
}
