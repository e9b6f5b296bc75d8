use crate::config::types::Config;
use crate::config::validation::validate;
use crate::ConfigError;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Default concurrent job count
pub const ENV_CONCURRENCY: &str = "CRAWLER_CONCURRENCY";

/// Per-session job cap in `auto` mode
pub const ENV_MAX_BRANDS_PER_SESSION: &str = "MAX_BRANDS_PER_SESSION";

/// When true, `run` without a selector means `auto`
pub const ENV_AUTO_MODE: &str = "AUTO_MODE";

/// Loads and parses a configuration file from the given path
///
/// Environment overrides are applied after parsing and before validation.
///
/// # Arguments
///
/// * `path` - Path to the TOML configuration file
///
/// # Returns
///
/// * `Ok(Config)` - Successfully loaded and validated configuration
/// * `Err(ConfigError)` - Failed to load, parse, or validate the configuration
///
/// # Example
///
/// ```no_run
/// use std::path::Path;
/// use marque_crawler::config::load_config;
///
/// let config = load_config(Path::new("marque.toml")).unwrap();
/// println!("Max concurrent jobs: {}", config.scheduler.max_concurrent_jobs);
/// ```
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content, |name| std::env::var(name).ok())
}

/// Parses configuration text, applying overrides from `env`
///
/// `env` is a lookup function so callers (and tests) can supply something
/// other than the process environment.
pub fn parse_config<F>(content: &str, env: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config: Config = toml::from_str(content)?;
    apply_env_overrides(&mut config, env)?;
    validate(&config)?;
    Ok(config)
}

/// Applies `CRAWLER_CONCURRENCY`, `MAX_BRANDS_PER_SESSION` and `AUTO_MODE`
pub fn apply_env_overrides<F>(config: &mut Config, env: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = env(ENV_CONCURRENCY) {
        config.scheduler.max_concurrent_jobs = parse_env_number(ENV_CONCURRENCY, &value)?;
    }

    if let Some(value) = env(ENV_MAX_BRANDS_PER_SESSION) {
        config.scheduler.max_brands_per_session =
            parse_env_number(ENV_MAX_BRANDS_PER_SESSION, &value)?;
    }

    if let Some(value) = env(ENV_AUTO_MODE) {
        config.scheduler.auto_mode = match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" | "" => false,
            other => {
                return Err(ConfigError::Env {
                    name: ENV_AUTO_MODE.to_string(),
                    message: format!("expected a boolean, got '{}'", other),
                })
            }
        };
    }

    Ok(())
}

fn parse_env_number(name: &str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse::<usize>().map_err(|e| ConfigError::Env {
        name: name.to_string(),
        message: format!("'{}': {}", value, e),
    })
}

/// Computes a SHA-256 hash of the configuration file content
///
/// This is used to detect if the configuration has changed between runs.
///
/// # Arguments
///
/// * `path` - Path to the TOML configuration file
///
/// # Returns
///
/// * `Ok(String)` - Hex-encoded SHA-256 hash of the file content
/// * `Err(ConfigError)` - Failed to read the file
pub fn compute_config_hash(path: &Path) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let result = hasher.finalize();
    Ok(hex::encode(result))
}

/// Loads a configuration and returns both the config and its hash
pub fn load_config_with_hash(path: &Path) -> Result<(Config, String), ConfigError> {
    let config = load_config(path)?;
    let hash = compute_config_hash(path)?;
    Ok((config, hash))
}
