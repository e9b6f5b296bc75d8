//! Configuration module for Marque
//!
//! This module handles loading, parsing, and validating TOML configuration
//! files, applying environment overrides, and resolving per-job profiles.
//!
//! # Example
//!
//! ```no_run
//! use marque_crawler::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("marque.toml")).unwrap();
//! let profile = config.profile_for("BYD");
//! println!("BYD runs {} tasks at a time", profile.task_concurrency);
//! ```

mod parser;
mod profile;
mod types;
mod validation;

// Re-export types
pub use profile::JobProfile;
pub use types::{
    BrandEntry, BrowserConfig, Config, OutputConfig, ProtocolConfig, RecoveryConfig,
    RecoveryWaits, SchedulerConfig, SiteConfig, TaskConfig,
};

// Re-export parser functions
pub use parser::{
    apply_env_overrides, compute_config_hash, load_config, load_config_with_hash, parse_config,
    ENV_AUTO_MODE, ENV_CONCURRENCY, ENV_MAX_BRANDS_PER_SESSION,
};
