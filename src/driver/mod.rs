//! Browser automation backend
//!
//! The orchestration engine talks to the automation layer only through the
//! traits in this module:
//! - `Driver` launches heavyweight sessions (one browser process each)
//! - `Session` opens execution contexts (pages/tabs)
//! - `Context` is what a task drives: navigation, scripts, capabilities
//!
//! `ChromiumDriver` is the production backend; `MemoryDriver` is an
//! in-process backend whose failures can be scripted.

mod chromium;
mod identity;
mod memory;

pub use chromium::ChromiumDriver;
pub use identity::{IdentityConfigurator, StaticIdentity};
pub use memory::MemoryDriver;

use crate::state::Capability;
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by an automation backend
///
/// Messages are classified by `recovery::classify`, so they keep the
/// backend's own wording.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Failed to launch browser session: {0}")]
    Launch(String),

    #[error("CDP protocol error: {0}")]
    Protocol(String),

    #[error("Navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    #[error("Script evaluation failed: {0}")]
    Script(String),

    #[error("Session closed")]
    Closed,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Request categories a context can refuse to load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Image,
    Stylesheet,
    Font,

    /// Audio and video
    Media,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Image => "image",
            Self::Stylesheet => "stylesheet",
            Self::Font => "font",
            Self::Media => "media",
        };
        write!(f, "{}", name)
    }
}

/// Result type for automation backend operations
pub type DriverResult<T> = Result<T, DriverError>;

/// Launches automation sessions
#[async_trait]
pub trait Driver: Send + Sync {
    /// Starts one new session (e.g. a browser process)
    async fn launch(&self) -> DriverResult<Arc<dyn Session>>;
}

/// One heavyweight automation session, owned by the resource pool
#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> &str;

    /// False once the underlying process or connection is gone
    fn is_connected(&self) -> bool;

    /// Opens a fresh execution context on this session
    async fn new_context(&self) -> DriverResult<Arc<dyn Context>>;

    async fn close(&self) -> DriverResult<()>;
}

/// An execution context (page) a task drives
#[async_trait]
pub trait Context: Send + Sync {
    fn id(&self) -> &str;

    /// Default budget for navigation on this context
    async fn set_default_timeout(&self, timeout: Duration) -> DriverResult<()>;

    async fn set_viewport(&self, width: u32, height: u32) -> DriverResult<()>;

    async fn set_user_agent(&self, user_agent: &str) -> DriverResult<()>;

    /// Fails every later request of the given kinds before it is sent
    async fn block_resources(&self, kinds: &[ResourceKind]) -> DriverResult<()>;

    /// Activates one control-channel capability; may hang
    async fn enable(&self, capability: Capability) -> DriverResult<()>;

    async fn navigate(&self, url: &str) -> DriverResult<()>;

    /// Evaluates a script and returns its JSON result
    async fn evaluate(&self, script: &str) -> DriverResult<serde_json::Value>;

    /// `document.readyState` of the current document
    async fn ready_state(&self) -> DriverResult<String>;

    async fn reload(&self) -> DriverResult<()>;

    async fn clear_cache(&self) -> DriverResult<()>;

    /// Cheap liveness probe; never errors
    async fn is_alive(&self) -> bool;

    async fn close(&self) -> DriverResult<()>;
}
