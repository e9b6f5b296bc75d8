/// Protocol capability definitions
///
/// A capability is one activatable domain of an execution context's control
/// channel. Activation can hang, so each one is tracked separately.
use serde::{Deserialize, Serialize};
use std::fmt;

/// An activatable feature of an execution context's control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Network events and request interception
    Network,

    /// Page lifecycle events
    Page,

    /// Script evaluation
    Runtime,

    /// DOM access
    Dom,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Page => "page",
            Self::Runtime => "runtime",
            Self::Dom => "dom",
        }
    }

    pub fn all() -> Vec<Self> {
        vec![Self::Network, Self::Page, Self::Runtime, Self::Dom]
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Activation state of one capability on one execution context
///
/// `Unknown → Enabling → {Enabled | Failed}`; a reconnect resets to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapabilityState {
    Unknown,
    Enabling,
    Enabled,
    Failed,
}

impl CapabilityState {
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Enabled | Self::Failed)
    }
}

impl fmt::Display for CapabilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Enabling => "enabling",
            Self::Enabled => "enabled",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}
