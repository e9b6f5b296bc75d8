use crate::config::ProtocolConfig;
use crate::driver::{Context, DriverError};
use crate::retry::RetryPolicy;
use crate::state::{Capability, CapabilityState};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Capability states recorded for one execution context
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolSession {
    states: BTreeMap<Capability, CapabilityState>,
}

impl ProtocolSession {
    /// State of one capability; `Unknown` if never attempted
    pub fn state(&self, capability: Capability) -> CapabilityState {
        self.states
            .get(&capability)
            .copied()
            .unwrap_or(CapabilityState::Unknown)
    }

    /// Capabilities that ended up `Failed`
    pub fn failed(&self) -> Vec<Capability> {
        self.states
            .iter()
            .filter(|(_, s)| **s == CapabilityState::Failed)
            .map(|(c, _)| *c)
            .collect()
    }

    pub fn enabled(&self) -> Vec<Capability> {
        self.states
            .iter()
            .filter(|(_, s)| **s == CapabilityState::Enabled)
            .map(|(c, _)| *c)
            .collect()
    }
}

type Gate = Arc<tokio::sync::Mutex<()>>;

/// Activates and re-activates control-channel capabilities safely
pub struct ProtocolHealthManager {
    config: ProtocolConfig,
    sessions: Mutex<HashMap<String, ProtocolSession>>,
    gates: Mutex<HashMap<(String, Capability), Gate>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ProtocolHealthManager {
    pub fn new(config: ProtocolConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn gate(&self, context_id: &str, capability: Capability) -> Gate {
        lock(&self.gates)
            .entry((context_id.to_string(), capability))
            .or_default()
            .clone()
    }

    fn set_state(&self, context_id: &str, capability: Capability, state: CapabilityState) {
        lock(&self.sessions)
            .entry(context_id.to_string())
            .or_default()
            .states
            .insert(capability, state);
    }

    /// Current state of one capability on one context
    pub fn state(&self, context_id: &str, capability: Capability) -> CapabilityState {
        lock(&self.sessions)
            .get(context_id)
            .map(|s| s.state(capability))
            .unwrap_or(CapabilityState::Unknown)
    }

    /// Snapshot of every capability state for a context
    pub fn session(&self, context_id: &str) -> ProtocolSession {
        lock(&self.sessions)
            .get(context_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Activates one capability with a bounded timeout and retries
    ///
    /// Exhausting the retries marks the capability `Failed` and returns; it
    /// is never an error. Only one activation sequence runs per
    /// (context, capability) at a time: a concurrent caller waits for it and
    /// returns the settled state.
    pub async fn enable(&self, context: &dyn Context, capability: Capability) -> CapabilityState {
        let context_id = context.id().to_string();
        let gate = self.gate(&context_id, capability);
        let _held = gate.lock().await;

        if self.state(&context_id, capability) == CapabilityState::Enabled {
            return CapabilityState::Enabled;
        }
        self.set_state(&context_id, capability, CapabilityState::Enabling);

        let budget = Duration::from_millis(self.config.enable_timeout_ms);
        let policy = RetryPolicy::fixed(
            self.config.max_retries,
            Duration::from_millis(self.config.retry_delay_ms),
        );
        let label = format!("{}.enable on {}", capability, context_id);

        let result = policy
            .run(&label, |_| async move {
                match tokio::time::timeout(budget, context.enable(capability)).await {
                    Ok(result) => result,
                    Err(_) => Err(DriverError::Timeout(budget)),
                }
            })
            .await;

        let state = match result {
            Ok(()) => {
                tracing::debug!("{} enabled on {}", capability, context_id);
                CapabilityState::Enabled
            }
            Err(e) => {
                tracing::warn!(
                    "{} could not be enabled on {} after {} attempts: {}",
                    capability,
                    context_id,
                    self.config.max_retries,
                    e
                );
                CapabilityState::Failed
            }
        };
        self.set_state(&context_id, capability, state);
        state
    }

    /// Activates every configured capability independently and concurrently
    pub async fn enable_all(&self, context: &dyn Context) -> ProtocolSession {
        let attempts = self
            .config
            .capabilities
            .iter()
            .map(|capability| self.enable(context, *capability));
        futures::future::join_all(attempts).await;

        let session = self.session(context.id());
        let failed = session.failed();
        if !failed.is_empty() {
            tracing::warn!(
                "Context {} running degraded, failed capabilities: {:?}",
                context.id(),
                failed
            );
        }
        session
    }

    /// Waits, resets every capability and activates them again
    ///
    /// Returns true if the context is operational afterwards.
    pub async fn reconnect(&self, context: &dyn Context) -> bool {
        tracing::info!("Reconnecting protocol on {}", context.id());
        tokio::time::sleep(Duration::from_millis(self.config.reconnect_delay_ms)).await;

        for capability in &self.config.capabilities {
            let gate = self.gate(context.id(), *capability);
            let _held = gate.lock().await;
            self.set_state(context.id(), *capability, CapabilityState::Unknown);
        }

        self.enable_all(context).await;
        self.is_operational(context.id())
    }

    /// True when every critical capability is enabled
    pub fn is_operational(&self, context_id: &str) -> bool {
        let session = self.session(context_id);
        self.config
            .critical
            .iter()
            .all(|c| session.state(*c) == CapabilityState::Enabled)
    }

    /// Drops all records for a closed context
    pub fn forget(&self, context_id: &str) {
        lock(&self.sessions).remove(context_id);
        lock(&self.gates).retain(|(id, _), _| id != context_id);
    }

    /// Number of contexts currently tracked
    pub fn tracked_contexts(&self) -> usize {
        lock(&self.sessions).len()
    }
}
