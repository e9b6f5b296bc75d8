//! In-process automation backend
//!
//! `MemoryDriver` needs no browser. Its behaviour is scripted through the
//! handle: failing launches, hanging or failing capabilities, dead contexts,
//! canned script results. Counters record what the engine did to it.

use crate::driver::{Context, Driver, DriverError, DriverResult, ResourceKind, Session};
use crate::state::Capability;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct MemoryState {
    launches: AtomicUsize,
    failing_launches: AtomicUsize,
    sessions_closed: AtomicUsize,
    contexts_created: AtomicUsize,
    contexts_closed: AtomicUsize,
    reloads: AtomicUsize,
    cache_clears: AtomicUsize,
    epoch: AtomicU64,
    failing_capabilities: Mutex<HashSet<Capability>>,
    hanging_capabilities: Mutex<HashSet<Capability>>,
    enable_calls: Mutex<HashMap<Capability, u32>>,
    failing_normalization: AtomicBool,
    failing_blocking: AtomicBool,
    blocked: Mutex<HashMap<String, Vec<ResourceKind>>>,
    ready_state: Mutex<Option<String>>,
    scripts: Mutex<HashMap<String, serde_json::Value>>,
    navigations: Mutex<Vec<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scriptable in-process driver
#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Arc<MemoryState>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` launches fail
    pub fn fail_next_launches(&self, count: usize) {
        self.state.failing_launches.store(count, Ordering::SeqCst);
    }

    /// Makes activation of `capability` fail immediately
    pub fn fail_capability(&self, capability: Capability) {
        lock(&self.state.failing_capabilities).insert(capability);
    }

    /// Makes activation of `capability` never complete
    pub fn hang_capability(&self, capability: Capability) {
        lock(&self.state.hanging_capabilities).insert(capability);
    }

    /// Restores normal activation for every capability
    pub fn heal_capabilities(&self) {
        lock(&self.state.failing_capabilities).clear();
        lock(&self.state.hanging_capabilities).clear();
    }

    /// Makes viewport, timeout and user agent setup fail
    pub fn fail_normalization(&self, fail: bool) {
        self.state.failing_normalization.store(fail, Ordering::SeqCst);
    }

    /// Makes request blocking fail on every context
    pub fn fail_resource_blocking(&self, fail: bool) {
        self.state.failing_blocking.store(fail, Ordering::SeqCst);
    }

    /// Kinds blocked on a context, empty if blocking was never applied
    pub fn blocked_resources(&self, context_id: &str) -> Vec<ResourceKind> {
        lock(&self.state.blocked)
            .get(context_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Overrides `document.readyState` for every context
    pub fn set_ready_state(&self, state: &str) {
        *lock(&self.state.ready_state) = Some(state.to_string());
    }

    /// Canned result for `evaluate(script)`
    pub fn set_script_result(&self, script: &str, value: serde_json::Value) {
        lock(&self.state.scripts).insert(script.to_string(), value);
    }

    /// Marks every existing context dead
    pub fn kill_contexts(&self) {
        self.state.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn launches(&self) -> usize {
        self.state.launches.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.sessions_closed.load(Ordering::SeqCst)
    }

    pub fn contexts_created(&self) -> usize {
        self.state.contexts_created.load(Ordering::SeqCst)
    }

    pub fn contexts_closed(&self) -> usize {
        self.state.contexts_closed.load(Ordering::SeqCst)
    }

    pub fn reloads(&self) -> usize {
        self.state.reloads.load(Ordering::SeqCst)
    }

    pub fn cache_clears(&self) -> usize {
        self.state.cache_clears.load(Ordering::SeqCst)
    }

    /// Number of activation attempts seen for `capability`
    pub fn enable_calls(&self, capability: Capability) -> u32 {
        lock(&self.state.enable_calls)
            .get(&capability)
            .copied()
            .unwrap_or(0)
    }

    pub fn navigations(&self) -> Vec<String> {
        lock(&self.state.navigations).clone()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn launch(&self) -> DriverResult<Arc<dyn Session>> {
        let failing = self
            .state
            .failing_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(DriverError::Launch(
                "Failed to launch the browser process".to_string(),
            ));
        }

        let number = self.state.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemorySession {
            id: format!("memory-{}", number),
            connected: AtomicBool::new(true),
            contexts: AtomicUsize::new(0),
            state: self.state.clone(),
        }))
    }
}

struct MemorySession {
    id: String,
    connected: AtomicBool,
    contexts: AtomicUsize,
    state: Arc<MemoryState>,
}

#[async_trait]
impl Session for MemorySession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn new_context(&self) -> DriverResult<Arc<dyn Context>> {
        if !self.is_connected() {
            return Err(DriverError::Closed);
        }
        self.state.contexts_created.fetch_add(1, Ordering::SeqCst);
        let number = self.contexts.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryContext {
            id: format!("{}/page-{}", self.id, number),
            epoch: self.state.epoch.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
            state: self.state.clone(),
        }))
    }

    async fn close(&self) -> DriverResult<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.state.sessions_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MemoryContext {
    id: String,
    epoch: u64,
    closed: AtomicBool,
    state: Arc<MemoryState>,
}

impl MemoryContext {
    fn alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.epoch == self.state.epoch.load(Ordering::SeqCst)
    }

    fn check_alive(&self) -> DriverResult<()> {
        if self.alive() {
            Ok(())
        } else {
            Err(DriverError::Protocol(format!(
                "Target closed: context {} is gone",
                self.id
            )))
        }
    }

    fn check_normalization(&self) -> DriverResult<()> {
        self.check_alive()?;
        if self.state.failing_normalization.load(Ordering::SeqCst) {
            return Err(DriverError::Protocol(
                "Emulation override rejected".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Context for MemoryContext {
    fn id(&self) -> &str {
        &self.id
    }

    async fn set_default_timeout(&self, _timeout: Duration) -> DriverResult<()> {
        self.check_normalization()
    }

    async fn set_viewport(&self, _width: u32, _height: u32) -> DriverResult<()> {
        self.check_normalization()
    }

    async fn set_user_agent(&self, _user_agent: &str) -> DriverResult<()> {
        self.check_normalization()
    }

    async fn block_resources(&self, kinds: &[ResourceKind]) -> DriverResult<()> {
        self.check_alive()?;
        if self.state.failing_blocking.load(Ordering::SeqCst) {
            return Err(DriverError::Protocol("Fetch.enable failed".to_string()));
        }
        lock(&self.state.blocked).insert(self.id.clone(), kinds.to_vec());
        Ok(())
    }

    async fn enable(&self, capability: Capability) -> DriverResult<()> {
        *lock(&self.state.enable_calls).entry(capability).or_insert(0) += 1;
        self.check_alive()?;

        let hangs = lock(&self.state.hanging_capabilities).contains(&capability);
        if hangs {
            futures::future::pending::<()>().await;
        }
        let fails = lock(&self.state.failing_capabilities).contains(&capability);
        if fails {
            return Err(DriverError::Protocol(format!(
                "{}.enable failed",
                capability
            )));
        }
        Ok(())
    }

    async fn navigate(&self, url: &str) -> DriverResult<()> {
        self.check_alive()?;
        lock(&self.state.navigations).push(url.to_string());
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> DriverResult<serde_json::Value> {
        self.check_alive()?;
        Ok(lock(&self.state.scripts)
            .get(script)
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    }

    async fn ready_state(&self) -> DriverResult<String> {
        self.check_alive()?;
        Ok(lock(&self.state.ready_state)
            .clone()
            .unwrap_or_else(|| "complete".to_string()))
    }

    async fn reload(&self) -> DriverResult<()> {
        self.check_alive()?;
        self.state.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear_cache(&self) -> DriverResult<()> {
        self.check_alive()?;
        self.state.cache_clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.alive()
    }

    async fn close(&self) -> DriverResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.contexts_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_launch_failures_are_consumed() {
        let driver = MemoryDriver::new();
        driver.fail_next_launches(2);

        assert!(driver.launch().await.is_err());
        assert!(driver.launch().await.is_err());
        assert!(driver.launch().await.is_ok());
        assert_eq!(driver.launches(), 1);
    }

    #[tokio::test]
    async fn test_killed_contexts_are_dead() {
        let driver = MemoryDriver::new();
        let session = driver.launch().await.unwrap();
        let old = session.new_context().await.unwrap();

        driver.kill_contexts();
        let fresh = session.new_context().await.unwrap();

        assert!(!old.is_alive().await);
        assert!(old.ready_state().await.is_err());
        assert!(fresh.is_alive().await);
    }

    #[tokio::test]
    async fn test_closed_session_refuses_contexts() {
        let driver = MemoryDriver::new();
        let session = driver.launch().await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();

        assert!(session.new_context().await.is_err());
        assert_eq!(driver.sessions_closed(), 1);
    }

    #[tokio::test]
    async fn test_script_results() {
        let driver = MemoryDriver::new();
        driver.set_script_result("window.__data", serde_json::json!({"ok": true}));
        let session = driver.launch().await.unwrap();
        let context = session.new_context().await.unwrap();

        let value = context.evaluate("window.__data").await.unwrap();
        assert_eq!(value["ok"], true);
        assert!(context.evaluate("other").await.unwrap().is_null());
    }
}
