use crate::config::BrowserConfig;
use crate::driver::{Context, Driver, DriverResult, IdentityConfigurator, Session};
use crate::pool::{PoolError, PoolResult};
use crate::protocol::ProtocolHealthManager;
use crate::retry::RetryPolicy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

#[derive(Default)]
struct Slot {
    session: Option<Arc<dyn Session>>,
    in_use: bool,
}

struct PoolInner {
    label: String,
    driver: Arc<dyn Driver>,
    protocol: Arc<ProtocolHealthManager>,
    identity: Arc<dyn IdentityConfigurator>,
    browser: BrowserConfig,
    acquire_poll: Duration,
    launch_policy: RetryPolicy,
    slots: Mutex<Vec<Slot>>,
    /// Open contexts keyed by context id, with the slot they belong to
    contexts: Mutex<HashMap<String, (usize, Arc<dyn Context>)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PoolInner {
    async fn launch(&self) -> DriverResult<Arc<dyn Session>> {
        let label = format!("{}: session launch", self.label);
        self.launch_policy
            .run(&label, |_| self.driver.launch())
            .await
    }

    fn take_contexts(&self, slot: usize) -> Vec<Arc<dyn Context>> {
        let mut contexts = lock(&self.contexts);
        let ids: Vec<String> = contexts
            .iter()
            .filter(|(_, (owner, _))| *owner == slot)
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| contexts.remove(id).map(|(_, c)| c))
            .collect()
    }

    async fn close_contexts(&self, contexts: Vec<Arc<dyn Context>>) {
        for context in contexts {
            self.protocol.forget(context.id());
            if let Err(e) = context.close().await {
                tracing::debug!("{}: closing context {} failed: {}", self.label, context.id(), e);
            }
        }
    }

    async fn close_session(&self, session: Arc<dyn Session>) {
        if let Err(e) = session.close().await {
            tracing::debug!("{}: closing session {} failed: {}", self.label, session.id(), e);
        }
    }
}

/// An execution context ready for a task
pub struct PreparedContext {
    pub context: Arc<dyn Context>,

    /// Some normalization step or capability failed; the context is usable
    /// but may behave differently
    pub degraded: bool,
}

/// An exclusively borrowed session
///
/// Give it back with `ResourcePool::release`. A handle dropped without
/// being released (e.g. its task was aborted) destroys its session.
pub struct ResourceHandle {
    id: usize,
    session: Arc<dyn Session>,
    pool: Weak<PoolInner>,
    released: bool,
}

impl ResourceHandle {
    /// Slot index inside the pool
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("id", &self.id)
            .field("session", &self.session.id())
            .finish()
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Some(pool) = self.pool.upgrade() else {
            return;
        };

        let session = {
            let mut slots = lock(&pool.slots);
            match slots.get_mut(self.id) {
                Some(slot) => {
                    slot.in_use = false;
                    slot.session.take()
                }
                None => None,
            }
        };
        let contexts = pool.take_contexts(self.id);
        tracing::warn!(
            "{}: resource {} abandoned by its borrower, destroying it",
            pool.label,
            self.id
        );

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                pool.close_contexts(contexts).await;
                if let Some(session) = session {
                    pool.close_session(session).await;
                }
            });
        }
    }
}

enum Claim {
    Ready(usize, Arc<dyn Session>),
    Relaunch(usize, Option<Arc<dyn Session>>),
    Busy,
}

/// Pool of automation sessions for one job
#[derive(Clone)]
pub struct ResourcePool {
    inner: Arc<PoolInner>,
}

impl ResourcePool {
    /// Creates an empty pool; call `init_pool` before acquiring
    ///
    /// # Arguments
    ///
    /// * `label` - Name used in log lines (the job id)
    /// * `driver` - Backend that launches sessions
    /// * `protocol` - Activates capabilities on new contexts
    /// * `identity` - Applied to every new context
    /// * `browser` - Timeout and viewport used to normalize contexts
    /// * `acquire_poll` - Poll interval while the pool is saturated
    /// * `launch_policy` - Retry policy for each session launch
    pub fn new(
        label: impl Into<String>,
        driver: Arc<dyn Driver>,
        protocol: Arc<ProtocolHealthManager>,
        identity: Arc<dyn IdentityConfigurator>,
        browser: BrowserConfig,
        acquire_poll: Duration,
        launch_policy: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                label: label.into(),
                driver,
                protocol,
                identity,
                browser,
                acquire_poll,
                launch_policy,
                slots: Mutex::new(Vec::new()),
                contexts: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Launches up to `size` sessions
    ///
    /// Individual launch failures are tolerated; the pool is usable as long
    /// as at least one session started.
    ///
    /// # Returns
    ///
    /// * `Ok(usize)` - Number of sessions started
    /// * `Err(PoolError::Exhausted)` - Not a single session started
    pub async fn init_pool(&self, size: usize) -> PoolResult<usize> {
        let mut slots = Vec::with_capacity(size);
        let mut last_error = None;

        for index in 0..size {
            match self.inner.launch().await {
                Ok(session) => slots.push(Slot {
                    session: Some(session),
                    in_use: false,
                }),
                Err(e) => {
                    tracing::warn!(
                        "{}: session {} of {} failed to start: {}",
                        self.inner.label,
                        index + 1,
                        size,
                        e
                    );
                    last_error = Some(e.to_string());
                }
            }
        }

        if slots.is_empty() {
            return Err(PoolError::Exhausted {
                attempted: size,
                last_error: last_error.unwrap_or_else(|| "pool size is 0".to_string()),
            });
        }

        let started = slots.len();
        *lock(&self.inner.slots) = slots;
        tracing::info!(
            "{}: resource pool ready with {}/{} sessions",
            self.inner.label,
            started,
            size
        );
        Ok(started)
    }

    /// Number of slots in the pool
    pub fn size(&self) -> usize {
        lock(&self.inner.slots).len()
    }

    /// Number of slots currently borrowed
    pub fn in_use(&self) -> usize {
        lock(&self.inner.slots).iter().filter(|s| s.in_use).count()
    }

    /// Number of slots holding a session
    pub fn live_sessions(&self) -> usize {
        lock(&self.inner.slots)
            .iter()
            .filter(|s| s.session.is_some())
            .count()
    }

    /// Number of contexts currently open
    pub fn open_contexts(&self) -> usize {
        lock(&self.inner.contexts).len()
    }

    /// Borrows a free session, waiting while every slot is busy
    ///
    /// A free slot whose session died or was destroyed is relaunched.
    pub async fn acquire(&self) -> PoolResult<ResourceHandle> {
        loop {
            let claim = {
                let mut slots = lock(&self.inner.slots);
                if slots.is_empty() {
                    return Err(PoolError::NotInitialized);
                }

                let ready = slots.iter().position(|s| {
                    !s.in_use && s.session.as_ref().is_some_and(|s| s.is_connected())
                });
                match ready {
                    Some(index) => {
                        slots[index].in_use = true;
                        match slots[index].session.clone() {
                            Some(session) => Claim::Ready(index, session),
                            None => Claim::Relaunch(index, None),
                        }
                    }
                    None => match slots.iter().position(|s| !s.in_use) {
                        Some(index) => {
                            slots[index].in_use = true;
                            Claim::Relaunch(index, slots[index].session.take())
                        }
                        None => Claim::Busy,
                    },
                }
            };

            match claim {
                Claim::Ready(index, session) => return Ok(self.handle(index, session)),
                Claim::Relaunch(index, stale) => {
                    if let Some(stale) = stale {
                        let contexts = self.inner.take_contexts(index);
                        self.inner.close_contexts(contexts).await;
                        self.inner.close_session(stale).await;
                    }
                    tracing::info!("{}: relaunching session in slot {}", self.inner.label, index);
                    match self.inner.launch().await {
                        Ok(session) => {
                            if let Some(slot) = lock(&self.inner.slots).get_mut(index) {
                                slot.session = Some(session.clone());
                            }
                            return Ok(self.handle(index, session));
                        }
                        Err(e) => {
                            if let Some(slot) = lock(&self.inner.slots).get_mut(index) {
                                slot.in_use = false;
                            }
                            return Err(e.into());
                        }
                    }
                }
                Claim::Busy => tokio::time::sleep(self.inner.acquire_poll).await,
            }
        }
    }

    fn handle(&self, id: usize, session: Arc<dyn Session>) -> ResourceHandle {
        ResourceHandle {
            id,
            session,
            pool: Arc::downgrade(&self.inner),
            released: false,
        }
    }

    /// Returns a borrowed session to the pool
    pub fn release(&self, mut handle: ResourceHandle) {
        handle.released = true;
        if let Some(slot) = lock(&self.inner.slots).get_mut(handle.id) {
            slot.in_use = false;
        }
    }

    /// Closes a borrowed session and leaves its slot empty
    ///
    /// The next `acquire` that picks the slot launches a replacement.
    pub async fn destroy(&self, mut handle: ResourceHandle) {
        handle.released = true;
        let contexts = self.inner.take_contexts(handle.id);
        self.inner.close_contexts(contexts).await;

        let session = {
            let mut slots = lock(&self.inner.slots);
            match slots.get_mut(handle.id) {
                Some(slot) => {
                    slot.in_use = false;
                    slot.session.take()
                }
                None => None,
            }
        };
        if let Some(session) = session {
            self.inner.close_session(session).await;
        }
        tracing::info!("{}: resource {} destroyed", self.inner.label, handle.id);
    }

    /// Replaces the session behind a borrowed handle with a fresh one
    ///
    /// Contexts opened on the old session are closed.
    pub async fn restart(&self, handle: &mut ResourceHandle) -> PoolResult<()> {
        let contexts = self.inner.take_contexts(handle.id);
        self.inner.close_contexts(contexts).await;
        self.inner.close_session(handle.session.clone()).await;

        let session = self.inner.launch().await?;
        if let Some(slot) = lock(&self.inner.slots).get_mut(handle.id) {
            slot.session = Some(session.clone());
        }
        handle.session = session;
        tracing::info!("{}: resource {} restarted", self.inner.label, handle.id);
        Ok(())
    }

    /// Opens a fresh context on a borrowed session and normalizes it
    ///
    /// Timeout, viewport, identity, request blocking and protocol
    /// capabilities are applied in turn. A failing step is logged and marks the context degraded; the
    /// context is still returned.
    pub async fn create_context(&self, handle: &ResourceHandle) -> PoolResult<PreparedContext> {
        let context = handle.session.new_context().await?;
        let mut degraded = false;
        let browser = &self.inner.browser;

        if let Err(e) = context
            .set_default_timeout(Duration::from_millis(browser.default_timeout_ms))
            .await
        {
            tracing::warn!("{}: default timeout not applied on {}: {}", self.inner.label, context.id(), e);
            degraded = true;
        }

        if let Err(e) = context
            .set_viewport(browser.viewport_width, browser.viewport_height)
            .await
        {
            tracing::warn!("{}: viewport not applied on {}: {}", self.inner.label, context.id(), e);
            degraded = true;
        }

        if let Err(e) = self.inner.identity.apply(context.as_ref()).await {
            tracing::warn!("{}: identity not applied on {}: {}", self.inner.label, context.id(), e);
            degraded = true;
        }

        if !browser.block_resources.is_empty() {
            if let Err(e) = context.block_resources(&browser.block_resources).await {
                tracing::warn!(
                    "{}: request blocking not applied on {}: {}",
                    self.inner.label,
                    context.id(),
                    e
                );
                degraded = true;
            }
        }

        let protocol = self.inner.protocol.enable_all(context.as_ref()).await;
        if !protocol.failed().is_empty() {
            degraded = true;
        }

        lock(&self.inner.contexts).insert(context.id().to_string(), (handle.id, context.clone()));
        Ok(PreparedContext { context, degraded })
    }

    /// Closes one context, ignoring close errors
    pub async fn close_context(&self, context: &Arc<dyn Context>) {
        lock(&self.inner.contexts).remove(context.id());
        self.inner.close_contexts(vec![context.clone()]).await;
    }

    /// Brings a context back into a usable state
    ///
    /// A dead context is closed and replaced by a new one on the same
    /// session; a live one gets a protocol reconnect.
    pub async fn recover(
        &self,
        context: Arc<dyn Context>,
        handle: &ResourceHandle,
    ) -> PoolResult<Arc<dyn Context>> {
        if context.is_alive().await {
            if !self.inner.protocol.reconnect(context.as_ref()).await {
                tracing::warn!(
                    "{}: context {} still missing critical capabilities after reconnect",
                    self.inner.label,
                    context.id()
                );
            }
            Ok(context)
        } else {
            tracing::info!("{}: context {} is dead, replacing it", self.inner.label, context.id());
            self.close_context(&context).await;
            Ok(self.create_context(handle).await?.context)
        }
    }

    /// Closes every context and session; never fails
    pub async fn cleanup_all(&self) {
        let contexts: Vec<Arc<dyn Context>> = lock(&self.inner.contexts)
            .drain()
            .map(|(_, (_, context))| context)
            .collect();
        self.inner.close_contexts(contexts).await;

        let sessions: Vec<Arc<dyn Session>> = lock(&self.inner.slots)
            .iter_mut()
            .filter_map(|slot| slot.session.take())
            .collect();
        let closed = sessions.len();
        for session in sessions {
            self.inner.close_session(session).await;
        }
        tracing::debug!("{}: pool cleaned up ({} sessions closed)", self.inner.label, closed);
    }

    /// The protocol manager contexts from this pool are registered with
    pub fn protocol(&self) -> &Arc<ProtocolHealthManager> {
        &self.inner.protocol
    }
}
