//! Graceful shutdown coordination
//!
//! Subsystems register cleanup callbacks under a phase. When shutdown is
//! triggered (signal or explicit call) the admission token is cancelled and
//! the callbacks run in phase order: stop admission, flush checkpoints,
//! release resources. Within a phase, callbacks run in registration order.

use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Cleanup phases, run in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShutdownPhase {
    StopAdmission,
    FlushCheckpoints,
    ReleaseResources,
}

type Callback = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Registered {
    phase: ShutdownPhase,
    name: String,
    callback: Callback,
}

struct Inner {
    token: CancellationToken,
    finished: CancellationToken,
    started: AtomicBool,
    next_id: AtomicU64,
    callbacks: Mutex<BTreeMap<u64, Registered>>,
}

/// Single owner of process shutdown ordering
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                finished: CancellationToken::new(),
                started: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                callbacks: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Token cancelled as soon as shutdown begins; used to stop admission
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Registers a cleanup callback
    ///
    /// The callback stays registered until the returned guard is dropped.
    pub fn register<F, Fut>(&self, phase: ShutdownPhase, name: impl Into<String>, f: F) -> CallbackGuard
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let registered = Registered {
            phase,
            name: name.into(),
            callback: Box::new(move || Box::pin(f())),
        };
        lock(&self.inner.callbacks).insert(id, registered);

        CallbackGuard {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Number of callbacks currently registered
    pub fn registered(&self) -> usize {
        lock(&self.inner.callbacks).len()
    }

    /// Triggers shutdown and runs every registered callback in phase order
    ///
    /// Safe to call more than once; later callers wait for the first run to
    /// finish.
    pub async fn shutdown(&self) {
        self.inner.token.cancel();

        if self.inner.started.swap(true, Ordering::SeqCst) {
            self.inner.finished.cancelled().await;
            return;
        }

        let mut pending: Vec<(ShutdownPhase, u64, String, BoxFuture<'static, ()>)> = {
            let callbacks = lock(&self.inner.callbacks);
            callbacks
                .iter()
                .map(|(id, r)| (r.phase, *id, r.name.clone(), (r.callback)()))
                .collect()
        };
        pending.sort_by_key(|(phase, id, _, _)| (*phase, *id));

        tracing::info!("Shutting down: {} cleanup callbacks", pending.len());
        for (phase, _, name, fut) in pending {
            tracing::debug!("Shutdown {:?}: {}", phase, name);
            fut.await;
        }

        self.inner.finished.cancel();
        tracing::info!("Shutdown complete");
    }

    /// Waits until a shutdown run has finished all callbacks
    pub async fn wait_finished(&self) {
        self.inner.finished.cancelled().await;
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.is_cancelled()
    }

    /// Spawns a task that triggers shutdown on ctrl-c or SIGTERM
    pub fn listen_for_signals(&self) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let token = coordinator.token();
            tokio::select! {
                _ = shutdown_signal() => {
                    tracing::warn!("Interrupt received, shutting down gracefully");
                    coordinator.shutdown().await;
                }
                _ = token.cancelled() => {}
            }
        })
    }
}

/// Keeps a cleanup callback registered; unregisters it on drop
pub struct CallbackGuard {
    inner: std::sync::Weak<Inner>,
    id: u64,
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            lock(&inner.callbacks).remove(&self.id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resolves when the process receives ctrl-c or (on unix) SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}
