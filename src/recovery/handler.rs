use crate::config::{RecoveryConfig, RecoveryWaits};
use crate::driver::Context;
use crate::pool::{ResourceHandle, ResourcePool, TaskLimiter};
use crate::recovery::{classify, ErrorClass, ErrorKind, RecoveryAction};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a recovery plan may act on
pub struct RecoveryTarget<'a> {
    /// Key the error counters are kept under (the job id)
    pub job_key: &'a str,
    pub pool: &'a ResourcePool,
    pub handle: &'a mut ResourceHandle,

    /// Replaced in place when an action recreates the context
    pub context: &'a mut Arc<dyn Context>,
    pub limiter: &'a TaskLimiter,
}

/// Result of handling one error
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryOutcome {
    pub class: ErrorClass,

    /// The task should not be retried
    pub should_skip: bool,

    /// A health probe passed after one of the actions
    pub recovered: bool,
    pub actions_tried: Vec<RecoveryAction>,

    /// Errors of this kind seen for the job so far
    pub error_count: u32,
}

/// Error totals kept by the recovery executor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStatistics {
    pub total: u32,
    pub by_kind: BTreeMap<ErrorKind, u32>,
    pub by_job: BTreeMap<String, u32>,
}

fn wait_for(waits: &RecoveryWaits, kind: ErrorKind) -> Duration {
    let ms = match kind {
        ErrorKind::Timeout => waits.timeout,
        ErrorKind::Connection => waits.connection,
        ErrorKind::Protocol => waits.protocol,
        ErrorKind::Crash => waits.crash,
        ErrorKind::ResourceLoad => waits.resource_load,
        ErrorKind::OutOfMemory => waits.out_of_memory,
        ErrorKind::Unknown | ErrorKind::FatalHost => waits.unknown,
    };
    Duration::from_millis(ms)
}

/// Classifies task errors and runs recovery plans
pub struct ErrorRecovery {
    config: RecoveryConfig,
    counts: Mutex<HashMap<(ErrorKind, String), u32>>,
}

impl ErrorRecovery {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            counts: Mutex::new(HashMap::new()),
        }
    }

    fn counts(&self) -> std::sync::MutexGuard<'_, HashMap<(ErrorKind, String), u32>> {
        self.counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Handles one task error
    ///
    /// The (kind, job) counter is bumped first. Past `max-error-count`, or
    /// for an unrecoverable kind, the outcome says skip and nothing is
    /// attempted. Otherwise the kind's plan runs until a health probe
    /// passes; a failing action is logged and the next one tried.
    pub async fn handle(&self, message: &str, target: &mut RecoveryTarget<'_>) -> RecoveryOutcome {
        let class = classify(message);
        let error_count = {
            let mut counts = self.counts();
            let count = counts
                .entry((class.kind, target.job_key.to_string()))
                .or_insert(0);
            *count += 1;
            *count
        };

        let mut outcome = RecoveryOutcome {
            class,
            should_skip: false,
            recovered: false,
            actions_tried: Vec::new(),
            error_count,
        };

        if !class.recoverable {
            tracing::error!(
                job = %target.job_key,
                "Unrecoverable {} error: {}",
                class.kind,
                message
            );
            outcome.should_skip = true;
            return outcome;
        }

        if error_count > self.config.max_error_count {
            tracing::warn!(
                job = %target.job_key,
                "{} errors exceeded the limit ({} > {}), skipping",
                class.kind,
                error_count,
                self.config.max_error_count
            );
            outcome.should_skip = true;
            return outcome;
        }

        tracing::info!(
            job = %target.job_key,
            "Recovering from {} error ({:?} severity): {}",
            class.kind,
            class.severity,
            message
        );

        for action in class.kind.plan() {
            outcome.actions_tried.push(*action);
            if let Err(e) = self.apply(*action, class.kind, target).await {
                tracing::warn!(job = %target.job_key, "Recovery action {} failed: {}", action, e);
                continue;
            }
            if self.probe(target.context.as_ref()).await {
                tracing::info!(job = %target.job_key, "Recovered after {}", action);
                outcome.recovered = true;
                break;
            }
        }

        if !outcome.recovered {
            tracing::warn!(
                job = %target.job_key,
                "Recovery plan for {} error exhausted without a healthy context",
                class.kind
            );
        }
        outcome
    }

    async fn apply(
        &self,
        action: RecoveryAction,
        kind: ErrorKind,
        target: &mut RecoveryTarget<'_>,
    ) -> Result<(), String> {
        match action {
            RecoveryAction::Wait => {
                tokio::time::sleep(wait_for(&self.config.waits, kind)).await;
                Ok(())
            }
            RecoveryAction::RefreshContext => {
                target.context.reload().await.map_err(|e| e.to_string())
            }
            RecoveryAction::RecreateContext => {
                target.pool.close_context(target.context).await;
                let prepared = target
                    .pool
                    .create_context(target.handle)
                    .await
                    .map_err(|e| e.to_string())?;
                *target.context = prepared.context;
                Ok(())
            }
            RecoveryAction::ReconnectProtocol => {
                if target.pool.protocol().reconnect(target.context.as_ref()).await {
                    Ok(())
                } else {
                    Err("critical capabilities still failing".to_string())
                }
            }
            RecoveryAction::RestartResource => {
                target
                    .pool
                    .restart(target.handle)
                    .await
                    .map_err(|e| e.to_string())?;
                let prepared = target
                    .pool
                    .create_context(target.handle)
                    .await
                    .map_err(|e| e.to_string())?;
                *target.context = prepared.context;
                Ok(())
            }
            RecoveryAction::ClearCache => {
                target.context.clear_cache().await.map_err(|e| e.to_string())
            }
            RecoveryAction::ReduceConcurrency => {
                target.limiter.reduce();
                Ok(())
            }
        }
    }

    /// Alive and `document.readyState == "complete"` within the probe budget
    async fn probe(&self, context: &dyn Context) -> bool {
        let budget = Duration::from_millis(self.config.probe_timeout_ms);
        let check = async {
            context.is_alive().await
                && matches!(context.ready_state().await.as_deref(), Ok("complete"))
        };
        tokio::time::timeout(budget, check).await.unwrap_or(false)
    }

    /// Errors of `kind` recorded for `job_key`
    pub fn error_count(&self, kind: ErrorKind, job_key: &str) -> u32 {
        self.counts()
            .get(&(kind, job_key.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Totals by kind and by job
    pub fn statistics(&self) -> RecoveryStatistics {
        let mut stats = RecoveryStatistics::default();
        for ((kind, job), count) in self.counts().iter() {
            stats.total += count;
            *stats.by_kind.entry(*kind).or_insert(0) += count;
            *stats.by_job.entry(job.clone()).or_insert(0) += count;
        }
        stats
    }

    /// Clears every counter of one job
    pub fn reset(&self, job_key: &str) {
        self.counts().retain(|(_, job), _| job != job_key);
    }
}
