//! Named per-job hooks
//!
//! A `[[brand]]` entry lists hook names; the registry turns them into a
//! chain that runs after discovery and after each scraped task.

use crate::scrape::{TaskResult, TaskSeed};
use crate::state::BrandJob;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What a hook sees of the job it runs for
pub struct HookScope<'a> {
    pub job: &'a BrandJob,

    /// Alternative brand spellings from the catalog entry
    pub aliases: &'a [String],
}

/// Adjusts discovery output and task results for one job
pub trait JobHook: Send + Sync {
    fn name(&self) -> &str;

    /// Runs once after discovery, before tracking starts
    fn on_discovered(&self, _scope: &HookScope<'_>, _seeds: &mut Vec<TaskSeed>) {}

    /// Runs on every scraped result; an error fails the attempt
    fn on_task_result(
        &self,
        _scope: &HookScope<'_>,
        _result: &mut TaskResult,
    ) -> Result<(), String> {
        Ok(())
    }
}

/// Removes the brand name (or an alias) from the front of display names
///
/// "BYD Seal" under job "BYD" becomes "Seal". A name that is nothing but
/// the prefix is left alone.
pub struct StripBrandPrefix;

impl JobHook for StripBrandPrefix {
    fn name(&self) -> &str {
        "strip-brand-prefix"
    }

    fn on_discovered(&self, scope: &HookScope<'_>, seeds: &mut Vec<TaskSeed>) {
        let prefixes: Vec<&str> = std::iter::once(scope.job.id.as_str())
            .chain(scope.aliases.iter().map(String::as_str))
            .collect();

        for seed in seeds.iter_mut() {
            for prefix in &prefixes {
                let Some(rest) = seed.display_name.strip_prefix(prefix) else {
                    continue;
                };
                let rest = rest.trim_start_matches([' ', '-', '·']);
                if !rest.is_empty() {
                    seed.display_name = rest.to_string();
                    break;
                }
            }
        }
    }
}

/// Rejects results without a single configuration
pub struct RequireItems;

impl JobHook for RequireItems {
    fn name(&self) -> &str {
        "require-items"
    }

    fn on_task_result(
        &self,
        _scope: &HookScope<'_>,
        result: &mut TaskResult,
    ) -> Result<(), String> {
        if result.summary.item_count == 0 {
            return Err("no configurations found".to_string());
        }
        Ok(())
    }
}

/// Name to hook mapping
#[derive(Clone)]
pub struct HookRegistry {
    hooks: BTreeMap<String, Arc<dyn JobHook>>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl HookRegistry {
    pub fn empty() -> Self {
        Self {
            hooks: BTreeMap::new(),
        }
    }

    /// Registry holding `strip-brand-prefix` and `require-items`
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(StripBrandPrefix));
        registry.register(Arc::new(RequireItems));
        registry
    }

    /// Adds a hook, replacing any hook registered under the same name
    pub fn register(&mut self, hook: Arc<dyn JobHook>) {
        self.hooks.insert(hook.name().to_string(), hook);
    }

    pub fn names(&self) -> Vec<&str> {
        self.hooks.keys().map(String::as_str).collect()
    }

    /// Resolves hook names for a job; unknown names are logged and skipped
    pub fn chain(&self, job_id: &str, names: &[String]) -> HookChain {
        let hooks = names
            .iter()
            .filter_map(|name| match self.hooks.get(name) {
                Some(hook) => Some(hook.clone()),
                None => {
                    tracing::warn!(job = %job_id, "Unknown hook '{}' ignored", name);
                    None
                }
            })
            .collect();
        HookChain { hooks }
    }
}

/// Hooks resolved for one job, applied in configured order
#[derive(Clone, Default)]
pub struct HookChain {
    hooks: Vec<Arc<dyn JobHook>>,
}

impl HookChain {
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn on_discovered(&self, scope: &HookScope<'_>, seeds: &mut Vec<TaskSeed>) {
        for hook in &self.hooks {
            hook.on_discovered(scope, seeds);
        }
    }

    /// Stops at the first hook that rejects the result
    pub fn on_task_result(
        &self,
        scope: &HookScope<'_>,
        result: &mut TaskResult,
    ) -> Result<(), String> {
        for hook in &self.hooks {
            hook.on_task_result(scope, result)
                .map_err(|e| format!("{}: {}", hook.name(), e))?;
        }
        Ok(())
    }
}
