use crate::config::SiteConfig;
use crate::driver::Context;
use crate::scrape::{Discovery, ScrapeError, ScrapeResult, Scraper, TaskEnv, TaskResult, TaskSeed};
use crate::state::{BrandJob, CarTask, ResultSummary};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;

const READY_POLLS: u32 = 40;
const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Scraper driven entirely by `[site]` configuration
///
/// Discovery opens `discovery-url` once per source id and evaluates
/// `discovery-script`, which must return either an array of
/// `{id, name}` objects or `{tasks: [...], brand: {...}}`. A task opens
/// `task-url` and evaluates `extract-script`; the configurations are read
/// at `items-pointer` and images are counted over `image-fields`.
pub struct ScriptScraper {
    site: SiteConfig,
}

impl ScriptScraper {
    pub fn new(site: SiteConfig) -> Self {
        Self { site }
    }

    async fn open(&self, context: &dyn Context, url: &str) -> ScrapeResult<()> {
        context.navigate(url).await?;
        wait_until_ready(context).await?;
        if self.site.settle_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.site.settle_ms)).await;
        }
        Ok(())
    }
}

async fn wait_until_ready(context: &dyn Context) -> ScrapeResult<()> {
    let mut state = String::new();
    for _ in 0..READY_POLLS {
        state = context.ready_state().await?;
        if state == "complete" {
            return Ok(());
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
    Err(ScrapeError::NotReady(state))
}

fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Reads task seeds out of a discovery script result
fn parse_seeds(value: &Value) -> Vec<TaskSeed> {
    let items = value
        .as_array()
        .or_else(|| value.get("tasks").and_then(Value::as_array));
    let Some(items) = items else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let id = item.get("id").and_then(value_to_id)?;
            let name = item
                .get("name")
                .or_else(|| item.get("displayName"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| id.clone());
            Some(TaskSeed::new(id, name))
        })
        .collect()
}

/// Counts configurations and images in an extraction result
fn summarize(value: &Value, pointer: &str, image_fields: &[String]) -> ScrapeResult<ResultSummary> {
    let items = value
        .pointer(pointer)
        .and_then(Value::as_array)
        .ok_or_else(|| ScrapeError::Extraction(format!("no configuration list at {}", pointer)))?;

    let image_count = items
        .iter()
        .flat_map(|item| image_fields.iter().filter_map(move |field| item.get(field)))
        .filter_map(Value::as_array)
        .map(Vec::len)
        .sum::<usize>();

    Ok(ResultSummary {
        item_count: items.len() as u32,
        image_count: image_count as u32,
    })
}

#[async_trait]
impl Scraper for ScriptScraper {
    async fn discover(&self, job: &BrandJob, env: &TaskEnv<'_>) -> ScrapeResult<Discovery> {
        let mut discovery = Discovery::default();
        let mut seen = HashSet::new();

        for source_id in &job.source_ids {
            let url = self.site.discovery_url.replace("{source_id}", source_id);
            tracing::debug!("{}: discovering tasks at {}", job.id, url);
            self.open(env.context, &url).await?;

            let value = env.context.evaluate(&self.site.discovery_script).await?;
            if discovery.auxiliary.is_null() {
                if let Some(brand) = value.get("brand") {
                    discovery.auxiliary = brand.clone();
                }
            }

            let seeds = parse_seeds(&value);
            tracing::debug!("{}: source {} listed {} tasks", job.id, source_id, seeds.len());
            for seed in seeds {
                if seen.insert(seed.id.clone()) {
                    discovery.seeds.push(seed);
                }
            }
        }

        Ok(discovery)
    }

    async fn scrape(&self, task: &CarTask, env: &TaskEnv<'_>) -> ScrapeResult<TaskResult> {
        let url = self.site.task_url.replace("{task_id}", &task.id);
        self.open(env.context, &url).await?;

        let data = env.context.evaluate(&self.site.extract_script).await?;
        if data.is_null() {
            return Err(ScrapeError::Extraction(format!(
                "extract script returned nothing for task {}",
                task.id
            )));
        }
        let summary = summarize(&data, &self.site.items_pointer, &self.site.image_fields)?;

        Ok(TaskResult { data, summary })
    }
}
