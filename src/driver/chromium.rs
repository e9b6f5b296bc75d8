//! Chromium backend over the DevTools protocol

use crate::config::BrowserConfig;
use crate::driver::{Context, Driver, DriverError, DriverResult, ResourceKind, Session};
use crate::state::Capability;
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::fetch::{
    self, EventRequestPaused, FailRequestParams, RequestPattern, RequestStage,
};
use chromiumoxide::cdp::browser_protocol::{dom, emulation, network, page as page_domain};
use chromiumoxide::cdp::js_protocol::runtime;
use chromiumoxide::{Browser, BrowserConfig as LaunchConfig, Page};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

/// Launches headless (or headed) Chromium processes
pub struct ChromiumDriver {
    config: BrowserConfig,
    launched: AtomicUsize,
}

impl ChromiumDriver {
    pub fn new(config: BrowserConfig) -> Self {
        Self {
            config,
            launched: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Driver for ChromiumDriver {
    async fn launch(&self) -> DriverResult<Arc<dyn Session>> {
        let number = self.launched.fetch_add(1, Ordering::SeqCst);

        // Concurrent browsers must not share a profile directory
        let profile = TempDir::new().map_err(|e| DriverError::Launch(e.to_string()))?;

        let mut builder = LaunchConfig::builder()
            .user_data_dir(profile.path())
            .args(self.config.args.clone());
        if !self.config.headless {
            builder = builder.with_head();
        }
        if let Some(executable) = &self.config.executable {
            builder = builder.chrome_executable(executable);
        }
        let launch_config = builder.build().map_err(DriverError::Launch)?;

        let (browser, mut handler) = Browser::launch(launch_config)
            .await
            .map_err(|e| DriverError::Launch(e.to_string()))?;

        let connected = Arc::new(AtomicBool::new(true));
        let flag = connected.clone();
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
            flag.store(false, Ordering::SeqCst);
        });

        let id = format!("chromium-{}", number);
        tracing::debug!("Launched browser session {}", id);

        Ok(Arc::new(ChromiumSession {
            id,
            browser: tokio::sync::Mutex::new(browser),
            handler: handler_task,
            connected,
            contexts: AtomicUsize::new(0),
            default_timeout_ms: self.config.default_timeout_ms,
            _profile: profile,
        }))
    }
}

struct ChromiumSession {
    id: String,
    browser: tokio::sync::Mutex<Browser>,
    handler: JoinHandle<()>,
    connected: Arc<AtomicBool>,
    contexts: AtomicUsize,
    default_timeout_ms: u64,
    _profile: TempDir,
}

#[async_trait]
impl Session for ChromiumSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.handler.is_finished()
    }

    async fn new_context(&self) -> DriverResult<Arc<dyn Context>> {
        if !self.is_connected() {
            return Err(DriverError::Closed);
        }

        let page = self
            .browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .map_err(|e| DriverError::Protocol(e.to_string()))?;

        let number = self.contexts.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ChromiumContext {
            id: format!("{}/page-{}", self.id, number),
            page,
            timeout_ms: AtomicU64::new(self.default_timeout_ms),
            interception: Mutex::new(None),
        }))
    }

    async fn close(&self) -> DriverResult<()> {
        let mut browser = self.browser.lock().await;
        let result = browser
            .close()
            .await
            .map(|_| ())
            .map_err(|e| DriverError::Protocol(e.to_string()));
        if let Err(e) = browser.wait().await {
            tracing::debug!("Waiting for browser {} to exit failed: {}", self.id, e);
        }
        self.handler.abort();
        self.connected.store(false, Ordering::SeqCst);
        result
    }
}

struct ChromiumContext {
    id: String,
    page: Page,
    timeout_ms: AtomicU64,

    /// Fails paused requests while resource blocking is on
    interception: Mutex<Option<JoinHandle<()>>>,
}

impl ChromiumContext {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::SeqCst))
    }

    fn replace_interception(&self, task: Option<JoinHandle<()>>) {
        let previous = std::mem::replace(
            &mut *self
                .interception
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
            task,
        );
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

fn resource_type(kind: ResourceKind) -> network::ResourceType {
    match kind {
        ResourceKind::Image => network::ResourceType::Image,
        ResourceKind::Stylesheet => network::ResourceType::Stylesheet,
        ResourceKind::Font => network::ResourceType::Font,
        ResourceKind::Media => network::ResourceType::Media,
    }
}

fn protocol_error(e: chromiumoxide::error::CdpError) -> DriverError {
    DriverError::Protocol(e.to_string())
}

#[async_trait]
impl Context for ChromiumContext {
    fn id(&self) -> &str {
        &self.id
    }

    async fn set_default_timeout(&self, timeout: Duration) -> DriverResult<()> {
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::SeqCst);
        Ok(())
    }

    async fn set_viewport(&self, width: u32, height: u32) -> DriverResult<()> {
        let params =
            emulation::SetDeviceMetricsOverrideParams::new(width as i64, height as i64, 1.0, false);
        self.page.execute(params).await.map_err(protocol_error)?;
        Ok(())
    }

    async fn set_user_agent(&self, user_agent: &str) -> DriverResult<()> {
        let params = network::SetUserAgentOverrideParams::new(user_agent.to_string());
        self.page.execute(params).await.map_err(protocol_error)?;
        Ok(())
    }

    async fn block_resources(&self, kinds: &[ResourceKind]) -> DriverResult<()> {
        // Listen before enabling so no paused request is missed
        let mut paused = self
            .page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(protocol_error)?;
        let page = self.page.clone();
        let context_id = self.id.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let fail = FailRequestParams::new(
                    event.request_id.clone(),
                    network::ErrorReason::BlockedByClient,
                );
                if let Err(e) = page.execute(fail).await {
                    tracing::debug!(
                        "{}: could not block {}: {}",
                        context_id,
                        event.request.url,
                        e
                    );
                }
            }
        });

        let patterns = kinds
            .iter()
            .map(|kind| RequestPattern {
                url_pattern: None,
                resource_type: Some(resource_type(*kind)),
                request_stage: Some(RequestStage::Request),
            })
            .collect();
        let enable = fetch::EnableParams {
            patterns: Some(patterns),
            handle_auth_requests: None,
        };
        if let Err(e) = self.page.execute(enable).await {
            task.abort();
            return Err(DriverError::Protocol(format!("Fetch.enable: {}", e)));
        }

        self.replace_interception(Some(task));
        Ok(())
    }

    async fn enable(&self, capability: Capability) -> DriverResult<()> {
        let result = match capability {
            Capability::Network => self
                .page
                .execute(network::EnableParams::default())
                .await
                .map(|_| ()),
            Capability::Page => self
                .page
                .execute(page_domain::EnableParams::default())
                .await
                .map(|_| ()),
            Capability::Runtime => self
                .page
                .execute(runtime::EnableParams::default())
                .await
                .map(|_| ()),
            Capability::Dom => self
                .page
                .execute(dom::EnableParams::default())
                .await
                .map(|_| ()),
        };
        result.map_err(|e| DriverError::Protocol(format!("{}.enable: {}", capability, e)))
    }

    async fn navigate(&self, url: &str) -> DriverResult<()> {
        let budget = self.timeout();
        match tokio::time::timeout(budget, self.page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(DriverError::Navigation {
                url: url.to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(DriverError::Timeout(budget)),
        }
    }

    async fn evaluate(&self, script: &str) -> DriverResult<serde_json::Value> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| DriverError::Script(e.to_string()))?;
        result
            .into_value::<serde_json::Value>()
            .map_err(|e| DriverError::Script(e.to_string()))
    }

    async fn ready_state(&self) -> DriverResult<String> {
        let result = self
            .page
            .evaluate("document.readyState")
            .await
            .map_err(|e| DriverError::Script(e.to_string()))?;
        result
            .into_value::<String>()
            .map_err(|e| DriverError::Script(e.to_string()))
    }

    async fn reload(&self) -> DriverResult<()> {
        let budget = self.timeout();
        match tokio::time::timeout(budget, self.page.reload()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(protocol_error(e)),
            Err(_) => Err(DriverError::Timeout(budget)),
        }
    }

    async fn clear_cache(&self) -> DriverResult<()> {
        self.page
            .execute(network::ClearBrowserCacheParams::default())
            .await
            .map_err(protocol_error)?;
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        matches!(
            tokio::time::timeout(Duration::from_secs(2), self.page.evaluate("1")).await,
            Ok(Ok(_))
        )
    }

    async fn close(&self) -> DriverResult<()> {
        self.replace_interception(None);
        self.page.clone().close().await.map_err(protocol_error)
    }
}
