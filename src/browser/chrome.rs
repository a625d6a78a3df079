// spider_chrome re-exports chromiumoxide API
use crate::browser::page::{FrameId, FrameNode, PageCookie, PageHandle};
use crate::error::{FlowError, Result};
use crate::flow::matchers::IDENTITY_STRING;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::{
    self as cdp_page, CreateIsolatedWorldParams, EventLoadEventFired, GetFrameTreeParams,
    NavigateParams,
};
use chromiumoxide::cdp::js_protocol::runtime::{EvaluateParams, ExecutionContextId};
use chromiumoxide::page::Page;
use chromiumoxide_fetcher::{BrowserFetcher, BrowserFetcherOptions};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long a plain navigation may take before it is reported as failed.
const NAVIGATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Sampling cadence and quiet window for the network-idle heuristic.
const IDLE_SAMPLE_INTERVAL: Duration = Duration::from_millis(250);
const IDLE_QUIET_WINDOW: Duration = Duration::from_millis(500);

/// One Chrome process, owned by a single login attempt.
pub struct ChromeDriver {
    browser: Browser,
    temp_dir: Option<PathBuf>,
}

/// Connection mode for Chrome browser
pub enum ConnectionMode {
    /// Launches Chrome using a system or downloaded installation
    Sandboxed {
        chrome_path: Option<String>,
        no_sandbox: bool,
        headless: bool,
    },
    /// Connects to existing Chrome on debug port
    DebugPort(u16),
}

impl ChromeDriver {
    /// Launch Chrome with auto-detection for CI environments
    pub async fn launch_auto() -> Result<Self> {
        let is_ci = std::env::var("CI").is_ok()
            || std::env::var("GITHUB_ACTIONS").is_ok()
            || std::env::var("GITLAB_CI").is_ok()
            || std::env::var("JENKINS_HOME").is_ok()
            || std::env::var("CIRCLECI").is_ok();

        Self::new(ConnectionMode::Sandboxed {
            chrome_path: None,
            no_sandbox: is_ci,
            headless: is_ci,
        })
        .await
    }

    /// Create new ChromeDriver with specified connection mode
    pub async fn new(mode: ConnectionMode) -> Result<Self> {
        let (browser, temp_dir) = match mode {
            ConnectionMode::Sandboxed {
                chrome_path,
                no_sandbox,
                headless,
            } => {
                // Unique user data directory so parallel attempts never
                // share profile data.
                let unique_id = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map_err(|e| FlowError::LaunchFailed(format!("clock error: {}", e)))?
                    .as_nanos();
                let temp_dir = std::env::temp_dir().join(format!("authrelay-{}", unique_id));
                std::fs::create_dir_all(&temp_dir).map_err(|e| {
                    FlowError::LaunchFailed(format!("Failed to create temp directory: {}", e))
                })?;

                let mut config = if headless {
                    BrowserConfig::builder()
                } else {
                    BrowserConfig::builder().with_head()
                };

                config = config
                    .user_data_dir(&temp_dir)
                    .arg(format!("--user-agent={}", IDENTITY_STRING));

                if no_sandbox {
                    config = config.arg("--no-sandbox");
                }

                if let Some(path) = chrome_path {
                    config = config.chrome_executable(path);
                } else {
                    match Self::ensure_chrome_installed().await {
                        Ok(path) => {
                            config = config.chrome_executable(path);
                        }
                        Err(e) => {
                            log::warn!(
                                "Chrome auto-download failed ({}), trying system Chrome",
                                e
                            );
                        }
                    }
                }

                let built = config
                    .build()
                    .map_err(|e| FlowError::LaunchFailed(launch_hint(&e)))?;
                let (browser, mut handler) = Browser::launch(built)
                    .await
                    .map_err(|e| FlowError::LaunchFailed(launch_hint(&e)))?;

                tokio::spawn(async move {
                    while (handler.next().await).is_some() {
                        // Drain browser events
                    }
                });

                (browser, Some(temp_dir))
            }
            ConnectionMode::DebugPort(port) => {
                let url = format!("http://localhost:{}", port);
                let (browser, mut handler) = Browser::connect(&url).await.map_err(|e| {
                    FlowError::ConnectionFailed(format!(
                        "Failed to connect to Chrome on port {}. \
                         Make sure Chrome is running with --remote-debugging-port={}: {}",
                        port, port, e
                    ))
                })?;

                tokio::spawn(async move {
                    while (handler.next().await).is_some() {
                        // Drain browser events
                    }
                });

                (browser, None)
            }
        };

        Ok(Self { browser, temp_dir })
    }

    /// Open a fresh blank page and hand the whole browser over to it. One
    /// page per attempt; the page owns the process from here on.
    pub async fn into_page(self) -> Result<ChromePage> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| FlowError::LaunchFailed(format!("Failed to create page: {}", e)))?;
        Ok(ChromePage {
            page,
            driver: tokio::sync::Mutex::new(Some(self)),
        })
    }

    /// Check if the browser is still alive and responsive
    pub async fn is_alive(&self) -> bool {
        match self.browser.pages().await {
            Ok(pages) => {
                if let Some(page) = pages.first() {
                    matches!(
                        tokio::time::timeout(Duration::from_secs(2), page.url()).await,
                        Ok(Ok(_))
                    )
                } else {
                    true
                }
            }
            Err(_) => false,
        }
    }

    /// Close the browser connection
    pub async fn close(mut self) -> Result<()> {
        self.browser
            .close()
            .await
            .map_err(|e| FlowError::Internal(e.to_string()))?;
        Ok(())
    }

    /// Ensure Chrome is installed, downloading if necessary
    async fn ensure_chrome_installed() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| FlowError::Internal("Cannot determine cache directory".to_string()))?
            .join("authrelay")
            .join("chrome");

        tokio::fs::create_dir_all(&cache_dir)
            .await
            .map_err(|e| FlowError::Internal(format!("Failed to create cache dir: {}", e)))?;

        let revision_info_path = cache_dir.join(".downloaded");
        if revision_info_path.exists() {
            if let Some(executable) = Self::find_chrome_in_cache(&cache_dir).await {
                return Ok(executable);
            }
        }

        log::info!("Downloading Chrome for Testing (first time only, ~150MB)...");
        let fetcher = BrowserFetcher::new(
            BrowserFetcherOptions::builder()
                .with_path(&cache_dir)
                .build()
                .map_err(|e| FlowError::Internal(format!("Fetcher config failed: {}", e)))?,
        );

        let info = fetcher
            .fetch()
            .await
            .map_err(|e| FlowError::Internal(format!("Chrome download failed: {}", e)))?;

        tokio::fs::write(&revision_info_path, "downloaded")
            .await
            .map_err(|e| FlowError::Internal(format!("Failed to write marker: {}", e)))?;

        log::info!("Chrome downloaded successfully");

        Ok(info.executable_path)
    }

    /// Find Chrome executable in cache directory
    async fn find_chrome_in_cache(cache_dir: &Path) -> Option<PathBuf> {
        let possible_paths = vec![
            cache_dir.join("chrome"),
            cache_dir.join("chrome.exe"),
            cache_dir.join("Google Chrome.app/Contents/MacOS/Google Chrome"),
            cache_dir.join("chrome-linux/chrome"),
            cache_dir.join("chrome-mac/Chromium.app/Contents/MacOS/Chromium"),
            cache_dir.join("chrome-win/chrome.exe"),
        ];

        possible_paths.into_iter().find(|path| path.exists())
    }
}

impl Drop for ChromeDriver {
    fn drop(&mut self) {
        // Clean up the per-attempt profile directory
        if let Some(temp_dir) = &self.temp_dir {
            if temp_dir.exists() {
                let _ = std::fs::remove_dir_all(temp_dir);
            }
        }
    }
}

fn launch_hint(cause: &impl std::fmt::Display) -> String {
    format!(
        "{}. \n\n\
         Chrome not found. You can:\n\
         - Install Chrome: https://www.google.com/chrome/\n\
         - Ubuntu/Debian: sudo apt install chromium-browser\n\
         - Fedora: sudo dnf install chromium\n\
         - macOS: brew install --cask google-chrome\n\
         - Or specify path: --chrome-path /path/to/chrome\n\
         - Linux sandbox issue? Try: --no-sandbox",
        cause
    )
}

/// [`PageHandle`] implementation over CDP. Owns its [`ChromeDriver`] (and
/// thereby the Chrome process) until `close`.
pub struct ChromePage {
    page: Page,
    driver: tokio::sync::Mutex<Option<ChromeDriver>>,
}

impl ChromePage {
    /// Root frame id of the current document.
    async fn root_frame_id(&self) -> Result<String> {
        let tree = self.page.execute(GetFrameTreeParams::default()).await?;
        Ok(tree.result.frame_tree.frame.id.inner().clone())
    }

    /// Resolve an execution context for a (possibly cross-origin) frame.
    /// The root document evaluates in the page's main context.
    async fn frame_context(&self, frame: &FrameId) -> Result<Option<ExecutionContextId>> {
        if self.root_frame_id().await? == frame.as_str() {
            return Ok(None);
        }
        let params = CreateIsolatedWorldParams::builder()
            .frame_id(cdp_page::FrameId::new(frame.as_str()))
            .build()
            .map_err(|e| FlowError::Internal(format!("bad isolated world params: {}", e)))?;
        let world = self.page.execute(params).await?;
        Ok(Some(world.result.execution_context_id))
    }

    /// Count of resources the page has fetched so far; the network-idle
    /// heuristic watches this number for a quiet window.
    async fn resource_count(&self) -> Result<u64> {
        let result = self
            .page
            .evaluate("performance.getEntriesByType('resource').length")
            .await
            .map_err(|e| FlowError::Internal(format!("resource probe failed: {}", e)))?;
        Ok(result.into_value::<u64>().unwrap_or(0))
    }
}

#[async_trait]
impl PageHandle for ChromePage {
    async fn navigate(&self, url: &str) -> Result<()> {
        log::debug!("navigating to {}", url);

        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(|e| FlowError::NavigationFailed(format!("Invalid URL {}: {}", url, e)))?;

        let response = self.page.execute(params).await.map_err(|e| {
            let error_str = e.to_string();
            // "oneshot canceled" means the browser connection is dead
            if error_str.contains("oneshot canceled") {
                FlowError::NavigationFailed(
                    "Browser connection lost. The browser may have been closed or crashed."
                        .to_string(),
                )
            } else {
                FlowError::NavigationFailed(format!("Failed to navigate to {}: {}", url, e))
            }
        })?;

        if let Some(error_text) = &response.result.error_text {
            return Err(FlowError::NavigationFailed(format!(
                "Navigation error: {}",
                error_text
            )));
        }

        if let Err(e) = self.wait_for_navigation(NAVIGATE_TIMEOUT).await {
            return Err(FlowError::NavigationFailed(format!(
                "Request timed out loading {}: {}",
                url, e
            )));
        }

        // Small delay for page state to stabilize
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        self.page
            .url()
            .await
            .map_err(|e| FlowError::Internal(e.to_string()))?
            .ok_or_else(|| FlowError::Internal("page reported no url".to_string()))
    }

    async fn frame_tree(&self) -> Result<FrameNode> {
        let tree = self.page.execute(GetFrameTreeParams::default()).await?;
        Ok(convert_frame_tree(&tree.result.frame_tree))
    }

    async fn eval(&self, frame: &FrameId, expression: &str) -> Result<serde_json::Value> {
        let context = self.frame_context(frame).await?;

        let mut builder = EvaluateParams::builder()
            .expression(expression)
            .await_promise(true)
            .return_by_value(true);
        if let Some(context_id) = context {
            builder = builder.context_id(context_id);
        }
        let params = builder
            .build()
            .map_err(|e| FlowError::Internal(format!("bad evaluate params: {}", e)))?;

        let result = self
            .page
            .evaluate(params)
            .await
            .map_err(|e| FlowError::Internal(format!("Script execution failed: {}", e)))?;

        Ok(result.into_value().unwrap_or(serde_json::Value::Null))
    }

    async fn click(&self, frame: &FrameId, selector: &str) -> Result<()> {
        let js = format!(
            r#"
            (() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                el.click();
                return true;
            }})()
            "#,
            sel = js_string(selector),
        );
        match self.eval(frame, &js).await? {
            serde_json::Value::Bool(true) => Ok(()),
            _ => Err(FlowError::ElementNotFound(selector.to_string())),
        }
    }

    async fn fill(&self, frame: &FrameId, selector: &str, value: &str) -> Result<()> {
        let js = format!(
            r#"
            (() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                el.focus();
                el.value = "";
                el.value = {val};
                el.dispatchEvent(new Event("input", {{ bubbles: true }}));
                el.dispatchEvent(new Event("change", {{ bubbles: true }}));
                return true;
            }})()
            "#,
            sel = js_string(selector),
            val = js_string(value),
        );
        match self.eval(frame, &js).await? {
            serde_json::Value::Bool(true) => Ok(()),
            _ => Err(FlowError::ElementNotFound(selector.to_string())),
        }
    }

    async fn wait_for_navigation(&self, budget: Duration) -> Result<()> {
        let mut events = self
            .page
            .event_listener::<EventLoadEventFired>()
            .await
            .map_err(FlowError::from)?;

        match tokio::time::timeout(budget, events.next()).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(FlowError::Internal(
                "navigation event stream closed".to_string(),
            )),
            Err(_) => Err(FlowError::RemoteTimeout(format!(
                "no navigation within {:?}",
                budget
            ))),
        }
    }

    async fn wait_for_network_idle(&self, budget: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + budget;
        let mut last = self.resource_count().await?;
        let mut quiet_since = tokio::time::Instant::now();

        loop {
            tokio::time::sleep(IDLE_SAMPLE_INTERVAL).await;
            if tokio::time::Instant::now() >= deadline {
                return Err(FlowError::RemoteTimeout(format!(
                    "network never went quiet within {:?}",
                    budget
                )));
            }

            let current = self.resource_count().await?;
            if current == last {
                if quiet_since.elapsed() >= IDLE_QUIET_WINDOW {
                    return Ok(());
                }
            } else {
                last = current;
                quiet_since = tokio::time::Instant::now();
            }
        }
    }

    async fn cookies(&self) -> Result<Vec<PageCookie>> {
        let cookies = self
            .page
            .get_cookies()
            .await
            .map_err(|e| FlowError::Internal(format!("Failed to read cookies: {}", e)))?;

        Ok(cookies
            .iter()
            .map(|c| PageCookie {
                name: c.name.clone(),
                value: c.value.clone(),
                domain: c.domain.clone(),
                path: c.path.clone(),
                expires: c.expires,
                http_only: c.http_only,
                secure: c.secure,
            })
            .collect())
    }

    async fn close(&self) -> Result<()> {
        let driver = self.driver.lock().await.take();
        if let Some(driver) = driver {
            driver.close().await?;
        }
        Ok(())
    }
}

fn convert_frame_tree(tree: &cdp_page::FrameTree) -> FrameNode {
    FrameNode {
        id: FrameId(tree.frame.id.inner().clone()),
        children: tree
            .child_frames
            .as_ref()
            .map(|children| children.iter().map(convert_frame_tree).collect())
            .unwrap_or_default(),
    }
}

/// Quote a string as a JavaScript literal.
fn js_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}
