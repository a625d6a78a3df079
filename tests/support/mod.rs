#![allow(dead_code)] // each test binary uses a different slice of this module

//! Scripted mock page for driving the orchestrator without a browser.
//!
//! Probe scripts built by `MarkupProfile` carry stable inner function names
//! (`findChallengeStart`, `findPuzzleTiles`, ...); the mock dispatches on
//! those markers, so tests stub per-probe answers instead of parsing JS.

use async_trait::async_trait;
use authrelay::browser::page::{FrameId, FrameNode, PageCookie, PageHandle};
use authrelay::error::{FlowError, Result};
use authrelay::flow::machine::FlowConfig;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const START: &str = "findChallengeStart";
pub const TILES: &str = "findPuzzleTiles";
pub const CAPTURE: &str = "captureTileImage";
pub const TILE_CLICK: &str = "clickPuzzleTile";
pub const ERROR_INDICATOR: &str = "findErrorIndicator";
pub const RETRY: &str = "clickRetryControl";
pub const CREDENTIAL_ERROR: &str = "findCredentialError";
pub const CODE_FORM: &str = "findCodeForm";
pub const PHONE_FORM: &str = "findPhoneForm";
pub const HEADING: &str = "readHeading";
pub const CONTROLS: &str = "listInteractiveControls";

const ALL_MARKERS: &[&str] = &[
    START,
    TILES,
    CAPTURE,
    TILE_CLICK,
    ERROR_INDICATOR,
    RETRY,
    CREDENTIAL_ERROR,
    CODE_FORM,
    PHONE_FORM,
    HEADING,
    CONTROLS,
];

pub struct MockPage {
    url: Mutex<String>,
    tree: Mutex<FrameNode>,
    sticky: Mutex<HashMap<&'static str, Value>>,
    queued: Mutex<HashMap<&'static str, VecDeque<Value>>>,
    url_after_click: Mutex<Option<String>>,
    url_after_tile_click: Mutex<Option<String>>,
    waits_fail: AtomicBool,
    calls: AtomicUsize,
    clicks: Mutex<Vec<(String, String)>>,
    fills: Mutex<Vec<(String, String, String)>>,
    cookie_jar: Mutex<Vec<PageCookie>>,
}

impl MockPage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            url: Mutex::new("https://www.example.com/login".to_string()),
            tree: Mutex::new(FrameNode::leaf("root")),
            sticky: Mutex::new(HashMap::new()),
            queued: Mutex::new(HashMap::new()),
            url_after_click: Mutex::new(None),
            url_after_tile_click: Mutex::new(None),
            waits_fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            clicks: Mutex::new(Vec::new()),
            fills: Mutex::new(Vec::new()),
            cookie_jar: Mutex::new(Vec::new()),
        })
    }

    /// Fixed answer for a probe, every time it runs.
    pub fn stub(&self, marker: &'static str, value: Value) {
        self.sticky.lock().unwrap().insert(marker, value);
    }

    /// One-shot answer; consumed before any sticky stub is considered.
    pub fn queue(&self, marker: &'static str, value: Value) {
        self.queued
            .lock()
            .unwrap()
            .entry(marker)
            .or_default()
            .push_back(value);
    }

    pub fn set_url(&self, url: &str) {
        *self.url.lock().unwrap() = url.to_string();
    }

    pub fn set_tree(&self, tree: FrameNode) {
        *self.tree.lock().unwrap() = tree;
    }

    /// Address the page "moves to" on the next `click` call.
    pub fn on_click_set_url(&self, url: &str) {
        *self.url_after_click.lock().unwrap() = Some(url.to_string());
    }

    /// Address the page "moves to" on the next successful tile click.
    pub fn on_tile_click_set_url(&self, url: &str) {
        *self.url_after_tile_click.lock().unwrap() = Some(url.to_string());
    }

    /// Make both wait signals report a timeout instead of firing.
    pub fn make_waits_fail(&self) {
        self.waits_fail.store(true, Ordering::SeqCst);
    }

    pub fn set_cookies(&self, cookies: Vec<PageCookie>) {
        *self.cookie_jar.lock().unwrap() = cookies;
    }

    /// Total number of handle calls of any kind.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn clicks(&self) -> Vec<(String, String)> {
        self.clicks.lock().unwrap().clone()
    }

    pub fn fills(&self) -> Vec<(String, String, String)> {
        self.fills.lock().unwrap().clone()
    }

    fn respond(&self, expression: &str) -> Value {
        for marker in ALL_MARKERS {
            if !expression.contains(marker) {
                continue;
            }
            if let Some(queue) = self.queued.lock().unwrap().get_mut(marker) {
                if let Some(value) = queue.pop_front() {
                    return value;
                }
            }
            if let Some(value) = self.sticky.lock().unwrap().get(marker) {
                return value.clone();
            }
            // Tile clicks succeed unless a test says otherwise.
            if *marker == TILE_CLICK {
                return Value::Bool(true);
            }
            return Value::Null;
        }
        Value::Null
    }
}

#[async_trait]
impl PageHandle for MockPage {
    async fn navigate(&self, url: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.set_url(url);
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.url.lock().unwrap().clone())
    }

    async fn frame_tree(&self) -> Result<FrameNode> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.tree.lock().unwrap().clone())
    }

    async fn eval(&self, _frame: &FrameId, expression: &str) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let value = self.respond(expression);
        if expression.contains(TILE_CLICK) && value == Value::Bool(true) {
            if let Some(url) = self.url_after_tile_click.lock().unwrap().take() {
                *self.url.lock().unwrap() = url;
            }
        }
        Ok(value)
    }

    async fn click(&self, frame: &FrameId, selector: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.clicks
            .lock()
            .unwrap()
            .push((frame.as_str().to_string(), selector.to_string()));
        if let Some(url) = self.url_after_click.lock().unwrap().take() {
            *self.url.lock().unwrap() = url;
        }
        Ok(())
    }

    async fn fill(&self, frame: &FrameId, selector: &str, value: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.fills.lock().unwrap().push((
            frame.as_str().to_string(),
            selector.to_string(),
            value.to_string(),
        ));
        Ok(())
    }

    async fn wait_for_navigation(&self, budget: Duration) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.waits_fail.load(Ordering::SeqCst) {
            Err(FlowError::RemoteTimeout(format!(
                "no navigation within {:?}",
                budget
            )))
        } else {
            Ok(())
        }
    }

    async fn wait_for_network_idle(&self, budget: Duration) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.waits_fail.load(Ordering::SeqCst) {
            Err(FlowError::RemoteTimeout(format!(
                "network never went quiet within {:?}",
                budget
            )))
        } else {
            Ok(())
        }
    }

    async fn cookies(&self) -> Result<Vec<PageCookie>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.cookie_jar.lock().unwrap().clone())
    }

    async fn close(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Flow config with timings short enough for tests.
pub fn test_config() -> FlowConfig {
    FlowConfig {
        login_url: "https://www.example.com/login".to_string(),
        completion_budget: Duration::from_millis(20),
        settle_delay: Duration::from_millis(1),
        ..FlowConfig::default()
    }
}

/// A `{strategy, selector}` start-control hit, the shape the real probe
/// resolves to.
pub fn start_hit() -> Value {
    serde_json::json!({ "strategy": "attribute", "selector": "[data-testid='challenge-start']" })
}

/// A full tile-set hit.
pub fn tiles_hit() -> Value {
    serde_json::json!({ "count": 6 })
}

/// A PNG-ish data URL whose payload is `bytes`.
pub fn data_url(bytes: &[u8]) -> Value {
    use base64::{engine::general_purpose, Engine as _};
    Value::String(format!(
        "data:image/png;base64,{}",
        general_purpose::STANDARD.encode(bytes)
    ))
}
