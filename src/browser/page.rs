//! Browser Session Handle seam
//!
//! The orchestrator never talks to Chrome directly; everything goes through
//! the [`PageHandle`] trait so the flow logic can be driven against a mock
//! page in tests and against CDP in production.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Opaque identifier for one document in the page's frame tree.
///
/// The root document and every nested sub-document get their own id. Ids are
/// only meaningful for the lifetime of one [`PageHandle::frame_tree`] call;
/// the remote document can swap frames out at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameId(pub String);

impl FrameId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One document plus its embedded sub-documents, in document order.
///
/// Rebuilt on every search; never cached across operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameNode {
    pub id: FrameId,
    pub children: Vec<FrameNode>,
}

impl FrameNode {
    /// A frame with no sub-documents.
    pub fn leaf(id: impl Into<String>) -> Self {
        Self {
            id: FrameId(id.into()),
            children: Vec::new(),
        }
    }

    /// Total number of documents in this tree, this node included.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(FrameNode::node_count).sum::<usize>()
    }
}

/// A cookie as read back from the remote session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// Unix timestamp in seconds; negative for session cookies.
    pub expires: f64,
    pub http_only: bool,
    pub secure: bool,
}

/// One controllable remote page and its interaction primitives.
///
/// Exactly one handle exists per login attempt. Implementations must be safe
/// to share behind an `Arc`, but callers are expected to serialize operations
/// per session (see the session registry).
#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Navigate the page and wait for the load to settle.
    async fn navigate(&self, url: &str) -> Result<()>;

    /// Current address of the top-level document.
    async fn current_url(&self) -> Result<String>;

    /// Snapshot of the document tree, root first.
    async fn frame_tree(&self) -> Result<FrameNode>;

    /// Evaluate a JavaScript expression inside the given document and return
    /// its JSON value. Promises are awaited.
    async fn eval(&self, frame: &FrameId, expression: &str) -> Result<serde_json::Value>;

    /// Click the first element matching `selector` inside the given document.
    async fn click(&self, frame: &FrameId, selector: &str) -> Result<()>;

    /// Clear the first element matching `selector` and type `value` into it.
    async fn fill(&self, frame: &FrameId, selector: &str, value: &str) -> Result<()>;

    /// Resolve when a navigation completes, or when `budget` expires.
    /// Expiry is reported as [`crate::error::FlowError::RemoteTimeout`].
    async fn wait_for_navigation(&self, budget: Duration) -> Result<()>;

    /// Resolve when outgoing requests go quiet, or when `budget` expires.
    async fn wait_for_network_idle(&self, budget: Duration) -> Result<()>;

    /// All cookies visible to the current page.
    async fn cookies(&self) -> Result<Vec<PageCookie>>;

    /// Tear the page down. Further calls are undefined.
    async fn close(&self) -> Result<()>;
}
