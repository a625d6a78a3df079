//! Frame Search
//!
//! Challenge widgets can be rendered inside any number of nested embedded
//! documents, at unknown depth and in unknown order. The search walks the
//! frame tree depth-first and returns the first document where a probe
//! reports a hit.

use crate::browser::page::{FrameId, FrameNode};
use crate::error::Result;
use async_recursion::async_recursion;
use async_trait::async_trait;

/// A predicate evaluated against one document at a time.
///
/// Probes typically run a JavaScript snippet in the frame and map the result
/// to a typed hit. A probe that errors (the frame navigated away mid-search,
/// the document is transiently unqueryable) counts as "no match here" and
/// the traversal moves on.
#[async_trait]
pub trait FrameProbe: Send + Sync {
    type Hit: Send;

    async fn probe(&self, frame: &FrameId) -> Result<Option<Self::Hit>>;
}

/// Depth-first search over the whole tree.
///
/// The root document is probed first, then each child in document order,
/// recursing into a child's sub-documents before moving to the next sibling.
/// Stops at the first hit; when several documents could match, the first in
/// traversal order wins.
#[async_recursion]
pub async fn search_tree<P>(node: &FrameNode, probe: &P) -> Option<P::Hit>
where
    P: FrameProbe + ?Sized,
{
    match probe.probe(&node.id).await {
        Ok(Some(hit)) => return Some(hit),
        Ok(None) => {}
        Err(e) => {
            log::debug!("probe failed in frame {}: {} (treated as no match)", node.id, e);
        }
    }

    for child in &node.children {
        if let Some(hit) = search_tree(child, probe).await {
            return Some(hit);
        }
    }

    None
}

/// Probe the root and its direct sub-documents only.
///
/// Used for widgets known to live at shallow depth (the tile grid), where
/// recursing into deeper embeds would only widen the blast radius of a
/// false match.
pub async fn search_shallow<P>(root: &FrameNode, probe: &P) -> Option<P::Hit>
where
    P: FrameProbe + ?Sized,
{
    match probe.probe(&root.id).await {
        Ok(Some(hit)) => return Some(hit),
        Ok(None) => {}
        Err(e) => {
            log::debug!("probe failed in frame {}: {} (treated as no match)", root.id, e);
        }
    }

    for child in &root.children {
        match probe.probe(&child.id).await {
            Ok(Some(hit)) => return Some(hit),
            Ok(None) => {}
            Err(e) => {
                log::debug!(
                    "probe failed in frame {}: {} (treated as no match)",
                    child.id,
                    e
                );
            }
        }
    }

    None
}
