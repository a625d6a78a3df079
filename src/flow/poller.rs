//! Completion Poller
//!
//! No single signal reliably tells us that a click or submit took effect:
//! client-side routing can swallow the navigation event, and network-idle
//! heuristics false-positive on long-polling pages. The poller races the
//! available weak signals and then verifies against ground truth (the
//! current address) before reporting a change.

use crate::browser::page::PageHandle;
use crate::error::Result;
use std::time::Duration;

/// Outcome of one completion check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The observable state genuinely differs from the baseline.
    Changed(String),
    /// Every signal fired or expired, but the state matches the baseline.
    Unchanged,
}

/// Races navigation-complete, network-idle and a fixed fallback timer, then
/// re-reads the page address and compares it to the baseline.
#[derive(Debug, Clone)]
pub struct CompletionPoller {
    /// Shared deadline for all three observations.
    pub budget: Duration,
}

impl Default for CompletionPoller {
    fn default() -> Self {
        Self {
            budget: Duration::from_secs(8),
        }
    }
}

impl CompletionPoller {
    pub fn new(budget: Duration) -> Self {
        Self { budget }
    }

    /// Wait until one of the signals resolves (or the budget expires), then
    /// report whether the address moved away from `baseline`.
    ///
    /// A signal that errors or times out is not a failure: the poller falls
    /// through to the ground-truth check either way. The losing observations
    /// are dropped, not awaited further.
    pub async fn await_completion(
        &self,
        page: &dyn PageHandle,
        baseline: &str,
    ) -> Result<Completion> {
        tokio::select! {
            res = page.wait_for_navigation(self.budget) => {
                match res {
                    Ok(()) => log::debug!("completion race won by navigation signal"),
                    Err(e) => log::debug!("navigation signal ended without firing: {}", e),
                }
            }
            res = page.wait_for_network_idle(self.budget) => {
                match res {
                    Ok(()) => log::debug!("completion race won by network-idle signal"),
                    Err(e) => log::debug!("network-idle signal ended without firing: {}", e),
                }
            }
            _ = tokio::time::sleep(self.budget) => {
                log::debug!("completion race hit the fallback timer ({:?})", self.budget);
            }
        }

        // A fired navigation event does not guarantee the address actually
        // changed on this class of page; only the re-read decides.
        let current = page.current_url().await?;
        if current != baseline {
            log::debug!("address changed: {} -> {}", baseline, current);
            Ok(Completion::Changed(current))
        } else {
            Ok(Completion::Unchanged)
        }
    }
}
