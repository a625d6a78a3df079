//! Challenge State Machine
//!
//! Drives one login attempt through credential submission, the puzzle
//! challenge, one-time-code verification and phone registration, pausing at
//! every point where a human has to supply input (a tile choice, a code, a
//! phone number). Frame search and the completion poller are the only
//! primitives used to observe the remote page.

use crate::artifact::ArtifactRelay;
use crate::browser::page::{FrameId, PageHandle};
use crate::error::{FlowError, Result};
use crate::flow::frames::{search_shallow, search_tree};
use crate::flow::matchers::{JsProbe, MarkupProfile};
use crate::flow::poller::{Completion, CompletionPoller};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Position of a login attempt in the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    LoggedOut,
    CredentialsSubmitted,
    PuzzleSearch,
    PuzzleActive,
    PuzzleRetry,
    AwaitingNextPuzzle,
    AwaitingOneTimeCode,
    AwaitingPhoneNumber,
    AwaitingSmsCode,
    Authenticated,
    /// The remote flow redirected to a dead-end challenge page this system
    /// cannot resolve. Terminal, but distinct from a generic failure.
    LoginChallengeRequired,
    Failed,
}

impl Stage {
    /// The externally-suppliable datum this stage is waiting on, if any.
    pub fn awaited_input(&self) -> Option<InputKind> {
        match self {
            Stage::PuzzleActive | Stage::PuzzleRetry => Some(InputKind::TileNumber),
            Stage::AwaitingOneTimeCode => Some(InputKind::OneTimeCode),
            Stage::AwaitingPhoneNumber => Some(InputKind::PhoneNumber),
            Stage::AwaitingSmsCode => Some(InputKind::SmsCode),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Stage::Authenticated | Stage::LoginChallengeRequired | Stage::Failed
        )
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::LoggedOut => "logged_out",
            Stage::CredentialsSubmitted => "credentials_submitted",
            Stage::PuzzleSearch => "puzzle_search",
            Stage::PuzzleActive => "puzzle_active",
            Stage::PuzzleRetry => "puzzle_retry",
            Stage::AwaitingNextPuzzle => "awaiting_next_puzzle",
            Stage::AwaitingOneTimeCode => "awaiting_one_time_code",
            Stage::AwaitingPhoneNumber => "awaiting_phone_number",
            Stage::AwaitingSmsCode => "awaiting_sms_code",
            Stage::Authenticated => "authenticated",
            Stage::LoginChallengeRequired => "login_challenge_required",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Which datum the caller must supply next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    TileNumber,
    OneTimeCode,
    PhoneNumber,
    SmsCode,
}

/// Result of one stage-advancing operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ChallengeOutcome {
    Success,
    RetryableFailure(String),
    TerminalFailure(String),
    AwaitingInput(InputKind),
}

/// One interactive control, serialized for the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlDescriptor {
    pub selector: String,
    pub tag: String,
    pub text: String,
    pub is_visible: bool,
    pub is_enabled: bool,
}

/// Flow-level tunables. Markup knowledge lives in [`MarkupProfile`].
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Address of the remote login form.
    pub login_url: String,

    /// Deadline shared by the completion poller's signals.
    pub completion_budget: Duration,

    /// Pause after actions known to need remote-side rendering time.
    pub settle_delay: Duration,

    pub markup: MarkupProfile,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            login_url: "https://www.example.com/login".to_string(),
            completion_budget: Duration::from_secs(8),
            settle_delay: Duration::from_millis(1500),
            markup: MarkupProfile::default(),
        }
    }
}

/// The orchestrator for one login attempt.
///
/// Owns the attempt's [`PageHandle`] exclusively; every mutation of the
/// remote page goes through here. Callers are expected to invoke operations
/// strictly sequentially (the session registry enforces this with a
/// per-session lock).
pub struct LoginFlow {
    page: Arc<dyn PageHandle>,
    relay: Arc<ArtifactRelay>,
    session_id: String,
    config: FlowConfig,
    poller: CompletionPoller,
    stage: Stage,
    challenge_attempts: u32,
    fail_reason: Option<String>,
}

impl LoginFlow {
    pub fn new(
        page: Arc<dyn PageHandle>,
        relay: Arc<ArtifactRelay>,
        session_id: impl Into<String>,
        config: FlowConfig,
    ) -> Self {
        let poller = CompletionPoller::new(config.completion_budget);
        Self {
            page,
            relay,
            session_id: session_id.into(),
            config,
            poller,
            stage: Stage::LoggedOut,
            challenge_attempts: 0,
            fail_reason: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn challenge_attempts(&self) -> u32 {
        self.challenge_attempts
    }

    pub fn fail_reason(&self) -> Option<&str> {
        self.fail_reason.as_deref()
    }

    /// Cookies of the underlying remote session.
    pub async fn cookies(&self) -> Result<Vec<crate::browser::page::PageCookie>> {
        self.page.cookies().await
    }

    /// Release the underlying page.
    pub async fn shutdown(&self) -> Result<()> {
        self.page.close().await
    }

    // ===== STAGE OPERATIONS =====

    /// Navigate to the login form, submit identity and secret, and advance
    /// into the challenge search.
    pub async fn submit_credentials(
        &mut self,
        identity: &str,
        secret: &str,
    ) -> Result<ChallengeOutcome> {
        if identity.is_empty() {
            return Err(FlowError::Validation("identity must not be empty".into()));
        }
        if self.stage != Stage::LoggedOut {
            return Err(FlowError::NotApplicable(self.stage.to_string()));
        }

        log::info!("session {}: submitting credentials", self.session_id);
        self.page.navigate(&self.config.login_url).await?;
        self.stage = Stage::CredentialsSubmitted;

        let baseline = self.page.current_url().await?;
        let root = self.page.frame_tree().await?.id;
        let markup = self.config.markup.clone();

        self.page.fill(&root, &markup.identity_field, identity).await?;
        self.page.fill(&root, &markup.secret_field, secret).await?;
        self.page.click(&root, &markup.login_submit).await?;

        self.poller.await_completion(self.page.as_ref(), &baseline).await?;

        if let Some((_, text)) = self.find_in_tree(markup.probe_credential_error()).await? {
            let detail = text.as_str().unwrap_or("credentials rejected").to_string();
            log::warn!("session {}: remote rejected credentials", self.session_id);
            return Ok(self.fail(format!("authentication failed: {}", detail)));
        }

        self.run_puzzle_search().await
    }

    /// Serialized descriptors of the interactive controls in the first
    /// document that has any. Empty when nothing was found.
    pub async fn challenge_controls(&mut self) -> Result<Vec<ControlDescriptor>> {
        let found = self.find_in_tree(self.config.markup.list_controls()).await?;
        match found {
            Some((frame, value)) => {
                let controls: Vec<ControlDescriptor> =
                    serde_json::from_value(value).map_err(|e| {
                        FlowError::Internal(format!("malformed control listing: {}", e))
                    })?;
                log::debug!(
                    "session {}: {} controls in frame {}",
                    self.session_id,
                    controls.len(),
                    frame
                );
                Ok(controls)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Act on a caller-supplied tile choice.
    pub async fn select_tile(&mut self, tile: u32) -> Result<ChallengeOutcome> {
        // Rejected before any remote interaction, whatever the stage.
        if !(1..=self.config.markup.tile_count as u32).contains(&tile) {
            return Err(FlowError::Validation(format!(
                "tile number must be between 1 and {}",
                self.config.markup.tile_count
            )));
        }
        if !matches!(self.stage, Stage::PuzzleActive | Stage::PuzzleRetry) {
            return Err(FlowError::NotApplicable(self.stage.to_string()));
        }

        let markup = self.config.markup.clone();
        let baseline = self.page.current_url().await?;

        let tile_frame = match self.find_tile_frame().await? {
            Some(frame) => frame,
            None => {
                // The tile set vanished under us; the page may have moved on.
                log::warn!(
                    "session {}: tile set no longer present, re-checking flow state",
                    self.session_id
                );
                return self.post_challenge_check().await;
            }
        };

        let clicked = self
            .page
            .eval(&tile_frame, &markup.click_tile(tile as usize))
            .await?;
        if clicked != serde_json::Value::Bool(true) {
            return Err(FlowError::Internal(format!(
                "tile {} could not be clicked",
                tile
            )));
        }

        tokio::time::sleep(self.config.settle_delay).await;

        if let Some((_, text)) = self.find_in_tree(markup.probe_error_indicator()).await? {
            let detail = text.as_str().unwrap_or("challenge error").to_string();
            log::info!(
                "session {}: wrong tile ({}), looking for retry control",
                self.session_id,
                detail
            );

            let retried = self.find_in_tree(markup.click_retry_control()).await?;
            if retried.is_some() {
                // The tile set regenerates with a fresh image; recapture it
                // for the solver before asking for another pick.
                tokio::time::sleep(self.config.settle_delay).await;
                if let Some(frame) = self.find_tile_frame().await? {
                    self.capture_and_publish(&frame).await?;
                }
                self.stage = Stage::PuzzleRetry;
                return Ok(ChallengeOutcome::AwaitingInput(InputKind::TileNumber));
            }
            return Ok(ChallengeOutcome::RetryableFailure(detail));
        }

        match self
            .poller
            .await_completion(self.page.as_ref(), &baseline)
            .await?
        {
            Completion::Changed(_) => {
                self.challenge_attempts += 1;
                log::info!(
                    "session {}: puzzle cycle {} complete",
                    self.session_id,
                    self.challenge_attempts
                );
                if self.challenge_attempts >= 2 {
                    self.stage = Stage::AwaitingOneTimeCode;
                    return Ok(ChallengeOutcome::AwaitingInput(InputKind::OneTimeCode));
                }
                // The remote flow presents the puzzle twice before a code step.
                self.stage = Stage::AwaitingNextPuzzle;
                tokio::time::sleep(self.config.settle_delay).await;
                self.run_puzzle_search().await
            }
            Completion::Unchanged => {
                // Slow rendering is expected; go look for the next puzzle
                // rather than aborting.
                self.run_puzzle_search().await
            }
        }
    }

    /// Enter and submit a one-time code (emailed or SMS, depending on stage).
    pub async fn submit_code(&mut self, code: &str) -> Result<ChallengeOutcome> {
        if code.is_empty() {
            return Err(FlowError::Validation("code must not be empty".into()));
        }
        if !matches!(
            self.stage,
            Stage::AwaitingOneTimeCode | Stage::AwaitingSmsCode
        ) {
            return Err(FlowError::NotApplicable(self.stage.to_string()));
        }

        let markup = self.config.markup.clone();
        let baseline = self.page.current_url().await?;

        let (frame, _) = self
            .find_in_tree(markup.probe_code_form())
            .await?
            .ok_or_else(|| FlowError::Internal("code input not found on page".into()))?;

        self.page.fill(&frame, &markup.code_input, code).await?;
        self.page.click(&frame, &markup.code_submit).await?;

        self.poller.await_completion(self.page.as_ref(), &baseline).await?;

        if let Some((_, text)) = self.find_in_tree(markup.probe_error_indicator()).await? {
            let detail = text.as_str().unwrap_or("code rejected").to_string();
            log::info!("session {}: code rejected, stage unchanged", self.session_id);
            return Ok(ChallengeOutcome::RetryableFailure(detail));
        }

        let url = self.page.current_url().await?;
        if markup.is_dead_end(&url) {
            self.stage = Stage::LoginChallengeRequired;
            log::warn!("session {}: redirected to dead-end challenge", self.session_id);
            return Ok(ChallengeOutcome::TerminalFailure(
                "login challenge required".into(),
            ));
        }

        self.stage = Stage::Authenticated;
        log::info!("session {}: authenticated", self.session_id);
        Ok(ChallengeOutcome::Success)
    }

    /// Register a phone number. Validated locally before any remote call.
    pub async fn submit_phone(
        &mut self,
        phone: &str,
        country_code: &str,
    ) -> Result<ChallengeOutcome> {
        let digits = phone.chars().filter(char::is_ascii_digit).count();
        if digits < self.config.markup.phone_min_digits {
            return Err(FlowError::Validation(format!(
                "phone number too short (need at least {} digits)",
                self.config.markup.phone_min_digits
            )));
        }
        if self.stage != Stage::AwaitingPhoneNumber {
            return Err(FlowError::NotApplicable(self.stage.to_string()));
        }

        let markup = self.config.markup.clone();
        let baseline = self.page.current_url().await?;

        let (frame, _) = self
            .find_in_tree(markup.probe_phone_form())
            .await?
            .ok_or_else(|| FlowError::Internal("phone input not found on page".into()))?;

        if !country_code.is_empty() {
            self.page.fill(&frame, &markup.country_input, country_code).await?;
        }
        self.page.fill(&frame, &markup.phone_input, phone).await?;
        self.page.click(&frame, &markup.phone_submit).await?;

        self.poller.await_completion(self.page.as_ref(), &baseline).await?;

        if let Some((_, text)) = self.find_in_tree(markup.probe_error_indicator()).await? {
            let detail = text.as_str().unwrap_or("phone rejected").to_string();
            return Ok(ChallengeOutcome::RetryableFailure(detail));
        }

        // SMS verification step is announced by a heading or by the code form
        // showing up.
        let heading = self.read_heading().await?;
        let sms_announced = heading
            .as_deref()
            .map(|h| pattern_matches(&markup.sms_heading_pattern, h))
            .unwrap_or(false)
            || self.find_in_tree(markup.probe_code_form()).await?.is_some();

        if sms_announced {
            self.stage = Stage::AwaitingSmsCode;
            return Ok(ChallengeOutcome::AwaitingInput(InputKind::SmsCode));
        }

        let url = self.page.current_url().await?;
        if markup.is_dead_end(&url) {
            self.stage = Stage::LoginChallengeRequired;
            return Ok(ChallengeOutcome::TerminalFailure(
                "login challenge required".into(),
            ));
        }

        self.stage = Stage::Authenticated;
        Ok(ChallengeOutcome::Success)
    }

    /// Current stage, re-checking the address for late authentication.
    /// Short-circuits once authenticated.
    pub async fn status(&mut self) -> Result<Stage> {
        if self.stage.is_terminal() {
            return Ok(self.stage);
        }
        match self.page.current_url().await {
            Ok(url) if self.config.markup.is_authenticated(&url) => {
                self.stage = Stage::Authenticated;
            }
            Ok(_) => {}
            Err(e) => {
                // Status is a read-only poll; a flaky page read is not worth
                // failing the session over.
                log::debug!("session {}: status url read failed: {}", self.session_id, e);
            }
        }
        Ok(self.stage)
    }

    // ===== INTERNALS =====

    /// Look for the puzzle start control and open the tile challenge, or
    /// decide that no challenge was presented this time.
    async fn run_puzzle_search(&mut self) -> Result<ChallengeOutcome> {
        self.stage = Stage::PuzzleSearch;
        let markup = self.config.markup.clone();

        let mut start = self.find_in_tree(markup.probe_start_control()).await?;
        if start.is_none() {
            // The control can lag the navigation; give it one settle window.
            tokio::time::sleep(self.config.settle_delay).await;
            start = self.find_in_tree(markup.probe_start_control()).await?;
        }

        let (frame, hit) = match start {
            Some(found) => found,
            None => {
                log::info!(
                    "session {}: no challenge control found, assuming challenge satisfied",
                    self.session_id
                );
                return self.post_challenge_check().await;
            }
        };

        let selector = hit
            .get("selector")
            .and_then(|v| v.as_str())
            .ok_or_else(|| FlowError::Internal("start probe returned no selector".into()))?
            .to_string();
        log::info!(
            "session {}: challenge start via {} strategy",
            self.session_id,
            hit.get("strategy").and_then(|v| v.as_str()).unwrap_or("?")
        );

        self.page.click(&frame, &selector).await?;
        tokio::time::sleep(self.config.settle_delay).await;

        let mut tile_frame = self.find_tile_frame().await?;
        if tile_frame.is_none() {
            tokio::time::sleep(self.config.settle_delay).await;
            tile_frame = self.find_tile_frame().await?;
        }

        match tile_frame {
            Some(frame) => {
                self.stage = Stage::PuzzleActive;
                self.capture_and_publish(&frame).await?;
                Ok(ChallengeOutcome::AwaitingInput(InputKind::TileNumber))
            }
            None => {
                log::info!(
                    "session {}: start control clicked but no tile set appeared",
                    self.session_id
                );
                self.post_challenge_check().await
            }
        }
    }

    /// Decide where the flow stands once no puzzle is on screen.
    async fn post_challenge_check(&mut self) -> Result<ChallengeOutcome> {
        let markup = self.config.markup.clone();
        let url = self.page.current_url().await?;

        if markup.is_dead_end(&url) {
            self.stage = Stage::LoginChallengeRequired;
            return Ok(ChallengeOutcome::TerminalFailure(
                "login challenge required".into(),
            ));
        }
        if markup.is_authenticated(&url) {
            self.stage = Stage::Authenticated;
            return Ok(ChallengeOutcome::Success);
        }
        if self.find_in_tree(markup.probe_code_form()).await?.is_some() {
            self.stage = Stage::AwaitingOneTimeCode;
            return Ok(ChallengeOutcome::AwaitingInput(InputKind::OneTimeCode));
        }

        let phone_form = self.find_in_tree(markup.probe_phone_form()).await?.is_some();
        let phone_heading = self
            .read_heading()
            .await?
            .as_deref()
            .map(|h| pattern_matches(&markup.phone_heading_pattern, h))
            .unwrap_or(false);
        if phone_form || phone_heading {
            self.stage = Stage::AwaitingPhoneNumber;
            return Ok(ChallengeOutcome::AwaitingInput(InputKind::PhoneNumber));
        }

        self.stage = Stage::PuzzleSearch;
        Ok(ChallengeOutcome::RetryableFailure(
            "post-challenge state not recognized yet; poll status".into(),
        ))
    }

    /// The document holding the full tile set. Tiles live at shallow depth,
    /// so only the root and its direct sub-documents are probed.
    async fn find_tile_frame(&self) -> Result<Option<FrameId>> {
        let tree = self.page.frame_tree().await?;
        let probe = JsProbe::new(self.page.as_ref(), self.config.markup.probe_tiles());
        Ok(search_shallow(&tree, &probe).await.map(|(frame, _)| frame))
    }

    /// Capture the current first-tile image and stage it for the solver.
    /// Overwrites any prior artifact for this session.
    async fn capture_and_publish(&self, frame: &FrameId) -> Result<()> {
        let captured = self
            .page
            .eval(frame, &self.config.markup.capture_tile_image())
            .await?;

        let data_url = match captured.as_str() {
            Some(s) => s.to_string(),
            None => {
                log::warn!(
                    "session {}: tile image could not be captured",
                    self.session_id
                );
                return Ok(());
            }
        };

        let bytes = match data_url.split_once("base64,") {
            Some((_, payload)) => general_purpose::STANDARD
                .decode(payload)
                .map_err(|e| FlowError::Internal(format!("bad tile image payload: {}", e)))?,
            None => data_url.into_bytes(),
        };

        self.relay.publish(&self.session_id, &bytes).await?;
        Ok(())
    }

    async fn find_in_tree(
        &self,
        expression: String,
    ) -> Result<Option<(FrameId, serde_json::Value)>> {
        let tree = self.page.frame_tree().await?;
        let probe = JsProbe::new(self.page.as_ref(), expression);
        Ok(search_tree(&tree, &probe).await)
    }

    async fn read_heading(&self) -> Result<Option<String>> {
        let found = self.find_in_tree(self.config.markup.read_heading()).await?;
        Ok(found.and_then(|(_, v)| v.as_str().map(str::to_string)))
    }

    fn fail(&mut self, reason: String) -> ChallengeOutcome {
        self.stage = Stage::Failed;
        self.fail_reason = Some(reason.clone());
        ChallengeOutcome::TerminalFailure(reason)
    }
}

/// Case-insensitive "any alternative matches" check for the `a|b|c` patterns
/// used in headings.
fn pattern_matches(pattern: &str, text: &str) -> bool {
    let text = text.to_lowercase();
    pattern
        .split('|')
        .any(|alt| !alt.is_empty() && text.contains(&alt.to_lowercase()))
}
