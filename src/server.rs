//! HTTP transport surface
//!
//! Thin glue between warp and the challenge orchestrator: parse the request,
//! look the session up, take its lock, run one stage operation, and report a
//! structured outcome. Handlers never let a remote-side error propagate raw.

use crate::artifact::ArtifactRelay;
use crate::browser::chrome::{ChromeDriver, ConnectionMode};
use crate::browser::page::PageHandle;
use crate::error::{FlowError, Result};
use crate::flow::machine::{
    ChallengeOutcome, ControlDescriptor, FlowConfig, InputKind, LoginFlow, Stage,
};
use crate::session::SessionRegistry;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use warp::Filter;

/// Launch options for the per-session Chrome process.
pub struct PageLauncher {
    pub chrome_path: Option<String>,
    pub headless: bool,
    pub no_sandbox: bool,
    pub debug_port: Option<u16>,
}

impl PageLauncher {
    /// One fresh page handle per login attempt.
    pub async fn launch(&self) -> Result<Arc<dyn PageHandle>> {
        let driver = match self.debug_port {
            Some(port) => ChromeDriver::new(ConnectionMode::DebugPort(port)).await?,
            None => {
                ChromeDriver::new(ConnectionMode::Sandboxed {
                    chrome_path: self.chrome_path.clone(),
                    no_sandbox: self.no_sandbox,
                    headless: self.headless,
                })
                .await?
            }
        };
        Ok(Arc::new(driver.into_page().await?))
    }
}

/// Shared state behind every route.
pub struct AppState {
    pub registry: SessionRegistry,
    pub relay: Arc<ArtifactRelay>,
    pub launcher: PageLauncher,
    pub flow_config: FlowConfig,
    pub export_dir: PathBuf,
}

// ===== REQUEST / RESPONSE TYPES =====

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub identity: String,
    pub secret: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TileRequest {
    pub session_id: String,
    pub tile: u32,
}

#[derive(Debug, Deserialize)]
pub struct CodeRequest {
    pub session_id: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct PhoneRequest {
    pub session_id: String,
    pub phone: String,
    pub country_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct StageResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub awaiting: Option<InputKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ChallengeOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logged_in: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ControlsResponse {
    pub status: String,
    pub controls: Vec<ControlDescriptor>,
}

#[derive(Debug, Serialize)]
pub struct ArtifactResponse {
    pub status: String,
    pub available: bool,
}

#[derive(Debug, Serialize)]
pub struct ExportResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exported: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StageResponse {
    fn from_outcome(session_id: &str, stage: Stage, outcome: ChallengeOutcome) -> Self {
        Self {
            status: "ok".to_string(),
            session_id: Some(session_id.to_string()),
            stage: Some(stage),
            awaiting: stage.awaited_input(),
            outcome: Some(outcome),
            logged_in: Some(stage == Stage::Authenticated),
            message: None,
        }
    }

    fn from_error(session_id: Option<&str>, err: &FlowError) -> Self {
        Self {
            status: error_kind(err).to_string(),
            session_id: session_id.map(str::to_string),
            stage: None,
            awaiting: None,
            outcome: None,
            logged_in: None,
            message: Some(err.to_string()),
        }
    }
}

/// Wire-level category for an error; the caller branches on this, not on
/// the human-readable message.
fn error_kind(err: &FlowError) -> &'static str {
    match err {
        FlowError::Validation(_) => "invalid_input",
        FlowError::SessionNotFound(_) => "session_not_found",
        FlowError::NotApplicable(_) => "not_applicable",
        FlowError::RemoteRejected(_) => "remote_rejected",
        FlowError::RemoteTimeout(_) => "remote_timeout",
        FlowError::UnresolvedChallenge(_) => "unresolved_challenge",
        FlowError::LaunchFailed(_) | FlowError::ConnectionFailed(_) => "launch_failed",
        FlowError::NavigationFailed(_) => "navigation_failed",
        FlowError::ElementNotFound(_) | FlowError::Cdp(_) | FlowError::Internal(_) => {
            "internal_error"
        }
    }
}

fn session_not_found(id: &str) -> StageResponse {
    StageResponse::from_error(Some(id), &FlowError::SessionNotFound(id.to_string()))
}

// ===== ROUTES =====

pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let state_filter = warp::any().map(move || state.clone());

    let health = warp::path!("health")
        .and(warp::get())
        .map(|| warp::reply::json(&serde_json::json!({ "status": "ok" })));

    let login = warp::path!("login")
        .and(warp::post())
        .and(warp::body::json())
        .and(state_filter.clone())
        .and_then(handle_login);

    let controls = warp::path!("challenge" / "controls")
        .and(warp::get())
        .and(warp::query::<SessionQuery>())
        .and(state_filter.clone())
        .and_then(handle_controls);

    let tile = warp::path!("challenge" / "tile")
        .and(warp::post())
        .and(warp::body::json())
        .and(state_filter.clone())
        .and_then(handle_tile);

    let code = warp::path!("code")
        .and(warp::post())
        .and(warp::body::json())
        .and(state_filter.clone())
        .and_then(handle_code);

    let phone = warp::path!("phone")
        .and(warp::post())
        .and(warp::body::json())
        .and(state_filter.clone())
        .and_then(handle_phone);

    let status = warp::path!("status")
        .and(warp::get())
        .and(warp::query::<SessionQuery>())
        .and(state_filter.clone())
        .and_then(handle_status);

    let artifact = warp::path!("artifact")
        .and(warp::get())
        .and(warp::query::<SessionQuery>())
        .and(state_filter.clone())
        .and_then(handle_artifact);

    let export = warp::path!("cookies" / "export")
        .and(warp::post())
        .and(warp::body::json())
        .and(state_filter)
        .and_then(handle_export);

    health
        .or(login)
        .or(controls)
        .or(tile)
        .or(code)
        .or(phone)
        .or(status)
        .or(artifact)
        .or(export)
}

// ===== HANDLERS =====

async fn handle_login(
    req: LoginRequest,
    state: Arc<AppState>,
) -> std::result::Result<impl warp::Reply, warp::Rejection> {
    if req.identity.is_empty() {
        let err = FlowError::Validation("identity must not be empty".into());
        return Ok(warp::reply::json(&StageResponse::from_error(None, &err)));
    }

    let session_id = match &req.session_id {
        Some(id) if !id.is_empty() => id.clone(),
        _ => uuid::Uuid::new_v4().to_string(),
    };

    // Cheap duplicate check before a browser is launched; the registry
    // enforces it again atomically on insert.
    if state.registry.get(&session_id).await.is_some() {
        let err = FlowError::Validation(format!("session '{}' already exists", session_id));
        return Ok(warp::reply::json(&StageResponse::from_error(
            Some(&session_id),
            &err,
        )));
    }

    log::info!("login request for session {}", session_id);
    let page = match state.launcher.launch().await {
        Ok(page) => page,
        Err(e) => {
            log::error!("failed to launch browser session: {}", e);
            return Ok(warp::reply::json(&StageResponse::from_error(
                Some(&session_id),
                &e,
            )));
        }
    };

    let flow = LoginFlow::new(
        page,
        state.relay.clone(),
        session_id.clone(),
        state.flow_config.clone(),
    );
    let session = match state.registry.create(Some(session_id.clone()), flow).await {
        Ok(session) => session,
        // Lost the race; dropping the flow tears the page down.
        Err(e) => {
            return Ok(warp::reply::json(&StageResponse::from_error(
                Some(&session_id),
                &e,
            )))
        }
    };

    let mut flow = session.flow.lock().await;
    let reply = match flow.submit_credentials(&req.identity, &req.secret).await {
        Ok(outcome) => StageResponse::from_outcome(&session.id, flow.stage(), outcome),
        Err(e) => {
            log::warn!("session {}: credential submission failed: {}", session.id, e);
            StageResponse::from_error(Some(&session.id), &e)
        }
    };
    Ok(warp::reply::json(&reply))
}

async fn handle_controls(
    query: SessionQuery,
    state: Arc<AppState>,
) -> std::result::Result<impl warp::Reply, warp::Rejection> {
    let session = match state.registry.get(&query.session_id).await {
        Some(session) => session,
        None => return Ok(warp::reply::json(&session_not_found(&query.session_id))),
    };

    let mut flow = session.flow.lock().await;
    let reply = match flow.challenge_controls().await {
        Ok(controls) => ControlsResponse {
            status: if controls.is_empty() {
                "none_found".to_string()
            } else {
                "ok".to_string()
            },
            controls,
        },
        Err(e) => {
            return Ok(warp::reply::json(&StageResponse::from_error(
                Some(&session.id),
                &e,
            )))
        }
    };
    Ok(warp::reply::json(&reply))
}

async fn handle_tile(
    req: TileRequest,
    state: Arc<AppState>,
) -> std::result::Result<impl warp::Reply, warp::Rejection> {
    let session = match state.registry.get(&req.session_id).await {
        Some(session) => session,
        None => return Ok(warp::reply::json(&session_not_found(&req.session_id))),
    };

    let mut flow = session.flow.lock().await;
    let reply = match flow.select_tile(req.tile).await {
        Ok(outcome) => StageResponse::from_outcome(&session.id, flow.stage(), outcome),
        Err(e) => StageResponse::from_error(Some(&session.id), &e),
    };
    Ok(warp::reply::json(&reply))
}

async fn handle_code(
    req: CodeRequest,
    state: Arc<AppState>,
) -> std::result::Result<impl warp::Reply, warp::Rejection> {
    let session = match state.registry.get(&req.session_id).await {
        Some(session) => session,
        None => return Ok(warp::reply::json(&session_not_found(&req.session_id))),
    };

    let mut flow = session.flow.lock().await;
    let reply = match flow.submit_code(&req.code).await {
        Ok(outcome) => StageResponse::from_outcome(&session.id, flow.stage(), outcome),
        Err(e) => StageResponse::from_error(Some(&session.id), &e),
    };
    Ok(warp::reply::json(&reply))
}

async fn handle_phone(
    req: PhoneRequest,
    state: Arc<AppState>,
) -> std::result::Result<impl warp::Reply, warp::Rejection> {
    let session = match state.registry.get(&req.session_id).await {
        Some(session) => session,
        None => return Ok(warp::reply::json(&session_not_found(&req.session_id))),
    };

    let country = req.country_code.as_deref().unwrap_or("");
    let mut flow = session.flow.lock().await;
    let reply = match flow.submit_phone(&req.phone, country).await {
        Ok(outcome) => StageResponse::from_outcome(&session.id, flow.stage(), outcome),
        Err(e) => StageResponse::from_error(Some(&session.id), &e),
    };
    Ok(warp::reply::json(&reply))
}

async fn handle_status(
    query: SessionQuery,
    state: Arc<AppState>,
) -> std::result::Result<impl warp::Reply, warp::Rejection> {
    let session = match state.registry.get(&query.session_id).await {
        Some(session) => session,
        None => {
            // A status poll for an unknown session is not an error, just
            // "not logged in".
            return Ok(warp::reply::json(&StageResponse {
                status: "ok".to_string(),
                session_id: Some(query.session_id.clone()),
                stage: None,
                awaiting: None,
                outcome: None,
                logged_in: Some(false),
                message: Some("not logged in".to_string()),
            }));
        }
    };

    let mut flow = session.flow.lock().await;
    let reply = match flow.status().await {
        Ok(stage) => StageResponse {
            status: "ok".to_string(),
            session_id: Some(session.id.clone()),
            stage: Some(stage),
            awaiting: stage.awaited_input(),
            outcome: None,
            logged_in: Some(stage == Stage::Authenticated),
            message: flow.fail_reason().map(str::to_string),
        },
        Err(e) => StageResponse::from_error(Some(&session.id), &e),
    };
    Ok(warp::reply::json(&reply))
}

async fn handle_artifact(
    query: SessionQuery,
    state: Arc<AppState>,
) -> std::result::Result<impl warp::Reply, warp::Rejection> {
    let available = state.relay.exists(&query.session_id).await;
    Ok(warp::reply::json(&ArtifactResponse {
        status: "ok".to_string(),
        available,
    }))
}

async fn handle_export(
    req: ExportRequest,
    state: Arc<AppState>,
) -> std::result::Result<impl warp::Reply, warp::Rejection> {
    let session = match state.registry.get(&req.session_id).await {
        Some(session) => session,
        None => return Ok(warp::reply::json(&session_not_found(&req.session_id))),
    };

    let flow = session.flow.lock().await;
    if flow.stage() != Stage::Authenticated {
        let err = FlowError::NotApplicable(flow.stage().to_string());
        return Ok(warp::reply::json(&ExportResponse {
            status: error_kind(&err).to_string(),
            path: None,
            exported: None,
            message: Some("session is not authenticated yet".to_string()),
        }));
    }

    let reply = match flow.cookies().await {
        Ok(cookies) => {
            match crate::cookies::write_export(&state.export_dir, &session.id, &cookies).await {
                Ok((path, exported)) => ExportResponse {
                    status: "ok".to_string(),
                    path: Some(path.to_string_lossy().to_string()),
                    exported: Some(exported),
                    message: None,
                },
                Err(e) => ExportResponse {
                    status: error_kind(&e).to_string(),
                    path: None,
                    exported: None,
                    message: Some(e.to_string()),
                },
            }
        }
        Err(e) => ExportResponse {
            status: error_kind(&e).to_string(),
            path: None,
            exported: None,
            message: Some(e.to_string()),
        },
    };
    Ok(warp::reply::json(&reply))
}
